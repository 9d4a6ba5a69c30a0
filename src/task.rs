//! Task job instances and the pool surface the managers mutate through.
//!
//! A task job instance is identified by (cycle point, task name, submit
//! number). Its status only moves forward along the fixed ordering; anything
//! that looks like a backwards move is handled by the message processor's
//! confirmation-poll policy rather than by direct assignment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action_timer::{ActionTimer, TimerKind};
use crate::platform::Platform;

/// Task job lifecycle states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Waiting,
    Preparing,
    SubmitFailed,
    Submitted,
    Running,
    Failed,
    Succeeded,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Waiting => 0,
            TaskStatus::Preparing => 1,
            TaskStatus::SubmitFailed => 2,
            TaskStatus::Submitted => 3,
            TaskStatus::Running => 4,
            TaskStatus::Failed => 5,
            TaskStatus::Succeeded => 6,
        }
    }

    /// Strictly ahead of `other` in the lifecycle ordering.
    pub fn is_gt(self, other: TaskStatus) -> bool {
        self.rank() > other.rank()
    }

    /// Submitted or running: the job is live on a platform.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Submitted | TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Preparing => "preparing",
            TaskStatus::SubmitFailed => "submit-failed",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Running => "running",
            TaskStatus::Failed => "failed",
            TaskStatus::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunMode {
    #[default]
    Live,
    Simulation,
}

/// Identity of one submission attempt of one task instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskJobId {
    pub point: String,
    pub name: String,
    pub submit_num: u32,
}

impl fmt::Display for TaskJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{:02}", self.point, self.name, self.submit_num)
    }
}

impl TaskJobId {
    /// Parse the `POINT/NAME/NN` path form used in batch result lines.
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.splitn(3, '/');
        let point = parts.next()?.to_string();
        let name = parts.next()?.to_string();
        let submit_num = parts.next()?.parse().ok()?;
        Some(Self { point, name, submit_num })
    }
}

/// Timestamps and job-runner details shown in the UI and fed to handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSummary {
    pub submitted_time: Option<DateTime<Utc>>,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    pub job_runner_name: Option<String>,
    pub submit_method_id: Option<String>,
    pub execution_time_limit: Option<f64>,
    /// Platform used per submit number; may be empty on e.g. host-select
    /// failure before a platform was resolved.
    pub platforms_used: HashMap<u32, String>,
}

/// Per-task configuration the core needs; owned by the (external) workflow
/// config layer and attached to each job.
#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    pub run_mode: RunMode,
    /// Configured platform or platform-group name. May be a `$(...)`
    /// subshell expression resolved at submission time.
    pub platform_name: String,
    pub submission_retry_delays: Option<Vec<f64>>,
    pub execution_retry_delays: Option<Vec<f64>>,
    pub submission_polling_intervals: Option<Vec<f64>>,
    pub execution_polling_intervals: Option<Vec<f64>>,
    pub execution_time_limit: Option<f64>,
    pub submission_timeout: Option<f64>,
    pub execution_timeout: Option<f64>,
    /// Custom event handler command templates.
    pub handlers: Vec<String>,
    /// Events the custom handlers fire for.
    pub handler_events: Vec<String>,
    pub handler_retry_delays: Vec<f64>,
    /// Events that generate mail notifications.
    pub mail_events: Vec<String>,
    /// Registered custom output names.
    pub custom_outputs: Vec<String>,
    /// Task metadata exposed to handler templates.
    pub meta: BTreeMap<String, String>,
    /// Simulated run length, simulation mode only.
    pub simulated_run_length: Option<f64>,
}

/// Context a poll timer was derived for; the schedule is recomputed whenever
/// this changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimerCtx {
    pub submit_num: u32,
    pub status: TaskStatus,
}

/// Named retry-timer slots, one per retry kind.
#[derive(Debug, Clone, Default)]
pub struct TryTimers {
    pub submission_retry: Option<ActionTimer>,
    pub execution_retry: Option<ActionTimer>,
}

impl TryTimers {
    pub fn get(&self, kind: TimerKind) -> Option<&ActionTimer> {
        match kind {
            TimerKind::SubmissionRetry => self.submission_retry.as_ref(),
            TimerKind::ExecutionRetry => self.execution_retry.as_ref(),
        }
    }

    pub fn get_mut(&mut self, kind: TimerKind) -> Option<&mut ActionTimer> {
        match kind {
            TimerKind::SubmissionRetry => self.submission_retry.as_mut(),
            TimerKind::ExecutionRetry => self.execution_retry.as_mut(),
        }
    }

    pub fn set(&mut self, kind: TimerKind, timer: ActionTimer) {
        match kind {
            TimerKind::SubmissionRetry => self.submission_retry = Some(timer),
            TimerKind::ExecutionRetry => self.execution_retry = Some(timer),
        }
    }

    /// Either retry slot has consumed at least one trial, i.e. a retry is
    /// scheduled and not yet resubmitted.
    pub fn retry_lined_up(&self) -> bool {
        self.submission_retry.as_ref().is_some_and(|t| t.num > 0)
            || self.execution_retry.as_ref().is_some_and(|t| t.num > 0)
    }
}

/// One task instance as the execution core sees it.
#[derive(Debug, Clone)]
pub struct TaskJob {
    pub point: String,
    pub name: String,
    pub submit_num: u32,
    status: TaskStatus,
    pub config: TaskConfig,
    /// Resolved lazily at submission time; may change on failover.
    pub platform: Option<Platform>,
    pub try_timers: TryTimers,
    pub poll_timer: Option<(PollTimerCtx, ActionTimer)>,
    /// Absolute submission/execution timeout deadline.
    pub timeout: Option<DateTime<Utc>>,
    /// Wall-clock trigger for a scheduled retry.
    pub retry_scheduled_at: Option<DateTime<Utc>>,
    pub is_held: bool,
    pub is_queued: bool,
    pub is_manual_submit: bool,
    pub job_vacated: bool,
    pub kill_failed: bool,
    pub waiting_on_job_prep: bool,
    pub local_job_file_path: Option<String>,
    pub summary: JobSummary,
    /// Outputs completed so far in this attempt.
    outputs_completed: HashSet<String>,
    /// Occurrence counters for warning/critical/custom events.
    pub non_unique_events: HashMap<String, u32>,
}

impl TaskJob {
    pub fn new(point: &str, name: &str, config: TaskConfig) -> Self {
        Self {
            point: point.to_string(),
            name: name.to_string(),
            submit_num: 0,
            status: TaskStatus::Waiting,
            config,
            platform: None,
            try_timers: TryTimers::default(),
            poll_timer: None,
            timeout: None,
            retry_scheduled_at: None,
            is_held: false,
            is_queued: false,
            is_manual_submit: false,
            job_vacated: false,
            kill_failed: false,
            waiting_on_job_prep: true,
            local_job_file_path: None,
            summary: JobSummary::default(),
            outputs_completed: HashSet::new(),
            non_unique_events: HashMap::new(),
        }
    }

    pub fn identity(&self) -> String {
        format!("{}/{}", self.point, self.name)
    }

    pub fn job_id(&self) -> TaskJobId {
        TaskJobId {
            point: self.point.clone(),
            name: self.name.clone(),
            submit_num: self.submit_num,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Set the status, returning true if it changed.
    pub fn reset_status(&mut self, status: TaskStatus) -> bool {
        if self.status == status {
            return false;
        }
        debug!(
            job = %self.job_id(),
            from = %self.status,
            to = %status,
            "task status change"
        );
        self.status = status;
        true
    }

    /// Try number for the current retry kind, 1-based.
    pub fn try_num(&self) -> usize {
        self.try_timers
            .execution_retry
            .as_ref()
            .map(|t| t.num)
            .unwrap_or(0)
            + 1
    }

    pub fn output_completed(&self, output: &str) -> bool {
        self.outputs_completed.contains(output)
    }

    /// Record an output as satisfied. Returns true if it is a registered
    /// custom output newly completed (the caller then fires its handlers).
    pub fn complete_output(&mut self, output: &str) -> bool {
        let newly = self.outputs_completed.insert(output.to_string());
        newly && self.config.custom_outputs.iter().any(|o| o == output)
    }

    /// Clear per-attempt state before a fresh submission attempt.
    pub fn begin_new_attempt(&mut self) {
        self.outputs_completed.clear();
        self.non_unique_events.clear();
        self.kill_failed = false;
        self.summary.submit_method_id = None;
    }

    pub fn bump_non_unique(&mut self, event: &str) -> u32 {
        let n = self.non_unique_events.entry(event.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

/// Minimal owning surface for task job instances.
///
/// The real task pool lives outside this core; the managers only need to
/// look jobs up and mutate them through `TaskJob` methods, one at a time.
#[derive(Debug, Default)]
pub struct TaskPool {
    jobs: BTreeMap<String, TaskJob>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: TaskJob) {
        self.jobs.insert(job.identity(), job);
    }

    pub fn get(&self, point: &str, name: &str) -> Option<&TaskJob> {
        self.jobs.get(&format!("{point}/{name}"))
    }

    pub fn get_mut(&mut self, point: &str, name: &str) -> Option<&mut TaskJob> {
        self.jobs.get_mut(&format!("{point}/{name}"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskJob> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TaskJob> {
        self.jobs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_matches_lifecycle() {
        assert!(TaskStatus::Preparing.is_gt(TaskStatus::Waiting));
        assert!(TaskStatus::Submitted.is_gt(TaskStatus::Preparing));
        assert!(TaskStatus::Running.is_gt(TaskStatus::Submitted));
        assert!(TaskStatus::Succeeded.is_gt(TaskStatus::Running));
        assert!(TaskStatus::Failed.is_gt(TaskStatus::Running));
        assert!(!TaskStatus::Submitted.is_gt(TaskStatus::Running));
    }

    #[test]
    fn job_id_path_round_trip() {
        let id = TaskJobId {
            point: "20260101T00".to_string(),
            name: "fetch".to_string(),
            submit_num: 3,
        };
        assert_eq!(id.to_string(), "20260101T00/fetch/03");
        assert_eq!(TaskJobId::parse("20260101T00/fetch/03").unwrap(), id);
        assert!(TaskJobId::parse("not-a-path").is_none());
    }

    #[test]
    fn retry_lined_up_requires_consumed_trial() {
        let mut timers = TryTimers::default();
        assert!(!timers.retry_lined_up());
        timers.set(TimerKind::ExecutionRetry, ActionTimer::new(vec![0.0]));
        assert!(!timers.retry_lined_up());
        timers
            .get_mut(TimerKind::ExecutionRetry)
            .unwrap()
            .next(Utc::now(), false);
        assert!(timers.retry_lined_up());
    }

    #[test]
    fn complete_output_reports_custom_outputs_once() {
        let config = TaskConfig {
            custom_outputs: vec!["checkpoint".to_string()],
            ..TaskConfig::default()
        };
        let mut job = TaskJob::new("1", "model", config);
        assert!(job.complete_output("checkpoint"));
        assert!(!job.complete_output("checkpoint"));
        assert!(!job.complete_output("started"));
        assert!(job.output_completed("started"));
    }

    #[test]
    fn new_attempt_clears_attempt_state() {
        let mut job = TaskJob::new("1", "model", TaskConfig::default());
        job.complete_output("started");
        job.bump_non_unique("warning");
        job.kill_failed = true;
        job.begin_new_attempt();
        assert!(!job.output_completed("started"));
        assert!(job.non_unique_events.is_empty());
        assert!(!job.kill_failed);
    }
}
