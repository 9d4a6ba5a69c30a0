//! Batched polling and killing of active jobs.
//!
//! Polls ask the platform what actually happened to a job and feed the
//! answer back through the message processor as polled messages, which are
//! always believed. Kills mark the task held first so a configured retry
//! does not fire the moment the kill lands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ProtocolError, RET_CODE_UNREACHABLE};
use crate::event_manager::EventMgr;
use crate::message::{
    MessageOrigin, Severity, MSG_FAILED, MSG_STARTED, MSG_SUBMITTED, MSG_SUBMIT_FAILED,
    MSG_SUCCEEDED, SIGNAL_PREFIX,
};
use crate::platform::PlatformRegistry;
use crate::pool::{CommandCtx, Pending, ProcessPool, CMD_JOBS_KILL, CMD_JOBS_POLL};
use crate::remote::construct_ssh_cmd;
use crate::store::JobStore;
use crate::submission::parse_summary_line;
use crate::task::{TaskJob, TaskJobId, TaskPool, TaskStatus};

/// What a poll found out about one job, as reported by the platform's poll
/// command in a JSON blob.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollContext {
    #[serde(default)]
    pub run_status: Option<i32>,
    #[serde(default)]
    pub run_signal: Option<String>,
    #[serde(default)]
    pub time_submit_exit: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_run_exit: Option<DateTime<Utc>>,
    /// 1 when the job is no longer known to the job runner.
    #[serde(default)]
    pub job_runner_exit_polled: Option<i32>,
    #[serde(default)]
    pub job_id: Option<String>,
    /// Status messages captured from the job's own message log, oldest first.
    #[serde(default)]
    pub messages: Vec<(DateTime<Utc>, String)>,
}

impl PollContext {
    /// Parse the JSON snapshot from a poll result line.
    pub fn parse(blob: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(blob)?)
    }
}

/// Map a poll context to the status messages it implies.
///
/// A job that terminated with nonzero status but is still known to the job
/// runner is only reported as started: some runners restart such jobs, so
/// failure is not declared until the runner has let go of it.
pub fn poll_decision(ctx: &PollContext) -> Vec<(String, Option<DateTime<Utc>>)> {
    let runner_exited = ctx.job_runner_exit_polled == Some(1);
    match ctx.run_status {
        Some(1) if matches!(ctx.run_signal.as_deref(), Some("ERR") | Some("EXIT")) => {
            vec![(MSG_FAILED.to_string(), ctx.time_run_exit)]
        }
        Some(1) if runner_exited => vec![
            (MSG_FAILED.to_string(), ctx.time_run_exit),
            (
                format!("{SIGNAL_PREFIX}{}", ctx.run_signal.as_deref().unwrap_or_default()),
                ctx.time_run_exit,
            ),
        ],
        Some(1) => vec![(MSG_STARTED.to_string(), ctx.time_run)],
        Some(0) => vec![(MSG_SUCCEEDED.to_string(), ctx.time_run_exit)],
        _ => {
            if ctx.time_run.is_some() && runner_exited {
                // Terminated without running the error trap.
                vec![(MSG_FAILED.to_string(), None)]
            } else if ctx.time_run.is_some() {
                vec![(MSG_STARTED.to_string(), ctx.time_run)]
            } else if runner_exited {
                vec![(MSG_SUBMIT_FAILED.to_string(), ctx.time_submit_exit)]
            } else {
                vec![(MSG_SUBMITTED.to_string(), ctx.time_submit_exit)]
            }
        }
    }
}

#[derive(Debug)]
struct Batch {
    platform: String,
    host: String,
    job_ids: Vec<TaskJobId>,
}

pub struct PollKillMgr {
    workflow: String,
    store: Arc<dyn JobStore>,
    pool: Arc<dyn ProcessPool>,
    pending_polls: Pending<Batch>,
    pending_kills: Pending<Batch>,
}

impl PollKillMgr {
    pub fn new(workflow: &str, store: Arc<dyn JobStore>, pool: Arc<dyn ProcessPool>) -> Self {
        Self {
            workflow: workflow.to_string(),
            store,
            pool,
            pending_polls: Pending::new(),
            pending_kills: Pending::new(),
        }
    }

    /// Poll the given jobs, batched per platform. Inactive jobs are skipped.
    pub fn poll_task_jobs(
        &mut self,
        jobs: Vec<&TaskJob>,
        platforms: &PlatformRegistry,
        bad_hosts: &HashSet<String>,
    ) {
        let groups = group_active(jobs);
        for (platform_name, ids) in groups {
            self.dispatch(CMD_JOBS_POLL, &platform_name, ids, platforms, bad_hosts);
        }
    }

    /// Kill the given jobs, batched per platform. Each killed task is marked
    /// held so a lined-up retry does not fire when the kill takes effect.
    pub fn kill_task_jobs(
        &mut self,
        jobs: Vec<&mut TaskJob>,
        platforms: &PlatformRegistry,
        bad_hosts: &HashSet<String>,
    ) {
        let mut groups: HashMap<String, Vec<TaskJobId>> = HashMap::new();
        for job in jobs {
            if !job.status().is_active() {
                debug!(job = %job.identity(), status = %job.status(), "not killable");
                continue;
            }
            job.is_held = true;
            job.kill_failed = false;
            self.store.delta_task_held(&job.job_id(), true);
            let Some(platform) = job.platform.as_ref() else { continue };
            groups.entry(platform.name.clone()).or_default().push(job.job_id());
        }
        for (platform_name, ids) in groups {
            self.dispatch(CMD_JOBS_KILL, &platform_name, ids, platforms, bad_hosts);
        }
    }

    fn dispatch(
        &mut self,
        key: &'static str,
        platform_name: &str,
        job_ids: Vec<TaskJobId>,
        platforms: &PlatformRegistry,
        bad_hosts: &HashSet<String>,
    ) {
        let platform = match platforms.get(platform_name) {
            Ok(platform) => platform,
            Err(err) => {
                warn!(%err, key, "cannot dispatch job command");
                return;
            }
        };
        let host = match platform.select_host(bad_hosts) {
            Ok(host) => host,
            Err(err) => {
                warn!(%err, key, "no host for job command");
                return;
            }
        };
        let mut cmd = vec![key.to_string(), self.workflow.clone()];
        for id in &job_ids {
            cmd.push(id.to_string());
            self.store.log_activity(id, &format!("[{key}] dispatched via {host}"));
        }
        let ctx = if platform.is_remote() {
            let mut ctx = CommandCtx::new(key, construct_ssh_cmd(&cmd, platform, &host));
            ctx.host = Some(host.clone());
            ctx
        } else {
            CommandCtx::new(key, cmd)
        };
        let rx = self.pool.put_command(ctx);
        let batch = Batch { platform: platform.name.clone(), host, job_ids };
        match key {
            CMD_JOBS_POLL => self.pending_polls.push(batch, rx),
            _ => self.pending_kills.push(batch, rx),
        }
    }

    /// Fold resolved poll and kill batches back into job state.
    pub fn process_completions(
        &mut self,
        tasks: &mut TaskPool,
        events: &mut EventMgr,
        platforms: &PlatformRegistry,
        bad_hosts: &mut HashSet<String>,
    ) {
        for (batch, outcome) in self.pending_polls.drain_ready() {
            if outcome.ret_code == RET_CODE_UNREACHABLE {
                self.redispatch(CMD_JOBS_POLL, batch, platforms, bad_hosts);
                continue;
            }
            for line in outcome.out.lines() {
                self.process_poll_line(line, outcome.timestamp, tasks, events);
            }
        }
        for (batch, outcome) in self.pending_kills.drain_ready() {
            if outcome.ret_code == RET_CODE_UNREACHABLE {
                self.redispatch(CMD_JOBS_KILL, batch, platforms, bad_hosts);
                continue;
            }
            let mut results: HashMap<TaskJobId, (DateTime<Utc>, i32)> = HashMap::new();
            for line in outcome.out.lines() {
                if let Some((time, id, ret_code, _)) = parse_summary_line(line) {
                    results.insert(id, (time, ret_code));
                }
            }
            for id in &batch.job_ids {
                let Some(job) = tasks.get_mut(&id.point, &id.name) else { continue };
                if job.submit_num != id.submit_num {
                    continue;
                }
                let (time, ret_code) = results
                    .remove(id)
                    .unwrap_or((outcome.timestamp, outcome.ret_code.max(1)));
                self.store.log_activity(id, &format!("[{CMD_JOBS_KILL} ret_code] {ret_code}"));
                if ret_code != 0 {
                    warn!(job = %id, ret_code, "job kill failed");
                    job.kill_failed = true;
                } else if job.status() == TaskStatus::Submitted {
                    events.process_message(
                        job,
                        Severity::Critical,
                        MSG_SUBMIT_FAILED,
                        MessageOrigin::Polled,
                        Some(time),
                        None,
                    );
                } else if job.status() == TaskStatus::Running {
                    events.process_message(
                        job,
                        Severity::Critical,
                        MSG_FAILED,
                        MessageOrigin::Polled,
                        Some(time),
                        None,
                    );
                }
            }
        }
    }

    fn process_poll_line(
        &self,
        line: &str,
        fallback_time: DateTime<Utc>,
        tasks: &mut TaskPool,
        events: &mut EventMgr,
    ) {
        let mut parts = line.trim().splitn(3, '|');
        let (Some(_timestamp), Some(path), Some(blob)) =
            (parts.next(), parts.next(), parts.next())
        else {
            debug!(err = %ProtocolError::BadLine(line.to_string()), "ignoring poll line");
            return;
        };
        let Some(id) = TaskJobId::parse(path) else {
            debug!(line, "ignoring poll line with bad job path");
            return;
        };
        let ctx = match PollContext::parse(blob) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(job = %id, %err, "poll result unreadable");
                self.store.delta_job_msg(&id, "poll failed");
                return;
            }
        };
        let Some(job) = tasks.get_mut(&id.point, &id.name) else { return };
        if job.submit_num != id.submit_num {
            debug!(job = %id, current = job.submit_num, "discarding poll for superseded attempt");
            return;
        }
        if let Some(runner_id) = ctx.job_id.clone() {
            job.summary.submit_method_id = Some(runner_id);
        }
        for (when, message) in &ctx.messages {
            events.process_message(
                job,
                Severity::Info,
                message,
                MessageOrigin::Polled,
                Some(*when),
                None,
            );
        }
        for (message, time) in poll_decision(&ctx) {
            events.process_message(
                job,
                Severity::Info,
                &message,
                MessageOrigin::Polled,
                Some(time.unwrap_or(fallback_time)),
                None,
            );
        }
        // Schedule the next routine poll from now.
        events.check_poll_time(job, None);
    }

    fn redispatch(
        &mut self,
        key: &'static str,
        batch: Batch,
        platforms: &PlatformRegistry,
        bad_hosts: &mut HashSet<String>,
    ) {
        warn!(host = batch.host, key, "job command host unreachable");
        bad_hosts.insert(batch.host);
        self.dispatch(key, &batch.platform, batch.job_ids, platforms, bad_hosts);
    }
}

fn group_active(jobs: Vec<&TaskJob>) -> HashMap<String, Vec<TaskJobId>> {
    let mut groups: HashMap<String, Vec<TaskJobId>> = HashMap::new();
    for job in jobs {
        if !job.status().is_active() {
            debug!(job = %job.identity(), status = %job.status(), "not pollable");
            continue;
        }
        let Some(platform) = job.platform.as_ref() else { continue };
        groups.entry(platform.name.clone()).or_default().push(job.job_id());
    }
    groups
}
