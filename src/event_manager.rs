//! Task message processing and event handler dispatch.
//!
//! [`EventMgr::process_message`] is the single entry point through which job
//! status changes: wrapper messages, poll results, and internally synthesized
//! messages all pass through the same validation and transition logic.
//! Handler side effects (custom commands, mail, remote log retrieval) are
//! registered as keyed timers and dispatched from [`EventMgr::process_events`]
//! on scheduler ticks; mail and log retrieval sharing a context are coalesced
//! into one outbound command.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::action_timer::ActionTimer;
use crate::config::Config;
use crate::error::RET_CODE_UNREACHABLE;
use crate::events::{
    handler_template_data, render_handler_command, EventKey, HandlerCtx, WorkflowInfo,
    EVENT_EXECUTION_TIMEOUT, EVENT_FAILED, EVENT_RETRY, EVENT_STARTED, EVENT_SUBMISSION_TIMEOUT,
    EVENT_SUBMITTED, EVENT_SUBMIT_FAILED, EVENT_SUBMIT_RETRY, EVENT_SUCCEEDED, HANDLER_CUSTOM,
    HANDLER_JOB_LOGS_RETRIEVE, HANDLER_MAIL,
};
use crate::message::{
    MessageOrigin, Severity, TaskMessage, MSG_FAILED, MSG_STARTED, MSG_SUBMITTED,
    MSG_SUBMIT_FAILED, MSG_SUCCEEDED,
};
use crate::platform::{Platform, PlatformRegistry};
use crate::pool::{
    CommandCtx, CommandOutcome, Pending, ProcessPool, CMD_EVENT_HANDLER, CMD_EVENT_MAIL,
    CMD_JOB_LOGS_RETRIEVE,
};
use crate::remote::split_command;
use crate::store::{row as job_row, JobStore, TaskEventRow};
use crate::task::{PollTimerCtx, RunMode, TaskJob, TaskJobId, TaskStatus};

/// Run-time samples kept per task name for the mean elapsed-time estimate.
const RUN_TIME_SAMPLES: usize = 10;

/// Outcome of processing one status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    Applied,
    Ignored,
    /// A received message implied a state behind the recorded one. The caller
    /// should poll the job to find out what actually happened.
    NeedsPoll,
}

/// What to do when a dispatched handler command resolves.
#[derive(Debug)]
enum HandlerInFlight {
    Custom { key: EventKey },
    Mail { keys: Vec<EventKey> },
    LogsRetrieve { keys: Vec<EventKey>, host: String },
}

pub struct EventMgr {
    workflow: WorkflowInfo,
    config: Config,
    store: Arc<dyn JobStore>,
    pool: Arc<dyn ProcessPool>,
    /// Registered handler actions; keyed registration makes setup idempotent.
    pub event_timers: HashMap<EventKey, (HandlerCtx, ActionTimer)>,
    /// Set whenever the timer map changes, so the owner can checkpoint it.
    pub timers_updated: bool,
    /// Process-wide gate on outbound mail batching.
    next_mail_time: Option<DateTime<Utc>>,
    pending: Pending<HandlerInFlight>,
    run_times: HashMap<String, VecDeque<f64>>,
    spawned: Vec<(TaskJobId, String)>,
}

impl EventMgr {
    pub fn new(
        workflow: WorkflowInfo,
        config: Config,
        store: Arc<dyn JobStore>,
        pool: Arc<dyn ProcessPool>,
    ) -> Self {
        Self {
            workflow,
            config,
            store,
            pool,
            event_timers: HashMap::new(),
            timers_updated: false,
            next_mail_time: None,
            pending: Pending::new(),
            run_times: HashMap::new(),
            spawned: Vec::new(),
        }
    }

    pub fn workflow(&self) -> &WorkflowInfo {
        &self.workflow
    }

    /// Outputs completed since the last call, for spawning dependent work.
    pub fn take_spawned(&mut self) -> Vec<(TaskJobId, String)> {
        std::mem::take(&mut self.spawned)
    }

    /// Mean of the recorded run times for a task name, seconds.
    pub fn mean_elapsed_time(&self, name: &str) -> Option<f64> {
        let samples = self.run_times.get(name)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Validate and apply one job status message.
    ///
    /// `submit_num` is the attempt the message claims to be about; received
    /// messages for a superseded attempt are dropped. `event_time` defaults
    /// to now for messages with no timestamp of their own.
    pub fn process_message(
        &mut self,
        job: &mut TaskJob,
        severity: Severity,
        message: &str,
        origin: MessageOrigin,
        event_time: Option<DateTime<Utc>>,
        submit_num: Option<u32>,
    ) -> ProcessResult {
        let event_time = event_time.unwrap_or_else(Utc::now);
        let submit_num = submit_num.unwrap_or(job.submit_num);
        if !self.accepts_message(job, message, origin, submit_num) {
            return ProcessResult::Ignored;
        }
        match severity {
            Severity::Debug => debug!(job = %job.job_id(), origin = origin.as_str(), "{message}"),
            Severity::Warning => warn!(job = %job.job_id(), origin = origin.as_str(), "{message}"),
            Severity::Critical => {
                error!(job = %job.job_id(), origin = origin.as_str(), "{message}")
            }
            _ => info!(job = %job.job_id(), origin = origin.as_str(), "{message}"),
        }
        let displayed = if origin == MessageOrigin::Polled {
            format!("{message} (polled)")
        } else {
            message.to_string()
        };
        self.store.delta_job_msg(&job.job_id(), &displayed);

        let msg = TaskMessage::parse(message);
        let completed_custom = match &msg {
            TaskMessage::Vacated(_) => false,
            other => job.complete_output(other.output_name()),
        };
        // A message that can only come from a running job implies `started`
        // was missed; synthesize it.
        if !msg.precedes_start() && !job.output_completed(MSG_STARTED) {
            job.complete_output(MSG_STARTED);
            self.setup_event_handlers(job, EVENT_STARTED, "job started");
            self.spawned.push((job.job_id(), MSG_STARTED.to_string()));
        }

        match msg {
            TaskMessage::Started => {
                if origin == MessageOrigin::Received && job.status().is_gt(TaskStatus::Running) {
                    return self.confirm_by_poll(job, message);
                }
                self.on_started(job, event_time);
                self.spawned.push((job.job_id(), MSG_STARTED.to_string()));
            }
            TaskMessage::Succeeded => {
                self.on_succeeded(job, event_time);
                self.spawned.push((job.job_id(), MSG_SUCCEEDED.to_string()));
            }
            TaskMessage::Failed => {
                if origin == MessageOrigin::Received && job.status().is_gt(TaskStatus::Failed) {
                    return self.confirm_by_poll(job, message);
                }
                if self.on_failed(job, event_time, "job failed") {
                    self.spawned.push((job.job_id(), MSG_FAILED.to_string()));
                }
            }
            TaskMessage::SubmitFailed => {
                if origin == MessageOrigin::Received
                    && job.status().is_gt(TaskStatus::SubmitFailed)
                {
                    return self.confirm_by_poll(job, message);
                }
                if self.on_submit_failed(job, event_time) {
                    self.spawned.push((job.job_id(), MSG_SUBMIT_FAILED.to_string()));
                }
            }
            TaskMessage::Submitted => {
                if origin == MessageOrigin::Received && job.status().is_gt(TaskStatus::Submitted) {
                    return self.confirm_by_poll(job, message);
                }
                self.on_submitted(job, event_time);
                self.spawned.push((job.job_id(), MSG_SUBMITTED.to_string()));
            }
            TaskMessage::Signal(ref signal) => {
                if origin == MessageOrigin::Received && job.status().is_gt(TaskStatus::Failed) {
                    return self.confirm_by_poll(job, message);
                }
                self.insert_event(job, event_time, "signaled", signal);
                self.store.update_task_job(
                    &job.job_id(),
                    job_row(vec![("run_signal", json!(signal))]),
                );
                if self.on_failed(job, event_time, message) {
                    self.spawned.push((job.job_id(), MSG_FAILED.to_string()));
                }
            }
            TaskMessage::Abort(ref reason) => {
                if origin == MessageOrigin::Received && job.status().is_gt(TaskStatus::Failed) {
                    return self.confirm_by_poll(job, message);
                }
                self.insert_event(job, event_time, "aborted", message);
                self.store.update_task_job(
                    &job.job_id(),
                    job_row(vec![("run_signal", json!(reason))]),
                );
                if self.on_failed(job, event_time, message) {
                    self.spawned.push((job.job_id(), MSG_FAILED.to_string()));
                }
            }
            TaskMessage::Vacated(_) => {
                self.on_vacated(job, event_time, message);
            }
            TaskMessage::Other(output) if completed_custom => {
                self.store.update_task_outputs(&job.job_id(), vec![output.clone()]);
                self.setup_event_handlers(job, &output, message);
                self.spawned.push((job.job_id(), output));
            }
            TaskMessage::Other(_) => {
                debug!(job = %job.job_id(), origin = origin.as_str(), "unhandled: {message}");
                self.insert_event(
                    job,
                    event_time,
                    &format!("message {}", severity.as_str()),
                    message,
                );
            }
        }
        if severity.is_non_unique() {
            job.bump_non_unique(severity.as_str());
            self.setup_event_handlers(job, severity.as_str(), message);
        }
        ProcessResult::Applied
    }

    fn accepts_message(
        &self,
        job: &TaskJob,
        message: &str,
        origin: MessageOrigin,
        submit_num: u32,
    ) -> bool {
        if origin == MessageOrigin::Received && submit_num != job.submit_num {
            warn!(
                job = %job.identity(),
                submit_num,
                current = job.submit_num,
                "discarding message for superseded attempt: {message}"
            );
            return false;
        }
        if job.status() == TaskStatus::Waiting && job.try_timers.retry_lined_up() {
            warn!(
                job = %job.identity(),
                origin = origin.as_str(),
                "discarding message, retry already lined up: {message}"
            );
            return false;
        }
        true
    }

    fn confirm_by_poll(&self, job: &TaskJob, message: &str) -> ProcessResult {
        info!(
            job = %job.job_id(),
            status = %job.status(),
            "message implies an earlier state, polling to confirm: {message}"
        );
        ProcessResult::NeedsPoll
    }

    fn insert_event(&self, job: &TaskJob, time: DateTime<Utc>, event: &str, message: &str) {
        self.store.insert_task_event(TaskEventRow {
            job: job.job_id(),
            time,
            event: event.to_string(),
            message: message.to_string(),
        });
    }

    fn on_started(&mut self, job: &mut TaskJob, event_time: DateTime<Utc>) {
        if job.job_vacated {
            job.job_vacated = false;
            warn!(job = %job.job_id(), "vacated job restarted");
        }
        let id = job.job_id();
        job.summary.started_time = Some(event_time);
        self.store.delta_job_time(&id, "started", event_time);
        self.store.delta_job_state(&id, TaskStatus::Running);
        self.store.update_task_job(
            &id,
            job_row(vec![("time_run", json!(event_time.to_rfc3339()))]),
        );
        if job.reset_status(TaskStatus::Running) {
            self.setup_event_handlers(job, EVENT_STARTED, "job started");
            self.store.delta_task_state(&id, TaskStatus::Running);
        }
        self.reset_job_timers(job);
        // The submission that led here worked; forget its consumed trials.
        if let Some(timer) = job.try_timers.submission_retry.as_mut() {
            timer.num = 0;
        }
    }

    fn on_succeeded(&mut self, job: &mut TaskJob, event_time: DateTime<Utc>) {
        let id = job.job_id();
        job.summary.finished_time = Some(event_time);
        self.store.delta_job_time(&id, "finished", event_time);
        self.store.delta_job_state(&id, TaskStatus::Succeeded);
        self.store.update_task_job(
            &id,
            job_row(vec![
                ("run_status", json!(0)),
                ("time_run_exit", json!(event_time.to_rfc3339())),
            ]),
        );
        if let Some(started) = job.summary.started_time {
            let elapsed = (event_time - started).num_milliseconds() as f64 / 1000.0;
            let samples = self.run_times.entry(job.name.clone()).or_default();
            if samples.len() >= RUN_TIME_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(elapsed);
        }
        if job.reset_status(TaskStatus::Succeeded) {
            self.setup_event_handlers(job, EVENT_SUCCEEDED, "job succeeded");
            self.store.delta_task_state(&id, TaskStatus::Succeeded);
        }
        self.reset_job_timers(job);
    }

    /// Handle execution failure. Returns true when the failure is definitive
    /// (no retry lined up).
    fn on_failed(&mut self, job: &mut TaskJob, event_time: DateTime<Utc>, message: &str) -> bool {
        let id = job.job_id();
        job.summary.finished_time = Some(event_time);
        self.store.delta_job_time(&id, "finished", event_time);
        self.store.delta_job_state(&id, TaskStatus::Failed);
        self.store.update_task_job(
            &id,
            job_row(vec![
                ("run_status", json!(1)),
                ("time_run_exit", json!(event_time.to_rfc3339())),
            ]),
        );
        let now = Utc::now();
        let deadline = job
            .try_timers
            .execution_retry
            .as_mut()
            .and_then(|timer| timer.next(now, false));
        let no_retries = match deadline {
            Some(deadline) => {
                let delay_str = job
                    .try_timers
                    .execution_retry
                    .as_ref()
                    .map(|t| t.delay_timeout_as_str())
                    .unwrap_or_default();
                warn!(job = %id, "{message}, retrying in {delay_str}");
                self.retry_task(job, deadline);
                self.setup_event_handlers(
                    job,
                    EVENT_RETRY,
                    &format!("{message}, retrying in {delay_str}"),
                );
                false
            }
            None => {
                if job.reset_status(TaskStatus::Failed) {
                    self.setup_event_handlers(job, EVENT_FAILED, message);
                    self.store.delta_task_state(&id, TaskStatus::Failed);
                }
                error!(job = %id, "{message}");
                true
            }
        };
        self.reset_job_timers(job);
        no_retries
    }

    /// Handle submission failure. Returns true when definitive.
    fn on_submit_failed(&mut self, job: &mut TaskJob, event_time: DateTime<Utc>) -> bool {
        let id = job.job_id();
        error!(job = %id, "job submission failed");
        self.store.update_task_job(
            &id,
            job_row(vec![
                ("submit_status", json!(1)),
                ("time_submit_exit", json!(event_time.to_rfc3339())),
            ]),
        );
        job.summary.submit_method_id = None;
        let now = Utc::now();
        let deadline = job
            .try_timers
            .submission_retry
            .as_mut()
            .and_then(|timer| timer.next(now, false));
        let no_retries = match deadline {
            Some(deadline) => {
                let delay_str = job
                    .try_timers
                    .submission_retry
                    .as_ref()
                    .map(|t| t.delay_timeout_as_str())
                    .unwrap_or_default();
                warn!(job = %id, "job submission failed, retrying in {delay_str}");
                self.retry_task(job, deadline);
                self.setup_event_handlers(
                    job,
                    EVENT_SUBMIT_RETRY,
                    &format!("job submission failed, retrying in {delay_str}"),
                );
                false
            }
            None => {
                if job.reset_status(TaskStatus::SubmitFailed) {
                    self.setup_event_handlers(job, EVENT_SUBMIT_FAILED, "job submission failed");
                    self.store.delta_task_state(&id, TaskStatus::SubmitFailed);
                }
                true
            }
        };
        self.store.delta_job_state(&id, TaskStatus::SubmitFailed);
        self.reset_job_timers(job);
        no_retries
    }

    fn on_submitted(&mut self, job: &mut TaskJob, event_time: DateTime<Utc>) {
        let id = job.job_id();
        info!(
            job = %id,
            runner = job.summary.job_runner_name.as_deref().unwrap_or("job runner"),
            runner_id = job.summary.submit_method_id.as_deref().unwrap_or("None"),
            "job submitted"
        );
        self.store.update_task_job(
            &id,
            job_row(vec![
                ("submit_status", json!(0)),
                ("time_submit_exit", json!(event_time.to_rfc3339())),
                ("job_id", json!(job.summary.submit_method_id)),
            ]),
        );
        job.summary.submitted_time = Some(event_time);
        // A resubmitted job has not started or finished yet.
        job.summary.started_time = None;
        job.summary.finished_time = None;
        if job.config.run_mode == RunMode::Simulation {
            // No real wrapper to send `started`; the job is running now.
            job.summary.started_time = Some(event_time);
            job.complete_output(MSG_STARTED);
            if job.reset_status(TaskStatus::Running) {
                self.store.delta_task_state(&id, TaskStatus::Running);
            }
            return;
        }
        self.store.delta_job_time(&id, "submitted", event_time);
        self.store.delta_job_state(&id, TaskStatus::Submitted);
        if job.status() == TaskStatus::Preparing {
            // A poll can deliver `submitted` after the job already started;
            // only move forward from preparing.
            if job.reset_status(TaskStatus::Submitted) {
                self.setup_event_handlers(job, EVENT_SUBMITTED, "job submitted");
                self.store.delta_task_state(&id, TaskStatus::Submitted);
            }
            job.is_queued = false;
            self.reset_job_timers(job);
        }
    }

    fn on_vacated(&mut self, job: &mut TaskJob, event_time: DateTime<Utc>, message: &str) {
        let id = job.job_id();
        self.insert_event(job, event_time, "vacated", message);
        warn!(job = %id, "{message}");
        job.summary.started_time = None;
        if let Some(timer) = job.try_timers.submission_retry.as_mut() {
            timer.num = 0;
        }
        job.job_vacated = true;
        // Believe the vacation without polling; the job is back in the queue
        // and may restart.
        if job.reset_status(TaskStatus::Submitted) {
            job.is_queued = false;
            self.store.delta_task_state(&id, TaskStatus::Submitted);
        }
        self.reset_job_timers(job);
    }

    /// Put the job back to waiting with a wall-clock trigger for the retry.
    fn retry_task(&mut self, job: &mut TaskJob, wallclock: DateTime<Utc>) {
        job.retry_scheduled_at = Some(wallclock);
        if job.reset_status(TaskStatus::Waiting) {
            self.store.delta_task_state(&job.job_id(), TaskStatus::Waiting);
        }
    }

    /// Register handler actions for one event occurrence. Registration is
    /// idempotent per composite key, so replayed transitions are harmless.
    pub fn setup_event_handlers(&mut self, job: &TaskJob, event: &str, message: &str) {
        if job.config.run_mode != RunMode::Live {
            return;
        }
        let db_message = if message == format!("job {event}") { "" } else { message };
        self.insert_event(job, Utc::now(), event, db_message);
        self.setup_job_logs_retrieval(job, event);
        self.setup_event_mail(job, event);
        self.setup_custom_handlers(job, event, message);
    }

    fn setup_job_logs_retrieval(&mut self, job: &TaskJob, event: &str) {
        if !matches!(event, EVENT_FAILED | EVENT_RETRY | EVENT_SUCCEEDED) {
            return;
        }
        let Some(platform) = job.platform.as_ref() else { return };
        if !platform.is_remote() || !platform.retrieve_job_logs {
            return;
        }
        let key = EventKey {
            handler: HANDLER_JOB_LOGS_RETRIEVE.to_string(),
            event: event.to_string(),
            point: job.point.clone(),
            name: job.name.clone(),
            submit_num: job.submit_num,
        };
        if self.event_timers.contains_key(&key) {
            return;
        }
        let ctx = HandlerCtx::JobLogsRetrieve {
            platform: platform.name.clone(),
            max_size: platform.retrieve_job_logs_max_size.clone(),
        };
        let timer = ActionTimer::new(platform.retrieve_job_logs_retry_delays.clone());
        self.add_event_timer(key, ctx, timer);
    }

    fn setup_event_mail(&mut self, job: &TaskJob, event: &str) {
        let key = EventKey {
            handler: HANDLER_MAIL.to_string(),
            event: occurrence_event(job, event),
            point: job.point.clone(),
            name: job.name.clone(),
            submit_num: job.submit_num,
        };
        if self.event_timers.contains_key(&key) {
            return;
        }
        if !job.config.mail_events.iter().any(|e| e == event) {
            return;
        }
        let ctx = HandlerCtx::Mail {
            from: self.config.mail_from.clone(),
            to: self.config.mail_to.clone(),
        };
        self.add_event_timer(key, ctx, ActionTimer::new(Vec::new()));
    }

    fn setup_custom_handlers(&mut self, job: &TaskJob, event: &str, message: &str) {
        if !job.config.handler_events.iter().any(|e| e == event) {
            return;
        }
        let retry_delays = if job.config.handler_retry_delays.is_empty() {
            self.config.handler_retry_delays.clone()
        } else {
            job.config.handler_retry_delays.clone()
        };
        let occurrence = occurrence_event(job, event);
        let data = handler_template_data(&self.workflow, job, event, message);
        for (i, template) in job.config.handlers.iter().enumerate() {
            let key = EventKey {
                handler: format!("{HANDLER_CUSTOM}-{i:02}"),
                event: occurrence.clone(),
                point: job.point.clone(),
                name: job.name.clone(),
                submit_num: job.submit_num,
            };
            if self.event_timers.contains_key(&key) {
                continue;
            }
            let cmd = match render_handler_command(
                template,
                &data,
                &self.workflow.name,
                &job.identity(),
                event,
                message,
            ) {
                Ok(cmd) => cmd,
                Err(bad) => {
                    error!(job = %job.job_id(), template, "bad handler template variable: {bad}");
                    continue;
                }
            };
            debug!(key = %key, "queueing handler: {cmd}");
            self.add_event_timer(key, HandlerCtx::Custom { cmd }, ActionTimer::new(retry_delays.clone()));
        }
    }

    fn add_event_timer(&mut self, key: EventKey, ctx: HandlerCtx, timer: ActionTimer) {
        debug!(key = %key, "adding event timer");
        self.event_timers.insert(key, (ctx, timer));
        self.timers_updated = true;
    }

    fn remove_event_timer(&mut self, key: &EventKey) {
        debug!(key = %key, "removing event timer");
        self.event_timers.remove(key);
        self.timers_updated = true;
    }

    fn unset_waiting_event_timer(&mut self, key: &EventKey) {
        if let Some((_, timer)) = self.event_timers.get_mut(key) {
            timer.unset_waiting();
        }
    }

    /// One dispatch tick: fold in resolved handler commands, then run every
    /// timer whose delay is up. Mail timers additionally wait for the
    /// process-wide mail window so notifications batch into digests.
    pub fn process_events(
        &mut self,
        now: DateTime<Utc>,
        platforms: &PlatformRegistry,
        bad_hosts: &mut HashSet<String>,
    ) {
        self.process_handler_completions(bad_hosts);
        let next_mail_time = self.next_mail_time;
        let mut exhausted: Vec<EventKey> = Vec::new();
        let mut custom: Vec<(EventKey, String)> = Vec::new();
        let mut coalesced: HashMap<HandlerCtx, Vec<EventKey>> = HashMap::new();
        for (key, (ctx, timer)) in &mut self.event_timers {
            if timer.is_waiting {
                continue;
            }
            if !timer.is_timeout_set() {
                if timer.next(now, false).is_none() {
                    warn!(key = %key, "handler retries exhausted");
                    exhausted.push(key.clone());
                    continue;
                }
                if timer.num > 1 {
                    debug!(key = %key, "handler failed, retrying in {}", timer.delay_timeout_as_str());
                }
            }
            if !timer.is_delay_done(now) {
                continue;
            }
            if matches!(ctx, HandlerCtx::Mail { .. }) && next_mail_time.is_some_and(|t| t > now) {
                continue;
            }
            timer.set_waiting();
            match ctx {
                HandlerCtx::Custom { cmd } => custom.push((key.clone(), cmd.clone())),
                other => coalesced.entry(other.clone()).or_default().push(key.clone()),
            }
        }
        for key in exhausted {
            self.remove_event_timer(&key);
        }
        for (key, cmd) in custom {
            let rx = self.pool.put_command(CommandCtx::shell_command(CMD_EVENT_HANDLER, cmd));
            self.pending.push(HandlerInFlight::Custom { key }, rx);
        }
        for (ctx, mut keys) in coalesced {
            keys.sort();
            match ctx {
                HandlerCtx::Mail { from, to } => {
                    self.next_mail_time = Some(now + secs_duration(self.config.mail_interval_secs));
                    self.send_event_mail(&from, &to, keys);
                }
                HandlerCtx::JobLogsRetrieve { platform, max_size } => {
                    self.retrieve_job_logs(&platform, max_size.as_deref(), keys, platforms, bad_hosts);
                }
                HandlerCtx::Custom { .. } => {}
            }
        }
    }

    /// Fold resolved handler commands back into the timer map: success
    /// retires the timer; an unreachable log-retrieval host is recorded bad
    /// and the timer reset for a transparent retry; any other failure just
    /// clears the in-flight mark so the retry delays take over.
    pub fn process_handler_completions(&mut self, bad_hosts: &mut HashSet<String>) {
        for (in_flight, outcome) in self.pending.drain_ready() {
            match in_flight {
                HandlerInFlight::Custom { key } => {
                    self.log_handler_outcome(&key, &outcome);
                    if outcome.ret_code == 0 {
                        self.remove_event_timer(&key);
                    } else {
                        self.unset_waiting_event_timer(&key);
                    }
                }
                HandlerInFlight::Mail { keys } => {
                    for key in &keys {
                        self.log_handler_outcome(key, &outcome);
                    }
                    for key in &keys {
                        if outcome.ret_code == 0 {
                            self.remove_event_timer(key);
                        } else {
                            self.unset_waiting_event_timer(key);
                        }
                    }
                }
                HandlerInFlight::LogsRetrieve { keys, host } => {
                    if outcome.ret_code == RET_CODE_UNREACHABLE {
                        warn!(host, "log retrieval host unreachable");
                        bad_hosts.insert(host);
                        for key in &keys {
                            if let Some((_, timer)) = self.event_timers.get_mut(key) {
                                timer.reset();
                            }
                        }
                        continue;
                    }
                    for key in &keys {
                        self.log_handler_outcome(key, &outcome);
                        if outcome.ret_code == 0 {
                            self.remove_event_timer(key);
                        } else {
                            self.unset_waiting_event_timer(key);
                        }
                    }
                }
            }
        }
    }

    fn log_handler_outcome(&self, key: &EventKey, outcome: &CommandOutcome) {
        let job = TaskJobId {
            point: key.point.clone(),
            name: key.name.clone(),
            submit_num: key.submit_num,
        };
        self.store.log_activity(
            &job,
            &format!("[({}:{}) ret_code] {}", key.handler, key.event, outcome.ret_code),
        );
        if outcome.ret_code == 0 {
            info!(key = %key, "handler succeeded");
        } else {
            warn!(
                key = %key,
                ret_code = outcome.ret_code,
                err = %outcome.err.trim(),
                "handler failed"
            );
        }
    }

    fn send_event_mail(&mut self, from: &str, to: &str, keys: Vec<EventKey>) {
        let subject = if keys.len() == 1 {
            format!("[{}] {}", keys[0], self.workflow.name)
        } else {
            format!("[{} task events] {}", keys.len(), self.workflow.name)
        };
        let mut stdin = String::new();
        for key in &keys {
            stdin.push_str(&format!(
                "{}: {}/{}/{:02}\n",
                key.event, key.point, key.name, key.submit_num
            ));
        }
        stdin.push_str(&format!(
            "\nworkflow: {}\nhost: {}\nowner: {}\n",
            self.workflow.name, self.workflow.host, self.workflow.owner
        ));
        if let Some(port) = self.workflow.port {
            stdin.push_str(&format!("port: {port}\n"));
        }
        if let Some(footer) = self.render_mail_footer() {
            stdin.push_str(&footer);
            stdin.push('\n');
        }
        let mut ctx = CommandCtx::new(
            CMD_EVENT_MAIL,
            vec![
                "mail".to_string(),
                "-s".to_string(),
                subject,
                "-r".to_string(),
                from.to_string(),
                to.to_string(),
            ],
        );
        ctx.stdin = Some(stdin);
        if let Some(smtp) = &self.config.mail_smtp {
            ctx.env.push(("smtp".to_string(), smtp.clone()));
        }
        let rx = self.pool.put_command(ctx);
        self.pending.push(HandlerInFlight::Mail { keys }, rx);
    }

    fn render_mail_footer(&self) -> Option<String> {
        let template = self.config.mail_footer.as_ref()?;
        let mut footer = template.clone();
        for (key, value) in [
            ("host", self.workflow.host.clone()),
            ("port", self.workflow.port.map(|p| p.to_string()).unwrap_or_default()),
            ("owner", self.workflow.owner.clone()),
            ("workflow", self.workflow.name.clone()),
        ] {
            footer = footer.replace(&format!("%({key})s"), &value);
        }
        if footer.contains("%(") {
            warn!(template, "bad mail footer template");
            return None;
        }
        Some(footer)
    }

    fn retrieve_job_logs(
        &mut self,
        platform_name: &str,
        max_size: Option<&str>,
        keys: Vec<EventKey>,
        platforms: &PlatformRegistry,
        bad_hosts: &mut HashSet<String>,
    ) {
        let platform = match platforms.get(platform_name) {
            Ok(platform) => platform,
            Err(err) => {
                warn!(%err, "cannot retrieve job logs");
                for key in &keys {
                    self.unset_waiting_event_timer(key);
                }
                return;
            }
        };
        let host = match platform.select_host(bad_hosts) {
            Ok(host) => host,
            Err(err) => {
                warn!(%err, "no host available for log retrieval");
                for key in &keys {
                    self.unset_waiting_event_timer(key);
                }
                return;
            }
        };
        let mut cmd = split_command(&platform.retrieve_logs_command);
        cmd.push(format!("--rsh={}", platform.ssh_command));
        if let Some(size) = max_size {
            cmd.push(format!("--max-size={size}"));
        }
        // Fetch only the job log directories for the attempts in this batch.
        let mut includes = BTreeSet::new();
        for key in &keys {
            includes.insert(format!("/{}", key.point));
            includes.insert(format!("/{}/{}", key.point, key.name));
            includes.insert(format!("/{}/{}/{:02}", key.point, key.name, key.submit_num));
            includes.insert(format!("/{}/{}/{:02}/**", key.point, key.name, key.submit_num));
        }
        for include in &includes {
            cmd.push(format!("--include={include}"));
        }
        cmd.push("--exclude=/**".to_string());
        let log_dir = format!("{}/{}/log/job/", self.config.run_dir, self.workflow.name);
        cmd.push(format!("{host}:{log_dir}"));
        cmd.push(log_dir);
        let mut ctx = CommandCtx::new(CMD_JOB_LOGS_RETRIEVE, cmd);
        ctx.host = Some(host.clone());
        let rx = self.pool.put_command(ctx);
        self.pending.push(HandlerInFlight::LogsRetrieve { keys, host }, rx);
    }

    /// Recompute the poll schedule and timeout deadline for an active job.
    ///
    /// With an execution time limit, polls past the limit are dropped, the
    /// remaining window up to the limit is filled by repeating the last
    /// interval, and the platform's post-limit intervals are appended; the
    /// timeout deadline becomes limit plus the sum of those intervals.
    pub fn reset_job_timers(&mut self, job: &mut TaskJob) {
        if !job.status().is_active() {
            job.timeout = None;
            job.poll_timer = None;
            return;
        }
        let platform = job.platform.clone().unwrap_or_else(Platform::localhost);
        let running = job.status() == TaskStatus::Running;
        let (timeref, timeout_key) = if running {
            (job.summary.started_time, EVENT_EXECUTION_TIMEOUT)
        } else {
            (job.summary.submitted_time, EVENT_SUBMISSION_TIMEOUT)
        };
        let mut timeout = if running {
            job.config.execution_timeout
        } else {
            job.config.submission_timeout
        };
        let mut delays = if running {
            job.config
                .execution_polling_intervals
                .clone()
                .unwrap_or_else(|| platform.execution_polling_intervals.clone())
        } else {
            job.config
                .submission_polling_intervals
                .clone()
                .unwrap_or_else(|| platform.submission_polling_intervals.clone())
        };
        if delays.is_empty() {
            delays.push(self.config.polling_interval_secs);
        }
        if running {
            if let Some(time_limit) = job.summary.execution_time_limit {
                let mut limit_delays = platform.time_limit_polling_intervals.clone();
                if limit_delays.is_empty() {
                    limit_delays.push(self.config.polling_interval_secs);
                }
                timeout = Some(time_limit + limit_delays.iter().sum::<f64>());
                // Drop polls that would land past the limit, then fill the
                // window up to it by repeating the last interval.
                while delays.iter().sum::<f64>() > time_limit {
                    delays.pop();
                }
                if let Some(&last) = delays.last() {
                    if last > 0.0 {
                        let size = ((time_limit - delays.iter().sum::<f64>()) / last) as usize;
                        delays.extend(std::iter::repeat(last).take(size));
                    }
                }
                limit_delays[0] += time_limit - delays.iter().sum::<f64>();
                delays.extend(limit_delays);
            }
        }
        let timeout_str = match (timeref, timeout) {
            (Some(timeref), Some(secs)) => {
                job.timeout = Some(timeref + secs_duration(secs));
                format!("PT{}S", secs as i64)
            }
            _ => {
                job.timeout = None;
                "None".to_string()
            }
        };
        let ctx = PollTimerCtx {
            submit_num: job.submit_num,
            status: job.status(),
        };
        let mut timer = ActionTimer::new(delays.clone());
        timer.next(Utc::now(), true);
        job.poll_timer = Some((ctx, timer));
        info!(
            job = %job.job_id(),
            "health: {timeout_key}={timeout_str}, polling intervals={}",
            group_delays(&delays)
        );
    }

    /// Advance the poll timer if its delay is done (or unconditionally when
    /// `now` is `None`, after a completed poll). Returns true when the job
    /// should be polled now. A stale timer, left over from a previous attempt
    /// or status, is discarded.
    pub fn check_poll_time(&self, job: &mut TaskJob, now: Option<DateTime<Utc>>) -> bool {
        if !job.status().is_active() {
            job.timeout = None;
            job.poll_timer = None;
            return false;
        }
        let ctx = PollTimerCtx {
            submit_num: job.submit_num,
            status: job.status(),
        };
        match job.poll_timer.as_mut() {
            Some((timer_ctx, timer)) if *timer_ctx == ctx => {
                if let Some(now) = now {
                    if !timer.is_delay_done(now) {
                        return false;
                    }
                    timer.next(now, true);
                } else {
                    timer.next(Utc::now(), true);
                }
                true
            }
            Some(_) => {
                job.timeout = None;
                job.poll_timer = None;
                false
            }
            None => false,
        }
    }

    /// Check the poll schedule and the timeout deadline for one job. Returns
    /// true when the job should be polled now. The timeout event fires at
    /// most once per deadline.
    pub fn check_job_time(&mut self, job: &mut TaskJob, now: DateTime<Utc>) -> bool {
        let can_poll = self.check_poll_time(job, Some(now));
        let Some(timeout) = job.timeout else {
            return can_poll;
        };
        if now <= timeout {
            return can_poll;
        }
        let (event, timeref) = if job.status() == TaskStatus::Running {
            (EVENT_EXECUTION_TIMEOUT, job.summary.started_time)
        } else {
            (EVENT_SUBMISSION_TIMEOUT, job.summary.submitted_time)
        };
        let msg = match timeref {
            Some(timeref) => {
                format!("{event} after PT{}S", (timeout - timeref).num_seconds())
            }
            None => event.to_string(),
        };
        warn!(job = %job.job_id(), "{msg}");
        self.setup_event_handlers(job, event, &msg);
        // Fire the timeout event only once.
        job.timeout = None;
        true
    }
}

/// Occurrence-suffixed event name for non-unique events past the first.
fn occurrence_event(job: &TaskJob, event: &str) -> String {
    match job.non_unique_events.get(event) {
        Some(n) if *n > 1 => format!("{event}-{n}"),
        _ => event.to_string(),
    }
}

fn secs_duration(secs: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((secs * 1000.0) as i64)
}

/// Group consecutive identical delays, `3*PT60S,PT120S,...` style.
fn group_delays(delays: &[f64]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = delays.iter().peekable();
    while let Some(&delay) = iter.next() {
        let mut count = 1;
        while iter.peek().is_some_and(|&&d| d == delay) {
            iter.next();
            count += 1;
        }
        if count > 1 {
            parts.push(format!("{count}*PT{}S", delay as i64));
        } else {
            parts.push(format!("PT{}S", delay as i64));
        }
    }
    parts.push("...".to_string());
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_timer::TimerKind;
    use crate::pool::ScriptedPool;
    use crate::store::MemoryStore;
    use crate::task::TaskConfig;

    fn outcome(ret_code: i32) -> CommandOutcome {
        CommandOutcome {
            ret_code,
            out: String::new(),
            err: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn mgr() -> (EventMgr, Arc<ScriptedPool>, Arc<MemoryStore>) {
        let pool = Arc::new(ScriptedPool::new());
        let store = Arc::new(MemoryStore::new());
        let workflow = WorkflowInfo {
            name: "demo".to_string(),
            host: "sched-host".to_string(),
            owner: "alice".to_string(),
            ..WorkflowInfo::default()
        };
        let mgr = EventMgr::new(
            workflow,
            Config::default(),
            store.clone() as Arc<dyn JobStore>,
            pool.clone() as Arc<dyn ProcessPool>,
        );
        (mgr, pool, store)
    }

    fn submitted_job(name: &str) -> TaskJob {
        let mut job = TaskJob::new("1", name, TaskConfig::default());
        job.submit_num = 1;
        job.platform = Some(Platform::localhost());
        job.reset_status(TaskStatus::Submitted);
        job.summary.submitted_time = Some(Utc::now());
        job
    }

    #[test]
    fn started_message_moves_job_to_running() {
        let (mut mgr, _pool, store) = mgr();
        let mut job = submitted_job("fetch");
        let result = mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_STARTED,
            MessageOrigin::Received,
            None,
            None,
        );
        assert_eq!(result, ProcessResult::Applied);
        assert_eq!(job.status(), TaskStatus::Running);
        assert!(job.summary.started_time.is_some());
        assert_eq!(store.events_named("started").len(), 1);
        assert!(job.poll_timer.is_some());
    }

    #[test]
    fn resubmission_clears_previous_run_times() {
        let (mut mgr, _pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        // Second attempt: the first one ran and failed.
        job.reset_status(TaskStatus::Preparing);
        job.summary.started_time = Some(Utc::now());
        job.summary.finished_time = Some(Utc::now());
        let result = mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_SUBMITTED,
            MessageOrigin::Internal,
            None,
            None,
        );
        assert_eq!(result, ProcessResult::Applied);
        assert_eq!(job.status(), TaskStatus::Submitted);
        assert!(job.summary.submitted_time.is_some());
        assert!(job.summary.started_time.is_none());
        assert!(job.summary.finished_time.is_none());
    }

    #[test]
    fn stale_submit_number_is_ignored() {
        let (mut mgr, _pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        job.submit_num = 2;
        let result = mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_STARTED,
            MessageOrigin::Received,
            None,
            Some(1),
        );
        assert_eq!(result, ProcessResult::Ignored);
        assert_eq!(job.status(), TaskStatus::Submitted);
    }

    #[test]
    fn backwards_received_message_requests_confirmation_poll() {
        let (mut mgr, _pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        job.reset_status(TaskStatus::Running);
        let result = mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_SUBMITTED,
            MessageOrigin::Received,
            None,
            None,
        );
        assert_eq!(result, ProcessResult::NeedsPoll);
        assert_eq!(job.status(), TaskStatus::Running);
    }

    #[test]
    fn polled_backwards_message_is_believed() {
        let (mut mgr, _pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        job.reset_status(TaskStatus::Running);
        job.summary.started_time = Some(Utc::now());
        let result = mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_FAILED,
            MessageOrigin::Polled,
            None,
            None,
        );
        assert_eq!(result, ProcessResult::Applied);
        assert_eq!(job.status(), TaskStatus::Failed);
    }

    #[test]
    fn failure_with_retry_lined_up_resets_to_waiting() {
        let (mut mgr, _pool, store) = mgr();
        let mut job = submitted_job("fetch");
        job.reset_status(TaskStatus::Running);
        job.try_timers.set(TimerKind::ExecutionRetry, ActionTimer::new(vec![30.0]));
        let result = mgr.process_message(
            &mut job,
            Severity::Critical,
            MSG_FAILED,
            MessageOrigin::Polled,
            None,
            None,
        );
        assert_eq!(result, ProcessResult::Applied);
        assert_eq!(job.status(), TaskStatus::Waiting);
        assert!(job.retry_scheduled_at.is_some());
        assert_eq!(store.events_named("retry").len(), 1);
        assert!(store.events_named("failed").is_empty());
    }

    #[test]
    fn retry_exhaustion_makes_failure_definitive() {
        let (mut mgr, _pool, store) = mgr();
        let mut job = submitted_job("fetch");
        job.reset_status(TaskStatus::Running);
        job.try_timers.set(TimerKind::ExecutionRetry, ActionTimer::new(vec![0.0]));
        mgr.process_message(
            &mut job,
            Severity::Critical,
            MSG_FAILED,
            MessageOrigin::Polled,
            None,
            None,
        );
        assert_eq!(job.status(), TaskStatus::Waiting);
        // Resubmitted and running again; the single trial is spent.
        job.reset_status(TaskStatus::Running);
        mgr.process_message(
            &mut job,
            Severity::Critical,
            MSG_FAILED,
            MessageOrigin::Polled,
            None,
            None,
        );
        assert_eq!(job.status(), TaskStatus::Failed);
        assert_eq!(store.events_named("failed").len(), 1);
    }

    #[test]
    fn message_while_retry_lined_up_is_discarded() {
        let (mut mgr, _pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        job.try_timers.set(TimerKind::ExecutionRetry, ActionTimer::new(vec![30.0]));
        job.try_timers
            .get_mut(TimerKind::ExecutionRetry)
            .unwrap()
            .next(Utc::now(), false);
        job.reset_status(TaskStatus::Waiting);
        let result = mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_STARTED,
            MessageOrigin::Received,
            None,
            None,
        );
        assert_eq!(result, ProcessResult::Ignored);
        assert_eq!(job.status(), TaskStatus::Waiting);
    }

    #[test]
    fn missing_started_is_inferred_from_succeeded() {
        let (mut mgr, _pool, store) = mgr();
        let mut job = submitted_job("fetch");
        mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_SUCCEEDED,
            MessageOrigin::Polled,
            None,
            None,
        );
        assert_eq!(job.status(), TaskStatus::Succeeded);
        assert!(job.output_completed(MSG_STARTED));
        assert_eq!(store.events_named("started").len(), 1);
        assert_eq!(store.events_named("succeeded").len(), 1);
    }

    #[test]
    fn handler_registration_is_idempotent() {
        let (mut mgr, _pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        job.config.handlers = vec!["notify.sh".to_string()];
        job.config.handler_events = vec![EVENT_FAILED.to_string()];
        mgr.setup_event_handlers(&job, EVENT_FAILED, "job failed");
        mgr.setup_event_handlers(&job, EVENT_FAILED, "job failed");
        assert_eq!(mgr.event_timers.len(), 1);
    }

    #[test]
    fn custom_handler_failure_retries_then_exhausts() {
        let (mut mgr, pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        job.config.handlers = vec!["notify.sh".to_string()];
        job.config.handler_events = vec![EVENT_FAILED.to_string()];
        mgr.setup_event_handlers(&job, EVENT_FAILED, "job failed");

        let platforms = PlatformRegistry::new();
        let mut bad = HashSet::new();
        let now = Utc::now();
        mgr.process_events(now, &platforms, &mut bad);
        assert_eq!(pool.queued_len(), 1);
        pool.resolve_next(outcome(1));
        // Failure clears the in-flight mark; the single retry delay is spent,
        // so the next tick retires the timer.
        mgr.process_events(now + ChronoDuration::seconds(1), &platforms, &mut bad);
        assert!(mgr.event_timers.is_empty());
        assert_eq!(pool.queued_len(), 0);
    }

    #[test]
    fn mail_for_two_jobs_coalesces_into_one_digest() {
        let (mut mgr, pool, _store) = mgr();
        let mut job_a = submitted_job("fetch");
        let mut job_b = submitted_job("store");
        for job in [&mut job_a, &mut job_b] {
            job.config.mail_events = vec![EVENT_FAILED.to_string()];
        }
        mgr.setup_event_handlers(&job_a, EVENT_FAILED, "job failed");
        mgr.setup_event_handlers(&job_b, EVENT_FAILED, "job failed");
        assert_eq!(mgr.event_timers.len(), 2);

        let platforms = PlatformRegistry::new();
        let mut bad = HashSet::new();
        mgr.process_events(Utc::now(), &platforms, &mut bad);
        assert_eq!(pool.queued_len(), 1);
        let ctx = pool.resolve_next(outcome(0)).unwrap();
        assert_eq!(ctx.key, CMD_EVENT_MAIL);
        let stdin = ctx.stdin.unwrap();
        assert!(stdin.contains("failed: 1/fetch/01"));
        assert!(stdin.contains("failed: 1/store/01"));
        mgr.process_handler_completions(&mut bad);
        assert!(mgr.event_timers.is_empty());
    }

    #[test]
    fn log_retrieval_unreachable_host_is_retried_transparently() {
        let (mut mgr, pool, _store) = mgr();
        let mut platform = Platform::remote("hpc", &["h1", "h2"]);
        platform.retrieve_job_logs = true;
        let mut platforms = PlatformRegistry::new();
        platforms.insert(platform.clone());

        let mut job = submitted_job("fetch");
        job.platform = Some(platform);
        mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_SUCCEEDED,
            MessageOrigin::Polled,
            None,
            None,
        );
        assert!(mgr
            .event_timers
            .keys()
            .any(|key| key.handler == HANDLER_JOB_LOGS_RETRIEVE));

        let mut bad = HashSet::new();
        mgr.process_events(Utc::now(), &platforms, &mut bad);
        let ctx = pool.resolve_next(outcome(RET_CODE_UNREACHABLE)).unwrap();
        assert_eq!(ctx.host.as_deref(), Some("h1"));
        mgr.process_handler_completions(&mut bad);
        assert!(bad.contains("h1"));

        // The reset timer redispatches against the next host.
        mgr.process_events(Utc::now(), &platforms, &mut bad);
        let ctx = pool.resolve_next(outcome(0)).unwrap();
        assert_eq!(ctx.host.as_deref(), Some("h2"));
    }

    #[test]
    fn time_limit_reshapes_poll_schedule_and_timeout() {
        let (mut mgr, _pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        job.config.execution_polling_intervals = Some(vec![60.0]);
        job.summary.execution_time_limit = Some(600.0);
        let started = Utc::now();
        job.summary.started_time = Some(started);
        job.reset_status(TaskStatus::Running);
        mgr.reset_job_timers(&mut job);

        // Window filled with 10 x 60s up to the limit, then 60/120/420.
        let (_, timer) = job.poll_timer.as_ref().unwrap();
        assert_eq!(timer.delays().len(), 13);
        assert_eq!(timer.delays()[..10], [60.0; 10]);
        assert_eq!(timer.delays()[10..], [60.0, 120.0, 420.0]);
        assert_eq!(job.timeout.unwrap(), started + ChronoDuration::seconds(1200));
    }

    #[test]
    fn execution_timeout_event_fires_once() {
        let (mut mgr, _pool, store) = mgr();
        let mut job = submitted_job("fetch");
        job.config.execution_timeout = Some(10.0);
        let started = Utc::now() - ChronoDuration::seconds(60);
        job.summary.started_time = Some(started);
        job.reset_status(TaskStatus::Running);
        mgr.reset_job_timers(&mut job);
        assert!(job.timeout.is_some());

        let now = Utc::now();
        assert!(mgr.check_job_time(&mut job, now));
        assert!(job.timeout.is_none());
        mgr.check_job_time(&mut job, now);
        assert_eq!(store.events_named(EVENT_EXECUTION_TIMEOUT).len(), 1);
    }

    #[test]
    fn non_unique_events_get_occurrence_numbered_keys() {
        let (mut mgr, _pool, _store) = mgr();
        let mut job = submitted_job("fetch");
        job.reset_status(TaskStatus::Running);
        job.summary.started_time = Some(Utc::now());
        job.config.mail_events = vec!["warning".to_string()];
        mgr.process_message(
            &mut job,
            Severity::Warning,
            "disk nearly full",
            MessageOrigin::Received,
            None,
            None,
        );
        mgr.process_message(
            &mut job,
            Severity::Warning,
            "disk nearly full again",
            MessageOrigin::Received,
            None,
            None,
        );
        let events: Vec<&str> = mgr
            .event_timers
            .keys()
            .filter(|key| key.handler == HANDLER_MAIL)
            .map(|key| key.event.as_str())
            .collect();
        assert_eq!(events.len(), 2);
        assert!(events.contains(&"warning"));
        assert!(events.contains(&"warning-2"));
    }

    #[test]
    fn custom_output_message_completes_and_spawns() {
        let (mut mgr, _pool, store) = mgr();
        let mut job = submitted_job("fetch");
        job.reset_status(TaskStatus::Running);
        job.summary.started_time = Some(Utc::now());
        job.config.custom_outputs = vec!["checkpoint".to_string()];
        mgr.process_message(
            &mut job,
            Severity::Info,
            "checkpoint",
            MessageOrigin::Received,
            None,
            None,
        );
        assert!(job.output_completed("checkpoint"));
        assert_eq!(store.outputs.lock().unwrap().len(), 1);
        let spawned = mgr.take_spawned();
        assert!(spawned.iter().any(|(_, output)| output == "checkpoint"));
        // Replays do not spawn again.
        mgr.process_message(
            &mut job,
            Severity::Info,
            "checkpoint",
            MessageOrigin::Received,
            None,
            None,
        );
        assert!(!mgr.take_spawned().iter().any(|(_, output)| output == "checkpoint"));
    }

    #[test]
    fn vacated_job_returns_to_submitted_and_restart_is_noticed() {
        let (mut mgr, _pool, store) = mgr();
        let mut job = submitted_job("fetch");
        job.reset_status(TaskStatus::Running);
        job.summary.started_time = Some(Utc::now());
        mgr.process_message(
            &mut job,
            Severity::Warning,
            "vacated/PREEMPT",
            MessageOrigin::Received,
            None,
            None,
        );
        assert_eq!(job.status(), TaskStatus::Submitted);
        assert!(job.job_vacated);
        assert!(job.summary.started_time.is_none());
        assert_eq!(store.events_named("vacated").len(), 1);

        mgr.process_message(
            &mut job,
            Severity::Info,
            MSG_STARTED,
            MessageOrigin::Received,
            None,
            None,
        );
        assert!(!job.job_vacated);
        assert_eq!(job.status(), TaskStatus::Running);
    }

    #[test]
    fn mean_elapsed_time_tracks_recent_runs() {
        let (mut mgr, _pool, _store) = mgr();
        for secs in [100, 200] {
            let mut job = submitted_job("fetch");
            job.reset_status(TaskStatus::Running);
            let started = Utc::now() - ChronoDuration::seconds(secs);
            job.summary.started_time = Some(started);
            mgr.process_message(
                &mut job,
                Severity::Info,
                MSG_SUCCEEDED,
                MessageOrigin::Polled,
                Some(started + ChronoDuration::seconds(secs)),
                None,
            );
        }
        let mean = mgr.mean_elapsed_time("fetch").unwrap();
        assert!((mean - 150.0).abs() < 1.0);
        assert!(mgr.mean_elapsed_time("other").is_none());
    }
}
