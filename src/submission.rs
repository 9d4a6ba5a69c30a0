//! Job submission orchestration.
//!
//! [`JobMgr::submit_task_jobs`] takes jobs the scheduler wants running and
//! walks each one through platform resolution (including `$(...)` subshell
//! evaluation), remote target bootstrap, and chunked batch dispatch to the
//! process pool. Nothing here waits: a job that cannot be dispatched this
//! tick gets a progress message and is picked up again on the next one.
//! Completions are folded back in by [`JobMgr::process_submission_completions`],
//! which parses per-job summary lines and routes the results through the
//! event manager; an unreachable host (exit 255) triggers host failover
//! instead of a submission failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::action_timer::{ActionTimer, TimerKind};
use crate::config::Config;
use crate::error::RET_CODE_UNREACHABLE;
use crate::event_manager::EventMgr;
use crate::message::{MessageOrigin, Severity, MSG_SUBMITTED, MSG_SUBMIT_FAILED, MSG_SUCCEEDED};
use crate::platform::{Platform, PlatformRegistry};
use crate::pool::{
    CommandCtx, Pending, ProcessPool, CMD_FILE_INSTALL, CMD_JOBS_SUBMIT, CMD_REMOTE_INIT,
};
use crate::remote::{clear_bad_hosts, construct_ssh_cmd, RemoteInitState, RemoteMgr};
use crate::store::{row, JobStore};
use crate::task::{RunMode, TaskJob, TaskJobId, TaskPool, TaskStatus};

/// Progress messages shown against a job while it cannot be dispatched yet.
pub const MSG_WAIT_HOST_SELECT: &str = "waiting for remote host selection";
pub const MSG_REMOTE_INIT: &str = "remote host initialising";
pub const MSG_FILE_INSTALL: &str = "file installation in progress";

enum Prep {
    Ready(String),
    Waiting,
    Failed,
}

#[derive(Debug)]
struct SubmitBatch {
    platform: String,
    host: String,
    job_ids: Vec<TaskJobId>,
}

pub struct JobMgr {
    workflow: String,
    config: Config,
    store: Arc<dyn JobStore>,
    pool: Arc<dyn ProcessPool>,
    pub platforms: PlatformRegistry,
    pub remote: RemoteMgr,
    /// Hosts found unreachable, process wide.
    pub bad_hosts: HashSet<String>,
    pending_submissions: Pending<SubmitBatch>,
}

impl JobMgr {
    pub fn new(
        workflow: &str,
        config: Config,
        platforms: PlatformRegistry,
        store: Arc<dyn JobStore>,
        pool: Arc<dyn ProcessPool>,
    ) -> Self {
        let remote = RemoteMgr::new(workflow, Arc::clone(&pool));
        Self {
            workflow: workflow.to_string(),
            config,
            store,
            pool,
            platforms,
            remote,
            bad_hosts: HashSet::new(),
            pending_submissions: Pending::new(),
        }
    }

    /// Return every unreachable host to selection, e.g. on operator request.
    pub fn clear_bad_hosts(&mut self) {
        clear_bad_hosts(&mut self.bad_hosts);
    }

    /// Prepare and dispatch submissions for the given jobs. Returns the
    /// number of jobs handed to the process pool this tick.
    pub fn submit_task_jobs(&mut self, mut jobs: Vec<&mut TaskJob>, events: &mut EventMgr) -> usize {
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, job) in jobs.iter_mut().enumerate() {
            if !job.waiting_on_job_prep {
                continue;
            }
            // A job already in preparing was prepared on an earlier tick and
            // is waiting on its platform (remote bootstrap); don't re-prepare.
            if job.status() != TaskStatus::Preparing {
                match self.prepare_submit(job, events) {
                    Prep::Ready(_) => {}
                    Prep::Waiting | Prep::Failed => continue,
                }
            }
            if job.config.run_mode == RunMode::Simulation {
                // No job runner involved; the attempt starts now.
                job.waiting_on_job_prep = false;
                events.process_message(
                    job,
                    Severity::Info,
                    MSG_SUBMITTED,
                    MessageOrigin::Internal,
                    None,
                    None,
                );
                continue;
            }
            let Some(platform_name) = job.platform.as_ref().map(|p| p.name.clone()) else {
                continue;
            };
            groups.entry(platform_name).or_default().push(i);
        }

        let mut dispatched = 0;
        for (platform_name, idxs) in groups {
            let platform = match self.platforms.get(&platform_name) {
                Ok(platform) => platform.clone(),
                Err(err) => {
                    warn!(%err, "prepared platform vanished from the registry");
                    continue;
                }
            };
            if platform.is_remote() && !self.remote_target_ready(&platform, &mut jobs, &idxs, events)
            {
                continue;
            }
            let host = match platform.select_host(&self.bad_hosts) {
                Ok(host) => host,
                Err(err) => {
                    warn!(platform = platform.name, %err, "no host for submission");
                    for &i in &idxs {
                        self.failover(&mut *jobs[i], &platform, events);
                    }
                    continue;
                }
            };
            dispatched += self.dispatch_batches(&platform, &host, &mut jobs, &idxs);
        }
        dispatched
    }

    /// Drive the remote bootstrap state machine for one install target.
    /// Returns true when the target is ready for job submission.
    fn remote_target_ready(
        &mut self,
        platform: &Platform,
        jobs: &mut [&mut TaskJob],
        idxs: &[usize],
        events: &mut EventMgr,
    ) -> bool {
        let progress = |mgr: &Self, jobs: &[&mut TaskJob], msg: &str| {
            for &i in idxs {
                mgr.store.delta_job_msg(&jobs[i].job_id(), msg);
            }
        };
        match self.remote.state_of(&platform.install_target) {
            Some(RemoteInitState::FileInstallDone) => true,
            None => {
                self.remote.remote_init(platform, &self.bad_hosts);
                progress(self, jobs, MSG_REMOTE_INIT);
                false
            }
            Some(RemoteInitState::InProgress) => {
                progress(self, jobs, MSG_REMOTE_INIT);
                false
            }
            Some(RemoteInitState::Done) => {
                self.remote.file_install(platform, &self.bad_hosts);
                progress(self, jobs, MSG_FILE_INSTALL);
                false
            }
            Some(RemoteInitState::FileInstallInProgress) => {
                progress(self, jobs, MSG_FILE_INSTALL);
                false
            }
            Some(RemoteInitState::Unreachable(_)) => {
                // Forget the attempt; bootstrap restarts from scratch against
                // the remaining hosts on the next tick.
                self.remote.remote_init_map.remove(&platform.install_target);
                progress(self, jobs, MSG_REMOTE_INIT);
                false
            }
            Some(state @ (RemoteInitState::Failed | RemoteInitState::FileInstallFailed)) => {
                warn!(
                    target = platform.install_target,
                    "remote bootstrap failed, submission cannot proceed"
                );
                self.remote.remote_init_map.remove(&platform.install_target);
                let key = if state == RemoteInitState::Failed {
                    CMD_REMOTE_INIT
                } else {
                    CMD_FILE_INSTALL
                };
                // The whole group fails to submit; retries go through the
                // normal submission-retry machinery per job.
                for &i in idxs {
                    let job = &mut *jobs[i];
                    self.store.log_activity(
                        &job.job_id(),
                        &format!("[{key}] failed on {}", platform.install_target),
                    );
                    job.waiting_on_job_prep = false;
                    events.process_message(
                        job,
                        Severity::Critical,
                        MSG_SUBMIT_FAILED,
                        MessageOrigin::Internal,
                        None,
                        None,
                    );
                }
                false
            }
        }
    }

    fn dispatch_batches(
        &mut self,
        platform: &Platform,
        host: &str,
        jobs: &mut [&mut TaskJob],
        idxs: &[usize],
    ) -> usize {
        let n = idxs.len();
        let max_batch = platform.max_batch_submit_size.max(1);
        let chunk_size = n / (n / max_batch + 1) + 1;
        let mut dispatched = 0;
        for chunk in idxs.chunks(chunk_size) {
            let mut cmd = vec![CMD_JOBS_SUBMIT.to_string(), self.workflow.clone()];
            let mut job_ids = Vec::with_capacity(chunk.len());
            for &i in chunk {
                jobs[i].waiting_on_job_prep = false;
                let id = jobs[i].job_id();
                cmd.push(id.to_string());
                job_ids.push(id);
            }
            let ctx = if platform.is_remote() {
                let mut ctx =
                    CommandCtx::new(CMD_JOBS_SUBMIT, construct_ssh_cmd(&cmd, platform, host));
                ctx.host = Some(host.to_string());
                ctx
            } else {
                CommandCtx::new(CMD_JOBS_SUBMIT, cmd)
            };
            info!(
                platform = platform.name,
                host,
                jobs = job_ids.len(),
                "submitting job batch"
            );
            for id in &job_ids {
                self.store.log_activity(id, &format!("[{CMD_JOBS_SUBMIT}] dispatched via {host}"));
            }
            dispatched += job_ids.len();
            let rx = self.pool.put_command(ctx);
            self.pending_submissions.push(
                SubmitBatch {
                    platform: platform.name.clone(),
                    host: host.to_string(),
                    job_ids,
                },
                rx,
            );
        }
        dispatched
    }

    fn prepare_submit(&mut self, job: &mut TaskJob, events: &mut EventMgr) -> Prep {
        let expr = job.config.platform_name.clone();
        let resolved = match self.remote.subshell_eval(&expr) {
            Ok(Some(name)) => name,
            Ok(None) => {
                self.store.delta_job_msg(&job.job_id(), MSG_WAIT_HOST_SELECT);
                return Prep::Waiting;
            }
            Err(err) => {
                warn!(job = %job.identity(), %err, "platform selection failed");
                self.prep_submit_failed(job, events);
                return Prep::Failed;
            }
        };
        let platform = match self.platforms.resolve(&resolved, &self.bad_hosts) {
            Ok(platform) => platform,
            Err(err) => {
                warn!(job = %job.identity(), %err, "platform lookup failed");
                self.prep_submit_failed(job, events);
                return Prep::Failed;
            }
        };
        job.submit_num += 1;
        job.begin_new_attempt();
        job.reset_status(TaskStatus::Preparing);
        job.retry_scheduled_at = None;
        job.summary.platforms_used.insert(job.submit_num, platform.name.clone());
        job.summary.job_runner_name = Some(platform.job_runner.clone());
        job.summary.execution_time_limit = job.config.execution_time_limit;
        // Retry timers are created on first use and keep their consumed-trial
        // counts across attempts; only the delay lists are refreshed.
        let submission_delays = job
            .config
            .submission_retry_delays
            .clone()
            .unwrap_or_else(|| platform.submission_retry_delays.clone());
        if !submission_delays.is_empty() {
            match job.try_timers.submission_retry.as_mut() {
                Some(timer) => timer.set_delays(submission_delays),
                None => job
                    .try_timers
                    .set(TimerKind::SubmissionRetry, ActionTimer::new(submission_delays)),
            }
        }
        let execution_delays = job
            .config
            .execution_retry_delays
            .clone()
            .unwrap_or_else(|| platform.execution_retry_delays.clone());
        if !execution_delays.is_empty() {
            match job.try_timers.execution_retry.as_mut() {
                Some(timer) => timer.set_delays(execution_delays),
                None => job
                    .try_timers
                    .set(TimerKind::ExecutionRetry, ActionTimer::new(execution_delays)),
            }
        }
        job.local_job_file_path = Some(format!(
            "{}/{}/log/job/{}/job",
            self.config.run_dir,
            self.workflow,
            job.job_id()
        ));
        self.store.insert_task_job(
            &job.job_id(),
            row(vec![
                ("platform_name", json!(platform.name)),
                ("job_runner_name", json!(platform.job_runner)),
                ("time_submit", json!(Utc::now().to_rfc3339())),
            ]),
        );
        job.platform = Some(platform.clone());
        Prep::Ready(platform.name)
    }

    /// Job preparation failed outright; record the attempt and fail it.
    fn prep_submit_failed(&mut self, job: &mut TaskJob, events: &mut EventMgr) {
        job.submit_num += 1;
        job.waiting_on_job_prep = false;
        self.store.insert_task_job(
            &job.job_id(),
            row(vec![("time_submit", json!(Utc::now().to_rfc3339()))]),
        );
        events.process_message(
            job,
            Severity::Critical,
            MSG_SUBMIT_FAILED,
            MessageOrigin::Internal,
            None,
            None,
        );
    }

    /// Host failover after the selected host proved unusable. The attempt
    /// never reached a job runner, so the submit number is rolled back and
    /// no retry trial is consumed. When the platform and its group are both
    /// exhausted, the platform's hosts are returned to selection (the only
    /// path that partially clears the bad-host set) and the submission is
    /// declared failed.
    fn failover(&mut self, job: &mut TaskJob, platform: &Platform, events: &mut EventMgr) {
        if platform.has_good_hosts(&self.bad_hosts) {
            self.requeue_for_prep(job);
            return;
        }
        let alternate = self
            .platforms
            .resolve(&job.config.platform_name, &self.bad_hosts)
            .ok()
            .filter(|alt| alt.name != platform.name && alt.has_good_hosts(&self.bad_hosts));
        match alternate {
            Some(alt) => {
                warn!(
                    job = %job.identity(),
                    from = platform.name,
                    to = alt.name,
                    "platform failover"
                );
                self.requeue_for_prep(job);
            }
            None => {
                for host in &platform.hosts {
                    if self.bad_hosts.remove(host) {
                        info!(host, "returning host to selection");
                    }
                }
                events.process_message(
                    job,
                    Severity::Critical,
                    MSG_SUBMIT_FAILED,
                    MessageOrigin::Internal,
                    None,
                    None,
                );
            }
        }
    }

    /// Roll an attempt back for re-preparation from scratch.
    fn requeue_for_prep(&mut self, job: &mut TaskJob) {
        job.submit_num = job.submit_num.saturating_sub(1);
        job.waiting_on_job_prep = true;
        if job.reset_status(TaskStatus::Waiting) {
            self.store.delta_task_state(&job.job_id(), TaskStatus::Waiting);
        }
    }

    /// Fold resolved submission batches (and remote bootstrap commands) back
    /// into job state.
    pub fn process_submission_completions(&mut self, tasks: &mut TaskPool, events: &mut EventMgr) {
        self.remote.process_completions(&mut self.bad_hosts);
        for (batch, outcome) in self.pending_submissions.drain_ready() {
            for id in &batch.job_ids {
                self.store.log_activity(
                    id,
                    &format!("[{CMD_JOBS_SUBMIT} ret_code] {}", outcome.ret_code),
                );
            }
            if outcome.ret_code == RET_CODE_UNREACHABLE {
                warn!(host = batch.host, "submission host unreachable");
                self.bad_hosts.insert(batch.host.clone());
                let platform = self.platforms.get(&batch.platform).ok().cloned();
                for id in &batch.job_ids {
                    let Some(job) = tasks.get_mut(&id.point, &id.name) else { continue };
                    if job.submit_num != id.submit_num {
                        continue;
                    }
                    if let Some(platform) = platform.as_ref() {
                        self.failover(job, platform, events);
                    }
                }
                continue;
            }
            let mut results: HashMap<TaskJobId, (DateTime<Utc>, i32, Option<String>)> =
                HashMap::new();
            for line in outcome.out.lines() {
                if let Some((time, id, ret_code, runner_id)) = parse_summary_line(line) {
                    results.insert(id, (time, ret_code, runner_id));
                }
            }
            for id in &batch.job_ids {
                let Some(job) = tasks.get_mut(&id.point, &id.name) else { continue };
                if job.submit_num != id.submit_num {
                    continue;
                }
                match results.remove(id) {
                    Some((time, 0, runner_id)) => {
                        job.summary.submit_method_id = runner_id;
                        events.process_message(
                            job,
                            Severity::Info,
                            MSG_SUBMITTED,
                            MessageOrigin::Internal,
                            Some(time),
                            None,
                        );
                    }
                    Some((time, ret_code, _)) => {
                        warn!(job = %id, ret_code, "submission command failed");
                        events.process_message(
                            job,
                            Severity::Critical,
                            MSG_SUBMIT_FAILED,
                            MessageOrigin::Internal,
                            Some(time),
                            None,
                        );
                    }
                    None => {
                        warn!(job = %id, "no submission result, treating as failed");
                        events.process_message(
                            job,
                            Severity::Critical,
                            MSG_SUBMIT_FAILED,
                            MessageOrigin::Internal,
                            Some(outcome.timestamp),
                            None,
                        );
                    }
                }
            }
        }
    }

    /// Complete simulated jobs whose run length has elapsed.
    pub fn check_simulated_jobs(
        &mut self,
        tasks: &mut TaskPool,
        events: &mut EventMgr,
        now: DateTime<Utc>,
    ) {
        for job in tasks.iter_mut() {
            if job.config.run_mode != RunMode::Simulation || job.status() != TaskStatus::Running {
                continue;
            }
            let Some(started) = job.summary.started_time else { continue };
            let run_length = job.config.simulated_run_length.unwrap_or(0.0);
            let finish_at =
                started + chrono::Duration::milliseconds((run_length * 1000.0) as i64);
            if now >= finish_at {
                events.process_message(
                    job,
                    Severity::Info,
                    MSG_SUCCEEDED,
                    MessageOrigin::Internal,
                    Some(now),
                    None,
                );
            }
        }
    }
}

/// Parse one submission summary line: `TIMESTAMP|POINT/NAME/NN|RET_CODE` with
/// an optional fourth field carrying the job runner's id (`None` if the
/// runner did not produce one).
pub fn parse_summary_line(
    line: &str,
) -> Option<(DateTime<Utc>, TaskJobId, i32, Option<String>)> {
    let mut parts = line.trim().splitn(4, '|');
    let time = parts.next()?.parse::<DateTime<Utc>>().ok()?;
    let id = TaskJobId::parse(parts.next()?)?;
    let ret_code = parts.next()?.trim().parse().ok()?;
    let runner_id = match parts.next().map(str::trim) {
        None | Some("None") | Some("") => None,
        Some(s) => Some(s.to_string()),
    };
    Some((time, id, ret_code, runner_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WorkflowInfo;
    use crate::pool::{CommandOutcome, ScriptedPool};
    use crate::store::MemoryStore;
    use crate::task::TaskConfig;

    fn outcome(ret_code: i32, out: &str) -> CommandOutcome {
        CommandOutcome {
            ret_code,
            out: out.to_string(),
            err: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn managers(platforms: PlatformRegistry) -> (JobMgr, EventMgr, Arc<ScriptedPool>, Arc<MemoryStore>) {
        let pool = Arc::new(ScriptedPool::new());
        let store = Arc::new(MemoryStore::new());
        let job_mgr = JobMgr::new(
            "demo",
            Config::default(),
            platforms,
            store.clone() as Arc<dyn JobStore>,
            pool.clone() as Arc<dyn ProcessPool>,
        );
        let events = EventMgr::new(
            WorkflowInfo { name: "demo".to_string(), ..WorkflowInfo::default() },
            Config::default(),
            store.clone() as Arc<dyn JobStore>,
            pool.clone() as Arc<dyn ProcessPool>,
        );
        (job_mgr, events, pool, store)
    }

    fn task(name: &str, platform_name: &str) -> TaskJob {
        TaskJob::new(
            "1",
            name,
            TaskConfig { platform_name: platform_name.to_string(), ..TaskConfig::default() },
        )
    }

    #[test]
    fn localhost_submission_round_trip() {
        let (mut mgr, mut events, pool, _store) = managers(PlatformRegistry::new());
        let mut tasks = TaskPool::new();
        tasks.insert(task("fetch", "localhost"));

        let dispatched = mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events);
        assert_eq!(dispatched, 1);
        let job = tasks.get("1", "fetch").unwrap();
        assert_eq!(job.submit_num, 1);
        assert_eq!(job.status(), TaskStatus::Preparing);

        let line = format!("{}|1/fetch/01|0|4567", Utc::now().to_rfc3339());
        pool.resolve_next(outcome(0, &line));
        mgr.process_submission_completions(&mut tasks, &mut events);
        let job = tasks.get("1", "fetch").unwrap();
        assert_eq!(job.status(), TaskStatus::Submitted);
        assert_eq!(job.summary.submit_method_id.as_deref(), Some("4567"));
    }

    #[test]
    fn batches_are_chunked_evenly() {
        let mut platform = Platform::localhost();
        platform.max_batch_submit_size = 3;
        let mut platforms = PlatformRegistry::new();
        platforms.insert(platform);
        let (mut mgr, mut events, pool, _store) = managers(platforms);

        let mut tasks = TaskPool::new();
        for i in 0..7 {
            tasks.insert(task(&format!("t{i}"), "localhost"));
        }
        let dispatched = mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events);
        assert_eq!(dispatched, 7);
        // 7 jobs with a batch cap of 3 go out as 3 commands of <= 3 jobs.
        assert_eq!(pool.queued_len(), 3);
        for ctx in pool.queued() {
            assert!(ctx.cmd.len() - 2 <= 3);
        }
    }

    #[test]
    fn missing_summary_line_is_a_submission_failure() {
        let (mut mgr, mut events, pool, _store) = managers(PlatformRegistry::new());
        let mut tasks = TaskPool::new();
        tasks.insert(task("fetch", "localhost"));
        mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events);
        pool.resolve_next(outcome(0, ""));
        mgr.process_submission_completions(&mut tasks, &mut events);
        assert_eq!(tasks.get("1", "fetch").unwrap().status(), TaskStatus::SubmitFailed);
    }

    #[test]
    fn unreachable_host_rolls_back_and_retries_on_next_host() {
        let mut platforms = PlatformRegistry::new();
        platforms.insert(Platform::remote("hpc", &["h1", "h2"]));
        let (mut mgr, mut events, pool, _store) = managers(platforms);
        mgr.remote
            .remote_init_map
            .insert("hpc".to_string(), RemoteInitState::FileInstallDone);

        let mut tasks = TaskPool::new();
        let mut job = task("fetch", "hpc");
        job.config.submission_retry_delays = Some(vec![10.0]);
        tasks.insert(job);

        mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events);
        let ctx = pool.resolve_next(outcome(RET_CODE_UNREACHABLE, "")).unwrap();
        assert_eq!(ctx.host.as_deref(), Some("h1"));
        mgr.process_submission_completions(&mut tasks, &mut events);

        let job = tasks.get("1", "fetch").unwrap();
        // Rolled back without consuming a submission-retry trial.
        assert_eq!(job.submit_num, 0);
        assert!(job.waiting_on_job_prep);
        assert_eq!(job.try_timers.submission_retry.as_ref().unwrap().num, 0);
        assert!(mgr.bad_hosts.contains("h1"));

        mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events);
        let ctx = pool.queued().remove(0);
        assert!(ctx.cmd.contains(&"h2".to_string()));
    }

    #[test]
    fn exhausted_group_partially_clears_bad_hosts_and_fails() {
        let mut platforms = PlatformRegistry::new();
        platforms.insert(Platform::remote("hpc-a", &["a1"]));
        platforms.insert(Platform::remote("hpc-b", &["b1"]));
        platforms.insert_group("hpc", vec!["hpc-a".to_string(), "hpc-b".to_string()]);
        let (mut mgr, mut events, pool, _store) = managers(platforms);
        for target in ["hpc-a", "hpc-b"] {
            mgr.remote
                .remote_init_map
                .insert(target.to_string(), RemoteInitState::FileInstallDone);
        }

        let mut tasks = TaskPool::new();
        tasks.insert(task("fetch", "hpc"));

        mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events);
        pool.resolve_next(outcome(RET_CODE_UNREACHABLE, ""));
        mgr.process_submission_completions(&mut tasks, &mut events);
        assert!(mgr.bad_hosts.contains("a1"));
        assert!(tasks.get("1", "fetch").unwrap().waiting_on_job_prep);

        // Failover lands on the group's second member.
        mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events);
        let ctx = pool.resolve_next(outcome(RET_CODE_UNREACHABLE, "")).unwrap();
        assert_eq!(ctx.host.as_deref(), Some("b1"));
        mgr.process_submission_completions(&mut tasks, &mut events);

        // Out of options: submission fails and hpc-b's hosts come back into
        // play, but hpc-a's stay bad.
        let job = tasks.get("1", "fetch").unwrap();
        assert_eq!(job.status(), TaskStatus::SubmitFailed);
        assert!(mgr.bad_hosts.contains("a1"));
        assert!(!mgr.bad_hosts.contains("b1"));
    }

    #[test]
    fn remote_target_bootstraps_before_first_submission() {
        let mut platforms = PlatformRegistry::new();
        platforms.insert(Platform::remote("hpc", &["h1"]));
        let (mut mgr, mut events, pool, store) = managers(platforms);
        let mut tasks = TaskPool::new();
        tasks.insert(task("fetch", "hpc"));

        // Tick 1: remote init dispatched, job waits.
        assert_eq!(mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events), 0);
        let ctx = pool.resolve_next(outcome(0, "")).unwrap();
        assert_eq!(ctx.key, CMD_REMOTE_INIT);
        let id = tasks.get("1", "fetch").unwrap().job_id();
        assert_eq!(store.last_job_msg(&id).as_deref(), Some(MSG_REMOTE_INIT));
        mgr.process_submission_completions(&mut tasks, &mut events);

        // Tick 2: file install dispatched.
        assert_eq!(mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events), 0);
        let ctx = pool.resolve_next(outcome(0, "")).unwrap();
        assert_eq!(ctx.key, CMD_FILE_INSTALL);
        mgr.process_submission_completions(&mut tasks, &mut events);

        // Tick 3: the actual submission goes out.
        assert_eq!(mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events), 1);
        assert_eq!(pool.queued()[0].key, CMD_JOBS_SUBMIT);
    }

    #[test]
    fn failed_remote_bootstrap_fails_the_whole_group() {
        let mut platforms = PlatformRegistry::new();
        platforms.insert(Platform::remote("hpc", &["h1"]));
        let (mut mgr, mut events, pool, _store) = managers(platforms);
        let mut tasks = TaskPool::new();
        tasks.insert(task("fetch", "hpc"));
        tasks.insert(task("crunch", "hpc"));

        assert_eq!(mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events), 0);
        pool.resolve_next(outcome(2, ""));
        mgr.process_submission_completions(&mut tasks, &mut events);

        // The init error fails every job on the target; the bootstrap is not
        // silently restarted.
        assert_eq!(mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events), 0);
        assert_eq!(pool.queued_len(), 0);
        for name in ["fetch", "crunch"] {
            let job = tasks.get("1", name).unwrap();
            assert_eq!(job.status(), TaskStatus::SubmitFailed);
            assert!(!job.waiting_on_job_prep);
        }
    }

    #[test]
    fn subshell_platform_expression_delays_preparation() {
        let (mut mgr, mut events, pool, store) = managers(PlatformRegistry::new());
        let mut tasks = TaskPool::new();
        tasks.insert(task("fetch", "$(pick-platform)"));

        assert_eq!(mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events), 0);
        let job = tasks.get("1", "fetch").unwrap();
        assert_eq!(job.submit_num, 0);
        assert_eq!(
            store.last_job_msg(&job.job_id()).as_deref(),
            Some(MSG_WAIT_HOST_SELECT)
        );

        pool.resolve_next(outcome(0, "localhost\n"));
        mgr.process_submission_completions(&mut tasks, &mut events);
        assert_eq!(mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events), 1);
        assert_eq!(tasks.get("1", "fetch").unwrap().submit_num, 1);
    }

    #[test]
    fn simulation_mode_skips_the_process_pool() {
        let (mut mgr, mut events, pool, _store) = managers(PlatformRegistry::new());
        let mut tasks = TaskPool::new();
        let mut job = task("fetch", "localhost");
        job.config.run_mode = RunMode::Simulation;
        job.config.simulated_run_length = Some(0.0);
        tasks.insert(job);

        assert_eq!(mgr.submit_task_jobs(tasks.iter_mut().collect(), &mut events), 0);
        assert_eq!(pool.queued_len(), 0);
        assert_eq!(tasks.get("1", "fetch").unwrap().status(), TaskStatus::Running);

        mgr.check_simulated_jobs(&mut tasks, &mut events, Utc::now());
        assert_eq!(tasks.get("1", "fetch").unwrap().status(), TaskStatus::Succeeded);
    }

    #[test]
    fn summary_line_parsing() {
        let line = "2026-01-01T00:00:00Z|1/fetch/01|0|1234";
        let (_, id, ret_code, runner_id) = parse_summary_line(line).unwrap();
        assert_eq!(id.to_string(), "1/fetch/01");
        assert_eq!(ret_code, 0);
        assert_eq!(runner_id.as_deref(), Some("1234"));

        let line = "2026-01-01T00:00:00Z|1/fetch/01|1|None";
        let (_, _, ret_code, runner_id) = parse_summary_line(line).unwrap();
        assert_eq!(ret_code, 1);
        assert!(runner_id.is_none());

        assert!(parse_summary_line("garbage").is_none());
    }
}
