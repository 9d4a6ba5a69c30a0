//! Narrow contract to the external process pool.
//!
//! All remote work (submission, polling, killing, mail, log retrieval,
//! host-selection subshells) is handed to the pool as a command context and
//! resolved later through a oneshot channel. The managers never await these
//! channels; they poll them on scheduler ticks so job state is only ever
//! mutated from the single scheduling flow.

use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

pub const CMD_JOBS_SUBMIT: &str = "jobs-submit";
pub const CMD_JOBS_POLL: &str = "jobs-poll";
pub const CMD_JOBS_KILL: &str = "jobs-kill";
pub const CMD_EVENT_MAIL: &str = "event-mail";
pub const CMD_EVENT_HANDLER: &str = "event-handler";
pub const CMD_JOB_LOGS_RETRIEVE: &str = "job-logs-retrieve";
pub const CMD_REMOTE_INIT: &str = "remote-init";
pub const CMD_FILE_INSTALL: &str = "file-install";
pub const CMD_HOST_SELECT: &str = "host-select";

/// A command to run out of process.
#[derive(Debug, Clone)]
pub struct CommandCtx {
    /// Which operation this command performs, e.g. [`CMD_JOBS_SUBMIT`].
    pub key: &'static str,
    pub cmd: Vec<String>,
    pub stdin: Option<String>,
    /// Host the command targets, for unreachable-host bookkeeping.
    pub host: Option<String>,
    /// Extra environment for the command.
    pub env: Vec<(String, String)>,
    /// Run through a shell; used for user-supplied handler commands.
    pub shell: bool,
}

impl CommandCtx {
    pub fn new(key: &'static str, cmd: Vec<String>) -> Self {
        Self { key, cmd, stdin: None, host: None, env: Vec::new(), shell: false }
    }

    pub fn shell_command(key: &'static str, command_line: String) -> Self {
        Self { key, cmd: vec![command_line], stdin: None, host: None, env: Vec::new(), shell: true }
    }
}

/// Result of a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub ret_code: i32,
    pub out: String,
    pub err: String,
    pub timestamp: DateTime<Utc>,
}

impl CommandOutcome {
    pub fn failure(err: impl Into<String>) -> Self {
        Self { ret_code: 1, out: String::new(), err: err.into(), timestamp: Utc::now() }
    }
}

pub trait ProcessPool: Send + Sync {
    /// Queue a command. The receiver resolves on a later scheduler tick;
    /// callers must not block on it.
    fn put_command(&self, ctx: CommandCtx) -> oneshot::Receiver<CommandOutcome>;
}

/// Commands in flight for one manager, tagged with what to do on completion.
#[derive(Debug, Default)]
pub struct Pending<T> {
    items: Vec<(T, oneshot::Receiver<CommandOutcome>)>,
}

impl<T> Pending<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, tag: T, rx: oneshot::Receiver<CommandOutcome>) {
        self.items.push((tag, rx));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Take every completion that has resolved since the last tick. A closed
    /// channel (pool shut down mid-command) is reported as a plain failure.
    pub fn drain_ready(&mut self) -> Vec<(T, CommandOutcome)> {
        let mut ready = Vec::new();
        let mut still_pending = Vec::new();
        for (tag, mut rx) in self.items.drain(..) {
            match rx.try_recv() {
                Ok(outcome) => ready.push((tag, outcome)),
                Err(oneshot::error::TryRecvError::Empty) => still_pending.push((tag, rx)),
                Err(oneshot::error::TryRecvError::Closed) => {
                    ready.push((tag, CommandOutcome::failure("command channel closed")));
                }
            }
        }
        self.items = still_pending;
        ready
    }
}

/// Bounded pool running commands as local subprocesses.
pub struct SystemProcessPool {
    semaphore: Arc<Semaphore>,
}

impl SystemProcessPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
        }
    }
}

impl ProcessPool for SystemProcessPool {
    fn put_command(&self, ctx: CommandCtx) -> oneshot::Receiver<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let outcome = run_command(&ctx).await;
            metrics::counter!("jobflow_pool_commands_total", "key" => ctx.key).increment(1);
            if tx.send(outcome).is_err() {
                warn!(key = ctx.key, "command completion dropped, caller gone");
            }
        });
        rx
    }
}

async fn run_command(ctx: &CommandCtx) -> CommandOutcome {
    debug!(key = ctx.key, cmd = ?ctx.cmd, host = ?ctx.host, "running command");
    let mut command = if ctx.shell {
        let mut c = Command::new("sh");
        c.arg("-c").arg(ctx.cmd.join(" "));
        c
    } else {
        let Some((program, args)) = ctx.cmd.split_first() else {
            return CommandOutcome::failure("empty command");
        };
        let mut c = Command::new(program);
        c.args(args);
        c
    };
    command
        .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if ctx.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return CommandOutcome::failure(format!("spawn failed: {err}")),
    };
    if let (Some(stdin_str), Some(mut stdin)) = (ctx.stdin.as_ref(), child.stdin.take()) {
        if let Err(err) = stdin.write_all(stdin_str.as_bytes()).await {
            warn!(key = ctx.key, ?err, "failed to write command stdin");
        }
    }
    match child.wait_with_output().await {
        Ok(output) => CommandOutcome {
            ret_code: output.status.code().unwrap_or(1),
            out: String::from_utf8_lossy(&output.stdout).into_owned(),
            err: String::from_utf8_lossy(&output.stderr).into_owned(),
            timestamp: Utc::now(),
        },
        Err(err) => CommandOutcome::failure(format!("wait failed: {err}")),
    }
}

/// Pool that records commands and lets the caller resolve them by hand.
/// Drives the callback paths deterministically in tests.
#[derive(Default)]
pub struct ScriptedPool {
    inner: std::sync::Mutex<Vec<(CommandCtx, oneshot::Sender<CommandOutcome>)>>,
}

impl ScriptedPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands queued and not yet resolved.
    pub fn queued(&self) -> Vec<CommandCtx> {
        self.inner.lock().unwrap().iter().map(|(ctx, _)| ctx.clone()).collect()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Resolve the oldest queued command with the given outcome, returning
    /// its context.
    pub fn resolve_next(&self, outcome: CommandOutcome) -> Option<CommandCtx> {
        let (ctx, tx) = {
            let mut guard = self.inner.lock().unwrap();
            if guard.is_empty() {
                return None;
            }
            guard.remove(0)
        };
        let _ = tx.send(outcome);
        Some(ctx)
    }

    /// Resolve every queued command with copies of the same outcome.
    pub fn resolve_all(&self, outcome: &CommandOutcome) -> Vec<CommandCtx> {
        let mut resolved = Vec::new();
        while let Some(ctx) = self.resolve_next(outcome.clone()) {
            resolved.push(ctx);
        }
        resolved
    }
}

impl ProcessPool for ScriptedPool {
    fn put_command(&self, ctx: CommandCtx) -> oneshot::Receiver<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().push((ctx, tx));
        rx
    }
}
