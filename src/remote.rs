//! Remote execution target bootstrap and dynamic host selection.
//!
//! Each distinct install target is initialised at most once at a time:
//! remote init (directory structure, service files) followed by file
//! install. The [`RemoteInitState`] map drives the sequencing from the
//! submission orchestrator; this module owns the map, dispatches the phase
//! commands, and folds completions back in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{RemoteError, RET_CODE_UNREACHABLE};
use crate::platform::Platform;
use crate::pool::{
    CommandCtx, CommandOutcome, Pending, ProcessPool, CMD_FILE_INSTALL, CMD_HOST_SELECT,
    CMD_REMOTE_INIT,
};

/// Which bootstrap phase a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemotePhase {
    Init,
    FileInstall,
}

/// Bootstrap state of one install target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteInitState {
    InProgress,
    Done,
    Failed,
    FileInstallInProgress,
    FileInstallDone,
    FileInstallFailed,
    /// The selected host returned exit 255; the phase restarts on the next
    /// submission tick against the remaining hosts.
    Unreachable(RemotePhase),
}

#[derive(Debug)]
struct RemoteInFlight {
    phase: RemotePhase,
    install_target: String,
    host: String,
}

/// Manages remote-init/file-install sequencing and `$(...)` subshell
/// evaluation for dynamic platform/host selection.
pub struct RemoteMgr {
    workflow: String,
    pool: Arc<dyn ProcessPool>,
    pub remote_init_map: HashMap<String, RemoteInitState>,
    pending: Pending<RemoteInFlight>,
    /// Subshell expression -> resolved value; `None` while in flight.
    select_results: HashMap<String, Option<String>>,
    select_errors: HashMap<String, String>,
    pending_selects: Pending<String>,
}

impl RemoteMgr {
    pub fn new(workflow: &str, pool: Arc<dyn ProcessPool>) -> Self {
        Self {
            workflow: workflow.to_string(),
            pool,
            remote_init_map: HashMap::new(),
            pending: Pending::new(),
            select_results: HashMap::new(),
            select_errors: HashMap::new(),
            pending_selects: Pending::new(),
        }
    }

    /// Evaluate a platform/host expression, which may be a `$(...)` command.
    ///
    /// Plain strings resolve immediately. A subshell expression is
    /// dispatched on first sight and `Ok(None)` is returned until its result
    /// arrives on a later tick; a failed command surfaces as an error on the
    /// next call for the same expression.
    pub fn subshell_eval(&mut self, expr: &str) -> Result<Option<String>, RemoteError> {
        let Some(command) = expr.strip_prefix("$(").and_then(|s| s.strip_suffix(')')) else {
            return Ok(Some(expr.to_string()));
        };
        if let Some(err) = self.select_errors.remove(expr) {
            return Err(RemoteError::HostSelect(err));
        }
        match self.select_results.get(expr) {
            Some(Some(value)) => Ok(Some(value.clone())),
            Some(None) => Ok(None),
            None => {
                debug!(expr, "evaluating selection subshell");
                let rx = self
                    .pool
                    .put_command(CommandCtx::shell_command(CMD_HOST_SELECT, command.to_string()));
                self.pending_selects.push(expr.to_string(), rx);
                self.select_results.insert(expr.to_string(), None);
                Ok(None)
            }
        }
    }

    /// Drop resolved subshell results so a later submission re-evaluates.
    pub fn eval_reset(&mut self) {
        self.select_results.retain(|_, value| value.is_none());
    }

    /// Start remote initialisation for a platform's install target.
    pub fn remote_init(&mut self, platform: &Platform, bad_hosts: &HashSet<String>) {
        self.start_phase(RemotePhase::Init, platform, bad_hosts);
    }

    /// Start file installation on an initialised install target.
    pub fn file_install(&mut self, platform: &Platform, bad_hosts: &HashSet<String>) {
        self.start_phase(RemotePhase::FileInstall, platform, bad_hosts);
    }

    fn start_phase(&mut self, phase: RemotePhase, platform: &Platform, bad_hosts: &HashSet<String>) {
        let target = platform.install_target.clone();
        let host = match platform.select_host(bad_hosts) {
            Ok(host) => host,
            Err(err) => {
                // No reachable host: treat like a transient 255 so the next
                // attempt can restart the phase after failover clears hosts.
                warn!(target, %err, "cannot start remote phase");
                self.remote_init_map
                    .insert(target, RemoteInitState::Unreachable(phase));
                return;
            }
        };
        let (key, state) = match phase {
            RemotePhase::Init => (CMD_REMOTE_INIT, RemoteInitState::InProgress),
            RemotePhase::FileInstall => {
                (CMD_FILE_INSTALL, RemoteInitState::FileInstallInProgress)
            }
        };
        let mut cmd = split_command(&platform.ssh_command);
        cmd.push(host.clone());
        cmd.push(key.to_string());
        cmd.push(self.workflow.clone());
        cmd.push(target.clone());
        info!(target, host, phase = ?phase, "starting remote phase");
        let mut ctx = CommandCtx::new(key, cmd);
        ctx.host = Some(host.clone());
        let rx = self.pool.put_command(ctx);
        self.pending.push(
            RemoteInFlight { phase, install_target: target.clone(), host },
            rx,
        );
        self.remote_init_map.insert(target, state);
    }

    /// Fold resolved bootstrap and subshell completions into the maps.
    /// Unreachable hosts are added to `bad_hosts`.
    pub fn process_completions(&mut self, bad_hosts: &mut HashSet<String>) {
        for (in_flight, outcome) in self.pending.drain_ready() {
            let target = in_flight.install_target;
            let state = if outcome.ret_code == 0 {
                match in_flight.phase {
                    RemotePhase::Init => RemoteInitState::Done,
                    RemotePhase::FileInstall => RemoteInitState::FileInstallDone,
                }
            } else if outcome.ret_code == RET_CODE_UNREACHABLE {
                warn!(target, host = in_flight.host, "remote phase host unreachable");
                bad_hosts.insert(in_flight.host.clone());
                RemoteInitState::Unreachable(in_flight.phase)
            } else {
                let err = RemoteError::Management {
                    target: target.clone(),
                    reason: format!("exit {}: {}", outcome.ret_code, outcome.err.trim()),
                };
                warn!(%err, "remote phase failed");
                match in_flight.phase {
                    RemotePhase::Init => RemoteInitState::Failed,
                    RemotePhase::FileInstall => RemoteInitState::FileInstallFailed,
                }
            };
            self.remote_init_map.insert(target, state);
        }
        for (expr, outcome) in self.pending_selects.drain_ready() {
            if outcome.ret_code == 0 {
                let value = outcome.out.trim().to_string();
                debug!(expr, value, "selection subshell resolved");
                self.select_results.insert(expr, Some(value));
            } else {
                self.select_results.remove(&expr);
                self.select_errors
                    .insert(expr, format!("exit {}: {}", outcome.ret_code, outcome.err.trim()));
            }
        }
    }

    pub fn state_of(&self, install_target: &str) -> Option<RemoteInitState> {
        self.remote_init_map.get(install_target).copied()
    }
}

/// Log and clear the bad-host set.
pub fn clear_bad_hosts(bad_hosts: &mut HashSet<String>) {
    if !bad_hosts.is_empty() {
        info!(hosts = ?bad_hosts, "clearing bad hosts");
        bad_hosts.clear();
    }
}

/// Split a configured command string on whitespace.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

/// Prefix a command with the platform's ssh transport for `host`.
pub fn construct_ssh_cmd(cmd: &[String], platform: &Platform, host: &str) -> Vec<String> {
    let mut full = split_command(&platform.ssh_command);
    full.push(host.to_string());
    full.extend(cmd.iter().cloned());
    full
}
