//! Execution platform definitions and host selection.
//!
//! A platform names a set of hosts sharing a job runner and transport
//! configuration. Platforms can belong to a named group; when every host on
//! one platform has been found unreachable the submission orchestrator asks
//! the group for an alternate. Host selection always consults the process
//! wide bad-host set first.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

pub const LOCALHOST: &str = "localhost";

/// A named execution target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub hosts: Vec<String>,
    /// Identity used to deduplicate remote bootstrap across hosts that share
    /// a filesystem. Defaults to the platform name for remote platforms.
    pub install_target: String,
    pub job_runner: String,
    /// Upper bound on jobs per submission command invocation.
    pub max_batch_submit_size: usize,
    pub submission_retry_delays: Vec<f64>,
    pub execution_retry_delays: Vec<f64>,
    pub submission_polling_intervals: Vec<f64>,
    pub execution_polling_intervals: Vec<f64>,
    /// Polling delays applied after an execution time limit is reached.
    pub time_limit_polling_intervals: Vec<f64>,
    pub retrieve_job_logs: bool,
    pub retrieve_job_logs_max_size: Option<String>,
    pub retrieve_job_logs_retry_delays: Vec<f64>,
    pub ssh_command: String,
    pub retrieve_logs_command: String,
}

impl Platform {
    pub fn localhost() -> Self {
        Self {
            name: LOCALHOST.to_string(),
            hosts: vec![LOCALHOST.to_string()],
            install_target: LOCALHOST.to_string(),
            job_runner: "background".to_string(),
            max_batch_submit_size: 100,
            submission_retry_delays: Vec::new(),
            execution_retry_delays: Vec::new(),
            submission_polling_intervals: vec![900.0],
            execution_polling_intervals: vec![900.0],
            time_limit_polling_intervals: vec![60.0, 120.0, 420.0],
            retrieve_job_logs: false,
            retrieve_job_logs_max_size: None,
            retrieve_job_logs_retry_delays: Vec::new(),
            ssh_command: "ssh -oBatchMode=yes".to_string(),
            retrieve_logs_command: "rsync -a".to_string(),
        }
    }

    pub fn remote(name: &str, hosts: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            install_target: name.to_string(),
            ..Self::localhost()
        }
    }

    pub fn is_remote(&self) -> bool {
        self.install_target != LOCALHOST
    }

    /// First host not currently marked bad.
    pub fn select_host(&self, bad_hosts: &HashSet<String>) -> Result<String, PlatformError> {
        self.hosts
            .iter()
            .find(|host| !bad_hosts.contains(*host))
            .cloned()
            .ok_or_else(|| PlatformError::NoHosts(self.name.clone()))
    }

    /// True if at least one host has not been found unreachable.
    pub fn has_good_hosts(&self, bad_hosts: &HashSet<String>) -> bool {
        self.hosts.iter().any(|host| !bad_hosts.contains(host))
    }
}

/// Lookup table for platforms and platform groups.
#[derive(Debug, Clone, Default)]
pub struct PlatformRegistry {
    platforms: BTreeMap<String, Platform>,
    /// Group name -> member platform names, in preference order.
    groups: BTreeMap<String, Vec<String>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.insert(Platform::localhost());
        registry
    }

    pub fn insert(&mut self, platform: Platform) {
        self.platforms.insert(platform.name.clone(), platform);
    }

    pub fn insert_group(&mut self, name: &str, members: Vec<String>) {
        self.groups.insert(name.to_string(), members);
    }

    /// Resolve a platform name, or a group name to its first member with at
    /// least one reachable host.
    pub fn resolve(
        &self,
        name: &str,
        bad_hosts: &HashSet<String>,
    ) -> Result<Platform, PlatformError> {
        if let Some(platform) = self.platforms.get(name) {
            return Ok(platform.clone());
        }
        let members = self
            .groups
            .get(name)
            .ok_or_else(|| PlatformError::Lookup(name.to_string()))?;
        for member in members {
            if let Some(platform) = self.platforms.get(member) {
                if platform.has_good_hosts(bad_hosts) {
                    return Ok(platform.clone());
                }
            }
        }
        Err(PlatformError::NoPlatforms(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<&Platform, PlatformError> {
        self.platforms
            .get(name)
            .ok_or_else(|| PlatformError::Lookup(name.to_string()))
    }
}
