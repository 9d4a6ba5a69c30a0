//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `JOBFLOW_MAIL_FROM`: From: address for event mail (default: notifications@localhost)
//! - `JOBFLOW_MAIL_TO`: To: address for event mail (default: $USER)
//! - `JOBFLOW_MAIL_INTERVAL_SECS`: Minimum interval between mail batches (default: 300)
//! - `JOBFLOW_MAIL_SMTP`: SMTP server handed to the mail command (optional)
//! - `JOBFLOW_MAIL_FOOTER`: Footer template appended to every mail (optional)
//! - `JOBFLOW_POOL_SIZE`: Process pool size (default: num_cpus)
//! - `JOBFLOW_HANDLER_RETRY_DELAYS`: Default handler retry delays, comma separated seconds (default: 0)
//! - `JOBFLOW_POLLING_INTERVAL_SECS`: Default submission/execution polling interval (default: 900)
//! - `JOBFLOW_MAX_BATCH_SUBMIT_SIZE`: Default jobs per submission command (default: 100)
//! - `JOBFLOW_RUN_DIR`: Workflow run directory holding job logs (default: ~/jobflow-run)

use std::env;

use anyhow::Result;

pub const DEFAULT_MAIL_INTERVAL_SECS: f64 = 300.0;
pub const DEFAULT_POLLING_INTERVAL_SECS: f64 = 900.0;
pub const DEFAULT_MAX_BATCH_SUBMIT_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct Config {
    /// From: address for event mail.
    pub mail_from: String,

    /// To: address for event mail.
    pub mail_to: String,

    /// Minimum interval between outbound mail batches, process wide.
    pub mail_interval_secs: f64,

    /// SMTP server for the mail command environment.
    pub mail_smtp: Option<String>,

    /// Footer appended to every notification mail.
    pub mail_footer: Option<String>,

    /// Number of concurrent external commands.
    pub pool_size: usize,

    /// Default retry delays for event handlers.
    pub handler_retry_delays: Vec<f64>,

    /// Default polling interval when neither task nor platform sets one.
    pub polling_interval_secs: f64,

    /// Default upper bound on jobs per submission command.
    pub max_batch_submit_size: usize,

    /// Workflow run directory holding job log trees.
    pub run_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mail_from: "notifications@localhost".to_string(),
            mail_to: env::var("USER").unwrap_or_else(|_| "root".to_string()),
            mail_interval_secs: DEFAULT_MAIL_INTERVAL_SECS,
            mail_smtp: None,
            mail_footer: None,
            pool_size: num_cpus::get(),
            handler_retry_delays: vec![0.0],
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
            max_batch_submit_size: DEFAULT_MAX_BATCH_SUBMIT_SIZE,
            run_dir: "~/jobflow-run".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let mail_from = env::var("JOBFLOW_MAIL_FROM").unwrap_or(defaults.mail_from);
        let mail_to = env::var("JOBFLOW_MAIL_TO").unwrap_or(defaults.mail_to);
        let mail_interval_secs = env::var("JOBFLOW_MAIL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAIL_INTERVAL_SECS);
        let mail_smtp = env::var("JOBFLOW_MAIL_SMTP").ok();
        let mail_footer = env::var("JOBFLOW_MAIL_FOOTER").ok();

        let pool_size = env::var("JOBFLOW_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(num_cpus::get);

        let handler_retry_delays = env::var("JOBFLOW_HANDLER_RETRY_DELAYS")
            .ok()
            .map(|s| parse_delay_list(&s))
            .unwrap_or(defaults.handler_retry_delays);

        let polling_interval_secs = env::var("JOBFLOW_POLLING_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POLLING_INTERVAL_SECS);

        let max_batch_submit_size = env::var("JOBFLOW_MAX_BATCH_SUBMIT_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_BATCH_SUBMIT_SIZE);

        let run_dir = env::var("JOBFLOW_RUN_DIR").unwrap_or(defaults.run_dir);

        Ok(Self {
            mail_from,
            mail_to,
            mail_interval_secs,
            mail_smtp,
            mail_footer,
            pool_size,
            handler_retry_delays,
            polling_interval_secs,
            max_batch_submit_size,
            run_dir,
        })
    }
}

/// Parse a comma-separated list of delay seconds, skipping bad entries.
pub fn parse_delay_list(raw: &str) -> Vec<f64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<f64>().ok())
        .collect()
}
