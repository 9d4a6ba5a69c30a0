//! Job status wire messages.
//!
//! Messages arrive as plain text, either emitted by a running job, returned
//! by a poll, or synthesized internally. The canonical strings are fixed by
//! the job wrapper protocol; signal/abort/vacate carry a payload after a
//! fixed prefix, and anything else is matched against task-configured custom
//! output names.

use serde::{Deserialize, Serialize};

pub const MSG_SUBMITTED: &str = "submitted";
pub const MSG_STARTED: &str = "started";
pub const MSG_SUCCEEDED: &str = "succeeded";
pub const MSG_FAILED: &str = "failed";
pub const MSG_SUBMIT_FAILED: &str = "submission failed";
pub const SIGNAL_PREFIX: &str = "signal/";
pub const ABORT_PREFIX: &str = "aborted/";
pub const VACATED_PREFIX: &str = "vacated/";

/// Where a message came from. Received messages are fenced by submit number
/// and may request a confirmation poll; polled messages are always believed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    Internal,
    Received,
    Polled,
}

impl MessageOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageOrigin::Internal => "(internal)",
            MessageOrigin::Received => "(received)",
            MessageOrigin::Polled => "(polled)",
        }
    }
}

/// Message severity, mirroring logging levels. Warning/critical/custom are
/// the "non-unique" kinds that may recur within one job attempt and get
/// occurrence-numbered handler keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Critical,
    Custom,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Custom => "custom",
        }
    }

    /// Kinds whose repeated occurrences need distinct handler-dispatch keys.
    pub fn is_non_unique(self) -> bool {
        matches!(self, Severity::Warning | Severity::Critical | Severity::Custom)
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Severity::Debug,
            "warning" | "warn" => Severity::Warning,
            "critical" | "error" => Severity::Critical,
            "custom" => Severity::Custom,
            _ => Severity::Info,
        }
    }
}

/// The closed set of job status messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMessage {
    Submitted,
    Started,
    Succeeded,
    Failed,
    SubmitFailed,
    /// Job terminated by a signal, e.g. `signal/SIGTERM`.
    Signal(String),
    /// Job aborted itself with a message, e.g. `aborted/assertion`.
    Abort(String),
    /// Job pre-empted by its execution environment, e.g. `vacated/PREEMPT`.
    Vacated(String),
    /// Anything else: custom output names and free-form progress messages.
    Other(String),
}

impl TaskMessage {
    pub fn parse(raw: &str) -> Self {
        match raw {
            MSG_SUBMITTED => TaskMessage::Submitted,
            MSG_STARTED => TaskMessage::Started,
            MSG_SUCCEEDED => TaskMessage::Succeeded,
            MSG_FAILED => TaskMessage::Failed,
            MSG_SUBMIT_FAILED => TaskMessage::SubmitFailed,
            _ => {
                if let Some(rest) = raw.strip_prefix(SIGNAL_PREFIX) {
                    TaskMessage::Signal(rest.to_string())
                } else if let Some(rest) = raw.strip_prefix(ABORT_PREFIX) {
                    TaskMessage::Abort(rest.to_string())
                } else if let Some(rest) = raw.strip_prefix(VACATED_PREFIX) {
                    TaskMessage::Vacated(rest.to_string())
                } else {
                    TaskMessage::Other(raw.to_string())
                }
            }
        }
    }

    pub fn as_wire(&self) -> String {
        match self {
            TaskMessage::Submitted => MSG_SUBMITTED.to_string(),
            TaskMessage::Started => MSG_STARTED.to_string(),
            TaskMessage::Succeeded => MSG_SUCCEEDED.to_string(),
            TaskMessage::Failed => MSG_FAILED.to_string(),
            TaskMessage::SubmitFailed => MSG_SUBMIT_FAILED.to_string(),
            TaskMessage::Signal(s) => format!("{SIGNAL_PREFIX}{s}"),
            TaskMessage::Abort(s) => format!("{ABORT_PREFIX}{s}"),
            TaskMessage::Vacated(s) => format!("{VACATED_PREFIX}{s}"),
            TaskMessage::Other(s) => s.clone(),
        }
    }

    /// The output name this message satisfies, with any payload stripped
    /// (`failed` for `signal/TERM`, the raw string for custom outputs).
    pub fn output_name(&self) -> &str {
        match self {
            TaskMessage::Submitted => MSG_SUBMITTED,
            TaskMessage::Started => MSG_STARTED,
            TaskMessage::Succeeded => MSG_SUCCEEDED,
            TaskMessage::Failed | TaskMessage::Signal(_) | TaskMessage::Abort(_) => MSG_FAILED,
            TaskMessage::SubmitFailed => MSG_SUBMIT_FAILED,
            TaskMessage::Vacated(_) => "",
            TaskMessage::Other(s) => s,
        }
    }

    /// True for messages that can arrive before `started` has been observed
    /// without implying the start was missed.
    pub fn precedes_start(&self) -> bool {
        matches!(
            self,
            TaskMessage::Submitted | TaskMessage::SubmitFailed | TaskMessage::Started
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_strings_round_trip() {
        for raw in [MSG_SUBMITTED, MSG_STARTED, MSG_SUCCEEDED, MSG_FAILED, MSG_SUBMIT_FAILED] {
            assert_eq!(TaskMessage::parse(raw).as_wire(), raw);
        }
    }

    #[test]
    fn prefixed_forms_carry_payload() {
        assert_eq!(
            TaskMessage::parse("signal/SIGKILL"),
            TaskMessage::Signal("SIGKILL".into())
        );
        assert_eq!(
            TaskMessage::parse("aborted/bad input"),
            TaskMessage::Abort("bad input".into())
        );
        assert_eq!(
            TaskMessage::parse("vacated/PREEMPT"),
            TaskMessage::Vacated("PREEMPT".into())
        );
    }

    #[test]
    fn signal_and_abort_satisfy_failed_output() {
        assert_eq!(TaskMessage::parse("signal/TERM").output_name(), MSG_FAILED);
        assert_eq!(TaskMessage::parse("aborted/x").output_name(), MSG_FAILED);
    }

    #[test]
    fn unknown_strings_become_other() {
        let msg = TaskMessage::parse("checkpoint ready");
        assert_eq!(msg, TaskMessage::Other("checkpoint ready".into()));
        assert_eq!(msg.output_name(), "checkpoint ready");
    }

    #[test]
    fn severity_non_unique_set() {
        assert!(Severity::Warning.is_non_unique());
        assert!(Severity::Critical.is_non_unique());
        assert!(Severity::Custom.is_non_unique());
        assert!(!Severity::Info.is_non_unique());
    }
}
