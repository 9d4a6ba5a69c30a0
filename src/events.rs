//! Event-handler contexts, dispatch keys, and handler command templating.
//!
//! Every side effect the event dispatch table drives is one of three kinds:
//! a user-supplied command, a mail notification, or a remote log retrieval.
//! The composite [`EventKey`] makes registration idempotent per (handler
//! kind, event, job attempt).

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::task::TaskJob;

pub const HANDLER_CUSTOM: &str = "event-handler";
pub const HANDLER_MAIL: &str = "event-mail";
pub const HANDLER_JOB_LOGS_RETRIEVE: &str = "job-logs-retrieve";

pub const EVENT_STARTED: &str = "started";
pub const EVENT_SUCCEEDED: &str = "succeeded";
pub const EVENT_FAILED: &str = "failed";
pub const EVENT_RETRY: &str = "retry";
pub const EVENT_SUBMITTED: &str = "submitted";
pub const EVENT_SUBMIT_FAILED: &str = "submission failed";
pub const EVENT_SUBMIT_RETRY: &str = "submission retry";
pub const EVENT_EXECUTION_TIMEOUT: &str = "execution timeout";
pub const EVENT_SUBMISSION_TIMEOUT: &str = "submission timeout";

/// Identifies one registered handler action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    /// Handler kind, with a positional suffix for custom handlers
    /// (`event-handler-00`) so multiple templates do not collide.
    pub handler: String,
    /// Event name; non-unique events carry an occurrence suffix
    /// (`warning-2`).
    pub event: String,
    pub point: String,
    pub name: String,
    pub submit_num: u32,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{:02} ({}:{})",
            self.point, self.name, self.submit_num, self.handler, self.event
        )
    }
}

/// What kind of side effect a timer drives, with kind-specific payload.
/// Mail and log-retrieval timers sharing a context are coalesced into one
/// outbound command per dispatch tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerCtx {
    Custom {
        cmd: String,
    },
    Mail {
        from: String,
        to: String,
    },
    JobLogsRetrieve {
        platform: String,
        max_size: Option<String>,
    },
}

impl HandlerCtx {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerCtx::Custom { .. } => HANDLER_CUSTOM,
            HandlerCtx::Mail { .. } => HANDLER_MAIL,
            HandlerCtx::JobLogsRetrieve { .. } => HANDLER_JOB_LOGS_RETRIEVE,
        }
    }
}

/// Shell-quote a template value.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@'))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Workflow-level fields exposed to handler templates.
#[derive(Debug, Clone, Default)]
pub struct WorkflowInfo {
    pub name: String,
    /// Distinguishes this scheduler run from earlier runs of the same
    /// workflow in handler and mail output.
    pub uuid: String,
    pub host: String,
    pub port: Option<u16>,
    pub owner: String,
    pub meta: BTreeMap<String, String>,
}

impl WorkflowInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uuid: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }
}

/// Build the named-variable environment for one handler invocation.
pub fn handler_template_data(
    workflow: &WorkflowInfo,
    job: &TaskJob,
    event: &str,
    message: &str,
) -> BTreeMap<String, String> {
    let opt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "None".to_string())
    };
    let platform_name = job
        .summary
        .platforms_used
        .get(&job.submit_num)
        .cloned()
        .unwrap_or_default();
    let mut data = BTreeMap::new();
    data.insert("event".to_string(), quote(event));
    data.insert("workflow".to_string(), quote(&workflow.name));
    data.insert("workflow_uuid".to_string(), quote(&workflow.uuid));
    data.insert("point".to_string(), quote(&job.point));
    data.insert("name".to_string(), quote(&job.name));
    data.insert("id".to_string(), quote(&job.identity()));
    data.insert("submit_num".to_string(), job.submit_num.to_string());
    data.insert("try_num".to_string(), job.try_num().to_string());
    data.insert("message".to_string(), quote(message));
    data.insert(
        "job_id".to_string(),
        quote(job.summary.submit_method_id.as_deref().unwrap_or("None")),
    );
    data.insert(
        "job_runner_name".to_string(),
        quote(job.summary.job_runner_name.as_deref().unwrap_or("None")),
    );
    data.insert("platform_name".to_string(), quote(&platform_name));
    data.insert("submit_time".to_string(), quote(&opt_time(job.summary.submitted_time)));
    data.insert("start_time".to_string(), quote(&opt_time(job.summary.started_time)));
    data.insert("finish_time".to_string(), quote(&opt_time(job.summary.finished_time)));
    for (key, value) in &job.config.meta {
        data.insert(key.clone(), quote(value));
    }
    for (key, value) in &workflow.meta {
        data.insert(format!("workflow_{key}"), quote(value));
    }
    data
}

/// Substitute `%(name)s` template variables into a handler command.
///
/// Returns `Err` with the offending variable on an unknown name. A template
/// with no substitutions at all is assumed to use the classic interface and
/// gets the 4 positional arguments appended instead.
pub fn render_handler_command(
    template: &str,
    data: &BTreeMap<String, String>,
    workflow: &str,
    identity: &str,
    event: &str,
    message: &str,
) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut substituted = false;
    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find(")s") else {
            return Err(template[start..].to_string());
        };
        let key = &after[..end];
        match data.get(key) {
            Some(value) => out.push_str(value),
            None => return Err(key.to_string()),
        }
        substituted = true;
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    if !substituted {
        // Classic interface: <handler> <event> <workflow> <id> <message>
        out = format!(
            "{template} {} {} {} {}",
            quote(event),
            quote(workflow),
            quote(identity),
            quote(message)
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskConfig;

    fn job() -> TaskJob {
        let mut job = TaskJob::new("20260101T00", "fetch", TaskConfig::default());
        job.submit_num = 2;
        job
    }

    #[test]
    fn template_substitution_uses_named_variables() {
        let workflow = WorkflowInfo {
            name: "demo".into(),
            ..WorkflowInfo::default()
        };
        let data = handler_template_data(&workflow, &job(), "failed", "job failed");
        let cmd = render_handler_command(
            "notify.sh %(event)s %(point)s %(submit_num)s",
            &data,
            "demo",
            "20260101T00/fetch",
            "failed",
            "job failed",
        )
        .unwrap();
        assert_eq!(cmd, "notify.sh failed 20260101T00 2");
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let data = BTreeMap::new();
        let err = render_handler_command("x %(nope)s", &data, "w", "i", "e", "m").unwrap_err();
        assert_eq!(err, "nope");
    }

    #[test]
    fn no_substitution_falls_back_to_positional_args() {
        let data = BTreeMap::new();
        let cmd =
            render_handler_command("handler.sh", &data, "demo", "1/fetch", "failed", "job failed")
                .unwrap();
        assert_eq!(cmd, "handler.sh failed demo 1/fetch 'job failed'");
    }

    #[test]
    fn quote_wraps_unsafe_strings() {
        assert_eq!(quote("plain-value"), "plain-value");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote(""), "''");
    }
}
