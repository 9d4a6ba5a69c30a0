//! Fire-and-forget persistence and live-state projection contract.
//!
//! The real datastore (and its write queue) lives outside this core. The
//! managers emit rows and deltas through this trait and never wait on, or
//! read back from, the store. The in-memory implementation records
//! everything, which also makes it the assertion surface for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::task::{TaskJobId, TaskStatus};

/// Convenience constructor for job row maps.
pub fn row(pairs: Vec<(&str, Value)>) -> HashMap<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// One recorded task event (retry, handler event, signal, ...).
#[derive(Debug, Clone)]
pub struct TaskEventRow {
    pub job: TaskJobId,
    pub time: DateTime<Utc>,
    pub event: String,
    pub message: String,
}

pub trait JobStore: Send + Sync {
    /// Insert or update the job row for a submission attempt.
    fn insert_task_job(&self, job: &TaskJobId, row: HashMap<String, Value>);
    fn update_task_job(&self, job: &TaskJobId, row: HashMap<String, Value>);
    fn insert_task_event(&self, event: TaskEventRow);
    fn update_task_outputs(&self, job: &TaskJobId, outputs: Vec<String>);

    /// Live-projection deltas.
    fn delta_job_msg(&self, job: &TaskJobId, msg: &str);
    fn delta_job_state(&self, job: &TaskJobId, status: TaskStatus);
    fn delta_job_time(&self, job: &TaskJobId, kind: &str, time: DateTime<Utc>);
    fn delta_task_state(&self, job: &TaskJobId, status: TaskStatus);
    fn delta_task_held(&self, job: &TaskJobId, held: bool);

    /// Append a line to the per-job activity record.
    fn log_activity(&self, job: &TaskJobId, line: &str);
}

/// Recording store; default collaborator for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    pub job_rows: Mutex<Vec<(TaskJobId, HashMap<String, Value>)>>,
    pub job_updates: Mutex<Vec<(TaskJobId, HashMap<String, Value>)>>,
    pub events: Mutex<Vec<TaskEventRow>>,
    pub outputs: Mutex<Vec<(TaskJobId, Vec<String>)>>,
    pub job_msgs: Mutex<Vec<(TaskJobId, String)>>,
    pub job_states: Mutex<Vec<(TaskJobId, TaskStatus)>>,
    pub task_states: Mutex<Vec<(TaskJobId, TaskStatus)>>,
    pub activity: Mutex<Vec<(TaskJobId, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_named(&self, event: &str) -> Vec<TaskEventRow> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.event == event)
            .cloned()
            .collect()
    }

    pub fn last_job_msg(&self, job: &TaskJobId) -> Option<String> {
        self.job_msgs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == job)
            .map(|(_, msg)| msg.clone())
    }
}

impl JobStore for MemoryStore {
    fn insert_task_job(&self, job: &TaskJobId, row: HashMap<String, Value>) {
        self.job_rows.lock().unwrap().push((job.clone(), row));
    }

    fn update_task_job(&self, job: &TaskJobId, row: HashMap<String, Value>) {
        self.job_updates.lock().unwrap().push((job.clone(), row));
    }

    fn insert_task_event(&self, event: TaskEventRow) {
        self.events.lock().unwrap().push(event);
    }

    fn update_task_outputs(&self, job: &TaskJobId, outputs: Vec<String>) {
        self.outputs.lock().unwrap().push((job.clone(), outputs));
    }

    fn delta_job_msg(&self, job: &TaskJobId, msg: &str) {
        self.job_msgs.lock().unwrap().push((job.clone(), msg.to_string()));
    }

    fn delta_job_state(&self, job: &TaskJobId, status: TaskStatus) {
        self.job_states.lock().unwrap().push((job.clone(), status));
    }

    fn delta_job_time(&self, _job: &TaskJobId, _kind: &str, _time: DateTime<Utc>) {}

    fn delta_task_state(&self, job: &TaskJobId, status: TaskStatus) {
        self.task_states.lock().unwrap().push((job.clone(), status));
    }

    fn delta_task_held(&self, _job: &TaskJobId, _held: bool) {}

    fn log_activity(&self, job: &TaskJobId, line: &str) {
        self.activity.lock().unwrap().push((job.clone(), line.to_string()));
    }
}
