//! Jobflow - the job lifecycle core of a cycling workflow scheduler.
//!
//! Tasks become job submission attempts, attempts run on platforms, and the
//! platforms talk back through status messages, polls and event handlers.
//! The managers here own that loop: [`submission::JobMgr`] prepares and
//! dispatches jobs, [`event_manager::EventMgr`] validates and applies status
//! messages and drives event handlers, and [`poll_kill::PollKillMgr`] asks
//! platforms what really happened. All external work goes through a
//! [`pool::ProcessPool`] and resolves on later scheduler ticks, so job state
//! is only ever mutated from the single scheduling flow.

pub mod action_timer;
pub mod config;
pub mod error;
pub mod event_manager;
pub mod events;
pub mod message;
pub mod platform;
pub mod poll_kill;
pub mod pool;
pub mod remote;
pub mod store;
pub mod submission;
pub mod task;

pub use action_timer::{ActionTimer, TimerKind};
pub use config::Config;
pub use error::{PlatformError, ProtocolError, RemoteError, RET_CODE_UNREACHABLE};
pub use event_manager::{EventMgr, ProcessResult};
pub use events::{EventKey, HandlerCtx, WorkflowInfo};
pub use message::{MessageOrigin, Severity, TaskMessage};
pub use platform::{Platform, PlatformRegistry};
pub use poll_kill::{poll_decision, PollContext, PollKillMgr};
pub use pool::{
    CommandCtx, CommandOutcome, Pending, ProcessPool, ScriptedPool, SystemProcessPool,
};
pub use remote::{RemoteInitState, RemoteMgr, RemotePhase};
pub use store::{JobStore, MemoryStore, TaskEventRow};
pub use submission::JobMgr;
pub use task::{
    JobSummary, RunMode, TaskConfig, TaskJob, TaskJobId, TaskPool, TaskStatus, TryTimers,
};
