//! Worker execution units.
//!
//! Each worker is a tokio task that runs at most one job at a time and only
//! talks to the dispatcher through messages:
//! - **Handle**: [`WorkerHandle`] sends jobs in and tracks the slot lifecycle
//! - **Pool**: [`WorkerPool`] spawns, respawns and tears down handles
//! - **Executor**: [`JobExecutor`] is the job logic run inside a unit
//!
//! # Event Flow
//!
//! 1. A fresh unit reports [`WorkerEvent::Ready`]
//! 2. The dispatcher sends a [`JobAssignment`] through the handle
//! 3. The executor reports `Status`/`Progress` events while it works
//! 4. The unit reports `Completed` with the artifact name and waits for more
//! 5. When the unit stops for any reason, a final `Exited` is delivered

use serde::{Deserialize, Serialize};

use crate::scheduler::JobId;

pub mod executor;
pub mod handle;
pub mod pool;

pub use executor::{artifact_name, CommandExecutor, ExecutorError, JobExecutor, ProgressReporter};
pub use handle::WorkerHandle;
pub use pool::{ExitOutcome, WorkerPool};

/// Exit code of a unit whose job channel was closed.
pub const EXIT_OK: i32 = 0;
/// Exit code of a unit whose executor returned an error.
pub const EXIT_EXECUTOR_FAILURE: i32 = 1;
/// Exit code of a unit whose executor panicked.
pub const EXIT_PANIC: i32 = 101;
/// Exit code of a unit aborted by the pool.
pub const EXIT_ABORTED: i32 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLifecycle {
    Starting,
    Idle,
    Busy,
    Exited,
}

impl std::fmt::Display for WorkerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerLifecycle::Starting => write!(f, "starting"),
            WorkerLifecycle::Idle => write!(f, "idle"),
            WorkerLifecycle::Busy => write!(f, "busy"),
            WorkerLifecycle::Exited => write!(f, "exited"),
        }
    }
}

/// Dispatcher-side record of one worker unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub worker_id: WorkerId,
    pub lifecycle: WorkerLifecycle,
    /// The only link between inbound events and the job they belong to.
    pub current_job: Option<JobId>,
    /// Last free-text status reported by the unit.
    pub status: String,
}

impl WorkerSlot {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            lifecycle: WorkerLifecycle::Starting,
            current_job: None,
            status: String::from("starting"),
        }
    }
}

/// A job as delivered to a worker unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAssignment {
    pub job_id: JobId,
    pub payload: String,
}

impl JobAssignment {
    /// 1-based position of the job in the batch.
    pub fn ordinal(&self) -> usize {
        self.job_id + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Ready,
    Status(String),
    Progress { job_id: JobId, percent: u8 },
    Completed { job_id: JobId, artifact: String },
    Exited { code: i32 },
}

/// Event tagged with the unit that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMessage {
    pub worker_id: WorkerId,
    pub event: WorkerEvent,
}
