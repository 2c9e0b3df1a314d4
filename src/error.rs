use thiserror::Error;

use crate::scheduler::JobId;
use crate::worker::{WorkerId, WorkerLifecycle};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Worker {worker_id} is {lifecycle}, cannot accept job {job_id}")]
    Dispatch {
        worker_id: WorkerId,
        lifecycle: WorkerLifecycle,
        job_id: JobId,
    },

    #[error("Worker {0} is no longer running")]
    WorkerGone(WorkerId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Worker pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Job source error: {0}")]
    Source(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Batch run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BatchError>;
