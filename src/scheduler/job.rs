use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::WorkerId;

/// Stable 0-based index of a job in its batch.
pub type JobId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::TimedOut)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Completed)
                | (JobStatus::InProgress, JobStatus::TimedOut)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: String,
    pub status: JobStatus,
    pub progress: u8,
    pub worker: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact: Option<String>,
    /// Artifact reported after the job had already timed out. Diagnostic only.
    pub late_artifact: Option<String>,
}

impl Job {
    pub fn new(id: JobId, payload: String) -> Self {
        Self {
            id,
            payload,
            status: JobStatus::Pending,
            progress: 0,
            worker: None,
            started_at: None,
            finished_at: None,
            artifact: None,
            late_artifact: None,
        }
    }

    /// 1-based position, as used in artifact names and user-facing output.
    pub fn ordinal(&self) -> usize {
        self.id + 1
    }

    /// Elapsed run time: start to finish, or start to `now` while still running.
    pub fn duration_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or(now);
        Some((end - started).num_milliseconds().max(0))
    }
}
