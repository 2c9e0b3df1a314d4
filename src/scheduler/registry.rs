use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};
use crate::scheduler::job::{Job, JobId, JobStatus};
use crate::worker::WorkerId;

/// Progress a job reports as soon as it is handed to a worker.
pub const START_PROGRESS: u8 = 10;

/// Aggregate counters over the whole batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub timed_out: usize,
}

impl JobCounts {
    pub fn processed(&self) -> usize {
        self.completed + self.timed_out
    }

    /// Jobs that are not terminal yet.
    pub fn remaining(&self) -> usize {
        self.total - self.processed()
    }
}

/// Immutable copy of the registry, safe to hand to renderers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub jobs: Vec<Job>,
    pub counts: JobCounts,
}

/// Authoritative state for every job in the batch.
///
/// Only forward transitions are applied. Anything else (a late `Completed` for
/// a job that already timed out, a second terminal status, progress for a job
/// that is not running) is a no-op, so replayed or stale worker events cannot
/// corrupt the counters.
#[derive(Debug)]
pub struct TaskRegistry {
    jobs: Vec<Job>,
    completed: usize,
    timed_out: usize,
    in_progress: usize,
}

impl TaskRegistry {
    /// One pending job per payload, indexed in input order.
    pub fn create<I>(payloads: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let jobs: Vec<Job> = payloads
            .into_iter()
            .enumerate()
            .map(|(id, payload)| Job::new(id, payload))
            .collect();

        Self {
            jobs,
            completed: 0,
            timed_out: 0,
            in_progress: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: JobId) -> Result<&Job> {
        self.jobs.get(id).ok_or(BatchError::JobNotFound(id))
    }

    fn get_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(id).ok_or(BatchError::JobNotFound(id))
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus> {
        Ok(self.get(id)?.status)
    }

    /// Apply a status transition. Returns `Ok(false)` when the transition is
    /// not allowed from the job's current state and nothing changed.
    pub fn set_status(&mut self, id: JobId, status: JobStatus) -> Result<bool> {
        let now = Utc::now();
        let job = self.get_mut(id)?;
        if !job.status.can_transition_to(status) {
            return Ok(false);
        }

        job.status = status;
        match status {
            JobStatus::InProgress => {
                job.started_at = Some(now);
                job.progress = START_PROGRESS;
            }
            JobStatus::Completed => {
                job.finished_at = Some(now);
                job.progress = 100;
            }
            JobStatus::TimedOut => {
                job.finished_at = Some(now);
                job.progress = 0;
            }
            JobStatus::Pending => {}
        }

        match status {
            JobStatus::InProgress => self.in_progress += 1,
            JobStatus::Completed => {
                self.in_progress -= 1;
                self.completed += 1;
            }
            JobStatus::TimedOut => {
                self.in_progress -= 1;
                self.timed_out += 1;
            }
            JobStatus::Pending => {}
        }
        Ok(true)
    }

    /// Record the worker a job was bound to.
    pub fn bind_worker(&mut self, id: JobId, worker: WorkerId) -> Result<()> {
        self.get_mut(id)?.worker = Some(worker);
        Ok(())
    }

    /// Update progress of a running job. Returns `Ok(false)` if the job is not
    /// in progress or the value would move backwards.
    pub fn set_progress(&mut self, id: JobId, value: u8) -> Result<bool> {
        let job = self.get_mut(id)?;
        let value = value.min(100);
        if job.status != JobStatus::InProgress || value < job.progress {
            return Ok(false);
        }
        job.progress = value;
        Ok(true)
    }

    /// Attach an artifact name. For a job that already timed out the name is
    /// kept as a diagnostic note and the job itself is left untouched.
    pub fn record_artifact(&mut self, id: JobId, artifact: impl Into<String>) -> Result<()> {
        let job = self.get_mut(id)?;
        let artifact = artifact.into();
        match job.status {
            JobStatus::TimedOut => job.late_artifact = Some(artifact),
            _ => job.artifact = Some(artifact),
        }
        Ok(())
    }

    pub fn counts(&self) -> JobCounts {
        let total = self.jobs.len();
        JobCounts {
            total,
            pending: total - self.in_progress - self.completed - self.timed_out,
            in_progress: self.in_progress,
            completed: self.completed,
            timed_out: self.timed_out,
        }
    }

    /// Whether any job still needs a worker, either to start or to finish.
    pub fn has_unfinished(&self) -> bool {
        self.counts().remaining() > 0
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            taken_at: Utc::now(),
            jobs: self.jobs.clone(),
            counts: self.counts(),
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }
}
