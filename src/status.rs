use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::registry::{JobCounts, RegistrySnapshot};
use crate::scheduler::{JobId, JobStatus};
use crate::worker::{WorkerId, WorkerSlot};

/// Per-job row of a status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub payload: String,
    pub status: JobStatus,
    pub progress: u8,
    pub worker: Option<WorkerId>,
    pub duration_ms: Option<i64>,
    pub artifact: Option<String>,
}

/// Everything a renderer needs, detached from the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub run_id: Uuid,
    pub taken_at: DateTime<Utc>,
    pub jobs: Vec<JobView>,
    pub workers: Vec<WorkerSlot>,
    pub counts: JobCounts,
    /// Set on the final snapshot, after the batch completed.
    pub finished: bool,
}

impl StatusSnapshot {
    pub fn empty(run_id: Uuid) -> Self {
        Self {
            run_id,
            taken_at: Utc::now(),
            jobs: Vec::new(),
            workers: Vec::new(),
            counts: JobCounts::default(),
            finished: false,
        }
    }

    pub fn build(
        run_id: Uuid,
        registry: RegistrySnapshot,
        workers: Vec<WorkerSlot>,
        finished: bool,
    ) -> Self {
        let now = registry.taken_at;
        let jobs = registry
            .jobs
            .into_iter()
            .map(|job| JobView {
                duration_ms: job.duration_ms(now),
                id: job.id,
                payload: job.payload,
                status: job.status,
                progress: job.progress,
                worker: job.worker,
                artifact: job.artifact,
            })
            .collect();

        Self {
            run_id,
            taken_at: now,
            jobs,
            workers,
            counts: registry.counts,
            finished,
        }
    }
}

/// Consumer of status snapshots, e.g. a console table or a log line.
pub trait StatusSink: Send + Sync {
    fn render(&self, snapshot: &StatusSnapshot);
}

/// Logs one summary line per refresh.
#[derive(Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn render(&self, snapshot: &StatusSnapshot) {
        let busy = snapshot
            .workers
            .iter()
            .filter(|w| w.current_job.is_some())
            .count();
        tracing::info!(
            run_id = %snapshot.run_id,
            total = snapshot.counts.total,
            pending = snapshot.counts.pending,
            in_progress = snapshot.counts.in_progress,
            completed = snapshot.counts.completed,
            timed_out = snapshot.counts.timed_out,
            workers = snapshot.workers.len(),
            busy,
            finished = snapshot.finished,
            "Batch status"
        );
    }
}

/// Periodically renders the latest published snapshot.
pub struct StatusReporter;

impl StatusReporter {
    /// Render every `interval` until `stop` is cancelled, then render once more
    /// so the sink always sees the final state.
    pub fn spawn<S>(
        status: watch::Receiver<StatusSnapshot>,
        sink: Arc<S>,
        interval: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()>
    where
        S: StatusSink + ?Sized + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = status.borrow().clone();
                        sink.render(&snapshot);
                    }
                }
            }

            let snapshot = status.borrow().clone();
            sink.render(&snapshot);
        })
    }
}
