use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;

use crate::error::{BatchError, Result};
use crate::scheduler::JobId;
use crate::worker::executor::{JobExecutor, ProgressReporter};
use crate::worker::{
    JobAssignment, WorkerEvent, WorkerId, WorkerLifecycle, WorkerMessage, WorkerSlot,
    EXIT_ABORTED, EXIT_EXECUTOR_FAILURE, EXIT_OK, EXIT_PANIC,
};

/// Dispatcher-side handle to one running worker unit.
#[derive(Debug)]
pub struct WorkerHandle {
    slot: WorkerSlot,
    jobs_tx: mpsc::Sender<JobAssignment>,
    abort: AbortHandle,
}

impl WorkerHandle {
    /// Start a new unit. It reports `Ready` once it is able to take a job and
    /// always finishes with a single `Exited` event.
    pub fn spawn<E: JobExecutor>(
        worker_id: WorkerId,
        executor: Arc<E>,
        events: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        // One buffered job: a slot reused after a timeout can be handed the next
        // job while the unit is still busy with the stale one.
        let (jobs_tx, jobs_rx) = mpsc::channel(1);

        let unit = tokio::spawn(run_unit(worker_id, executor, jobs_rx, events.clone()));
        let abort = unit.abort_handle();

        tokio::spawn(async move {
            let code = match unit.await {
                Ok(code) => code,
                Err(e) if e.is_panic() => {
                    tracing::error!(worker_id = %worker_id, "Worker panicked");
                    EXIT_PANIC
                }
                Err(_) => EXIT_ABORTED,
            };
            let _ = events
                .send(WorkerMessage {
                    worker_id,
                    event: WorkerEvent::Exited { code },
                })
                .await;
        });

        tracing::debug!(worker_id = %worker_id, "Worker spawned");

        Self {
            slot: WorkerSlot::new(worker_id),
            jobs_tx,
            abort,
        }
    }

    pub fn slot(&self) -> &WorkerSlot {
        &self.slot
    }

    pub fn lifecycle(&self) -> WorkerLifecycle {
        self.slot.lifecycle
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.slot.current_job
    }

    pub fn is_idle(&self) -> bool {
        self.slot.lifecycle == WorkerLifecycle::Idle
    }

    /// `Starting → Idle`. Returns false for any other lifecycle.
    pub fn mark_ready(&mut self) -> bool {
        if self.slot.lifecycle != WorkerLifecycle::Starting {
            return false;
        }
        self.slot.lifecycle = WorkerLifecycle::Idle;
        self.slot.status = String::from("idle");
        true
    }

    /// Deliver a job to the unit and bind it to this slot.
    pub fn send(&mut self, job: JobAssignment) -> Result<()> {
        let job_id = job.job_id;
        if self.slot.lifecycle != WorkerLifecycle::Idle {
            return Err(BatchError::Dispatch {
                worker_id: self.slot.worker_id,
                lifecycle: self.slot.lifecycle,
                job_id,
            });
        }

        match self.jobs_tx.try_send(job) {
            Ok(()) => {}
            // The slot says idle but the unit still holds an undelivered job.
            Err(TrySendError::Full(_)) => {
                return Err(BatchError::Dispatch {
                    worker_id: self.slot.worker_id,
                    lifecycle: WorkerLifecycle::Busy,
                    job_id,
                })
            }
            Err(TrySendError::Closed(_)) => {
                return Err(BatchError::WorkerGone(self.slot.worker_id));
            }
        }

        self.slot.lifecycle = WorkerLifecycle::Busy;
        self.slot.current_job = Some(job_id);
        Ok(())
    }

    /// Unbind the current job and make the slot idle again.
    pub fn release(&mut self) -> Option<JobId> {
        if self.slot.lifecycle == WorkerLifecycle::Busy {
            self.slot.lifecycle = WorkerLifecycle::Idle;
        }
        self.slot.current_job.take()
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.slot.status = status.into();
    }

    /// Abort the unit, abandoning whatever it is running.
    pub fn terminate(&mut self) {
        self.abort.abort();
        self.slot.lifecycle = WorkerLifecycle::Exited;
        self.slot.status = String::from("terminated");
    }
}

async fn run_unit<E: JobExecutor>(
    worker_id: WorkerId,
    executor: Arc<E>,
    mut jobs: mpsc::Receiver<JobAssignment>,
    events: mpsc::Sender<WorkerMessage>,
) -> i32 {
    let ready = WorkerMessage {
        worker_id,
        event: WorkerEvent::Ready,
    };
    if events.send(ready).await.is_err() {
        return EXIT_OK;
    }

    while let Some(job) = jobs.recv().await {
        let reporter = ProgressReporter::new(worker_id, job.job_id, events.clone());
        match executor.execute(&job, &reporter).await {
            Ok(artifact) => {
                let completed = WorkerMessage {
                    worker_id,
                    event: WorkerEvent::Completed {
                        job_id: job.job_id,
                        artifact,
                    },
                };
                if events.send(completed).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(
                    worker_id = %worker_id,
                    job_id = job.job_id,
                    error = %e,
                    "Job executor failed, worker exiting"
                );
                return EXIT_EXECUTOR_FAILURE;
            }
        }
    }

    EXIT_OK
}
