use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{SchedulerConfig, TimeoutPolicy};
use crate::error::{BatchError, Result};
use crate::manifest::ArtifactSink;
use crate::scheduler::job::{Job, JobId, JobStatus};
use crate::scheduler::monitor::CompletionMonitor;
use crate::scheduler::queue::PendingQueue;
use crate::scheduler::registry::{JobCounts, TaskRegistry};
use crate::status::{StatusReporter, StatusSink, StatusSnapshot};
use crate::worker::executor::JobExecutor;
use crate::worker::pool::WorkerPool;
use crate::worker::{JobAssignment, WorkerEvent, WorkerId, WorkerMessage};

/// Final state of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub counts: JobCounts,
    pub jobs: Vec<Job>,
    /// Worker units started over the run, replacements included.
    pub workers_spawned: usize,
}

/// Master coordination loop of a batch.
///
/// Owns the registry, the pending queue, the worker pool and the per-job
/// timers. Every state change happens on the task running [`Dispatcher::run`];
/// workers only reach it through the event channel.
pub struct Dispatcher<E: JobExecutor> {
    run_id: Uuid,
    config: SchedulerConfig,
    registry: TaskRegistry,
    queue: PendingQueue,
    pool: WorkerPool<E>,
    monitor: CompletionMonitor,
    timers: DelayQueue<JobId>,
    timer_keys: HashMap<JobId, delay_queue::Key>,
    events_rx: mpsc::Receiver<WorkerMessage>,
    status_tx: watch::Sender<StatusSnapshot>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
    refresh: CancellationToken,
    cancel: CancellationToken,
}

impl<E: JobExecutor> Dispatcher<E> {
    pub fn new(config: SchedulerConfig, payloads: Vec<String>, executor: Arc<E>) -> Result<Self> {
        config.validate()?;

        let run_id = Uuid::new_v4();
        let registry = TaskRegistry::create(payloads);
        let queue = PendingQueue::with_jobs(registry.len());
        let monitor = CompletionMonitor::new(registry.len());
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let pool = WorkerPool::new(executor, events_tx, config.concurrency);
        let (status_tx, _) = watch::channel(StatusSnapshot::empty(run_id));

        let dispatcher = Self {
            run_id,
            config,
            registry,
            queue,
            pool,
            monitor,
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            events_rx,
            status_tx,
            artifacts: None,
            refresh: CancellationToken::new(),
            cancel: CancellationToken::new(),
        };
        dispatcher.publish(false);
        Ok(dispatcher)
    }

    /// Hand every accepted `{job, artifact}` pair to `sink`.
    pub fn with_artifact_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.artifacts = Some(sink);
        self
    }

    /// Abort the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Latest status snapshot, updated after every handled event.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Render status into `sink` every `status_interval` until the batch
    /// completes, plus once with the final state.
    pub fn spawn_status_reporter(&self, sink: Arc<dyn StatusSink>) -> JoinHandle<()> {
        StatusReporter::spawn(
            self.subscribe(),
            sink,
            self.config.status_interval,
            self.refresh.clone(),
        )
    }

    /// Run the batch to completion.
    ///
    /// Only startup failures and external cancellation are returned as
    /// errors; job failures end up as `TimedOut` jobs in the report.
    pub async fn run(self) -> Result<BatchReport> {
        let span = tracing::info_span!("batch", run_id = %self.run_id);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) -> Result<BatchReport> {
        let total = self.registry.len();
        tracing::info!(
            jobs = total,
            concurrency = self.config.concurrency,
            timeout_secs = self.config.task_timeout.as_secs_f64(),
            policy = %self.config.timeout_policy,
            "Starting batch"
        );

        if self.check_completion() {
            return Ok(self.into_report());
        }

        if let Err(e) = self.pool.spawn_initial(total) {
            self.refresh.cancel();
            return Err(e);
        }
        self.publish(false);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::warn!("Batch cancelled, terminating workers");
                    self.pool.terminate_all();
                    self.publish(true);
                    self.refresh.cancel();
                    return Err(BatchError::Cancelled);
                }
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    let job_id = expired.into_inner();
                    self.timer_keys.remove(&job_id);
                    self.on_timeout(job_id);
                }
                message = self.events_rx.recv() => match message {
                    Some(message) => self.handle_event(message),
                    None => {
                        self.refresh.cancel();
                        return Err(BatchError::PoolExhausted("worker event channel closed".into()));
                    }
                },
            }

            if self.monitor.has_fired() {
                break;
            }
            self.publish(false);
        }

        Ok(self.into_report())
    }

    /// Route one worker event to its handler.
    fn handle_event(&mut self, message: WorkerMessage) {
        let WorkerMessage { worker_id, event } = message;
        match event {
            WorkerEvent::Ready => self.on_ready(worker_id),
            WorkerEvent::Status(text) => {
                if let Some(handle) = self.pool.get_mut(worker_id) {
                    handle.set_status(text);
                }
            }
            WorkerEvent::Progress { job_id, percent } => {
                match self.registry.set_progress(job_id, percent) {
                    Ok(true) => {
                        tracing::debug!(job_id, worker_id = %worker_id, percent, "Job progress")
                    }
                    Ok(false) => {
                        tracing::debug!(job_id, worker_id = %worker_id, percent, "Stale progress ignored")
                    }
                    Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "Progress for unknown job"),
                }
            }
            WorkerEvent::Completed { job_id, artifact } => {
                self.on_completed(worker_id, job_id, artifact)
            }
            WorkerEvent::Exited { code } => self.on_exit(worker_id, code),
        }
    }

    /// Bind the next pending job to `worker_id`. No-op when the queue is empty
    /// or the worker cannot take a job.
    pub fn assign(&mut self, worker_id: WorkerId) {
        let Some(handle) = self.pool.get_mut(worker_id) else {
            return;
        };
        if !handle.is_idle() {
            return;
        }
        let Some(job_id) = self.queue.pop() else {
            tracing::debug!(worker_id = %worker_id, "No pending jobs, worker stays idle");
            return;
        };

        if let Err(e) = self.registry.set_status(job_id, JobStatus::InProgress) {
            tracing::error!(job_id, error = %e, "Queued job missing from registry");
            return;
        }
        let payload = match self.registry.bind_worker(job_id, worker_id) {
            Ok(()) => self
                .registry
                .get(job_id)
                .map(|job| job.payload.clone())
                .unwrap_or_default(),
            Err(e) => {
                tracing::error!(job_id, error = %e, "Queued job missing from registry");
                return;
            }
        };

        let sent = handle.send(JobAssignment { job_id, payload });

        let key = self.timers.insert(job_id, self.config.task_timeout);
        self.timer_keys.insert(job_id, key);

        match sent {
            Ok(()) => tracing::info!(job_id, worker_id = %worker_id, "Job assigned"),
            Err(e) => {
                tracing::error!(
                    job_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Dispatch invariant violated, job left to time out"
                );
                self.replace_unusable(worker_id);
            }
        }
    }

    /// Retire a unit that refused a job. Its slot would otherwise stay idle
    /// with nothing left to trigger another assignment.
    fn replace_unusable(&mut self, worker_id: WorkerId) {
        self.pool.retire(worker_id);
        if self.queue.is_empty() {
            return;
        }
        match self.pool.spawn() {
            Ok(replacement) => tracing::warn!(
                worker_id = %worker_id,
                replacement = %replacement,
                "Unusable worker replaced"
            ),
            Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Failed to replace worker"),
        }
    }

    fn on_ready(&mut self, worker_id: WorkerId) {
        let Some(handle) = self.pool.get_mut(worker_id) else {
            tracing::debug!(worker_id = %worker_id, "Ready from retired worker ignored");
            return;
        };
        if handle.mark_ready() {
            tracing::debug!(worker_id = %worker_id, "Worker ready");
            self.assign(worker_id);
        }
    }

    fn on_completed(&mut self, worker_id: WorkerId, job_id: JobId, artifact: String) {
        match self.registry.status(job_id) {
            Ok(JobStatus::InProgress) => {
                self.disarm(job_id);
                if let Err(e) = self.registry.set_status(job_id, JobStatus::Completed) {
                    tracing::error!(job_id, error = %e, "Failed to mark job completed");
                }
                if let Err(e) = self.registry.record_artifact(job_id, artifact.clone()) {
                    tracing::error!(job_id, error = %e, "Failed to record artifact");
                }
                tracing::info!(job_id, worker_id = %worker_id, artifact = %artifact, "Job completed");

                if let Some(sink) = &self.artifacts {
                    sink.record(job_id, &artifact);
                }
                self.check_completion();
                self.release_and_assign(worker_id, job_id);
            }
            Ok(JobStatus::TimedOut) => {
                if let Err(e) = self.registry.record_artifact(job_id, artifact.clone()) {
                    tracing::error!(job_id, error = %e, "Failed to record late artifact");
                }
                tracing::warn!(
                    job_id,
                    worker_id = %worker_id,
                    artifact = %artifact,
                    "Late completion for timed-out job, status unchanged"
                );
                self.release_and_assign(worker_id, job_id);
            }
            Ok(status) => tracing::warn!(
                job_id,
                worker_id = %worker_id,
                status = %status,
                "Completion for job that is not running ignored"
            ),
            Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "Completion for unknown job"),
        }
    }

    fn on_timeout(&mut self, job_id: JobId) {
        if !matches!(self.registry.status(job_id), Ok(JobStatus::InProgress)) {
            return;
        }
        if let Err(e) = self.registry.set_status(job_id, JobStatus::TimedOut) {
            tracing::error!(job_id, error = %e, "Failed to mark job timed out");
            return;
        }
        let worker = self.registry.get(job_id).ok().and_then(|job| job.worker);
        tracing::warn!(
            job_id,
            worker_id = ?worker,
            timeout_secs = self.config.task_timeout.as_secs_f64(),
            "Job timed out"
        );

        if self.check_completion() {
            return;
        }

        let Some(worker_id) = worker else {
            return;
        };
        let still_bound = self
            .pool
            .get(worker_id)
            .is_some_and(|handle| handle.current_job() == Some(job_id));
        if !still_bound {
            return;
        }

        match self.config.timeout_policy {
            TimeoutPolicy::Reuse => self.release_and_assign(worker_id, job_id),
            TimeoutPolicy::Recycle => {
                self.pool.retire(worker_id);
                if self.queue.is_empty() {
                    return;
                }
                match self.pool.spawn() {
                    Ok(replacement) => tracing::info!(
                        worker_id = %worker_id,
                        replacement = %replacement,
                        "Timed-out worker recycled"
                    ),
                    Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Failed to recycle worker"),
                }
            }
        }
    }

    fn on_exit(&mut self, worker_id: WorkerId, code: i32) {
        let work_remains = self.registry.has_unfinished();
        let outcome = self.pool.handle_exit(worker_id, code, work_remains);
        if let Some(job_id) = outcome.orphaned_job {
            if matches!(self.registry.status(job_id), Ok(JobStatus::InProgress)) {
                tracing::warn!(job_id, worker_id = %worker_id, "Job lost with its worker, waiting for timeout");
            }
        }
    }

    /// Free the slot if it is still bound to `job_id` and give it more work.
    fn release_and_assign(&mut self, worker_id: WorkerId, job_id: JobId) {
        let Some(handle) = self.pool.get_mut(worker_id) else {
            return;
        };
        if handle.current_job() != Some(job_id) {
            return;
        }
        handle.release();
        self.assign(worker_id);
    }

    fn disarm(&mut self, job_id: JobId) {
        if let Some(key) = self.timer_keys.remove(&job_id) {
            self.timers.remove(&key);
        }
    }

    /// Run the completion check; on the first positive result, shut the batch
    /// down. Returns whether the batch is complete.
    fn check_completion(&mut self) -> bool {
        if self.monitor.check(&self.registry.counts()) {
            self.shutdown();
        }
        self.monitor.has_fired()
    }

    fn shutdown(&mut self) {
        let counts = self.registry.counts();
        self.timers.clear();
        self.timer_keys.clear();
        let terminated = self.pool.terminate_all();
        self.publish(true);
        self.refresh.cancel();
        tracing::info!(
            total = counts.total,
            completed = counts.completed,
            timed_out = counts.timed_out,
            workers_terminated = terminated,
            workers_spawned = self.pool.spawned_total(),
            "Batch finished"
        );
    }

    fn publish(&self, finished: bool) {
        let snapshot = StatusSnapshot::build(
            self.run_id,
            self.registry.snapshot(),
            self.pool.slots(),
            finished,
        );
        self.status_tx.send_replace(snapshot);
    }

    fn into_report(self) -> BatchReport {
        BatchReport {
            run_id: self.run_id,
            counts: self.registry.counts(),
            jobs: self.registry.jobs().to_vec(),
            workers_spawned: self.pool.spawned_total(),
        }
    }
}
