use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{BatchError, Result};
use crate::scheduler::JobId;
use crate::worker::executor::JobExecutor;
use crate::worker::handle::WorkerHandle;
use crate::worker::{WorkerId, WorkerMessage, WorkerSlot, EXIT_OK};

/// What happened when a unit's `Exited` event was processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Job the unit was bound to when it exited.
    pub orphaned_job: Option<JobId>,
    /// Replacement unit, if one was spawned.
    pub replacement: Option<WorkerId>,
}

/// Owns the live worker units and enforces the concurrency bound.
#[derive(Debug)]
pub struct WorkerPool<E: JobExecutor> {
    executor: Arc<E>,
    events: mpsc::Sender<WorkerMessage>,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    max_workers: usize,
    next_id: u64,
    spawned_total: usize,
}

impl<E: JobExecutor> WorkerPool<E> {
    pub fn new(executor: Arc<E>, events: mpsc::Sender<WorkerMessage>, max_workers: usize) -> Self {
        Self {
            executor,
            events,
            workers: BTreeMap::new(),
            max_workers,
            next_id: 1,
            spawned_total: 0,
        }
    }

    /// Spawn `min(max_workers, job_count)` units.
    pub fn spawn_initial(&mut self, job_count: usize) -> Result<usize> {
        let target = self.max_workers.min(job_count);
        if job_count > 0 && target == 0 {
            return Err(BatchError::PoolExhausted(
                "concurrency bound is zero, no worker can be spawned".into(),
            ));
        }
        for _ in 0..target {
            self.spawn()?;
        }
        tracing::info!(workers = target, "Worker pool started");
        Ok(target)
    }

    /// Start one more unit if the bound allows it.
    pub fn spawn(&mut self) -> Result<WorkerId> {
        if self.workers.len() >= self.max_workers {
            return Err(BatchError::PoolExhausted(format!(
                "all {} worker slots are in use",
                self.max_workers
            )));
        }

        let worker_id = WorkerId(self.next_id);
        self.next_id += 1;
        let handle = WorkerHandle::spawn(worker_id, Arc::clone(&self.executor), self.events.clone());
        self.workers.insert(worker_id, handle);
        self.spawned_total += 1;
        Ok(worker_id)
    }

    /// Forget an exited unit and, if work remains, start exactly one
    /// replacement. Exit events for units already retired are ignored.
    pub fn handle_exit(&mut self, worker_id: WorkerId, code: i32, work_remains: bool) -> ExitOutcome {
        let Some(handle) = self.workers.remove(&worker_id) else {
            tracing::debug!(worker_id = %worker_id, code, "Exit from retired worker ignored");
            return ExitOutcome::default();
        };

        let orphaned_job = handle.current_job();
        if code == EXIT_OK {
            tracing::info!(worker_id = %worker_id, "Worker exited");
        } else {
            tracing::warn!(worker_id = %worker_id, code, job_id = ?orphaned_job, "Worker crashed");
        }

        if !work_remains {
            tracing::info!(worker_id = %worker_id, "No work remains, not respawning");
            return ExitOutcome {
                orphaned_job,
                replacement: None,
            };
        }

        let replacement = match self.spawn() {
            Ok(id) => {
                tracing::info!(worker_id = %worker_id, replacement = %id, "Replacement worker spawned");
                Some(id)
            }
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "Failed to spawn replacement worker");
                None
            }
        };

        ExitOutcome {
            orphaned_job,
            replacement,
        }
    }

    /// Abort a unit and drop its slot. Its eventual `Exited` event is ignored.
    pub fn retire(&mut self, worker_id: WorkerId) -> Option<WorkerHandle> {
        let mut handle = self.workers.remove(&worker_id)?;
        handle.terminate();
        tracing::debug!(worker_id = %worker_id, "Worker retired");
        Some(handle)
    }

    /// Abort every unit, busy or not. Returns how many were terminated.
    pub fn terminate_all(&mut self) -> usize {
        let count = self.workers.len();
        for handle in self.workers.values_mut() {
            handle.terminate();
        }
        self.workers.clear();
        if count > 0 {
            tracing::info!(workers = count, "Worker pool terminated");
        }
        count
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&worker_id)
    }

    pub fn get_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(&worker_id)
    }

    pub fn slots(&self) -> Vec<WorkerSlot> {
        self.workers.values().map(|h| h.slot().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Units started over the pool's lifetime, replacements included.
    pub fn spawned_total(&self) -> usize {
        self.spawned_total
    }
}
