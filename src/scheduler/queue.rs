use std::collections::VecDeque;

use crate::scheduler::job::JobId;

/// FIFO of jobs that have not been handed to a worker yet.
///
/// Jobs leave the queue exactly once; nothing is ever pushed back.
#[derive(Debug, Default)]
pub struct PendingQueue {
    jobs: VecDeque<JobId>,
}

impl PendingQueue {
    /// Queue ids `0..count` in input order.
    pub fn with_jobs(count: usize) -> Self {
        Self {
            jobs: (0..count).collect(),
        }
    }

    pub fn pop(&mut self) -> Option<JobId> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
