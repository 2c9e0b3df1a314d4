use crate::scheduler::registry::JobCounts;

/// Watches for the moment every job is terminal.
#[derive(Debug)]
pub struct CompletionMonitor {
    total: usize,
    fired: bool,
}

impl CompletionMonitor {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            fired: false,
        }
    }

    /// Returns `true` exactly once: the first time `completed + timed_out`
    /// reaches the batch size. Later calls return `false`.
    pub fn check(&mut self, counts: &JobCounts) -> bool {
        if self.fired || counts.processed() < self.total {
            return false;
        }
        self.fired = true;
        tracing::info!(
            total = self.total,
            completed = counts.completed,
            timed_out = counts.timed_out,
            "All jobs processed"
        );
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}
