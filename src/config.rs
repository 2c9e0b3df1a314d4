use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STATUS_INTERVAL_MS: u64 = 1000;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// What the dispatcher does with a worker whose job hit the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Abort the worker unit and spawn a fresh one before handing out more work.
    #[default]
    Recycle,
    /// Mark the slot idle and hand it the next job immediately, even though the
    /// stale job may still be running inside the unit.
    Reuse,
}

impl std::fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPolicy::Recycle => write!(f, "recycle"),
            TimeoutPolicy::Reuse => write!(f, "reuse"),
        }
    }
}

/// Host parallelism, falling back to a single worker when it cannot be queried.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration for the dispatcher and its worker pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time budget for a single job, measured from assignment.
    pub task_timeout: Duration,
    /// Maximum number of live worker units.
    pub concurrency: usize,
    /// Cadence of the status refresh.
    pub status_interval: Duration,
    pub timeout_policy: TimeoutPolicy,
    /// Capacity of the worker → master event channel.
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            concurrency: default_concurrency(),
            status_interval: Duration::from_millis(DEFAULT_STATUS_INTERVAL_MS),
            timeout_policy: TimeoutPolicy::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SchedulerConfig {
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.task_timeout.is_zero() {
            return Err(BatchError::Config("task timeout must be non-zero".into()));
        }
        if self.status_interval.is_zero() {
            return Err(BatchError::Config(
                "status interval must be non-zero".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(BatchError::Config("event buffer must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration for the shell-command job executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Command template run with `sh -c`. `{payload}`, `{output}` and
    /// `{index}` are substituted before execution.
    pub command: String,
    /// Directory artifacts are written into.
    pub output_dir: PathBuf,
    /// Artifact file extension, without the dot.
    pub extension: String,
    /// Pause after the command finishes before the artifact is checked.
    pub settle_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "chromium --headless --disable-gpu --print-to-pdf={output} {payload}"
                .to_string(),
            output_dir: PathBuf::from("output"),
            extension: "pdf".to_string(),
            settle_delay: Duration::from_millis(2000),
        }
    }
}

impl ExecutorConfig {
    pub fn new(command: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}
