pub mod dispatcher;
pub mod job;
pub mod monitor;
pub mod queue;
pub mod registry;

pub use dispatcher::{BatchReport, Dispatcher};
pub use job::{Job, JobId, JobStatus};
pub use monitor::CompletionMonitor;
pub use queue::PendingQueue;
pub use registry::{JobCounts, RegistrySnapshot, TaskRegistry};
