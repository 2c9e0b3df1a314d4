pub mod config;
pub mod dashboard;
pub mod error;
pub mod manifest;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod status;
pub mod worker;

pub use config::{ExecutorConfig, SchedulerConfig, TimeoutPolicy};
pub use error::{BatchError, Result};
pub use scheduler::{BatchReport, Dispatcher};
