use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::ExecutorConfig;
use crate::scheduler::JobId;
use crate::worker::{JobAssignment, WorkerEvent, WorkerId, WorkerMessage};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to launch job command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Job command exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Artifact was not produced: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("{0}")]
    Other(String),
}

/// Runs one job inside a worker unit.
///
/// Implementations report milestones through the [`ProgressReporter`] and
/// return the artifact name. An error ends the worker unit; the dispatcher
/// only ever sees it as a worker exit.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        job: &JobAssignment,
        progress: &ProgressReporter,
    ) -> Result<String, ExecutorError>;
}

/// Sends `Status` and `Progress` events for the job a unit is running.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    worker_id: WorkerId,
    job_id: JobId,
    events: mpsc::Sender<WorkerMessage>,
}

impl ProgressReporter {
    pub fn new(worker_id: WorkerId, job_id: JobId, events: mpsc::Sender<WorkerMessage>) -> Self {
        Self {
            worker_id,
            job_id,
            events,
        }
    }

    pub async fn progress(&self, percent: u8) {
        self.emit(WorkerEvent::Progress {
            job_id: self.job_id,
            percent,
        })
        .await;
    }

    pub async fn status(&self, text: impl Into<String>) {
        self.emit(WorkerEvent::Status(text.into())).await;
    }

    async fn emit(&self, event: WorkerEvent) {
        // A closed channel means the dispatcher is gone; the job result is moot.
        let _ = self
            .events
            .send(WorkerMessage {
                worker_id: self.worker_id,
                event,
            })
            .await;
    }
}

/// `MMDD-NN.<ext>` built from `date` and the 1-based job ordinal.
pub fn artifact_name(date: NaiveDate, ordinal: usize, extension: &str) -> String {
    format!(
        "{:02}{:02}-{:02}.{}",
        date.month(),
        date.day(),
        ordinal,
        extension
    )
}

/// Single-quote a value for `sh -c`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Executes jobs by running a shell command template per payload.
///
/// Progress milestones:
/// - 10: job received
/// - 30: command launched
/// - 50: command finished successfully
/// - 70: settle delay elapsed
/// - 90: artifact present on disk
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Substitute the placeholders of the command template for one job.
    pub fn render_command(&self, job: &JobAssignment, output: &Path) -> String {
        self.config
            .command
            .replace("{payload}", &shell_quote(&job.payload))
            .replace("{output}", &shell_quote(&output.to_string_lossy()))
            .replace("{index}", &job.ordinal().to_string())
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(
        &self,
        job: &JobAssignment,
        progress: &ProgressReporter,
    ) -> Result<String, ExecutorError> {
        let ordinal = job.ordinal();
        let artifact = artifact_name(Local::now().date_naive(), ordinal, &self.config.extension);
        let output_path = self.config.output_dir.join(&artifact);

        tracing::info!(job_id = job.job_id, payload = %job.payload, artifact = %artifact, "Executing job");
        progress.status(format!("job {}: starting", ordinal)).await;
        progress.progress(10).await;

        let command = self.render_command(job, &output_path);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        progress.status(format!("job {}: loading", ordinal)).await;
        progress.progress(30).await;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ExecutorError::Failed {
                code: output.status.code(),
                stderr,
            });
        }

        progress.status(format!("job {}: rendered", ordinal)).await;
        progress.progress(50).await;

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        progress.status(format!("job {}: settled", ordinal)).await;
        progress.progress(70).await;

        if tokio::fs::metadata(&output_path).await.is_err() {
            return Err(ExecutorError::MissingArtifact(output_path));
        }
        progress.status(format!("job {}: generated {}", ordinal, artifact)).await;
        progress.progress(90).await;

        Ok(artifact)
    }
}
