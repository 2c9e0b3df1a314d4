use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::dispatcher::BatchReport;
use crate::scheduler::JobId;

/// Receives `{job, artifact}` for every completion the dispatcher accepts.
pub trait ArtifactSink: Send + Sync {
    fn record(&self, job_id: JobId, artifact: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub job_id: JobId,
    pub payload: String,
    pub artifact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    pub timed_out: usize,
    pub artifacts: Vec<ManifestEntry>,
}

/// Collects completed artifacts and writes them out as a JSON manifest.
#[derive(Debug, Default)]
pub struct ManifestWriter {
    entries: Mutex<Vec<(JobId, String)>>,
}

impl ManifestWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded pairs in job order.
    pub fn entries(&self) -> Vec<(JobId, String)> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn build(&self, report: &BatchReport) -> Manifest {
        let artifacts = self
            .entries()
            .into_iter()
            .map(|(job_id, artifact)| ManifestEntry {
                payload: report
                    .jobs
                    .get(job_id)
                    .map(|job| job.payload.clone())
                    .unwrap_or_default(),
                job_id,
                artifact,
            })
            .collect();

        Manifest {
            run_id: report.run_id,
            generated_at: Utc::now(),
            total: report.counts.total,
            completed: report.counts.completed,
            timed_out: report.counts.timed_out,
            artifacts,
        }
    }

    pub async fn write(&self, path: &Path, report: &BatchReport) -> Result<()> {
        let manifest = self.build(report);
        let json = serde_json::to_vec_pretty(&manifest)?;
        tokio::fs::write(path, json).await?;
        tracing::info!(
            path = %path.display(),
            artifacts = manifest.artifacts.len(),
            "Manifest written"
        );
        Ok(())
    }
}

impl ArtifactSink for ManifestWriter {
    fn record(&self, job_id: JobId, artifact: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((job_id, artifact.to_string()));
    }
}
