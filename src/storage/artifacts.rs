//! On-disk run artifacts.
//!
//! A run directory holds `summary.json` and one sub-directory per attempt
//! with the prompt, the model response, the extracted patch and the eval
//! logs. The runs root additionally carries `latest_summary.json` and one
//! `<task_id>_latest.json` per task holding its best attempt so far.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::runner::{Attempt, AttemptKey, AttemptStatus, RunSummary};
use crate::utils::validate_task_id;

/// Summary file inside each run directory.
pub const SUMMARY_FILE: &str = "summary.json";

/// Copy of the most recent summary at the runs root.
pub const LATEST_SUMMARY_FILE: &str = "latest_summary.json";

/// Suffix of the per-task best attempt file at the runs root.
pub const TASK_LATEST_SUFFIX: &str = "_latest.json";

/// Errors that can occur while writing run artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),
}

/// Generate a run id such as `run_20260101T120000Z_a1b2c3`.
pub fn generate_run_id(timestamp: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", timestamp.format("%Y%m%dT%H%M%SZ"), &suffix[..6])
}

/// Directory owned by one run.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    runs_root: PathBuf,
    path: PathBuf,
    // Serializes read-compare-write of the per-task latest files.
    latest_lock: Arc<Mutex<()>>,
}

impl RunDirectory {
    /// Create `<runs_root>/<run_id>`.
    pub async fn create(runs_root: &Path, run_id: &str) -> Result<Self, ArtifactError> {
        validate_task_id(run_id).map_err(|_| ArtifactError::InvalidRunId(run_id.to_string()))?;
        let path = runs_root.join(run_id);
        fs::create_dir_all(&path).await?;
        Ok(Self {
            runs_root: runs_root.to_path_buf(),
            path,
            latest_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writer for one attempt's files.
    pub fn attempt_writer(&self, key: &AttemptKey) -> ArtifactWriter {
        let rel_dir = key.dir_name();
        ArtifactWriter {
            dir: self.path.join(&rel_dir),
            rel_dir,
        }
    }

    /// Write `summary.json` and refresh `latest_summary.json`.
    ///
    /// Returns the path of the run's summary file.
    pub async fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf, ArtifactError> {
        let json = serde_json::to_string_pretty(summary)?;
        let summary_path = self.path.join(SUMMARY_FILE);
        write_file(&summary_path, json.as_bytes()).await?;
        write_file(&self.runs_root.join(LATEST_SUMMARY_FILE), json.as_bytes()).await?;
        tracing::debug!(path = %summary_path.display(), "Wrote run summary");
        Ok(summary_path)
    }

    /// Record `attempt` as its task's latest result unless a better one is
    /// already on file.
    ///
    /// Pass outranks fail, which outranks error. Ties overwrite. An
    /// unreadable existing file is replaced. Returns whether the file was
    /// written.
    pub async fn update_task_latest(&self, attempt: &Attempt) -> Result<bool, ArtifactError> {
        let _guard = self.latest_lock.lock().await;
        let path = self.task_latest_path(&attempt.key.task_id);

        if let Ok(raw) = fs::read_to_string(&path).await {
            if let Ok(existing) = serde_json::from_str::<serde_json::Value>(&raw) {
                let current = existing
                    .get("status")
                    .cloned()
                    .and_then(|status| serde_json::from_value::<AttemptStatus>(status).ok())
                    .map_or(-1, status_rank);
                if current > status_rank(attempt.status) {
                    tracing::debug!(task_id = %attempt.key.task_id, "Keeping better latest attempt");
                    return Ok(false);
                }
            }
        }

        let json = serde_json::to_string_pretty(attempt)?;
        write_file(&path, json.as_bytes()).await?;
        Ok(true)
    }

    /// `<runs_root>/<task_id>_latest.json`.
    pub fn task_latest_path(&self, task_id: &str) -> PathBuf {
        self.runs_root.join(format!("{}{}", task_id, TASK_LATEST_SUFFIX))
    }
}

fn status_rank(status: AttemptStatus) -> i32 {
    match status {
        AttemptStatus::Pass => 2,
        AttemptStatus::Fail => 1,
        AttemptStatus::Error => 0,
        _ => -1,
    }
}

/// Writes the files of one attempt.
///
/// Failures are logged and swallowed: artifacts never decide an outcome.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
    rel_dir: String,
}

impl ArtifactWriter {
    /// Attempt directory relative to the run directory.
    pub fn rel_dir(&self) -> &str {
        &self.rel_dir
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `name` with `contents`, logging any failure.
    pub async fn write(&self, name: &str, contents: &str) {
        let path = self.dir.join(name);
        let result = match fs::create_dir_all(&self.dir).await {
            Ok(()) => write_file(&path, contents.as_bytes()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write attempt artifact");
        }
    }
}

async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}
