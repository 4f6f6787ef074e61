//! Persistence for finished runs.
//!
//! # Overview
//!
//! - **RunStore**: the write-once/read-many contract the scheduler finalises into
//! - **SqliteRunStore**: sqlx-backed store with idempotent migrations
//! - **MemoryRunStore**: in-process store for tests and `--no-db` runs
//! - **ArtifactWriter**: run directories with `summary.json` and per-attempt files
//! - **leaderboard**: best run per model across stored summaries
//!
//! # Usage
//!
//! ```rust,ignore
//! use codebench::storage::{RunStore, SqliteRunStore};
//!
//! let store = SqliteRunStore::connect("sqlite://codebench.db").await?;
//! store.save_run(&summary).await?;
//! let rows = store.leaderboard().await?;
//! ```

pub mod artifacts;
pub mod database;
pub mod leaderboard;
pub mod memory;
pub mod migrations;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::{AttemptStatus, RunSummary};

pub use artifacts::{
    generate_run_id, ArtifactError, ArtifactWriter, RunDirectory, LATEST_SUMMARY_FILE, SUMMARY_FILE,
    TASK_LATEST_SUFFIX,
};
pub use database::SqliteRunStore;
pub use leaderboard::{rank_models, LeaderboardEntry};
pub use memory::MemoryRunStore;
pub use migrations::{MigrationError, MigrationRunner};

/// Errors that can occur in a run store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// One line of a run listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunListing {
    pub run_id: String,
    pub timestamp_utc: DateTime<Utc>,
    pub models: Vec<String>,
    pub accuracy: f64,
    pub total_cost_usd: f64,
    pub total_duration_seconds: f64,
    pub error_count: usize,
}

impl RunListing {
    pub fn from_summary(summary: &RunSummary) -> Self {
        Self {
            run_id: summary.run_id.clone(),
            timestamp_utc: summary.timestamp_utc,
            models: summary.models.clone(),
            accuracy: summary.accuracy(),
            total_cost_usd: summary.token_usage.total_cost_usd,
            total_duration_seconds: summary.timing.total_duration_seconds,
            error_count: summary
                .attempts
                .iter()
                .filter(|a| a.status == AttemptStatus::Error)
                .count(),
        }
    }
}

/// Durable home of run summaries.
///
/// The scheduler calls [`RunStore::save_run`] exactly once per run, after
/// every attempt is terminal. Saving a run id again replaces it.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, summary: &RunSummary) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunSummary>, StoreError>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, StoreError>;

    /// Every stored summary, oldest first.
    async fn all_runs(&self) -> Result<Vec<RunSummary>, StoreError>;

    /// Remove runs that evaluated `model`; returns how many were removed.
    async fn delete_runs_for_model(&self, model: &str) -> Result<usize, StoreError>;

    async fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>, StoreError> {
        Ok(rank_models(&self.all_runs().await?))
    }
}
