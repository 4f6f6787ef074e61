//! SQLite run store.
//!
//! Runs are stored as a summary row carrying the full JSON summary plus
//! one flattened row per attempt. Reads always decode the JSON, so the
//! flattened table only serves ad-hoc SQL.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::migrations::MigrationRunner;
use super::{RunListing, RunStore, StoreError};
use crate::runner::RunSummary;

/// sqlx-backed [`RunStore`].
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Opens (creating if needed) the database and runs migrations.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite URL, e.g. `sqlite://codebench.db` or `sqlite::memory:`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        tracing::debug!(database_url, "Run store ready");
        Ok(store)
    }

    /// Creates a store from an existing pool without running migrations.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await?;
        Ok(())
    }

    fn decode_summaries(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<RunSummary>, StoreError> {
        rows.iter()
            .map(|row| -> Result<RunSummary, StoreError> {
                let json: String = row.try_get("summary_json")?;
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    /// Saves the summary and its attempts in one transaction.
    async fn save_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        let listing = RunListing::from_summary(summary);
        let summary_json = serde_json::to_string(summary)?;
        let models_json = serde_json::to_string(&summary.models)?;
        let tasks_json = serde_json::to_string(&summary.tasks)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM attempts WHERE run_id = ?1")
            .bind(&summary.run_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO runs (
                id, timestamp_utc, models, tasks, samples, accuracy,
                total_cost, total_duration, error_count, summary_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (id) DO UPDATE SET
                timestamp_utc = excluded.timestamp_utc,
                models = excluded.models,
                tasks = excluded.tasks,
                samples = excluded.samples,
                accuracy = excluded.accuracy,
                total_cost = excluded.total_cost,
                total_duration = excluded.total_duration,
                error_count = excluded.error_count,
                summary_json = excluded.summary_json
            "#,
        )
        .bind(&summary.run_id)
        .bind(summary.timestamp_utc)
        .bind(&models_json)
        .bind(&tasks_json)
        .bind(i64::from(summary.samples))
        .bind(listing.accuracy)
        .bind(listing.total_cost_usd)
        .bind(listing.total_duration_seconds)
        .bind(listing.error_count as i64)
        .bind(&summary_json)
        .execute(&mut *tx)
        .await?;

        for attempt in &summary.attempts {
            sqlx::query(
                r#"
                INSERT INTO attempts (
                    run_id, task_id, model, sample_index, status, duration,
                    prompt_tokens, completion_tokens, cost, error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(&summary.run_id)
            .bind(&attempt.key.task_id)
            .bind(&attempt.key.model)
            .bind(i64::from(attempt.key.sample_index))
            .bind(attempt.status.as_str())
            .bind(attempt.duration_seconds)
            .bind(attempt.usage.map(|u| u.prompt_tokens as i64))
            .bind(attempt.usage.map(|u| u.completion_tokens as i64))
            .bind(attempt.cost_usd)
            .bind(attempt.error.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(run_id = %summary.run_id, attempts = summary.attempts.len(), "Saved run");
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunSummary>, StoreError> {
        let row = sqlx::query("SELECT summary_json FROM runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.try_get("summary_json")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp_utc, models, accuracy, total_cost, total_duration, error_count
            FROM runs
            ORDER BY timestamp_utc DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RunListing, StoreError> {
                let models: String = row.try_get("models")?;
                let error_count: i64 = row.try_get("error_count")?;
                Ok(RunListing {
                    run_id: row.try_get("id")?,
                    timestamp_utc: row.try_get("timestamp_utc")?,
                    models: serde_json::from_str(&models)?,
                    accuracy: row.try_get("accuracy")?,
                    total_cost_usd: row.try_get("total_cost")?,
                    total_duration_seconds: row.try_get("total_duration")?,
                    error_count: usize::try_from(error_count).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn all_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query("SELECT summary_json FROM runs ORDER BY timestamp_utc, id")
            .fetch_all(&self.pool)
            .await?;
        Self::decode_summaries(rows)
    }

    async fn delete_runs_for_model(&self, model: &str) -> Result<usize, StoreError> {
        let rows = sqlx::query("SELECT id, models FROM runs")
            .fetch_all(&self.pool)
            .await?;

        let mut doomed = Vec::new();
        for row in &rows {
            let models: String = row.try_get("models")?;
            let models: Vec<String> = serde_json::from_str(&models)?;
            if models.iter().any(|m| m == model) {
                doomed.push(row.try_get::<String, _>("id")?);
            }
        }

        let mut tx = self.pool.begin().await?;
        for run_id in &doomed {
            sqlx::query("DELETE FROM attempts WHERE run_id = ?1")
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM runs WHERE id = ?1")
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::info!(model, removed = doomed.len(), "Deleted runs for model");
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::tests::sample_summary;

    async fn store() -> SqliteRunStore {
        SqliteRunStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_save_and_get_roundtrip() {
        let store = store().await;
        let summary = sample_summary("run_a", &["m1"], 0);
        store.save_run(&summary).await.unwrap();

        let loaded = store.get_run("run_a").await.unwrap().unwrap();
        assert_eq!(loaded, summary);
        assert!(store.get_run("missing").await.unwrap().is_none());

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM attempts WHERE run_id = 'run_a'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.0, summary.attempts.len() as i64);
    }

    #[tokio::test]
    async fn test_save_twice_replaces() {
        let store = store().await;
        let summary = sample_summary("run_a", &["m1"], 0);
        store.save_run(&summary).await.unwrap();
        store.save_run(&summary).await.unwrap();
        assert_eq!(store.list_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let store = store().await;
        store.save_run(&sample_summary("old", &["m1"], 0)).await.unwrap();
        store.save_run(&sample_summary("new", &["m1"], 60)).await.unwrap();

        let listing = store.list_runs(10).await.unwrap();
        assert_eq!(listing[0].run_id, "new");
        assert_eq!(listing[1].run_id, "old");
        assert_eq!(listing[0].models, vec!["m1"]);
        assert_eq!(store.list_runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_runs_for_model() {
        let store = store().await;
        store.save_run(&sample_summary("a", &["m1"], 0)).await.unwrap();
        store.save_run(&sample_summary("b", &["m1", "m2"], 1)).await.unwrap();
        store.save_run(&sample_summary("c", &["m2"], 2)).await.unwrap();

        assert_eq!(store.delete_runs_for_model("m1").await.unwrap(), 2);
        let remaining = store.all_runs().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].run_id, "c");
    }

    #[tokio::test]
    async fn test_leaderboard_from_stored_runs() {
        let store = store().await;
        store.save_run(&sample_summary("a", &["m1", "m2"], 0)).await.unwrap();
        let board = store.leaderboard().await.unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].runs, 1);
    }
}
