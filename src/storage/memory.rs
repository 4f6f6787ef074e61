//! In-process run store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{RunListing, RunStore, StoreError};
use crate::runner::RunSummary;

/// [`RunStore`] kept in memory, used by tests and `--no-db` runs.
///
/// Writes can be made to fail to exercise the scheduler's finalisation path.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<BTreeMap<String, RunSummary>>,
    fail_writes: AtomicBool,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `save_run` always fails.
    pub fn failing() -> Self {
        let store = Self::new();
        store.set_fail_writes(true);
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, RunSummary>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sorted(&self) -> Vec<RunSummary> {
        let mut runs: Vec<RunSummary> = self.lock().values().cloned().collect();
        runs.sort_by(|a, b| {
            a.timestamp_utc
                .cmp(&b.timestamp_utc)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        runs
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.lock().insert(summary.run_id.clone(), summary.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunSummary>, StoreError> {
        Ok(self.lock().get(run_id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, StoreError> {
        Ok(self
            .sorted()
            .iter()
            .rev()
            .take(limit)
            .map(RunListing::from_summary)
            .collect())
    }

    async fn all_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        Ok(self.sorted())
    }

    async fn delete_runs_for_model(&self, model: &str) -> Result<usize, StoreError> {
        let mut runs = self.lock();
        let before = runs.len();
        runs.retain(|_, summary| !summary.models.iter().any(|m| m == model));
        Ok(before - runs.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::aggregate;
    use crate::runner::{Attempt, AttemptKey, AttemptStatus, TokenUsage};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    /// Two tasks per model; the first model passes both, later ones pass one.
    pub(crate) fn sample_summary(run_id: &str, models: &[&str], minutes: i64) -> RunSummary {
        let models: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        let mut attempts = Vec::new();
        for (i, model) in models.iter().enumerate() {
            for (j, task) in ["t1", "t2"].iter().enumerate() {
                let mut attempt = Attempt::pending(AttemptKey::new(*task, model.clone(), 0));
                attempt.status = if i == 0 || j == 0 {
                    AttemptStatus::Pass
                } else {
                    AttemptStatus::Fail
                };
                attempt.duration_seconds = 2.0;
                attempt.usage = Some(TokenUsage::new(100, 10));
                attempt.cost_usd = Some(0.001);
                attempts.push(attempt);
            }
        }
        let agg = aggregate(&attempts, &models, 1);
        let timestamp = Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap()
            + Duration::minutes(minutes);
        RunSummary {
            run_id: run_id.to_string(),
            timestamp_utc: timestamp,
            models,
            tasks: vec!["t1".into(), "t2".into()],
            samples: 1,
            temperature: 0.0,
            max_tokens: 800,
            include_tests: false,
            install_deps: false,
            provider: "replay".into(),
            run_dir: None,
            attempts,
            metrics: agg.metrics,
            token_usage: agg.token_usage,
            timing: agg.timing,
            pricing: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_save_get_list() {
        let store = MemoryRunStore::new();
        store.save_run(&sample_summary("a", &["m1"], 0)).await.unwrap();
        store.save_run(&sample_summary("b", &["m1"], 5)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get_run("a").await.unwrap().is_some());
        let listing = store.list_runs(1).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].run_id, "b");
        assert_eq!(listing[0].accuracy, 1.0);
    }

    #[tokio::test]
    async fn test_failing_store_rejects_writes() {
        let store = MemoryRunStore::failing();
        let err = store.save_run(&sample_summary("a", &["m1"], 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.is_empty());

        store.set_fail_writes(false);
        store.save_run(&sample_summary("a", &["m1"], 0)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_runs_for_model() {
        let store = MemoryRunStore::new();
        store.save_run(&sample_summary("a", &["m1"], 0)).await.unwrap();
        store.save_run(&sample_summary("b", &["m2"], 1)).await.unwrap();
        assert_eq!(store.delete_runs_for_model("m2").await.unwrap(), 1);
        assert_eq!(store.delete_runs_for_model("m3").await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }
}
