//! Process-scoped map of run ids to their dispatchers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::dispatcher::ProgressDispatcher;
use super::events::ProgressEvent;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Run '{0}' is already registered")]
    DuplicateRun(String),
}

/// Registry of runs visible to observers. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, ProgressDispatcher>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProgressDispatcher>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create and register a dispatcher for `run_id`.
    pub fn register(&self, run_id: &str) -> Result<ProgressDispatcher, RegistryError> {
        let mut runs = self.lock();
        if runs.contains_key(run_id) {
            return Err(RegistryError::DuplicateRun(run_id.to_string()));
        }
        let dispatcher = ProgressDispatcher::new(run_id);
        runs.insert(run_id.to_string(), dispatcher.clone());
        debug!(run_id, "Registered run");
        Ok(dispatcher)
    }

    pub fn get(&self, run_id: &str) -> Option<ProgressDispatcher> {
        self.lock().get(run_id).cloned()
    }

    /// Subscribe to a registered run.
    pub fn subscribe(&self, run_id: &str) -> Option<ReceiverStream<ProgressEvent>> {
        self.get(run_id).map(|d| d.subscribe())
    }

    pub fn remove(&self, run_id: &str) -> Option<ProgressDispatcher> {
        self.lock().remove(run_id)
    }

    /// Ids of registered runs that have not ended, sorted.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, d)| !d.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
