//! Run scheduling.
//!
//! [`RunScheduler`] resolves a run's tasks, fans the (task, model, sample)
//! cross-product out over a bounded worker pool, reduces the attempts into
//! a [`RunSummary`] and persists it exactly once. Attempt failures never
//! abort the run; only [`RunFatalError`]s do.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::attempt::{
    pip_install_command, AttemptExecutor, ExecutionContext, DEFAULT_INSTALL_TIMEOUT,
};
use super::config::{HarnessSettings, RunConfig};
use super::result::{Attempt, AttemptKey, RunSummary};
use super::test_runner::TestRunner;
use crate::catalog::{TaskCatalog, TaskDefinition};
use crate::error::RunFatalError;
use crate::llm::{ModelGateway, PricingTable, ReplayGateway};
use crate::metrics::{aggregate, MetricsCollector};
use crate::patch::PatchApplier;
use crate::progress::{ProgressCounters, ProgressDispatcher, ProgressEvent, ProgressMonitor};
use crate::prompts::PromptBuilder;
use crate::storage::{generate_run_id, RunDirectory, RunStore};

/// Default interval between progress log lines.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Cancels a running run from outside the scheduler.
///
/// Cancelling aborts in-flight attempts; their sandboxes and eval
/// processes are torn down as the attempt tasks drop.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Run id for `config`: the caller's choice or a fresh timestamped one.
pub fn run_id_for(config: &RunConfig) -> String {
    config
        .run_id
        .clone()
        .unwrap_or_else(|| generate_run_id(Utc::now()))
}

/// Orchestrates evaluation runs.
pub struct RunScheduler {
    catalog: TaskCatalog,
    settings: HarnessSettings,
    gateway: Arc<dyn ModelGateway>,
    store: Arc<dyn RunStore>,
    pricing: PricingTable,
    metrics: MetricsCollector,
    monitor_interval: Duration,
    cancel: CancelHandle,
    cancel_rx: watch::Receiver<bool>,
}

impl RunScheduler {
    /// Creates a scheduler.
    ///
    /// # Arguments
    ///
    /// * `settings` - Process-level defaults (catalog root, runs root, pool size)
    /// * `gateway` - Model access shared by all attempts
    /// * `store` - Where the final summary is persisted
    pub fn new(
        settings: HarnessSettings,
        gateway: Arc<dyn ModelGateway>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        let (cancel, cancel_rx) = CancelHandle::new();
        Self {
            catalog: TaskCatalog::new(settings.tasks_root.clone()),
            settings,
            gateway,
            store,
            pricing: PricingTable::new(),
            metrics: MetricsCollector::new(),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            cancel,
            cancel_rx,
        }
    }

    /// Pricing recorded in summaries.
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// Execute one run, publishing its events to `dispatcher`.
    ///
    /// The run id is the dispatcher's. On success the last event is
    /// `complete`; on a fatal error it is `error` and no `complete` follows.
    pub async fn run(
        &self,
        config: RunConfig,
        dispatcher: ProgressDispatcher,
    ) -> Result<RunSummary, RunFatalError> {
        let run_id = dispatcher.run_id().to_string();
        match self.execute(&run_id, &config, &dispatcher).await {
            Ok(summary) => {
                info!(
                    run_id = %run_id,
                    attempts = summary.attempts.len(),
                    accuracy = summary.accuracy(),
                    total_cost_usd = summary.token_usage.total_cost_usd,
                    "Run complete"
                );
                self.metrics.record_run("complete");
                dispatcher.publish(ProgressEvent::Complete {
                    summary: Box::new(summary.clone()),
                });
                Ok(summary)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Run failed");
                self.metrics.record_run("error");
                dispatcher.publish(ProgressEvent::error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        config: &RunConfig,
        dispatcher: &ProgressDispatcher,
    ) -> Result<RunSummary, RunFatalError> {
        config.validate().map_err(RunFatalError::InvalidConfig)?;
        let started_at = Utc::now();

        let catalog = self.catalog.clone();
        let selection = config.tasks.clone();
        let tasks = tokio::task::spawn_blocking(move || catalog.resolve(&selection))
            .await
            .map_err(|e| RunFatalError::Scheduler(format!("task resolution panicked: {}", e)))??;
        if config.response_text.is_some() && tasks.len() != 1 {
            return Err(RunFatalError::InvalidConfig(
                "response replay supports a single task".to_string(),
            ));
        }

        let gateway: Arc<dyn ModelGateway> = match &config.response_text {
            Some(text) => Arc::new(ReplayGateway::new(text.clone())),
            None => self.gateway.clone(),
        };
        let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();

        dispatcher.publish(ProgressEvent::Init {
            run_id: run_id.to_string(),
            models: config.models.clone(),
            tasks: task_ids.clone(),
            samples: config.samples,
            provider: gateway.provider_name().to_string(),
        });

        let run_dir = match &self.settings.runs_root {
            Some(root) => match RunDirectory::create(root, run_id).await {
                Ok(dir) => Some(dir),
                Err(e) => {
                    warn!(run_id, error = %e, "Failed to create run directory; artifacts disabled");
                    None
                }
            },
            None => None,
        };

        let keys = attempt_keys(&tasks, &config.models, config.samples);
        info!(
            run_id,
            tasks = tasks.len(),
            models = config.models.len(),
            samples = config.samples,
            attempts = keys.len(),
            max_concurrency = self.settings.max_concurrency,
            provider = gateway.provider_name(),
            "Starting run"
        );

        let mut ctx = ExecutionContext::new(
            gateway.clone(),
            PromptBuilder::new(config.include_tests),
            PatchApplier::new(config.patch_policy(self.settings.patch_fuzz)),
            TestRunner::new(self.settings.max_log_chars),
            config.completion_params(),
        )
        .with_dispatcher(dispatcher.clone());
        if config.install_deps {
            ctx = ctx.with_install_command(pip_install_command(), DEFAULT_INSTALL_TIMEOUT);
        }
        let ctx = Arc::new(ctx);

        let attempts = self.dispatch(run_id, ctx, &tasks, keys, run_dir.as_ref()).await?;
        let agg = aggregate(&attempts, &config.models, config.samples);

        let summary = RunSummary {
            run_id: run_id.to_string(),
            timestamp_utc: started_at,
            models: config.models.clone(),
            tasks: task_ids,
            samples: config.samples,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            include_tests: config.include_tests,
            install_deps: config.install_deps,
            provider: gateway.provider_name().to_string(),
            run_dir: run_dir.as_ref().map(|d| d.path().display().to_string()),
            attempts,
            metrics: agg.metrics,
            token_usage: agg.token_usage,
            timing: agg.timing,
            pricing: self.pricing.for_models(&config.models),
        };

        if let Some(dir) = &run_dir {
            if let Err(e) = dir.write_summary(&summary).await {
                warn!(run_id, error = %e, "Failed to write summary artifact");
            }
        }

        self.store.save_run(&summary).await?;
        Ok(summary)
    }

    /// Run every attempt on the worker pool and collect them in key order.
    async fn dispatch(
        &self,
        run_id: &str,
        ctx: Arc<ExecutionContext>,
        tasks: &[TaskDefinition],
        keys: Vec<AttemptKey>,
        run_dir: Option<&RunDirectory>,
    ) -> Result<Vec<Attempt>, RunFatalError> {
        let total = keys.len();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let counters = ProgressCounters::new();
        let monitor =
            ProgressMonitor::start(run_id, counters.clone(), total, self.monitor_interval);

        let tasks: Vec<Arc<TaskDefinition>> = tasks.iter().cloned().map(Arc::new).collect();
        let mut join_set = JoinSet::new();

        for key in keys {
            let Some(task) = tasks.iter().find(|t| t.id == key.task_id).cloned() else {
                continue;
            };
            let mut executor = AttemptExecutor::new(ctx.clone(), task, key.clone());
            if let Some(dir) = run_dir {
                executor = executor.with_artifacts(dir.attempt_writer(&key));
            }
            let semaphore = semaphore.clone();
            let counters = counters.clone();
            let ctx = ctx.clone();
            let run_dir = run_dir.cloned();

            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Attempt::errored(key, "worker pool closed"),
                };
                counters.attempt_started();
                let attempt = match AssertUnwindSafe(executor.run()).catch_unwind().await {
                    Ok(attempt) => attempt,
                    Err(_) => {
                        error!(attempt = %key, "Attempt task panicked");
                        let attempt = Attempt::errored(key, "attempt panicked");
                        ctx.metrics.record_attempt(
                            attempt.status,
                            &attempt.key.model,
                            attempt.duration_seconds,
                        );
                        if let Some(dispatcher) = &ctx.dispatcher {
                            dispatcher.publish(ProgressEvent::from(&attempt));
                        }
                        attempt
                    }
                };
                counters.attempt_finished(attempt.status);
                if let Some(dir) = &run_dir {
                    if let Err(e) = dir.update_task_latest(&attempt).await {
                        warn!(attempt = %attempt.key, error = %e, "Failed to update task latest record");
                    }
                }
                attempt
            });
        }

        let mut attempts = Vec::with_capacity(total);
        let mut cancel_rx = self.cancel_rx.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => {
                    warn!(run_id, in_flight = join_set.len(), "Run cancelled; aborting attempts");
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    monitor.stop().await;
                    return Err(RunFatalError::Cancelled);
                }
                next = join_set.join_next() => match next {
                    Some(Ok(attempt)) => attempts.push(attempt),
                    Some(Err(e)) => {
                        monitor.stop().await;
                        return Err(RunFatalError::Scheduler(format!("attempt task failed: {}", e)));
                    }
                    None => break,
                },
            }
        }

        monitor.stop().await;
        attempts.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(attempts)
    }
}

/// The cross-product of tasks, models and samples, sorted by key.
pub fn attempt_keys(tasks: &[TaskDefinition], models: &[String], samples: u32) -> Vec<AttemptKey> {
    let mut seen = HashSet::new();
    let mut keys: Vec<AttemptKey> = tasks
        .iter()
        .flat_map(|task| {
            models.iter().flat_map(move |model| {
                (0..samples).map(move |sample| AttemptKey::new(task.id.clone(), model.clone(), sample))
            })
        })
        .filter(|key| seen.insert(key.clone()))
        .collect();
    keys.sort();
    keys
}

/// Resolves once the run is cancelled; never resolves otherwise.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
