//! End-to-end runs against a temporary task catalog.
//!
//! Eval commands are plain `sh` scripts, so these tests only run on Unix.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use codebench::catalog::{TaskSelection, METADATA_FILE};
use codebench::llm::{
    Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, ModelPricing,
    PricingTable, ProviderGateway, Usage,
};
use codebench::progress::{ProgressDispatcher, ProgressEvent, RunRegistry};
use codebench::runner::{AttemptStatus, HarnessSettings, RunConfig, RunScheduler};
use codebench::storage::{MemoryRunStore, RunStore, SqliteRunStore};
use codebench::{LlmError, RunFatalError};
use tempfile::TempDir;
use tokio_stream::StreamExt;

const FIX_X: &str = "```diff\n--- a/main.py\n+++ b/main.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n```\n";

/// Provider that answers every request with the same text.
struct CannedProvider {
    text: String,
}

#[async_trait]
impl LlmProvider for CannedProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        Ok(GenerationResponse {
            id: "canned".to_string(),
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(self.text.clone()),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            }),
        })
    }
}

/// Provider that is always down.
struct DownProvider;

#[async_trait]
impl LlmProvider for DownProvider {
    async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        Err(LlmError::RequestFailed("503 Service Unavailable".to_string()))
    }
}

fn write_task(tasks_root: &Path, id: &str) {
    let dir = tasks_root.join(id);
    fs::create_dir_all(dir.join("workspace")).unwrap();
    fs::write(dir.join("workspace/main.py"), "x = 1\n").unwrap();
    fs::write(dir.join("instructions.md"), "Change x to 2 in main.py.").unwrap();
    let metadata = serde_json::json!({
        "id": id,
        "language": "python",
        "instructions_file": "instructions.md",
        "eval": {
            "command": ["sh", "-c", "grep -q 'x = 2' main.py"],
            "timeout_seconds": 30
        }
    });
    fs::write(dir.join(METADATA_FILE), metadata.to_string()).unwrap();
}

fn settings(root: &Path) -> HarnessSettings {
    HarnessSettings::default()
        .with_tasks_root(root.join("tasks"))
        .with_runs_root(Some(root.join("runs")))
        .with_max_concurrency(2)
}

fn gateway(provider: impl LlmProvider + 'static) -> Arc<ProviderGateway> {
    let pricing = PricingTable::new().with_rate("vendor/m1", ModelPricing::new(0.000001, 0.000002));
    Arc::new(ProviderGateway::new(Arc::new(provider), "mock").with_pricing(pricing))
}

#[tokio::test]
async fn test_passing_run_is_scored_and_persisted() {
    let tmp = TempDir::new().unwrap();
    write_task(&tmp.path().join("tasks"), "py_fix");
    let db_url = format!("sqlite://{}", tmp.path().join("runs.db").display());
    let store = Arc::new(SqliteRunStore::connect(&db_url).await.unwrap());

    let scheduler = RunScheduler::new(
        settings(tmp.path()),
        gateway(CannedProvider {
            text: FIX_X.to_string(),
        }),
        store.clone(),
    );
    let config = RunConfig::new(["vendor/m1"])
        .with_tasks(TaskSelection::parse("py_fix"))
        .with_run_id("run_pass");
    let summary = scheduler
        .run(config, ProgressDispatcher::new("run_pass"))
        .await
        .unwrap();

    assert_eq!(summary.attempts.len(), 1);
    assert_eq!(summary.attempts[0].status, AttemptStatus::Pass);
    assert_eq!(summary.metrics.overall.macro_model_accuracy, 1.0);
    assert_eq!(summary.metrics.pass_at_1["vendor/m1"], Some(1.0));
    assert_eq!(summary.token_usage.prompt_tokens, 100);
    assert!((summary.token_usage.total_cost_usd - 0.00014).abs() < 1e-9);

    let run_dir = tmp.path().join("runs/run_pass");
    assert!(run_dir.join("summary.json").is_file());
    assert!(tmp.path().join("runs/latest_summary.json").is_file());

    let stored = store.get_run("run_pass").await.unwrap().unwrap();
    assert_eq!(stored.attempts, summary.attempts);
    let board = store.leaderboard().await.unwrap();
    assert_eq!(board[0].model, "vendor/m1");
    assert_eq!(board[0].best_accuracy, Some(1.0));

    // The catalog is never written.
    let original = fs::read_to_string(tmp.path().join("tasks/py_fix/workspace/main.py")).unwrap();
    assert_eq!(original, "x = 1\n");
}

#[tokio::test]
async fn test_provider_outage_errors_attempts_but_completes_run() {
    let tmp = TempDir::new().unwrap();
    write_task(&tmp.path().join("tasks"), "t1");
    write_task(&tmp.path().join("tasks"), "t2");
    let store = Arc::new(MemoryRunStore::new());

    let scheduler = RunScheduler::new(settings(tmp.path()), gateway(DownProvider), store.clone());
    let dispatcher = ProgressDispatcher::new("run_down");
    let events = dispatcher.subscribe();
    let summary = scheduler
        .run(RunConfig::new(["vendor/m1"]), dispatcher)
        .await
        .unwrap();

    assert_eq!(summary.attempts.len(), 2);
    assert!(summary
        .attempts
        .iter()
        .all(|a| a.status == AttemptStatus::Error && a.error.as_deref().unwrap_or("").contains("503")));
    assert_eq!(summary.metrics.overall.macro_model_accuracy, 0.0);
    assert_eq!(summary.metrics.overall.status_counts.error, 2);
    assert_eq!(store.len(), 1);

    let events: Vec<ProgressEvent> = events.collect().await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["init", "attempt", "attempt", "complete"]);
}

#[tokio::test]
async fn test_missing_task_fails_run_without_complete() {
    let tmp = TempDir::new().unwrap();
    write_task(&tmp.path().join("tasks"), "t1");
    let store = Arc::new(MemoryRunStore::new());

    let scheduler = RunScheduler::new(
        settings(tmp.path()),
        gateway(CannedProvider {
            text: FIX_X.to_string(),
        }),
        store.clone(),
    );
    let dispatcher = ProgressDispatcher::new("run_missing");
    let events = dispatcher.subscribe();
    let config = RunConfig::new(["vendor/m1"]).with_tasks(TaskSelection::parse("t1,nope"));
    let err = scheduler.run(config, dispatcher).await.unwrap_err();

    assert!(matches!(err, RunFatalError::CatalogResolution(_)));
    let events: Vec<ProgressEvent> = events.collect().await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        ProgressEvent::Error { message } => assert!(message.contains("nope")),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_registry_subscriber_sees_whole_run() {
    let tmp = TempDir::new().unwrap();
    write_task(&tmp.path().join("tasks"), "t1");
    let scheduler = RunScheduler::new(
        settings(tmp.path()),
        gateway(CannedProvider {
            text: FIX_X.to_string(),
        }),
        Arc::new(MemoryRunStore::new()),
    );

    let registry = RunRegistry::new();
    let dispatcher = registry.register("run_watch").unwrap();
    let events = registry.subscribe("run_watch").unwrap();
    let config = RunConfig::new(["vendor/m1"]).with_samples(3);
    scheduler.run(config, dispatcher).await.unwrap();

    let events: Vec<ProgressEvent> = events.collect().await;
    assert_eq!(events.len(), 5);
    match &events[0] {
        ProgressEvent::Init {
            run_id, provider, ..
        } => {
            assert_eq!(run_id, "run_watch");
            assert_eq!(provider, "mock");
        }
        other => panic!("expected init, got {:?}", other),
    }
    match events.last() {
        Some(ProgressEvent::Complete { summary }) => {
            assert_eq!(summary.run_id, "run_watch");
            assert_eq!(summary.metrics.pass_at_k["vendor/m1"], Some(1.0));
        }
        other => panic!("expected complete, got {:?}", other),
    }
}

#[tokio::test]
async fn test_response_without_diff_leaves_sandbox_untouched() {
    let tmp = TempDir::new().unwrap();
    write_task(&tmp.path().join("tasks"), "t1");
    let scheduler = RunScheduler::new(
        settings(tmp.path()),
        gateway(CannedProvider {
            text: "I would rather not.".to_string(),
        }),
        Arc::new(MemoryRunStore::new()),
    );
    let config = RunConfig::new(["vendor/m1"])
        .with_rewrite_fallback(true)
        .with_run_id("run_nodiff");
    let summary = scheduler
        .run(config, ProgressDispatcher::new("run_nodiff"))
        .await
        .unwrap();

    let attempt = &summary.attempts[0];
    assert_eq!(attempt.status, AttemptStatus::Error);
    assert!(attempt.error.as_deref().unwrap_or("").starts_with("Patch rejected"));
    assert!(attempt.return_code.is_none());

    let artifacts = tmp
        .path()
        .join("runs/run_nodiff")
        .join(attempt.artifact_dir.as_deref().unwrap());
    assert!(artifacts.join("response.txt").is_file());
    assert!(!artifacts.join("stdout.log").exists());
}
