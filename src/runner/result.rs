//! Attempt records and the run summary they reduce to.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{ModelPricing, Usage};
use crate::patch::PatchOutcome;

/// Lifecycle status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Not dispatched yet.
    Pending,
    /// Dispatched and in progress.
    Running,
    /// Eval command exited 0.
    Pass,
    /// Eval command exited non-zero within its timeout.
    Fail,
    /// Infrastructure problem: prompt, model, patch, timeout or runner crash.
    Error,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Pass | AttemptStatus::Fail | AttemptStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Running => "running",
            AttemptStatus::Pass => "pass",
            AttemptStatus::Fail => "fail",
            AttemptStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "running" => Some(AttemptStatus::Running),
            "pass" => Some(AttemptStatus::Pass),
            "fail" => Some(AttemptStatus::Fail),
            "error" => Some(AttemptStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an attempt within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptKey {
    pub task_id: String,
    pub model: String,
    pub sample_index: u32,
}

impl AttemptKey {
    pub fn new(task_id: impl Into<String>, model: impl Into<String>, sample_index: u32) -> Self {
        Self {
            task_id: task_id.into(),
            model: model.into(),
            sample_index,
        }
    }

    /// Directory name for this attempt's artifacts.
    pub fn dir_name(&self) -> String {
        format!(
            "{}__{}__sample{:02}",
            self.task_id,
            self.model.replace(['/', '\\', ':'], "_"),
            self.sample_index
        )
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.task_id, self.model, self.sample_index)
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        Self::new(usage.prompt_tokens.into(), usage.completion_tokens.into())
    }
}

/// One (task, model, sample) evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(flatten)]
    pub key: AttemptKey,
    pub status: AttemptStatus,
    pub duration_seconds: f64,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub patch_outcome: Option<PatchOutcome>,
    #[serde(default)]
    pub patch_strategy: Option<String>,
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub api_latency_seconds: Option<f64>,
    /// Artifact directory relative to the run directory.
    #[serde(default)]
    pub artifact_dir: Option<String>,
}

impl Attempt {
    pub fn pending(key: AttemptKey) -> Self {
        Self {
            key,
            status: AttemptStatus::Pending,
            duration_seconds: 0.0,
            usage: None,
            cost_usd: None,
            error: None,
            patch_outcome: None,
            patch_strategy: None,
            return_code: None,
            timed_out: false,
            api_latency_seconds: None,
            artifact_dir: None,
        }
    }

    /// An attempt that never ran, e.g. because its task panicked.
    pub fn errored(key: AttemptKey, error: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Error,
            error: Some(error.into()),
            ..Self::pending(key)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn passed(&self) -> bool {
        self.status == AttemptStatus::Pass
    }
}

/// Attempt counts by terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
}

/// Run-wide metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallMetrics {
    /// Passing attempts over all attempts; errors count as failures.
    pub macro_model_accuracy: f64,
    /// Mean of the per-model attempt success rates.
    pub macro_attempt_success: Option<f64>,
    pub attempts: usize,
    pub status_counts: StatusCounts,
}

/// Per-model and overall scores for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Share of tasks with at least one passing sample.
    pub model_accuracy: BTreeMap<String, Option<f64>>,
    /// Passing attempts over attempts, per model.
    pub model_attempt_success: BTreeMap<String, Option<f64>>,
    pub pass_at_1: BTreeMap<String, Option<f64>>,
    pub pass_at_k: BTreeMap<String, Option<f64>>,
    pub overall: OverallMetrics,
}

/// Aggregate token usage and cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_cost_usd: f64,
}

/// Aggregate timing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub total_duration_seconds: f64,
    pub total_api_latency_seconds: f64,
}

/// Final record of a run, persisted once and published as `complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub timestamp_utc: DateTime<Utc>,
    pub models: Vec<String>,
    pub tasks: Vec<String>,
    pub samples: u32,
    pub temperature: f64,
    pub max_tokens: u32,
    pub include_tests: bool,
    #[serde(default)]
    pub install_deps: bool,
    pub provider: String,
    #[serde(default)]
    pub run_dir: Option<String>,
    pub attempts: Vec<Attempt>,
    pub metrics: RunMetrics,
    pub token_usage: TokenTotals,
    pub timing: Timing,
    #[serde(default)]
    pub pricing: BTreeMap<String, ModelPricing>,
}

impl RunSummary {
    /// Headline accuracy.
    pub fn accuracy(&self) -> f64 {
        self.metrics.overall.macro_model_accuracy
    }
}
