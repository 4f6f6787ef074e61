//! High-level recording interface over the Prometheus metrics.
//!
//! `MetricsCollector` keeps labeling consistent across the scheduler and
//! the attempt executor. Every method is a no-op until [`init_metrics`]
//! has been called, so tests and library users never need a registry.
//!
//! [`init_metrics`]: super::prometheus::init_metrics

use super::prometheus::{
    ATTEMPTS_IN_PROGRESS, ATTEMPTS_TOTAL, ATTEMPT_DURATION, LLM_COST_USD, LLM_LATENCY,
    LLM_TOKENS_TOTAL, PATCH_OUTCOMES_TOTAL, RUNS_TOTAL,
};
use crate::patch::PatchOutcome;
use crate::runner::{AttemptStatus, TokenUsage};

/// Records codebench operational metrics.
///
/// # Example
///
/// ```ignore
/// use codebench::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.attempt_started();
/// collector.record_attempt(AttemptStatus::Pass, "vendor/model", 12.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Mark an attempt as holding a worker slot.
    pub fn attempt_started(&self) {
        if let Some(gauge) = ATTEMPTS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Record a finished attempt and release its in-progress slot.
    ///
    /// # Arguments
    ///
    /// * `status` - Terminal status of the attempt
    /// * `model` - Model the attempt was run against
    /// * `duration_secs` - Wall-clock duration since dispatch
    pub fn record_attempt(&self, status: AttemptStatus, model: &str, duration_secs: f64) {
        if let Some(counter) = ATTEMPTS_TOTAL.get() {
            counter.with_label_values(&[status.as_str(), model]).inc();
        }
        if let Some(histogram) = ATTEMPT_DURATION.get() {
            histogram.with_label_values(&[model]).observe(duration_secs);
        }
        if let Some(gauge) = ATTEMPTS_IN_PROGRESS.get() {
            gauge.dec();
        }
        tracing::trace!(
            status = status.as_str(),
            model,
            duration_secs,
            "Recorded attempt metrics"
        );
    }

    pub fn record_patch_outcome(&self, outcome: PatchOutcome) {
        if let Some(counter) = PATCH_OUTCOMES_TOTAL.get() {
            counter.with_label_values(&[outcome.as_str()]).inc();
        }
    }

    /// Record one model call: latency, tokens and, when priced, its cost.
    pub fn record_llm_call(
        &self,
        model: &str,
        latency_secs: f64,
        usage: Option<TokenUsage>,
        cost_usd: Option<f64>,
    ) {
        if let Some(histogram) = LLM_LATENCY.get() {
            histogram.with_label_values(&[model]).observe(latency_secs);
        }
        if let (Some(counter), Some(usage)) = (LLM_TOKENS_TOTAL.get(), usage) {
            counter
                .with_label_values(&[model, "prompt"])
                .inc_by(usage.prompt_tokens as f64);
            counter
                .with_label_values(&[model, "completion"])
                .inc_by(usage.completion_tokens as f64);
        }
        if let (Some(counter), Some(cost)) = (LLM_COST_USD.get(), cost_usd) {
            if cost > 0.0 {
                counter.with_label_values(&[model]).inc_by(cost);
            }
        }
    }

    /// Record the end of a run; `outcome` is `complete` or `error`.
    pub fn record_run(&self, outcome: &str) {
        if let Some(counter) = RUNS_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }
}
