//! Prometheus metrics registration and export.
//!
//! Defines every Prometheus metric codebench records and provides functions
//! for initializing the registry and rendering the text exposition.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all codebench metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished attempts, labeled by status and model.
pub static ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Attempt wall-clock duration in seconds, labeled by model.
pub static ATTEMPT_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Attempts currently holding a worker slot.
pub static ATTEMPTS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Patch application outcomes, labeled by outcome.
pub static PATCH_OUTCOMES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Model call latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Tokens used, labeled by model and type (prompt/completion).
pub static LLM_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Model spend in dollars, labeled by model.
pub static LLM_COST_USD: OnceLock<CounterVec> = OnceLock::new();

/// Finished runs, labeled by outcome (complete/error).
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls keep the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let attempts_total = CounterVec::new(
        Opts::new("codebench_attempts_total", "Finished attempts"),
        &["status", "model"],
    )?;

    let attempt_duration = HistogramVec::new(
        HistogramOpts::new(
            "codebench_attempt_duration_seconds",
            "Attempt wall-clock duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["model"],
    )?;

    let attempts_in_progress = Gauge::new(
        "codebench_attempts_in_progress",
        "Attempts currently holding a worker slot",
    )?;

    let patch_outcomes_total = CounterVec::new(
        Opts::new("codebench_patch_outcomes_total", "Patch application outcomes"),
        &["outcome"],
    )?;

    let llm_latency = HistogramVec::new(
        HistogramOpts::new("codebench_llm_latency_seconds", "Model call latency in seconds")
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"],
    )?;

    let llm_tokens_total = CounterVec::new(
        Opts::new("codebench_llm_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    let llm_cost_usd = CounterVec::new(
        Opts::new("codebench_llm_cost_usd_total", "Model spend in dollars"),
        &["model"],
    )?;

    let runs_total = CounterVec::new(
        Opts::new("codebench_runs_total", "Finished runs"),
        &["outcome"],
    )?;

    registry.register(Box::new(attempts_total.clone()))?;
    registry.register(Box::new(attempt_duration.clone()))?;
    registry.register(Box::new(attempts_in_progress.clone()))?;
    registry.register(Box::new(patch_outcomes_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(llm_tokens_total.clone()))?;
    registry.register(Box::new(llm_cost_usd.clone()))?;
    registry.register(Box::new(runs_total.clone()))?;

    // If any of these fail, another caller won the race (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = ATTEMPTS_TOTAL.set(attempts_total);
    let _ = ATTEMPT_DURATION.set(attempt_duration);
    let _ = ATTEMPTS_IN_PROGRESS.set(attempts_in_progress);
    let _ = PATCH_OUTCOMES_TOTAL.set(patch_outcomes_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = LLM_TOKENS_TOTAL.set(llm_tokens_total);
    let _ = LLM_COST_USD.set(llm_cost_usd);
    let _ = RUNS_TOTAL.set(runs_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_recording() {
        init_metrics().unwrap();
        if let Some(counter) = ATTEMPTS_TOTAL.get() {
            counter.with_label_values(&["pass", "export-test-model"]).inc();
        }
        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("codebench_attempts_total"));
    }
}
