//! Reduction of a run's attempts into its summary metrics.
//!
//! Everything here is a pure function of the attempt list, so the
//! scheduler can call it once after the last attempt finishes.

use std::collections::BTreeMap;

use crate::runner::{
    Attempt, AttemptStatus, OverallMetrics, RunMetrics, StatusCounts, TokenTotals, Timing,
};

/// Metrics, token totals and timing derived from one run's attempts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunAggregate {
    pub metrics: RunMetrics,
    pub token_usage: TokenTotals,
    pub timing: Timing,
}

/// Reduce `attempts` to the run's metrics.
///
/// # Arguments
///
/// * `attempts` - Terminal attempts of the run, in any order
/// * `models` - Models of the run; each gets an entry even without attempts
/// * `samples` - Samples per (task, model), used to decide pass@k
pub fn aggregate(attempts: &[Attempt], models: &[String], samples: u32) -> RunAggregate {
    RunAggregate {
        metrics: run_metrics(attempts, models, samples),
        token_usage: token_totals(attempts),
        timing: timing(attempts),
    }
}

fn run_metrics(attempts: &[Attempt], models: &[String], samples: u32) -> RunMetrics {
    let mut metrics = RunMetrics {
        overall: overall(attempts),
        ..RunMetrics::default()
    };

    for model in models {
        let model_attempts: Vec<&Attempt> =
            attempts.iter().filter(|a| a.key.model == *model).collect();
        let detail = model_detail(&model_attempts, samples);
        metrics.model_attempt_success.insert(model.clone(), detail.attempt_success);
        metrics.model_accuracy.insert(model.clone(), detail.accuracy);
        metrics.pass_at_1.insert(model.clone(), detail.pass_at_1);
        metrics.pass_at_k.insert(model.clone(), detail.pass_at_k);
    }

    let per_model: Vec<f64> = metrics.model_attempt_success.values().flatten().copied().collect();
    metrics.overall.macro_attempt_success = mean(&per_model);
    metrics
}

#[derive(Default)]
struct ModelDetail {
    attempt_success: Option<f64>,
    accuracy: Option<f64>,
    pass_at_1: Option<f64>,
    pass_at_k: Option<f64>,
}

fn model_detail(attempts: &[&Attempt], samples: u32) -> ModelDetail {
    if attempts.is_empty() {
        return ModelDetail::default();
    }

    let passes = attempts.iter().filter(|a| a.passed()).count();

    let mut by_task: BTreeMap<&str, Vec<&Attempt>> = BTreeMap::new();
    for attempt in attempts {
        by_task.entry(attempt.key.task_id.as_str()).or_default().push(attempt);
    }

    let mut solved = Vec::with_capacity(by_task.len());
    let mut first_passed = Vec::with_capacity(by_task.len());
    for task_attempts in by_task.values() {
        solved.push(indicator(task_attempts.iter().any(|a| a.passed())));
        let first = task_attempts.iter().min_by_key(|a| a.key.sample_index);
        first_passed.push(indicator(first.is_some_and(|a| a.passed())));
    }

    let accuracy = mean(&solved);
    let pass_at_1 = mean(&first_passed);
    ModelDetail {
        attempt_success: Some(passes as f64 / attempts.len() as f64),
        accuracy,
        pass_at_1,
        pass_at_k: if samples > 1 { accuracy } else { pass_at_1 },
    }
}

fn overall(attempts: &[Attempt]) -> OverallMetrics {
    let mut counts = StatusCounts::default();
    for attempt in attempts {
        match attempt.status {
            AttemptStatus::Pass => counts.pass += 1,
            AttemptStatus::Fail => counts.fail += 1,
            // A non-terminal attempt here never finished; it counts as an error.
            _ => counts.error += 1,
        }
    }
    let macro_model_accuracy = if attempts.is_empty() {
        0.0
    } else {
        counts.pass as f64 / attempts.len() as f64
    };
    OverallMetrics {
        macro_model_accuracy,
        macro_attempt_success: None,
        attempts: attempts.len(),
        status_counts: counts,
    }
}

fn token_totals(attempts: &[Attempt]) -> TokenTotals {
    let mut totals = TokenTotals::default();
    for attempt in attempts {
        if let Some(usage) = attempt.usage {
            totals.prompt_tokens += usage.prompt_tokens;
            totals.completion_tokens += usage.completion_tokens;
        }
        if let Some(cost) = attempt.cost_usd {
            totals.total_cost_usd += cost;
        }
    }
    totals.total_cost_usd = round_cost(totals.total_cost_usd);
    totals
}

fn timing(attempts: &[Attempt]) -> Timing {
    Timing {
        total_duration_seconds: attempts.iter().map(|a| a.duration_seconds).sum(),
        total_api_latency_seconds: attempts.iter().filter_map(|a| a.api_latency_seconds).sum(),
    }
}

fn indicator(hit: bool) -> f64 {
    if hit {
        1.0
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn round_cost(cost: f64) -> f64 {
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{AttemptKey, TokenUsage};

    fn attempt(task: &str, model: &str, sample: u32, status: AttemptStatus) -> Attempt {
        let mut attempt = Attempt::pending(AttemptKey::new(task, model, sample));
        attempt.status = status;
        attempt.duration_seconds = 1.5;
        attempt
    }

    fn models(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_three_of_four_passes() {
        let attempts = vec![
            attempt("t1", "m1", 0, AttemptStatus::Pass),
            attempt("t2", "m1", 0, AttemptStatus::Pass),
            attempt("t3", "m1", 0, AttemptStatus::Pass),
            attempt("t4", "m1", 0, AttemptStatus::Fail),
        ];
        let agg = aggregate(&attempts, &models(&["m1"]), 1);
        assert_eq!(agg.metrics.overall.macro_model_accuracy, 0.75);
        assert_eq!(agg.metrics.overall.attempts, 4);
        assert_eq!(agg.timing.total_duration_seconds, 6.0);
    }

    #[test]
    fn test_errors_count_as_zero() {
        let attempts = vec![
            attempt("t1", "m1", 0, AttemptStatus::Pass),
            attempt("t2", "m1", 0, AttemptStatus::Error),
        ];
        let agg = aggregate(&attempts, &models(&["m1"]), 1);
        assert_eq!(agg.metrics.overall.macro_model_accuracy, 0.5);
        assert_eq!(
            agg.metrics.overall.status_counts,
            StatusCounts {
                pass: 1,
                fail: 0,
                error: 1
            }
        );
    }

    #[test]
    fn test_empty_run() {
        let agg = aggregate(&[], &models(&["m1"]), 1);
        assert_eq!(agg.metrics.overall.macro_model_accuracy, 0.0);
        assert_eq!(agg.metrics.model_accuracy["m1"], None);
        assert_eq!(agg.metrics.overall.macro_attempt_success, None);
    }

    #[test]
    fn test_pass_at_k_with_samples() {
        let attempts = vec![
            attempt("t1", "m1", 0, AttemptStatus::Fail),
            attempt("t1", "m1", 1, AttemptStatus::Pass),
            attempt("t2", "m1", 0, AttemptStatus::Pass),
            attempt("t2", "m1", 1, AttemptStatus::Pass),
            attempt("t1", "m2", 0, AttemptStatus::Fail),
            attempt("t1", "m2", 1, AttemptStatus::Fail),
            attempt("t2", "m2", 1, AttemptStatus::Fail),
            attempt("t2", "m2", 0, AttemptStatus::Pass),
        ];
        let agg = aggregate(&attempts, &models(&["m1", "m2"]), 2);
        let m = &agg.metrics;
        assert_eq!(m.pass_at_1["m1"], Some(0.5));
        assert_eq!(m.pass_at_k["m1"], Some(1.0));
        assert_eq!(m.model_accuracy["m1"], Some(1.0));
        assert_eq!(m.model_attempt_success["m1"], Some(0.75));
        assert_eq!(m.pass_at_1["m2"], Some(0.5));
        assert_eq!(m.pass_at_k["m2"], Some(0.5));
        assert_eq!(m.model_attempt_success["m2"], Some(0.25));
        assert_eq!(m.overall.macro_attempt_success, Some(0.5));
        assert_eq!(m.overall.macro_model_accuracy, 0.5);
    }

    #[test]
    fn test_single_sample_pass_at_k_equals_pass_at_1() {
        let attempts = vec![
            attempt("t1", "m1", 0, AttemptStatus::Pass),
            attempt("t2", "m1", 0, AttemptStatus::Fail),
        ];
        let agg = aggregate(&attempts, &models(&["m1"]), 1);
        assert_eq!(agg.metrics.pass_at_k["m1"], agg.metrics.pass_at_1["m1"]);
    }

    #[test]
    fn test_token_and_cost_totals_skip_missing() {
        let mut a = attempt("t1", "m1", 0, AttemptStatus::Pass);
        a.usage = Some(TokenUsage::new(100, 20));
        a.cost_usd = Some(0.0000012);
        a.api_latency_seconds = Some(2.0);
        let mut b = attempt("t2", "m1", 0, AttemptStatus::Fail);
        b.usage = Some(TokenUsage::new(50, 5));
        b.cost_usd = Some(0.0000021);
        let c = attempt("t3", "m1", 0, AttemptStatus::Error);

        let agg = aggregate(&[a, b, c], &models(&["m1"]), 1);
        assert_eq!(agg.token_usage.prompt_tokens, 150);
        assert_eq!(agg.token_usage.completion_tokens, 25);
        assert_eq!(agg.token_usage.total_cost_usd, 0.000003);
        assert_eq!(agg.timing.total_api_latency_seconds, 2.0);
    }
}
