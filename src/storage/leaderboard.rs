//! Best run per model across stored summaries.
//!
//! A model's standing in one run is computed from its own attempts in
//! that run, so multi-model runs contribute a candidate to each model.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runner::RunSummary;

/// One model's row on the leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub model: String,
    pub best_accuracy: Option<f64>,
    pub cost_at_best: Option<f64>,
    pub duration_at_best: Option<f64>,
    /// Runs that included the model.
    pub runs: usize,
    /// Run holding the best result.
    pub best_run_id: String,
}

#[derive(Debug, Clone)]
struct Candidate {
    run_id: String,
    accuracy: Option<f64>,
    cost: Option<f64>,
    duration: Option<f64>,
    timestamp: DateTime<Utc>,
}

/// Rank every model seen in `runs`.
///
/// Per model the best run has the highest accuracy, then the lowest cost,
/// then the shortest duration, then the newest timestamp; a missing value
/// always loses to a present one. Rows are sorted by accuracy descending,
/// cost and duration ascending, then model id.
pub fn rank_models(runs: &[RunSummary]) -> Vec<LeaderboardEntry> {
    let mut groups: BTreeMap<String, (usize, Candidate)> = BTreeMap::new();

    for summary in runs {
        for (model, candidate) in candidates(summary) {
            match groups.get_mut(&model) {
                Some((count, best)) => {
                    *count += 1;
                    if is_better(&candidate, best) {
                        *best = candidate;
                    }
                }
                None => {
                    groups.insert(model, (1, candidate));
                }
            }
        }
    }

    let mut rows: Vec<LeaderboardEntry> = groups
        .into_iter()
        .map(|(model, (runs, best))| LeaderboardEntry {
            model,
            best_accuracy: best.accuracy,
            cost_at_best: best.cost,
            duration_at_best: best.duration,
            runs,
            best_run_id: best.run_id,
        })
        .collect();

    rows.sort_by(|a, b| {
        desc_present_first(a.best_accuracy, b.best_accuracy)
            .then_with(|| asc_present_first(a.cost_at_best, b.cost_at_best))
            .then_with(|| asc_present_first(a.duration_at_best, b.duration_at_best))
            .then_with(|| a.model.cmp(&b.model))
    });
    rows
}

fn candidates(summary: &RunSummary) -> BTreeMap<String, Candidate> {
    let mut per_model: BTreeMap<String, Vec<&crate::runner::Attempt>> = BTreeMap::new();
    for attempt in &summary.attempts {
        per_model.entry(attempt.key.model.clone()).or_default().push(attempt);
    }

    per_model
        .into_iter()
        .map(|(model, attempts)| {
            let passes = attempts.iter().filter(|a| a.passed()).count();
            let costs: Vec<f64> = attempts.iter().filter_map(|a| a.cost_usd).collect();
            let candidate = Candidate {
                run_id: summary.run_id.clone(),
                accuracy: Some(passes as f64 / attempts.len() as f64),
                cost: (!costs.is_empty()).then(|| costs.iter().sum()),
                duration: Some(attempts.iter().map(|a| a.duration_seconds).sum()),
                timestamp: summary.timestamp_utc,
            };
            (model, candidate)
        })
        .collect()
}

fn is_better(candidate: &Candidate, incumbent: &Candidate) -> bool {
    let ordering = desc_present_first(candidate.accuracy, incumbent.accuracy)
        .then_with(|| asc_present_first(candidate.cost, incumbent.cost))
        .then_with(|| asc_present_first(candidate.duration, incumbent.duration))
        .then_with(|| incumbent.timestamp.cmp(&candidate.timestamp));
    ordering == Ordering::Less
}

/// Higher values first; `None` last.
fn desc_present_first(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Lower values first; `None` last.
fn asc_present_first(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
