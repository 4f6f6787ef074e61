//! Turning model output into sandbox edits.
//!
//! The pipeline is: clean the raw text, extract a diff, parse and validate
//! it against the sandbox, then walk the enabled [`PatchStrategy`] chain
//! until one succeeds. Only the sandbox is ever written.
//!
//! ```ignore
//! use codebench::patch::{PatchApplier, PatchPolicy};
//!
//! let applier = PatchApplier::new(PatchPolicy::default().with_incomplete_diffs(true));
//! let report = applier.apply(&response_text, sandbox.root());
//! if report.is_rejected() {
//!     tracing::warn!(reason = ?report.reason, "Patch rejected");
//! }
//! ```

pub mod apply;
pub mod extract;
pub mod parse;
pub mod strategy;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use apply::{apply_hunks, FileText};
pub use extract::{clean_patch_text, extract_diff};
pub use parse::{is_probably_valid, parse_patch, FilePatch, Hunk, ParseError, PatchSet};
pub use strategy::{strategy_chain, DiffState, PatchContext, PatchStrategy, StrategyOutcome};

/// Default number of context lines that may be ignored at each hunk edge.
pub const DEFAULT_FUZZ: usize = 2;

/// Tolerance flags for patch application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPolicy {
    pub allow_incomplete_diffs: bool,
    pub allow_diff_rewrite_fallback: bool,
    pub fuzz: usize,
}

impl Default for PatchPolicy {
    fn default() -> Self {
        Self {
            allow_incomplete_diffs: false,
            allow_diff_rewrite_fallback: false,
            fuzz: DEFAULT_FUZZ,
        }
    }
}

impl PatchPolicy {
    pub fn with_incomplete_diffs(mut self, allow: bool) -> Self {
        self.allow_incomplete_diffs = allow;
        self
    }

    pub fn with_rewrite_fallback(mut self, allow: bool) -> Self {
        self.allow_diff_rewrite_fallback = allow;
        self
    }

    pub fn with_fuzz(mut self, fuzz: usize) -> Self {
        self.fuzz = fuzz;
        self
    }
}

/// How a patch ended up in the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    /// The diff applied cleanly as a whole.
    Applied,
    /// Some fallback produced the edit.
    Rewritten,
    /// Nothing usable; the sandbox is untouched.
    Rejected,
}

impl PatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOutcome::Applied => "applied",
            PatchOutcome::Rewritten => "rewritten",
            PatchOutcome::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one [`PatchApplier::apply`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReport {
    pub outcome: PatchOutcome,
    /// Strategy that produced the edit; `None` when rejected.
    pub strategy: Option<String>,
    /// Why each strategy failed, when rejected.
    pub reason: Option<String>,
    pub files_changed: Vec<String>,
    pub hunks_applied: usize,
    pub hunks_total: usize,
    /// Hunk header counts were rewritten from the hunk bodies.
    pub counts_normalized: bool,
    /// The extracted diff, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl PatchReport {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            outcome: PatchOutcome::Rejected,
            strategy: None,
            reason: Some(reason.into()),
            files_changed: Vec::new(),
            hunks_applied: 0,
            hunks_total: 0,
            counts_normalized: false,
            diff: None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.outcome == PatchOutcome::Rejected
    }
}

/// Applies model output to a sandbox under a [`PatchPolicy`].
///
/// Synchronous and filesystem-bound; call it from `spawn_blocking`.
#[derive(Debug, Clone, Default)]
pub struct PatchApplier {
    policy: PatchPolicy,
}

impl PatchApplier {
    pub fn new(policy: PatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PatchPolicy {
        &self.policy
    }

    /// Classify the extracted diff without touching the sandbox.
    pub fn inspect(diff: Option<&str>, root: &Path) -> DiffState {
        let Some(diff) = diff else {
            return DiffState::Unparseable("no unified diff found in response".to_string());
        };
        if diff.trim().is_empty() {
            return DiffState::Unparseable("diff is empty".to_string());
        }
        if !is_probably_valid(diff) {
            return DiffState::Unparseable("text does not look like a unified diff".to_string());
        }
        let set = match parse_patch(diff) {
            Ok(set) => set,
            Err(e) => return DiffState::Unparseable(format!("malformed diff: {}", e)),
        };
        if set.is_empty() {
            return DiffState::Unparseable("diff contains no hunks".to_string());
        }
        for file in &set.files {
            if let Err(reason) = apply::resolve_target(root, file) {
                return DiffState::Invalid(reason);
            }
        }
        DiffState::Parsed(set)
    }

    /// Apply `raw` model output to the sandbox rooted at `root`.
    pub fn apply(&self, raw: &str, root: &Path) -> PatchReport {
        let text = match clean_patch_text(raw) {
            Ok(text) => text,
            Err(reason) => return PatchReport::rejected(reason),
        };
        let diff = extract_diff(&text);
        let state = Self::inspect(diff.as_deref(), root);

        let (hunks_total, counts_normalized) = match &state {
            DiffState::Parsed(set) => (set.hunk_count(), set.counts_normalized),
            _ => (0, false),
        };

        let ctx = PatchContext {
            text: &text,
            diff: &state,
            root,
            fuzz: self.policy.fuzz,
        };

        let mut failures = Vec::new();
        for strategy in strategy_chain(&self.policy) {
            match strategy.attempt(&ctx) {
                Ok(done) => {
                    debug!(
                        strategy = strategy.name(),
                        files = done.files_changed.len(),
                        hunks = done.hunks_applied,
                        "Patch strategy succeeded"
                    );
                    return PatchReport {
                        outcome: done.outcome,
                        strategy: Some(strategy.name().to_string()),
                        reason: None,
                        files_changed: done.files_changed,
                        hunks_applied: done.hunks_applied,
                        hunks_total,
                        counts_normalized,
                        diff,
                    };
                }
                Err(reason) => {
                    debug!(strategy = strategy.name(), reason = %reason, "Patch strategy failed");
                    failures.push(format!("{}: {}", strategy.name(), reason));
                }
            }
        }

        PatchReport {
            hunks_total,
            counts_normalized,
            diff,
            ..PatchReport::rejected(failures.join("; "))
        }
    }
}
