//! Ordered fallback chain for applying model output.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

use super::apply::{commit, plan_file, FilePlan};
use super::extract::fenced_blocks;
use super::parse::PatchSet;
use super::{PatchOutcome, PatchPolicy};
use crate::utils::validate_relative_path;

/// `File: path/to/file.py` marker preceding a fenced block.
static FILE_MARKER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^[#*\s]*(?:file|filename|path)\s*:\s*[`*]*([^`*\s]+)[`*]*\s*$").ok()
});

/// Extensions treated as editable source for the single-file fallback.
const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "tsx", "go", "rs", "c", "cc", "cpp", "h", "hpp", "java",
];

/// What the diff extraction stage produced.
#[derive(Debug, Clone)]
pub enum DiffState {
    /// Parsed and structurally valid against the sandbox.
    Parsed(PatchSet),
    /// Parsed, but targets are missing or escape the sandbox.
    Invalid(String),
    /// No unified diff could be parsed at all.
    Unparseable(String),
}

/// Inputs shared by every strategy.
pub struct PatchContext<'a> {
    pub text: &'a str,
    pub diff: &'a DiffState,
    pub root: &'a Path,
    pub fuzz: usize,
}

/// A successful strategy result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyOutcome {
    pub outcome: PatchOutcome,
    pub files_changed: Vec<String>,
    pub hunks_applied: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// Every hunk applies, or nothing is written.
    Strict,
    /// Apply whichever hunks match.
    Partial,
    /// Overwrite files from fenced code blocks.
    FullFileRewrite,
}

/// Strategies enabled by `policy`, in the order they are tried.
pub fn strategy_chain(policy: &PatchPolicy) -> Vec<PatchStrategy> {
    let mut chain = vec![PatchStrategy::Strict];
    if policy.allow_incomplete_diffs {
        chain.push(PatchStrategy::Partial);
    }
    if policy.allow_diff_rewrite_fallback {
        chain.push(PatchStrategy::FullFileRewrite);
    }
    chain
}

impl PatchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            PatchStrategy::Strict => "strict",
            PatchStrategy::Partial => "partial",
            PatchStrategy::FullFileRewrite => "full_file_rewrite",
        }
    }

    pub fn attempt(&self, ctx: &PatchContext<'_>) -> Result<StrategyOutcome, String> {
        match self {
            PatchStrategy::Strict => apply_strict(ctx),
            PatchStrategy::Partial => apply_partial(ctx),
            PatchStrategy::FullFileRewrite => apply_rewrite(ctx),
        }
    }
}

fn parsed<'a>(ctx: &'a PatchContext<'_>) -> Result<&'a PatchSet, String> {
    match ctx.diff {
        DiffState::Parsed(set) => Ok(set),
        DiffState::Invalid(reason) | DiffState::Unparseable(reason) => Err(reason.clone()),
    }
}

fn plan_all(ctx: &PatchContext<'_>, set: &PatchSet) -> Result<Vec<FilePlan>, String> {
    set.files
        .iter()
        .map(|file| plan_file(ctx.root, file, ctx.fuzz))
        .collect()
}

fn apply_strict(ctx: &PatchContext<'_>) -> Result<StrategyOutcome, String> {
    let set = parsed(ctx)?;
    let plans = plan_all(ctx, set)?;

    let failures: Vec<String> = plans
        .iter()
        .filter(|p| !p.is_complete())
        .map(|p| {
            let hunks: Vec<String> = p.failed.iter().map(|i| (i + 1).to_string()).collect();
            format!("hunk {} of '{}' did not apply", hunks.join(","), p.rel_path)
        })
        .collect();
    if !failures.is_empty() {
        return Err(failures.join(", "));
    }

    let files_changed = commit(&plans).map_err(|e| format!("write failed: {}", e))?;
    Ok(StrategyOutcome {
        outcome: PatchOutcome::Applied,
        files_changed,
        hunks_applied: set.hunk_count(),
    })
}

fn apply_partial(ctx: &PatchContext<'_>) -> Result<StrategyOutcome, String> {
    let set = parsed(ctx)?;
    let plans = plan_all(ctx, set)?;

    let hunks_applied: usize = plans.iter().map(|p| p.applied.len()).sum();
    if hunks_applied == 0 {
        return Err("no hunk applied".to_string());
    }

    let files_changed = commit(&plans).map_err(|e| format!("write failed: {}", e))?;
    Ok(StrategyOutcome {
        outcome: PatchOutcome::Rewritten,
        files_changed,
        hunks_applied,
    })
}

fn is_test_path(rel: &str) -> bool {
    rel == "tests" || rel.starts_with("tests/")
}

/// Editable source files in the sandbox, excluding tests.
fn editable_sources(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
        })
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .filter(|rel| !is_test_path(rel))
        .collect();
    files.sort();
    files
}

fn with_newline(body: &str) -> String {
    if body.ends_with('\n') {
        body.to_string()
    } else {
        format!("{}\n", body)
    }
}

fn apply_rewrite(ctx: &PatchContext<'_>) -> Result<StrategyOutcome, String> {
    if !matches!(ctx.diff, DiffState::Unparseable(_)) {
        return Err("a unified diff was present".to_string());
    }

    let blocks: Vec<_> = fenced_blocks(ctx.text)
        .into_iter()
        .filter(|b| !b.is_diff_fence() && !b.body.trim().is_empty())
        .collect();

    let mut writes: Vec<(String, String)> = Vec::new();
    if let Some(re) = FILE_MARKER.as_ref() {
        for block in &blocks {
            let Some(caps) = block.preceding_line.as_deref().and_then(|l| re.captures(l)) else {
                continue;
            };
            let rel = caps[1].trim_start_matches("./").to_string();
            validate_relative_path(&rel).map_err(|e| format!("path '{}' rejected: {}", rel, e))?;
            if is_test_path(&rel) {
                return Err(format!("refusing to rewrite test file '{}'", rel));
            }
            writes.push((rel, with_newline(&block.body)));
        }
    }

    if writes.is_empty() {
        if blocks.len() != 1 {
            return Err(format!(
                "expected one fenced block or File: markers, found {} blocks",
                blocks.len()
            ));
        }
        let sources = editable_sources(ctx.root);
        let [only] = sources.as_slice() else {
            return Err(format!(
                "single-block rewrite needs exactly one source file, workspace has {}",
                sources.len()
            ));
        };
        writes.push((only.clone(), with_newline(&blocks[0].body)));
    }

    let mut files_changed = Vec::new();
    for (rel, content) in writes {
        let path = ctx.root.join(&rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("write failed: {}", e))?;
        }
        fs::write(&path, content).map_err(|e| format!("write failed: {}", e))?;
        files_changed.push(rel);
    }

    Ok(StrategyOutcome {
        outcome: PatchOutcome::Rewritten,
        files_changed,
        hunks_applied: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::parse::parse_patch;
    use tempfile::TempDir;

    fn sandbox(files: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = tmp.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        tmp
    }

    fn ctx<'a>(text: &'a str, diff: &'a DiffState, root: &'a Path) -> PatchContext<'a> {
        PatchContext {
            text,
            diff,
            root,
            fuzz: 2,
        }
    }

    #[test]
    fn test_chain_order() {
        let policy = PatchPolicy {
            allow_incomplete_diffs: true,
            allow_diff_rewrite_fallback: true,
            ..PatchPolicy::default()
        };
        assert_eq!(
            strategy_chain(&policy),
            vec![
                PatchStrategy::Strict,
                PatchStrategy::Partial,
                PatchStrategy::FullFileRewrite
            ]
        );
        assert_eq!(strategy_chain(&PatchPolicy::default()), vec![PatchStrategy::Strict]);
    }

    #[test]
    fn test_strict_is_atomic() {
        let tmp = sandbox(&[("a.py", "x = 1\n"), ("b.py", "y = 1\n")]);
        let set = parse_patch(
            "--- a/a.py\n+++ b/a.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n--- a/b.py\n+++ b/b.py\n@@ -1 +1 @@\n-nope\n+y = 2\n",
        )
        .unwrap();
        let diff = DiffState::Parsed(set);

        let err = PatchStrategy::Strict
            .attempt(&ctx("", &diff, tmp.path()))
            .unwrap_err();
        assert!(err.contains("b.py"));
        assert_eq!(fs::read_to_string(tmp.path().join("a.py")).unwrap(), "x = 1\n");

        let partial = PatchStrategy::Partial
            .attempt(&ctx("", &diff, tmp.path()))
            .unwrap();
        assert_eq!(partial.outcome, PatchOutcome::Rewritten);
        assert_eq!(partial.files_changed, vec!["a.py"]);
        assert_eq!(partial.hunks_applied, 1);
        assert_eq!(fs::read_to_string(tmp.path().join("a.py")).unwrap(), "x = 2\n");
    }

    #[test]
    fn test_rewrite_only_when_unparseable() {
        let tmp = sandbox(&[("a.py", "x = 1\n")]);
        let diff = DiffState::Parsed(PatchSet::default());
        assert!(PatchStrategy::FullFileRewrite
            .attempt(&ctx("```python\nx = 2\n```", &diff, tmp.path()))
            .is_err());
    }

    #[test]
    fn test_rewrite_single_source_file() {
        let tmp = sandbox(&[
            ("solution.py", "x = 1\n"),
            ("tests/test_solution.py", "assert True\n"),
            ("README.md", "docs\n"),
        ]);
        let diff = DiffState::Unparseable("no diff".into());
        let out = PatchStrategy::FullFileRewrite
            .attempt(&ctx("Here:\n```python\nx = 2\n```\n", &diff, tmp.path()))
            .unwrap();
        assert_eq!(out.files_changed, vec!["solution.py"]);
        assert_eq!(fs::read_to_string(tmp.path().join("solution.py")).unwrap(), "x = 2\n");
    }

    #[test]
    fn test_rewrite_with_file_markers() {
        let tmp = sandbox(&[("a.py", "1\n"), ("pkg/b.py", "2\n")]);
        let diff = DiffState::Unparseable("no diff".into());
        let text = "File: a.py\n```python\none\n```\n**File: `pkg/b.py`**\n```python\ntwo\n```\n";
        let out = PatchStrategy::FullFileRewrite
            .attempt(&ctx(text, &diff, tmp.path()))
            .unwrap();
        assert_eq!(out.files_changed, vec!["a.py", "pkg/b.py"]);
        assert_eq!(fs::read_to_string(tmp.path().join("pkg/b.py")).unwrap(), "two\n");
    }

    #[test]
    fn test_rewrite_refuses_tests_and_traversal() {
        let tmp = sandbox(&[("a.py", "1\n")]);
        let diff = DiffState::Unparseable("no diff".into());
        for text in [
            "File: tests/test_a.py\n```python\npass\n```",
            "File: ../escape.py\n```python\npass\n```",
        ] {
            assert!(PatchStrategy::FullFileRewrite
                .attempt(&ctx(text, &diff, tmp.path()))
                .is_err());
        }
        assert!(!tmp.path().join("tests").exists());
    }

    #[test]
    fn test_rewrite_ambiguous_workspace() {
        let tmp = sandbox(&[("a.py", "1\n"), ("b.py", "2\n")]);
        let diff = DiffState::Unparseable("no diff".into());
        let err = PatchStrategy::FullFileRewrite
            .attempt(&ctx("```python\nx\n```", &diff, tmp.path()))
            .unwrap_err();
        assert!(err.contains("exactly one source file"));
    }
}
