//! Applying parsed hunks to sandbox files.
//!
//! Matching follows `patch(1)`: each hunk is searched for outward from its
//! expected line, shifted by the drift of earlier hunks; when no exact match
//! exists, up to `fuzz` context lines are dropped from each edge and the
//! search repeats. A final pass compares lines ignoring trailing whitespace.
//! Everything is computed in memory; [`commit`] is the only writer.

use std::fs;
use std::path::{Path, PathBuf};

use super::parse::{strip_git_prefix, FilePatch, Hunk};
use crate::utils::validate_relative_path;

/// File contents split into lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileText {
    pub lines: Vec<String>,
    pub trailing_newline: bool,
}

impl FileText {
    pub fn parse(content: &str) -> Self {
        if content.is_empty() {
            return Self {
                lines: Vec::new(),
                trailing_newline: true,
            };
        }
        let trailing_newline = content.ends_with('\n');
        let body = content.strip_suffix('\n').unwrap_or(content);
        Self {
            lines: body.split('\n').map(String::from).collect(),
            trailing_newline,
        }
    }

    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }
}

/// Where a hunk landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkPlacement {
    /// 0-based index of the first replaced line.
    pub index: usize,
    /// Distance from the expected position.
    pub offset: isize,
    /// Context lines dropped from each edge.
    pub fuzz: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Compare {
    Exact,
    IgnoreTrailingWhitespace,
}

fn lines_match(actual: &[String], expected: &[&str], mode: Compare) -> bool {
    actual.len() == expected.len()
        && actual.iter().zip(expected).all(|(a, e)| match mode {
            Compare::Exact => a == e,
            Compare::IgnoreTrailingWhitespace => a.trim_end() == e.trim_end(),
        })
}

fn find_match(
    lines: &[String],
    pattern: &[&str],
    expected: isize,
    min_index: usize,
    mode: Compare,
) -> Option<usize> {
    if pattern.is_empty() {
        return Some(expected.clamp(min_index as isize, lines.len() as isize) as usize);
    }
    if pattern.len() > lines.len() {
        return None;
    }
    let max_start = lines.len() - pattern.len();
    if min_index > max_start {
        return None;
    }
    let expected = expected.clamp(min_index as isize, max_start as isize) as usize;
    let matches_at = |pos: usize| lines_match(&lines[pos..pos + pattern.len()], pattern, mode);

    for delta in 0..=(max_start - min_index) {
        if let Some(before) = expected.checked_sub(delta) {
            if before >= min_index && matches_at(before) {
                return Some(before);
            }
        }
        let after = expected + delta;
        if delta > 0 && after <= max_start && matches_at(after) {
            return Some(after);
        }
    }
    None
}

/// Apply one hunk in place.
///
/// `shift` is the net line drift from earlier hunks; `min_index` keeps
/// hunks in order. Returns the placement and the index just past the
/// inserted lines.
pub fn apply_hunk(
    text: &mut FileText,
    hunk: &Hunk,
    max_fuzz: usize,
    shift: isize,
    min_index: usize,
) -> Option<(HunkPlacement, usize)> {
    let old = hunk.old_lines();
    let new = hunk.new_lines();
    let lead = hunk.leading_context();
    let trail = hunk.trailing_context();
    let anchor = if old.is_empty() {
        hunk.old_start
    } else {
        hunk.old_start.saturating_sub(1)
    };

    for mode in [Compare::Exact, Compare::IgnoreTrailingWhitespace] {
        let mut tried: Vec<(usize, usize)> = Vec::new();
        for fuzz in 0..=max_fuzz {
            let top = fuzz.min(lead);
            let bottom = fuzz.min(trail);
            if tried.contains(&(top, bottom)) {
                continue;
            }
            tried.push((top, bottom));
            if !old.is_empty() && top + bottom >= old.len() {
                continue;
            }

            let old_slice = &old[top..old.len() - bottom];
            let new_slice = &new[top..new.len() - bottom];
            let expected = (anchor + top) as isize + shift;

            let Some(pos) = find_match(&text.lines, old_slice, expected, min_index, mode) else {
                continue;
            };

            let end = pos + old_slice.len();
            let reaches_eof = end == text.lines.len();
            let was_empty = text.lines.is_empty();
            text.lines
                .splice(pos..end, new_slice.iter().map(|s| s.to_string()));

            if was_empty {
                text.trailing_newline = !hunk.new_no_newline;
            } else if reaches_eof && bottom == 0 && (hunk.old_no_newline || hunk.new_no_newline) {
                text.trailing_newline = !hunk.new_no_newline;
            }

            let placement = HunkPlacement {
                index: pos,
                offset: pos as isize - expected,
                fuzz,
            };
            return Some((placement, pos + new_slice.len()));
        }
    }
    None
}

/// Result of applying a file's hunks in memory.
#[derive(Debug, Clone)]
pub struct FileApplication {
    pub text: FileText,
    pub applied: Vec<usize>,
    pub failed: Vec<usize>,
}

/// Apply each hunk in order, skipping those that do not match.
pub fn apply_hunks(original: &FileText, hunks: &[Hunk], max_fuzz: usize) -> FileApplication {
    let mut text = original.clone();
    let mut applied = Vec::new();
    let mut failed = Vec::new();
    let mut shift: isize = 0;
    let mut min_index = 0usize;

    for (idx, hunk) in hunks.iter().enumerate() {
        match apply_hunk(&mut text, hunk, max_fuzz, shift, min_index) {
            Some((placement, next_index)) => {
                let old_len = hunk.old_lines().len() as isize;
                let new_len = hunk.new_lines().len() as isize;
                shift += placement.offset + (new_len - old_len);
                min_index = next_index;
                applied.push(idx);
            }
            None => failed.push(idx),
        }
    }

    FileApplication {
        text,
        applied,
        failed,
    }
}

/// What committing a file plan does to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Write(String),
    Delete,
    Unchanged,
}

/// In-memory outcome for one file of a diff.
#[derive(Debug, Clone)]
pub struct FilePlan {
    /// Path relative to the sandbox root.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub change: FileChange,
    pub applied: Vec<usize>,
    pub failed: Vec<usize>,
    pub total: usize,
}

impl FilePlan {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Where a file patch points inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub exists: bool,
}

/// Resolve a file patch's target, trying the git-stripped path first.
///
/// Fails when the path escapes the sandbox or when a non-addition points
/// at a missing file.
pub fn resolve_target(root: &Path, patch: &FilePatch) -> Result<ResolvedTarget, String> {
    let raw = patch
        .raw_target()
        .ok_or_else(|| "hunk has no file header".to_string())?;
    let stripped = strip_git_prefix(raw);

    let mut candidates = vec![stripped];
    if stripped != raw {
        candidates.push(raw);
    }

    for candidate in &candidates {
        validate_relative_path(candidate)
            .map_err(|e| format!("path '{}' rejected: {}", candidate, e))?;
    }

    for candidate in &candidates {
        let abs = root.join(candidate);
        if abs.is_file() {
            if patch.is_addition() {
                return Err(format!("'{}' is marked as new but already exists", candidate));
            }
            return Ok(ResolvedTarget {
                rel_path: candidate.to_string(),
                abs_path: abs,
                exists: true,
            });
        }
    }

    let creates = patch.is_addition()
        || (!patch.is_deletion() && patch.hunks.iter().all(|h| h.old_lines().is_empty()));
    if creates {
        return Ok(ResolvedTarget {
            rel_path: stripped.to_string(),
            abs_path: root.join(stripped),
            exists: false,
        });
    }
    Err(format!("target file '{}' does not exist", stripped))
}

/// Compute what applying `patch` would do, without touching disk.
pub fn plan_file(root: &Path, patch: &FilePatch, max_fuzz: usize) -> Result<FilePlan, String> {
    let target = resolve_target(root, patch)?;
    let original = if target.exists {
        let content = fs::read_to_string(&target.abs_path)
            .map_err(|e| format!("cannot read '{}': {}", target.rel_path, e))?;
        FileText::parse(&content)
    } else {
        FileText::parse("")
    };

    let result = apply_hunks(&original, &patch.hunks, max_fuzz);
    let change = if patch.is_deletion() && result.failed.is_empty() && result.text.lines.is_empty()
    {
        FileChange::Delete
    } else if result.applied.is_empty() || (target.exists && result.text == original) {
        FileChange::Unchanged
    } else {
        FileChange::Write(result.text.render())
    };

    Ok(FilePlan {
        rel_path: target.rel_path,
        abs_path: target.abs_path,
        change,
        applied: result.applied,
        failed: result.failed,
        total: patch.hunks.len(),
    })
}

/// Write planned changes; returns the paths that changed.
pub fn commit(plans: &[FilePlan]) -> std::io::Result<Vec<String>> {
    let mut changed = Vec::new();
    for plan in plans {
        match &plan.change {
            FileChange::Write(content) => {
                if let Some(parent) = plan.abs_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&plan.abs_path, content)?;
                changed.push(plan.rel_path.clone());
            }
            FileChange::Delete => {
                fs::remove_file(&plan.abs_path)?;
                changed.push(plan.rel_path.clone());
            }
            FileChange::Unchanged => {}
        }
    }
    Ok(changed)
}
