//! Unified diff parsing.
//!
//! The parser is tolerant of what models actually produce: wrong hunk
//! counts, missing file headers, bare empty lines standing in for empty
//! context lines, and prose between file sections. Hunk counts are always
//! recomputed from the hunk body; [`PatchSet::counts_normalized`] records
//! whether any header disagreed.

use std::fmt;

use thiserror::Error;

/// A structural problem that makes the diff unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

impl HunkLine {
    pub fn text(&self) -> &str {
        match self {
            HunkLine::Context(s) | HunkLine::Remove(s) | HunkLine::Add(s) => s,
        }
    }
}

/// A single `@@` hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based start line in the old file (0 for insertions into empty files).
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
    /// The old side's last line has no trailing newline.
    pub old_no_newline: bool,
    /// The new side's last line has no trailing newline.
    pub new_no_newline: bool,
}

impl Hunk {
    /// Lines the hunk expects to find (context and removals).
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Add(_)))
            .map(HunkLine::text)
            .collect()
    }

    /// Lines the hunk leaves behind (context and additions).
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Remove(_)))
            .map(HunkLine::text)
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        self.lines.iter().any(|l| !matches!(l, HunkLine::Context(_)))
    }

    /// Number of leading context lines.
    pub fn leading_context(&self) -> usize {
        self.lines
            .iter()
            .take_while(|l| matches!(l, HunkLine::Context(_)))
            .count()
    }

    /// Number of trailing context lines.
    pub fn trailing_context(&self) -> usize {
        self.lines
            .iter()
            .rev()
            .take_while(|l| matches!(l, HunkLine::Context(_)))
            .count()
    }
}

/// The changes for one file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilePatch {
    /// Path from the `---` line; `None` for `/dev/null` or a missing header.
    pub old_path: Option<String>,
    /// Path from the `+++` line; `None` for `/dev/null` or a missing header.
    pub new_path: Option<String>,
    /// Whether any file header was present.
    pub has_header: bool,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn is_addition(&self) -> bool {
        self.has_header && self.old_path.is_none() && self.new_path.is_some()
    }

    pub fn is_deletion(&self) -> bool {
        self.has_header && self.new_path.is_none() && self.old_path.is_some()
    }

    /// The path the patch is about, before prefix stripping.
    pub fn raw_target(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }
}

impl fmt::Display for FilePatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw_target() {
            Some(path) => write!(f, "{}", strip_git_prefix(path)),
            None => write!(f, "<unnamed>"),
        }
    }
}

/// A parsed diff.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchSet {
    pub files: Vec<FilePatch>,
    /// At least one hunk header's counts disagreed with its body.
    pub counts_normalized: bool,
}

impl PatchSet {
    pub fn hunk_count(&self) -> usize {
        self.files.iter().map(|f| f.hunks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hunk_count() == 0
    }

    pub fn has_changes(&self) -> bool {
        self.files.iter().flat_map(|f| &f.hunks).any(Hunk::has_changes)
    }
}

/// Strip a git-style `a/` or `b/` prefix.
pub fn strip_git_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Cheap plausibility check run before parsing. Never panics.
///
/// Accepts text with file headers and changes, hunk headers and changes,
/// at least two change lines, or two file headers plus a hunk header.
pub fn is_probably_valid(text: &str) -> bool {
    let mut headers = 0usize;
    let mut hunks = 0usize;
    let mut changes = 0usize;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("diff --git ")
        {
            headers += 1;
        } else if line.trim_start().starts_with("@@") {
            hunks += 1;
        } else if line.starts_with('+') || line.starts_with('-') {
            changes += 1;
        }
    }

    (headers >= 1 && changes >= 1)
        || (hunks >= 1 && changes >= 1)
        || changes >= 2
        || (headers >= 2 && hunks >= 1)
}

fn parse_header_path(rest: &str) -> Option<String> {
    let path = rest.split('\t').next().unwrap_or(rest).trim();
    let path = path.trim_matches('"');
    if path.is_empty() || path == "/dev/null" {
        None
    } else {
        Some(path.to_string())
    }
}

fn parse_range(token: &str, sign: char) -> Option<(usize, usize)> {
    let body = token.strip_prefix(sign)?;
    match body.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((body.parse().ok()?, 1)),
    }
}

/// Parse `@@ -a,b +c,d @@ section` into `(a, b, c, d)`.
pub fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = line.trim_start().strip_prefix("@@")?;
    let end = rest.find("@@")?;
    let mut tokens = rest[..end].split_whitespace();
    let (old_start, old_count) = parse_range(tokens.next()?, '-')?;
    let (new_start, new_count) = parse_range(tokens.next()?, '+')?;
    if tokens.next().is_some() {
        return None;
    }
    Some((old_start, old_count, new_start, new_count))
}

fn git_header_paths(rest: &str) -> (Option<String>, Option<String>) {
    // "a/path b/path"; paths with spaces are ambiguous and left to ---/+++.
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => (Some(a.to_string()), Some(b.to_string())),
        _ => (None, None),
    }
}

fn starts_file_pair(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("--- ") && lines.get(i + 1).is_some_and(|n| n.starts_with("+++ "))
}

/// Parse a unified diff.
pub fn parse_patch(text: &str) -> Result<PatchSet, ParseError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut set = PatchSet::default();
    let mut current: Option<FilePatch> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                set.files.push(done);
            }
            let (old_path, new_path) = git_header_paths(rest);
            current = Some(FilePatch {
                old_path,
                new_path,
                has_header: true,
                hunks: Vec::new(),
            });
            i += 1;
            continue;
        }

        if starts_file_pair(&lines, i) {
            let old_path = parse_header_path(&line[4..]);
            let new_path = parse_header_path(&lines[i + 1][4..]);
            // A ---/+++ pair directly after "diff --git" refines that entry.
            let refine = current
                .as_ref()
                .is_some_and(|c| c.has_header && c.hunks.is_empty());
            if refine {
                if let Some(c) = current.as_mut() {
                    c.old_path = old_path;
                    c.new_path = new_path;
                }
            } else {
                if let Some(done) = current.take() {
                    set.files.push(done);
                }
                current = Some(FilePatch {
                    old_path,
                    new_path,
                    has_header: true,
                    hunks: Vec::new(),
                });
            }
            i += 2;
            continue;
        }

        if line.trim_start().starts_with("@@") {
            let (old_start, old_count, new_start, new_count) = parse_hunk_header(line)
                .ok_or_else(|| ParseError {
                    line: i + 1,
                    reason: format!("malformed hunk header '{}'", line.trim()),
                })?;
            i += 1;
            let (hunk, consumed, normalized) =
                parse_hunk_body(&lines[i..], old_start, old_count, new_start, new_count);
            i += consumed;
            set.counts_normalized |= normalized;
            current
                .get_or_insert_with(FilePatch::default)
                .hunks
                .push(hunk);
            continue;
        }

        if let Some(rest) = line.strip_prefix("rename from ") {
            if let Some(c) = current.as_mut() {
                c.old_path = Some(rest.trim().to_string());
            }
        } else if let Some(rest) = line.strip_prefix("rename to ") {
            if let Some(c) = current.as_mut() {
                c.new_path = Some(rest.trim().to_string());
            }
        }
        // Other metadata and interleaved prose are skipped.
        i += 1;
    }

    if let Some(done) = current.take() {
        set.files.push(done);
    }
    // Mode-only or binary sections carry nothing to apply.
    set.files.retain(|f| !f.hunks.is_empty());
    Ok(set)
}

/// Parse hunk body lines; returns the hunk, lines consumed and whether the
/// header counts had to be corrected.
fn parse_hunk_body(
    lines: &[&str],
    old_start: usize,
    header_old: usize,
    new_start: usize,
    header_new: usize,
) -> (Hunk, usize, bool) {
    let mut body: Vec<HunkLine> = Vec::new();
    // Whether each body line came from a bare empty line.
    let mut bare: Vec<bool> = Vec::new();
    let mut old_no_newline = false;
    let mut new_no_newline = false;
    let mut consumed = 0;

    while consumed < lines.len() {
        let line = lines[consumed];
        if line.starts_with("@@") || line.starts_with("diff --git ") {
            break;
        }
        if starts_file_pair(lines, consumed) {
            break;
        }
        match line.chars().next() {
            Some(' ') => {
                body.push(HunkLine::Context(line[1..].to_string()));
                bare.push(false);
            }
            Some('+') => {
                body.push(HunkLine::Add(line[1..].to_string()));
                bare.push(false);
            }
            Some('-') => {
                body.push(HunkLine::Remove(line[1..].to_string()));
                bare.push(false);
            }
            Some('\\') => match body.last() {
                Some(HunkLine::Add(_)) => new_no_newline = true,
                Some(HunkLine::Remove(_)) => old_no_newline = true,
                Some(HunkLine::Context(_)) => {
                    old_no_newline = true;
                    new_no_newline = true;
                }
                None => {}
            },
            None => {
                body.push(HunkLine::Context(String::new()));
                bare.push(true);
            }
            Some(_) => break,
        }
        consumed += 1;
    }

    let count = |body: &[HunkLine]| {
        let old = body.iter().filter(|l| !matches!(l, HunkLine::Add(_))).count();
        let new = body.iter().filter(|l| !matches!(l, HunkLine::Remove(_))).count();
        (old, new)
    };

    // Bare trailing empty lines are separators unless the header says otherwise.
    while bare.last() == Some(&true) {
        let (old, new) = count(body.as_slice());
        if old == header_old && new == header_new {
            break;
        }
        body.pop();
        bare.pop();
    }

    let (old_count, new_count) = count(body.as_slice());
    let normalized = old_count != header_old || new_count != header_new;

    let hunk = Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: body,
        old_no_newline,
        new_no_newline,
    };
    (hunk, consumed, normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "--- a/src/x.py\n+++ b/src/x.py\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n";

    #[test]
    fn test_probably_valid_cases() {
        assert!(!is_probably_valid(""));
        assert!(is_probably_valid("@@ -1 +1 @@\n-a\n+b\n"));
        assert!(!is_probably_valid("--- a/x\n+++ b/x\n"));
        assert!(is_probably_valid("+one\n+two\n+three\n"));
        assert!(is_probably_valid("--- a/x\n+++ b/x\n@@ -1 +1 @@\n ctx\n"));
        assert!(is_probably_valid("--- a/x\r\n+++ b/x\r\n@@ -1 +1 @@\r\n-a\r\n+b\r\n"));
        assert!(is_probably_valid("   @@ -1 +1 @@\n-a\n+b\n"));
        assert!(!is_probably_valid("just some prose\nwith - dashes inside"));
    }

    #[test]
    fn test_parse_simple() {
        let set = parse_patch(SIMPLE).unwrap();
        assert_eq!(set.files.len(), 1);
        let file = &set.files[0];
        assert_eq!(file.old_path.as_deref(), Some("a/src/x.py"));
        assert_eq!(file.to_string(), "src/x.py");
        let hunk = &file.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count, hunk.new_count), (1, 3, 3));
        assert_eq!(hunk.old_lines(), vec!["a", "b", "c"]);
        assert_eq!(hunk.new_lines(), vec!["a", "B", "c"]);
        assert!(!set.counts_normalized);
    }

    #[test]
    fn test_parse_normalizes_wrong_counts() {
        let text = "--- a/x\n+++ b/x\n@@ -1,10 +1,12 @@\n a\n-b\n+B\n";
        let set = parse_patch(text).unwrap();
        let hunk = &set.files[0].hunks[0];
        assert_eq!((hunk.old_count, hunk.new_count), (2, 2));
        assert!(set.counts_normalized);
    }

    #[test]
    fn test_parse_multiple_files_and_hunks() {
        let text = "diff --git a/one.py b/one.py\nindex 123..456 100644\n--- a/one.py\n+++ b/one.py\n@@ -1 +1 @@\n-x\n+y\n@@ -10,2 +10,2 @@\n p\n-q\n+r\ndiff --git a/two.py b/two.py\n--- a/two.py\n+++ b/two.py\n@@ -1 +1,2 @@\n k\n+l\n";
        let set = parse_patch(text).unwrap();
        assert_eq!(set.files.len(), 2);
        assert_eq!(set.files[0].hunks.len(), 2);
        assert_eq!(set.files[1].hunks.len(), 1);
        assert_eq!(set.hunk_count(), 3);
    }

    #[test]
    fn test_parse_new_and_deleted_files() {
        let text = "--- /dev/null\n+++ b/new.py\n@@ -0,0 +1,2 @@\n+a\n+b\n--- a/old.py\n+++ /dev/null\n@@ -1 +0,0 @@\n-gone\n";
        let set = parse_patch(text).unwrap();
        assert!(set.files[0].is_addition());
        assert!(set.files[1].is_deletion());
    }

    #[test]
    fn test_parse_headerless_hunk() {
        let set = parse_patch("@@ -1 +1 @@\n-a\n+b\n").unwrap();
        assert_eq!(set.files.len(), 1);
        assert!(!set.files[0].has_header);
        assert!(set.files[0].raw_target().is_none());
    }

    #[test]
    fn test_parse_malformed_header() {
        let err = parse_patch("--- a/x\n+++ b/x\n@@ garbage @@\n-a\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_parse_no_newline_marker() {
        let text = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n\\ No newline at end of file\n";
        let hunk = &parse_patch(text).unwrap().files[0].hunks[0];
        assert!(hunk.old_no_newline);
        assert!(hunk.new_no_newline);
        assert_eq!(hunk.lines.len(), 2);
    }

    #[test]
    fn test_parse_bare_empty_lines() {
        // Empty context line in the middle, separator line at the end.
        let text = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n\n-b\n+c\n\n";
        let hunk = &parse_patch(text).unwrap().files[0].hunks[0];
        assert_eq!(hunk.old_lines(), vec!["a", "", "b"]);
        assert_eq!(hunk.new_lines(), vec!["a", "", "c"]);
    }

    #[test]
    fn test_parse_stops_at_prose() {
        let text = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\nThat should do it.\n";
        let set = parse_patch(text).unwrap();
        assert_eq!(set.files[0].hunks[0].lines.len(), 2);
    }

    #[test]
    fn test_hunk_header_variants() {
        assert_eq!(parse_hunk_header("@@ -1 +1 @@"), Some((1, 1, 1, 1)));
        assert_eq!(parse_hunk_header("@@ -3,0 +4,2 @@ def f():"), Some((3, 0, 4, 2)));
        assert_eq!(parse_hunk_header("  @@ -1,2 +1,3 @@"), Some((1, 2, 1, 3)));
        assert_eq!(parse_hunk_header("@@ -a +b @@"), None);
        assert_eq!(parse_hunk_header("@@ -1 +1"), None);
    }

    #[test]
    fn test_header_path_timestamp() {
        assert_eq!(
            parse_header_path("a/x.py\t2024-01-01 00:00:00"),
            Some("a/x.py".to_string())
        );
        assert_eq!(parse_header_path("/dev/null"), None);
    }

    #[test]
    fn test_strip_git_prefix() {
        assert_eq!(strip_git_prefix("a/src/x.py"), "src/x.py");
        assert_eq!(strip_git_prefix("b/x.py"), "x.py");
        assert_eq!(strip_git_prefix("x.py"), "x.py");
    }
}
