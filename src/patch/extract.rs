//! Locating a unified diff inside free-form model output.

use std::sync::LazyLock;

use regex::Regex;

/// CSI escape sequences (colors, cursor movement) that terminals emit.
static ANSI_ESCAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").ok());

/// A fenced code block found in model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// Info string after the opening fence, lowercased (e.g. `diff`).
    pub lang: String,
    /// Block contents, without the fences.
    pub body: String,
    /// Nearest non-empty line above the opening fence, if any.
    pub preceding_line: Option<String>,
}

impl FencedBlock {
    pub fn is_diff_fence(&self) -> bool {
        matches!(self.lang.as_str(), "diff" | "patch" | "udiff")
    }
}

/// Strip ANSI escapes and normalize line endings.
///
/// Returns an error when control escapes other than CSI sequences remain.
pub fn clean_patch_text(text: &str) -> Result<String, String> {
    let stripped = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    };
    if stripped.contains('\x1b') {
        return Err("patch contains unsupported control characters".to_string());
    }
    Ok(stripped.replace("\r\n", "\n").replace('\r', "\n"))
}

/// Split text into fenced code blocks. Unterminated fences run to the end.
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut last_text_line: Option<String> = None;
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let Some(info) = trimmed.strip_prefix("```") else {
            if !line.trim().is_empty() {
                last_text_line = Some(line.trim().to_string());
            }
            continue;
        };

        let lang = info.trim().to_ascii_lowercase();
        let mut body = Vec::new();
        for inner in lines.by_ref() {
            if inner.trim_start().starts_with("```") {
                break;
            }
            body.push(inner);
        }
        blocks.push(FencedBlock {
            lang,
            body: body.join("\n"),
            preceding_line: last_text_line.take(),
        });
    }
    blocks
}

/// Whether a line starts a file-level or hunk-level diff header.
pub fn is_diff_header(line: &str) -> bool {
    line.starts_with("diff --git ")
        || line.starts_with("--- ")
        || line.starts_with("+++ ")
        || line.trim_start().starts_with("@@ ")
        || line.trim_start() == "@@"
}

/// Whether a line could belong to a unified diff body.
fn is_diff_line(line: &str) -> bool {
    if line.is_empty() || is_diff_header(line) {
        return true;
    }
    const PREFIXES: &[&str] = &[
        " ",
        "+",
        "-",
        "\\",
        "index ",
        "new file mode",
        "deleted file mode",
        "old mode",
        "new mode",
        "similarity index",
        "dissimilarity index",
        "rename from",
        "rename to",
        "copy from",
        "copy to",
        "Binary files",
    ];
    PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Extract the diff text from model output.
///
/// Preference order: a ```diff/```patch fence, then any fence whose body
/// contains diff headers, then the first diff header in free text up to the
/// first line that cannot belong to a diff. Returns `None` when nothing
/// diff-like is present. The result always ends with a newline unless empty.
pub fn extract_diff(text: &str) -> Option<String> {
    let blocks = fenced_blocks(text);

    let body = blocks
        .iter()
        .find(|b| b.is_diff_fence())
        .or_else(|| blocks.iter().find(|b| b.body.lines().any(is_diff_header)))
        .map(|b| b.body.clone())
        .or_else(|| extract_unfenced(text))?;

    Some(finish(&body))
}

fn extract_unfenced(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|l| {
        l.starts_with("diff --git ") || l.starts_with("--- ") || l.trim_start().starts_with("@@ ")
    })?;
    let taken: Vec<&str> = lines[start..]
        .iter()
        .take_while(|l| is_diff_line(l))
        .copied()
        .collect();
    Some(taken.join("\n"))
}

fn finish(body: &str) -> String {
    let trimmed = body.trim_matches('\n').trim_end();
    if trimmed.trim().is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}
