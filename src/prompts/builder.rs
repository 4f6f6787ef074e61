//! Prompt builder for patch-generation attempts.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::catalog::TaskDefinition;
use crate::error::PromptError;

/// System message sent alongside every prompt.
pub const SYSTEM_PROMPT: &str = "You produce clean, minimal patches.";

/// File extensions whose contents are shown to the model.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "tsx", "go", "rs", "c", "cc", "cpp", "h", "hpp", "java", "md", "txt",
    "json", "yaml", "yml", "toml",
];

const PREAMBLE: &str = "You are an autonomous software developer. Apply a minimal fix to \
satisfy the task instructions and existing tests.";

const REPLY_FORMAT: &str = "Return a unified diff patch enclosed in a single ```diff fenced \
code block and nothing else.";

/// Whether a file's contents belong in the prompt, judged by extension.
pub fn should_include_in_prompt(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Builds prompts for a task.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    include_tests: bool,
}

impl PromptBuilder {
    pub fn new(include_tests: bool) -> Self {
        Self { include_tests }
    }

    pub fn include_tests(&self) -> bool {
        self.include_tests
    }

    /// Compose the prompt for `task`.
    ///
    /// Fails when the instructions are missing or empty, or when the
    /// workspace cannot be read.
    pub fn build(&self, task: &TaskDefinition) -> Result<String, PromptError> {
        let instructions = read_instructions(task)?;

        if !task.workspace_path.is_dir() {
            return Err(PromptError::MissingWorkspace {
                task_id: task.id.clone(),
                path: task.workspace_path.display().to_string(),
            });
        }

        let mut snippets = collect_snippets(&task.workspace_path, None)?;
        if self.include_tests {
            if let Some(tests) = task.tests_path.as_deref() {
                snippets.extend(collect_snippets(tests, Some("tests"))?);
            }
        }

        debug!(
            task_id = %task.id,
            snippets = snippets.len(),
            include_tests = self.include_tests,
            "Built prompt"
        );

        Ok(format!(
            "{PREAMBLE}\n\nTask instructions:\n{instructions}\n\n{REPLY_FORMAT}\n\nProject context:\n{}",
            snippets.join("\n\n")
        )
        .trim_end()
        .to_string())
    }
}

fn read_instructions(task: &TaskDefinition) -> Result<String, PromptError> {
    let path = &task.instructions_path;
    if !path.is_file() {
        return Err(PromptError::MissingInstructions {
            task_id: task.id.clone(),
            path: path.display().to_string(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|e| PromptError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let text = text.trim();
    if text.is_empty() {
        return Err(PromptError::EmptyInstructions(task.id.clone()));
    }
    Ok(text.to_string())
}

fn collect_snippets(dir: &Path, prefix: Option<&str>) -> Result<Vec<String>, PromptError> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| PromptError::Read {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        if entry.file_type().is_file() && should_include_in_prompt(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut snippets = Vec::with_capacity(files.len());
    for path in files {
        let rel = path.strip_prefix(dir).unwrap_or(&path);
        let rel = display_path(rel, prefix);
        match std::fs::read_to_string(&path) {
            Ok(content) => snippets.push(format!("File: {rel}\n```\n{}\n```", content.trim_end())),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                debug!(path = %rel, "Skipping non-UTF-8 file in prompt context");
            }
            Err(e) => {
                return Err(PromptError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(snippets)
}

fn display_path(rel: &Path, prefix: Option<&str>) -> String {
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    match prefix {
        Some(prefix) => format!("{prefix}/{joined}"),
        None => joined,
    }
}
