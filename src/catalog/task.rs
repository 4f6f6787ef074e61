//! Task definitions and the on-disk metadata format they are loaded from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::utils::{validate_relative_path, validate_task_id};

/// Name of the per-task metadata file.
pub const METADATA_FILE: &str = "metadata.json";

/// Default wall-clock budget for a task's eval command.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

fn default_workspace_dir() -> String {
    "workspace".to_string()
}

fn default_tests_dir() -> String {
    "tests".to_string()
}

fn default_eval_argv() -> Vec<String> {
    vec!["pytest".to_string(), "-q".to_string()]
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Raw `metadata.json` contents.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub instructions_file: String,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default = "default_tests_dir")]
    pub tests_dir: String,
    #[serde(default)]
    pub eval: EvalMetadata,
}

/// The `eval` block of `metadata.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalMetadata {
    #[serde(default = "default_eval_argv")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Default for EvalMetadata {
    fn default() -> Self {
        Self {
            command: default_eval_argv(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

/// A subprocess invocation rooted at the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalCommand {
    /// Program followed by its arguments. Never passed through a shell.
    pub argv: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory relative to the sandbox root.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl EvalCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The program to execute, if the argv is non-empty.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Human-readable form for logs.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Supported ways of evaluating a candidate solution.
///
/// The task language is catalog metadata only; it never selects a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalStrategy {
    /// Run an argv in the sandbox and judge by exit code.
    Subprocess(EvalCommand),
}

/// An immutable, fully resolved task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub language: String,
    pub eval: EvalStrategy,
    pub timeout_seconds: u64,
    pub task_dir: PathBuf,
    pub instructions_path: PathBuf,
    pub workspace_path: PathBuf,
    /// Present only when the tests directory exists on disk.
    pub tests_path: Option<PathBuf>,
}

impl TaskDefinition {
    /// Build a definition from parsed metadata rooted at `task_dir`.
    pub fn from_metadata(
        task_id: &str,
        task_dir: &Path,
        metadata: TaskMetadata,
    ) -> Result<Self, CatalogError> {
        validate_task_id(task_id).map_err(|e| CatalogError::InvalidTaskId {
            id: task_id.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(declared) = metadata.id.as_deref() {
            if declared != task_id {
                return Err(CatalogError::InvalidMetadata {
                    task_id: task_id.to_string(),
                    reason: format!("declared id '{}' does not match directory", declared),
                });
            }
        }

        let invalid = |reason: String| CatalogError::InvalidMetadata {
            task_id: task_id.to_string(),
            reason,
        };

        for (field, value) in [
            ("instructions_file", metadata.instructions_file.as_str()),
            ("workspace_dir", metadata.workspace_dir.as_str()),
            ("tests_dir", metadata.tests_dir.as_str()),
        ] {
            validate_relative_path(value).map_err(|e| invalid(format!("{}: {}", field, e)))?;
        }
        if let Some(dir) = metadata.eval.working_dir.as_deref() {
            validate_relative_path(dir).map_err(|e| invalid(format!("eval.working_dir: {}", e)))?;
        }
        if metadata.eval.command.is_empty() {
            return Err(invalid("eval.command must not be empty".to_string()));
        }
        if metadata.eval.timeout_seconds == 0 {
            return Err(invalid("eval.timeout_seconds must be positive".to_string()));
        }

        let tests_path = task_dir.join(&metadata.tests_dir);
        let command = EvalCommand {
            argv: metadata.eval.command,
            env: metadata.eval.env,
            working_dir: metadata.eval.working_dir,
        };

        Ok(Self {
            id: task_id.to_string(),
            language: metadata.language.unwrap_or_else(|| "unknown".to_string()),
            eval: EvalStrategy::Subprocess(command),
            timeout_seconds: metadata.eval.timeout_seconds,
            task_dir: task_dir.to_path_buf(),
            instructions_path: task_dir.join(&metadata.instructions_file),
            workspace_path: task_dir.join(&metadata.workspace_dir),
            tests_path: tests_path.is_dir().then_some(tests_path),
        })
    }

    /// The eval command regardless of strategy.
    pub fn eval_command(&self) -> &EvalCommand {
        match &self.eval {
            EvalStrategy::Subprocess(command) => command,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}
