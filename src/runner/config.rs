//! Configuration for evaluation runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::TaskSelection;
use crate::llm::CompletionParams;
use crate::patch::{PatchPolicy, DEFAULT_FUZZ};
use crate::runner::test_runner::DEFAULT_MAX_LOG_CHARS;
use crate::utils::validate_task_id;

/// Default worker pool size.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default completion budget per attempt.
pub const DEFAULT_MAX_TOKENS: u32 = 800;

fn default_samples() -> u32 {
    1
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_tasks() -> TaskSelection {
    TaskSelection::All
}

/// What to evaluate. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model identifiers, in the order they appear in the summary.
    pub models: Vec<String>,
    /// `"all"` or an explicit list of task ids.
    #[serde(default = "default_tasks")]
    pub tasks: TaskSelection,
    /// Samples per (task, model).
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub allow_incomplete_diffs: bool,
    #[serde(default)]
    pub allow_diff_rewrite_fallback: bool,
    /// Show the task's test files to the model.
    #[serde(default)]
    pub include_tests: bool,
    /// Pip-install a task's `requirements.txt` into the sandbox before patching.
    #[serde(default)]
    pub install_deps: bool,
    /// Replay this text instead of calling a model.
    #[serde(default)]
    pub response_text: Option<String>,
    /// Caller-chosen run id; generated when absent.
    #[serde(default)]
    pub run_id: Option<String>,
}

impl RunConfig {
    /// Creates a run configuration with defaults for everything but the models.
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            tasks: TaskSelection::All,
            samples: 1,
            temperature: 0.0,
            max_tokens: DEFAULT_MAX_TOKENS,
            allow_incomplete_diffs: false,
            allow_diff_rewrite_fallback: false,
            include_tests: false,
            install_deps: false,
            response_text: None,
            run_id: None,
        }
    }

    /// Load a run description from a YAML file.
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn with_tasks(mut self, tasks: TaskSelection) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_incomplete_diffs(mut self, allow: bool) -> Self {
        self.allow_incomplete_diffs = allow;
        self
    }

    pub fn with_rewrite_fallback(mut self, allow: bool) -> Self {
        self.allow_diff_rewrite_fallback = allow;
        self
    }

    pub fn with_include_tests(mut self, include: bool) -> Self {
        self.include_tests = include;
        self
    }

    pub fn with_install_deps(mut self, install: bool) -> Self {
        self.install_deps = install;
        self
    }

    pub fn with_response_text(mut self, text: impl Into<String>) -> Self {
        self.response_text = Some(text.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Check the configuration before a run starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.models.is_empty() {
            return Err("at least one model is required".to_string());
        }
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.trim().is_empty() {
                return Err("model ids must not be empty".to_string());
            }
            if !seen.insert(model.as_str()) {
                return Err(format!("model '{}' is listed twice", model));
            }
        }
        if self.samples == 0 {
            return Err("samples must be at least 1".to_string());
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!("temperature {} is outside [0, 2]", self.temperature));
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be positive".to_string());
        }
        if let TaskSelection::Ids(ids) = &self.tasks {
            if ids.is_empty() {
                return Err("task list is empty".to_string());
            }
        }
        if self.response_text.is_some() && (self.models.len() != 1 || self.samples != 1) {
            return Err("response replay supports a single model and a single sample".to_string());
        }
        if let Some(run_id) = &self.run_id {
            validate_task_id(run_id).map_err(|e| format!("run_id: {}", e))?;
        }
        Ok(())
    }

    pub fn completion_params(&self) -> CompletionParams {
        CompletionParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn patch_policy(&self, fuzz: usize) -> PatchPolicy {
        PatchPolicy::default()
            .with_incomplete_diffs(self.allow_incomplete_diffs)
            .with_rewrite_fallback(self.allow_diff_rewrite_fallback)
            .with_fuzz(fuzz)
    }
}

/// Process-level defaults shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessSettings {
    pub tasks_root: PathBuf,
    /// Where run directories are created; `None` disables artifacts.
    pub runs_root: Option<PathBuf>,
    pub max_concurrency: usize,
    /// Cap on captured characters per output stream.
    pub max_log_chars: usize,
    /// Context lines a hunk may ignore at each edge.
    pub patch_fuzz: usize,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            tasks_root: PathBuf::from("tasks"),
            runs_root: Some(PathBuf::from("runs")),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_log_chars: DEFAULT_MAX_LOG_CHARS,
            patch_fuzz: DEFAULT_FUZZ,
        }
    }
}

impl HarnessSettings {
    pub fn with_tasks_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.tasks_root = root.into();
        self
    }

    pub fn with_runs_root(mut self, root: Option<PathBuf>) -> Self {
        self.runs_root = root;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_max_log_chars(mut self, n: usize) -> Self {
        self.max_log_chars = n;
        self
    }

    pub fn with_patch_fuzz(mut self, fuzz: usize) -> Self {
        self.patch_fuzz = fuzz;
        self
    }
}
