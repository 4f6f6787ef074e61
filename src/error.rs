//! Error types for codebench operations.
//!
//! Defines the error taxonomy shared across subsystems:
//! - Task catalog loading and resolution
//! - Prompt construction
//! - Model provider interactions
//! - Run-level fatal conditions
//!
//! Sandbox, test runner and storage errors live next to the code that
//! produces them and are re-exported from their modules.

use thiserror::Error;

use crate::storage::StoreError;

/// Errors that can occur while loading or resolving tasks.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Task '{0}' not found in catalog")]
    TaskNotFound(String),

    #[error("Invalid task id '{id}': {reason}")]
    InvalidTaskId { id: String, reason: String },

    #[error("Invalid metadata for task '{task_id}': {reason}")]
    InvalidMetadata { task_id: String, reason: String },

    #[error("Tasks root does not exist: {0}")]
    MissingRoot(String),

    #[error("No tasks selected")]
    EmptySelection,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while building a prompt for a task.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Instructions file missing for task '{task_id}': {path}")]
    MissingInstructions { task_id: String, path: String },

    #[error("Instructions for task '{0}' are empty")]
    EmptyInstructions(String),

    #[error("Workspace directory missing for task '{task_id}': {path}")]
    MissingWorkspace { task_id: String, path: String },

    #[error("Failed to read '{path}': {reason}")]
    Read { path: String, reason: String },
}

/// Errors that can occur during model provider operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: OPENROUTER_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: CODEBENCH_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Model '{0}' returned an empty response")]
    EmptyResponse(String),

    #[error("Replay error: {0}")]
    Replay(String),
}

/// Conditions that abort a whole run.
///
/// Attempt-level failures never surface here; they are recorded on the
/// attempt and the run proceeds.
#[derive(Debug, Error)]
pub enum RunFatalError {
    #[error("Task resolution failed: {0}")]
    CatalogResolution(#[from] CatalogError),

    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("Run store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Scheduler failure: {0}")]
    Scheduler(String),
}
