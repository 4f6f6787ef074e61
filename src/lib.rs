//! codebench: run orchestration for evaluating code-generation models.
//!
//! A run fans a set of tasks out across models and samples. Each attempt
//! prompts a model, applies the returned diff in a private sandbox and
//! runs the task's eval command. Attempt results are aggregated into a
//! summary that is written to disk, persisted and streamed to observers.

// Core modules
pub mod catalog;
pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod patch;
pub mod progress;
pub mod prompts;
pub mod runner;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{CatalogError, LlmError, PromptError, RunFatalError};
pub use storage::StoreError;
