//! Shared utility functions for codebench.
//!
//! Path validation for task ids and sandbox-relative paths, plus text
//! truncation used for captured process output and artifacts.

pub mod paths;
pub mod text;

pub use paths::{resolve_within, validate_relative_path, validate_task_id};
pub use text::{truncate_chars, truncate_with_marker};
