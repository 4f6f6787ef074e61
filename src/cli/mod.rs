//! Command-line interface for codebench.
//!
//! Provides commands for running evaluations, previewing prompts, listing
//! the task catalog and inspecting stored runs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
