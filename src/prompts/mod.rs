//! Model-facing prompt construction.
//!
//! A prompt is a pure function of the task definition and the
//! `include_tests` flag: the task instructions, the reply format the
//! patch extractor expects, and the text sources of the workspace (and
//! optionally the tests) as fenced snippets.

pub mod builder;

pub use builder::{should_include_in_prompt, PromptBuilder, SUPPORTED_EXTENSIONS, SYSTEM_PROMPT};
