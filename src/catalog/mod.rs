//! Task catalog.
//!
//! Tasks live under a root directory, one subdirectory per task:
//!
//! ```text
//! <tasks_root>/<task_id>/
//!     metadata.json      instructions file, workspace/tests dirs, eval block
//!     instructions.md
//!     workspace/         copied into every attempt's sandbox
//!     tests/             copied to <sandbox>/tests
//! ```
//!
//! The catalog is read-only; nothing under the root is ever modified.

pub mod loader;
pub mod task;

pub use loader::{TaskCatalog, TaskSelection};
pub use task::{
    EvalCommand, EvalMetadata, EvalStrategy, TaskDefinition, TaskMetadata,
    DEFAULT_TIMEOUT_SECONDS, METADATA_FILE,
};
