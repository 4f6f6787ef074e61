//! Live progress for runs.
//!
//! Each run owns a [`ProgressDispatcher`]; a process-wide [`RunRegistry`]
//! maps run ids to dispatchers so observers can attach by id.
//!
//! ```ignore
//! use codebench::progress::RunRegistry;
//! use tokio_stream::StreamExt;
//!
//! let registry = RunRegistry::new();
//! let dispatcher = registry.register("run-1")?;
//! let mut events = dispatcher.subscribe();
//! while let Some(event) = events.next().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

pub mod dispatcher;
pub mod events;
pub mod monitor;
pub mod registry;

pub use dispatcher::{ProgressDispatcher, DEFAULT_SUBSCRIBER_BUFFER};
pub use events::{AttemptEvent, ProgressEvent};
pub use monitor::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use registry::{RegistryError, RunRegistry};
