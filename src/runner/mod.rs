//! Run orchestration.
//!
//! # Architecture
//!
//! ```text
//! RunConfig → RunScheduler → AttemptExecutor × (tasks × models × samples)
//!                                 │
//!                 prompt → model → patch (Sandbox) → TestRunner
//!                                 │
//!              ProgressDispatcher ← Attempt → aggregate → RunSummary → RunStore
//! ```
//!
//! # Example
//!
//! ```ignore
//! use codebench::runner::{HarnessSettings, RunConfig, RunScheduler};
//! use codebench::progress::ProgressDispatcher;
//!
//! let scheduler = RunScheduler::new(HarnessSettings::default(), gateway, store);
//! let config = RunConfig::new(["openai/gpt-4o"]).with_samples(3);
//! let summary = scheduler.run(config, ProgressDispatcher::new("run_1")).await?;
//! println!("accuracy: {:.1}%", summary.accuracy() * 100.0);
//! ```

pub mod attempt;
pub mod config;
pub mod result;
pub mod sandbox;
pub mod scheduler;
pub mod test_runner;

pub use attempt::{
    pip_install_command, AttemptExecutor, AttemptPhase, ExecutionContext, DEFAULT_INSTALL_TIMEOUT,
};
pub use config::{HarnessSettings, RunConfig, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_TOKENS};
pub use result::{
    Attempt, AttemptKey, AttemptStatus, OverallMetrics, RunMetrics, RunSummary, StatusCounts,
    Timing, TokenTotals, TokenUsage,
};
pub use sandbox::{Sandbox, SandboxError, REQUIREMENTS_FILE};
pub use scheduler::{attempt_keys, run_id_for, CancelHandle, RunScheduler, DEFAULT_MONITOR_INTERVAL};
pub use test_runner::{TestResult, TestRunner, TestRunnerError, DEFAULT_MAX_LOG_CHARS};
