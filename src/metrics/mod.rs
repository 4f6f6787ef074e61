//! Run metrics: the pure summary reducer and Prometheus export.
//!
//! [`aggregate`] turns a run's attempts into the numbers stored in its
//! summary. The Prometheus side is optional operational telemetry.
//!
//! # Example
//!
//! ```ignore
//! use codebench::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run evaluations ...
//! std::fs::write("metrics.prom", export_metrics())?;
//! ```

pub mod aggregator;
pub mod collectors;
pub mod prometheus;

pub use aggregator::{aggregate, RunAggregate};
pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
