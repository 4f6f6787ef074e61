//! Background progress monitor for evaluation runs.
//!
//! Periodically logs run counters (dispatched, in flight, pass, fail, error)
//! so operators can follow long runs without reading every attempt line.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::runner::result::AttemptStatus;

/// Snapshot of run counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub dispatched: usize,
    pub in_flight: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn finished(&self) -> usize {
        self.passed + self.failed + self.errored
    }
}

/// Shared atomic counters for run progress.
///
/// Cloned into attempt tasks; the monitor reads them periodically.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    pub dispatched: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub passed: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub errored: Arc<AtomicUsize>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// An attempt acquired a worker slot.
    pub fn attempt_started(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// An attempt reached a terminal status.
    pub fn attempt_finished(&self, status: AttemptStatus) {
        // Saturate: a panicked attempt may finish without having started.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        let counter = match status {
            AttemptStatus::Pass => &self.passed,
            AttemptStatus::Fail => &self.failed,
            _ => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs run progress.
///
/// Call [`ProgressMonitor::stop`] to cancel; dropping also stops it at the
/// next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a monitor that logs every `interval`.
    ///
    /// # Arguments
    ///
    /// * `run_id` - Included in every log line
    /// * `counters` - Shared counters updated by attempt tasks
    /// * `total` - Number of attempts in the run
    /// * `interval` - How often to log
    pub fn start(
        run_id: impl Into<String>,
        counters: ProgressCounters,
        total: usize,
        interval: Duration,
    ) -> Self {
        let run_id = run_id.into();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let pct = if total > 0 {
                    (snap.finished() as f64 / total as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };

                tracing::info!(
                    run_id = %run_id,
                    dispatched = snap.dispatched,
                    in_flight = snap.in_flight,
                    pass = snap.passed,
                    fail = snap.failed,
                    error = snap.errored,
                    total = total,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    "Run progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
