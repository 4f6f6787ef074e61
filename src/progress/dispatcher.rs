//! Run-scoped fan-out of progress events.
//!
//! Publishing never blocks: each subscriber has a bounded channel and is
//! dropped as soon as its buffer is full or its receiver is gone. The full
//! history is kept so late subscribers see the run from `init` onwards.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::events::ProgressEvent;

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct DispatcherState {
    history: Vec<ProgressEvent>,
    subscribers: Vec<mpsc::Sender<ProgressEvent>>,
    closed: bool,
}

/// Publish point for one run. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ProgressDispatcher {
    run_id: String,
    buffer: usize,
    state: Arc<Mutex<DispatcherState>>,
}

impl ProgressDispatcher {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            buffer: DEFAULT_SUBSCRIBER_BUFFER,
            state: Arc::new(Mutex::new(DispatcherState::default())),
        }
    }

    /// Sets the per-subscriber buffer size for future subscribers.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to the run. Past events are replayed first.
    ///
    /// After a terminal event the returned stream yields the history and ends.
    pub fn subscribe(&self) -> ReceiverStream<ProgressEvent> {
        let mut state = self.lock();
        let capacity = self.buffer.max(state.history.len() + 1);
        let (tx, rx) = mpsc::channel(capacity);
        for event in &state.history {
            if tx.try_send(event.clone()).is_err() {
                break;
            }
        }
        if !state.closed {
            state.subscribers.push(tx);
        }
        ReceiverStream::new(rx)
    }

    /// Deliver `event` to every live subscriber without waiting.
    ///
    /// Returns `false` when the run already ended and the event was ignored.
    pub fn publish(&self, event: ProgressEvent) -> bool {
        let mut state = self.lock();
        if state.closed {
            debug!(run_id = %self.run_id, kind = event.kind(), "Ignoring event after terminal event");
            return false;
        }

        let run_id = &self.run_id;
        state.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(run_id = %run_id, "Dropping slow progress subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if event.is_terminal() {
            state.closed = true;
            // Dropping the senders ends every subscriber stream.
            state.subscribers.clear();
        }
        state.history.push(event);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Events published so far.
    pub fn history(&self) -> Vec<ProgressEvent> {
        self.lock().history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn init() -> ProgressEvent {
        ProgressEvent::Init {
            run_id: "r1".into(),
            models: vec!["m1".into()],
            tasks: vec!["t1".into()],
            samples: 1,
            provider: "replay".into(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_sees_events_in_order_and_stream_ends() {
        let dispatcher = ProgressDispatcher::new("r1");
        let stream = dispatcher.subscribe();

        dispatcher.publish(init());
        dispatcher.publish(ProgressEvent::error("boom"));

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "init");
        assert_eq!(events[1].kind(), "error");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_history() {
        let dispatcher = ProgressDispatcher::new("r1");
        dispatcher.publish(init());

        let mut stream = dispatcher.subscribe();
        assert_eq!(stream.next().await.unwrap().kind(), "init");

        dispatcher.publish(ProgressEvent::error("late"));
        assert_eq!(stream.next().await.unwrap().kind(), "error");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_replays_and_ends() {
        let dispatcher = ProgressDispatcher::new("r1");
        dispatcher.publish(init());
        dispatcher.publish(ProgressEvent::error("done"));

        let events: Vec<_> = dispatcher.subscribe().collect().await;
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_events_after_terminal_ignored() {
        let dispatcher = ProgressDispatcher::new("r1");
        assert!(dispatcher.publish(ProgressEvent::error("first")));
        assert!(!dispatcher.publish(ProgressEvent::error("second")));
        assert_eq!(dispatcher.history().len(), 1);
        assert!(dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_without_blocking() {
        let dispatcher = ProgressDispatcher::new("r1").with_buffer(2);
        let _slow = dispatcher.subscribe();
        let mut fast = dispatcher.subscribe();

        // The fast subscriber drains as we go; the slow one never reads.
        for _ in 0..5 {
            dispatcher.publish(init());
            assert_eq!(fast.next().await.unwrap().kind(), "init");
        }
        assert_eq!(dispatcher.subscriber_count(), 1);
    }

    #[test]
    fn test_closed_receiver_removed() {
        let dispatcher = ProgressDispatcher::new("r1");
        drop(dispatcher.subscribe());
        dispatcher.publish(init());
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
