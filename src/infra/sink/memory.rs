//! In-memory event sink for tests and local development.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{Event, EventSink, SinkError};

#[derive(Debug, Default)]
struct SinkState {
    batches: Vec<Vec<Event>>,
    attempts: usize,
    fail_next: usize,
    delay: Option<Duration>,
}

/// Sink that records every accepted batch.
///
/// Failures and latency can be injected to exercise the forwarder's error paths.
#[derive(Debug, Default)]
pub struct InMemorySink {
    state: Mutex<SinkState>,
}

impl InMemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Delay every call by `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Accepted batches in arrival order.
    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.state.lock().batches.clone()
    }

    /// All accepted events, flattened.
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().batches.iter().flatten().cloned().collect()
    }

    /// Number of `send_many` calls, including rejected ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

#[async_trait]
impl EventSink for InMemorySink {
    async fn send_many(&self, events: Vec<Event>) -> Result<(), SinkError> {
        let delay = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SinkError::Rejected(format!(
                "injected failure for {} events",
                events.len()
            )));
        }
        state.batches.push(events);
        Ok(())
    }
}
