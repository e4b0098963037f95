//! Batch forwarder configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`BatchForwarder`](crate::core::BatchForwarder).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Records per batch; also the capacity of the input channel.
    pub batch_size: usize,
    /// Idle time after the last received record before a partial batch is flushed.
    pub batch_timeout_ms: u64,
    /// Upper bound for a single sink call.
    pub send_timeout_ms: u64,
    /// Prefix of every emitted event name.
    pub event_prefix: String,
    /// Collapse single-statement transactions into their DML record.
    pub unwrap_transactions: bool,
}

impl ForwarderConfig {
    /// Default idle timeout before flushing.
    pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 100;
    /// Default sink call timeout.
    pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;
    /// Default event name prefix.
    pub const DEFAULT_EVENT_PREFIX: &'static str = "pg";
    /// Default batch size.
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    /// Create a configuration with the default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the idle flush timeout.
    #[must_use]
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the sink call timeout.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the event name prefix.
    #[must_use]
    pub fn with_event_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.event_prefix = prefix.into();
        self
    }

    /// Enable or disable transaction unwrapping.
    #[must_use]
    pub const fn with_unwrap_transactions(mut self, enabled: bool) -> Self {
        self.unwrap_transactions = enabled;
        self
    }

    /// Idle flush timeout as a [`Duration`].
    #[must_use]
    pub const fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Sink call timeout as a [`Duration`].
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Validate forwarder configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".into());
        }
        if self.batch_timeout_ms == 0 {
            return Err("batch_timeout_ms must be greater than 0".into());
        }
        if self.send_timeout_ms == 0 {
            return Err("send_timeout_ms must be greater than 0".into());
        }
        if self.event_prefix.is_empty() {
            return Err("event_prefix must not be empty".into());
        }
        Ok(())
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            batch_timeout_ms: Self::DEFAULT_BATCH_TIMEOUT_MS,
            send_timeout_ms: Self::DEFAULT_SEND_TIMEOUT_MS,
            event_prefix: Self::DEFAULT_EVENT_PREFIX.to_string(),
            unwrap_transactions: false,
        }
    }
}
