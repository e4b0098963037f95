//! Capacity manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the in-memory capacity manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Lease duration used when a request does not specify one.
    pub default_lease_duration_ms: u64,
    /// Requested durations are capped to this value.
    pub max_lease_duration_ms: u64,
    /// How long a response stays cached under its idempotency key.
    pub idempotency_ttl_ms: u64,
    /// Interval of the background scavenger.
    pub scavenge_interval_ms: u64,
}

impl CapacityConfig {
    /// Default lease duration.
    pub const DEFAULT_LEASE_DURATION_MS: u64 = 30_000;
    /// Default maximum lease duration.
    pub const DEFAULT_MAX_LEASE_DURATION_MS: u64 = 300_000;
    /// Default idempotency window.
    pub const DEFAULT_IDEMPOTENCY_TTL_MS: u64 = 10_000;
    /// Default scavenger interval.
    pub const DEFAULT_SCAVENGE_INTERVAL_MS: u64 = 1_000;

    /// Create a configuration with the default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default lease duration as a [`Duration`].
    #[must_use]
    pub const fn default_lease_duration(&self) -> Duration {
        Duration::from_millis(self.default_lease_duration_ms)
    }

    /// Maximum lease duration as a [`Duration`].
    #[must_use]
    pub const fn max_lease_duration(&self) -> Duration {
        Duration::from_millis(self.max_lease_duration_ms)
    }

    /// Idempotency window as a [`Duration`].
    #[must_use]
    pub const fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency_ttl_ms)
    }

    /// Scavenger interval as a [`Duration`].
    #[must_use]
    pub const fn scavenge_interval(&self) -> Duration {
        Duration::from_millis(self.scavenge_interval_ms)
    }

    /// Validate capacity configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_lease_duration_ms == 0 {
            return Err("default_lease_duration_ms must be greater than 0".into());
        }
        if self.max_lease_duration_ms < self.default_lease_duration_ms {
            return Err("max_lease_duration_ms must be >= default_lease_duration_ms".into());
        }
        if self.scavenge_interval_ms == 0 {
            return Err("scavenge_interval_ms must be greater than 0".into());
        }
        Ok(())
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            default_lease_duration_ms: Self::DEFAULT_LEASE_DURATION_MS,
            max_lease_duration_ms: Self::DEFAULT_MAX_LEASE_DURATION_MS,
            idempotency_ttl_ms: Self::DEFAULT_IDEMPOTENCY_TTL_MS,
            scavenge_interval_ms: Self::DEFAULT_SCAVENGE_INTERVAL_MS,
        }
    }
}
