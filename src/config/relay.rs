//! Root configuration combining every component.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{CapacityConfig, ForwarderConfig, WorkerPoolConfig};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Worker pool tunables.
    pub worker_pool: WorkerPoolConfig,
    /// Batch forwarder tunables.
    pub forwarder: ForwarderConfig,
    /// Capacity manager tunables.
    pub capacity: CapacityConfig,
}

impl RelayConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first failing section, prefixed with its name.
    pub fn validate(&self) -> Result<(), String> {
        self.worker_pool
            .validate()
            .map_err(|e| format!("worker_pool invalid: {e}"))?;
        self.forwarder
            .validate()
            .map_err(|e| format!("forwarder invalid: {e}"))?;
        self.capacity
            .validate()
            .map_err(|e| format!("capacity invalid: {e}"))?;
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// Missing sections and fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from defaults overridden by `RELAY_*` environment variables.
    ///
    /// A `.env` file in the working directory (or a parent) is loaded first if present.
    ///
    /// # Errors
    ///
    /// Returns a message if a variable fails to parse or the result is invalid.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();
        override_from_env("RELAY_WORKER_COUNT", &mut cfg.worker_pool.worker_count)?;
        override_from_env(
            "RELAY_WORKER_STACK_SIZE",
            &mut cfg.worker_pool.thread_stack_size,
        )?;
        override_from_env("RELAY_BATCH_SIZE", &mut cfg.forwarder.batch_size)?;
        override_from_env("RELAY_BATCH_TIMEOUT_MS", &mut cfg.forwarder.batch_timeout_ms)?;
        override_from_env("RELAY_SEND_TIMEOUT_MS", &mut cfg.forwarder.send_timeout_ms)?;
        override_from_env("RELAY_EVENT_PREFIX", &mut cfg.forwarder.event_prefix)?;
        override_from_env(
            "RELAY_UNWRAP_TRANSACTIONS",
            &mut cfg.forwarder.unwrap_transactions,
        )?;
        override_from_env(
            "RELAY_LEASE_DURATION_MS",
            &mut cfg.capacity.default_lease_duration_ms,
        )?;
        override_from_env(
            "RELAY_MAX_LEASE_DURATION_MS",
            &mut cfg.capacity.max_lease_duration_ms,
        )?;
        override_from_env(
            "RELAY_IDEMPOTENCY_TTL_MS",
            &mut cfg.capacity.idempotency_ttl_ms,
        )?;
        override_from_env(
            "RELAY_SCAVENGE_INTERVAL_MS",
            &mut cfg.capacity.scavenge_interval_ms,
        )?;

        cfg.validate()?;
        Ok(cfg)
    }
}

fn override_from_env<T>(key: &str, target: &mut T) -> Result<(), String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => {
            *target = raw
                .trim()
                .parse()
                .map_err(|e| format!("{key}: cannot parse `{raw}`: {e}"))?;
            Ok(())
        }
        Err(env::VarError::NotPresent) => Ok(()),
        Err(e) => Err(format!("{key}: {e}")),
    }
}
