//! Tests for configuration validation

use std::time::Duration;

use durable_relay::config::{CapacityConfig, ForwarderConfig, RelayConfig, WorkerPoolConfig};

#[test]
fn test_defaults_are_valid() {
    let cfg = RelayConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.forwarder.batch_timeout(), Duration::from_millis(100));
    assert_eq!(cfg.forwarder.send_timeout(), Duration::from_secs(10));
    assert_eq!(cfg.forwarder.event_prefix, "pg");
    assert!(!cfg.forwarder.unwrap_transactions);
    assert!(cfg.worker_pool.worker_count > 0);
}

#[test]
fn test_worker_pool_config_validation() {
    assert!(WorkerPoolConfig::new().with_worker_count(0).validate().is_err());
    assert!(WorkerPoolConfig::new().with_thread_stack_size(1024).validate().is_err());
    assert!(WorkerPoolConfig::new().with_worker_count(8).validate().is_ok());
}

#[test]
fn test_forwarder_config_validation() {
    assert!(ForwarderConfig::new().with_batch_size(0).validate().is_err());
    assert!(ForwarderConfig::new()
        .with_batch_timeout(Duration::ZERO)
        .validate()
        .is_err());
    assert!(ForwarderConfig::new()
        .with_send_timeout(Duration::ZERO)
        .validate()
        .is_err());
    assert!(ForwarderConfig::new().with_event_prefix("").validate().is_err());
}

#[test]
fn test_capacity_config_validation() {
    let cfg = CapacityConfig {
        max_lease_duration_ms: 1,
        ..CapacityConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_from_json_str_fills_defaults() {
    let cfg = RelayConfig::from_json_str(
        r#"{
            "forwarder": {"batch_size": 500, "unwrap_transactions": true},
            "capacity": {"default_lease_duration_ms": 5000}
        }"#,
    )
    .unwrap();
    assert_eq!(cfg.forwarder.batch_size, 500);
    assert!(cfg.forwarder.unwrap_transactions);
    assert_eq!(cfg.forwarder.batch_timeout_ms, ForwarderConfig::DEFAULT_BATCH_TIMEOUT_MS);
    assert_eq!(cfg.capacity.default_lease_duration_ms, 5_000);
}

#[test]
fn test_from_json_str_reports_section() {
    let err = RelayConfig::from_json_str(r#"{"forwarder": {"batch_size": 0}}"#).unwrap_err();
    assert!(err.starts_with("forwarder invalid:"), "{err}");

    let err = RelayConfig::from_json_str("{not json").unwrap_err();
    assert!(err.starts_with("parse error:"), "{err}");
}

#[test]
fn test_from_env_overrides_defaults() {
    std::env::set_var("RELAY_BATCH_SIZE", "250");
    std::env::set_var("RELAY_EVENT_PREFIX", "cdc");
    let cfg = RelayConfig::from_env().unwrap();
    assert_eq!(cfg.forwarder.batch_size, 250);
    assert_eq!(cfg.forwarder.event_prefix, "cdc");

    std::env::set_var("RELAY_BATCH_SIZE", "lots");
    let err = RelayConfig::from_env().unwrap_err();
    assert!(err.contains("RELAY_BATCH_SIZE"), "{err}");

    std::env::remove_var("RELAY_BATCH_SIZE");
    std::env::remove_var("RELAY_EVENT_PREFIX");
}
