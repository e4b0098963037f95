//! Tests for builder modules

use std::sync::Arc;

use durable_relay::builders::{build_capacity_manager, build_forwarder, build_worker_pool};
use durable_relay::config::RelayConfig;
use durable_relay::core::{FnExecutor, Job, PoolError, WorkerContext};
use durable_relay::infra::InMemorySink;
use durable_relay::util::{Clock, ManualClock};

#[test]
fn test_build_worker_pool_from_config() {
    let cfg = RelayConfig::from_json_str(r#"{"worker_pool": {"worker_count": 2}}"#).unwrap();
    let pool = build_worker_pool(&cfg, FnExecutor::new(|n: u32, _ctx: WorkerContext| Ok(n * 2))).unwrap();
    pool.start().unwrap();

    let results = pool.submit_batch(vec![Job::new(1, 21)]).unwrap();
    assert_eq!(results[0].output, Ok(42));
    assert_eq!(pool.stats().worker_count, 2);
    pool.stop().unwrap();
}

#[test]
fn test_build_worker_pool_rejects_invalid_section() {
    let mut cfg = RelayConfig::default();
    cfg.worker_pool.worker_count = 0;
    let result = build_worker_pool(&cfg, FnExecutor::new(|n: u32, _ctx: WorkerContext| Ok(n)));
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
}

#[test]
fn test_build_forwarder_uses_forwarder_section() {
    let cfg = RelayConfig::from_json_str(r#"{"forwarder": {"batch_size": 7, "event_prefix": "db"}}"#)
        .unwrap();
    let forwarder = build_forwarder(&cfg, Arc::new(InMemorySink::new())).unwrap();
    assert_eq!(forwarder.config().batch_size, 7);
    assert_eq!(forwarder.config().event_prefix, "db");
}

#[test]
fn test_build_capacity_manager_with_clock() {
    let clock = ManualClock::new(5);
    let cfg = RelayConfig::default();
    let shared: Arc<dyn Clock> = Arc::new(clock);
    let manager = build_capacity_manager(&cfg, Some(shared)).unwrap();
    assert_eq!(manager.lease_count(), 0);
    assert!(build_capacity_manager(&cfg, None).is_ok());
}
