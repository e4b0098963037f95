//! Tests for the lease audit sink

use std::sync::Arc;
use std::time::Duration;

use durable_relay::config::CapacityConfig;
use durable_relay::core::{
    CapacityIdentifier, CapacityKind, CapacityLeaseRequest, CapacityManager, CapacityResource,
    InMemoryLeaseAuditSink, LeaseAction,
};
use durable_relay::infra::InMemoryCapacityManager;
use durable_relay::util::ManualClock;
use uuid::Uuid;

#[tokio::test]
async fn test_audit_trail_for_lease_lifecycle() {
    let clock = ManualClock::new(10_000);
    let audit = Arc::new(InMemoryLeaseAuditSink::new(10));
    let manager = InMemoryCapacityManager::with_clock(CapacityConfig::default(), Arc::new(clock))
        .unwrap()
        .with_audit(audit.clone());

    let resource = CapacityResource::new(
        CapacityKind::Throttle,
        CapacityIdentifier::new(Uuid::nil(), Uuid::nil()),
        1,
    );
    let lease_id = manager
        .lease_capacity(CapacityLeaseRequest::new(vec![resource.clone()]))
        .await
        .unwrap()
        .lease_id
        .unwrap();
    let renewed = manager
        .extend_capacity_lease(&lease_id, Duration::from_secs(5))
        .await
        .unwrap();
    manager.release_capacity(&renewed).await.unwrap();

    let events = audit.events();
    assert_eq!(
        audit.actions(),
        vec![LeaseAction::Granted, LeaseAction::Extended, LeaseAction::Released]
    );
    assert_eq!(events[0].lease_id, Some(lease_id));
    assert_eq!(events[1].replaced_by, Some(renewed));
    assert_eq!(events[2].resources, vec![resource.key()]);
    assert!(events.iter().all(|e| e.created_at_ms == 10_000));
}

#[test]
fn test_zero_capacity_sink_drops_everything() {
    use durable_relay::core::{LeaseAuditEvent, LeaseAuditSink};

    let sink = InMemoryLeaseAuditSink::new(0);
    sink.record(LeaseAuditEvent {
        lease_id: None,
        replaced_by: None,
        action: LeaseAction::Denied,
        resources: Vec::new(),
        created_at_ms: 0,
    });
    assert!(sink.events().is_empty());
}
