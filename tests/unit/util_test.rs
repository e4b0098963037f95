//! Tests for utility functions

use std::time::Duration;

use durable_relay::util::{init_tracing, now_ms, Clock, ManualClock, SystemClock};

#[test]
fn test_now_ms_tracks_system_clock() {
    let before = now_ms();
    let clock = SystemClock.now_ms();
    assert!(clock >= before);
}

#[test]
fn test_manual_clock_is_shared_between_clones() {
    let clock = ManualClock::new(0);
    let handle = clock.clone();
    handle.advance(Duration::from_secs(3));
    assert_eq!(clock.now_ms(), 3_000);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::info!(component = "unit-tests", "tracing initialized");
}
