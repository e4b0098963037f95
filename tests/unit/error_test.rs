//! Tests for error types

use std::time::Duration;

use durable_relay::core::{
    CapacityError, ForwarderError, JobError, PoolError, SinkError, Watermark,
};

#[test]
fn test_job_error_display() {
    assert_eq!(JobError::Failed("bad input".into()).to_string(), "job failed: bad input");
    assert_eq!(
        JobError::Panicked {
            worker_id: 3,
            message: "boom".into(),
        }
        .to_string(),
        "worker 3 panicked: boom"
    );
    assert_eq!(JobError::Shutdown.to_string(), "pool shut down before the job ran");
}

#[test]
fn test_pool_error_display() {
    assert_eq!(PoolError::NotStarted.to_string(), "pool has not been started");
    assert_eq!(
        PoolError::InvalidConfig("worker_count must be greater than 0".into()).to_string(),
        "invalid configuration: worker_count must be greater than 0"
    );
}

#[test]
fn test_sink_error_display() {
    assert_eq!(
        SinkError::Timeout(Duration::from_secs(10)).to_string(),
        "sink call timed out after 10s"
    );
    let wrapped: SinkError = anyhow::anyhow!("connection reset").into();
    assert_eq!(wrapped.to_string(), "connection reset");
}

#[test]
fn test_forwarder_error_display() {
    let err = ForwarderError::WatermarkRegression {
        previous: Watermark::new(0x1_0000_0010, 0),
        received: Watermark::new(0x1_0000_0001, 0),
    };
    assert_eq!(err.to_string(), "watermark regressed from 1/10 to 1/1");
}

#[test]
fn test_capacity_error_display() {
    assert_eq!(
        CapacityError::LeaseNotFound("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()).to_string(),
        "lease 01ARZ3NDEKTSV4RRFFQ69G5FAV not found or expired"
    );
    assert_eq!(CapacityError::Shutdown.to_string(), "capacity manager is shutting down");
}
