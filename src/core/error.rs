//! Error types shared by the pool, forwarder, and capacity manager.

use std::time::Duration;

use thiserror::Error;

use crate::core::changeset::Watermark;

/// Error stored in a job result's error slot.
///
/// A failing job never interrupts the rest of its batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The executor returned an error.
    #[error("job failed: {0}")]
    Failed(String),
    /// The executor panicked while processing the job.
    #[error("worker {worker_id} panicked: {message}")]
    Panicked {
        /// Worker that was running the job.
        worker_id: usize,
        /// Panic payload rendered as text.
        message: String,
    },
    /// The pool shut down before the job was executed.
    #[error("pool shut down before the job ran")]
    Shutdown,
}

/// Errors returned by an [`EventSink`](crate::core::EventSink).
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink rejected or failed to accept the batch.
    #[error("sink rejected batch: {0}")]
    Rejected(String),
    /// The sink did not answer within the send timeout.
    #[error("sink call timed out after {0:?}")]
    Timeout(Duration),
    /// Admission control did not grant capacity for the flush.
    #[error("capacity not granted for flush")]
    CapacityDenied,
    /// Any other transport failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Fatal errors reported by [`BatchForwarder::wait`](crate::core::BatchForwarder::wait).
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// A record arrived with a watermark lower than an earlier record.
    #[error("watermark regressed from {previous} to {received}")]
    WatermarkRegression {
        /// Highest watermark seen so far.
        previous: Watermark,
        /// Offending watermark.
        received: Watermark,
    },
    /// Configuration validation failed.
    #[error("invalid forwarder configuration: {0}")]
    InvalidConfig(String),
    /// `listen` was called while a background task is already running.
    #[error("forwarder is already listening")]
    AlreadyListening,
    /// The background task panicked or was aborted.
    #[error("forwarder task failed: {0}")]
    Task(String),
}

/// Errors produced by a [`CapacityManager`](crate::core::CapacityManager).
///
/// Capacity exhaustion is not an error; it is reported through
/// [`CapacityLeaseResponse::allowed`](crate::core::CapacityLeaseResponse::allowed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    /// The lease does not exist, expired, or was released.
    #[error("lease {0} not found or expired")]
    LeaseNotFound(String),
    /// The request is malformed.
    #[error("invalid capacity request: {0}")]
    InvalidRequest(String),
    /// The manager is shutting down.
    #[error("capacity manager is shutting down")]
    Shutdown,
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
