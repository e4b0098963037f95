//! Batched worker pool with dedicated worker threads.
//!
//! A `WorkerPool` multiplexes many concurrent batch submissions over a fixed set of
//! worker threads. Each batch gets exactly its own results back: a scheduler thread
//! gives every batch a private completion channel and a collector, then pushes the
//! batch's jobs onto a queue shared by all workers. Workers never know which batch a
//! job came from.
//!
//! # Key Features
//!
//! - **Batch isolation**: results are routed through a per-batch channel
//! - **Fair sharing**: jobs from all batches compete for workers on one queue
//! - **Dual API**: blocking (`submit_batch`) and async (`submit_batch_async`)
//! - **No serialization requirement**: outputs can include channels, handles, etc.
//!
//! # Shutdown policy
//!
//! `stop()` lets jobs that are already executing run to completion. Jobs still in the
//! queue, and jobs a worker dequeues after observing shutdown, complete with
//! [`JobError::Shutdown`](crate::core::JobError::Shutdown) so every accepted batch
//! still receives a full result vector.
//!
//! # Example
//!
//! ```rust,ignore
//! use durable_relay::config::WorkerPoolConfig;
//! use durable_relay::core::{FnExecutor, Job, WorkerPool};
//!
//! let pool = WorkerPool::new(
//!     WorkerPoolConfig::new().with_worker_count(4),
//!     FnExecutor::new(|n: i64, _ctx| Ok(n + 10)),
//! )?;
//! pool.start()?;
//!
//! let results = pool.submit_batch((1..=5).map(|i| Job::new(i, i as i64)).collect())?;
//! assert_eq!(results.len(), 5);
//! pool.stop()?;
//! ```

#[cfg(not(target_arch = "wasm32"))]
mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::JobError;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `start()` was called on a pool that is running or stopped.
    AlreadyStarted,

    /// A batch was submitted before `start()`.
    NotStarted,

    /// The pool has been shut down.
    PoolShutdown,

    /// Two jobs in one batch share the same handle.
    DuplicateJobId(u64),

    /// Configuration validation failed.
    InvalidConfig(String),

    /// One or more workers panicked while executing a job.
    WorkerPanicked {
        /// Number of jobs that panicked over the pool's lifetime.
        count: u64,
    },

    /// Internal error (thread spawn failure, collector lost, etc.).
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "pool has already been started"),
            Self::NotStarted => write!(f, "pool has not been started"),
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::DuplicateJobId(id) => write!(f, "duplicate job id {id} in batch"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::WorkerPanicked { count } => write!(f, "{count} job(s) panicked in workers"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// A unit of work inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job<P> {
    /// Caller-assigned handle, unique within its batch.
    pub id: u64,
    /// User payload.
    pub payload: P,
}

impl<P> Job<P> {
    /// Create a job.
    pub const fn new(id: u64, payload: P) -> Self {
        Self { id, payload }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult<R> {
    /// Handle of the originating job.
    pub job_id: u64,
    /// Output, or the error slot.
    pub output: Result<R, JobError>,
}

impl<R> JobResult<R> {
    /// Whether the job produced an output.
    pub const fn is_ok(&self) -> bool {
        self.output.is_ok()
    }
}

/// Lifecycle of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Received by the scheduler.
    Accepted,
    /// Every job has been pushed onto the shared queue.
    JobsEnqueued,
    /// The collector is gathering results.
    Collecting,
    /// The full result vector was handed back to the caller.
    Delivered,
    /// Shutdown drained at least one job before it ran.
    AbandonedOnShutdown,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::JobsEnqueued => "jobs-enqueued",
            Self::Collecting => "collecting",
            Self::Delivered => "delivered",
            Self::AbandonedOnShutdown => "abandoned-on-shutdown",
        };
        f.write_str(s)
    }
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Batches accepted since start.
    pub submitted_batches: u64,

    /// Batches whose results have not yet been delivered.
    pub in_flight_batches: u64,

    /// Batches delivered with at least one job drained by shutdown.
    pub abandoned_batches: u64,

    /// Jobs waiting in the shared queue.
    pub queued_jobs: u64,

    /// Jobs currently executing.
    pub active_jobs: u64,

    /// Jobs that produced an output.
    pub completed_jobs: u64,

    /// Jobs whose error slot is set (including panics and shutdown drains).
    pub failed_jobs: u64,

    /// Jobs that panicked.
    pub panicked_jobs: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub submitted_batches: AtomicU64,
    pub in_flight_batches: AtomicU64,
    pub abandoned_batches: AtomicU64,
    pub queued_jobs: AtomicU64,
    pub active_jobs: AtomicU64,
    pub completed_jobs: AtomicU64,
    pub failed_jobs: AtomicU64,
    pub panicked_jobs: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            submitted_batches: self.submitted_batches.load(Ordering::Relaxed),
            in_flight_batches: self.in_flight_batches.load(Ordering::Relaxed),
            abandoned_batches: self.abandoned_batches.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            completed_jobs: self.completed_jobs.load(Ordering::Relaxed),
            failed_jobs: self.failed_jobs.load(Ordering::Relaxed),
            panicked_jobs: self.panicked_jobs.load(Ordering::Relaxed),
        }
    }

    /// Account for a finished job.
    pub fn record_outcome<R>(&self, result: &JobResult<R>) {
        match &result.output {
            Ok(_) => {
                self.completed_jobs.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed_jobs.fetch_add(1, Ordering::Relaxed);
                if matches!(err, JobError::Panicked { .. }) {
                    self.panicked_jobs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::WorkerPool;
