//! # Durable Relay
//!
//! Building blocks for moving work and change data between systems with bounded
//! resources and explicit delivery guarantees.
//!
//! ## Key Features
//!
//! - **Batched Worker Pool**: many concurrent batch submissions share a fixed set of
//!   worker threads, and every batch receives exactly its own results
//! - **Batch Forwarder**: change records are grouped into size- or time-bounded
//!   batches, sent to a sink, and their watermark committed only after the sink
//!   accepted them (at-least-once delivery)
//! - **Capacity Manager**: short-lived, renewable leases over rate-limit,
//!   concurrency, and throttle resources, acquired all-or-nothing
//!
//! ## WorkerPool
//!
//! ```rust,ignore
//! use durable_relay::config::WorkerPoolConfig;
//! use durable_relay::core::{FnExecutor, Job, WorkerPool};
//!
//! let pool = WorkerPool::new(
//!     WorkerPoolConfig::new().with_worker_count(4),
//!     FnExecutor::new(|n: i64, _ctx| Ok(n * 2)),
//! )?;
//! pool.start()?;
//! let results = pool.submit_batch(vec![Job::new(1, 21)])?;
//! pool.stop()?;
//! ```
//!
//! ## BatchForwarder
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use durable_relay::config::ForwarderConfig;
//! use durable_relay::core::BatchForwarder;
//! use durable_relay::infra::{InMemoryCommitter, InMemorySink};
//! use tokio_util::sync::CancellationToken;
//!
//! let forwarder = BatchForwarder::new(ForwarderConfig::new(), Arc::new(InMemorySink::new()))?;
//! let cancel = CancellationToken::new();
//! let input = forwarder.listen(cancel.clone(), Arc::new(InMemoryCommitter::new()))?;
//! input.send(changeset).await?;
//! cancel.cancel();
//! forwarder.wait().await?;
//! ```
//!
//! ## CapacityManager
//!
//! ```rust,ignore
//! use durable_relay::core::{CapacityLeaseRequest, CapacityManager};
//! use durable_relay::infra::InMemoryCapacityManager;
//!
//! let manager = InMemoryCapacityManager::new(Default::default())?;
//! let response = manager.lease_capacity(CapacityLeaseRequest::new(resources)).await?;
//! if let Some(lease_id) = response.lease_id {
//!     manager.release_capacity(&lease_id).await?;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core abstractions: worker pool, change records, forwarding, and capacity leases.
pub mod core;
/// Configuration models for the pool, forwarder, and capacity manager.
pub mod config;
/// Builders to construct relay components from configuration.
pub mod builders;
/// Infrastructure adapters: in-memory sinks, committers, and capacity stores.
pub mod infra;
/// Shared utilities.
pub mod util;
