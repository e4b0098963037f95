//! Builders wiring relay components from a [`RelayConfig`].

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::core::{
    BatchForwarder, CapacityError, EventSink, ForwarderError, PoolError, WorkerExecutor, WorkerPool,
};
use crate::infra::InMemoryCapacityManager;
use crate::util::clock::Clock;

/// Build (but do not start) a worker pool from the `worker_pool` section.
///
/// # Errors
///
/// Returns [`PoolError::InvalidConfig`] when the section does not validate.
pub fn build_worker_pool<P, R, E>(cfg: &RelayConfig, executor: E) -> Result<WorkerPool<P, R, E>, PoolError>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    WorkerPool::new(cfg.worker_pool.clone(), executor)
}

/// Build a forwarder for `sink` from the `forwarder` section.
///
/// # Errors
///
/// Returns [`ForwarderError::InvalidConfig`] when the section does not validate.
pub fn build_forwarder<S: EventSink>(
    cfg: &RelayConfig,
    sink: Arc<S>,
) -> Result<BatchForwarder<S>, ForwarderError> {
    BatchForwarder::new(cfg.forwarder.clone(), sink)
}

/// Build an in-memory capacity manager from the `capacity` section.
///
/// Uses the system clock unless `clock` is given.
///
/// # Errors
///
/// Returns [`CapacityError::InvalidRequest`] when the section does not validate.
pub fn build_capacity_manager(
    cfg: &RelayConfig,
    clock: Option<Arc<dyn Clock>>,
) -> Result<InMemoryCapacityManager, CapacityError> {
    match clock {
        Some(clock) => InMemoryCapacityManager::with_clock(cfg.capacity.clone(), clock),
        None => InMemoryCapacityManager::new(cfg.capacity.clone()),
    }
}
