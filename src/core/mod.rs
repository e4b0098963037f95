//! Core abstractions: worker pool, change records, forwarding, and capacity leases.

pub mod audit;
pub mod capacity;
pub mod changeset;
pub mod error;
pub mod event;
pub mod executor;
pub mod forwarder;
pub mod txn;
pub mod worker_pool;

pub use audit::{InMemoryLeaseAuditSink, LeaseAction, LeaseAuditEvent, LeaseAuditSink};
pub use capacity::{
    CapacityCheckResponse, CapacityIdentifier, CapacityKind, CapacityLeaseRequest,
    CapacityLeaseResponse, CapacityManager, CapacityResource, ConcurrencyMode, ConcurrencyScope,
    CustomConcurrencyKey, LeaseId, ResourceKey, ResourceUsage, ScavengeResult, ThrottleKey,
};
pub use changeset::{
    Changeset, ChangesetData, ColumnMap, ColumnValue, DecodeError, DecodedValue, Encoding,
    Operation, Watermark,
};
pub use error::{AppResult, CapacityError, ForwarderError, JobError, SinkError};
pub use event::{event_name, Event};
pub use executor::{FnExecutor, WorkerContext, WorkerExecutor};
pub use forwarder::{BatchForwarder, EventSink, ForwarderStats, WatermarkCommitter};
pub use txn::TxnUnwrapper;
#[cfg(not(target_arch = "wasm32"))]
pub use worker_pool::WorkerPool;
pub use worker_pool::{BatchState, Job, JobResult, PoolError, PoolStats};
