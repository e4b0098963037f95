//! Configuration models for the worker pool, forwarder, and capacity manager.

pub mod capacity;
pub mod forwarder;
pub mod pool;
pub mod relay;

pub use capacity::CapacityConfig;
pub use forwarder::ForwarderConfig;
pub use pool::WorkerPoolConfig;
pub use relay::RelayConfig;
