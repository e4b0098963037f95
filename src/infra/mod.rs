//! Infrastructure adapters: in-memory sinks, committers, and capacity stores.

pub mod capacity;
pub mod committer;
pub mod sink;

pub use capacity::InMemoryCapacityManager;
pub use committer::InMemoryCommitter;
pub use sink::InMemorySink;
