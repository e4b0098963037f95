//! Capacity manager backends.

pub mod memory;

pub use memory::InMemoryCapacityManager;
