//! Event sink backends.

pub mod memory;

pub use memory::InMemorySink;
