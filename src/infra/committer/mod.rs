//! Watermark committer backends.

pub mod memory;

pub use memory::InMemoryCommitter;
