//! Builders to construct relay components from configuration.

pub mod relay_builder;

pub use relay_builder::{build_capacity_manager, build_forwarder, build_worker_pool};
