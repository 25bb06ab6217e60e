//! Builders to construct runtime components from configuration.

pub mod pool_builder;

pub use pool_builder::{build_pool, build_pools};
