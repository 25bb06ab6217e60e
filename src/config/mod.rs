//! Configuration models for worker pools and the runtime.

pub mod pool;

pub use pool::{PoolConfig, PoolStrategy, RuntimeConfig, CONFIG_ENV_VAR, DEFAULT_STACK_SIZE};
