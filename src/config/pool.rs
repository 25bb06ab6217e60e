//! Pool and runtime configuration structures.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Environment variable holding either a path to a JSON config file or an
/// inline JSON document.
pub const CONFIG_ENV_VAR: &str = "FLOW_RUNTIME_CONFIG";

/// Default stack size for worker threads (2 MiB).
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Concurrency strategy of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// One dedicated worker thread, strictly serial.
    Dedicated,
    /// Fixed number of workers sharing one ready queue.
    ThreadPool,
    /// One thread per unit.
    ThreadPerUnit,
    /// The assigning thread runs the unit inline.
    Passive,
    /// Lanes of dedicated threads; continuations stay on their lane.
    Affinity,
    /// Blocking tasks on a tokio runtime.
    Tokio,
}

/// Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Concurrency strategy.
    pub strategy: PoolStrategy,
    /// Workers (thread pool) or lanes (affinity). Defaults to the CPU count.
    #[serde(default)]
    pub worker_count: Option<usize>,
    /// Stack size for spawned threads.
    #[serde(default)]
    pub thread_stack_size: Option<usize>,
}

impl PoolConfig {
    /// Configuration for the given strategy with defaults.
    #[must_use]
    pub const fn new(strategy: PoolStrategy) -> Self {
        Self {
            strategy,
            worker_count: None,
            thread_stack_size: None,
        }
    }

    /// Single dedicated worker.
    #[must_use]
    pub const fn dedicated() -> Self {
        Self::new(PoolStrategy::Dedicated)
    }

    /// Fixed pool of `worker_count` workers.
    #[must_use]
    pub const fn thread_pool(worker_count: usize) -> Self {
        Self::new(PoolStrategy::ThreadPool).with_worker_count(worker_count)
    }

    /// Set the worker/lane count.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = Some(worker_count);
        self
    }

    /// Set the stack size of spawned threads.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = Some(size);
        self
    }

    /// Effective worker count for the strategy.
    #[must_use]
    pub fn effective_worker_count(&self) -> usize {
        match self.strategy {
            PoolStrategy::Dedicated => 1,
            PoolStrategy::Passive | PoolStrategy::ThreadPerUnit => 0,
            PoolStrategy::ThreadPool | PoolStrategy::Affinity | PoolStrategy::Tokio => {
                self.worker_count.unwrap_or_else(num_cpus::get)
            }
        }
    }

    /// Effective stack size for spawned threads.
    #[must_use]
    pub fn effective_stack_size(&self) -> usize {
        self.thread_stack_size.unwrap_or(DEFAULT_STACK_SIZE)
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == Some(0) {
            return Err("worker_count must be greater than 0".into());
        }
        if self.strategy == PoolStrategy::Dedicated && self.worker_count.is_some_and(|n| n != 1) {
            return Err("dedicated pools have exactly one worker".into());
        }
        if self.thread_stack_size.is_some_and(|s| s < 64 * 1024) {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Root runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Map of pool name to configuration.
    pub pools: HashMap<String, PoolConfig>,
    /// Pool used by nodes that do not name one.
    pub default_pool: String,
}

impl RuntimeConfig {
    /// Configuration with a single pool that is also the default.
    #[must_use]
    pub fn single(name: impl Into<String>, pool: PoolConfig) -> Self {
        let name = name.into();
        let mut pools = HashMap::new();
        pools.insert(name.clone(), pool);
        Self {
            pools,
            default_pool: name,
        }
    }

    /// Add a pool.
    #[must_use]
    pub fn with_pool(mut self, name: impl Into<String>, pool: PoolConfig) -> Self {
        self.pools.insert(name.into(), pool);
        self
    }

    /// Validate all pools and ensure the default pool exists.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending pool.
    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err("at least one pool must be defined".into());
        }
        if !self.pools.contains_key(&self.default_pool) {
            return Err(format!("default pool `{}` is not defined", self.default_pool));
        }
        for (name, pool) in &self.pools {
            pool.validate()
                .map_err(|e| format!("pool `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse runtime configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a message on parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration named by [`CONFIG_ENV_VAR`], after loading a `.env`
    /// file if present. The variable may hold a file path or inline JSON.
    ///
    /// # Errors
    ///
    /// Returns a message if the variable is unset, the file is unreadable, or
    /// the document is invalid.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let value = std::env::var(CONFIG_ENV_VAR)
            .map_err(|_| format!("{CONFIG_ENV_VAR} is not set"))?;
        let trimmed = value.trim_start();
        if trimmed.starts_with('{') {
            return Self::from_json_str(trimmed);
        }
        let document = std::fs::read_to_string(Path::new(&value))
            .map_err(|e| format!("cannot read {value}: {e}"))?;
        Self::from_json_str(&document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_worker_count() {
        assert_eq!(PoolConfig::dedicated().effective_worker_count(), 1);
        assert_eq!(PoolConfig::thread_pool(3).effective_worker_count(), 3);
        assert_eq!(PoolConfig::new(PoolStrategy::Passive).effective_worker_count(), 0);
        assert!(PoolConfig::new(PoolStrategy::ThreadPool).effective_worker_count() >= 1);
    }

    #[test]
    fn test_dedicated_rejects_multiple_workers() {
        let cfg = PoolConfig::dedicated().with_worker_count(2);
        assert!(cfg.validate().is_err());
    }
}
