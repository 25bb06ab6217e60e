//! Builders to construct worker pools from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{PoolConfig, PoolStrategy, RuntimeConfig};
use crate::core::error::RuntimeError;
use crate::core::worker_pool::{AffinityPool, PassivePool, ThreadPerUnitPool, ThreadPool, WorkerPool};

/// Build one pool for `config`. The pool is not started.
///
/// # Errors
///
/// Returns `RuntimeError::InvalidConfig` for an invalid configuration or a
/// strategy whose feature is disabled.
pub fn build_pool(name: &str, config: &PoolConfig) -> Result<Arc<dyn WorkerPool>, RuntimeError> {
    config
        .validate()
        .map_err(|e| RuntimeError::InvalidConfig(format!("pool `{name}` invalid: {e}")))?;

    let pool: Arc<dyn WorkerPool> = match config.strategy {
        PoolStrategy::Dedicated | PoolStrategy::ThreadPool => ThreadPool::new(name, config.clone())?,
        PoolStrategy::ThreadPerUnit => ThreadPerUnitPool::new(name, config)?,
        PoolStrategy::Passive => PassivePool::new(name),
        PoolStrategy::Affinity => AffinityPool::new(name, config)?,
        #[cfg(feature = "tokio-runtime")]
        PoolStrategy::Tokio => {
            crate::runtime::TokioPool::with_worker_threads(name, config.effective_worker_count())?
        }
        #[cfg(not(feature = "tokio-runtime"))]
        PoolStrategy::Tokio => {
            return Err(RuntimeError::InvalidConfig(format!(
                "pool `{name}` needs the `tokio-runtime` feature"
            )))
        }
    };
    debug!(pool = name, strategy = ?config.strategy, "pool built");
    Ok(pool)
}

/// Build every pool named in the runtime configuration.
///
/// # Errors
///
/// Returns `RuntimeError::InvalidConfig` if the configuration is invalid.
pub fn build_pools(cfg: &RuntimeConfig) -> Result<HashMap<String, Arc<dyn WorkerPool>>, RuntimeError> {
    cfg.validate()
        .map_err(|e| RuntimeError::InvalidConfig(format!("config invalid: {e}")))?;

    let mut pools = HashMap::new();
    for (name, pool_cfg) in &cfg.pools {
        pools.insert(name.clone(), build_pool(name, pool_cfg)?);
    }
    Ok(pools)
}
