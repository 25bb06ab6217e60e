//! Tests for builder modules

use prometheus_flow_runtime::builders::{build_pool, build_pools};
use prometheus_flow_runtime::config::{PoolConfig, PoolStrategy, RuntimeConfig};
use prometheus_flow_runtime::core::RuntimeError;

#[test]
fn test_build_pool_per_strategy() {
    for strategy in [
        PoolStrategy::Dedicated,
        PoolStrategy::ThreadPool,
        PoolStrategy::ThreadPerUnit,
        PoolStrategy::Passive,
        PoolStrategy::Affinity,
    ] {
        let pool = build_pool("p", &PoolConfig::new(strategy).with_worker_count(1)).unwrap();
        assert_eq!(pool.name(), "p");
        assert_eq!(pool.strategy(), strategy);
    }
}

#[test]
fn test_build_pool_rejects_invalid_config() {
    let err = build_pool("bad", &PoolConfig::thread_pool(0)).err().unwrap();
    assert!(matches!(err, RuntimeError::InvalidConfig(ref msg) if msg.contains("bad")));
}

#[test]
fn test_build_pools_requires_default() {
    let mut config = RuntimeConfig::single("cpu", PoolConfig::thread_pool(1));
    config.default_pool = "gpu".into();
    assert!(matches!(build_pools(&config), Err(RuntimeError::InvalidConfig(_))));
}
