//! Tests for configuration validation

use prometheus_flow_runtime::config::{PoolConfig, PoolStrategy, RuntimeConfig, DEFAULT_STACK_SIZE};

#[test]
fn test_pool_config_validation() {
    assert!(PoolConfig::thread_pool(4).validate().is_ok());
    assert!(PoolConfig::dedicated().validate().is_ok());
    assert!(PoolConfig::new(PoolStrategy::Passive).validate().is_ok());
}

#[test]
fn test_pool_config_invalid_worker_count() {
    assert!(PoolConfig::thread_pool(0).validate().is_err());
    assert!(PoolConfig::dedicated().with_worker_count(2).validate().is_err());
}

#[test]
fn test_pool_config_invalid_stack_size() {
    let invalid = PoolConfig::thread_pool(2).with_thread_stack_size(1024);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_effective_values() {
    assert_eq!(PoolConfig::dedicated().effective_worker_count(), 1);
    assert_eq!(PoolConfig::new(PoolStrategy::Passive).effective_worker_count(), 0);
    assert_eq!(PoolConfig::thread_pool(3).effective_worker_count(), 3);
    assert!(PoolConfig::new(PoolStrategy::ThreadPool).effective_worker_count() >= 1);
    assert_eq!(PoolConfig::dedicated().effective_stack_size(), DEFAULT_STACK_SIZE);
}

#[test]
fn test_runtime_config_validation() {
    let config = RuntimeConfig::single("cpu", PoolConfig::thread_pool(2)).with_pool("io", PoolConfig::dedicated());
    assert!(config.validate().is_ok());
    assert_eq!(config.default_pool, "cpu");
}

#[test]
fn test_runtime_config_unknown_default() {
    let mut config = RuntimeConfig::single("cpu", PoolConfig::thread_pool(2));
    config.default_pool = "missing".into();
    assert!(config.validate().is_err());
}

#[test]
fn test_runtime_config_invalid_pool_is_named() {
    let config = RuntimeConfig::single("cpu", PoolConfig::thread_pool(0));
    let err = config.validate().unwrap_err();
    assert!(err.contains("cpu"));
}

#[test]
fn test_runtime_config_from_json() {
    let json = r#"{
        "default_pool": "cpu",
        "pools": {
            "cpu": { "strategy": "thread_pool", "worker_count": 4 },
            "lanes": { "strategy": "affinity", "worker_count": 2, "thread_stack_size": 1048576 },
            "inline": { "strategy": "passive" }
        }
    }"#;

    let config = RuntimeConfig::from_json_str(json).unwrap();
    assert_eq!(config.pools.len(), 3);
    assert_eq!(config.pools["lanes"].strategy, PoolStrategy::Affinity);
    assert_eq!(config.pools["lanes"].thread_stack_size, Some(1_048_576));
    assert_eq!(config.pools["inline"].worker_count, None);
}

#[test]
fn test_runtime_config_from_json_rejects_garbage() {
    let err = RuntimeConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));
    assert!(RuntimeConfig::from_json_str(r#"{ "default_pool": "x", "pools": { "x": { "strategy": "fibers" } } }"#).is_err());
}
