//! Tests for error types

use prometheus_flow_runtime::core::{AppResult, Failure, PoolError, RuntimeError};

#[test]
fn test_unknown_node_error() {
    let err = RuntimeError::UnknownNode("render".to_string());
    assert_eq!(format!("{err}"), "unknown node: render");
    assert_eq!(err.as_label(), "unknown_node");
}

#[test]
fn test_process_closed_error() {
    let err = RuntimeError::ProcessClosed("p1".to_string());
    assert_eq!(format!("{err}"), "process scope p1 is closed");
}

#[test]
fn test_fatal_error_carries_failure() {
    let err = RuntimeError::Fatal(Failure::runtime("cannot recover"));
    assert_eq!(format!("{err}"), "process scope terminated fatally: cannot recover");
    assert_eq!(err.as_label(), "fatal");
}

#[test]
fn test_pool_error_converts() {
    let err: RuntimeError = PoolError::PoolShutdown.into();
    assert_eq!(err.as_label(), "pool");
}

#[test]
fn test_app_result_wraps_runtime_error() {
    fn invoke() -> AppResult<()> {
        Err(RuntimeError::UnknownPool("gpu".to_string()))?;
        Ok(())
    }
    let err = invoke().unwrap_err();
    assert_eq!(err.to_string(), "unknown pool: gpu");
    assert!(err.downcast_ref::<RuntimeError>().is_some());
}
