//! Tests for tokio pool utilities

use prometheus_flow_runtime::core::{JobStatus, Unit, WorkerPool};
use prometheus_flow_runtime::runtime::TokioPool;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_pool_on_current_handle() {
    let pool = TokioPool::new("blocking", tokio::runtime::Handle::current());
    pool.start().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut tx = Some(tx);
    pool.assign(Unit::from_fn("answer", move |_| {
        if let Some(tx) = tx.take() {
            tx.send(123).unwrap();
        }
        JobStatus::Complete
    }));

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
    assert_eq!(pool.handle().runtime_flavor(), tokio::runtime::RuntimeFlavor::MultiThread);
}
