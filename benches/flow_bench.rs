//! Benchmarks for the flow runtime.
//!
//! Benchmarks cover:
//! - Unit dispatch throughput per pool strategy
//! - Suspend/activate round trips
//! - Resource gating on a shared process-scoped container
//! - End-to-end flows with successors and escalation

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;

use prometheus_flow_runtime::builders::build_pool;
use prometheus_flow_runtime::config::{PoolConfig, PoolStrategy, RuntimeConfig};
use prometheus_flow_runtime::core::{
    Activation, Failure, FlowGraph, FnWork, JobStatus, ScopeKind, SyncSource, Unit,
};
use prometheus_flow_runtime::runtime::Runtime;
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(30);

// ============================================================================
// Pool Benchmarks
// ============================================================================

fn bench_pool_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_dispatch");

    for strategy in [PoolStrategy::ThreadPool, PoolStrategy::Dedicated, PoolStrategy::Affinity] {
        let config = if strategy == PoolStrategy::Dedicated {
            PoolConfig::dedicated()
        } else {
            PoolConfig::new(strategy).with_worker_count(4)
        };
        let pool = build_pool("bench", &config).unwrap();
        pool.start().unwrap();

        for size in [100_u64, 1_000] {
            group.throughput(Throughput::Elements(size));
            group.bench_with_input(
                BenchmarkId::new(format!("{strategy:?}"), size),
                &size,
                |b, &size| {
                    b.iter(|| {
                        let (tx, rx) = flume::unbounded();
                        for i in 0..size {
                            let tx = tx.clone();
                            pool.assign(Unit::from_fn("noop", move |_| {
                                tx.send(black_box(i)).unwrap();
                                JobStatus::Complete
                            }));
                        }
                        for _ in 0..size {
                            rx.recv_timeout(WAIT).unwrap();
                        }
                    });
                },
            );
        }
        pool.stop(true);
    }
    group.finish();
}

fn bench_suspend_resume(c: &mut Criterion) {
    let mut group = c.benchmark_group("suspend_resume");
    let pool = build_pool("bench", &PoolConfig::thread_pool(2)).unwrap();
    pool.start().unwrap();

    group.bench_function("single_round_trip", |b| {
        b.iter(|| {
            let (parked_tx, parked_rx) = flume::bounded::<Activation>(1);
            let (done_tx, done_rx) = flume::bounded::<()>(1);
            let mut parked = false;
            pool.assign(Unit::from_fn("waiter", move |cx| {
                if parked {
                    done_tx.send(()).unwrap();
                    return JobStatus::Complete;
                }
                parked = true;
                parked_tx.send(cx.activation().register()).unwrap();
                JobStatus::Suspended
            }));
            parked_rx.recv_timeout(WAIT).unwrap().activate();
            done_rx.recv_timeout(WAIT).unwrap();
        });
    });
    group.finish();
    pool.stop(true);
}

// ============================================================================
// Flow Benchmarks
// ============================================================================

fn bench_gated_flows(c: &mut Criterion) {
    let mut group = c.benchmark_group("gated_flows");

    let mut graph = FlowGraph::builder();
    let db = graph.resource("db", ScopeKind::Process, SyncSource::new(|| Ok(vec![0_u8; 1024])));
    let session = graph.resource("session", ScopeKind::Thread, SyncSource::new(|| Ok(0_u64)));
    graph
        .node("read", FnWork::new(move |cx| {
            let bytes = cx.instance::<Vec<u8>>(db).map_or(0, |v| v.len());
            Ok(json!(bytes))
        }))
        .requires(db)
        .requires(session);
    let runtime = Runtime::builder(graph.build().unwrap())
        .config(RuntimeConfig::single("default", PoolConfig::thread_pool(4)))
        .build()
        .unwrap();
    let process = runtime.open_process_scope();

    for flows in [10_u64, 100] {
        group.throughput(Throughput::Elements(flows));
        group.bench_with_input(BenchmarkId::from_parameter(flows), &flows, |b, &flows| {
            b.iter(|| {
                for _ in 0..flows {
                    runtime.invoke(&process, "read", Value::Null).unwrap();
                }
                assert!(process.wait_idle(WAIT));
            });
        });
    }
    group.finish();
    runtime.close_process_scope(&process).unwrap();
    runtime.shutdown(true);
}

fn bench_end_to_end_scenario(c: &mut Criterion) {
    let mut group = c.benchmark_group("end_to_end_scenario");

    let mut graph = FlowGraph::builder();
    let invalid = graph.failure_kind("invalid", None);
    graph
        .node("parse", FnWork::new(move |cx| {
            let n = cx.parameter()["n"].as_u64().unwrap_or_default();
            // 10% of requests fail validation
            if n % 10 == 0 {
                return Err(Failure::new(invalid, "rejected"));
            }
            Ok(json!(n))
        }))
        .next("enrich")
        .next("index")
        .escalate(invalid, "reject");
    graph.node("enrich", FnWork::new(|cx| Ok(cx.parameter().clone())));
    graph.node("index", FnWork::new(|cx| Ok(cx.parameter().clone())));
    graph.node("reject", FnWork::new(|_| Ok(Value::Null)));

    let runtime = Runtime::builder(graph.build().unwrap())
        .config(RuntimeConfig::single("default", PoolConfig::thread_pool(4)))
        .build()
        .unwrap();
    let process = runtime.open_process_scope();

    group.bench_function("realistic_workload", |b| {
        b.iter(|| {
            for n in 0..150_u64 {
                runtime.invoke(&process, "parse", json!({ "n": n })).unwrap();
            }
            assert!(process.wait_idle(WAIT));
        });
    });
    group.finish();

    runtime.close_process_scope(&process).unwrap();
    runtime.shutdown(true);
}

// ============================================================================
// Benchmark Groups
// ============================================================================

criterion_group!(pool_benches, bench_pool_dispatch, bench_suspend_resume);

criterion_group!(flow_benches, bench_gated_flows, bench_end_to_end_scenario);

criterion_main!(pool_benches, flow_benches);
