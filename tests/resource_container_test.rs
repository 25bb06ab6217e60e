//! Integration tests for resource containers
//!
//! These tests validate:
//! - At-most-once loading under concurrent requests from several pools
//! - Busy gating: callers queued during an operation are each activated once
//! - Scope isolation of thread-scoped resources
//! - Process close waits for busy containers without holding up siblings,
//!   including operations started from inside a flow

use parking_lot::Mutex;
use prometheus_flow_runtime::config::PoolConfig;
use prometheus_flow_runtime::core::{
    Activation, FlowGraph, FlowOutcome, FnWork, Instance, JobStatus, LoadNotifier, OperationNotifier,
    ResourceContainer, ResourceDef, ResourceKey, ResourceSource, ResourceState, ScopeKind, SyncSource,
    ThreadPool, Unit, WorkerPool,
};
use prometheus_flow_runtime::runtime::Runtime;
use rand::Rng;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// HELPER SOURCES
// ============================================================================

/// Loads on a background thread after a short delay.
struct SlowSource {
    loads: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl ResourceSource for SlowSource {
    fn start_load(&self, notifier: LoadNotifier) {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.loaded(Arc::new(42_u32));
        });
    }

    fn release(&self, _instance: Instance) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn slow(loads: &Arc<AtomicUsize>, released: &Arc<AtomicUsize>) -> SlowSource {
    SlowSource {
        loads: Arc::clone(loads),
        released: Arc::clone(released),
    }
}

/// Loads inline and records the order of releases.
struct Tracked {
    name: &'static str,
    released: Arc<Mutex<Vec<&'static str>>>,
}

impl ResourceSource for Tracked {
    fn start_load(&self, notifier: LoadNotifier) {
        notifier.loaded(Arc::new(()));
    }

    fn release(&self, _instance: Instance) {
        self.released.lock().push(self.name);
    }
}

fn tracked(name: &'static str, released: &Arc<Mutex<Vec<&'static str>>>) -> Tracked {
    Tracked {
        name,
        released: Arc::clone(released),
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Unit that gates on `container` the way node jobs do.
fn gated_unit(container: Arc<ResourceContainer>, runs: Arc<AtomicUsize>, done: flume::Sender<u32>) -> Unit {
    Unit::from_fn("gated", move |cx| {
        runs.fetch_add(1, Ordering::SeqCst);
        match container.load(cx.activation()) {
            Ok(true) => {}
            Ok(false) => return JobStatus::Suspended,
            Err(failure) => panic!("load failed: {failure}"),
        }
        if !container.is_ready(cx.activation()) {
            return JobStatus::Suspended;
        }
        done.send(*container.instance_as::<u32>().unwrap()).unwrap();
        JobStatus::Complete
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[test]
fn test_concurrent_loads_transition_once() {
    let loads = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let def = ResourceDef::new(ResourceKey::new(0), "model", ScopeKind::Process, slow(&loads, &released));
    let container = ResourceContainer::new(&def);

    // Two independent pools race to load the same container.
    let left = ThreadPool::new("left", PoolConfig::thread_pool(2)).unwrap();
    let right = ThreadPool::new("right", PoolConfig::thread_pool(2)).unwrap();
    left.start().unwrap();
    right.start().unwrap();

    let (tx, rx) = flume::unbounded();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut rng = rand::rng();
    for i in 0..16 {
        let unit = gated_unit(Arc::clone(&container), Arc::clone(&runs), tx.clone());
        if rng.random_bool(0.5) || i == 0 {
            left.assign(unit);
        } else {
            right.assign(unit);
        }
    }

    for _ in 0..16 {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 42);
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(container.load_transitions(), 1);
    assert_eq!(container.state(), ResourceState::Loaded);

    left.stop(true);
    right.stop(true);
    container.unload();
    container.unload();
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_two_units_observe_ready_after_single_load() {
    let loads = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let def = ResourceDef::new(ResourceKey::new(0), "conn", ScopeKind::Thread, slow(&loads, &released));
    let container = ResourceContainer::new(&def);

    let pool = ThreadPool::new("io", PoolConfig::thread_pool(2)).unwrap();
    pool.start().unwrap();
    let (tx, rx) = flume::unbounded();
    let runs = Arc::new(AtomicUsize::new(0));
    pool.assign(gated_unit(Arc::clone(&container), Arc::clone(&runs), tx.clone()));
    pool.assign(gated_unit(Arc::clone(&container), Arc::clone(&runs), tx));

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 42);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 42);
    assert_eq!(container.load_transitions(), 1);
    pool.stop(true);
    // Each unit suspended at most once on the load, so at most two runs each.
    assert!(runs.load(Ordering::SeqCst) <= 4);
}

#[test]
fn test_busy_container_queues_and_activates_each_caller_once() {
    let def = ResourceDef::new(
        ResourceKey::new(0),
        "socket",
        ScopeKind::Process,
        SyncSource::new(|| Ok(7_u32)),
    );
    let container = ResourceContainer::new(&def);
    assert!(container.load(&Activation::new()).unwrap());

    let pending: Arc<Mutex<Option<OperationNotifier>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&pending);
    container
        .start_operation(move |notifier| *slot.lock() = Some(notifier))
        .unwrap();
    assert_eq!(container.state(), ResourceState::Busy);
    assert!(container.instance().is_none());

    let pool = ThreadPool::new("callers", PoolConfig::thread_pool(2)).unwrap();
    pool.start().unwrap();
    let (tx, rx) = flume::unbounded();
    let first_runs = Arc::new(AtomicUsize::new(0));
    let second_runs = Arc::new(AtomicUsize::new(0));
    pool.assign(gated_unit(Arc::clone(&container), Arc::clone(&first_runs), tx.clone()));
    pool.assign(gated_unit(Arc::clone(&container), Arc::clone(&second_runs), tx));

    assert!(wait_for(|| container.waiting() == 2));
    assert!(rx.try_recv().is_err());

    pending.lock().take().unwrap().complete();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);
    pool.stop(true);

    assert_eq!(first_runs.load(Ordering::SeqCst), 2);
    assert_eq!(second_runs.load(Ordering::SeqCst), 2);
    assert_eq!(container.state(), ResourceState::Ready);
    assert_eq!(container.waiting(), 0);
}

#[test]
fn test_failed_load_reaches_every_waiter() {
    struct Refuses;

    impl ResourceSource for Refuses {
        fn start_load(&self, notifier: LoadNotifier) {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                notifier.failed(prometheus_flow_runtime::core::Failure::runtime("no route to host"));
            });
        }
    }

    let def = ResourceDef::new(ResourceKey::new(0), "remote", ScopeKind::Process, Refuses);
    let container = ResourceContainer::new(&def);
    let first = Activation::new();
    let second = Activation::new();
    assert!(!container.load(&first).unwrap());
    assert!(!container.load(&second).unwrap());

    assert!(wait_for(|| first.is_activated() && second.is_activated()));
    let failure = container.load(&first).unwrap_err();
    assert_eq!(failure.message(), "no route to host");
    assert_eq!(container.state(), ResourceState::Failed);
    assert_eq!(container.load_transitions(), 1);
}

#[test]
fn test_thread_scoped_resources_do_not_leak_between_flows() {
    let built = Arc::new(AtomicUsize::new(0));
    let built_clone = Arc::clone(&built);

    let mut graph = FlowGraph::builder();
    let session = graph.resource(
        "session",
        ScopeKind::Thread,
        SyncSource::new(move || Ok(built_clone.fetch_add(1, Ordering::SeqCst))),
    );
    graph
        .node(
            "first",
            FnWork::new(move |cx| {
                let id = cx.instance::<usize>(session).unwrap();
                Ok(json!(*id))
            }),
        )
        .requires(session)
        .next("second");
    graph
        .node(
            "second",
            FnWork::new(move |cx| {
                let id = cx.instance::<usize>(session).unwrap();
                assert_eq!(json!(*id), *cx.parameter(), "same flow must see the same session");
                Ok(json!(*id))
            }),
        )
        .requires(session);

    let runtime = Runtime::builder(graph.build().unwrap())
        .config(prometheus_flow_runtime::config::RuntimeConfig::single(
            "default",
            PoolConfig::thread_pool(4),
        ))
        .build()
        .unwrap();
    let process = runtime.open_process_scope();

    let (tx, rx) = flume::unbounded();
    for _ in 0..5 {
        let tx = tx.clone();
        runtime
            .invoke_with_callback(&process, "first", json!(null), move |outcome| {
                tx.send(outcome).unwrap();
            })
            .unwrap();
    }
    for _ in 0..5 {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), FlowOutcome::Completed);
    }

    // One session per flow, never shared.
    assert_eq!(built.load(Ordering::SeqCst), 5);
    runtime.close_process_scope(&process).unwrap();
    runtime.shutdown(true);
}

#[test]
fn test_process_close_waits_for_busy_container_only() {
    let released = Arc::new(Mutex::new(Vec::new()));

    let mut graph = FlowGraph::builder();
    let busy = graph.resource("busy", ScopeKind::Process, tracked("busy", &released));
    let idle = graph.resource("idle", ScopeKind::Process, tracked("idle", &released));
    graph.node("noop", FnWork::new(|_| Ok(json!(null))));

    let runtime = Runtime::builder(graph.build().unwrap()).build().unwrap();
    let process = runtime.open_process_scope();
    let busy = process.resource(busy).unwrap();
    let idle = process.resource(idle).unwrap();
    assert!(busy.load(&Activation::new()).unwrap());
    assert!(idle.load(&Activation::new()).unwrap());

    let pending: Arc<Mutex<Option<OperationNotifier>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&pending);
    busy.start_operation(move |notifier| *slot.lock() = Some(notifier)).unwrap();

    let (done_tx, done_rx) = flume::unbounded();
    let closing = process.clone();
    let closer = thread::spawn(move || {
        done_tx.send(closing.close()).unwrap();
    });

    assert!(wait_for(|| idle.state() == ResourceState::Final));
    assert_eq!(busy.state(), ResourceState::Busy);
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(!process.is_open());

    pending.lock().take().unwrap().complete();
    let report = done_rx.recv_timeout(WAIT).unwrap().unwrap();
    closer.join().unwrap();

    assert_eq!(report.resources_unloaded, 2);
    assert_eq!(busy.state(), ResourceState::Final);
    assert_eq!(*released.lock(), vec!["idle", "busy"]);
    let distinct: HashSet<_> = released.lock().iter().copied().collect();
    assert_eq!(distinct.len(), 2);
    runtime.shutdown(true);
}

#[test]
fn test_process_close_spares_only_the_container_a_flow_operation_holds() {
    let released = Arc::new(Mutex::new(Vec::new()));
    let (parked_tx, parked_rx) = flume::unbounded::<OperationNotifier>();

    let mut graph = FlowGraph::builder();
    let busy = graph.resource("busy", ScopeKind::Process, tracked("busy", &released));
    let idle = graph.resource("idle", ScopeKind::Process, tracked("idle", &released));
    graph
        .node(
            "flush",
            FnWork::new(move |cx| {
                let parked_tx = parked_tx.clone();
                cx.start_operation(busy, move |notifier| parked_tx.send(notifier).unwrap())?;
                Ok(json!(null))
            }),
        )
        .requires(busy);

    let runtime = Runtime::builder(graph.build().unwrap()).build().unwrap();
    let process = runtime.open_process_scope();
    let idle = process.resource(idle).unwrap();
    assert!(idle.load(&Activation::new()).unwrap());

    let (outcome_tx, outcome_rx) = flume::unbounded();
    runtime
        .invoke_with_callback(&process, "flush", json!(null), move |outcome| {
            outcome_tx.send(outcome).unwrap();
        })
        .unwrap();
    let notifier = parked_rx.recv_timeout(WAIT).unwrap();
    let busy = process.resource(busy).unwrap();
    assert_eq!(busy.state(), ResourceState::Busy);

    let (done_tx, done_rx) = flume::unbounded();
    let closing = process.clone();
    let closer = thread::spawn(move || {
        done_tx.send(closing.close()).unwrap();
    });

    // The node job is done; only the operation holds the flow open.
    assert!(wait_for(|| idle.state() == ResourceState::Final));
    assert_eq!(busy.state(), ResourceState::Busy);
    assert_eq!(*released.lock(), vec!["idle"]);
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(outcome_rx.try_recv().is_err());

    notifier.complete();
    assert_eq!(outcome_rx.recv_timeout(WAIT).unwrap(), FlowOutcome::Completed);
    let report = done_rx.recv_timeout(WAIT).unwrap().unwrap();
    closer.join().unwrap();

    assert_eq!(report.resources_unloaded, 2);
    assert_eq!(busy.state(), ResourceState::Final);
    assert_eq!(*released.lock(), vec!["idle", "busy"]);
    runtime.shutdown(true);
}
