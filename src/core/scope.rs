//! Scope containers: process scopes and the flows (thread scopes) in them.
//!
//! Lifetimes nest: every node execution gets an invocation registry, every
//! flow a thread registry and oversight state, and every process scope a
//! process registry. A flow finishes when its pending count (scheduled or
//! suspended node jobs plus in-flight resource operations) drops to zero;
//! at that point its oversight is resolved and its resources are released.
//! Closing a process scope cancels new work and waits for node jobs to drain.
//! Idle process resources are then unloaded dependents first; containers
//! with an operation in flight are unloaded once it completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::audit::{build_audit_event, AuditSink};
use crate::core::engine::RuntimeInner;
use crate::core::error::RuntimeError;
use crate::core::failure::Failure;
use crate::core::flow::FlowGraph;
use crate::core::oversight::OversightManager;
use crate::core::resource::{ResourceRegistry, ScopeKind};

/// How a flow ended, delivered to its completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    /// Every node completed and oversight was enforced.
    Completed,
    /// At least one failure occurred; each was routed to a handler. Oversight
    /// was disregarded.
    Escalated(Vec<Failure>),
    /// The process scope was closed before the flow finished.
    Cancelled,
    /// The default failure handler failed; the process scope was torn down.
    Fatal(Failure),
}

/// Callback receiving a flow's outcome.
pub type FlowCallback = Box<dyn FnOnce(FlowOutcome) + Send>;

/// Summary returned when a process scope closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    /// Process scope id.
    pub id: Uuid,
    /// Flows started in the scope.
    pub flows: u64,
    /// Process-scoped containers unloaded at close.
    pub resources_unloaded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

struct ProcessState {
    phase: Phase,
    active_flows: usize,
    flows: u64,
    fatal: Option<Failure>,
    unloaded: usize,
}

/// Outermost scope: owns process-scoped resources and the flows run in it.
pub struct ProcessScope {
    id: Uuid,
    registry: ResourceRegistry,
    audit: Arc<dyn AuditSink>,
    state: Mutex<ProcessState>,
    changed: Condvar,
    cancelled: AtomicBool,
    /// Scheduled or suspended node jobs across all flows. Resource
    /// operations are not counted.
    work: AtomicUsize,
}

impl ProcessScope {
    pub(crate) fn new(graph: &FlowGraph, audit: Arc<dyn AuditSink>) -> Arc<Self> {
        let id = Uuid::new_v4();
        info!(process = %id, "process scope opened");
        Arc::new(Self {
            id,
            registry: ResourceRegistry::new(ScopeKind::Process, Arc::clone(&graph.resources)),
            audit,
            state: Mutex::new(ProcessState {
                phase: Phase::Open,
                active_flows: 0,
                flows: 0,
                fatal: None,
                unloaded: 0,
            }),
            changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
            work: AtomicUsize::new(0),
        })
    }

    /// Scope id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Process-scoped resources.
    #[must_use]
    pub const fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Whether new flows are accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().phase == Phase::Open
    }

    /// Whether queued work should be skipped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Flows currently running.
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.state.lock().active_flows
    }

    pub(crate) fn begin_flow(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        if state.phase != Phase::Open || self.is_cancelled() {
            return Err(RuntimeError::ProcessClosed(self.id.to_string()));
        }
        state.active_flows += 1;
        state.flows += 1;
        Ok(())
    }

    pub(crate) fn flow_finished(&self) {
        let mut state = self.state.lock();
        state.active_flows = state.active_flows.saturating_sub(1);
        if state.active_flows == 0 {
            self.changed.notify_all();
        }
    }

    fn work_entered(&self) {
        self.work.fetch_add(1, Ordering::AcqRel);
    }

    fn work_exited(&self) {
        if self.work.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _state = self.state.lock();
            self.changed.notify_all();
        }
    }

    /// Wait until no flow is running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.active_flows > 0 {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.active_flows == 0;
            }
        }
        true
    }

    /// Cancel, wait for running node jobs, then unload every process-scoped
    /// resource. Idle containers go first; a container with an operation in
    /// flight, and whatever it depends on, is unloaded after the operation
    /// completes and the flows it holds open have finished. Idempotent;
    /// concurrent callers all observe the same result.
    ///
    /// Must not be called from inside one of this scope's flows.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Fatal` if the scope was terminated by a failing
    /// default handler. Resources are still unloaded first.
    pub fn close(&self) -> Result<ProcessReport, RuntimeError> {
        let mut state = self.state.lock();
        loop {
            match state.phase {
                Phase::Open => break,
                Phase::Closing => self.changed.wait(&mut state),
                Phase::Closed => return self.closed_result(&state),
            }
        }

        state.phase = Phase::Closing;
        self.cancelled.store(true, Ordering::Release);
        info!(process = %self.id, active_flows = state.active_flows, "closing process scope");
        while self.work.load(Ordering::Acquire) > 0 {
            self.changed.wait(&mut state);
        }
        drop(state);

        let (mut unloaded, deferred) = self.registry.unload_idle();

        let mut state = self.state.lock();
        if state.active_flows > 0 {
            debug!(process = %self.id, active_flows = state.active_flows, deferred = deferred.len(), "waiting for in-flight operations");
        }
        while state.active_flows > 0 {
            self.changed.wait(&mut state);
        }
        drop(state);

        for container in &deferred {
            container.unload();
        }
        unloaded += deferred.len();

        let mut state = self.state.lock();
        state.phase = Phase::Closed;
        state.unloaded = unloaded;
        self.changed.notify_all();
        let result = self.closed_result(&state);
        drop(state);

        self.audit.record(build_audit_event(
            self.id,
            None,
            "process",
            "process_closed",
            Some(json!({ "resources_unloaded": unloaded, "fatal": result.is_err() })),
        ));
        info!(process = %self.id, resources_unloaded = unloaded, "process scope closed");
        result
    }

    /// Block until the scope is closed (by `close` or fatal teardown).
    ///
    /// # Errors
    ///
    /// Same as [`close`](Self::close).
    pub fn wait_closed(&self) -> Result<ProcessReport, RuntimeError> {
        let mut state = self.state.lock();
        while state.phase != Phase::Closed {
            self.changed.wait(&mut state);
        }
        self.closed_result(&state)
    }

    fn closed_result(&self, state: &ProcessState) -> Result<ProcessReport, RuntimeError> {
        if let Some(fatal) = &state.fatal {
            return Err(RuntimeError::Fatal(fatal.clone()));
        }
        Ok(ProcessReport {
            id: self.id,
            flows: state.flows,
            resources_unloaded: state.unloaded,
        })
    }

    /// Record a fatal failure and tear the scope down on a separate thread,
    /// since the caller is a worker inside one of the scope's flows.
    pub(crate) fn terminate(self: &Arc<Self>, failure: Failure) {
        {
            let mut state = self.state.lock();
            if state.fatal.is_some() {
                return;
            }
            state.fatal = Some(failure.clone());
        }
        self.cancelled.store(true, Ordering::Release);
        error!(process = %self.id, error = %failure, "process scope terminated fatally");
        self.audit.record(build_audit_event(
            self.id,
            None,
            "process",
            "fatal",
            Some(failure.to_value()),
        ));

        let scope = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("process-teardown-{}", self.id))
            .spawn(move || {
                if let Err(e) = scope.close() {
                    debug!(process = %scope.id, error = %e, "fatal teardown finished");
                }
            });
        if let Err(e) = spawned {
            error!(process = %self.id, error = %e, "failed to spawn teardown thread");
        }
    }
}

#[derive(Default)]
struct FlowState {
    failures: Vec<Failure>,
    fatal: Option<Failure>,
    cancelled: bool,
    retained: Vec<ResourceRegistry>,
    callback: Option<FlowCallback>,
    finished: bool,
}

/// One flow: the entry node and everything it continues into.
pub struct ThreadScope {
    id: Uuid,
    entry: Arc<str>,
    process: Arc<ProcessScope>,
    registry: ResourceRegistry,
    oversight: Mutex<OversightManager>,
    pending: AtomicUsize,
    state: Mutex<FlowState>,
}

impl ThreadScope {
    pub(crate) fn new(
        graph: &FlowGraph,
        process: Arc<ProcessScope>,
        entry: Arc<str>,
        callback: Option<FlowCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            entry,
            process,
            registry: ResourceRegistry::new(ScopeKind::Thread, Arc::clone(&graph.resources)),
            oversight: Mutex::new(OversightManager::new(Arc::clone(&graph.oversights))),
            pending: AtomicUsize::new(0),
            state: Mutex::new(FlowState {
                callback,
                ..FlowState::default()
            }),
        })
    }

    /// Flow id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Enclosing process scope.
    #[must_use]
    pub const fn process(&self) -> &Arc<ProcessScope> {
        &self.process
    }

    /// Thread-scoped resources.
    #[must_use]
    pub const fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub(crate) const fn oversight(&self) -> &Mutex<OversightManager> {
        &self.oversight
    }

    pub(crate) fn enter(&self) {
        self.process.work_entered();
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit(self: &Arc<Self>, engine: &Arc<RuntimeInner>) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.quiesce(engine);
        }
        self.process.work_exited();
    }

    /// Hold the flow open for a resource operation. Unlike [`enter`](Self::enter)
    /// this does not delay the process scope's close.
    pub(crate) fn enter_operation(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit_operation(self: &Arc<Self>, engine: &Arc<RuntimeInner>) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.quiesce(engine);
        }
    }

    pub(crate) fn record_failure(&self, failure: &Failure) {
        self.state.lock().failures.push(failure.clone());
    }

    pub(crate) fn record_fatal(&self, failure: Failure) {
        self.state.lock().fatal.get_or_insert(failure);
    }

    pub(crate) fn mark_cancelled(&self) {
        self.state.lock().cancelled = true;
    }

    /// Keep a failed node's invocation registry alive until the flow ends.
    pub(crate) fn retain(&self, registry: ResourceRegistry) {
        self.state.lock().retained.push(registry);
    }

    fn is_clean(&self) -> bool {
        let state = self.state.lock();
        state.failures.is_empty() && state.fatal.is_none() && !state.cancelled
    }

    /// Disregard every open activation set now.
    pub(crate) fn disregard_oversight(&self, engine: &RuntimeInner) {
        let pending = self.oversight.lock().take_all();
        for resolution in pending {
            debug!(flow = %self.id, oversight = resolution.name(), facets = resolution.len(), "disregarding oversight");
            engine.audit(self.process.id, Some(self.id), resolution.name(), "disregarded", None);
            resolution.disregard();
        }
    }

    fn quiesce(self: &Arc<Self>, engine: &Arc<RuntimeInner>) {
        loop {
            if !self.is_clean() {
                self.disregard_oversight(engine);
                break;
            }

            let pending = self.oversight.lock().take_all();
            if pending.is_empty() {
                break;
            }

            // Enforcement failures escalate; hold the flow open meanwhile.
            self.enter();
            let mut escalated = false;
            for resolution in pending {
                let name = resolution.name().to_string();
                match resolution.enforce() {
                    Ok(()) => {
                        debug!(flow = %self.id, oversight = %name, "oversight enforced");
                        engine.audit(self.process.id, Some(self.id), &name, "enforced", None);
                    }
                    Err(failure) => {
                        warn!(flow = %self.id, oversight = %name, error = %failure, "oversight enforcement failed");
                        escalated = true;
                        engine.escalate(self, failure, None, Vec::new(), None, HashMap::new());
                    }
                }
            }
            let last = self.pending.fetch_sub(1, Ordering::AcqRel) == 1;
            self.process.work_exited();
            if !last {
                // Handler jobs now hold the flow open; the last one finishes it.
                return;
            }
            if !escalated {
                break;
            }
        }
        self.finalize(engine);
    }

    fn finalize(self: &Arc<Self>, engine: &RuntimeInner) {
        let (outcome, callback, retained) = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            let outcome = if let Some(fatal) = &state.fatal {
                FlowOutcome::Fatal(fatal.clone())
            } else if state.cancelled {
                FlowOutcome::Cancelled
            } else if state.failures.is_empty() {
                FlowOutcome::Completed
            } else {
                FlowOutcome::Escalated(state.failures.clone())
            };
            (outcome, state.callback.take(), std::mem::take(&mut state.retained))
        };

        self.registry.release_all_when_idle();
        for registry in retained {
            registry.release_all_when_idle();
        }

        let label = match &outcome {
            FlowOutcome::Completed => "completed",
            FlowOutcome::Escalated(_) => "escalated",
            FlowOutcome::Cancelled => "cancelled",
            FlowOutcome::Fatal(_) => "fatal",
        };
        debug!(flow = %self.id, entry = %self.entry, outcome = label, "flow finished");
        engine.audit(
            self.process.id,
            Some(self.id),
            &self.entry,
            "flow_finished",
            Some(json!({ "outcome": label })),
        );

        if let Some(callback) = callback {
            callback(outcome);
        }
        self.process.flow_finished();
    }
}
