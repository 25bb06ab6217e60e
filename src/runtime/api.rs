//! Lifecycle control surface: the runtime handle, its builder, and process
//! scope handles.
//!
//! ```rust,ignore
//! use prometheus_flow_runtime::core::{FlowGraph, FnWork};
//! use prometheus_flow_runtime::runtime::Runtime;
//! use serde_json::json;
//!
//! let mut graph = FlowGraph::builder();
//! graph.node("hello", FnWork::new(|cx| Ok(cx.parameter().clone())));
//! let runtime = Runtime::builder(graph.build()?).build()?;
//!
//! let process = runtime.open_process_scope();
//! runtime.invoke(&process, "hello", json!({ "name": "world" }))?;
//! runtime.close_process_scope(&process)?;
//! runtime.shutdown(true);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::builders::{build_pool, build_pools};
use crate::config::{PoolConfig, PoolStrategy, RuntimeConfig};
use crate::core::audit::{AuditSink, NoopAuditSink};
use crate::core::engine::{DefaultHandler, RuntimeInner};
use crate::core::error::RuntimeError;
use crate::core::failure::Failure;
use crate::core::flow::FlowGraph;
use crate::core::resource::{ResourceContainer, ResourceKey, ScopeKind};
use crate::core::scope::{FlowOutcome, ProcessReport, ProcessScope};
use crate::core::worker_pool::{PoolStats, WorkerPool};

/// Name of the pool created when none is configured.
pub const DEFAULT_POOL: &str = "default";

/// Handle to a running engine. Every operation goes through an explicit
/// handle; there is no process-wide instance.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    stopped: AtomicBool,
}

impl Runtime {
    /// Start building a runtime for `graph`.
    #[must_use]
    pub fn builder(graph: FlowGraph) -> RuntimeBuilder {
        RuntimeBuilder::new(graph)
    }

    /// The flow graph this runtime executes.
    #[must_use]
    pub fn graph(&self) -> &FlowGraph {
        &self.inner.graph
    }

    /// Open a new process scope.
    #[must_use]
    pub fn open_process_scope(&self) -> ProcessHandle {
        let scope = ProcessScope::new(&self.inner.graph, Arc::clone(&self.inner.audit));
        self.inner.audit(scope.id(), None, "process", "process_opened", None);
        ProcessHandle { scope }
    }

    /// Start a flow at `node` inside `process`. Returns the flow id.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::UnknownNode` for an unknown node and
    /// `RuntimeError::ProcessClosed` if the scope no longer accepts flows.
    pub fn invoke(&self, process: &ProcessHandle, node: &str, parameter: Value) -> Result<Uuid, RuntimeError> {
        self.start(process, node, parameter, None)
    }

    /// Like [`invoke`](Self::invoke), calling `callback` with the flow's
    /// outcome once it finishes.
    ///
    /// # Errors
    ///
    /// Same as [`invoke`](Self::invoke). The callback is not called when the
    /// flow could not start.
    pub fn invoke_with_callback<F>(
        &self,
        process: &ProcessHandle,
        node: &str,
        parameter: Value,
        callback: F,
    ) -> Result<Uuid, RuntimeError>
    where
        F: FnOnce(FlowOutcome) + Send + 'static,
    {
        self.start(process, node, parameter, Some(Box::new(callback)))
    }

    fn start(
        &self,
        process: &ProcessHandle,
        node: &str,
        parameter: Value,
        callback: Option<crate::core::scope::FlowCallback>,
    ) -> Result<Uuid, RuntimeError> {
        let entry = self
            .inner
            .graph
            .node_id(node)
            .ok_or_else(|| RuntimeError::UnknownNode(node.to_string()))?;
        self.inner.start_flow(&process.scope, entry, parameter, callback)
    }

    /// Close a process scope: refuse new flows, skip queued work, wait for
    /// running flows, then unload process-scoped resources dependents first.
    /// Resources busy with an operation are released once it completes.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Fatal` if the scope was terminated by a failing
    /// default handler.
    pub fn close_process_scope(&self, process: &ProcessHandle) -> Result<ProcessReport, RuntimeError> {
        process.close()
    }

    /// Stop every pool. With `drain`, queued units run first; otherwise they
    /// are abandoned and their flows end cancelled. Idempotent.
    pub fn shutdown(&self, drain: bool) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(drain, pools = self.inner.pools.len(), "shutting down runtime");
        for pool in self.inner.pools.values() {
            pool.stop(drain);
        }
    }

    /// Statistics of every pool, by name.
    #[must_use]
    pub fn pool_stats(&self) -> HashMap<String, PoolStats> {
        self.inner
            .pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// A pool by name.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<Arc<dyn WorkerPool>> {
        self.inner.pools.get(name).cloned()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Units hold the engine, and pools hold units; stopping breaks the cycle.
        self.shutdown(false);
    }
}

/// Assembles a [`Runtime`].
pub struct RuntimeBuilder {
    graph: FlowGraph,
    config: Option<RuntimeConfig>,
    pools: HashMap<String, Arc<dyn WorkerPool>>,
    default_pool: Option<String>,
    default_handler: Option<DefaultHandler>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl RuntimeBuilder {
    fn new(graph: FlowGraph) -> Self {
        Self {
            graph,
            config: None,
            pools: HashMap::new(),
            default_pool: None,
            default_handler: None,
            audit: None,
        }
    }

    /// Build pools from configuration. Its default pool becomes the
    /// runtime's default unless [`default_pool`](Self::default_pool) is set.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register an already built pool under its own name.
    #[must_use]
    pub fn pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pools.insert(pool.name().to_string(), pool);
        self
    }

    /// Pool used by nodes that do not name one.
    #[must_use]
    pub fn default_pool(mut self, name: impl Into<String>) -> Self {
        self.default_pool = Some(name.into());
        self
    }

    /// Last-resort handler for failures no escalation table matches. If it
    /// returns a failure, the process scope is torn down.
    #[must_use]
    pub fn default_failure_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Failure) -> Result<(), Failure> + Send + Sync + 'static,
    {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Where audit events go. Discarded by default.
    #[must_use]
    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Build the runtime and start its pools.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, a node naming an unknown pool, or a
    /// pool that cannot start.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let mut pools = HashMap::new();
        let mut default_pool = self.default_pool;
        if let Some(config) = &self.config {
            pools.extend(build_pools(config)?);
            default_pool.get_or_insert_with(|| config.default_pool.clone());
        }
        pools.extend(self.pools);

        let default_pool = default_pool.unwrap_or_else(|| DEFAULT_POOL.to_string());
        if !pools.contains_key(&default_pool) {
            if !pools.is_empty() {
                return Err(RuntimeError::UnknownPool(default_pool));
            }
            let pool = build_pool(&default_pool, &PoolConfig::new(PoolStrategy::ThreadPool))?;
            pools.insert(default_pool.clone(), pool);
        }

        let default_handler = self.default_handler.unwrap_or_else(|| {
            Arc::new(|failure: &Failure| {
                error!(error = %failure, origin = %failure.origin(), "unhandled failure");
                Ok(())
            })
        });
        let audit = self.audit.unwrap_or_else(|| Arc::new(NoopAuditSink));

        let inner = RuntimeInner::new(self.graph, pools, &default_pool, default_handler, audit)?;
        for pool in inner.pools.values() {
            if let Err(e) = pool.start() {
                for started in inner.pools.values() {
                    started.stop(false);
                }
                return Err(e.into());
            }
        }
        info!(pools = inner.pools.len(), default_pool = %default_pool, nodes = inner.graph.nodes().len(), "runtime started");

        Ok(Runtime {
            inner: Arc::new(inner),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Handle to an open (or closed) process scope.
#[derive(Clone)]
pub struct ProcessHandle {
    scope: Arc<ProcessScope>,
}

impl ProcessHandle {
    /// Scope id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.scope.id()
    }

    /// Whether the scope still accepts flows.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.scope.is_open()
    }

    /// Flows currently running.
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.scope.active_flows()
    }

    /// Container of a process-scoped resource, created on first access.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::UnknownResource` for an unknown key or a
    /// resource bound to a narrower scope.
    pub fn resource(&self, key: ResourceKey) -> Result<Arc<ResourceContainer>, RuntimeError> {
        let registry = self.scope.registry();
        match registry.def(key) {
            Ok(def) if def.scope() == ScopeKind::Process => {}
            Ok(def) => {
                return Err(RuntimeError::UnknownResource(format!(
                    "`{}` is {:?}-scoped",
                    def.name(),
                    def.scope()
                )))
            }
            Err(failure) => return Err(RuntimeError::UnknownResource(failure.message().to_string())),
        }
        registry
            .get_or_create(key)
            .map_err(|failure| RuntimeError::UnknownResource(failure.message().to_string()))
    }

    /// Wait until no flow is running. Returns false on timeout.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scope.wait_idle(timeout)
    }

    /// Block until the scope is closed, by [`close`](Self::close) or by fatal
    /// teardown.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Fatal` after fatal teardown.
    pub fn wait_closed(&self) -> Result<ProcessReport, RuntimeError> {
        self.scope.wait_closed()
    }

    /// Close the scope. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Fatal` after fatal teardown.
    pub fn close(&self) -> Result<ProcessReport, RuntimeError> {
        self.scope.close()
    }

    /// The underlying scope.
    #[must_use]
    pub const fn scope(&self) -> &Arc<ProcessScope> {
        &self.scope
    }
}
