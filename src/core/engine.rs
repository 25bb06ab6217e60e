//! Engine state shared by every job: the graph, node-to-pool routing, the
//! default failure handler and the audit sink. Scheduling and escalation
//! resolution live here.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::audit::{build_audit_event, AuditSink};
use crate::core::error::RuntimeError;
use crate::core::failure::Failure;
use crate::core::flow::job::NodeJob;
use crate::core::flow::{FlowGraph, NodeId};
use crate::core::resource::{ResourceContainer, ResourceKey};
use crate::core::scope::{FlowCallback, ProcessScope, ThreadScope};
use crate::core::unit::{Affinity, Unit};
use crate::core::worker_pool::WorkerPool;

/// Last-resort failure handler. A failure returned from it is fatal to the
/// process scope.
pub type DefaultHandler = Arc<dyn Fn(&Failure) -> Result<(), Failure> + Send + Sync>;

/// A node execution about to be scheduled.
pub(crate) struct Launch {
    pub node: NodeId,
    pub parameter: Value,
    pub failure: Option<Failure>,
    pub chain: Vec<NodeId>,
    pub affinity: Option<Affinity>,
    /// Containers the failed node held, handed to its handler.
    pub failed_resources: HashMap<ResourceKey, Arc<ResourceContainer>>,
}

pub(crate) struct RuntimeInner {
    pub(crate) graph: Arc<FlowGraph>,
    pub(crate) pools: HashMap<String, Arc<dyn WorkerPool>>,
    node_pools: Vec<Arc<dyn WorkerPool>>,
    default_handler: DefaultHandler,
    pub(crate) audit: Arc<dyn AuditSink>,
}

impl RuntimeInner {
    pub(crate) fn new(
        graph: FlowGraph,
        pools: HashMap<String, Arc<dyn WorkerPool>>,
        default_pool: &str,
        default_handler: DefaultHandler,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, RuntimeError> {
        let mut node_pools = Vec::with_capacity(graph.nodes().len());
        for node in graph.nodes() {
            let name = node.pool().unwrap_or(default_pool);
            let pool = pools.get(name).ok_or_else(|| {
                RuntimeError::UnknownPool(format!("{name} (node `{}`)", node.name()))
            })?;
            node_pools.push(Arc::clone(pool));
        }
        Ok(Self {
            graph: Arc::new(graph),
            pools,
            node_pools,
            default_handler,
            audit,
        })
    }

    pub(crate) fn audit(&self, process: Uuid, flow: Option<Uuid>, subject: &str, action: &str, detail: Option<Value>) {
        self.audit.record(build_audit_event(process, flow, subject, action, detail));
    }

    /// Start a new flow at `entry`.
    pub(crate) fn start_flow(
        self: &Arc<Self>,
        process: &Arc<ProcessScope>,
        entry: NodeId,
        parameter: Value,
        callback: Option<FlowCallback>,
    ) -> Result<Uuid, RuntimeError> {
        process.begin_flow()?;
        let name = Arc::clone(&self.graph.node(entry).name);
        let thread = ThreadScope::new(&self.graph, Arc::clone(process), Arc::clone(&name), callback);
        debug!(process = %process.id(), flow = %thread.id(), entry = %name, "flow started");
        self.audit(process.id(), Some(thread.id()), &name, "flow_started", None);

        thread.enter();
        self.schedule(
            &thread,
            Launch {
                node: entry,
                parameter,
                failure: None,
                chain: Vec::new(),
                affinity: None,
                failed_resources: HashMap::new(),
            },
        );
        Ok(thread.id())
    }

    /// Hand a node execution to its pool. The caller has already counted it
    /// with [`ThreadScope::enter`].
    pub(crate) fn schedule(self: &Arc<Self>, thread: &Arc<ThreadScope>, launch: Launch) {
        let node = self.graph.node(launch.node);
        let pool = &self.node_pools[launch.node.0];
        let affinity = launch.affinity.clone();
        let unit = Unit::new(Arc::clone(&node.name), NodeJob::new(Arc::clone(self), Arc::clone(thread), launch))
            .with_affinity(affinity);
        pool.assign(unit);
    }

    /// Route a failure to the most specific handler: the failing node's own
    /// table, then the flow's, then the process's, then the default handler.
    /// Handlers already on `chain` are skipped so a failing handler cannot
    /// select itself again. `held` is what the failing node had gated; the
    /// selected handler can reach it through `WorkContext::failed_resource`.
    pub(crate) fn escalate(
        self: &Arc<Self>,
        thread: &Arc<ThreadScope>,
        failure: Failure,
        node: Option<NodeId>,
        chain: Vec<NodeId>,
        affinity: Option<Affinity>,
        held: HashMap<ResourceKey, Arc<ResourceContainer>>,
    ) {
        thread.record_failure(&failure);
        thread.disregard_oversight(self);

        let kinds = self.graph.kinds();
        let kind = kinds.name(failure.kind()).to_string();
        let process = thread.process().id();
        let levels = node
            .map(|id| ("node", self.graph.node(id).escalation()))
            .into_iter()
            .chain([
                ("thread", self.graph.thread_escalation()),
                ("process", self.graph.process_escalation()),
            ]);

        for (level, table) in levels {
            let Some(handler) = table.resolve(kinds, failure.kind()) else {
                continue;
            };
            let handler_name = Arc::clone(&self.graph.node(handler).name);
            if chain.contains(&handler) {
                debug!(flow = %thread.id(), handler = %handler_name, level, "handler already on the chain; escalating outward");
                continue;
            }

            info!(
                flow = %thread.id(),
                kind = %kind,
                level,
                handler = %handler_name,
                origin = %failure.origin(),
                "escalating failure"
            );
            self.audit(
                process,
                Some(thread.id()),
                &handler_name,
                "escalated",
                Some(json!({ "level": level, "kind": kind, "failure": failure.to_value() })),
            );

            let mut chain = chain;
            chain.push(handler);
            thread.enter();
            self.schedule(
                thread,
                Launch {
                    node: handler,
                    parameter: failure.to_value(),
                    failure: Some(failure),
                    chain,
                    affinity,
                    failed_resources: held,
                },
            );
            return;
        }

        error!(flow = %thread.id(), kind = %kind, origin = %failure.origin(), error = %failure, "unhandled failure reached the default handler");
        self.audit(process, Some(thread.id()), "default", "default_handler", Some(failure.to_value()));
        if let Err(fatal) = (self.default_handler)(&failure) {
            let fatal = fatal.raised_by_handler("default", failure);
            thread.record_fatal(fatal.clone());
            thread.process().terminate(fatal);
        }
    }
}
