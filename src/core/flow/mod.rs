//! Continuation flow graph: nodes, successor edges and escalation edges.
//!
//! The graph is static. It is assembled once with [`FlowGraphBuilder`],
//! validated, and then only walked by the engine: a completed node schedules
//! its successors, a failed node resolves a handler through its own
//! escalation table, then the flow's, then the process's, and finally the
//! runtime's default handler.

mod builder;
mod context;
mod escalation;
pub(crate) mod job;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::core::administration::{DutyDef, DutyId};
use crate::core::failure::{Failure, FailureKinds};
use crate::core::oversight::{OversightDef, OversightId};
use crate::core::resource::{ResourceDef, ResourceKey};

pub use builder::{FlowGraphBuilder, NodeBuilder};
pub use context::WorkContext;
pub use escalation::{EscalationEntry, EscalationTable};

/// Identifier of a node within a flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Body of a node.
pub trait Work: Send + Sync + 'static {
    /// Execute the body. The returned value is the parameter of every
    /// successor.
    ///
    /// # Errors
    ///
    /// A failure is escalated.
    fn execute(&self, cx: &mut WorkContext<'_>) -> Result<Value, Failure>;
}

/// Adapter running a closure as [`Work`].
pub struct FnWork<F>(F);

impl<F> FnWork<F>
where
    F: Fn(&mut WorkContext<'_>) -> Result<Value, Failure> + Send + Sync + 'static,
{
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Work for FnWork<F>
where
    F: Fn(&mut WorkContext<'_>) -> Result<Value, Failure> + Send + Sync + 'static,
{
    fn execute(&self, cx: &mut WorkContext<'_>) -> Result<Value, Failure> {
        (self.0)(cx)
    }
}

/// A node of the graph.
pub struct NodeDef {
    pub(crate) id: NodeId,
    pub(crate) name: Arc<str>,
    pub(crate) work: Arc<dyn Work>,
    pub(crate) pool: Option<String>,
    pub(crate) requires: Vec<ResourceKey>,
    pub(crate) next: Vec<NodeId>,
    pub(crate) escalation: EscalationTable,
    pub(crate) pre: Vec<DutyId>,
    pub(crate) post: Vec<DutyId>,
    pub(crate) governed_by: Vec<OversightId>,
}

impl NodeDef {
    /// Node id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool the node runs on; `None` means the runtime's default pool.
    #[must_use]
    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    /// Resources the body needs ready.
    #[must_use]
    pub fn requires(&self) -> &[ResourceKey] {
        &self.requires
    }

    /// Successors, in declaration order.
    #[must_use]
    pub fn next(&self) -> &[NodeId] {
        &self.next
    }

    /// Node-level escalation table.
    #[must_use]
    pub const fn escalation(&self) -> &EscalationTable {
        &self.escalation
    }
}

impl fmt::Debug for NodeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

/// Validated, immutable flow graph.
pub struct FlowGraph {
    pub(crate) kinds: FailureKinds,
    pub(crate) resources: Arc<[ResourceDef]>,
    pub(crate) oversights: Arc<[OversightDef]>,
    pub(crate) duties: Vec<DutyDef>,
    pub(crate) nodes: Vec<NodeDef>,
    pub(crate) by_name: HashMap<String, NodeId>,
    pub(crate) governing: Vec<Vec<OversightId>>,
    pub(crate) thread_escalation: EscalationTable,
    pub(crate) process_escalation: EscalationTable,
}

impl fmt::Debug for FlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowGraph")
            .field("nodes", &self.nodes.len())
            .field("resources", &self.resources.len())
            .field("oversights", &self.oversights.len())
            .field("duties", &self.duties.len())
            .finish_non_exhaustive()
    }
}

impl FlowGraph {
    /// Start assembling a graph.
    #[must_use]
    pub fn builder() -> FlowGraphBuilder {
        FlowGraphBuilder::new()
    }

    /// Failure-kind hierarchy.
    #[must_use]
    pub const fn kinds(&self) -> &FailureKinds {
        &self.kinds
    }

    /// Node by id.
    ///
    /// Ids are only minted by the builder of this graph, so lookups are
    /// always in range.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &NodeDef {
        &self.nodes[id.0]
    }

    /// Node by name.
    #[must_use]
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// All nodes.
    #[must_use]
    pub fn nodes(&self) -> &[NodeDef] {
        &self.nodes
    }

    /// Resource definitions, indexed by key.
    #[must_use]
    pub fn resources(&self) -> &[ResourceDef] {
        &self.resources
    }

    /// Resource key by name.
    #[must_use]
    pub fn resource_key(&self, name: &str) -> Option<ResourceKey> {
        self.resources.iter().find(|def| def.name() == name).map(ResourceDef::key)
    }

    /// Duty by id.
    #[must_use]
    pub fn duty(&self, id: DutyId) -> &DutyDef {
        &self.duties[id.0]
    }

    /// Oversight by id.
    #[must_use]
    pub fn oversight(&self, id: OversightId) -> &OversightDef {
        &self.oversights[id.0]
    }

    /// Oversights governing a resource.
    #[must_use]
    pub fn governing(&self, key: ResourceKey) -> &[OversightId] {
        self.governing.get(key.0).map_or(&[], Vec::as_slice)
    }

    /// Flow-level escalation table.
    #[must_use]
    pub const fn thread_escalation(&self) -> &EscalationTable {
        &self.thread_escalation
    }

    /// Process-level escalation table.
    #[must_use]
    pub const fn process_escalation(&self) -> &EscalationTable {
        &self.process_escalation
    }
}
