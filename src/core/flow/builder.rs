//! Graph assembly and validation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::administration::{split_brackets, Administration, Duty, DutyDef, DutyId};
use crate::core::error::RuntimeError;
use crate::core::failure::{FailureKinds, KindId};
use crate::core::oversight::{Governance, OversightDef, OversightId};
use crate::core::resource::{ResourceDef, ResourceKey, ResourceSource, ScopeKind};

use super::{EscalationTable, FlowGraph, NodeDef, NodeId, Work};

struct NodeSpec {
    name: String,
    work: Arc<dyn Work>,
    pool: Option<String>,
    requires: Vec<ResourceKey>,
    next: Vec<String>,
    escalation: Vec<(KindId, String)>,
    administration: Vec<Administration>,
    governed_by: Vec<OversightId>,
}

/// Assembles a [`FlowGraph`].
///
/// Definition methods return ids immediately; name references between nodes
/// are resolved and every reference is validated by [`build`](Self::build).
///
/// ```rust,ignore
/// let mut b = FlowGraph::builder();
/// let timeout = b.failure_kind("timeout", None);
/// let db = b.resource("db", ScopeKind::Process, SyncSource::new(|| Ok(Db::open())));
/// b.node("fetch", FnWork::new(|cx| Ok(json!(cx.parameter()))))
///     .requires(db)
///     .next("render")
///     .escalate(timeout, "retry");
/// b.node("render", render).pool("io");
/// b.node("retry", retry);
/// let graph = b.build()?;
/// ```
pub struct FlowGraphBuilder {
    kinds: FailureKinds,
    resources: Vec<ResourceDef>,
    oversights: Vec<OversightDef>,
    duties: Vec<DutyDef>,
    nodes: Vec<NodeSpec>,
    thread_escalation: Vec<(KindId, String)>,
    process_escalation: Vec<(KindId, String)>,
    errors: Vec<String>,
}

impl Default for FlowGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGraphBuilder {
    /// Empty builder holding the built-in failure kinds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kinds: FailureKinds::new(),
            resources: Vec::new(),
            oversights: Vec::new(),
            duties: Vec::new(),
            nodes: Vec::new(),
            thread_escalation: Vec::new(),
            process_escalation: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Define a failure kind; `None` parents it to [`KindId::FAILURE`].
    pub fn failure_kind(&mut self, name: &str, parent: Option<KindId>) -> KindId {
        match self.kinds.define(name, parent) {
            Ok(id) => id,
            Err(e) => {
                self.errors.push(e);
                KindId::FAILURE
            }
        }
    }

    /// Look up a failure kind by name.
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<KindId> {
        self.kinds.lookup(name)
    }

    /// Define a resource bound to `scope`.
    pub fn resource(&mut self, name: &str, scope: ScopeKind, source: impl ResourceSource) -> ResourceKey {
        if self.resources.iter().any(|def| def.name() == name) {
            self.errors.push(format!("resource `{name}` defined twice"));
        }
        let key = ResourceKey(self.resources.len());
        self.resources.push(ResourceDef::new(key, name, scope, source));
        key
    }

    /// Define an oversight governing `governs`.
    pub fn oversight(&mut self, name: &str, governance: impl Governance, governs: &[ResourceKey]) -> OversightId {
        let id = OversightId(self.oversights.len());
        self.oversights.push(OversightDef {
            id,
            name: name.into(),
            governance: Arc::new(governance),
            governs: governs.to_vec(),
        });
        id
    }

    /// Define a duty needing `requires` ready before it runs.
    pub fn duty(&mut self, name: &str, duty: impl Duty, requires: &[ResourceKey]) -> DutyId {
        let id = DutyId(self.duties.len());
        self.duties.push(DutyDef {
            id,
            name: name.into(),
            duty: Arc::new(duty),
            requires: requires.to_vec(),
        });
        id
    }

    /// Define a node and configure it through the returned handle.
    pub fn node(&mut self, name: &str, work: impl Work) -> NodeBuilder<'_> {
        self.nodes.push(NodeSpec {
            name: name.to_string(),
            work: Arc::new(work),
            pool: None,
            requires: Vec::new(),
            next: Vec::new(),
            escalation: Vec::new(),
            administration: Vec::new(),
            governed_by: Vec::new(),
        });
        let last = self.nodes.len() - 1;
        NodeBuilder {
            spec: &mut self.nodes[last],
        }
    }

    /// Flow-level escalation entry, consulted when the failing node has no
    /// matching entry.
    pub fn thread_escalation(&mut self, kind: KindId, handler: &str) -> &mut Self {
        self.thread_escalation.push((kind, handler.to_string()));
        self
    }

    /// Process-level escalation entry, consulted after the flow level.
    pub fn process_escalation(&mut self, kind: KindId, handler: &str) -> &mut Self {
        self.process_escalation.push((kind, handler.to_string()));
        self
    }

    /// Validate and freeze the graph.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidGraph` listing every problem found:
    /// duplicate names, dangling node/resource/duty/oversight references,
    /// unknown failure kinds, and cycles among node escalation edges.
    pub fn build(self) -> Result<FlowGraph, RuntimeError> {
        let mut errors = self.errors;
        if self.nodes.is_empty() {
            errors.push("graph has no nodes".into());
        }

        let mut by_name = HashMap::new();
        for (index, spec) in self.nodes.iter().enumerate() {
            if by_name.insert(spec.name.clone(), NodeId(index)).is_some() {
                errors.push(format!("node `{}` defined twice", spec.name));
            }
        }

        let resource_count = self.resources.len();
        let check_keys = |owner: &str, keys: &[ResourceKey], errors: &mut Vec<String>| {
            for key in keys {
                if key.0 >= resource_count {
                    errors.push(format!("{owner} references unknown resource {key}"));
                }
            }
        };
        for duty in &self.duties {
            check_keys(&format!("duty `{}`", duty.name), &duty.requires, &mut errors);
        }
        for oversight in &self.oversights {
            check_keys(&format!("oversight `{}`", oversight.name), &oversight.governs, &mut errors);
        }

        let kinds = self.kinds;
        let resolve_table = |owner: &str, entries: &[(KindId, String)], errors: &mut Vec<String>| {
            let mut table = EscalationTable::new();
            for (kind, handler) in entries {
                if !kinds.contains(*kind) {
                    errors.push(format!("{owner} escalates unknown failure kind {}", kind.index()));
                }
                match by_name.get(handler) {
                    Some(id) => table.push(*kind, *id),
                    None => errors.push(format!("{owner} escalates to unknown node `{handler}`")),
                }
            }
            table
        };

        let thread_escalation = resolve_table("flow", &self.thread_escalation, &mut errors);
        let process_escalation = resolve_table("process", &self.process_escalation, &mut errors);

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (index, spec) in self.nodes.into_iter().enumerate() {
            let owner = format!("node `{}`", spec.name);
            check_keys(&owner, &spec.requires, &mut errors);

            let mut next = Vec::with_capacity(spec.next.len());
            for successor in &spec.next {
                match by_name.get(successor) {
                    Some(id) => next.push(*id),
                    None => errors.push(format!("{owner} continues to unknown node `{successor}`")),
                }
            }

            for entry in &spec.administration {
                let (Administration::Pre(id) | Administration::Post(id)) = *entry;
                if id.0 >= self.duties.len() {
                    errors.push(format!("{owner} uses unknown duty #{}", id.0));
                }
            }
            for id in &spec.governed_by {
                if id.0 >= self.oversights.len() {
                    errors.push(format!("{owner} is governed by unknown oversight #{}", id.0));
                }
            }

            let escalation = resolve_table(&owner, &spec.escalation, &mut errors);
            let (pre, post) = split_brackets(&spec.administration);
            nodes.push(NodeDef {
                id: NodeId(index),
                name: spec.name.into(),
                work: spec.work,
                pool: spec.pool,
                requires: spec.requires,
                next,
                escalation,
                pre,
                post,
                governed_by: spec.governed_by,
            });
        }

        if let Some(name) = find_escalation_cycle(&nodes) {
            errors.push(format!("escalation cycle through node `{name}`"));
        }

        if !errors.is_empty() {
            return Err(RuntimeError::InvalidGraph(errors.join("; ")));
        }

        let mut governing = vec![Vec::new(); resource_count];
        for oversight in &self.oversights {
            for key in &oversight.governs {
                governing[key.0].push(oversight.id);
            }
        }

        debug!(
            nodes = nodes.len(),
            resources = resource_count,
            duties = self.duties.len(),
            oversights = self.oversights.len(),
            "flow graph built"
        );

        Ok(FlowGraph {
            kinds,
            resources: self.resources.into(),
            oversights: self.oversights.into(),
            duties: self.duties,
            nodes,
            by_name,
            governing,
            thread_escalation,
            process_escalation,
        })
    }
}

/// First node found on a cycle of node-level escalation edges.
fn find_escalation_cycle(nodes: &[NodeDef]) -> Option<Arc<str>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(nodes: &[NodeDef], id: NodeId, marks: &mut [Mark]) -> Option<NodeId> {
        match marks[id.0] {
            Mark::Active => return Some(id),
            Mark::Done => return None,
            Mark::New => {}
        }
        marks[id.0] = Mark::Active;
        for entry in nodes[id.0].escalation.entries() {
            if let Some(hit) = visit(nodes, entry.handler, marks) {
                return Some(hit);
            }
        }
        marks[id.0] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; nodes.len()];
    (0..nodes.len())
        .find_map(|index| visit(nodes, NodeId(index), &mut marks))
        .map(|id| Arc::clone(&nodes[id.0].name))
}

/// Configures one node. Obtained from [`FlowGraphBuilder::node`].
pub struct NodeBuilder<'a> {
    spec: &'a mut NodeSpec,
}

impl NodeBuilder<'_> {
    /// Run the node on the named pool instead of the default one.
    pub fn pool(self, pool: &str) -> Self {
        self.spec.pool = Some(pool.to_string());
        self
    }

    /// Require a resource ready before the body runs.
    pub fn requires(self, key: ResourceKey) -> Self {
        self.spec.requires.push(key);
        self
    }

    /// Add a successor. Several successors fan out in parallel.
    pub fn next(self, node: &str) -> Self {
        self.spec.next.push(node.to_string());
        self
    }

    /// Route failures of `kind` (or a descendant) to `handler`.
    pub fn escalate(self, kind: KindId, handler: &str) -> Self {
        self.spec.escalation.push((kind, handler.to_string()));
        self
    }

    /// Add an administration entry.
    pub fn administer(self, entry: Administration) -> Self {
        self.spec.administration.push(entry);
        self
    }

    /// Run `duty` before the body.
    pub fn pre(self, duty: DutyId) -> Self {
        self.administer(Administration::Pre(duty))
    }

    /// Run `duty` after the body succeeds.
    pub fn post(self, duty: DutyId) -> Self {
        self.administer(Administration::Post(duty))
    }

    /// Bring `oversight` into force when the node starts.
    pub fn governed_by(self, oversight: OversightId) -> Self {
        self.spec.governed_by.push(oversight);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::failure::Failure;
    use crate::core::flow::WorkContext;
    use serde_json::Value;

    struct Noop;

    impl Work for Noop {
        fn execute(&self, _cx: &mut WorkContext<'_>) -> Result<Value, Failure> {
            Ok(Value::Null)
        }
    }

    const fn noop() -> Noop {
        Noop
    }

    #[test]
    fn test_builds_and_resolves_names() {
        let mut b = FlowGraphBuilder::new();
        let io = b.failure_kind("io", None);
        b.node("a", noop()).next("b").escalate(io, "h");
        b.node("b", noop());
        b.node("h", noop());
        b.thread_escalation(KindId::FAILURE, "h");

        let graph = b.build().unwrap();
        let a = graph.node(graph.node_id("a").unwrap());
        assert_eq!(a.next(), &[graph.node_id("b").unwrap()]);
        assert_eq!(a.escalation().entries().len(), 1);
        assert_eq!(graph.thread_escalation().entries().len(), 1);
    }

    #[test]
    fn test_rejects_dangling_references() {
        let mut b = FlowGraphBuilder::new();
        b.node("a", noop()).next("missing").requires(ResourceKey(3));
        let err = b.build().unwrap_err().to_string();
        assert!(err.contains("unknown node `missing`"));
        assert!(err.contains("unknown resource #3"));
    }

    #[test]
    fn test_rejects_escalation_cycles() {
        let mut b = FlowGraphBuilder::new();
        b.node("a", noop()).escalate(KindId::FAILURE, "b");
        b.node("b", noop()).escalate(KindId::FAILURE, "a");
        let err = b.build().unwrap_err().to_string();
        assert!(err.contains("escalation cycle"));
    }

    #[test]
    fn test_successor_loops_are_allowed() {
        let mut b = FlowGraphBuilder::new();
        b.node("a", noop()).next("b");
        b.node("b", noop()).next("a");
        assert!(b.build().is_ok());
    }
}
