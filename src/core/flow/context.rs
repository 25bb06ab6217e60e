//! What a running node body can see and do.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::core::engine::RuntimeInner;
use crate::core::failure::Failure;
use crate::core::resource::{OperationDone, OperationNotifier, ResourceContainer, ResourceKey};
use crate::core::scope::ThreadScope;
use crate::core::unit::Affinity;

use super::{NodeDef, NodeId};

/// Execution context of one node body.
pub struct WorkContext<'a> {
    pub(crate) engine: &'a Arc<RuntimeInner>,
    pub(crate) thread: &'a Arc<ThreadScope>,
    pub(crate) node: &'a NodeDef,
    pub(crate) parameter: &'a Value,
    pub(crate) failure: Option<&'a Failure>,
    pub(crate) resources: &'a HashMap<ResourceKey, Arc<ResourceContainer>>,
    pub(crate) failed_resources: &'a HashMap<ResourceKey, Arc<ResourceContainer>>,
    pub(crate) chain: &'a [NodeId],
    pub(crate) affinity: Option<&'a Affinity>,
    pub(crate) branches: Vec<(NodeId, Value)>,
}

impl WorkContext<'_> {
    /// Name of the running node.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node.name
    }

    /// Id of the flow the node runs in.
    #[must_use]
    pub fn flow_id(&self) -> Uuid {
        self.thread.id()
    }

    /// Id of the enclosing process scope.
    #[must_use]
    pub fn process_id(&self) -> Uuid {
        self.thread.process().id()
    }

    /// Parameter the node was scheduled with. For a handler this is the
    /// failure in JSON form.
    #[must_use]
    pub const fn parameter(&self) -> &Value {
        self.parameter
    }

    /// The failure being handled, when the node runs as an escalation
    /// handler.
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        self.failure
    }

    /// Affinity tag of the running unit, if its pool assigned one.
    #[must_use]
    pub const fn affinity(&self) -> Option<&Affinity> {
        self.affinity
    }

    /// Container of a resource the node requires.
    #[must_use]
    pub fn resource(&self, key: ResourceKey) -> Option<Arc<ResourceContainer>> {
        self.resources.get(&key).cloned()
    }

    /// Container the failed node held for `key`, when this node runs as an
    /// escalation handler. Invocation-scoped containers of the failed node
    /// stay loaded until the flow ends, so a handler can inspect or clean
    /// them up here.
    #[must_use]
    pub fn failed_resource(&self, key: ResourceKey) -> Option<Arc<ResourceContainer>> {
        self.failed_resources.get(&key).cloned()
    }

    /// Instance of a required resource, downcast to `T`.
    #[must_use]
    pub fn instance<T: Any + Send + Sync>(&self, key: ResourceKey) -> Option<Arc<T>> {
        self.resources.get(&key).and_then(|c| c.instance_as::<T>())
    }

    /// Start an asynchronous operation on a required resource. The resource
    /// is `Busy` until the notifier reports; the flow stays open until then,
    /// and a reported failure is escalated from this node. A pending
    /// operation does not hold up the process scope's close beyond its own
    /// container.
    ///
    /// # Errors
    ///
    /// Fails if the resource is not required by the node or is not idle.
    pub fn start_operation<F>(&mut self, key: ResourceKey, start: F) -> Result<(), Failure>
    where
        F: FnOnce(OperationNotifier),
    {
        let container = self.resources.get(&key).cloned().ok_or_else(|| {
            Failure::runtime(format!("node `{}` did not declare resource {key}", self.node.name))
        })?;

        let engine = Arc::clone(self.engine);
        let thread = Arc::clone(self.thread);
        let node = self.node.id;
        let affinity = self.affinity.cloned();
        let chain = self.chain.to_vec();
        let held = self.resources.clone();
        let on_done: OperationDone = Box::new(move |failure| {
            if let Some(failure) = failure {
                engine.escalate(&thread, failure, Some(node), chain, affinity, held);
            }
            thread.exit_operation(&engine);
        });

        self.thread.enter_operation();
        container.start_operation_with(on_done, start).inspect_err(|_| {
            self.thread.exit_operation(self.engine);
        })
    }

    /// Schedule another node in this flow once the body completes, as a
    /// parallel branch alongside the declared successors.
    ///
    /// # Errors
    ///
    /// Fails if no node has that name.
    pub fn invoke(&mut self, node: &str, parameter: Value) -> Result<(), Failure> {
        let id = self
            .engine
            .graph
            .node_id(node)
            .ok_or_else(|| Failure::runtime(format!("unknown node `{node}`")))?;
        self.branches.push((id, parameter));
        Ok(())
    }
}
