//! Administration duties run as ordered brackets around a node body.
//!
//! A node lists [`Administration`] entries; at graph build they are split
//! into the pre and post lists the job walks in order. Pre duties all run
//! before the body, post duties after it succeeds. A duty that needs a
//! resource which is not ready suspends the whole bracket at that duty.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::core::failure::Failure;
use crate::core::oversight::{OversightId, OversightManager};
use crate::core::resource::{Facet, ResourceContainer, ResourceKey};

/// Identifier of a duty within a flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DutyId(pub(crate) usize);

/// Where a duty runs relative to the node body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Administration {
    /// Before the body.
    Pre(DutyId),
    /// After the body completed successfully.
    Post(DutyId),
}

/// Administrative action.
pub trait Duty: Send + Sync + 'static {
    /// Run the duty.
    ///
    /// # Errors
    ///
    /// A failure is escalated exactly like a failing node body.
    fn execute(&self, cx: &mut DutyContext<'_>) -> Result<(), Failure>;
}

/// Adapter running a closure as a [`Duty`].
pub struct FnDuty<F>(F);

impl<F> FnDuty<F>
where
    F: Fn(&mut DutyContext<'_>) -> Result<(), Failure> + Send + Sync + 'static,
{
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Duty for FnDuty<F>
where
    F: Fn(&mut DutyContext<'_>) -> Result<(), Failure> + Send + Sync + 'static,
{
    fn execute(&self, cx: &mut DutyContext<'_>) -> Result<(), Failure> {
        (self.0)(cx)
    }
}

/// Definition of one duty in a flow graph.
#[derive(Clone)]
pub struct DutyDef {
    pub(crate) id: DutyId,
    pub(crate) name: Arc<str>,
    pub(crate) duty: Arc<dyn Duty>,
    pub(crate) requires: Vec<ResourceKey>,
}

impl DutyDef {
    /// Duty name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resources the duty needs ready before it runs.
    #[must_use]
    pub fn requires(&self) -> &[ResourceKey] {
        &self.requires
    }
}

impl fmt::Debug for DutyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DutyDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

/// Per-invocation state of the duties bracketing one node execution.
pub(crate) type DutyState = HashMap<DutyId, Box<dyn Any + Send>>;

/// What a running duty can see and do.
pub struct DutyContext<'a> {
    pub(crate) duty: &'a DutyDef,
    pub(crate) node: &'a str,
    pub(crate) parameter: &'a Value,
    pub(crate) output: Option<&'a Value>,
    pub(crate) resources: &'a HashMap<ResourceKey, Arc<ResourceContainer>>,
    pub(crate) oversight: &'a Mutex<OversightManager>,
    pub(crate) state: &'a mut DutyState,
}

impl DutyContext<'_> {
    /// Name of the running duty.
    #[must_use]
    pub fn duty_name(&self) -> &str {
        &self.duty.name
    }

    /// Name of the node being bracketed.
    #[must_use]
    pub const fn node_name(&self) -> &str {
        self.node
    }

    /// Parameter the node was invoked with.
    #[must_use]
    pub const fn parameter(&self) -> &Value {
        self.parameter
    }

    /// Output of the body; only set for post duties.
    #[must_use]
    pub const fn output(&self) -> Option<&Value> {
        self.output
    }

    /// Facet of a ready resource this node or duty requires.
    #[must_use]
    pub fn facet(&self, key: ResourceKey) -> Option<Facet> {
        self.resources.get(&key).and_then(|c| c.facet())
    }

    /// Facet downcast to `T`.
    #[must_use]
    pub fn facet_as<T: Any + Send + Sync>(&self, key: ResourceKey) -> Option<Arc<T>> {
        self.facet(key).and_then(|facet| facet.downcast::<T>().ok())
    }

    /// Explicitly activate a required resource under an oversight, whether or
    /// not the node brought it into force. Returns whether the facet newly
    /// joined the activation set.
    ///
    /// # Errors
    ///
    /// Fails if the resource is not required here or activation fails.
    pub fn activate(&mut self, oversight: OversightId, key: ResourceKey) -> Result<bool, Failure> {
        let container = self.resources.get(&key).ok_or_else(|| {
            Failure::runtime(format!(
                "duty `{}` did not declare resource {key}",
                self.duty.name
            ))
        })?;
        self.oversight.lock().activate(oversight, container)
    }

    /// State shared by this duty's pre and post runs around one node
    /// execution, created with `T::default()` on first access.
    ///
    /// # Errors
    ///
    /// Fails if an earlier run stored a value of a different type.
    pub fn state<T: Default + Send + 'static>(&mut self) -> Result<&mut T, Failure> {
        let name = &self.duty.name;
        self.state
            .entry(self.duty.id)
            .or_insert_with(|| Box::new(T::default()))
            .downcast_mut::<T>()
            .ok_or_else(|| Failure::runtime(format!("duty `{name}` state holds a different type")))
    }
}

/// Split declared administration entries into ordered pre and post lists.
#[must_use]
pub fn split_brackets(entries: &[Administration]) -> (Vec<DutyId>, Vec<DutyId>) {
    let mut pre = Vec::new();
    let mut post = Vec::new();
    for entry in entries {
        match *entry {
            Administration::Pre(id) => pre.push(id),
            Administration::Post(id) => post.push(id),
        }
    }
    (pre, post)
}
