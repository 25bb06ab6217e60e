//! Failure values routed through escalation.
//!
//! Failures never unwind through the engine. A unit body, a duty, a resource
//! source or an oversight returns a [`Failure`] value; the engine stamps its
//! [`FailureOrigin`] at the boundary where it was observed and hands it to
//! escalation resolution, which matches on the failure's [`KindId`].
//!
//! Kinds form a single-rooted hierarchy held by [`FailureKinds`]. Handler
//! specificity is the number of parent steps from the actual kind up to the
//! kind a handler was registered for.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a failure kind within a [`FailureKinds`] hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindId(pub(crate) u32);

impl KindId {
    /// Root of every hierarchy. A handler registered for it matches anything.
    pub const FAILURE: Self = Self(0);
    /// Failures raised by the engine itself (unknown resource, unloaded
    /// container, scope violation, abandoned notifier).
    pub const RUNTIME: Self = Self(1);
    /// A unit body panicked on a worker thread.
    pub const PANIC: Self = Self(2);

    /// Raw index of this kind.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Failure-kind hierarchy.
///
/// Parents must exist before their children are defined, so the hierarchy is
/// acyclic by construction.
#[derive(Debug, Clone)]
pub struct FailureKinds {
    names: Vec<String>,
    parents: Vec<Option<KindId>>,
    by_name: HashMap<String, KindId>,
}

impl Default for FailureKinds {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureKinds {
    /// Create a hierarchy holding the built-in `failure`, `runtime` and
    /// `panic` kinds.
    #[must_use]
    pub fn new() -> Self {
        let mut kinds = Self {
            names: Vec::new(),
            parents: Vec::new(),
            by_name: HashMap::new(),
        };
        kinds.push("failure", None);
        kinds.push("runtime", Some(KindId::FAILURE));
        kinds.push("panic", Some(KindId::RUNTIME));
        kinds
    }

    fn push(&mut self, name: &str, parent: Option<KindId>) -> KindId {
        let id = KindId(u32::try_from(self.names.len()).unwrap_or(u32::MAX));
        self.names.push(name.to_string());
        self.parents.push(parent);
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Define a new kind. A `None` parent attaches it to [`KindId::FAILURE`].
    ///
    /// # Errors
    ///
    /// Returns a message if the name is taken or the parent is unknown.
    pub fn define(&mut self, name: &str, parent: Option<KindId>) -> Result<KindId, String> {
        if self.by_name.contains_key(name) {
            return Err(format!("failure kind `{name}` already defined"));
        }
        let parent = parent.unwrap_or(KindId::FAILURE);
        if !self.contains(parent) {
            return Err(format!("failure kind `{name}` has unknown parent {}", parent.0));
        }
        Ok(self.push(name, Some(parent)))
    }

    /// Whether `id` belongs to this hierarchy.
    #[must_use]
    pub fn contains(&self, id: KindId) -> bool {
        (id.0 as usize) < self.names.len()
    }

    /// Look up a kind by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<KindId> {
        self.by_name.get(name).copied()
    }

    /// Name of a kind, `"unknown"` for foreign ids.
    #[must_use]
    pub fn name(&self, id: KindId) -> &str {
        self.names.get(id.0 as usize).map_or("unknown", String::as_str)
    }

    /// Parent of a kind.
    #[must_use]
    pub fn parent(&self, id: KindId) -> Option<KindId> {
        self.parents.get(id.0 as usize).copied().flatten()
    }

    /// Number of parent steps from `actual` up to `ancestor`, or `None` if
    /// `ancestor` is not `actual` or one of its ancestors.
    #[must_use]
    pub fn distance(&self, actual: KindId, ancestor: KindId) -> Option<usize> {
        let mut current = Some(actual);
        let mut steps = 0;
        while let Some(kind) = current {
            if kind == ancestor {
                return Some(steps);
            }
            current = self.parent(kind);
            steps += 1;
        }
        None
    }

    /// Number of kinds defined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false: the built-in kinds are present from construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Where a failure was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "origin")]
pub enum FailureOrigin {
    /// Raised before it crossed an engine boundary.
    Unspecified,
    /// A work unit's body failed.
    Unit {
        /// Node whose body failed.
        node: String,
    },
    /// A resource source reported failure instead of an instance.
    Load {
        /// Resource that failed to load.
        resource: String,
    },
    /// An asynchronous operation on a loaded resource failed.
    Operation {
        /// Resource the operation ran on.
        resource: String,
    },
    /// A pre/post administration duty failed.
    Administration {
        /// Duty that failed.
        duty: String,
        /// Node the duty was bracketing.
        node: String,
    },
    /// An oversight failed to activate or enforce.
    Oversight {
        /// Oversight that failed.
        oversight: String,
    },
}

/// A failure travelling through escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct Failure {
    kind: KindId,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
    origin: FailureOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handled: Option<Box<Failure>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handler: Option<String>,
}

impl Failure {
    /// Create a failure of the given kind.
    pub fn new(kind: KindId, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            origin: FailureOrigin::Unspecified,
            handled: None,
            handler: None,
        }
    }

    /// Shorthand for a [`KindId::RUNTIME`] failure.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(KindId::RUNTIME, message)
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Stamp the origin. Only the first stamp sticks so the innermost
    /// boundary (resource, duty) is preserved when an outer boundary wraps
    /// the same failure again.
    #[must_use]
    pub fn originating(mut self, origin: FailureOrigin) -> Self {
        if self.origin == FailureOrigin::Unspecified {
            self.origin = origin;
        }
        self
    }

    /// Mark this failure as raised by escalation handler `handler` while it
    /// was handling `handled`.
    #[must_use]
    pub fn raised_by_handler(mut self, handler: impl Into<String>, handled: Self) -> Self {
        self.handler = Some(handler.into());
        self.handled = Some(Box::new(handled));
        self
    }

    /// Kind used for handler matching.
    #[must_use]
    pub const fn kind(&self) -> KindId {
        self.kind
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured detail, if any.
    #[must_use]
    pub const fn detail(&self) -> Option<&serde_json::Value> {
        self.detail.as_ref()
    }

    /// Where the failure was observed.
    #[must_use]
    pub const fn origin(&self) -> &FailureOrigin {
        &self.origin
    }

    /// The failure a handler was resolving when it raised this one.
    #[must_use]
    pub fn handled(&self) -> Option<&Self> {
        self.handled.as_deref()
    }

    /// Name of the handler that raised this failure.
    #[must_use]
    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    /// Whether this is an escalation-handler failure.
    #[must_use]
    pub const fn is_handler_failure(&self) -> bool {
        self.handled.is_some()
    }

    /// JSON form passed to handler nodes as their parameter.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "unspecified"),
            Self::Unit { node } => write!(f, "unit `{node}`"),
            Self::Load { resource } => write!(f, "load of `{resource}`"),
            Self::Operation { resource } => write!(f, "operation on `{resource}`"),
            Self::Administration { duty, node } => write!(f, "duty `{duty}` around `{node}`"),
            Self::Oversight { oversight } => write!(f, "oversight `{oversight}`"),
        }
    }
}
