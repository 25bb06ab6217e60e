//! Resource definitions and the boundary contract to resource sources.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::failure::Failure;

use super::container::LoadNotifier;

/// A loaded resource instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Extension facet of a resource, handed to oversight and duties.
pub type Facet = Arc<dyn Any + Send + Sync>;

/// Positional key of a resource within a flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(pub(crate) usize);

impl ResourceKey {
    /// Key for the resource at `index` in a definition table.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw index of the key.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifetime a resource is bound to. Ordered innermost first, so a resource
/// may only depend on resources of the same or a greater scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// One node execution.
    Invocation,
    /// One flow (the entry node and everything it continues into).
    Thread,
    /// The process scope opened through the control surface.
    Process,
}

/// Source that constructs and releases instances of one resource.
///
/// `start_load` may complete synchronously or hand the notifier to another
/// thread; the container never blocks waiting for it.
pub trait ResourceSource: Send + Sync + 'static {
    /// Begin constructing an instance; report through `notifier`.
    fn start_load(&self, notifier: LoadNotifier);

    /// Resources the loaded instance depends on.
    fn dependencies(&self, _instance: &Instance) -> Vec<ResourceKey> {
        Vec::new()
    }

    /// Extension facet exposed to oversight and duties.
    fn facet(&self, instance: &Instance) -> Option<Facet> {
        Some(Arc::clone(instance))
    }

    /// Release the instance at unload. Called exactly once.
    fn release(&self, _instance: Instance) {}
}

/// Source that builds its instance synchronously on the loading thread.
pub struct SyncSource<F> {
    build: F,
}

impl<F, T> SyncSource<F>
where
    F: Fn() -> Result<T, Failure> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    /// Wrap a constructor closure.
    pub const fn new(build: F) -> Self {
        Self { build }
    }
}

impl<F, T> ResourceSource for SyncSource<F>
where
    F: Fn() -> Result<T, Failure> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    fn start_load(&self, notifier: LoadNotifier) {
        match (self.build)() {
            Ok(value) => notifier.loaded(Arc::new(value)),
            Err(failure) => notifier.failed(failure),
        }
    }
}

/// Definition of one resource in a flow graph.
#[derive(Clone)]
pub struct ResourceDef {
    pub(crate) key: ResourceKey,
    pub(crate) name: Arc<str>,
    pub(crate) scope: ScopeKind,
    pub(crate) source: Arc<dyn ResourceSource>,
}

impl ResourceDef {
    /// Define a resource. Definition tables are positional: the definition
    /// for `key` must sit at `key.index()`.
    pub fn new(
        key: ResourceKey,
        name: impl Into<Arc<str>>,
        scope: ScopeKind,
        source: impl ResourceSource,
    ) -> Self {
        Self {
            key,
            name: name.into(),
            scope,
            source: Arc::new(source),
        }
    }

    /// Key of the resource.
    #[must_use]
    pub const fn key(&self) -> ResourceKey {
        self.key
    }

    /// Name of the resource.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope the resource is bound to.
    #[must_use]
    pub const fn scope(&self) -> ScopeKind {
        self.scope
    }
}

impl fmt::Debug for ResourceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDef")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
