//! Scope-local registries mapping resource keys to containers.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::debug;
use uuid::Uuid;

use crate::core::failure::Failure;

use super::container::{ResourceContainer, ResourceState};
use super::source::{ResourceDef, ResourceKey, ScopeKind};

/// Resolves a dependency key to the container of the scope it is bound to.
pub trait ResourceResolver {
    /// Container for `key`, created on first reference.
    ///
    /// # Errors
    ///
    /// Fails for unknown keys or keys whose scope is not reachable.
    fn resolve(&self, key: ResourceKey) -> Result<Arc<ResourceContainer>, Failure>;
}

/// Containers of one scope instance, indexed positionally by key.
pub struct ResourceRegistry {
    scope: ScopeKind,
    defs: Arc<[ResourceDef]>,
    slots: Box<[OnceLock<Arc<ResourceContainer>>]>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("scope", &self.scope)
            .field("created", &self.containers().len())
            .finish_non_exhaustive()
    }
}

impl ResourceRegistry {
    /// Empty registry over a positional definition table.
    #[must_use]
    pub fn new(scope: ScopeKind, defs: Arc<[ResourceDef]>) -> Self {
        let slots = defs.iter().map(|_| OnceLock::new()).collect();
        Self { scope, defs, slots }
    }

    /// Scope of this registry.
    #[must_use]
    pub const fn scope(&self) -> ScopeKind {
        self.scope
    }

    /// Definition for `key`.
    ///
    /// # Errors
    ///
    /// Fails if no definition sits at the key's position.
    pub fn def(&self, key: ResourceKey) -> Result<&ResourceDef, Failure> {
        self.defs
            .get(key.0)
            .filter(|def| def.key == key)
            .ok_or_else(|| Failure::runtime(format!("unknown resource {key}")))
    }

    /// Container for `key`, creating it on first reference.
    ///
    /// # Errors
    ///
    /// Fails if the key is unknown or bound to another scope.
    pub fn get_or_create(&self, key: ResourceKey) -> Result<Arc<ResourceContainer>, Failure> {
        let def = self.def(key)?;
        if def.scope != self.scope {
            return Err(Failure::runtime(format!(
                "resource `{}` is {:?}-scoped, not {:?}-scoped",
                def.name, def.scope, self.scope
            )));
        }
        Ok(Arc::clone(self.slots[key.0].get_or_init(|| {
            debug!(resource = %def.name, scope = ?self.scope, "creating container");
            ResourceContainer::new(def)
        })))
    }

    /// Container for `key` if one was created.
    #[must_use]
    pub fn get(&self, key: ResourceKey) -> Option<Arc<ResourceContainer>> {
        self.slots.get(key.0).and_then(OnceLock::get).cloned()
    }

    /// Containers created so far, in key order.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<ResourceContainer>> {
        self.slots.iter().filter_map(OnceLock::get).cloned().collect()
    }

    /// Containers ordered dependents first, so no resource is released
    /// before a resource that depends on it.
    fn teardown_order(&self) -> Vec<Arc<ResourceContainer>> {
        fn visit(
            container: &Arc<ResourceContainer>,
            own: &HashSet<Uuid>,
            seen: &mut HashSet<Uuid>,
            post: &mut Vec<Arc<ResourceContainer>>,
        ) {
            if !seen.insert(container.id()) {
                return;
            }
            for dep in container.dependencies() {
                if own.contains(&dep.id()) {
                    visit(&dep, own, seen, post);
                }
            }
            post.push(Arc::clone(container));
        }

        let containers = self.containers();
        let own: HashSet<Uuid> = containers.iter().map(|c| c.id()).collect();
        let mut seen = HashSet::new();
        let mut post = Vec::with_capacity(containers.len());
        for container in &containers {
            visit(container, &own, &mut seen, &mut post);
        }
        post.reverse();
        post
    }

    /// Unload every container, dependents first. Blocks on containers with a
    /// load or operation in flight; those (and anything they depend on) are
    /// unloaded after all idle siblings. Returns the number of containers
    /// unloaded.
    pub fn unload_all(&self) -> usize {
        let (unloaded, deferred) = self.unload_idle();
        let count = unloaded + deferred.len();
        for container in deferred {
            container.unload();
        }
        count
    }

    /// Unload, dependents first, every container that is idle and that no
    /// in-flight container depends on. Never blocks. Returns how many were
    /// unloaded and the containers left for a later [`ResourceContainer::unload`],
    /// still in teardown order.
    pub fn unload_idle(&self) -> (usize, Vec<Arc<ResourceContainer>>) {
        let mut idle = Vec::new();
        let mut deferred: Vec<Arc<ResourceContainer>> = Vec::new();

        for container in self.teardown_order() {
            if container.state() == ResourceState::Final {
                continue;
            }
            let busy = matches!(container.state(), ResourceState::Loading | ResourceState::Busy);
            let has_deferred_dependent = deferred
                .iter()
                .any(|d| d.dependencies().iter().any(|dep| dep.id() == container.id()));
            if busy || has_deferred_dependent {
                deferred.push(container);
            } else {
                idle.push(container);
            }
        }

        debug!(
            scope = ?self.scope,
            idle = idle.len(),
            deferred = deferred.len(),
            "unloading idle containers"
        );
        let mut unloaded = 0;
        for container in idle {
            // Raced into an operation since the state check; leave it to the caller.
            if container.release_when_idle() {
                unloaded += 1;
            } else if container.state() != ResourceState::Final {
                deferred.push(container);
            }
        }
        (unloaded, deferred)
    }

    /// Release every container without blocking; in-flight ones release
    /// themselves when their work completes.
    pub fn release_all_when_idle(&self) {
        for container in self.teardown_order() {
            container.release_when_idle();
        }
    }
}

/// Resolution through the nested scopes visible to one node execution.
pub struct ScopeChain<'a> {
    /// Invocation registry, absent outside a node execution.
    pub invocation: Option<&'a ResourceRegistry>,
    /// Thread (flow) registry, absent outside a flow.
    pub thread: Option<&'a ResourceRegistry>,
    /// Process registry.
    pub process: &'a ResourceRegistry,
}

impl ResourceResolver for ScopeChain<'_> {
    fn resolve(&self, key: ResourceKey) -> Result<Arc<ResourceContainer>, Failure> {
        let def = self.process.def(key)?;
        let registry = match def.scope {
            ScopeKind::Process => Some(self.process),
            ScopeKind::Thread => self.thread,
            ScopeKind::Invocation => self.invocation,
        };
        registry
            .ok_or_else(|| {
                Failure::runtime(format!(
                    "{:?}-scoped resource `{}` is not reachable from here",
                    def.scope, def.name
                ))
            })?
            .get_or_create(key)
    }
}

impl ResourceResolver for ResourceRegistry {
    fn resolve(&self, key: ResourceKey) -> Result<Arc<ResourceContainer>, Failure> {
        self.get_or_create(key)
    }
}
