//! Per-scope lifecycle container of one bound resource.
//!
//! ```text
//!            load()              loaded()
//! Unloaded ─────────► Loading ─────────────► Loaded ◄──────────┐
//!                        │                     │ begin_op       │
//!                        │ failed()            ▼                │
//!                        ▼                   Busy ──complete──► Ready
//!                      Failed                                   │
//!                                   unload() from any idle state▼
//!                                                             Final
//! ```
//!
//! All transitions happen under the container's own lock. Units never block
//! on a container: a unit that finds it `Loading` or `Busy` registers its
//! [`Activation`] in the waiter list and suspends. Completion moves every
//! waiter back to its pool in no particular order.
//!
//! Only teardown blocks: [`ResourceContainer::unload`] waits on a condition
//! variable for an in-flight load or operation to finish before releasing.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::failure::{Failure, FailureOrigin};
use crate::core::unit::Activation;

use super::registry::ResourceResolver;
use super::source::{Facet, Instance, ResourceDef, ResourceKey, ResourceSource, ScopeKind};

/// Observable lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Never requested.
    Unloaded,
    /// The source is constructing the instance.
    Loading,
    /// Instance available, no operation has run yet.
    Loaded,
    /// An asynchronous operation on the instance is in flight.
    Busy,
    /// Instance available after an operation completed.
    Ready,
    /// The source reported a load failure.
    Failed,
    /// Released at teardown. Terminal.
    Final,
}

enum State {
    Unloaded,
    Loading,
    Loaded,
    Busy,
    Ready,
    Failed(Failure),
    Final,
}

impl State {
    const fn observe(&self) -> ResourceState {
        match self {
            Self::Unloaded => ResourceState::Unloaded,
            Self::Loading => ResourceState::Loading,
            Self::Loaded => ResourceState::Loaded,
            Self::Busy => ResourceState::Busy,
            Self::Ready => ResourceState::Ready,
            Self::Failed(_) => ResourceState::Failed,
            Self::Final => ResourceState::Final,
        }
    }

    const fn is_available(&self) -> bool {
        matches!(self, Self::Loaded | Self::Ready)
    }

    const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Loading | Self::Busy)
    }
}

struct Inner {
    state: State,
    instance: Option<Instance>,
    facet: Option<Facet>,
    waiters: Vec<Activation>,
    dependencies: Option<Vec<Arc<ResourceContainer>>>,
    load_transitions: u32,
    release_requested: bool,
}

impl Inner {
    fn take_waiters(&mut self) -> Vec<Activation> {
        std::mem::take(&mut self.waiters)
    }

    /// Move to `Final` and hand back what must be released outside the lock.
    fn finalize(&mut self) -> (Option<Instance>, Vec<Activation>) {
        self.state = State::Final;
        self.release_requested = false;
        self.facet = None;
        self.dependencies = None;
        (self.instance.take(), self.take_waiters())
    }
}

/// Lifecycle container of one resource within one scope instance.
pub struct ResourceContainer {
    id: Uuid,
    key: ResourceKey,
    name: Arc<str>,
    scope: ScopeKind,
    source: Arc<dyn ResourceSource>,
    inner: Mutex<Inner>,
    idle: Condvar,
}

impl fmt::Debug for ResourceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContainer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ResourceContainer {
    /// Create an `Unloaded` container for `def`.
    #[must_use]
    pub fn new(def: &ResourceDef) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            key: def.key,
            name: Arc::clone(&def.name),
            scope: def.scope,
            source: Arc::clone(&def.source),
            inner: Mutex::new(Inner {
                state: State::Unloaded,
                instance: None,
                facet: None,
                waiters: Vec::new(),
                dependencies: None,
                load_transitions: 0,
                release_requested: false,
            }),
            idle: Condvar::new(),
        })
    }

    /// Unique id of this container instance.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Key of the resource.
    #[must_use]
    pub const fn key(&self) -> ResourceKey {
        self.key
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope the container belongs to.
    #[must_use]
    pub const fn scope(&self) -> ScopeKind {
        self.scope
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ResourceState {
        self.inner.lock().state.observe()
    }

    /// Number of `Unloaded → Loading` transitions. Never exceeds one.
    #[must_use]
    pub fn load_transitions(&self) -> u32 {
        self.inner.lock().load_transitions
    }

    /// Number of units currently waiting on the container.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Request the instance.
    ///
    /// Returns `Ok(true)` once loaded. Otherwise registers `waiter`, starts
    /// the load if this is the first request, and returns `Ok(false)`; the
    /// caller must suspend. A source that reports inside `start_load` gets
    /// its answer on the same call and `waiter` is left unregistered.
    ///
    /// # Errors
    ///
    /// Returns the load failure if the source failed, or a runtime failure if
    /// the container was already unloaded.
    pub fn load(self: &Arc<Self>, waiter: &Activation) -> Result<bool, Failure> {
        let mut inner = self.inner.lock();
        match &inner.state {
            State::Loaded | State::Busy | State::Ready => return Ok(true),
            State::Loading => {
                inner.waiters.push(waiter.register());
                return Ok(false);
            }
            State::Failed(failure) => return Err(failure.clone()),
            State::Final => return Err(self.unloaded_failure()),
            State::Unloaded => {}
        }

        inner.state = State::Loading;
        inner.load_transitions += 1;
        inner.waiters.push(waiter.register());
        drop(inner);

        debug!(resource = %self.name, container = %self.id, "loading resource");
        self.source.start_load(LoadNotifier {
            container: Some(Arc::clone(self)),
        });

        // Sources may report before `start_load` returns.
        let mut inner = self.inner.lock();
        let settled = match &inner.state {
            State::Loading => return Ok(false),
            State::Loaded | State::Busy | State::Ready => Ok(true),
            State::Failed(failure) => Err(failure.clone()),
            State::Final => Err(self.unloaded_failure()),
            State::Unloaded => return Ok(false),
        };
        inner.waiters.retain(|w| !w.same_as(waiter));
        drop(inner);
        waiter.withdraw();
        settled
    }

    fn complete_load(&self, result: Result<Instance, Failure>) {
        // User code runs before the lock is taken.
        let facet = result.as_ref().ok().and_then(|instance| self.source.facet(instance));

        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Loading) {
            drop(inner);
            warn!(resource = %self.name, "load reported for a container that is not loading");
            if let Ok(instance) = result {
                self.source.release(instance);
            }
            return;
        }

        match result {
            Ok(instance) => {
                debug!(resource = %self.name, container = %self.id, "resource loaded");
                inner.state = State::Loaded;
                inner.instance = Some(instance);
                inner.facet = facet;
            }
            Err(failure) => {
                warn!(resource = %self.name, error = %failure, "resource failed to load");
                inner.state = State::Failed(failure.originating(FailureOrigin::Load {
                    resource: self.name.to_string(),
                }));
            }
        }
        let waiters = inner.take_waiters();
        let released = if inner.release_requested {
            inner.finalize().0
        } else {
            None
        };
        self.idle.notify_all();
        drop(inner);

        for waiter in waiters {
            waiter.activate();
        }
        if let Some(instance) = released {
            self.source.release(instance);
        }
    }

    /// Resolve the resources the loaded instance depends on. Resolution runs
    /// once per container; later calls return the cached result.
    ///
    /// # Errors
    ///
    /// Fails if the container is not loaded, a dependency key is unknown, or a
    /// dependency lives in a narrower scope than this container.
    pub fn coordinate(&self, resolver: &dyn ResourceResolver) -> Result<Vec<Arc<Self>>, Failure> {
        let instance = {
            let inner = self.inner.lock();
            if let Some(deps) = &inner.dependencies {
                return Ok(deps.clone());
            }
            match (&inner.state, &inner.instance) {
                (State::Loaded | State::Busy | State::Ready, Some(instance)) => Arc::clone(instance),
                _ => {
                    return Err(Failure::runtime(format!(
                        "resource `{}` must be loaded before coordination",
                        self.name
                    )))
                }
            }
        };

        let mut deps = Vec::new();
        for key in self.source.dependencies(&instance) {
            let dep = resolver.resolve(key)?;
            if dep.scope < self.scope {
                return Err(Failure::runtime(format!(
                    "{:?}-scoped resource `{}` cannot depend on {:?}-scoped `{}`",
                    self.scope, self.name, dep.scope, dep.name
                )));
            }
            deps.push(dep);
        }

        let mut inner = self.inner.lock();
        Ok(inner.dependencies.get_or_insert(deps).clone())
    }

    /// Dependencies resolved by [`coordinate`](Self::coordinate), if any.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Arc<Self>> {
        self.inner.lock().dependencies.clone().unwrap_or_default()
    }

    /// Whether the instance may be used now. A `Busy` or `Loading` container
    /// registers `waiter` and returns false. Call [`load`](Self::load) first:
    /// other states return false without registering.
    #[must_use]
    pub fn is_ready(&self, waiter: &Activation) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_available() {
            return true;
        }
        if inner.state.is_in_flight() {
            inner.waiters.push(waiter.register());
        }
        false
    }

    /// The instance, only while `Loaded` or `Ready`.
    #[must_use]
    pub fn instance(&self) -> Option<Instance> {
        let inner = self.inner.lock();
        if inner.state.is_available() {
            inner.instance.clone()
        } else {
            None
        }
    }

    /// The instance downcast to `T`, only while `Loaded` or `Ready`.
    #[must_use]
    pub fn instance_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance().and_then(|instance| instance.downcast::<T>().ok())
    }

    /// The extension facet, only while `Loaded` or `Ready`.
    #[must_use]
    pub fn facet(&self) -> Option<Facet> {
        let inner = self.inner.lock();
        if inner.state.is_available() {
            inner.facet.clone()
        } else {
            None
        }
    }

    /// Mark the container `Busy` for an asynchronous operation. The returned
    /// notifier flips it back to `Ready`.
    ///
    /// # Errors
    ///
    /// Fails unless the container is `Loaded` or `Ready`.
    pub fn begin_operation(self: &Arc<Self>) -> Result<OperationNotifier, Failure> {
        self.begin(None)
    }

    /// Begin an operation and hand its notifier to `start`.
    ///
    /// # Errors
    ///
    /// Fails unless the container is `Loaded` or `Ready`.
    pub fn start_operation<F>(self: &Arc<Self>, start: F) -> Result<(), Failure>
    where
        F: FnOnce(OperationNotifier),
    {
        start(self.begin(None)?);
        Ok(())
    }

    pub(crate) fn start_operation_with<F>(self: &Arc<Self>, on_done: OperationDone, start: F) -> Result<(), Failure>
    where
        F: FnOnce(OperationNotifier),
    {
        start(self.begin(Some(on_done))?);
        Ok(())
    }

    fn begin(self: &Arc<Self>, on_done: Option<OperationDone>) -> Result<OperationNotifier, Failure> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Loaded | State::Ready => {
                inner.state = State::Busy;
                debug!(resource = %self.name, container = %self.id, "operation started");
                Ok(OperationNotifier {
                    container: Some(Arc::clone(self)),
                    on_done,
                })
            }
            State::Busy => Err(Failure::runtime(format!(
                "resource `{}` already has an operation in flight",
                self.name
            ))),
            _ => Err(Failure::runtime(format!(
                "resource `{}` is not loaded ({:?})",
                self.name,
                inner.state.observe()
            ))),
        }
    }

    fn finish_operation(&self, failure: Option<Failure>, on_done: Option<OperationDone>) {
        let failure = failure.map(|f| {
            f.originating(FailureOrigin::Operation {
                resource: self.name.to_string(),
            })
        });

        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Busy) {
            inner.state = State::Ready;
        } else {
            warn!(resource = %self.name, "operation completion reported for an idle container");
        }
        debug!(resource = %self.name, container = %self.id, failed = failure.is_some(), "operation finished");
        let waiters = inner.take_waiters();
        let released = if inner.release_requested {
            inner.finalize().0
        } else {
            None
        };
        self.idle.notify_all();
        drop(inner);

        for waiter in waiters {
            waiter.activate();
        }
        if let Some(instance) = released {
            self.source.release(instance);
        }
        if let Some(on_done) = on_done {
            on_done(failure);
        } else if let Some(failure) = failure {
            warn!(resource = %self.name, error = %failure, "unobserved operation failure");
        }
    }

    /// Release the instance. Blocks while a load or operation is in flight.
    /// A second call is a no-op.
    pub fn unload(&self) {
        let mut inner = self.inner.lock();
        while inner.state.is_in_flight() {
            debug!(resource = %self.name, "unload waiting for in-flight work");
            self.idle.wait(&mut inner);
        }
        if matches!(inner.state, State::Final) {
            return;
        }
        let (instance, waiters) = inner.finalize();
        drop(inner);
        self.released(instance, waiters);
    }

    /// Release the instance now if idle, otherwise as soon as the in-flight
    /// load or operation completes. Never blocks. Returns whether the
    /// container reached `Final` during this call.
    pub fn release_when_idle(&self) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Final) {
            return false;
        }
        if inner.state.is_in_flight() {
            inner.release_requested = true;
            return false;
        }
        let (instance, waiters) = inner.finalize();
        drop(inner);
        self.released(instance, waiters);
        true
    }

    fn released(&self, instance: Option<Instance>, waiters: Vec<Activation>) {
        debug!(resource = %self.name, container = %self.id, "resource unloaded");
        // Waiters observe the unloaded failure on their next load.
        for waiter in waiters {
            waiter.activate();
        }
        if let Some(instance) = instance {
            self.source.release(instance);
        }
    }

    fn unloaded_failure(&self) -> Failure {
        Failure::runtime(format!("resource `{}` has been unloaded", self.name))
    }
}

/// Callback told how a runtime-tracked operation ended.
pub(crate) type OperationDone = Box<dyn FnOnce(Option<Failure>) + Send>;

/// One-shot handle a [`ResourceSource`] uses to report a load.
///
/// Dropping it without reporting fails the load.
pub struct LoadNotifier {
    container: Option<Arc<ResourceContainer>>,
}

impl LoadNotifier {
    /// Report the constructed instance.
    pub fn loaded(mut self, instance: Instance) {
        if let Some(container) = self.container.take() {
            container.complete_load(Ok(instance));
        }
    }

    /// Report that construction failed.
    pub fn failed(mut self, failure: Failure) {
        if let Some(container) = self.container.take() {
            container.complete_load(Err(failure));
        }
    }

    /// Name of the resource being loaded.
    #[must_use]
    pub fn resource(&self) -> &str {
        self.container.as_ref().map_or("", |c| c.name())
    }
}

impl Drop for LoadNotifier {
    fn drop(&mut self) {
        if let Some(container) = self.container.take() {
            let message = format!("source of `{}` dropped its load notifier", container.name);
            container.complete_load(Err(Failure::runtime(message)));
        }
    }
}

/// One-shot handle reporting the end of an operation on a `Busy` container.
///
/// Dropping it without reporting fails the operation.
pub struct OperationNotifier {
    container: Option<Arc<ResourceContainer>>,
    on_done: Option<OperationDone>,
}

impl OperationNotifier {
    /// The operation succeeded.
    pub fn complete(mut self) {
        if let Some(container) = self.container.take() {
            container.finish_operation(None, self.on_done.take());
        }
    }

    /// The operation failed.
    pub fn fail(mut self, failure: Failure) {
        if let Some(container) = self.container.take() {
            container.finish_operation(Some(failure), self.on_done.take());
        }
    }
}

impl Drop for OperationNotifier {
    fn drop(&mut self) {
        if let Some(container) = self.container.take() {
            let message = format!("operation notifier for `{}` dropped", container.name);
            container.finish_operation(Some(Failure::runtime(message)), self.on_done.take());
        }
    }
}
