//! Schedulable units and the activation handles that resume them.
//!
//! A [`Unit`] is what a [`WorkerPool`] executes. Running a unit yields a
//! [`JobStatus`]; a unit that cannot proceed registers its [`Activation`]
//! with whatever it is waiting on and returns [`JobStatus::Suspended`], which
//! frees the worker thread immediately.
//!
//! # Activation protocol
//!
//! ```text
//!           activate()                 park()
//! Running ─────────────► Woken ─────────────────► re-queued
//!    │
//!    │ park()
//!    ▼           activate()
//! Parked(unit) ─────────────► re-queued
//! ```
//!
//! The `Woken` state covers the race where the resource completes while the
//! unit is still returning from `run`: the wake-up is remembered and the unit
//! is re-queued the moment it parks, so no notification is ever lost.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::failure::Failure;
use crate::core::worker_pool::{PoolError, WorkerPool};

/// Result of running a unit once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The unit finished; the pool drops it.
    Complete,
    /// The unit cleared its complete flag and wants to run again as soon as
    /// possible.
    Reschedule,
    /// The unit registered its activation with a waiter list and must not run
    /// again until activated.
    Suspended,
}

/// Tag pinning a unit's continuations to one lane of an affinity pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Affinity {
    /// Name of the pool that assigned the lane.
    pub pool: Arc<str>,
    /// Lane index within that pool.
    pub lane: usize,
}

/// Work executed by a worker pool.
pub trait Job: Send + 'static {
    /// Run until completion or the next suspension point.
    fn run(&mut self, cx: &mut JobContext) -> JobStatus;

    /// Called instead of further runs when `run` panicked.
    fn fail(self: Box<Self>, cx: &mut JobContext, failure: Failure) {
        error!(pool = cx.pool().name(), error = %failure, "unit panicked with no failure route");
    }

    /// Called when a pool refuses the unit (stopped, or never started and
    /// torn down). The unit will not run again.
    fn abandon(self: Box<Self>, error: &PoolError) {
        warn!(error = %error, "unit abandoned");
    }
}

/// Adapter running a closure as a [`Job`].
pub struct FnJob<F>(F);

impl<F> Job for FnJob<F>
where
    F: FnMut(&mut JobContext) -> JobStatus + Send + 'static,
{
    fn run(&mut self, cx: &mut JobContext) -> JobStatus {
        (self.0)(cx)
    }
}

/// The schedulable unit handed to a [`WorkerPool`].
pub struct Unit {
    id: Uuid,
    name: Arc<str>,
    affinity: Option<Affinity>,
    job: Box<dyn Job>,
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

impl Unit {
    /// Wrap a job.
    pub fn new(name: impl Into<Arc<str>>, job: impl Job) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            affinity: None,
            job: Box::new(job),
        }
    }

    /// Wrap a closure.
    pub fn from_fn<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: FnMut(&mut JobContext) -> JobStatus + Send + 'static,
    {
        Self::new(name, FnJob(f))
    }

    /// Carry an affinity tag.
    #[must_use]
    pub fn with_affinity(mut self, affinity: Option<Affinity>) -> Self {
        self.affinity = affinity;
        self
    }

    /// Unique id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Affinity tag, if one has been assigned.
    #[must_use]
    pub const fn affinity(&self) -> Option<&Affinity> {
        self.affinity.as_ref()
    }

    pub(crate) fn set_affinity(&mut self, affinity: Affinity) {
        self.affinity = Some(affinity);
    }

    /// Run the job once.
    pub fn run(&mut self, cx: &mut JobContext) -> JobStatus {
        self.job.run(cx)
    }

    /// Hand the job a failure instead of running it again.
    pub fn fail(self, cx: &mut JobContext, failure: Failure) {
        self.job.fail(cx, failure);
    }

    /// Give up on the unit.
    pub fn abandon(self, error: &PoolError) {
        warn!(unit = %self.name, id = %self.id, error = %error, "abandoning unit");
        self.job.abandon(error);
    }
}

/// Execution context passed to a running job.
pub struct JobContext {
    pool: Arc<dyn WorkerPool>,
    activation: Activation,
    affinity: Option<Affinity>,
}

impl JobContext {
    /// Context for one run of a unit on `pool`.
    #[must_use]
    pub fn new(pool: Arc<dyn WorkerPool>, affinity: Option<Affinity>) -> Self {
        Self {
            pool,
            activation: Activation::new(),
            affinity,
        }
    }

    /// Activation to register when suspending.
    #[must_use]
    pub const fn activation(&self) -> &Activation {
        &self.activation
    }

    /// Pool running the unit.
    #[must_use]
    pub const fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }

    /// Affinity tag of the running unit.
    #[must_use]
    pub const fn affinity(&self) -> Option<&Affinity> {
        self.affinity.as_ref()
    }
}

enum Slot {
    Running,
    Woken,
    Parked(Unit, Arc<dyn WorkerPool>),
    Released,
}

struct ActivationInner {
    slot: Mutex<Slot>,
    registered: AtomicBool,
}

/// Waiter token that moves a suspended unit back onto its pool.
///
/// Cloning is cheap; every clone refers to the same unit.
#[derive(Clone)]
pub struct Activation {
    inner: Arc<ActivationInner>,
}

impl Default for Activation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("activated", &self.is_activated())
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Activation {
    /// Fresh activation for a running unit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ActivationInner {
                slot: Mutex::new(Slot::Running),
                registered: AtomicBool::new(false),
            }),
        }
    }

    /// Clone for storage in a waiter list, marking the unit as legitimately
    /// suspended.
    #[must_use]
    pub fn register(&self) -> Self {
        self.inner.registered.store(true, Ordering::Release);
        self.clone()
    }

    /// Whether some waiter list holds this activation.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// Whether the activation has fired.
    #[must_use]
    pub fn is_activated(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Woken | Slot::Released)
    }

    /// Fire the activation. Idempotent.
    pub fn activate(&self) {
        let parked = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Released) {
                Slot::Running => {
                    *slot = Slot::Woken;
                    None
                }
                Slot::Parked(unit, pool) => Some((unit, pool)),
                previous @ (Slot::Woken | Slot::Released) => {
                    *slot = previous;
                    None
                }
            }
        };
        if let Some((unit, pool)) = parked {
            debug!(unit = unit.name(), pool = pool.name(), "activating suspended unit");
            pool.assign(unit);
        }
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Undo a registration whose wake-up the running unit observed itself.
    /// Only valid while no other waiter list holds this activation.
    pub(crate) fn withdraw(&self) {
        let mut slot = self.inner.slot.lock();
        if matches!(*slot, Slot::Woken) {
            *slot = Slot::Running;
        }
        self.inner.registered.store(false, Ordering::Release);
    }

    /// Park a unit that returned [`JobStatus::Suspended`]. Re-queues it at
    /// once if the activation already fired.
    pub(crate) fn park(&self, unit: Unit, pool: Arc<dyn WorkerPool>) {
        let ready = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Released) {
                Slot::Running => {
                    *slot = Slot::Parked(unit, pool);
                    None
                }
                Slot::Woken | Slot::Released => Some((unit, pool)),
                Slot::Parked(previous, previous_pool) => {
                    *slot = Slot::Parked(previous, previous_pool);
                    Some((unit, pool))
                }
            }
        };
        if let Some((unit, pool)) = ready {
            pool.assign(unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::worker_pool::PassivePool;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_activation_before_park_requeues_on_park() {
        let pool = PassivePool::new("passive");
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let unit = Unit::from_fn("counter", move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            JobStatus::Complete
        });

        let activation = Activation::new();
        activation.activate();
        assert!(activation.is_activated());
        activation.park(unit, pool);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_park_then_activate_requeues_once() {
        let pool = PassivePool::new("passive");
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let unit = Unit::from_fn("counter", move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            JobStatus::Complete
        });

        let activation = Activation::new();
        activation.park(unit, pool);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        activation.activate();
        activation.activate();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_marks_suspension() {
        let activation = Activation::new();
        assert!(!activation.is_registered());
        let stored = activation.register();
        assert!(stored.is_registered());
        assert!(activation.is_registered());
    }
}
