//! Pass-through pool: the assigning thread runs the unit inline.
//!
//! Re-entrant assignments (a unit rescheduling itself, or activating a
//! sibling while it runs) are pushed to a backlog that the outermost caller
//! drains, so the stack never grows with the length of a continuation chain.
//! Assignments arriving from other threads while a drain is in progress are
//! picked up by that drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::PoolStrategy;
use crate::core::unit::Unit;

use super::{run_unit, PoolCounters, PoolError, PoolStats, WorkerPool};

/// Synchronous pool for single-threaded and test configurations.
pub struct PassivePool {
    name: String,
    me: Weak<PassivePool>,
    backlog: Mutex<VecDeque<Unit>>,
    draining: AtomicBool,
    shutdown: AtomicBool,
    counters: PoolCounters,
}

impl PassivePool {
    /// Create a pool. No `start` is required before assigning.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            me: me.clone(),
            backlog: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            counters: PoolCounters::default(),
        })
    }

    fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another frame or thread owns the backlog.
                return;
            }

            loop {
                // The guard must be gone before the unit runs; a reschedule
                // re-enters `assign` and locks the backlog again.
                let next = self.backlog.lock().pop_front();
                let Some(unit) = next else { break };
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                match self.me.upgrade() {
                    Some(pool) => {
                        let pool: Arc<dyn WorkerPool> = pool;
                        run_unit(&pool, unit, &self.counters);
                    }
                    None => self.counters.abandon(unit, &PoolError::PoolShutdown),
                }
            }

            self.draining.store(false, Ordering::Release);

            // A unit pushed between the last pop and the release above would
            // otherwise sit in the backlog with nobody draining it.
            if self.backlog.lock().is_empty() {
                return;
            }
        }
    }
}

impl WorkerPool for PassivePool {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> PoolStrategy {
        PoolStrategy::Passive
    }

    fn assign(&self, unit: Unit) {
        if self.shutdown.load(Ordering::Acquire) {
            self.counters.abandon(unit, &PoolError::PoolShutdown);
            return;
        }
        self.counters.assigned.fetch_add(1, Ordering::Relaxed);
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.backlog.lock().push_back(unit);
        self.drain();
    }

    fn start(&self) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }
        Ok(())
    }

    fn stop(&self, drain: bool) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(pool = %self.name, drain, "stopping passive pool");
        if drain {
            self.drain();
            return;
        }
        let leftovers: Vec<Unit> = self.backlog.lock().drain(..).collect();
        for unit in leftovers {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            self.counters.abandon(unit, &PoolError::PoolShutdown);
        }
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::unit::JobStatus;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_inline() {
        let pool = PassivePool::new("inline");
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        pool.assign(Unit::from_fn("now", move |_| {
            ran_clone.store(true, Ordering::SeqCst);
            JobStatus::Complete
        }));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.stats().completed_units, 1);
        assert_eq!(pool.stats().queued_units, 0);
    }

    #[test]
    fn test_reentrant_assign_is_deferred_not_nested() {
        let pool = PassivePool::new("inline");
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_outer = Arc::clone(&order);
        pool.assign(Unit::from_fn("outer", move |cx| {
            order_outer.lock().push("outer-start");
            let order_inner = Arc::clone(&order_outer);
            cx.pool().assign(Unit::from_fn("inner", move |_| {
                order_inner.lock().push("inner");
                JobStatus::Complete
            }));
            order_outer.lock().push("outer-end");
            JobStatus::Complete
        }));

        assert_eq!(*order.lock(), vec!["outer-start", "outer-end", "inner"]);
    }

    #[test]
    fn test_reschedule_drains_in_same_call() {
        let pool = PassivePool::new("inline");
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        pool.assign(Unit::from_fn("thrice", move |_| {
            if runs_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                JobStatus::Reschedule
            } else {
                JobStatus::Complete
            }
        }));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_stopped_pool_abandons() {
        let pool = PassivePool::new("inline");
        pool.stop(false);
        pool.assign(Unit::from_fn("late", |_| JobStatus::Complete));
        assert_eq!(pool.stats().abandoned_units, 1);
        assert_eq!(pool.stats().completed_units, 0);
    }
}
