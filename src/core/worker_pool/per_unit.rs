//! One-thread-per-unit pool for short-lived, fire-and-forget units.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, PoolStrategy};
use crate::core::unit::Unit;

use super::{run_unit, PoolCounters, PoolError, PoolStats, WorkerPool};

/// How long a draining `stop` waits for live unit threads.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns an unbounded number of threads, one per assigned unit.
pub struct ThreadPerUnitPool {
    name: String,
    stack_size: usize,
    me: Weak<ThreadPerUnitPool>,
    live: Mutex<HashSet<ThreadId>>,
    idle: Condvar,
    shutdown: AtomicBool,
    counters: Arc<PoolCounters>,
}

impl ThreadPerUnitPool {
    /// Create a pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` for an invalid configuration.
    pub fn new(name: impl Into<String>, config: &PoolConfig) -> Result<Arc<Self>, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        let name = name.into();
        let stack_size = config.effective_stack_size();
        Ok(Arc::new_cyclic(|me| Self {
            name,
            stack_size,
            me: me.clone(),
            live: Mutex::new(HashSet::new()),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            counters: Arc::new(PoolCounters::default()),
        }))
    }

    fn finished(&self, id: ThreadId) {
        let mut live = self.live.lock();
        live.remove(&id);
        if live.is_empty() {
            self.idle.notify_all();
        }
    }
}

impl WorkerPool for ThreadPerUnitPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> PoolStrategy {
        PoolStrategy::ThreadPerUnit
    }

    fn assign(&self, unit: Unit) {
        if self.shutdown.load(Ordering::Acquire) {
            self.counters.abandon(unit, &PoolError::PoolShutdown);
            return;
        }
        let Some(pool) = self.me.upgrade() else {
            self.counters.abandon(unit, &PoolError::PoolShutdown);
            return;
        };
        self.counters.assigned.fetch_add(1, Ordering::Relaxed);

        // Hold the live set across spawn so the thread cannot finish and
        // deregister before it was registered.
        let mut live = self.live.lock();
        let unit_slot = Arc::new(Mutex::new(Some(unit)));
        let slot = Arc::clone(&unit_slot);
        let spawned = thread::Builder::new()
            .name(format!("{}-unit", self.name))
            .stack_size(self.stack_size)
            .spawn(move || {
                if let Some(unit) = slot.lock().take() {
                    let counters = Arc::clone(&pool.counters);
                    let dyn_pool: Arc<dyn WorkerPool> = pool.clone();
                    run_unit(&dyn_pool, unit, &counters);
                }
                pool.finished(thread::current().id());
            });

        match spawned {
            Ok(handle) => {
                live.insert(handle.thread().id());
            }
            Err(e) => {
                drop(live);
                warn!(pool = %self.name, error = %e, "failed to spawn unit thread");
                if let Some(unit) = unit_slot.lock().take() {
                    self.counters
                        .abandon(unit, &PoolError::Internal(format!("failed to spawn unit thread: {e}")));
                }
            }
        }
    }

    fn start(&self) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }
        info!(pool = %self.name, "thread-per-unit pool started");
        Ok(())
    }

    fn stop(&self, drain: bool) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.name, drain, "stopping thread-per-unit pool");
        if !drain {
            return;
        }

        let current = thread::current().id();
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut live = self.live.lock();
        while live.iter().any(|id| *id != current) {
            if self.idle.wait_until(&mut live, deadline).timed_out() {
                warn!(pool = %self.name, remaining = live.len(), "unit threads still running after drain timeout");
                return;
            }
        }
        debug!(pool = %self.name, "all unit threads finished");
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.live.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::unit::JobStatus;

    #[test]
    fn test_each_unit_gets_its_own_thread() {
        let pool = ThreadPerUnitPool::new("spawn", &PoolConfig::new(PoolStrategy::ThreadPerUnit)).unwrap();
        pool.start().unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.assign(Unit::from_fn("solo", move |_| {
                tx.send(thread::current().id()).unwrap();
                JobStatus::Complete
            }));
        }

        let ids: HashSet<ThreadId> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(ids.len(), 4);

        pool.stop(true);
        assert_eq!(pool.stats().completed_units, 4);
        assert_eq!(pool.stats().worker_count, 0);
    }
}
