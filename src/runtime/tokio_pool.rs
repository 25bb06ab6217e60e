//! Worker pool backed by a tokio runtime's blocking thread pool.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

use crate::config::PoolStrategy;
use crate::core::unit::Unit;
use crate::core::worker_pool::{run_unit, PoolCounters, PoolError, PoolStats, WorkerPool};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs each unit with `spawn_blocking` on a tokio runtime.
///
/// Units are synchronous and may block briefly, so they never run on the
/// runtime's async workers.
pub struct TokioPool {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    worker_count: usize,
    me: Weak<TokioPool>,
    counters: Arc<PoolCounters>,
    in_flight: Mutex<usize>,
    running_on: Mutex<HashSet<ThreadId>>,
    idle: Condvar,
    shutdown: AtomicBool,
}

impl TokioPool {
    /// Pool on an existing runtime.
    pub fn new(name: impl Into<String>, handle: Handle) -> Arc<Self> {
        Self::build(name.into(), handle, None, 0)
    }

    /// Pool owning a new multi-threaded runtime with `worker_threads` async
    /// workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Internal` if the runtime cannot be built.
    pub fn with_worker_threads(name: impl Into<String>, worker_threads: usize) -> Result<Arc<Self>, PoolError> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(format!("{name}-tokio"))
            .enable_all()
            .build()
            .map_err(|e| PoolError::Internal(format!("failed to build tokio runtime: {e}")))?;
        let handle = runtime.handle().clone();
        Ok(Self::build(name, handle, Some(runtime), worker_threads.max(1)))
    }

    fn build(name: String, handle: Handle, runtime: Option<Runtime>, worker_count: usize) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name,
            handle,
            runtime: Mutex::new(runtime),
            worker_count,
            me: me.clone(),
            counters: Arc::new(PoolCounters::default()),
            in_flight: Mutex::new(0),
            running_on: Mutex::new(HashSet::new()),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Handle of the runtime units run on.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    fn finished(&self) {
        self.running_on.lock().remove(&thread::current().id());
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

impl WorkerPool for TokioPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> PoolStrategy {
        PoolStrategy::Tokio
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
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        *self.in_flight.lock() += 1;

        self.handle.spawn_blocking(move || {
            pool.counters.queued.fetch_sub(1, Ordering::Relaxed);
            pool.running_on.lock().insert(thread::current().id());
            let counters = Arc::clone(&pool.counters);
            let dyn_pool: Arc<dyn WorkerPool> = pool.clone();
            run_unit(&dyn_pool, unit, &counters);
            pool.finished();
        });
    }

    fn start(&self) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }
        info!(pool = %self.name, "tokio pool started");
        Ok(())
    }

    fn stop(&self, drain: bool) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.name, drain, "stopping tokio pool");

        if drain {
            let own = usize::from(self.running_on.lock().contains(&thread::current().id()));
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            let mut in_flight = self.in_flight.lock();
            while *in_flight > own {
                if self.idle.wait_until(&mut in_flight, deadline).timed_out() {
                    warn!(pool = %self.name, remaining = *in_flight, "units still running after drain timeout");
                    break;
                }
            }
        }

        if let Some(runtime) = self.runtime.lock().take() {
            debug!(pool = %self.name, "shutting down owned tokio runtime");
            runtime.shutdown_background();
        }
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count)
    }
}

impl Drop for TokioPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
