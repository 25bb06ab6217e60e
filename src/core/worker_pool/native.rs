//! Fixed-size pool of OS worker threads sharing one ready queue.
//!
//! Idle workers block on a shared crossbeam channel. Each unit sent wakes
//! exactly one receiver, which dequeues and runs it while the others keep
//! waiting, so an arrival never stampedes the whole pool.
//!
//! # Design Principles
//!
//! - **No polling**: Workers block on channel recv; suspended units are not
//!   held by any worker
//! - **Clean shutdown**: Dropping the sender unblocks workers once the queue
//!   is empty
//! - **Lock-free fast path**: Atomic counters, brief lock only to clone the
//!   sender

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, PoolStrategy};
use crate::core::unit::Unit;

use super::{run_unit, PoolCounters, PoolError, PoolStats, WorkerPool};

/// How long `stop` waits for each worker before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Worker pool with dedicated OS threads.
///
/// # Design
///
/// - **Leader/follower handoff**: the channel wakes one idle worker per unit
/// - **Clean shutdown**: dropping the sender naturally unblocks all workers
/// - **Abort**: `stop(false)` makes workers abandon whatever is still queued
pub struct ThreadPool {
    name: String,
    strategy: PoolStrategy,
    config: PoolConfig,
    me: Weak<ThreadPool>,

    /// Unit sender (to workers). Option allows clean shutdown by dropping.
    unit_tx: Mutex<Option<Sender<Unit>>>,

    /// Receiver cloned into each worker; kept to abandon leftovers.
    unit_rx: Receiver<Unit>,

    /// Pool statistics counters (lock-free atomics).
    counters: Arc<PoolCounters>,

    /// Set once the pool was started.
    started: AtomicBool,

    /// Shutdown flag (lock-free atomic).
    shutdown: AtomicBool,

    /// Workers abandon queued units instead of running them.
    abort: Arc<AtomicBool>,

    /// Worker thread handles.
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Worker thread ids, used to avoid joining a worker from itself.
    worker_ids: Mutex<Vec<ThreadId>>,
}

impl ThreadPool {
    /// Create a new pool. Workers are spawned by [`WorkerPool::start`].
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid or
    /// names a strategy other than `dedicated` / `thread_pool`.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        if !matches!(config.strategy, PoolStrategy::Dedicated | PoolStrategy::ThreadPool) {
            return Err(PoolError::InvalidConfig(format!(
                "ThreadPool cannot run the {:?} strategy",
                config.strategy
            )));
        }

        let (unit_tx, unit_rx) = unbounded::<Unit>();
        let name = name.into();
        let strategy = config.strategy;

        Ok(Arc::new_cyclic(|me| Self {
            name,
            strategy,
            config,
            me: me.clone(),
            unit_tx: Mutex::new(Some(unit_tx)),
            unit_rx,
            counters: Arc::new(PoolCounters::default()),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            abort: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            worker_ids: Mutex::new(Vec::new()),
        }))
    }

    /// Create a single-worker, strictly serial pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid.
    pub fn dedicated(name: impl Into<String>) -> Result<Arc<Self>, PoolError> {
        Self::new(name, PoolConfig::dedicated())
    }

    fn spawn_worker(&self, worker_id: usize) -> Result<JoinHandle<()>, PoolError> {
        let unit_rx = self.unit_rx.clone();
        let counters = Arc::clone(&self.counters);
        let abort = Arc::clone(&self.abort);
        let me = self.me.clone();
        let pool_name = self.name.clone();

        thread::Builder::new()
            .name(format!("{}-worker-{worker_id}", self.name))
            .stack_size(self.config.effective_stack_size())
            .spawn(move || {
                debug!(pool = %pool_name, worker_id, "worker thread started");

                // Worker loop - blocking recv, NO POLLING
                // When the sender is dropped and the queue is empty, recv
                // returns Err and the worker exits
                while let Ok(unit) = unit_rx.recv() {
                    counters.queued.fetch_sub(1, Ordering::Relaxed);

                    if abort.load(Ordering::Acquire) {
                        counters.abandon(unit, &PoolError::PoolShutdown);
                        continue;
                    }

                    let Some(pool) = me.upgrade() else {
                        counters.abandon(unit, &PoolError::PoolShutdown);
                        continue;
                    };
                    let pool: Arc<dyn WorkerPool> = pool;
                    run_unit(&pool, unit, &counters);
                }

                debug!(pool = %pool_name, worker_id, "worker thread exiting");
            })
            .map_err(|e| PoolError::Internal(format!("failed to spawn worker thread: {e}")))
    }
}

impl WorkerPool for ThreadPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> PoolStrategy {
        self.strategy
    }

    fn assign(&self, unit: Unit) {
        if self.shutdown.load(Ordering::Acquire) {
            self.counters.abandon(unit, &PoolError::PoolShutdown);
            return;
        }

        let sender = self.unit_tx.lock().clone();
        let Some(sender) = sender else {
            self.counters.abandon(unit, &PoolError::PoolShutdown);
            return;
        };

        self.counters.assigned.fetch_add(1, Ordering::Relaxed);
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        if let Err(crossbeam_channel::SendError(unit)) = sender.send(unit) {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            self.counters.abandon(unit, &PoolError::PoolShutdown);
        }
    }

    fn start(&self) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let worker_count = self.config.effective_worker_count();
        let mut workers = self.workers.lock();
        let mut ids = self.worker_ids.lock();
        for worker_id in 0..worker_count {
            let handle = self.spawn_worker(worker_id)?;
            ids.push(handle.thread().id());
            workers.push(handle);
        }

        info!(
            pool = %self.name,
            strategy = ?self.strategy,
            worker_count,
            "worker pool started"
        );
        Ok(())
    }

    fn stop(&self, drain: bool) {
        // Check if already shut down
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(pool = %self.name, drain, "shutting down worker pool");

        if !drain {
            self.abort.store(true, Ordering::Release);
        }

        // Drop the sender to unblock all workers waiting on recv()
        self.unit_tx.lock().take();

        let current = thread::current().id();
        let is_worker = self.worker_ids.lock().contains(&current);
        let mut workers = self.workers.lock();
        let worker_count = workers.len();

        if is_worker {
            // Joining ourselves would deadlock; workers exit on their own.
            workers.clear();
        }

        for (idx, worker) in workers.drain(..).enumerate() {
            // Join with timeout using a helper thread
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let result = worker.join();
                let _ = tx.send(result.is_ok());
            });

            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(true) => debug!(pool = %self.name, worker_id = idx, "worker joined"),
                Ok(false) => warn!(pool = %self.name, worker_id = idx, "worker panicked"),
                Err(_) => {
                    warn!(pool = %self.name, worker_id = idx, "worker did not exit within timeout - detaching");
                    continue;
                }
            }
            let _ = join_thread.join();
        }

        // Never started, or aborted: nothing will consume what is left
        while let Ok(unit) = self.unit_rx.try_recv() {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            self.counters.abandon(unit, &PoolError::PoolShutdown);
        }

        info!(pool = %self.name, worker_count, "worker pool shut down complete");
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.workers.lock().len())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Signal shutdown but DON'T join workers in Drop
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.unit_tx.lock().take();
            debug!(pool = %self.name, "ThreadPool dropped without explicit shutdown - workers will be detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::unit::JobStatus;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_thread_pool_runs_units() {
        let pool = ThreadPool::new("test", PoolConfig::thread_pool(2)).unwrap();
        pool.start().unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            pool.assign(Unit::from_fn(format!("u{i}"), move |_| {
                tx.send(i).unwrap();
                JobStatus::Complete
            }));
        }

        let mut seen: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        pool.stop(true);
        assert_eq!(pool.stats().completed_units, 10);
    }

    #[test]
    fn test_reschedule_runs_again() {
        let pool = ThreadPool::dedicated("serial").unwrap();
        pool.start().unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.assign(Unit::from_fn("again", move |_| {
            if runs_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                JobStatus::Reschedule
            } else {
                tx.send(()).unwrap();
                JobStatus::Complete
            }
        }));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        pool.stop(true);
        assert_eq!(pool.stats().rescheduled_units, 2);
    }

    #[test]
    fn test_assign_after_stop_abandons() {
        let pool = ThreadPool::dedicated("stopped").unwrap();
        pool.start().unwrap();
        pool.stop(true);

        pool.assign(Unit::from_fn("late", |_| JobStatus::Complete));
        assert_eq!(pool.stats().abandoned_units, 1);
        assert!(pool.start().is_err());
    }

    #[test]
    fn test_rejects_foreign_strategy() {
        let result = ThreadPool::new("bad", PoolConfig::new(PoolStrategy::Passive));
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }
}
