//! Worker pools: pluggable concurrency strategies executing [`Unit`]s.
//!
//! Every strategy implements [`WorkerPool`]. Assigning a unit is infallible
//! from the caller's point of view: a pool that cannot accept it hands the
//! unit back through [`Unit::abandon`], so a unit is always completed,
//! suspended-and-requeued, failed or abandoned, never dropped.
//!
//! # Strategies
//!
//! - [`ThreadPool`]: N workers on one shared channel; one idle worker is
//!   woken per unit. With one worker this is the dedicated strategy.
//! - [`ThreadPerUnitPool`]: a fresh thread per unit.
//! - [`PassivePool`]: the assigning thread runs the unit inline.
//! - [`AffinityPool`]: lanes of dedicated threads; continuations of a unit
//!   return to the lane the unit first ran on.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_flow_runtime::config::PoolConfig;
//! use prometheus_flow_runtime::core::{JobStatus, ThreadPool, Unit, WorkerPool};
//!
//! let pool = ThreadPool::new("io", PoolConfig::thread_pool(4))?;
//! pool.start()?;
//! pool.assign(Unit::from_fn("hello", |_| JobStatus::Complete));
//! pool.stop(true);
//! ```

mod affinity;
mod native;
mod passive;
mod per_unit;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::PoolStrategy;
use crate::core::failure::{Failure, KindId};
use crate::core::unit::{JobContext, JobStatus, Unit};

pub use affinity::AffinityPool;
pub use native::ThreadPool;
pub use passive::PassivePool;
pub use per_unit::ThreadPerUnitPool;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been shut down.
    PoolShutdown,

    /// Configuration validation failed.
    InvalidConfig(String),

    /// Internal error (thread spawn failure, channel closed, etc.).
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// A concurrency strategy executing schedulable units.
pub trait WorkerPool: Send + Sync + 'static {
    /// Pool name, unique within a runtime.
    fn name(&self) -> &str;

    /// Strategy this pool implements.
    fn strategy(&self) -> PoolStrategy;

    /// Accept a unit for execution. A unit the pool cannot take is abandoned.
    fn assign(&self, unit: Unit);

    /// Start workers. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Internal` if a worker thread cannot be spawned and
    /// `PoolError::PoolShutdown` if the pool was already stopped.
    fn start(&self) -> Result<(), PoolError>;

    /// Stop the pool. With `drain`, units already queued run to completion
    /// (or suspension) first; otherwise they are abandoned.
    fn stop(&self, drain: bool);

    /// Snapshot of pool counters.
    fn stats(&self) -> PoolStats;
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads (0 for passive, live threads for per-unit).
    pub worker_count: usize,

    /// Units accepted by `assign`.
    pub assigned_units: u64,

    /// Units waiting to run.
    pub queued_units: u64,

    /// Units currently running.
    pub active_units: u64,

    /// Runs that returned `Complete`.
    pub completed_units: u64,

    /// Runs that returned `Reschedule`.
    pub rescheduled_units: u64,

    /// Runs that returned `Suspended`.
    pub suspended_units: u64,

    /// Runs that panicked.
    pub failed_units: u64,

    /// Units refused or dropped at shutdown.
    pub abandoned_units: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub assigned: AtomicU64,
    pub queued: AtomicU64,
    pub active: AtomicU64,
    pub completed: AtomicU64,
    pub rescheduled: AtomicU64,
    pub suspended: AtomicU64,
    pub failed: AtomicU64,
    pub abandoned: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            assigned_units: self.assigned.load(Ordering::Relaxed),
            queued_units: self.queued.load(Ordering::Relaxed),
            active_units: self.active.load(Ordering::Relaxed),
            completed_units: self.completed.load(Ordering::Relaxed),
            rescheduled_units: self.rescheduled.load(Ordering::Relaxed),
            suspended_units: self.suspended.load(Ordering::Relaxed),
            failed_units: self.failed.load(Ordering::Relaxed),
            abandoned_units: self.abandoned.load(Ordering::Relaxed),
        }
    }

    pub fn abandon(&self, unit: Unit, error: &PoolError) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        unit.abandon(error);
    }
}

/// Run a unit once on the calling thread and route its status.
///
/// Panics inside the job are caught so the worker survives; the job receives
/// a [`KindId::PANIC`] failure through [`Unit::fail`].
pub(crate) fn run_unit(pool: &Arc<dyn WorkerPool>, mut unit: Unit, counters: &PoolCounters) {
    counters.active.fetch_add(1, Ordering::Relaxed);
    let mut cx = JobContext::new(Arc::clone(pool), unit.affinity().cloned());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unit.run(&mut cx)));
    counters.active.fetch_sub(1, Ordering::Relaxed);

    match outcome {
        Ok(JobStatus::Complete) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(JobStatus::Reschedule) => {
            counters.rescheduled.fetch_add(1, Ordering::Relaxed);
            pool.assign(unit);
        }
        Ok(JobStatus::Suspended) => {
            counters.suspended.fetch_add(1, Ordering::Relaxed);
            if cx.activation().is_registered() {
                debug!(pool = pool.name(), unit = unit.name(), "unit suspended");
                let activation = cx.activation().clone();
                activation.park(unit, Arc::clone(pool));
            } else {
                warn!(
                    pool = pool.name(),
                    unit = unit.name(),
                    "unit suspended without registering a waiter; re-queuing"
                );
                pool.assign(unit);
            }
        }
        Err(payload) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(payload.as_ref());
            error!(pool = pool.name(), unit = unit.name(), panic = %message, "unit panicked");
            let failure = Failure::new(KindId::PANIC, format!("unit `{}` panicked: {message}", unit.name()));
            unit.fail(&mut cx, failure);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::PoolShutdown.to_string(), "pool has been shut down");
        assert_eq!(
            PoolError::InvalidConfig("worker_count must be greater than 0".into()).to_string(),
            "invalid configuration: worker_count must be greater than 0"
        );
        assert_eq!(PoolError::Internal("spawn".into()).to_string(), "internal error: spawn");
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();
        assert_eq!(stats.worker_count, 0);
        assert_eq!(stats.active_units, 0);
        assert_eq!(stats.completed_units, 0);
    }

    #[test]
    fn test_pool_counters_snapshot() {
        let counters = PoolCounters::default();
        counters.assigned.fetch_add(10, Ordering::Relaxed);
        counters.completed.fetch_add(5, Ordering::Relaxed);
        counters.suspended.fetch_add(2, Ordering::Relaxed);

        let stats = counters.snapshot(4);
        assert_eq!(stats.worker_count, 4);
        assert_eq!(stats.assigned_units, 10);
        assert_eq!(stats.completed_units, 5);
        assert_eq!(stats.suspended_units, 2);
    }

    #[test]
    fn test_panic_is_captured_and_failed() {
        let pool = PassivePool::new("passive");
        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        struct Panicky(Arc<std::sync::atomic::AtomicBool>);
        impl crate::core::unit::Job for Panicky {
            fn run(&mut self, _cx: &mut JobContext) -> JobStatus {
                panic!("boom");
            }
            fn fail(self: Box<Self>, _cx: &mut JobContext, failure: Failure) {
                assert_eq!(failure.kind(), KindId::PANIC);
                assert!(failure.message().contains("boom"));
                self.0.store(true, Ordering::SeqCst);
            }
        }

        pool.assign(Unit::new("panicky", Panicky(Arc::clone(&failed))));
        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(pool.stats().failed_units, 1);
    }
}
