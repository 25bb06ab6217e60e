//! Thread-affinity-preserving pool.
//!
//! The pool owns a fixed set of lanes, each a dedicated serial worker. The
//! first time a unit is assigned without an affinity tag for this pool, it is
//! pinned to a lane round-robin and tagged. Every later assignment carrying
//! the tag (rescheduling, activation after suspension, or successor units the
//! flow engine creates with the inherited tag) lands on the same lane and so
//! on the same OS thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{PoolConfig, PoolStrategy};
use crate::core::unit::{Affinity, Unit};

use super::{PoolError, PoolStats, ThreadPool, WorkerPool};

/// Lanes of dedicated threads; continuations stay on their lane.
pub struct AffinityPool {
    name: Arc<str>,
    lanes: Vec<Arc<ThreadPool>>,
    next_lane: AtomicUsize,
}

impl AffinityPool {
    /// Create a pool with `config.worker_count` lanes (CPU count by default).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` for an invalid configuration.
    pub fn new(name: impl Into<String>, config: &PoolConfig) -> Result<Arc<Self>, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        let name: String = name.into();
        let lane_config = PoolConfig::dedicated().with_thread_stack_size(config.effective_stack_size());
        let lanes = (0..config.effective_worker_count().max(1))
            .map(|lane| ThreadPool::new(format!("{name}-lane-{lane}"), lane_config.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(Self {
            name: name.into(),
            lanes,
            next_lane: AtomicUsize::new(0),
        }))
    }

    /// Number of lanes.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn lane_for(&self, unit: &mut Unit) -> usize {
        if let Some(tag) = unit.affinity() {
            if *tag.pool == *self.name && tag.lane < self.lanes.len() {
                return tag.lane;
            }
        }
        let lane = self.next_lane.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        debug!(pool = %self.name, unit = unit.name(), lane, "pinning unit to lane");
        unit.set_affinity(Affinity {
            pool: Arc::clone(&self.name),
            lane,
        });
        lane
    }
}

impl WorkerPool for AffinityPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy(&self) -> PoolStrategy {
        PoolStrategy::Affinity
    }

    fn assign(&self, mut unit: Unit) {
        let lane = self.lane_for(&mut unit);
        self.lanes[lane].assign(unit);
    }

    fn start(&self) -> Result<(), PoolError> {
        for lane in &self.lanes {
            lane.start()?;
        }
        info!(pool = %self.name, lanes = self.lanes.len(), "affinity pool started");
        Ok(())
    }

    fn stop(&self, drain: bool) {
        for lane in &self.lanes {
            lane.stop(drain);
        }
    }

    fn stats(&self) -> PoolStats {
        self.lanes.iter().map(|lane| lane.stats()).fold(PoolStats::default(), |mut acc, s| {
            acc.worker_count += s.worker_count;
            acc.assigned_units += s.assigned_units;
            acc.queued_units += s.queued_units;
            acc.active_units += s.active_units;
            acc.completed_units += s.completed_units;
            acc.rescheduled_units += s.rescheduled_units;
            acc.suspended_units += s.suspended_units;
            acc.failed_units += s.failed_units;
            acc.abandoned_units += s.abandoned_units;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::unit::JobStatus;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_tagged_units_return_to_their_lane() {
        let pool = AffinityPool::new("ui", &PoolConfig::new(PoolStrategy::Affinity).with_worker_count(3)).unwrap();
        pool.start().unwrap();
        assert_eq!(pool.lane_count(), 3);

        let (tx, rx) = crossbeam_channel::unbounded();
        let tag = Affinity {
            pool: Arc::from("ui"),
            lane: 1,
        };
        for _ in 0..6 {
            let tx = tx.clone();
            pool.assign(
                Unit::from_fn("pinned", move |cx| {
                    tx.send((thread::current().id(), cx.affinity().cloned())).unwrap();
                    JobStatus::Complete
                })
                .with_affinity(Some(tag.clone())),
            );
        }

        let seen: Vec<_> = (0..6).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert!(seen.iter().all(|(id, _)| *id == seen[0].0));
        assert!(seen.iter().all(|(_, a)| a.as_ref() == Some(&tag)));
        pool.stop(true);
    }

    #[test]
    fn test_untagged_units_are_pinned() {
        let pool = AffinityPool::new("ui", &PoolConfig::new(PoolStrategy::Affinity).with_worker_count(2)).unwrap();
        pool.start().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.assign(Unit::from_fn("fresh", move |cx| {
            tx.send(cx.affinity().cloned()).unwrap();
            JobStatus::Complete
        }));
        let tag = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(&*tag.pool, "ui");
        assert!(tag.lane < 2);
        pool.stop(true);
    }
}
