use crate::job::JobMetadata;
use crate::profile::ProfileTable;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingAlgorithm {
    RoundRobin,
    MinLoad,
}

/// Per-worker load counter used by the min-load algorithm: an estimate of
/// microseconds of work currently sitting in each worker's queue. Incremented at
/// `schedule()` time by the job's profiled execution time, and decremented by
/// that *same* estimate (not the freshly-measured duration) once the job
/// finishes, so every increment has exactly one matching decrement and the
/// counter never drifts out of sync with itself — see DESIGN.md's Open Question
/// #2 decision.
#[derive(Default)]
pub struct InFlightLoad {
    workers: Vec<AtomicU64>,
}

impl InFlightLoad {
    pub fn new(worker_count: usize) -> Self {
        Self {
            workers: (0..worker_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn add(&self, worker: usize, estimate_us: u64) {
        self.workers[worker].fetch_add(estimate_us, Ordering::AcqRel);
    }

    pub fn remove(&self, worker: usize, estimate_us: u64) {
        self.workers[worker].fetch_sub(estimate_us, Ordering::AcqRel);
    }

    pub fn get(&self, worker: usize) -> u64 {
        self.workers[worker].load(Ordering::Acquire)
    }
}

pub struct Scheduler {
    algorithm: SchedulingAlgorithm,
    next_round_robin: AtomicU64,
    in_flight: InFlightLoad,
}

impl Scheduler {
    pub fn new(algorithm: SchedulingAlgorithm, worker_count: usize) -> Self {
        Self {
            algorithm,
            next_round_robin: AtomicU64::new(0),
            in_flight: InFlightLoad::new(worker_count),
        }
    }

    pub fn in_flight(&self) -> &InFlightLoad {
        &self.in_flight
    }

    /// Picks a worker index from among `compatible_workers`, given this job's
    /// execution-time estimate from the profile table.
    pub fn pick_worker(
        &self,
        compatible_workers: &[usize],
        metadata: &JobMetadata,
        profiles: &ProfileTable,
    ) -> usize {
        debug_assert!(!compatible_workers.is_empty());

        match self.algorithm {
            SchedulingAlgorithm::RoundRobin => {
                let index = self.next_round_robin.fetch_add(1, Ordering::Relaxed) as usize;
                compatible_workers[index % compatible_workers.len()]
            }
            SchedulingAlgorithm::MinLoad => {
                let _estimate_us = profiles.estimate_us(metadata.label);
                *compatible_workers
                    .iter()
                    .min_by_key(|&&worker| self.in_flight.get(worker))
                    .expect("compatible_workers is non-empty")
            }
        }
    }
}
