use crossbeam::queue::SegQueue;
use forge_core::job_info;
use parking_lot::RwLock;
use std::collections::HashMap;

pub struct ActivityRecord {
    pub worker: usize,
    pub label: u64,
    pub execution_time_us: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerStats {
    jobs_processed: u64,
    total_active_us: u64,
}

/// Collects per-job execution-time samples from every worker and aggregates them
/// into per-worker statistics, the way `kibble`'s monitor drains a queue of
/// thread activity records rather than have workers contend on shared counters.
pub struct Monitor {
    queue: SegQueue<ActivityRecord>,
    stats: RwLock<HashMap<usize, WorkerStats>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn report(&self, record: ActivityRecord) {
        self.queue.push(record);
    }

    /// Drains everything reported since the last call and folds it into the
    /// per-worker aggregate. Cheap to call frequently (e.g. once per scheduler
    /// tick); never blocks workers pushing new records.
    pub fn update_statistics(&self) {
        let mut stats = self.stats.write();
        while let Some(record) = self.queue.pop() {
            let entry = stats.entry(record.worker).or_default();
            entry.jobs_processed += 1;
            entry.total_active_us += record.execution_time_us;
        }
    }

    pub fn log_statistics(&self, worker: usize) {
        let stats = self.stats.read();
        let Some(entry) = stats.get(&worker) else {
            job_info!("worker {} has no recorded activity", worker);
            return;
        };

        let mean_us = if entry.jobs_processed > 0 {
            entry.total_active_us as f64 / entry.jobs_processed as f64
        } else {
            0.0
        };

        job_info!(
            "worker {}: {} jobs, {:.2}us mean execution time, {}us total active time",
            worker,
            entry.jobs_processed,
            mean_us,
            entry.total_active_us
        );
    }

    pub fn jobs_processed(&self, worker: usize) -> u64 {
        self.stats
            .read()
            .get(&worker)
            .map(|s| s.jobs_processed)
            .unwrap_or(0)
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_statistics_aggregates_by_worker() {
        let monitor = Monitor::new();
        monitor.report(ActivityRecord {
            worker: 0,
            label: 1,
            execution_time_us: 100,
        });
        monitor.report(ActivityRecord {
            worker: 0,
            label: 1,
            execution_time_us: 200,
        });
        monitor.update_statistics();

        assert_eq!(monitor.jobs_processed(0), 2);
    }
}
