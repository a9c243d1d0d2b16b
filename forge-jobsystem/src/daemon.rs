use crate::job::JobHandle;
use forge_core::sparse_vec::SparseVec;
use parking_lot::Mutex;
use std::sync::Arc;

pub type DaemonHandle = usize;

#[derive(Debug, Clone, Copy)]
struct SchedulingData {
    interval_ms: u64,
    cooldown_ms: u64,
    ttl: Option<u32>,
    marked_for_deletion: bool,
}

struct Daemon {
    scheduling_data: SchedulingData,
    job: JobHandle,
    kernel: Arc<Mutex<dyn FnMut() + Send>>,
}

/// Recurring-job scheduler: a daemon reuses the same job slot across many runs
/// instead of a regular job's one-shot kernel, firing every `interval_ms` until
/// its time-to-live (if any) expires or it is explicitly killed. Modeled on
/// `kibble`'s `DaemonScheduler`, which keeps its own cooldown table rather than
/// depend on an external timer wheel.
pub struct DaemonScheduler {
    daemons: Mutex<SparseVec<Daemon>>,
}

impl DaemonScheduler {
    pub fn new() -> Self {
        Self {
            daemons: Mutex::new(SparseVec::default()),
        }
    }

    /// Registers a daemon. `job` must already have been created (so the caller
    /// controls its `JobMetadata`) but not scheduled; the scheduler takes
    /// ownership of running it going forward.
    pub fn create(
        &self,
        job: JobHandle,
        interval_ms: u64,
        ttl: Option<u32>,
        kernel: impl FnMut() + Send + 'static,
    ) -> DaemonHandle {
        let daemon = Daemon {
            scheduling_data: SchedulingData {
                interval_ms,
                cooldown_ms: interval_ms,
                ttl,
                marked_for_deletion: false,
            },
            job,
            kernel: Arc::new(Mutex::new(kernel)),
        };

        self.daemons.lock().push(daemon)
    }

    /// Marks a daemon for removal at the next `update` instead of removing it
    /// immediately, so `update` is the only place daemon storage is mutated.
    pub fn kill(&self, handle: DaemonHandle) {
        if let Some(daemon) = self.daemons.lock().get_mut(handle) {
            daemon.scheduling_data.marked_for_deletion = true;
        }
    }

    /// Advances every daemon's cooldown by `elapsed_ms`. Once a daemon's cooldown
    /// reaches zero, its remaining TTL is checked *before* firing: a daemon whose
    /// TTL already hit zero on a previous cycle is removed without running again,
    /// otherwise its TTL is decremented and it is handed back to `reschedule`
    /// (which is expected to install a fresh one-shot kernel on the daemon's job
    /// and push it to a worker). This ordering is what makes `ttl = Some(n)` fire
    /// exactly `n` times: the (n+1)th lapsed cooldown removes it instead of firing.
    /// Returns the `JobHandle` of every daemon removed this cycle (TTL expired
    /// or killed), so the caller can return its job slot to the job pool via the
    /// normal garbage-collection path.
    pub fn update(
        &self,
        elapsed_ms: u64,
        mut reschedule: impl FnMut(JobHandle, Box<dyn FnOnce() + Send>),
    ) -> Vec<JobHandle> {
        let mut daemons = self.daemons.lock();
        let mut to_remove = Vec::new();

        for (index, daemon) in daemons.iter_mut() {
            if daemon.scheduling_data.marked_for_deletion {
                to_remove.push(index);
                continue;
            }

            if elapsed_ms < daemon.scheduling_data.cooldown_ms {
                daemon.scheduling_data.cooldown_ms -= elapsed_ms;
                continue;
            }

            if daemon.scheduling_data.ttl == Some(0) {
                daemon.scheduling_data.marked_for_deletion = true;
                to_remove.push(index);
                continue;
            }

            daemon.scheduling_data.cooldown_ms = daemon.scheduling_data.interval_ms;
            if let Some(ttl) = daemon.scheduling_data.ttl.as_mut() {
                *ttl -= 1;
            }

            let kernel = daemon.kernel.clone();
            reschedule(
                daemon.job,
                Box::new(move || {
                    let mut kernel = kernel.lock();
                    (*kernel)();
                }),
            );
        }

        let mut removed_jobs = Vec::with_capacity(to_remove.len());
        for index in to_remove {
            if let Some(daemon) = daemons.remove(index) {
                removed_jobs.push(daemon.job);
            }
        }
        removed_jobs
    }

    pub fn is_alive(&self, handle: DaemonHandle) -> bool {
        self.daemons
            .lock()
            .get(handle)
            .map(|d| !d.scheduling_data.marked_for_deletion)
            .unwrap_or(false)
    }
}

impl Default for DaemonScheduler {
    fn default() -> Self {
        Self::new()
    }
}
