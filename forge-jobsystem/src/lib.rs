mod barrier;
mod daemon;
mod future;
mod gc;
mod job;
mod monitor;
mod profile;
mod scheduler;
#[cfg(test)]
mod tests;
mod worker;

pub use barrier::BarrierHandle;
pub use daemon::DaemonHandle;
pub use future::{ExecutionError, SharedFuture};
pub use job::{
    ExecutionState, JobHandle, JobMetadata, MAIN_WORKER_ID, WORKER_AFFINITY_ANY, WORKER_AFFINITY_ASYNC,
    WORKER_AFFINITY_MAIN,
};
pub use scheduler::SchedulingAlgorithm;

use barrier::Barrier;
use crossbeam::deque::Injector;
use crossbeam::queue::SegQueue;
use forge_core::job_fatal;
use forge_core::pool::Pool;
use job::Job;
use parking_lot::{Condvar, Mutex};
use scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use worker::WorkerSharedState;

const JOB_POOL_CAPACITY: usize = 16 * 1024;
const BARRIER_POOL_CAPACITY: usize = 1024;
const DEFAULT_MAX_STEALING_ATTEMPTS: usize = 4;

/// Construction-time configuration for a [`JobSystem`].
pub struct JobSystemConfig {
    /// Total worker slots, including the reserved main-affinity slot (worker 0).
    /// Defaults to `num_cpus::get()`.
    pub max_workers: Option<usize>,
    pub max_stealing_attempts: usize,
    pub scheduling_algorithm: SchedulingAlgorithm,
    /// When set, the execution-time profile table is seeded from this file at
    /// startup and saved back to it when the job system shuts down.
    pub persistence_file: Option<PathBuf>,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            max_stealing_attempts: DEFAULT_MAX_STEALING_ATTEMPTS,
            scheduling_algorithm: SchedulingAlgorithm::RoundRobin,
            persistence_file: None,
        }
    }
}

/// Task-graph executor: a pool of work-stealing worker threads plus a reserved
/// main-affinity slot (worker 0, drained by [`JobSystem::foreground_work`]),
/// pool-backed jobs/barriers/futures, a profile-fed scheduler and a daemon
/// scheduler for recurring work.
pub struct JobSystem {
    state: Arc<WorkerSharedState>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    daemons: daemon::DaemonScheduler,
    worker_count: usize,
}

impl JobSystem {
    pub fn new(config: JobSystemConfig) -> Self {
        let worker_count = config.max_workers.unwrap_or_else(num_cpus::get).max(1);
        let injectors = (0..worker_count).map(|_| Injector::new()).collect();

        let profiles = match &config.persistence_file {
            Some(path) => profile::ProfileTable::with_persistence_file(path),
            None => profile::ProfileTable::new(),
        };

        let state = Arc::new(WorkerSharedState {
            injectors,
            jobs: Pool::with_capacity(JOB_POOL_CAPACITY),
            barriers: Pool::with_capacity(BARRIER_POOL_CAPACITY),
            scheduler: Scheduler::new(config.scheduling_algorithm, worker_count),
            profiles,
            monitor: monitor::Monitor::new(),
            dead_jobs: SegQueue::new(),
            pending_job_count: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            wake_mutex: Mutex::new(()),
            wake: Condvar::new(),
            max_stealing_attempts: config.max_stealing_attempts,
        });

        // Worker 0 is the reserved WORKER_AFFINITY_MAIN slot: it has no background
        // thread of its own, it is drained cooperatively by foreground_work().
        let mut threads = Vec::with_capacity(worker_count.saturating_sub(1));
        for worker_id in 1..worker_count {
            let thread_state = state.clone();
            let handle = thread::Builder::new()
                .name(format!("forge-worker-{worker_id}"))
                .spawn(move || worker::worker_loop(thread_state, worker_id))
                .expect("failed to spawn job system worker thread");
            threads.push(handle);
        }

        Self {
            state,
            threads: Mutex::new(threads),
            daemons: daemon::DaemonScheduler::new(),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Creates a job, wiring its kernel's return value (or panic) into the
    /// returned future. The job is not scheduled; call [`JobSystem::schedule`]
    /// once the job graph (parents, children, barrier) is fully built.
    pub fn create_task<T, F>(&self, metadata: JobMetadata, kernel: F) -> (JobHandle, SharedFuture<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + Sync + 'static,
    {
        let future = SharedFuture::<T>::new();
        let success_future = future.clone();
        let failure_future = future.clone();

        let wrapped: Box<dyn FnOnce() + Send> = Box::new(move || {
            let value = kernel();
            success_future.fulfill(value);
        });

        let job = Job::new(metadata, wrapped);
        *job.failure_hook.lock() = Some(Box::new(move |error| failure_future.fail(error)));

        let handle = self
            .state
            .jobs
            .insert(job)
            .unwrap_or_else(|| job_fatal!("job pool exhausted"));

        (handle, future)
    }

    /// Creates a job whose kernel's return value isn't observed through a future,
    /// for fire-and-forget work (side effects only).
    pub fn create_job(&self, metadata: JobMetadata, kernel: impl FnOnce() + Send + 'static) -> JobHandle {
        let job = Job::new(metadata, Box::new(kernel));
        self.state
            .jobs
            .insert(job)
            .unwrap_or_else(|| job_fatal!("job pool exhausted"))
    }

    /// Declares `child` dependent on `parent`: `child` will not become
    /// schedulable until every parent added this way has finished. Must be
    /// called before `child` is scheduled.
    pub fn add_child(&self, parent: JobHandle, child: JobHandle) {
        if let Some(child_ref) = self.state.jobs.get(child) {
            child_ref.add_dependency();
        }
        if let Some(parent_ref) = self.state.jobs.get(parent) {
            parent_ref.push_child(child);
        }
    }

    pub fn create_barrier(&self) -> BarrierHandle {
        let handle = self
            .state
            .barriers
            .insert(Barrier::default())
            .unwrap_or_else(|| job_fatal!("barrier pool exhausted"));
        if let Some(barrier) = self.state.barriers.get(handle) {
            barrier.claim();
        }
        handle
    }

    pub fn attach_to_barrier(&self, job: JobHandle, barrier: BarrierHandle) {
        if let Some(job_ref) = self.state.jobs.get(job) {
            job_ref.set_barrier(barrier);
        }
        if let Some(barrier_ref) = self.state.barriers.get(barrier) {
            barrier_ref.add_dependency();
        }
    }

    pub fn wait_on_barrier(&self, barrier: BarrierHandle) {
        while !self.barrier_finished(barrier) {
            self.help_while_waiting();
        }
    }

    pub fn destroy_barrier(&self, barrier: BarrierHandle) {
        if let Some(barrier_ref) = self.state.barriers.get(barrier) {
            let pending = barrier_ref.pending();
            if pending != 0 {
                job_fatal!("destroyed barrier with {} pending dependencies", pending);
            }
            barrier_ref.release();
        }
        self.state.barriers.remove(barrier);
    }

    fn barrier_finished(&self, barrier: BarrierHandle) -> bool {
        self.state
            .barriers
            .get(barrier)
            .map(|b| b.is_finished())
            .unwrap_or(true)
    }

    /// Assigns `job` to a worker (via the configured scheduling algorithm among
    /// the workers compatible with its affinity) and pushes it onto that
    /// worker's queue. A no-op if the job has already been scheduled, or if it
    /// still has unfinished parents: it is released automatically once its
    /// last parent finishes (see `worker::execute`).
    pub fn schedule(&self, job: JobHandle) {
        let ready = self.state.jobs.get(job).map(|j| j.dependency_count() == 0).unwrap_or(false);
        if !ready {
            return;
        }
        worker::enqueue(&self.state, job);
    }

    pub fn is_finished(&self, job: JobHandle) -> bool {
        self.state.jobs.get(job).map(|j| j.is_finished()).unwrap_or(true)
    }

    pub fn is_busy(&self) -> bool {
        !self.state.is_work_done()
    }

    pub fn is_work_done(&self) -> bool {
        self.state.is_work_done()
    }

    /// Attempts to run `job` on the calling thread right now, racing against
    /// whichever worker it was scheduled to. Exactly one side wins; the other
    /// returns having done nothing. Lets a thread that would otherwise block
    /// waiting on a job make it happen instead of idling.
    pub fn try_preempt_and_execute(&self, job: JobHandle) -> bool {
        let runner_id = self
            .state
            .jobs
            .get(job)
            .map(|j| j.scheduled_worker())
            .unwrap_or(usize::MAX);
        let runner_id = if runner_id == usize::MAX { MAIN_WORKER_ID } else { runner_id };
        worker::execute(&self.state, job, runner_id)
    }

    fn help_while_waiting(&self) -> bool {
        for worker_id in 0..self.worker_count {
            if let Some(handle) = worker::find_job(&self.state, worker_id) {
                worker::execute(&self.state, handle, worker_id);
                return true;
            }
        }
        thread::sleep(Duration::from_micros(200));
        false
    }

    pub fn wait(&self, job: JobHandle) {
        while !self.is_finished(job) {
            self.help_while_waiting();
        }
    }

    /// Waits for `job`, helping with other runnable work in the meantime, until
    /// either it finishes or `deadline` passes. Returns whether it finished.
    pub fn wait_until(&self, job: JobHandle, deadline: Instant) -> bool {
        while !self.is_finished(job) {
            if Instant::now() >= deadline {
                return false;
            }
            self.help_while_waiting();
        }
        true
    }

    pub fn wait_for(&self, job: JobHandle, timeout: Duration) -> bool {
        self.wait_until(job, Instant::now() + timeout)
    }

    /// Drains the reserved WORKER_AFFINITY_MAIN queue by running one job on the
    /// calling thread. Meant to be called from the application's own main loop.
    /// Returns whether a job was actually run.
    pub fn foreground_work(&self) -> bool {
        worker::foreground_work(&self.state, MAIN_WORKER_ID)
    }

    /// Releases pool slots for finished jobs and logs any unread exceptions.
    /// Like `kibble`'s collector, this must only be called from the thread that
    /// owns the `JobSystem`.
    pub fn collect_garbage(&self) {
        gc::collect(&self.state);
    }

    pub fn log_statistics(&self, worker: usize) {
        self.state.monitor.update_statistics();
        self.state.monitor.log_statistics(worker);
    }

    /// Registers a recurring job. The kernel is owned by the daemon scheduler and
    /// re-installed into the job's (otherwise one-shot) kernel slot on every
    /// `interval_ms` cycle; `ttl` bounds how many times it fires before being
    /// killed automatically (`None` runs until [`JobSystem::kill_daemon`]).
    pub fn create_daemon(
        &self,
        metadata: JobMetadata,
        interval_ms: u64,
        ttl: Option<u32>,
        kernel: impl FnMut() + Send + 'static,
    ) -> DaemonHandle {
        let job = Job::new(metadata, Box::new(|| {}));
        let handle = self
            .state
            .jobs
            .insert(job)
            .unwrap_or_else(|| job_fatal!("job pool exhausted"));
        if let Some(job_ref) = self.state.jobs.get(handle) {
            job_ref.keep_alive.store(true, Ordering::Release);
        }
        self.daemons.create(handle, interval_ms, ttl, kernel)
    }

    pub fn kill_daemon(&self, handle: DaemonHandle) {
        self.daemons.kill(handle);
    }

    pub fn daemon_is_alive(&self, handle: DaemonHandle) -> bool {
        self.daemons.is_alive(handle)
    }

    /// Advances every daemon's cooldown by `elapsed_ms`, scheduling any whose
    /// cooldown lapsed. Meant to be called once per tick of the application's own
    /// clock (the job system keeps no timer thread of its own).
    pub fn update_daemons(&self, elapsed_ms: u64) {
        let killed = self.daemons.update(elapsed_ms, |job_handle, kernel| {
            if let Some(job_ref) = self.state.jobs.get(job_handle) {
                job_ref.reset_for_reschedule(kernel);
            }
            self.schedule(job_handle);
        });

        for job_handle in killed {
            if self.is_finished(job_handle) {
                self.state.dead_jobs.push(job_handle);
            }
        }
    }

    fn join_workers(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.state.notify_all();
        for handle in self.threads.lock().drain(..) {
            handle.join().ok();
        }
        self.state.profiles.save().ok();
    }

    /// Signals every worker to stop once its queue drains and blocks until they
    /// have all joined.
    pub fn shutdown(&self) {
        self.join_workers();
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.join_workers();
    }
}
