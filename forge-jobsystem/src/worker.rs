use crate::barrier::Barrier;
use crate::future::ExecutionError;
use crate::job::{affinity_includes, Job, JobHandle, JobMetadata};
use crate::monitor::{ActivityRecord, Monitor};
use crate::profile::ProfileTable;
use crate::scheduler::Scheduler;
use crossbeam::deque::{Injector, Steal};
use crossbeam::queue::SegQueue;
use forge_core::{job_fatal, job_verbose};
use forge_core::pool::Pool;
use parking_lot::{Condvar, Mutex};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything a worker thread (or a preempting caller running a job inline)
/// needs, shared behind one `Arc` so the `JobSystem` façade can hand worker
/// threads a cheap handle instead of a pile of individual channels.
pub(crate) struct WorkerSharedState {
    pub injectors: Vec<Injector<JobHandle>>,
    pub jobs: Pool<Job>,
    pub barriers: Pool<Barrier>,
    pub scheduler: Scheduler,
    pub profiles: ProfileTable,
    pub monitor: Monitor,
    pub dead_jobs: SegQueue<JobHandle>,
    pub pending_job_count: AtomicU64,
    pub shutdown: AtomicBool,
    pub wake_mutex: Mutex<()>,
    pub wake: Condvar,
    pub max_stealing_attempts: usize,
}

impl WorkerSharedState {
    pub fn worker_count(&self) -> usize {
        self.injectors.len()
    }

    pub fn is_work_done(&self) -> bool {
        self.pending_job_count.load(Ordering::Acquire) == 0
    }

    pub fn notify_all(&self) {
        let _guard = self.wake_mutex.lock();
        self.wake.notify_all();
    }
}

/// Workers compatible with `metadata`'s affinity bitmask (bit `n` selects worker
/// `n`). `WORKER_AFFINITY_ANY` matches every worker, including worker 0 (the
/// main slot): per the original's affinity example, an `ANY` job may land on
/// the main thread and is serviced when it calls `foreground_work`/`wait`, not
/// by a dedicated background loop.
pub(crate) fn compatible_workers(worker_count: usize, metadata: &JobMetadata) -> Vec<usize> {
    (0..worker_count)
        .filter(|&id| affinity_includes(metadata.worker_affinity, id as u32))
        .collect()
}

/// Picks a worker for `job` via the configured scheduling algorithm, claims it
/// with `mark_scheduled`, and pushes it onto that worker's queue. Shared by
/// `JobSystem::schedule` (the initial, explicit enqueue) and by `execute`'s
/// automatic release of a finished job's children, so both paths agree on how
/// a job actually gets onto a queue. Returns whether the job was enqueued
/// (false if it had already been scheduled by someone else).
pub(crate) fn enqueue(state: &WorkerSharedState, job: JobHandle) -> bool {
    let Some(metadata) = state.jobs.get(job).map(|j| j.metadata) else {
        return false;
    };

    let compatible = compatible_workers(state.worker_count(), &metadata);
    if compatible.is_empty() {
        job_fatal!(
            "job with affinity {:#x} has no compatible worker out of {}",
            metadata.worker_affinity,
            state.worker_count()
        );
    }
    let worker = state.scheduler.pick_worker(&compatible, &metadata, &state.profiles);

    let claimed = state.jobs.get(job).map(|j| j.mark_scheduled(worker)).unwrap_or(false);
    if !claimed {
        return false;
    }

    let estimate_us = state.profiles.estimate_us(metadata.label) as u64;
    state.scheduler.in_flight().add(worker, estimate_us);
    state.pending_job_count.fetch_add(1, Ordering::AcqRel);
    state.injectors[worker].push(job);
    state.notify_all();
    true
}

fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Looks for a job to run: first this worker's own injector, then a bounded
/// number of randomly-chosen peers. Mirrors `kibble`'s `WorkerThread::get_job`
/// (try own queue, then shuffled steal attempts up to a cap) but built on
/// `crossbeam::deque::Injector`, which lets any thread both push into and steal
/// from any worker's queue.
pub(crate) fn find_job(state: &WorkerSharedState, worker_id: usize) -> Option<JobHandle> {
    loop {
        match state.injectors[worker_id].steal() {
            Steal::Success(job) => return Some(job),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }

    let worker_count = state.worker_count();
    if worker_count <= 1 {
        return None;
    }

    let mut rng = (worker_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ 0xDEAD_BEEF;
    let attempts = state.max_stealing_attempts.min(worker_count - 1);

    for _ in 0..attempts {
        rng = xorshift64(rng);
        let peer = (rng as usize) % worker_count;
        if peer == worker_id {
            continue;
        }
        for _ in 0..state.max_stealing_attempts {
            match state.injectors[peer].steal() {
                Steal::Success(job) => {
                    let compatible = state
                        .jobs
                        .get(job)
                        .map(|j| j.is_compatible_with(worker_id as u32))
                        .unwrap_or(true);
                    if compatible {
                        return Some(job);
                    }
                    state.injectors[peer].push(job);
                    continue;
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    None
}

/// Runs one job to completion on the calling thread, if it hasn't already been
/// claimed by someone else. Shared by the worker loop and by preemption: both
/// paths race on `Job::try_claim_for_execution` and whichever wins actually runs
/// the kernel; the loser returns immediately having done nothing. Returns
/// whether *this call* won the race and ran the job, so a preempting caller can
/// tell "I ran it" from "someone else already did".
pub(crate) fn execute(state: &WorkerSharedState, handle: JobHandle, runner_worker_id: usize) -> bool {
    let Some(job) = state.jobs.get(handle) else {
        return false;
    };

    if !job.try_claim_for_execution() {
        return false;
    }

    let kernel = job
        .kernel
        .lock()
        .take()
        .expect("job claimed for execution twice");

    let scheduled_worker = job.scheduled_worker();
    let estimate_us = state.profiles.estimate_us(job.metadata.label) as u64;

    let start = Instant::now();
    let result = std::panic::catch_unwind(AssertUnwindSafe(kernel));
    let elapsed_us = start.elapsed().as_micros() as u64;

    match result {
        Ok(()) => {}
        Err(payload) => {
            let error = ExecutionError::from_panic_payload(payload);
            if let Some(hook) = job.failure_hook.lock().take() {
                hook(error.clone());
            }
            *job.exception.lock() = Some(error);
        }
    }

    job.execution_time_us.store(elapsed_us, Ordering::Release);
    job.mark_finished();

    state.profiles.record(job.metadata.label, elapsed_us);
    if scheduled_worker != usize::MAX {
        state.scheduler.in_flight().remove(scheduled_worker, estimate_us);
    }
    state.monitor.report(ActivityRecord {
        worker: runner_worker_id,
        label: job.metadata.label,
        execution_time_us: elapsed_us,
    });

    if let Some(barrier_handle) = job.barrier() {
        if let Some(barrier) = state.barriers.get(barrier_handle) {
            barrier.remove_dependency();
        }
    }

    let children = job.children();

    let keep_alive = job.keep_alive.load(Ordering::Acquire);
    drop(job);

    state.pending_job_count.fetch_sub(1, Ordering::AcqRel);

    if !keep_alive {
        state.dead_jobs.push(handle);
    }

    state.notify_all();

    // Release any child whose last pending parent just finished. Runs from
    // this (possibly non-owning) worker's context, per the forward-chaining
    // dependency model: a job's children are its dependents, not sub-jobs it
    // waits on.
    for child in children {
        let released = state
            .jobs
            .get(child)
            .map(|child_ref| child_ref.parent_finished())
            .unwrap_or(false);
        if released {
            enqueue(state, child);
        }
    }

    true
}

/// Main loop for a background worker thread: pull work, run it, and sleep on a
/// short condvar timeout when idle rather than spin.
pub(crate) fn worker_loop(state: Arc<WorkerSharedState>, worker_id: usize) {
    forge_core::thread::set_thread_name(format!("forge-worker-{worker_id}"));
    job_verbose!("worker {} started", worker_id);

    loop {
        if let Some(handle) = find_job(&state, worker_id) {
            execute(&state, handle, worker_id);
            continue;
        }

        if state.shutdown.load(Ordering::Acquire) && state.is_work_done() {
            break;
        }

        let mut guard = state.wake_mutex.lock();
        if state.shutdown.load(Ordering::Acquire) && state.is_work_done() {
            break;
        }
        state.wake.wait_for(&mut guard, Duration::from_millis(5));
    }

    job_verbose!("worker {} shut down", worker_id);
}

/// Cooperative processing step for the thread driving `JobSystem::foreground_work`
/// (typically the application's main thread for `WORKER_AFFINITY_MAIN` jobs).
/// Returns whether a job was actually run.
pub(crate) fn foreground_work(state: &WorkerSharedState, worker_id: usize) -> bool {
    match find_job(state, worker_id) {
        Some(handle) => execute(state, handle, worker_id),
        None => false,
    }
}
