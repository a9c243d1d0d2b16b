use crate::future::ExecutionError;
use forge_core::pool::Handle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Physical worker slot index reserved for `JobSystem::foreground_work`: it has
/// no background loop of its own, see `lib.rs::JobSystem::new`.
pub const MAIN_WORKER_ID: usize = 0;

/// One bit per worker (bit `n` selects worker `n`). Run anywhere; the scheduler
/// picks among every worker, including the main slot.
pub const WORKER_AFFINITY_ANY: u32 = u32::MAX;
/// Bit 0 only: must run on the thread that drives `JobSystem::foreground_work`.
pub const WORKER_AFFINITY_MAIN: u32 = 1;
/// Every bit except bit 0: must run on a background worker, never the main
/// thread.
pub const WORKER_AFFINITY_ASYNC: u32 = WORKER_AFFINITY_ANY & !WORKER_AFFINITY_MAIN;

/// Whether `affinity` permits `worker_id` to run the job. `ANY` matches every
/// worker id, including ones beyond bit 31 (the bitmask otherwise only
/// addresses workers 0..32). Shared by `Job::is_compatible_with` and the
/// scheduler's `compatible_workers` so both apply the exact same rule.
pub fn affinity_includes(affinity: u32, worker_id: u32) -> bool {
    if affinity == WORKER_AFFINITY_ANY {
        return true;
    }
    match 1u32.checked_shl(worker_id) {
        Some(bit) => affinity & bit != 0,
        None => false,
    }
}

pub type JobHandle = Handle<Job>;

/// Static description of a job, independent of any particular run.
#[derive(Debug, Clone, Copy)]
pub struct JobMetadata {
    pub label: u64,
    pub worker_affinity: u32,
}

impl JobMetadata {
    pub fn new(label: u64) -> Self {
        Self {
            label,
            worker_affinity: WORKER_AFFINITY_ANY,
        }
    }

    pub fn with_affinity(mut self, worker_affinity: u32) -> Self {
        self.worker_affinity = worker_affinity;
        self
    }
}

/// A job's lifecycle, encoded so preemption can claim a job exactly once with a
/// single compare-exchange: whichever side (owning worker, or a preempting
/// caller) wins the CAS from `Scheduled` to `Executing` runs the kernel; the loser
/// silently skips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionState {
    Pending = 0,
    Scheduled = 1,
    Executing = 2,
    Finished = 3,
}

impl ExecutionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutionState::Pending,
            1 => ExecutionState::Scheduled,
            2 => ExecutionState::Executing,
            3 => ExecutionState::Finished,
            _ => unreachable!("invalid execution state"),
        }
    }
}

pub(crate) type Kernel = Box<dyn FnOnce() + Send>;
pub(crate) type FailureHook = Box<dyn FnOnce(ExecutionError) + Send>;

pub struct Job {
    pub metadata: JobMetadata,
    pub(crate) kernel: Mutex<Option<Kernel>>,
    pub(crate) failure_hook: Mutex<Option<FailureHook>>,
    state: AtomicU8,
    /// Number of this job's parents that have not yet finished. The job becomes
    /// schedulable once this reaches zero.
    dependency_count: AtomicU64,
    children: Mutex<Vec<JobHandle>>,
    barrier: Mutex<Option<crate::barrier::BarrierHandle>>,
    pub(crate) exception: Mutex<Option<ExecutionError>>,
    pub(crate) execution_time_us: AtomicU64,
    /// Daemon jobs are re-scheduled by `DaemonScheduler` instead of being
    /// released by the garbage collector once `Finished`.
    pub(crate) keep_alive: std::sync::atomic::AtomicBool,
    /// Worker the scheduler assigned this job to, so a preempting caller that
    /// runs it on a different thread still credits the right worker's in-flight
    /// load counter.
    pub(crate) scheduled_worker: std::sync::atomic::AtomicUsize,
}

impl Job {
    pub fn new(metadata: JobMetadata, kernel: Kernel) -> Self {
        Self {
            metadata,
            kernel: Mutex::new(Some(kernel)),
            failure_hook: Mutex::new(None),
            state: AtomicU8::new(ExecutionState::Pending as u8),
            dependency_count: AtomicU64::new(0),
            children: Mutex::new(Vec::new()),
            barrier: Mutex::new(None),
            exception: Mutex::new(None),
            execution_time_us: AtomicU64::new(0),
            keep_alive: std::sync::atomic::AtomicBool::new(false),
            scheduled_worker: std::sync::atomic::AtomicUsize::new(usize::MAX),
        }
    }

    pub fn state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ExecutionState::Finished
    }

    /// Transitions `Pending -> Scheduled`. Called once, by whoever pushes the job
    /// onto a worker queue.
    pub(crate) fn mark_scheduled(&self, worker: usize) -> bool {
        let claimed = self
            .state
            .compare_exchange(
                ExecutionState::Pending as u8,
                ExecutionState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            self.scheduled_worker.store(worker, Ordering::Release);
        }
        claimed
    }

    pub(crate) fn scheduled_worker(&self) -> usize {
        self.scheduled_worker.load(Ordering::Acquire)
    }

    /// Claims the job for execution. Both the owning worker (popping its own
    /// queue) and a preempting caller race on this CAS; exactly one wins.
    pub(crate) fn try_claim_for_execution(&self) -> bool {
        self.state
            .compare_exchange(
                ExecutionState::Scheduled as u8,
                ExecutionState::Executing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_finished(&self) {
        self.state.store(ExecutionState::Finished as u8, Ordering::Release);
    }

    pub(crate) fn push_child(&self, child: JobHandle) {
        self.children.lock().push(child);
    }

    pub fn children(&self) -> Vec<JobHandle> {
        self.children.lock().clone()
    }

    pub(crate) fn dependency_count(&self) -> u64 {
        self.dependency_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_dependency(&self) {
        self.dependency_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the dependency count; returns `true` exactly once, for
    /// whichever parent's completion brings it to zero (the job becomes
    /// schedulable).
    pub(crate) fn parent_finished(&self) -> bool {
        self.dependency_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn set_barrier(&self, barrier: crate::barrier::BarrierHandle) {
        *self.barrier.lock() = Some(barrier);
    }

    pub fn barrier(&self) -> Option<crate::barrier::BarrierHandle> {
        *self.barrier.lock()
    }

    /// Rewinds a finished job back to `Pending` with a fresh kernel, so the
    /// daemon scheduler can run the same job slot again instead of allocating a
    /// new one every cycle.
    pub(crate) fn reset_for_reschedule(&self, kernel: Kernel) {
        *self.kernel.lock() = Some(kernel);
        *self.exception.lock() = None;
        self.scheduled_worker.store(usize::MAX, Ordering::Release);
        self.state.store(ExecutionState::Pending as u8, Ordering::Release);
    }

    pub fn is_compatible_with(&self, worker_id: u32) -> bool {
        affinity_includes(self.metadata.worker_affinity, worker_id)
    }
}
