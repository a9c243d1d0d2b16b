use forge_core::pool::Handle;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub type BarrierHandle = Handle<Barrier>;

/// Fan-in synchronization point: jobs registered against a barrier each
/// decrement it on completion, and the barrier is considered finished once the
/// count reaches zero. Barriers are pool-allocated and reused, so `in_use` guards
/// against a stale handle racing a freshly-recycled one.
#[repr(align(64))]
pub struct Barrier {
    pending: AtomicU64,
    in_use: AtomicBool,
}

impl Default for Barrier {
    fn default() -> Self {
        Self {
            pending: AtomicU64::new(0),
            in_use: AtomicBool::new(false),
        }
    }
}

impl Barrier {
    /// Claims this (possibly recycled) barrier slot for a new use. Returns
    /// `false` if it was already claimed, which should never happen for a handle
    /// freshly returned by the pool.
    pub fn claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.pending.store(0, Ordering::Release);
        self.in_use.store(false, Ordering::Release);
    }

    pub fn is_used(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn add_dependencies(&self, count: u64) {
        self.pending.fetch_add(count, Ordering::AcqRel);
    }

    pub fn add_dependency(&self) {
        self.add_dependencies(1);
    }

    /// Returns `true` exactly once: for the dependency whose completion brings
    /// the pending count to zero.
    pub fn remove_dependency(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn is_finished(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}
