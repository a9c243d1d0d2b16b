use fnv::FnvHashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::ThreadId;

static THREAD_NAMES: Lazy<RwLock<FnvHashMap<ThreadId, Arc<String>>>> =
    Lazy::new(|| RwLock::new(FnvHashMap::default()));

/// Associates a human-readable name with the calling thread, so log sinks and the
/// monitor can report worker activity by name instead of by `ThreadId`.
pub fn set_thread_name(name: impl Into<String>) {
    THREAD_NAMES
        .write()
        .insert(std::thread::current().id(), Arc::new(name.into()));
}

pub fn thread_name(id: ThreadId) -> Option<Arc<String>> {
    THREAD_NAMES.read().get(&id).cloned()
}
