use forge_core::pool::Pool;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PROMISE_POOL_CAPACITY: usize = 1024;

/// A kernel panic, captured at the `catch_unwind` boundary and carried into the
/// job's future instead of unwinding across worker threads.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub(crate) fn from_panic_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "job panicked with a non-string payload".to_string()
        };
        Self { message }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job execution failed: {}", self.message)
    }
}

impl std::error::Error for ExecutionError {}

enum PromiseState<T> {
    Pending,
    Ready(T),
    Failed(ExecutionError),
}

struct Promise<T> {
    state: Mutex<PromiseState<T>>,
    condvar: Condvar,
    refcount: AtomicUsize,
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(PromiseState::Pending),
            condvar: Condvar::new(),
            refcount: AtomicUsize::new(0),
        }
    }
}

/// Registry of one bounded promise pool per concrete `T`. Rust has no
/// function-local static parameterized over a generic (the pattern the original
/// per-type promise pools relied on), so pools are looked up by `TypeId` instead.
static PROMISE_POOLS: Lazy<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn promise_pool<T: Send + Sync + 'static>() -> Arc<Pool<Promise<T>>> {
    let type_id = TypeId::of::<T>();

    if let Some(pool) = PROMISE_POOLS.read().get(&type_id) {
        return pool.clone().downcast::<Pool<Promise<T>>>().unwrap();
    }

    let mut pools = PROMISE_POOLS.write();
    let entry = pools
        .entry(type_id)
        .or_insert_with(|| Arc::new(Pool::<Promise<T>>::with_capacity(PROMISE_POOL_CAPACITY)) as Arc<dyn Any + Send + Sync>);
    entry.clone().downcast::<Pool<Promise<T>>>().unwrap()
}

/// Handle to a value (or exception) produced by exactly one job, shared by every
/// consumer that depends on it. Cloning is cheap: all clones reference the same
/// pool slot, and `get` blocks until the producing job completes.
pub struct SharedFuture<T: Send + Sync + 'static> {
    pool: Arc<Pool<Promise<T>>>,
    handle: forge_core::pool::Handle<Promise<T>>,
}

impl<T: Send + Sync + 'static> SharedFuture<T> {
    pub(crate) fn new() -> Self {
        let pool = promise_pool::<T>();
        let handle = pool
            .insert(Promise::default())
            .expect("promise pool exhausted");
        if let Some(promise) = pool.get(handle) {
            promise.refcount.store(1, Ordering::Release);
        }
        Self { pool, handle }
    }

    pub(crate) fn fulfill(&self, value: T) {
        if let Some(promise) = self.pool.get(self.handle) {
            *promise.state.lock() = PromiseState::Ready(value);
            promise.condvar.notify_all();
        }
    }

    pub(crate) fn fail(&self, error: ExecutionError) {
        if let Some(promise) = self.pool.get(self.handle) {
            *promise.state.lock() = PromiseState::Failed(error);
            promise.condvar.notify_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        match self.pool.get(self.handle) {
            Some(promise) => !matches!(*promise.state.lock(), PromiseState::Pending),
            None => true,
        }
    }
}

impl<T: Send + Sync + Clone + 'static> SharedFuture<T> {
    /// Blocks the calling thread until the job that owns this future completes,
    /// then returns its value, or the captured `ExecutionError` if it panicked.
    pub fn get(&self) -> Result<T, ExecutionError> {
        let promise = self
            .pool
            .get(self.handle)
            .expect("future polled after its promise was released");
        let mut state = promise.state.lock();
        loop {
            match &*state {
                PromiseState::Pending => promise.condvar.wait(&mut state),
                PromiseState::Ready(value) => return Ok(value.clone()),
                PromiseState::Failed(error) => return Err(error.clone()),
            }
        }
    }
}

impl<T: Send + Sync + 'static> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        if let Some(promise) = self.pool.get(self.handle) {
            promise.refcount.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            pool: self.pool.clone(),
            handle: self.handle,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for SharedFuture<T> {
    fn drop(&mut self) {
        let should_remove = match self.pool.get(self.handle) {
            Some(promise) => promise.refcount.fetch_sub(1, Ordering::AcqRel) == 1,
            None => false,
        };
        if should_remove {
            self.pool.remove(self.handle);
        }
    }
}
