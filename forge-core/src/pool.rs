use array_init::array_init;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::marker::PhantomData;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

enum Slot<T> {
    Occupied(u16, T),
    Vacant(u16),
}

struct Page<T, const PAGE_SIZE: usize> {
    slots: Box<[RwLock<Slot<T>>; PAGE_SIZE]>,
}

impl<T, const PAGE_SIZE: usize> Page<T, PAGE_SIZE> {
    fn new() -> Self {
        Self {
            slots: Box::new(array_init(|_| RwLock::new(Slot::Vacant(0)))),
        }
    }
}

/// Stable reference into a [`Pool`]. Carries a generation counter so a handle into a
/// slot that has since been freed and reused is detected rather than silently
/// aliasing the new occupant.
pub struct Handle<T> {
    page: u32,
    slot: u32,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(page: u32, slot: u32, generation: u16) -> Self {
        Self {
            page,
            slot,
            generation,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.page == other.page && self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.page.hash(state);
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("page", &self.page)
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Fixed-capacity, paged object pool with generational handles.
///
/// Capacity is set once at construction: pages are allocated up front and never
/// grown, so [`Pool::get`] never races a reallocation and needs no lock of its own
/// beyond the per-slot `RwLock` that guards the occupant. Allocation and release
/// only touch a single shared free-list.
pub struct Pool<T, const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    pages: Vec<Page<T, PAGE_SIZE>>,
    free_list: Mutex<VecDeque<(u32, u32)>>,
}

impl<T, const PAGE_SIZE: usize> Pool<T, PAGE_SIZE> {
    /// Builds a pool able to hold at least `capacity` live elements, rounded up to
    /// a whole number of pages.
    pub fn with_capacity(capacity: usize) -> Self {
        let page_count = (capacity + PAGE_SIZE - 1) / PAGE_SIZE.max(1);
        let page_count = page_count.max(1);
        let mut pages = Vec::with_capacity(page_count);
        let mut free_list = VecDeque::with_capacity(page_count * PAGE_SIZE);

        for page in 0..page_count {
            pages.push(Page::new());
            for slot in 0..PAGE_SIZE {
                free_list.push_back((page as u32, slot as u32));
            }
        }

        Self {
            pages,
            free_list: Mutex::new(free_list),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// Inserts `value`, returning `None` if the pool is exhausted (the caller
    /// decides whether that is fatal).
    pub fn insert(&self, value: T) -> Option<Handle<T>> {
        let (page, slot) = self.free_list.lock().pop_front()?;
        let mut guard = self.pages[page as usize].slots[slot as usize].write();
        let generation = match *guard {
            Slot::Vacant(generation) => generation,
            Slot::Occupied(..) => unreachable!("free-list pointed at an occupied slot"),
        };
        *guard = Slot::Occupied(generation, value);
        Some(Handle::new(page, slot, generation))
    }

    pub fn get(&self, handle: Handle<T>) -> Option<parking_lot::MappedRwLockReadGuard<'_, T>> {
        let slot = self.pages.get(handle.page as usize)?.slots[handle.slot as usize].read();
        match &*slot {
            Slot::Occupied(generation, _) if *generation == handle.generation => {
                Some(parking_lot::RwLockReadGuard::map(slot, |s| match s {
                    Slot::Occupied(_, value) => value,
                    Slot::Vacant(_) => unreachable!(),
                }))
            }
            _ => None,
        }
    }

    pub fn get_mut(&self, handle: Handle<T>) -> Option<parking_lot::MappedRwLockWriteGuard<'_, T>> {
        let slot = self.pages.get(handle.page as usize)?.slots[handle.slot as usize].write();
        match &*slot {
            Slot::Occupied(generation, _) if *generation == handle.generation => {
                Some(parking_lot::RwLockWriteGuard::map(slot, |s| match s {
                    Slot::Occupied(_, value) => value,
                    Slot::Vacant(_) => unreachable!(),
                }))
            }
            _ => None,
        }
    }

    /// Frees the slot behind `handle`, bumping its generation so stale handles are
    /// rejected by future `get`/`get_mut` calls. Returns the freed value, or `None`
    /// if the handle was already stale.
    pub fn remove(&self, handle: Handle<T>) -> Option<T> {
        let page = self.pages.get(handle.page as usize)?;
        let mut guard = page.slots[handle.slot as usize].write();
        match &*guard {
            Slot::Occupied(generation, _) if *generation == handle.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = std::mem::replace(&mut *guard, Slot::Vacant(next_generation));
                drop(guard);
                self.free_list.lock().push_back((handle.page, handle.slot));
                match old {
                    Slot::Occupied(_, value) => Some(value),
                    Slot::Vacant(_) => None,
                }
            }
            _ => None,
        }
    }

    pub fn is_valid(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::Pool;

    #[test]
    fn insert_get_remove_roundtrip() {
        let pool: Pool<u32, 8> = Pool::with_capacity(8);
        let handle = pool.insert(42).unwrap();
        assert_eq!(*pool.get(handle).unwrap(), 42);
        assert_eq!(pool.remove(handle), Some(42));
        assert!(pool.get(handle).is_none());
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let pool: Pool<u32, 4> = Pool::with_capacity(4);
        let first = pool.insert(1).unwrap();
        pool.remove(first).unwrap();
        let second = pool.insert(2).unwrap();

        assert!(pool.get(first).is_none());
        assert_eq!(*pool.get(second).unwrap(), 2);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool: Pool<u32, 2> = Pool::with_capacity(2);
        pool.insert(1).unwrap();
        pool.insert(2).unwrap();
        assert!(pool.insert(3).is_none());
    }

    #[test]
    fn multiple_pages_share_one_free_list() {
        let pool: Pool<u32, 4> = Pool::with_capacity(10);
        assert_eq!(pool.capacity(), 12);
        let handles: Vec<_> = (0..12).map(|i| pool.insert(i).unwrap()).collect();
        assert!(pool.insert(99).is_none());
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(*pool.get(*handle).unwrap(), i as u32);
        }
    }
}
