use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use context::stack::ProtectedFixedSizeStack;
use log::trace;

/// Smallest stack handed out, regardless of what was requested.
pub const MINIMUM_STACK_SIZE: usize = 16 * 1024;

const BUILTIN_DEFAULT_STACK_SIZE: usize = 256 * 1024;

static DEFAULT_STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Stack size used by coroutines created without an explicit size.
pub fn default_stack_size() -> usize {
    match DEFAULT_STACK_SIZE.load(Ordering::Relaxed) {
        0 => BUILTIN_DEFAULT_STACK_SIZE,
        size => size,
    }
}

/// Overrides the default stack size for subsequently created coroutines.
///
/// Values below [`MINIMUM_STACK_SIZE`] are clamped up.
pub fn set_default_stack_size(size: usize) {
    DEFAULT_STACK_SIZE.store(size.max(MINIMUM_STACK_SIZE), Ordering::Relaxed);
}

/// Frees every cached stack buffer.
pub fn drain_stack_pool() {
    pool().lock().expect("stack pool poisoned").drain();
}

/// A guard-paged stack borrowed from the process-wide pool.
///
/// Returned to the pool on drop, so stacks are recycled across short-lived
/// coroutines instead of being mapped and unmapped each time.
pub(crate) struct PooledStack {
    stack: Option<ProtectedFixedSizeStack>,
    size: usize,
}

impl PooledStack {
    pub(crate) fn inner(&self) -> &ProtectedFixedSizeStack {
        self.stack.as_ref().expect("pooled stack already recycled")
    }
}

impl Drop for PooledStack {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            trace!("recycled stack of {} bytes", self.size);
            pool()
                .lock()
                .expect("stack pool poisoned")
                .recycle(self.size, stack);
        }
    }
}

/// Takes the smallest pooled stack that satisfies `min_size`, allocating a
/// fresh guard-paged stack when nothing cached fits.
pub(crate) fn obtain(min_size: usize) -> PooledStack {
    let min_size = min_size.max(MINIMUM_STACK_SIZE);

    let pooled = pool()
        .lock()
        .expect("stack pool poisoned")
        .take_at_least(min_size);

    let (size, stack) = match pooled {
        Some(found) => found,
        None => {
            let stack = ProtectedFixedSizeStack::new(min_size)
                .expect("failed to allocate coroutine stack");
            (min_size, stack)
        }
    };

    trace!("obtained stack of {size} bytes");

    PooledStack {
        stack: Some(stack),
        size,
    }
}

struct StackPool {
    stacks: BTreeMap<usize, Vec<ProtectedFixedSizeStack>>,
}

// A pooled stack has no thread affinity while nothing runs on it, so the
// pool may hand buffers across threads even though the raw stack type does
// not declare it.
unsafe impl Send for StackPool {}

impl StackPool {
    const fn new() -> Self {
        Self {
            stacks: BTreeMap::new(),
        }
    }

    fn take_at_least(&mut self, min_size: usize) -> Option<(usize, ProtectedFixedSizeStack)> {
        let size = *self.stacks.range(min_size..).next()?.0;

        let bucket = self.stacks.get_mut(&size).expect("bucket vanished");
        let stack = bucket.pop().expect("empty bucket left in pool");
        if bucket.is_empty() {
            self.stacks.remove(&size);
        }

        Some((size, stack))
    }

    fn recycle(&mut self, size: usize, stack: ProtectedFixedSizeStack) {
        self.stacks.entry(size).or_default().push(stack);
    }

    fn drain(&mut self) {
        self.stacks.clear();
    }
}

fn pool() -> &'static Mutex<StackPool> {
    static POOL: Mutex<StackPool> = Mutex::new(StackPool::new());
    &POOL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(size: usize) -> ProtectedFixedSizeStack {
        ProtectedFixedSizeStack::new(size).expect("stack allocation failed")
    }

    #[test]
    fn empty_pool_has_nothing_to_take() {
        let mut pool = StackPool::new();
        assert!(pool.take_at_least(MINIMUM_STACK_SIZE).is_none());
    }

    #[test]
    fn recycles_buffers() {
        let mut pool = StackPool::new();
        let size = MINIMUM_STACK_SIZE * 2;

        pool.recycle(size, alloc(size));

        let reused = pool.take_at_least(size).map(|(reused_size, _)| reused_size);
        assert_eq!(reused, Some(size));
        assert!(pool.take_at_least(size).is_none(), "buffer handed out twice");
    }

    #[test]
    fn smallest_fit_wins() {
        let mut pool = StackPool::new();
        pool.recycle(MINIMUM_STACK_SIZE * 8, alloc(MINIMUM_STACK_SIZE * 8));
        pool.recycle(MINIMUM_STACK_SIZE * 4, alloc(MINIMUM_STACK_SIZE * 4));

        let taken = pool
            .take_at_least(MINIMUM_STACK_SIZE * 3)
            .map(|(size, _)| size);
        assert_eq!(
            taken,
            Some(MINIMUM_STACK_SIZE * 4),
            "pool must prefer the smallest stack that fits"
        );
    }

    #[test]
    fn too_small_buffers_are_skipped() {
        let mut pool = StackPool::new();
        pool.recycle(MINIMUM_STACK_SIZE, alloc(MINIMUM_STACK_SIZE));

        assert!(pool.take_at_least(MINIMUM_STACK_SIZE * 2).is_none());
        pool.drain();
    }
}
