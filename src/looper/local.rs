//! Thread-local parking lot for non-`Send` actions.
//!
//! The loop's queue crosses threads, so everything in it must be `Send`.
//! Runtime actions (coroutine starts, completers) are thread-bound; they
//! stay here, keyed by slot, and only a `Send` trampoline carrying the key
//! travels through the loop. The trampoline fires on the loop thread,
//! which must be the thread that parked the action.

use std::cell::RefCell;

use log::trace;

use crate::scheduler::Action;

thread_local! {
    static SLOTS: RefCell<Slots> = RefCell::new(Slots::new());
}

/// Parks an action on this thread, returning its slot key.
pub(crate) fn defer(action: Action) -> usize {
    SLOTS.with(|slots| slots.borrow_mut().insert(action))
}

/// Takes and runs the action parked under `key`. A consumed or foreign key
/// is a no-op.
pub(crate) fn fire(key: usize) {
    let action = SLOTS.with(|slots| slots.borrow_mut().remove(key));
    match action {
        Some(action) => action(),
        None => trace!("deferred action {key} already consumed"),
    }
}

/// A compact keyed store with slot reuse; a simplified slab.
struct Slots {
    items: Vec<Option<Action>>,
    free: Vec<usize>,
}

impl Slots {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, action: Action) -> usize {
        match self.free.pop() {
            Some(key) => {
                debug_assert!(self.items[key].is_none());
                self.items[key] = Some(action);
                key
            }
            None => {
                self.items.push(Some(action));
                self.items.len() - 1
            }
        }
    }

    fn remove(&mut self, key: usize) -> Option<Action> {
        let action = self.items.get_mut(key)?.take()?;
        self.free.push(key);
        Some(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn fire_consumes_the_slot() {
        let count = Rc::new(Cell::new(0));

        let counter = count.clone();
        let key = defer(Box::new(move || counter.set(counter.get() + 1)));

        fire(key);
        fire(key);
        assert_eq!(count.get(), 1, "a slot must fire at most once");
    }

    #[test]
    fn slots_are_reused() {
        let first = defer(Box::new(|| {}));
        fire(first);

        let second = defer(Box::new(|| {}));
        assert_eq!(first, second);
        fire(second);
    }
}
