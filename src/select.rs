//! Combinators over collections of awaitables.
//!
//! The combinators are polymorphic over container shape through the
//! [`Select`] trait, which extracts an [`Awaitable`] from whatever the
//! collection holds: plain awaitables, references, boxes, pairs keyed by
//! an awaitable, optional slots, or user structs.

use std::cell::Cell;
use std::ptr;
use std::rc::Rc;

use crate::awaitable::{Awaitable, start_async};
use crate::coro;
use crate::error::Failure;

/// Extracts the awaitable to wait on from a collection member.
///
/// Members may opt out by returning `None` (an empty slot); combinators
/// skip them.
pub trait Select {
    fn awaitable(&self) -> Option<&Awaitable>;
}

impl Select for Awaitable {
    fn awaitable(&self) -> Option<&Awaitable> {
        Some(self)
    }
}

impl<T: Select + ?Sized> Select for &T {
    fn awaitable(&self) -> Option<&Awaitable> {
        (**self).awaitable()
    }
}

impl<T: Select + ?Sized> Select for Box<T> {
    fn awaitable(&self) -> Option<&Awaitable> {
        (**self).awaitable()
    }
}

impl<T: Select + ?Sized> Select for Rc<T> {
    fn awaitable(&self) -> Option<&Awaitable> {
        (**self).awaitable()
    }
}

impl<T: Select> Select for Option<T> {
    fn awaitable(&self) -> Option<&Awaitable> {
        self.as_ref().and_then(Select::awaitable)
    }
}

/// Pairs select through their first element, so a `Vec<(Awaitable, T)>`
/// can carry per-operation context.
impl<A: Select, B> Select for (A, B) {
    fn awaitable(&self) -> Option<&Awaitable> {
        self.0.awaitable()
    }
}

/// Awaits every member in collection order.
///
/// The first failure is returned immediately; members not yet observed are
/// left exactly as they are, still owned by the caller.
pub fn wait_all<T: Select>(members: &[T]) -> Result<(), Failure> {
    assert!(
        !coro::on_master(),
        "await is forbidden on the master coroutine"
    );

    for member in members {
        if let Some(awaitable) = member.awaitable() {
            awaitable.wait()?;
        }
    }

    Ok(())
}

/// Suspends until any member is done, returning the index of the first
/// done member in collection order.
///
/// Members already done at entry win without a context switch, earliest
/// index first. A failed member is *not* re-raised here; await the
/// returned member to observe its failure. Returns `None` only when the
/// collection has no selectable members.
pub fn wait_any<T: Select>(members: &[T]) -> Option<usize> {
    assert!(
        !coro::on_master(),
        "await is forbidden on the master coroutine"
    );

    let mut have_pending = false;
    for (index, member) in members.iter().enumerate() {
        let Some(awaitable) = member.awaitable() else {
            continue;
        };
        if awaitable.is_done() {
            return Some(index);
        }
        have_pending = true;
    }

    if !have_pending {
        return None;
    }

    // Register on every pending member, then suspend once. Whichever
    // completer fires first resumes us.
    let caller = coro::current();
    for member in members {
        if let Some(awaitable) = member.awaitable() {
            awaitable.register_awaiter(caller.clone());
        }
    }

    // Covers both the normal resume and a forced unwind tearing through
    // the suspension point: registrations never outlive this call.
    let registrations = Unregister(members);

    coro::yield_master(ptr::null_mut());

    drop(registrations);

    let winner = members.iter().position(|member| {
        member
            .awaitable()
            .map(Awaitable::is_done)
            .unwrap_or(false)
    });

    assert!(
        winner.is_some(),
        "awaiting coroutine resumed with no member done"
    );
    winner
}

struct Unregister<'a, T: Select>(&'a [T]);

impl<T: Select> Drop for Unregister<'_, T> {
    fn drop(&mut self) {
        for member in self.0 {
            if let Some(awaitable) = member.awaitable() {
                awaitable.clear_awaiter();
            }
        }
    }
}

/// Composes a collection into one awaitable that completes when every
/// member has completed, or fails with the first failure.
pub fn async_all(members: Vec<Awaitable>) -> Awaitable {
    start_async("async-all", move || wait_all(&members))
}

/// Composes a collection into one awaitable that completes when any
/// member is done.
///
/// The winning index is published through the returned cell. An empty
/// collection never completes; drop the awaitable to cancel it.
pub fn async_any(members: Vec<Awaitable>) -> (Awaitable, Rc<Cell<Option<usize>>>) {
    let position = Rc::new(Cell::new(None));
    let published = Rc::clone(&position);

    let awaitable = start_async("async-any", move || {
        if members.is_empty() {
            coro::yield_master(ptr::null_mut());
        } else {
            published.set(wait_any(&members));
        }
        Ok(())
    });

    (awaitable, position)
}
