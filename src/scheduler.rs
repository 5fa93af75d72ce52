//! Pluggable single-step action dispatch.
//!
//! The runtime never drives a loop of its own; it hands deferred work
//! (coroutine starts, completions posted from callbacks) to whatever
//! [`Scheduler`] is installed on the thread. The default
//! [`ImmediateScheduler`] runs actions inline; a [`Looper`](crate::Looper)
//! can be installed instead via [`Looper::scheduler`](crate::Looper::scheduler)
//! so actions run on the next loop tick.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::trace;

/// A deferred nullary action. Runs on the thread that scheduled it.
pub type Action = Box<dyn FnOnce() + 'static>;

/// Dispatches actions to run later on this thread's master coroutine.
///
/// Implementations must preserve submission order: `schedule(a)` then
/// `schedule(b)` implies `a` does not run after `b`.
pub trait Scheduler {
    fn schedule(&self, action: Action);
}

/// Degenerate scheduler that runs every action inline.
///
/// This is the default. It collapses "later" into "now", which is fine for
/// tests and simple programs but means deferred work (such as a coroutine
/// start) happens before the scheduling call returns.
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, action: Action) {
        action();
    }
}

thread_local! {
    static SCHEDULER: RefCell<Option<Rc<dyn Scheduler>>> = const { RefCell::new(None) };
}

/// Installs the scheduler used by this thread's runtime.
pub fn init_scheduler(scheduler: Rc<dyn Scheduler>) {
    SCHEDULER.with(|cell| *cell.borrow_mut() = Some(scheduler));
}

/// Schedules an action through the thread's scheduler.
pub fn schedule(action: impl FnOnce() + 'static) {
    let scheduler = SCHEDULER.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(|| Rc::new(ImmediateScheduler))
            .clone()
    });

    scheduler.schedule(Box::new(action));
}

/// Handle to a scheduled action; dropping it cancels the action.
///
/// The scheduler only ever holds the action weakly, so once the ticket is
/// gone the queued entry degrades to a no-op.
pub(crate) struct Ticket {
    _action: Rc<RefCell<Option<Action>>>,
}

/// Schedules an action that can be revoked by dropping the returned ticket.
pub(crate) fn schedule_with_ticket(action: impl FnOnce() + 'static) -> Ticket {
    let slot: Rc<RefCell<Option<Action>>> = Rc::new(RefCell::new(Some(Box::new(action))));
    let weak: Weak<RefCell<Option<Action>>> = Rc::downgrade(&slot);

    schedule(move || match weak.upgrade().and_then(|s| s.borrow_mut().take()) {
        Some(action) => action(),
        None => trace!("skipping cancelled action"),
    });

    Ticket { _action: slot }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn immediate_scheduler_runs_inline() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();

        ImmediateScheduler.schedule(Box::new(move || flag.set(true)));
        assert!(ran.get());
    }

    #[test]
    fn dropped_ticket_cancels() {
        // A queueing scheduler: actions run only when pumped.
        struct Queue(Rc<RefCell<Vec<Action>>>);
        impl Scheduler for Queue {
            fn schedule(&self, action: Action) {
                self.0.borrow_mut().push(action);
            }
        }

        let queue = Rc::new(RefCell::new(Vec::new()));
        init_scheduler(Rc::new(Queue(queue.clone())));

        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let ticket = schedule_with_ticket(move || flag.set(true));

        drop(ticket);

        for action in queue.borrow_mut().drain(..) {
            action();
        }
        assert!(!ran.get(), "cancelled action must not run");

        // Restore the default for other tests on this thread.
        init_scheduler(Rc::new(ImmediateScheduler));
    }
}
