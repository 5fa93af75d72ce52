use std::cell::{Cell, RefCell};
use std::rc::Rc;

use remora::scheduler::{self, Action, Scheduler};
use remora::{Awaitable, start_async};

struct Cleanup {
    log: Rc<RefCell<Vec<&'static str>>>,
    label: &'static str,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.log.borrow_mut().push(self.label);
    }
}

#[test]
fn cancelled_coroutine_unwinds_raii_guards() {
    let log = Rc::new(RefCell::new(Vec::new()));

    let gate = Rc::new(Awaitable::new("gate"));

    let awaited = gate.clone();
    let guard_log = log.clone();
    let op = start_async("op", move || {
        let _cleanup = Cleanup {
            log: guard_log.clone(),
            label: "cleanup",
        };
        awaited.wait()?;
        guard_log.borrow_mut().push("unreachable");
        Ok(())
    });

    // Suspended inside wait(); nothing has been dropped yet.
    assert!(log.borrow().is_empty());

    drop(op);

    assert_eq!(
        *log.borrow(),
        vec!["cleanup"],
        "the coroutine stack must unwind exactly once before drop returns"
    );
    assert!(!gate.is_done(), "the awaited gate is not ours to touch");
}

#[test]
fn nested_cancellation_unwinds_inner_coroutines() {
    let log = Rc::new(RefCell::new(Vec::new()));

    let inner_gate = Rc::new(Awaitable::new("inner-gate"));

    let inner_awaited = inner_gate.clone();
    let outer_log = log.clone();
    let op = start_async("outer", move || {
        let _outer_cleanup = Cleanup {
            log: outer_log.clone(),
            label: "outer-cleanup",
        };

        let inner_log = outer_log.clone();
        let inner_op = start_async("inner", move || {
            let _cleanup = Cleanup {
                log: inner_log.clone(),
                label: "inner-cleanup",
            };
            inner_awaited.wait()?;
            Ok(())
        });

        inner_op.wait()?;
        Ok(())
    });

    // outer awaits inner, inner awaits its gate; both are suspended.
    assert!(log.borrow().is_empty());

    drop(op);

    // Unwinding outer drops its locals in reverse order: the inner
    // awaitable first, which unwinds the inner coroutine in turn, then
    // outer's own guard.
    assert_eq!(*log.borrow(), vec!["inner-cleanup", "outer-cleanup"]);
    assert!(!inner_gate.is_done());
}

struct QueueScheduler {
    queue: Rc<RefCell<Vec<Action>>>,
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, action: Action) {
        self.queue.borrow_mut().push(action);
    }
}

fn pump(queue: &Rc<RefCell<Vec<Action>>>) {
    loop {
        let batch: Vec<Action> = queue.borrow_mut().drain(..).collect();
        if batch.is_empty() {
            return;
        }
        for action in batch {
            action();
        }
    }
}

#[test]
fn dropping_an_unstarted_coroutine_never_runs_it() {
    let queue = Rc::new(RefCell::new(Vec::new()));
    scheduler::init_scheduler(Rc::new(QueueScheduler {
        queue: queue.clone(),
    }));

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    let op = start_async("op", move || {
        flag.set(true);
        Ok(())
    });

    assert!(!ran.get(), "deferred start must not run the body");
    drop(op);

    pump(&queue);
    assert!(!ran.get(), "a cancelled start ticket must not fire");
}

#[test]
fn first_await_starts_the_coroutine_directly() {
    let queue = Rc::new(RefCell::new(Vec::new()));
    scheduler::init_scheduler(Rc::new(QueueScheduler {
        queue: queue.clone(),
    }));

    let log = Rc::new(RefCell::new(Vec::new()));

    let outer_log = log.clone();
    let outer = start_async("outer", move || {
        outer_log.borrow_mut().push("outer");

        let inner_log = outer_log.clone();
        let inner = start_async("inner", move || {
            inner_log.borrow_mut().push("inner");
            Ok(())
        });

        // The queued start for `inner` has not run; awaiting it enters the
        // coroutine directly and cancels that ticket.
        inner.wait()?;
        outer_log.borrow_mut().push("outer-done");
        Ok(())
    });

    assert!(log.borrow().is_empty(), "deferred start must not run bodies");

    pump(&queue);

    assert_eq!(*log.borrow(), vec!["outer", "inner", "outer-done"]);
    assert!(outer.did_complete());
}
