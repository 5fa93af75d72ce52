use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use remora::{Awaitable, start_async};

#[test]
fn completion_resumes_awaiting_coroutine() {
    let log = Rc::new(RefCell::new(Vec::new()));

    let target = Rc::new(Awaitable::new("target"));
    let completer = target.take_completer();

    let awaited = target.clone();
    let observed = log.clone();
    let op = start_async("op", move || {
        awaited.wait()?;
        observed.borrow_mut().push("done");
        Ok(())
    });

    // The inline scheduler already ran the coroutine up to its await.
    assert!(log.borrow().is_empty(), "no work may happen before completion");
    assert!(!target.is_done());
    assert!(!op.is_done());

    completer.complete();

    assert_eq!(*log.borrow(), vec!["done"]);
    assert!(target.did_complete());
    assert!(op.did_complete());
}

#[test]
fn failure_propagates_and_re_raises() {
    let log = Rc::new(RefCell::new(Vec::new()));

    let target = Rc::new(Awaitable::new("target"));
    let completer = target.take_completer();

    let awaited = target.clone();
    let observed = log.clone();
    let op = start_async("op", move || {
        let first = awaited.wait().expect_err("first await must fail");
        observed.borrow_mut().push(format!("first: {first}"));

        let second = awaited.wait().expect_err("re-await must raise again");
        observed.borrow_mut().push(format!("second: {second}"));

        Ok(())
    });

    completer.fail(io::Error::new(io::ErrorKind::Other, "boom"));

    assert_eq!(*log.borrow(), vec!["first: boom", "second: boom"]);
    assert!(op.did_complete(), "observer coroutine must finish cleanly");

    assert!(target.did_fail());
    let failure = target.failure().expect("failed awaitable stores its error");
    assert!(
        failure.downcast_ref::<io::Error>().is_some(),
        "original error type must survive"
    );
}

#[test]
fn await_on_terminal_returns_without_switching() {
    let log = Rc::new(RefCell::new(Vec::new()));

    let done = Rc::new(Awaitable::completed("done"));

    let awaited = done.clone();
    let observed = log.clone();
    let op = start_async("op", move || {
        awaited.wait()?;
        observed.borrow_mut().push("after");
        Ok(())
    });

    // If wait() had suspended, the coroutine would still be parked here:
    // nothing else ever resumes it.
    assert_eq!(*log.borrow(), vec!["after"]);
    assert!(op.did_complete());
}

#[test]
fn terminal_state_is_immutable() {
    let target = Awaitable::new("target");
    let completer = target.take_completer();

    completer.complete();
    assert!(target.did_complete());

    // Terminal transitions are monotonic: later calls are no-ops.
    completer.fail(io::Error::new(io::ErrorKind::Other, "late"));
    assert!(target.did_complete());
    assert!(!target.did_fail());
    assert!(target.failure().is_none());
}

#[test]
fn body_error_fails_the_awaitable() {
    let op = start_async("op", || {
        Err(io::Error::new(io::ErrorKind::Other, "sad").into())
    });

    assert!(op.did_fail());
    assert_eq!(op.failure().expect("stored error").to_string(), "sad");
}

#[test]
fn body_panic_fails_the_awaitable() {
    let op = start_async("op", || panic!("blew up"));

    assert!(op.did_fail());
    let failure = op.failure().expect("stored error");
    assert!(
        failure.is::<remora::PanicError>(),
        "panic must surface as a panic error, got: {failure}"
    );
    assert!(failure.to_string().contains("blew up"));
}

#[test]
#[should_panic(expected = "master")]
fn await_on_master_is_a_contract_violation() {
    let pending = Awaitable::new("pending");
    let _ = pending.wait();
}

#[test]
fn chained_async_operations() {
    let log = Rc::new(RefCell::new(Vec::new()));

    let first_log = log.clone();
    let first = Rc::new(start_async("first", move || {
        first_log.borrow_mut().push("first");
        Ok(())
    }));

    let chained = first.clone();
    let second_log = log.clone();
    let second = start_async("second", move || {
        chained.wait()?;
        second_log.borrow_mut().push("second");
        Ok(())
    });

    assert!(second.did_complete());
    assert_eq!(*log.borrow(), vec!["first", "second"]);
}
