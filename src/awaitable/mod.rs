//! Awaitables: handles to in-flight asynchronous operations.
//!
//! An [`Awaitable`] is a four-state machine (`Initial`, `Running`,
//! `Completed`, `Failed`) that a coroutine can suspend on until it reaches
//! a terminal state. It is driven either by a [`Completer`] handed to some
//! external callback, or by the coroutine bound to it by [`start_async`].
//!
//! Ownership is strict: the `Awaitable` is the only strong owner of its
//! shared state and of any coroutine it launched. Dropping it expires all
//! completers and, if the coroutine is still suspended inside its body,
//! force-unwinds its stack before the drop returns.

mod completer;

pub use completer::Completer;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use log::{debug, trace, warn};
use smallvec::SmallVec;

use crate::coro::{self, Coro};
use crate::error::{Failure, ForcedUnwind};
use crate::guard::{Guard, GuardToken};
use crate::scheduler;

type DoneHandler = Box<dyn FnOnce(Result<(), Failure>)>;

enum State {
    Initial,
    Running,
    Completed,
    Failed(Failure),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Initial => "initial",
            State::Running => "running",
            State::Completed => "completed",
            State::Failed(_) => "failed",
        }
    }
}

struct BoundCoro {
    coro: Coro,
    /// Deferred first resume; dropped (cancelled) when `wait` starts the
    /// coroutine directly instead.
    start_ticket: Option<scheduler::Ticket>,
}

pub(crate) struct AwaitableInner {
    tag: String,
    state: RefCell<State>,
    completer_taken: Cell<bool>,
    bound: RefCell<Option<BoundCoro>>,
    awaiting: RefCell<Option<Coro>>,
    handlers: RefCell<SmallVec<[DoneHandler; 2]>>,
    guard: Guard,
}

impl AwaitableInner {
    fn new(tag: &str, state: State) -> Self {
        Self {
            tag: tag.to_string(),
            state: RefCell::new(state),
            completer_taken: Cell::new(false),
            bound: RefCell::new(None),
            awaiting: RefCell::new(None),
            handlers: RefCell::new(SmallVec::new()),
            guard: Guard::new(),
        }
    }

    fn is_done(&self) -> bool {
        matches!(*self.state.borrow(), State::Completed | State::Failed(_))
    }

    fn outcome_if_done(&self) -> Option<Result<(), Failure>> {
        match &*self.state.borrow() {
            State::Completed => Some(Ok(())),
            State::Failed(failure) => Some(Err(failure.clone())),
            _ => None,
        }
    }

    fn register_awaiter(&self, caller: Coro) {
        let mut awaiting = self.awaiting.borrow_mut();
        assert!(
            awaiting.is_none(),
            "awaitable '{}' is already being awaited",
            self.tag
        );
        *awaiting = Some(caller);
    }
}

impl Drop for AwaitableInner {
    fn drop(&mut self) {
        debug!(
            "destroy awaitable '{}' ({})",
            self.tag,
            if self.is_done() { "done" } else { "interrupted" }
        );

        self.guard.block();

        if self.is_done() {
            debug_assert!(
                self.awaiting.borrow().is_none(),
                "terminal awaitable still has an awaiter"
            );
            return;
        }

        // A still-registered awaiter belongs to some other coroutine; its
        // registration simply dies with us.
        self.awaiting.borrow_mut().take();

        let bound = self.bound.borrow_mut().take();
        if let Some(bound) = bound {
            // Cancel a not-yet-fired deferred start.
            drop(bound.start_ticket);

            if bound.coro.is_running() {
                debug!(
                    "unwinding coroutine '{}' of cancelled awaitable",
                    bound.coro.tag()
                );
                bound.coro.set_parent(&coro::current());
                bound.coro.force_unwind();
            }
        }
    }
}

/// Handle to one asynchronous operation and its eventual outcome.
pub struct Awaitable {
    inner: Rc<AwaitableInner>,
}

impl Awaitable {
    /// Creates an awaitable in the `Initial` state. Its completer is still
    /// takeable.
    pub fn new(tag: &str) -> Self {
        Self {
            inner: Rc::new(AwaitableInner::new(tag, State::Initial)),
        }
    }

    /// Creates an already-completed awaitable.
    pub fn completed(tag: &str) -> Self {
        let inner = AwaitableInner::new(tag, State::Completed);
        inner.completer_taken.set(true);
        inner.guard.block();
        Self {
            inner: Rc::new(inner),
        }
    }

    /// Creates an already-failed awaitable carrying `failure`.
    pub fn failed(tag: &str, failure: impl Into<Failure>) -> Self {
        let inner = AwaitableInner::new(tag, State::Failed(failure.into()));
        inner.completer_taken.set(true);
        inner.guard.block();
        Self {
            inner: Rc::new(inner),
        }
    }

    /// Takes the single completer for this awaitable.
    ///
    /// # Panics
    ///
    /// Panics if the completer was already taken, or if the awaitable is
    /// coroutine-backed (those finish through their coroutine).
    pub fn take_completer(&self) -> Completer {
        assert!(
            !self.inner.completer_taken.get(),
            "completer for '{}' already taken",
            self.inner.tag
        );
        debug_assert!(self.inner.bound.borrow().is_none());

        self.inner.completer_taken.set(true);
        Completer::new(Rc::downgrade(&self.inner))
    }

    /// Suspends the calling coroutine until this awaitable is done.
    ///
    /// Returns immediately (without a context switch) when already
    /// terminal; a stored failure is returned again on every call.
    ///
    /// Must be called from a coroutine, never from the master.
    pub fn wait(&self) -> Result<(), Failure> {
        assert!(
            !coro::on_master(),
            "await is forbidden on the master coroutine"
        );

        if let Some(outcome) = self.inner.outcome_if_done() {
            return outcome;
        }

        let caller = coro::current();
        debug!("'{}' awaits '{}'", caller.tag(), self.inner.tag);

        self.inner.register_awaiter(caller);
        // Clears the registration even if a forced unwind rips through the
        // suspension point below.
        let registration = ClearAwaiting(&self.inner);

        // An unstarted bound coroutine can be entered directly: we have to
        // suspend anyway, so skip the trip through the scheduler.
        let direct_start = {
            let mut bound = self.inner.bound.borrow_mut();
            match bound.as_mut() {
                Some(bound) if bound.coro.is_unstarted() => {
                    bound.start_ticket = None;
                    Some(bound.coro.clone())
                }
                _ => None,
            }
        };

        match direct_start {
            Some(coro) => {
                trace!("starting '{}' directly from await", coro.tag());
                coro::yield_to(&coro, ptr::null_mut());
            }
            None => {
                coro::yield_master(ptr::null_mut());
            }
        }

        drop(registration);

        self.inner
            .outcome_if_done()
            .expect("awaiting coroutine resumed before its awaitable finished")
    }

    /// Registers a continuation for the terminal transition.
    ///
    /// Continuations run on the master thread in registration order,
    /// before any awaiting coroutine is resumed; one that panics is
    /// trapped and logged. The transition fires registered continuations
    /// exactly once: registering after the awaitable is already done is a
    /// no-op, check [`is_done`](Self::is_done) first if a late subscriber
    /// needs the outcome.
    pub fn then(&self, handler: impl FnOnce(Result<(), Failure>) + 'static) {
        if self.inner.is_done() {
            trace!(
                "dropping continuation registered on already-done '{}'",
                self.inner.tag
            );
            return;
        }

        self.inner.handlers.borrow_mut().push(Box::new(handler));
    }

    pub fn did_complete(&self) -> bool {
        matches!(*self.inner.state.borrow(), State::Completed)
    }

    pub fn did_fail(&self) -> bool {
        matches!(*self.inner.state.borrow(), State::Failed(_))
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// The stored failure, if any.
    pub fn failure(&self) -> Option<Failure> {
        match &*self.inner.state.borrow() {
            State::Failed(failure) => Some(failure.clone()),
            _ => None,
        }
    }

    /// Identifier used in diagnostics only.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Token observing this awaitable's liveness; blocked once the
    /// awaitable is done or destroyed.
    pub fn guard_token(&self) -> GuardToken {
        self.inner.guard.token()
    }

    pub(crate) fn register_awaiter(&self, caller: Coro) {
        self.inner.register_awaiter(caller);
    }

    pub(crate) fn clear_awaiter(&self) {
        self.inner.awaiting.borrow_mut().take();
    }
}

impl fmt::Debug for Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaitable")
            .field("tag", &self.inner.tag)
            .field("state", &self.inner.state.borrow().name())
            .finish()
    }
}

struct ClearAwaiting<'a>(&'a AwaitableInner);

impl Drop for ClearAwaiting<'_> {
    fn drop(&mut self) {
        self.0.awaiting.borrow_mut().take();
    }
}

/// Drives `inner` to a terminal state: stores the outcome, expires
/// completers, runs continuations, then (on the completer path) resumes a
/// registered awaiter.
pub(crate) fn settle(inner: &Rc<AwaitableInner>, outcome: Result<(), Failure>, resume_awaiter: bool) {
    match &outcome {
        Ok(()) => debug!("complete awaitable '{}'", inner.tag),
        Err(failure) => debug!("fail awaitable '{}': {failure}", inner.tag),
    }

    {
        let mut state = inner.state.borrow_mut();
        debug_assert!(
            !matches!(*state, State::Completed | State::Failed(_)),
            "terminal state is immutable"
        );
        *state = match &outcome {
            Ok(()) => State::Completed,
            Err(failure) => State::Failed(failure.clone()),
        };
    }

    inner.guard.block();

    let handlers = std::mem::take(&mut *inner.handlers.borrow_mut());
    for handler in handlers {
        run_handler(handler, outcome.clone());
    }

    if resume_awaiter {
        let awaiter = inner.awaiting.borrow_mut().take();
        if let Some(awaiter) = awaiter {
            coro::yield_to(&awaiter, ptr::null_mut());
        }
    }
}

fn run_handler(handler: DoneHandler, outcome: Result<(), Failure>) {
    if panic::catch_unwind(AssertUnwindSafe(move || handler(outcome))).is_err() {
        warn!("awaitable continuation panicked; terminal state is unaffected");
    }
}

/// Runs `body` as a coroutine and returns an awaitable for its outcome.
///
/// The coroutine does not start inside this call: the first resume is
/// deferred through the thread's scheduler, and the first `wait` on the
/// returned awaitable starts it directly instead. (Under the inline
/// [`ImmediateScheduler`](crate::ImmediateScheduler) the deferred start
/// collapses to "before this function returns".)
///
/// A normal return completes the awaitable, an `Err` or a panic fails it,
/// and dropping the awaitable while `body` is suspended cancels it by
/// unwinding the coroutine's stack.
pub fn start_async<F>(tag: &str, body: F) -> Awaitable
where
    F: FnOnce() -> Result<(), Failure> + 'static,
{
    start_async_with_stack(tag, coro::default_stack_size(), body)
}

/// [`start_async`] with an explicit stack size for the coroutine.
pub fn start_async_with_stack<F>(tag: &str, stack_size: usize, body: F) -> Awaitable
where
    F: FnOnce() -> Result<(), Failure> + 'static,
{
    let inner = Rc::new(AwaitableInner::new(tag, State::Running));
    inner.completer_taken.set(true);

    debug!("starting async '{tag}'");

    let weak = Rc::downgrade(&inner);
    let coro = Coro::with_stack_size(tag, stack_size, move |_| {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(outcome) => outcome,
            Err(payload) if payload.is::<ForcedUnwind>() => {
                // Cancellation: the awaitable is mid-drop, nothing to
                // record. Keep unwinding so the entry sees it too.
                panic::resume_unwind(payload);
            }
            Err(payload) => Err(Failure::from_panic(payload)),
        };

        if let Some(inner) = weak.upgrade() {
            // The final yield must land on the awaiter (if any) only after
            // this stack has fully unwound, so reparent instead of letting
            // settle resume it from here.
            let awaiter = inner.awaiting.borrow_mut().take();
            if let Some(awaiter) = awaiter {
                coro::current().set_parent(&awaiter);
            }
            settle(&inner, outcome, false);
        }
    });
    coro.set_parent(&coro::master());

    *inner.bound.borrow_mut() = Some(BoundCoro {
        coro,
        start_ticket: None,
    });

    let starter = Rc::downgrade(&inner);
    let ticket = scheduler::schedule_with_ticket(move || {
        // Coroutine starts are dispatched from the master only. An inline
        // scheduler may run this on some other coroutine (nested
        // start_async); leave the start to the first await instead.
        if !coro::on_master() {
            trace!("skipping off-master start; first await will start it");
            return;
        }

        if let Some(inner) = starter.upgrade() {
            let unstarted = {
                let bound = inner.bound.borrow();
                bound
                    .as_ref()
                    .filter(|bound| bound.coro.is_unstarted())
                    .map(|bound| bound.coro.clone())
            };
            if let Some(coro) = unstarted {
                coro::yield_to(&coro, ptr::null_mut());
            }
        }
    });

    if let Some(bound) = inner.bound.borrow_mut().as_mut() {
        bound.start_ticket = Some(ticket);
    }

    Awaitable { inner }
}
