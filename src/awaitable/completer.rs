use std::rc::Weak;

use log::trace;

use super::{Awaitable, AwaitableInner};
use crate::coro;
use crate::error::Failure;
use crate::guard::GuardToken;

/// Capability that drives its awaitable to a terminal state.
///
/// Completers hold their awaitable weakly: once the awaitable is done or
/// destroyed, every outstanding completer is expired and firing it is a
/// no-op. The first non-expired `complete`/`fail` wins.
///
/// A completer must fire on the thread's master coroutine. It is not
/// `Send`; to finish an awaitable from another thread, ship the result
/// over a channel and fire the completer from a master-side action (see
/// the thread handoff demo).
#[derive(Clone)]
pub struct Completer {
    target: Weak<AwaitableInner>,
}

impl Completer {
    pub(crate) fn new(target: Weak<AwaitableInner>) -> Self {
        Self { target }
    }

    /// Completes the awaitable. No-op when expired.
    pub fn complete(&self) {
        self.settle(Ok(()));
    }

    /// Fails the awaitable with `failure`. No-op when expired.
    pub fn fail(&self, failure: impl Into<Failure>) {
        self.settle(Err(failure.into()));
    }

    fn settle(&self, outcome: Result<(), Failure>) {
        let Some(inner) = self.target.upgrade() else {
            trace!("completion for a destroyed awaitable ignored");
            return;
        };

        if inner.is_done() {
            trace!("completion for already-done '{}' ignored", inner.tag);
            return;
        }

        assert!(
            coro::on_master(),
            "completer for '{}' fired off the master coroutine",
            inner.tag
        );

        super::settle(&inner, outcome, true);
    }

    /// True once the awaitable is done or destroyed.
    pub fn is_expired(&self) -> bool {
        match self.target.upgrade() {
            Some(inner) => inner.is_done(),
            None => true,
        }
    }

    /// The awaitable this completer drives, while it is still alive.
    ///
    /// The returned handle shares ownership of the awaitable's state, so
    /// it can be inspected (state, tag, failure) even from code that only
    /// holds the completer.
    pub fn awaitable(&self) -> Option<Awaitable> {
        self.target.upgrade().map(|inner| Awaitable { inner })
    }

    /// Token observing the awaitable's liveness; already blocked when the
    /// awaitable is gone.
    pub fn guard_token(&self) -> GuardToken {
        match self.target.upgrade() {
            Some(inner) => inner.guard.token(),
            None => GuardToken::blocked(),
        }
    }

    /// Adapts a raw callback for an external async API.
    ///
    /// The returned closure checks the guard token, runs `callback`, and
    /// completes or fails the awaitable depending on the returned
    /// `Result`. Arriving after the awaitable died, it does nothing.
    pub fn wrap<A, F>(&self, mut callback: F) -> impl FnMut(A)
    where
        F: FnMut(A) -> Result<(), Failure>,
    {
        let completer = self.clone();
        let token = self.guard_token();

        move |arg| {
            if token.is_blocked() {
                trace!("late callback blocked by guard");
                return;
            }

            match callback(arg) {
                Ok(()) => completer.complete(),
                Err(failure) => completer.fail(failure),
            }
        }
    }
}
