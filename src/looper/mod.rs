//! Cooperative, ticketed event loop.
//!
//! A [`Looper`] drives wall-clock triggered actions on a single thread.
//! Producers on any thread may schedule one-shot or repeating actions;
//! exactly one thread calls [`Looper::run`] and becomes the loop (and
//! master-coroutine) thread. Each tick promotes due actions into a batch
//! ordered by trigger time (tickets break ties), executes the batch
//! outside the lock, then sleeps until the next trigger or a wake-up.

mod local;
mod queue;

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::awaitable::Awaitable;
use crate::scheduler::{Action, Scheduler};
use queue::{Entry, LoopState};

/// Identifier of a scheduled action, unique for the lifetime of its loop.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Ticket(u64);

struct Shared {
    name: String,
    state: Mutex<LoopState>,
    cond: Condvar,
}

/// Handle to a cooperative event loop. Cheap to clone and share across
/// threads.
#[derive(Clone)]
pub struct Looper {
    shared: Arc<Shared>,
}

impl Looper {
    pub fn new(name: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: Mutex::new(LoopState::new()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Schedules a one-shot action to run after `delay`. Thread-safe.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> Ticket {
        let mut action = Some(action);
        self.submit(delay, Duration::ZERO, false, move || {
            if let Some(action) = action.take() {
                action();
            }
            false
        })
    }

    /// Schedules a repeating action. Thread-safe.
    ///
    /// After the initial `delay`, `predicate` runs and keeps being
    /// rescheduled every `interval` for as long as it returns `true`.
    /// With `catch_up` set, the next trigger advances from the previous
    /// trigger, so a slow tick bunches up subsequent fires; otherwise it
    /// advances from the time the tick finished.
    pub fn schedule_repeating(
        &self,
        delay: Duration,
        interval: Duration,
        catch_up: bool,
        predicate: impl FnMut() -> bool + Send + 'static,
    ) -> Ticket {
        self.submit(delay, interval, catch_up, predicate)
    }

    fn submit(
        &self,
        delay: Duration,
        interval: Duration,
        catch_up: bool,
        action: impl FnMut() -> bool + Send + 'static,
    ) -> Ticket {
        let mut state = self.lock();
        let ticket = state.take_ticket();

        state.queued.push(Entry {
            ticket,
            trigger: Instant::now() + delay,
            interval,
            catch_up,
            cancelled: false,
            action: Box::new(action),
        });

        trace!("{}: scheduled ticket {ticket}", self.shared.name);
        self.shared.cond.notify_all();

        Ticket(ticket)
    }

    /// Cancels a scheduled action.
    ///
    /// Returns `true` when a live entry was cancelled. Cancelling the
    /// entry that is executing right now does not interrupt the running
    /// invocation but suppresses any further repeats.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let mut state = self.lock();

        if state.executing == Some(ticket.0) {
            let was_live = !state.executing_cancelled;
            state.executing_cancelled = true;
            return was_live;
        }

        state.cancel(ticket.0)
    }

    /// Cancels every scheduled action.
    pub fn cancel_all(&self) {
        self.lock().cancel_all();
    }

    /// Cooperatively requests [`run`](Self::run) to return. Thread-safe.
    pub fn quit(&self) {
        debug!("{}: quit requested", self.shared.name);
        self.lock().quit = true;
        self.shared.cond.notify_all();
    }

    /// Drives the loop on the calling thread until [`quit`](Self::quit).
    ///
    /// # Panics
    ///
    /// Panics if the loop is already running on some thread. A panic
    /// inside a scheduled action propagates out of `run`.
    pub fn run(&self) {
        {
            let mut state = self.lock();
            assert!(
                !state.running,
                "{}: run() called while the loop is running",
                self.shared.name
            );
            state.running = true;
            state.quit = false;
            state.thread = Some(thread::current().id());
        }

        debug!("{}: loop running", self.shared.name);
        let _reset = RunGuard(self);

        loop {
            // Find something due, sleeping until the next trigger.
            let mut entry = {
                let mut state = self.lock();
                loop {
                    if state.quit {
                        return;
                    }

                    let now = Instant::now();
                    state.promote_due(now);

                    if let Some(entry) = state.pending.pop() {
                        state.executing = Some(entry.ticket);
                        state.executing_cancelled = false;
                        break entry;
                    }

                    state = match state.next_trigger() {
                        Some(trigger) => {
                            let timeout = trigger.saturating_duration_since(now);
                            self.wait_timeout(state, timeout)
                        }
                        None => self.wait(state),
                    };
                }
            };

            // Execute outside the lock so producers stay unblocked.
            trace!("{}: running ticket {}", self.shared.name, entry.ticket);
            let repeat = (entry.action)();

            let mut state = self.lock();
            let suppressed = state.executing_cancelled;
            state.executing = None;

            if repeat && !entry.interval.is_zero() && !suppressed {
                entry.trigger = if entry.catch_up {
                    entry.trigger + entry.interval
                } else {
                    Instant::now() + entry.interval
                };
                state.queued.push(entry);
            }
        }
    }

    /// Schedules a thread-bound action to run on the loop thread.
    ///
    /// Unlike [`schedule`](Self::schedule) the action need not be `Send`:
    /// it is parked in thread-local storage and only a key crosses the
    /// queue, so this must be called from the loop thread itself.
    /// Cancelling the ticket stops the action from firing but the parked
    /// closure is only reclaimed when the thread ends.
    pub fn schedule_local(&self, delay: Duration, action: impl FnOnce() + 'static) -> Ticket {
        if let Some(thread) = self.lock().thread {
            debug_assert_eq!(
                thread,
                thread::current().id(),
                "{}: thread-bound actions must be scheduled from the loop thread",
                self.shared.name
            );
        }

        let key = local::defer(Box::new(action));
        self.schedule(delay, move || local::fire(key))
    }

    /// A [`Scheduler`] that posts runtime actions onto this loop.
    ///
    /// Install it with [`init_scheduler`](crate::init_scheduler) on the
    /// thread that calls [`run`](Self::run): the actions it accepts are
    /// thread-bound and fire on the loop thread.
    pub fn scheduler(&self) -> LooperScheduler {
        LooperScheduler {
            looper: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.shared.state.lock().expect("looper state poisoned")
    }

    fn wait<'a>(&self, state: MutexGuard<'a, LoopState>) -> MutexGuard<'a, LoopState> {
        self.shared
            .cond
            .wait(state)
            .expect("looper state poisoned")
    }

    fn wait_timeout<'a>(
        &self,
        state: MutexGuard<'a, LoopState>,
        timeout: Duration,
    ) -> MutexGuard<'a, LoopState> {
        self.shared
            .cond
            .wait_timeout(state, timeout)
            .expect("looper state poisoned")
            .0
    }
}

/// Resets the running flag when `run` exits, normally or by panic.
struct RunGuard<'a>(&'a Looper);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.running = false;
        state.thread = None;
        state.executing = None;
        debug!("{}: loop stopped", self.0.shared.name);
    }
}

/// Posts non-`Send` runtime actions to a loop via the thread-local
/// parking lot. See [`Looper::scheduler`].
pub struct LooperScheduler {
    looper: Looper,
}

impl Scheduler for LooperScheduler {
    fn schedule(&self, action: Action) {
        self.looper.schedule_local(Duration::ZERO, action);
    }
}

/// Returns an awaitable that completes after `delay` on the loop thread.
///
/// This is the timeout building block: race it against other awaitables
/// with [`wait_any`](crate::wait_any). Dropping the awaitable early simply
/// expires its completer, so the timer fires into a no-op.
pub fn async_delay(looper: &Looper, delay: Duration) -> Awaitable {
    let awaitable = Awaitable::new("async-delay");
    let completer = awaitable.take_completer();

    looper.schedule_local(delay, move || completer.complete());

    awaitable
}
