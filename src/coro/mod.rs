//! Stackful coroutine primitive.
//!
//! A [`Coro`] owns a pooled, guard-paged stack and a saved machine context.
//! Switching is symmetric: any coroutine may transfer control to any other
//! by handle; there is no scheduler queue at this layer. Each thread has a
//! distinguished *master* coroutine standing for the thread's original
//! stack; it is created lazily on first use and all external callbacks are
//! expected to run on it.
//!
//! The value channel across a switch is a single opaque pointer. Higher
//! layers decide what it points at; the runtime itself only adds one
//! out-of-band sentinel, the forced unwind used for cancellation.

pub mod stack;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use log::{debug, trace};

use crate::error::ForcedUnwind;
use stack::PooledStack;

pub use stack::{
    MINIMUM_STACK_SIZE, default_stack_size, drain_stack_pool, set_default_stack_size,
};

thread_local! {
    static MASTER: RefCell<Option<Coro>> = const { RefCell::new(None) };
    static CURRENT: RefCell<Option<Coro>> = const { RefCell::new(None) };
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Phase {
    /// Created, never resumed. The body has not run.
    Created,
    /// Resumed at least once and not yet finished. The coroutine is either
    /// the one executing right now or suspended at a yield point.
    Running,
    /// The body returned, panicked or was unwound; the stack holds nothing
    /// that needs dropping and the coroutine may not be resumed again.
    Done,
}

enum YieldValue {
    /// Ordinary resume carrying the opaque user pointer.
    Value(*mut ()),
    /// Cancellation: the receiving suspension point raises [`ForcedUnwind`].
    Unwind,
}

/// What travels through a context switch. Lives on the suspending
/// coroutine's stack, which stays mapped until the switch target reads it.
struct SwitchPayload {
    /// Coroutine being suspended; the receiver parks the returned machine
    /// context here. Raw because the final switch of a dying coroutine must
    /// not pin its own refcount from a frame that never resumes.
    from: *const CoroInner,
    /// Coroutine being resumed. Only the entry trampoline needs it.
    target: *const CoroInner,
    value: Option<YieldValue>,
}

struct CoroInner {
    tag: String,
    /// `None` for the master, which runs on the thread's own stack.
    stack: RefCell<Option<PooledStack>>,
    /// Saved context while suspended; `None` exactly while this coroutine
    /// is the one executing.
    ctx: Cell<Option<Context>>,
    phase: Cell<Phase>,
    /// Default target of the final yield when the body finishes.
    parent: RefCell<Option<Coro>>,
    /// Body, consumed on first resume.
    func: RefCell<Option<Box<dyn FnOnce(*mut ())>>>,
    /// Panic payload of a body that terminated by panicking; re-raised in
    /// whichever coroutine observes the termination.
    pending_panic: RefCell<Option<Box<dyn Any + Send>>>,
}

impl Drop for CoroInner {
    fn drop(&mut self) {
        // The master runs for the whole life of its thread; everything else
        // must have finished (or been unwound) before the last handle goes.
        debug_assert!(
            self.phase.get() != Phase::Running || self.stack.borrow().is_none(),
            "coroutine '{}' dropped while suspended; cancellation must go \
             through its awaitable",
            self.tag
        );
        trace!("destroy coroutine '{}'", self.tag);
    }
}

/// Handle to a stackful coroutine.
///
/// Handles are cheap to clone and compare by identity. The coroutine's
/// stack is reclaimed when the last handle drops, which is only legal once
/// the body has finished (see [`ForcedUnwind`] for how cancellation drives
/// a suspended coroutine to completion first).
#[derive(Clone)]
pub struct Coro {
    inner: Rc<CoroInner>,
}

impl PartialEq for Coro {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Coro {}

impl fmt::Debug for Coro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coro")
            .field("tag", &self.inner.tag)
            .field("phase", &self.inner.phase.get())
            .finish()
    }
}

impl Coro {
    /// Creates a suspended coroutine with the default stack size.
    ///
    /// The body does not run until the first resume; its argument is the
    /// pointer passed to that resume.
    pub fn new<F>(tag: &str, entry: F) -> Self
    where
        F: FnOnce(*mut ()) + 'static,
    {
        Self::with_stack_size(tag, default_stack_size(), entry)
    }

    /// Creates a suspended coroutine on a stack of at least `stack_size`
    /// bytes.
    pub fn with_stack_size<F>(tag: &str, stack_size: usize, entry: F) -> Self
    where
        F: FnOnce(*mut ()) + 'static,
    {
        let pooled = stack::obtain(stack_size);
        let ctx = make_context(pooled.inner());

        trace!("create coroutine '{tag}'");

        Self {
            inner: Rc::new(CoroInner {
                tag: tag.to_string(),
                stack: RefCell::new(Some(pooled)),
                ctx: Cell::new(Some(ctx)),
                phase: Cell::new(Phase::Created),
                parent: RefCell::new(Some(current())),
                func: RefCell::new(Some(Box::new(entry))),
                pending_panic: RefCell::new(None),
            }),
        }
    }

    /// Identifier used in diagnostics only.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// True from the first resume until the body finishes.
    pub fn is_running(&self) -> bool {
        self.inner.phase.get() == Phase::Running
    }

    /// Suspends the calling coroutine and resumes this one.
    ///
    /// Returns the value passed by whichever coroutine eventually resumes
    /// the caller.
    ///
    /// # Panics
    ///
    /// Panics if this coroutine is the caller itself or has already
    /// finished.
    pub fn resume(&self, value: *mut ()) -> *mut () {
        switch(self, YieldValue::Value(value))
    }

    /// Coroutine the body's final yield returns to.
    pub fn parent(&self) -> Option<Coro> {
        self.inner.parent.borrow().clone()
    }

    /// Redirects the final yield (and [`suspend`]) of this coroutine.
    pub fn set_parent(&self, parent: &Coro) {
        assert!(
            !Rc::ptr_eq(&self.inner, &parent.inner),
            "coroutine '{}' cannot be its own parent",
            self.inner.tag
        );
        *self.inner.parent.borrow_mut() = Some(parent.clone());
    }

    pub(crate) fn is_unstarted(&self) -> bool {
        self.inner.phase.get() == Phase::Created
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inner.phase.get() == Phase::Done
    }

    /// Resumes a suspended coroutine with the cancellation sentinel and
    /// drives the unwind to completion. The final yield lands on this
    /// coroutine's parent, which the caller is expected to have pointed at
    /// itself beforehand.
    pub(crate) fn force_unwind(&self) {
        debug!("force unwinding coroutine '{}'", self.inner.tag);

        switch(self, YieldValue::Unwind);

        assert!(
            self.is_finished(),
            "coroutine '{}' swallowed its forced unwind",
            self.inner.tag
        );
    }
}

/// Returns the coroutine currently executing on this thread.
pub fn current() -> Coro {
    ensure_master();
    CURRENT.with(|c| c.borrow().clone().expect("current coroutine missing"))
}

/// Returns this thread's master coroutine, creating it on first use.
///
/// The first call on a thread must happen on the thread's original stack.
pub fn master() -> Coro {
    ensure_master();
    MASTER.with(|m| m.borrow().clone().expect("master coroutine missing"))
}

/// True when the caller is running on the master coroutine.
pub fn on_master() -> bool {
    master() == current()
}

/// Suspends the current coroutine and resumes `target`.
pub fn yield_to(target: &Coro, value: *mut ()) -> *mut () {
    switch(target, YieldValue::Value(value))
}

/// Suspends the current coroutine and resumes the master.
pub fn yield_master(value: *mut ()) -> *mut () {
    yield_to(&master(), value)
}

/// Suspends the current coroutine and resumes its parent.
///
/// # Panics
///
/// Panics on the master coroutine, which has no parent.
pub fn suspend(value: *mut ()) -> *mut () {
    let me = current();
    let parent = me
        .parent()
        .unwrap_or_else(|| panic!("coroutine '{}' has no parent to yield to", me.tag()));
    yield_to(&parent, value)
}

fn ensure_master() {
    let initialized = CURRENT.with(|c| c.borrow().is_some());
    if initialized {
        return;
    }

    let master = Coro {
        inner: Rc::new(CoroInner {
            tag: "master".to_string(),
            stack: RefCell::new(None),
            ctx: Cell::new(None),
            phase: Cell::new(Phase::Running),
            parent: RefCell::new(None),
            func: RefCell::new(None),
            pending_panic: RefCell::new(None),
        }),
    };

    trace!("create master coroutine");

    MASTER.with(|m| *m.borrow_mut() = Some(master.clone()));
    CURRENT.with(|c| *c.borrow_mut() = Some(master));
}

fn set_current(coro: Coro) {
    CURRENT.with(|c| *c.borrow_mut() = Some(coro));
}

fn make_context(stack: &ProtectedFixedSizeStack) -> Context {
    unsafe { Context::new(stack, coro_entry) }
}

/// Transfers control to `target`. Returns in the calling coroutine's frame
/// once somebody resumes it, delivering their value.
fn switch(target: &Coro, value: YieldValue) -> *mut () {
    let me = current();

    assert!(
        !Rc::ptr_eq(&me.inner, &target.inner),
        "coroutine '{}' cannot yield to itself",
        me.tag()
    );
    assert!(
        target.inner.phase.get() != Phase::Done,
        "cannot resume finished coroutine '{}'",
        target.tag()
    );

    trace!("jumping from '{}' to '{}'", me.tag(), target.tag());

    if target.inner.phase.get() == Phase::Created {
        target.inner.phase.set(Phase::Running);
    }

    let transfer = unsafe { leap(Rc::as_ptr(&me.inner), target, value) };

    finish_switch(transfer)
}

/// The raw half of a switch: parks the payload on the suspending stack and
/// jumps. Safety: `from` must stay alive until the target reads the
/// payload, which the caller guarantees by holding a handle (or, for the
/// running coroutine, by `CURRENT` holding one).
unsafe fn leap(from: *const CoroInner, target: &Coro, value: YieldValue) -> Transfer {
    let ctx = target
        .inner
        .ctx
        .take()
        .unwrap_or_else(|| panic!("coroutine '{}' is not resumable", target.tag()));

    set_current(target.clone());

    let mut payload = SwitchPayload {
        from,
        target: Rc::as_ptr(&target.inner),
        value: Some(value),
    };

    unsafe { ctx.resume(&mut payload as *mut SwitchPayload as usize) }
}

/// Runs at every point where control re-enters a coroutine: parks the
/// suspender's context, then surfaces whatever was sent over.
fn finish_switch(transfer: Transfer) -> *mut () {
    let incoming = unsafe { &mut *(transfer.data as *mut SwitchPayload) };
    let from = unsafe { &*incoming.from };

    from.ctx.set(Some(transfer.context));

    let value = incoming
        .value
        .take()
        .expect("switch payload consumed twice");

    // A coroutine that terminated by panicking re-raises the panic in
    // whichever coroutine observes the termination.
    if let Some(payload) = from.pending_panic.borrow_mut().take() {
        panic::resume_unwind(payload);
    }

    match value {
        YieldValue::Value(value) => value,
        YieldValue::Unwind => panic::resume_unwind(Box::new(ForcedUnwind)),
    }
}

extern "C" fn coro_entry(t: Transfer) -> ! {
    let (this, initial) = {
        let incoming = unsafe { &mut *(t.data as *mut SwitchPayload) };
        let from = unsafe { &*incoming.from };
        from.ctx.set(Some(t.context));

        let value = incoming
            .value
            .take()
            .expect("switch payload consumed twice");

        (incoming.target, value)
    };

    // Valid for the life of the entry: a coroutine is kept alive by its
    // owner (or CURRENT) for as long as it can run.
    let this = unsafe { &*this };

    if let YieldValue::Value(value) = initial {
        let func = this
            .func
            .borrow_mut()
            .take()
            .expect("coroutine resumed without a body");

        debug!("coroutine '{}' body starting", this.tag);

        match panic::catch_unwind(AssertUnwindSafe(move || func(value))) {
            Ok(()) => debug!("coroutine '{}' body done", this.tag),
            Err(payload) if payload.is::<ForcedUnwind>() => {
                debug!("coroutine '{}' body done (forced unwind)", this.tag);
            }
            Err(payload) => {
                debug!("coroutine '{}' body done (panic)", this.tag);
                *this.pending_panic.borrow_mut() = Some(payload);
            }
        }
    }

    this.phase.set(Phase::Done);

    let parent = this
        .parent
        .borrow()
        .clone()
        .expect("coroutine finished without a parent");

    let _ = unsafe { leap(this as *const CoroInner, &parent, YieldValue::Value(ptr::null_mut())) };

    // A finished coroutine must never be resumed; switch() guards against
    // it, so getting here means the runtime state is corrupt.
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn ping_pong() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let inner_log = log.clone();
        let coro = Coro::new("ping", move |value| {
            assert!(value.is_null());
            inner_log.borrow_mut().push("first");
            yield_master(ptr::null_mut());
            inner_log.borrow_mut().push("second");
        });

        assert!(coro.is_unstarted());

        coro.resume(ptr::null_mut());
        assert!(coro.is_running(), "coroutine suspended mid-body");
        assert_eq!(*log.borrow(), vec!["first"]);

        coro.resume(ptr::null_mut());
        assert!(coro.is_finished());
        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn value_channel_round_trip() {
        let coro = Coro::new("adder", |value| {
            let mut value = value as usize;
            loop {
                value += 1;
                let next = suspend(value as *mut ());
                if next.is_null() {
                    break;
                }
                value = next as usize;
            }
        });

        assert_eq!(coro.resume(10 as *mut ()) as usize, 11);
        assert_eq!(coro.resume(20 as *mut ()) as usize, 21);

        coro.resume(ptr::null_mut());
        assert!(coro.is_finished());
    }

    #[test]
    fn master_is_current_outside_coroutines() {
        assert!(on_master());
        assert_eq!(current(), master());
    }

    #[test]
    fn body_panic_pops_out_in_resumer() {
        let coro = Coro::new("bomb", |_| panic!("boom"));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            coro.resume(ptr::null_mut());
        }));

        let payload = result.expect_err("panic must cross back to the resumer");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        assert!(coro.is_finished());
    }

    #[test]
    fn symmetric_switch_between_coroutines() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let log_b = log.clone();
        let b = Coro::new("b", move |_| {
            log_b.borrow_mut().push("b");
            yield_master(ptr::null_mut());
        });

        let log_a = log.clone();
        let b_handle = b.clone();
        let a = Coro::new("a", move |_| {
            log_a.borrow_mut().push("a");
            // Jump straight to b, not through the master.
            yield_to(&b_handle, ptr::null_mut());
        });

        a.resume(ptr::null_mut());
        assert_eq!(*log.borrow(), vec!["a", "b"]);

        // Both are parked: a inside its jump to b, b at yield_master.
        assert!(a.is_running());
        assert!(b.is_running());

        b.resume(ptr::null_mut());
        assert!(b.is_finished());

        a.resume(ptr::null_mut());
        assert!(a.is_finished());
    }
}
