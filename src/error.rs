use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Error value carried by a failed awaitable.
///
/// A failed awaitable re-raises its error on every subsequent await, so the
/// underlying error is stored behind a shared pointer and `Failure` is cheap
/// to clone. Any `std::error::Error` converts into a `Failure` via `?`.
///
/// `Failure` deliberately does not implement `std::error::Error` itself;
/// this keeps the blanket `From<E: Error>` conversion possible. Use
/// [`Failure::downcast_ref`] to inspect the original error.
pub struct Failure {
    inner: Arc<dyn Error + Send + Sync + 'static>,
}

impl Failure {
    /// Wraps a concrete error.
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(err),
        }
    }

    /// Builds a failure from a plain message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::new(MessageError {
            message: message.to_string(),
        })
    }

    /// Builds a failure from a captured panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self::new(PanicError { message })
    }

    /// Returns a reference to the original error if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Error + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// True if the original error is of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: Error + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }
}

impl Clone for Failure {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl<E> From<E> for Failure
where
    E: Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

/// Error recorded when a coroutine body panics.
///
/// The panic is trapped at the coroutine boundary and converted into a
/// failure on the owning awaitable instead of crossing stacks.
#[derive(Debug, Error)]
#[error("coroutine panicked: {message}")]
pub struct PanicError {
    message: String,
}

/// Panic payload used to cancel a coroutine.
///
/// When an awaitable is destroyed while its coroutine is suspended, the
/// coroutine is resumed with this payload unwinding its stack. Coroutine
/// bodies that use `catch_unwind` must re-raise it (`resume_unwind`);
/// swallowing it leaves the runtime unable to reclaim the stack.
#[derive(Debug)]
pub struct ForcedUnwind;

#[derive(Debug, Error)]
#[error("{message}")]
struct MessageError {
    message: String,
}
