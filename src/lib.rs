//! Remora: stackful coroutines with awaitable-based composition.
//!
//! Coroutines suspend at explicit points ([`Awaitable::wait`],
//! [`coro::yield_to`]) and are multiplexed cooperatively on one thread.
//! Asynchronous results flow through [`Awaitable`]s driven by
//! [`Completer`]s; the [`Looper`] supplies wall-clock scheduling.

pub mod awaitable;
pub mod coro;
pub mod error;
pub mod guard;
pub mod looper;
pub mod scheduler;
pub mod select;

pub use awaitable::{Awaitable, Completer, start_async, start_async_with_stack};
pub use coro::{Coro, current, master, suspend, yield_to};
pub use error::{Failure, ForcedUnwind, PanicError};
pub use guard::{Guard, GuardToken};
pub use looper::{Looper, async_delay};
pub use scheduler::{ImmediateScheduler, Scheduler, init_scheduler, schedule};
pub use select::{Select, async_all, async_any, wait_all, wait_any};
