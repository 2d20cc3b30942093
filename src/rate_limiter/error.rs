//! # Errors
//!
//! Every fallible operation on a rate limiter returns one of the types in
//! this module. The taxonomy is small on purpose:
//!
//! ```text
//!     Error
//!     ├─ ResourceExhaustion ── Create could not obtain a timer slot
//!     ├─ ShuttingDown ──────── any mutation after shutdown() was requested
//!     ├─ TimerArm ──────────── Idle → Active or Stalled → Active failed
//!     ├─ NotFound ──────────── cancel() lost the race or wrong ticket
//!     └─ InvalidConfig ─────── with_config() / builder validation
//! ```
//!
//! `EnqueueError` and `DeliveryError` hand the payload back to the caller so
//! that a refused item is never silently dropped.

use super::executor::{Event, TaskId};
use std::fmt;

/// Errors returned by rate limiter operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The timer service could not provide a timer for a new limiter.
    #[error("rate limiter resources unavailable: {0}")]
    ResourceExhaustion(#[source] TimerError),

    /// The limiter has been shut down and refuses further mutation.
    #[error("rate limiter is shutting down")]
    ShuttingDown,

    /// The recurring timer could not be armed.
    #[error("failed to arm rate limiter timer: {0}")]
    TimerArm(#[from] TimerError),

    /// The ticket does not name an item queued in this limiter.
    #[error("item is not queued in this rate limiter")]
    NotFound,

    /// The configuration failed validation.
    #[error("invalid rate limiter configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Errors reported by a [`TimerService`](super::timer::TimerService).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// The service has been shut down.
    #[error("timer service is shutting down")]
    ShuttingDown,

    /// The service has no free timer slots.
    #[error("timer service has no free timer slots")]
    Exhausted,

    /// Recurring timers need a non-zero interval.
    #[error("recurring interval must be greater than zero")]
    ZeroInterval,

    /// The timer id was never created or has been destroyed.
    #[error("unknown timer")]
    UnknownTimer,
}

/// A refused [`enqueue`](super::core::RateLimiter::enqueue).
///
/// Carries the item back so the caller can dispose of it, typically by
/// delivering it itself.
///
/// ```rust
/// use pacer::{Error, ManualTimer, RateLimiter, ThreadExecutor};
/// use std::sync::Arc;
///
/// let timers = Arc::new(ManualTimer::new());
/// let executor = Arc::new(ThreadExecutor::<&str>::new());
/// let owner = executor.register();
/// let worker = executor.register();
///
/// let limiter = RateLimiter::new(timers, executor, owner.id()).unwrap();
/// limiter.shutdown();
///
/// let refused = limiter.enqueue(worker.id(), "late").unwrap_err();
/// assert_eq!(*refused.error(), Error::ShuttingDown);
/// assert_eq!(refused.into_inner(), "late");
/// ```
pub struct EnqueueError<T> {
    error: Error,
    item: T,
}

impl<T> EnqueueError<T> {
    pub(crate) fn new(error: Error, item: T) -> Self {
        Self { error, item }
    }

    /// Why the item was refused.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Returns the refused item.
    pub fn into_inner(self) -> T {
        self.item
    }

    /// Splits into the error and the refused item.
    pub fn into_parts(self) -> (Error, T) {
        (self.error, self.item)
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enqueue refused: {}", self.error)
    }
}

impl<T> std::error::Error for EnqueueError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<EnqueueError<T>> for Error {
    fn from(err: EnqueueError<T>) -> Self {
        err.error
    }
}

/// An event the executor could not hand to its destination task.
pub struct DeliveryError<T> {
    task: TaskId,
    event: Event<T>,
}

impl<T> DeliveryError<T> {
    pub(crate) fn new(task: TaskId, event: Event<T>) -> Self {
        Self { task, event }
    }

    /// The task that was not accepting events.
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Returns the undelivered event.
    pub fn into_event(self) -> Event<T> {
        self.event
    }
}

impl<T> fmt::Debug for DeliveryError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryError")
            .field("task", &self.task)
            .field("event", &self.event.kind())
            .finish()
    }
}

impl<T> fmt::Display for DeliveryError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} is not accepting events", self.task)
    }
}

impl<T> std::error::Error for DeliveryError<T> {}
