//! # Task Executor
//!
//! Released items never run inside the limiter. They are handed to an
//! [`Executor`] which forwards them to the destination task's mailbox, and
//! the task processes them on its own schedule.
//!
//! ```text
//!     RateLimiter ──deliver(task, Event)──► Executor
//!                                             │
//!                       ┌─────────────────────┼───────────────────┐
//!                       ▼                     ▼                   ▼
//!                  ┌─────────┐           ┌─────────┐         ┌─────────┐
//!                  │ task#1  │           │ task#2  │         │ owner   │
//!                  │ mailbox │           │ mailbox │         │ mailbox │
//!                  └─────────┘           └─────────┘         └─────────┘
//!                   Released              Cancelled           ShutdownComplete
//! ```
//!
//! [`ThreadExecutor`] keeps the task registry in a sharded `DashMap` so
//! deliveries from many limiters never contend on a single lock, and every
//! delivery is a non-blocking send on an unbounded channel.

use super::core::Shared;
use super::error::DeliveryError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::DashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Identity of a task that can receive events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Wraps a raw id. Executors decide what ids mean.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[inline]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// What a destination or owner task receives.
pub enum Event<T> {
    /// Normal rate-limited release.
    Released(T),

    /// The item was still queued when the limiter shut down.
    Cancelled(T),

    /// Sent once to the owner task after `shutdown()`.
    ShutdownComplete(ShutdownComplete<T>),
}

/// Payload-free discriminant of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`Event::Released`].
    Released,
    /// See [`Event::Cancelled`].
    Cancelled,
    /// See [`Event::ShutdownComplete`].
    ShutdownComplete,
}

impl<T> Event<T> {
    /// The discriminant without the payload.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Released(_) => EventKind::Released,
            Self::Cancelled(_) => EventKind::Cancelled,
            Self::ShutdownComplete(_) => EventKind::ShutdownComplete,
        }
    }

    /// The carried item, if this is a release or a cancellation.
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Released(item) | Self::Cancelled(item) => Some(item),
            Self::ShutdownComplete(_) => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released(item) => f.debug_tuple("Released").field(item).finish(),
            Self::Cancelled(item) => f.debug_tuple("Cancelled").field(item).finish(),
            Self::ShutdownComplete(done) => f.debug_tuple("ShutdownComplete").field(done).finish(),
        }
    }
}

/// Shutdown notice for the owner task.
///
/// Holds the limiter's lifecycle reference; dropping the notice releases it.
pub struct ShutdownComplete<T> {
    shared: Arc<Shared<T>>,
}

impl<T> ShutdownComplete<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Name of the limiter that shut down.
    pub fn limiter_name(&self) -> &str {
        self.shared.name()
    }
}

impl<T> Drop for ShutdownComplete<T> {
    fn drop(&mut self) {
        self.shared.release_reference();
    }
}

impl<T> fmt::Debug for ShutdownComplete<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownComplete")
            .field("limiter", &self.shared.name())
            .finish()
    }
}

/// Hands events to tasks without blocking the caller.
///
/// Implementations must not call back into the limiter from `deliver`.
pub trait Executor<T>: Send + Sync {
    /// Queues `event` for `task`, returning it on failure.
    fn deliver(&self, task: TaskId, event: Event<T>) -> Result<(), DeliveryError<T>>;
}

/// Executor backed by per-task channels.
///
/// ```rust
/// use pacer::{Event, Executor, ThreadExecutor};
///
/// let executor = ThreadExecutor::new();
/// let mailbox = executor.register();
///
/// executor.deliver(mailbox.id(), Event::Released(42)).unwrap();
/// assert!(matches!(mailbox.try_recv(), Some(Event::Released(42))));
/// ```
pub struct ThreadExecutor<T> {
    tasks: DashMap<TaskId, Sender<Event<T>>, ahash::RandomState>,
    next_id: AtomicU64,
    delivered: AtomicU64,
}

impl<T: Send + 'static> ThreadExecutor<T> {
    /// Creates an executor with no tasks.
    pub fn new() -> Self {
        Self {
            tasks: DashMap::with_hasher(ahash::RandomState::new()),
            next_id: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
        }
    }

    /// Registers a task and returns the mailbox it reads from.
    pub fn register(&self) -> Mailbox<T> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = crossbeam_channel::unbounded();
        self.tasks.insert(id, tx);
        debug!(task = %id, "registered task");
        Mailbox { id, rx }
    }

    /// Runs `handler` on a dedicated thread for every event sent to a new task.
    ///
    /// The thread exits once the task is [`unregister`](Self::unregister)ed
    /// and its mailbox is empty.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned; the task is
    /// unregistered again in that case.
    pub fn spawn<F>(&self, name: &str, mut handler: F) -> io::Result<(TaskId, thread::JoinHandle<()>)>
    where
        F: FnMut(Event<T>) + Send + 'static,
    {
        let mailbox = self.register();
        let id = mailbox.id();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(event) = mailbox.recv() {
                    handler(event);
                }
                debug!(task = %mailbox.id(), "task mailbox closed");
            });

        match spawned {
            Ok(handle) => Ok((id, handle)),
            Err(err) => {
                self.unregister(id);
                Err(err)
            }
        }
    }

    /// Removes a task. Events already in its mailbox can still be read.
    pub fn unregister(&self, task: TaskId) -> bool {
        let removed = self.tasks.remove(&task).is_some();
        if removed {
            debug!(task = %task, "unregistered task");
        }
        removed
    }

    /// Returns `true` if `task` is registered.
    pub fn is_registered(&self, task: TaskId) -> bool {
        self.tasks.contains_key(&task)
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Lifetime count of successful deliveries.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Default for ThreadExecutor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Executor<T> for ThreadExecutor<T> {
    fn deliver(&self, task: TaskId, event: Event<T>) -> Result<(), DeliveryError<T>> {
        let sent = match self.tasks.get(&task) {
            Some(tx) => tx.send(event).map_err(|err| err.into_inner()),
            None => return Err(DeliveryError::new(task, event)),
        };

        match sent {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(event) => {
                // Mailbox dropped without unregistering
                trace!(task = %task, "pruning closed mailbox");
                self.tasks.remove(&task);
                Err(DeliveryError::new(task, event))
            }
        }
    }
}

impl<T> fmt::Debug for ThreadExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("tasks", &self.tasks.len())
            .field("delivered", &self.delivered.load(Ordering::Relaxed))
            .finish()
    }
}

/// Receiving side of a registered task.
pub struct Mailbox<T> {
    id: TaskId,
    rx: Receiver<Event<T>>,
}

impl<T> Mailbox<T> {
    /// The task id to pass as a destination or owner.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks until an event arrives or the task is unregistered.
    pub fn recv(&self) -> Option<Event<T>> {
        self.rx.recv().ok()
    }

    /// Returns an event if one is waiting.
    pub fn try_recv(&self) -> Option<Event<T>> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for an event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Takes every event currently waiting.
    pub fn drain(&self) -> Vec<Event<T>> {
        self.rx.try_iter().collect()
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("waiting", &self.rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_register_and_deliver() {
        let executor = ThreadExecutor::new();
        let a = executor.register();
        let b = executor.register();
        assert_ne!(a.id(), b.id());
        assert_eq!(executor.task_count(), 2);

        executor.deliver(a.id(), Event::Released(1)).unwrap();
        executor.deliver(b.id(), Event::Cancelled(2)).unwrap();
        executor.deliver(a.id(), Event::Released(3)).unwrap();

        let got: Vec<_> = a.drain().into_iter().filter_map(Event::into_item).collect();
        assert_eq!(got, vec![1, 3]);
        assert_eq!(b.try_recv().map(|e| e.kind()), Some(EventKind::Cancelled));
        assert_eq!(executor.delivered(), 3);
    }

    #[test]
    fn test_unknown_task_returns_event() {
        let executor = ThreadExecutor::<&str>::new();
        let err = executor
            .deliver(TaskId::from_raw(99), Event::Released("lost"))
            .unwrap_err();
        assert_eq!(err.task(), TaskId::from_raw(99));
        assert_eq!(err.into_event().into_item(), Some("lost"));
        assert_eq!(executor.delivered(), 0);
    }

    #[test]
    fn test_dropped_mailbox_is_pruned() {
        let executor = ThreadExecutor::new();
        let mailbox = executor.register();
        let id = mailbox.id();
        drop(mailbox);

        assert!(executor.is_registered(id));
        assert!(executor.deliver(id, Event::Released(5)).is_err());
        assert!(!executor.is_registered(id));
    }

    #[test]
    fn test_unregister_keeps_buffered_events() {
        let executor = ThreadExecutor::new();
        let mailbox = executor.register();
        executor.deliver(mailbox.id(), Event::Released('a')).unwrap();

        assert!(executor.unregister(mailbox.id()));
        assert!(!executor.unregister(mailbox.id()));
        assert!(executor.deliver(mailbox.id(), Event::Released('b')).is_err());

        assert_eq!(mailbox.len(), 1);
        assert!(matches!(mailbox.recv(), Some(Event::Released('a'))));
        // Sender is gone, so recv no longer blocks
        assert!(mailbox.recv().is_none());
    }

    #[test]
    fn test_spawned_task_runs_handler() {
        let executor = ThreadExecutor::new();
        let (tx, rx) = mpsc::channel();

        let (id, handle) = executor
            .spawn("pacer-test-task", move |event| {
                if let Some(item) = event.into_item() {
                    tx.send(item).unwrap();
                }
            })
            .unwrap();

        for i in 0..5 {
            executor.deliver(id, Event::Released(i)).unwrap();
        }

        let got: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);

        executor.unregister(id);
        handle.join().unwrap();
    }

    #[test]
    fn test_recv_timeout_on_empty_mailbox() {
        let executor = ThreadExecutor::<u8>::new();
        let mailbox = executor.register();
        assert!(mailbox.is_empty());
        assert!(mailbox.recv_timeout(Duration::from_millis(5)).is_none());
        assert!(mailbox.try_recv().is_none());
    }
}
