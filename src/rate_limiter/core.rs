//! # Core Rate Limiter Implementation
//!
//! A [`RateLimiter`] defers work items and releases at most `per_tick` of
//! them every `interval`, handing each one to its destination task through
//! an [`Executor`]. When the queue runs dry the timer is disarmed and the
//! limiter goes back to sleep.
//!
//! ## State Machine
//!
//! ```text
//!                    enqueue (arms timer)
//!          ┌──────┐ ──────────────────────► ┌────────┐
//!          │ Idle │                         │ Active │◄─┐
//!          └──────┘ ◄────────────────────── └────────┘  │ tick with
//!             │  ▲     tick drains queue       │        │ items left
//!       stall │  │ resume                stall │ ───────┘
//!             ▼  │ (queue empty)               ▼
//!          ┌─────────┐ ◄───────────────────────┘
//!          │ Stalled │ ──── resume (re-arms) ────► Active
//!          └─────────┘
//!
//!     shutdown() from any state ──► ShuttingDown (terminal)
//! ```
//!
//! ## Locking
//!
//! Every field that the state machine reads lives behind one
//! `parking_lot::Mutex`. Arming and disarming happen under that lock, which is
//! safe because [`TimerService`] calls never block and never call back
//! synchronously. Delivery to tasks always happens after the lock is released.
//!
//! ```text
//!     on_tick():
//!
//!     lock ──► pop ≤ per_tick slots ──► queue empty? disarm, Idle ──► unlock
//!                                                                      │
//!                              executor.deliver(dest, Released) ◄──────┘
//! ```
//!
//! ## Lifetime
//!
//! The limiter is reference counted. A new limiter starts with two
//! references: the handle returned to the creator and a lifecycle reference
//! that travels to the owner task inside [`ShutdownComplete`]. Clones and
//! [`attach`](RateLimiter::attach) add references, drops and
//! [`detach`](RateLimiter::detach) remove them. The lifecycle reference is a
//! strong one, so dropping every handle never stops the timer or loses queued
//! items; only [`shutdown`](RateLimiter::shutdown) does. Memory is freed once
//! shutdown has run and the notice and all handles are gone.

use super::{
    config::{normalize_per_tick, QueueDiscipline, RateLimiterConfig},
    error::{EnqueueError, Error},
    executor::{Event, Executor, ShutdownComplete, TaskId},
    metrics::RateLimiterMetrics,
    queue::{PendingQueue, Ticket},
    timer::{TickTarget, TimerId, TimerService},
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Source of limiter ids. Tickets carry the id so a ticket from one limiter
/// can never cancel an item in another.
static NEXT_LIMITER_ID: AtomicU64 = AtomicU64::new(1);

/// References held by a freshly created limiter.
const INITIAL_REFERENCES: usize = 2;

/// Lifecycle state of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Nothing queued, timer disarmed.
    Idle,
    /// Timer armed, releasing items every tick.
    Active,
    /// Releases held, timer disarmed, enqueues still accepted.
    Stalled,
    /// Terminal. Everything is refused.
    ShuttingDown,
}

impl State {
    /// Returns `true` while the timer is expected to be armed.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Stalled => "stalled",
            Self::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

struct Inner<T> {
    state: State,
    interval: Duration,
    per_tick: u32,
    discipline: QueueDiscipline,
    pending: PendingQueue<T>,
    /// Keeps the limiter alive, and ticking, until shutdown hands it to the
    /// owner inside [`ShutdownComplete`].
    lifecycle: Option<Arc<Shared<T>>>,
}

/// State shared by every handle, the timer callback and the shutdown notice.
pub(crate) struct Shared<T> {
    id: u64,
    name: String,
    owner: TaskId,
    timer: TimerId,
    timers: Arc<dyn TimerService>,
    executor: Arc<dyn Executor<T>>,
    refs: AtomicUsize,
    inner: Mutex<Inner<T>>,

    total_enqueued: AtomicU64,
    total_released: AtomicU64,
    total_cancelled: AtomicU64,
    total_shutdown_cancelled: AtomicU64,
    total_rejected: AtomicU64,
    total_undeliverable: AtomicU64,
    total_ticks: AtomicU64,
}

impl<T> Shared<T> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Drops one reference. Releasing more than were taken is a bug.
    pub(crate) fn release_reference(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev > 0,
            "rate limiter `{}` released more references than it holds",
            self.name
        );
        if prev == 1 {
            debug!(limiter = %self.name, "last reference released");
        }
    }

    fn take_reference(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Hands one event to a task. Undeliverable items are dropped.
    fn deliver(&self, task: TaskId, event: Event<T>) -> bool {
        match self.executor.deliver(task, event) {
            Ok(()) => true,
            Err(err) => {
                self.total_undeliverable.fetch_add(1, Ordering::Relaxed);
                let task = err.task();
                let kind = err.into_event().kind();
                warn!(limiter = %self.name, task = %task, event = ?kind, "dropping undeliverable event");
                false
            }
        }
    }
}

impl<T: Send + 'static> TickTarget for Shared<T> {
    fn on_tick(&self, timer: TimerId) {
        let batch = {
            let mut inner = self.inner.lock();
            if inner.state != State::Active {
                trace!(limiter = %self.name, timer = %timer, state = %inner.state, "ignoring stale tick");
                return;
            }
            self.total_ticks.fetch_add(1, Ordering::Relaxed);

            let quantum = inner.per_tick as usize;
            let mut batch = Vec::with_capacity(quantum.min(inner.pending.len()));
            while batch.len() < quantum {
                match inner.pending.pop_front() {
                    Some(slot) => batch.push(slot),
                    None => break,
                }
            }

            if inner.pending.is_empty() {
                self.timers.disarm(self.timer);
                inner.state = State::Idle;
                debug!(limiter = %self.name, released = batch.len(), "queue drained, going idle");
            }
            batch
        };

        for slot in batch {
            trace!(limiter = %self.name, task = %slot.destination, sequence = slot.sequence, "releasing");
            if self.deliver(slot.destination, Event::Released(slot.item)) {
                self.total_released.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        debug!(limiter = %self.name, timer = %self.timer, "destroying rate limiter");
        self.timers.destroy_timer(self.timer);
    }
}

/// Handle to a rate-limited event dispatcher.
///
/// Items are submitted with [`enqueue`](Self::enqueue) and reach their
/// destination as [`Event::Released`], at most
/// [`per_tick`](Self::per_tick) per [`interval`](Self::interval). All methods
/// take `&self`; clone the handle (or call [`attach`](Self::attach)) to share
/// it between threads.
///
/// ## Example
///
/// ```rust
/// use pacer::{Event, ManualTimer, RateLimiter, RateLimiterConfig, State, ThreadExecutor};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timers = Arc::new(ManualTimer::new());
/// let executor = Arc::new(ThreadExecutor::<u32>::new());
/// let owner = executor.register();
/// let worker = executor.register();
///
/// let config = RateLimiterConfig::new(Duration::from_millis(100), 2);
/// let limiter = RateLimiter::with_config(timers.clone(), executor, owner.id(), config).unwrap();
///
/// for n in 1..=3 {
///     limiter.enqueue(worker.id(), n).unwrap();
/// }
///
/// timers.fire_all();
/// assert_eq!(worker.drain().len(), 2);
/// assert_eq!(limiter.state(), State::Active);
///
/// timers.fire_all();
/// assert_eq!(worker.drain().len(), 1);
/// assert_eq!(limiter.state(), State::Idle);
/// ```
pub struct RateLimiter<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> RateLimiter<T> {
    /// Creates an idle limiter with a zero interval, one item per tick and
    /// FIFO release.
    ///
    /// Set an interval with [`set_interval`](Self::set_interval) before the
    /// first enqueue; arming a zero interval fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhaustion`] if the timer service cannot
    /// allocate a timer.
    pub fn new(
        timers: Arc<dyn TimerService>,
        executor: Arc<dyn Executor<T>>,
        owner: TaskId,
    ) -> Result<Self, Error> {
        Self::create(timers, executor, owner, RateLimiterConfig::default())
    }

    /// Creates an idle limiter from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation and
    /// [`Error::ResourceExhaustion`] if no timer can be allocated.
    pub fn with_config(
        timers: Arc<dyn TimerService>,
        executor: Arc<dyn Executor<T>>,
        owner: TaskId,
        config: RateLimiterConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        Self::create(timers, executor, owner, config)
    }

    fn create(
        timers: Arc<dyn TimerService>,
        executor: Arc<dyn Executor<T>>,
        owner: TaskId,
        config: RateLimiterConfig,
    ) -> Result<Self, Error> {
        let timer = timers.create_timer().map_err(Error::ResourceExhaustion)?;
        let id = NEXT_LIMITER_ID.fetch_add(1, Ordering::Relaxed);

        debug!(
            limiter = %config.name,
            timer = %timer,
            owner = %owner,
            interval = ?config.interval,
            per_tick = config.per_tick,
            "created rate limiter"
        );

        let shared = Shared {
            id,
            name: config.name,
            owner,
            timer,
            timers,
            executor,
            refs: AtomicUsize::new(INITIAL_REFERENCES),
            inner: Mutex::new(Inner {
                state: State::Idle,
                interval: config.interval,
                per_tick: normalize_per_tick(config.per_tick),
                discipline: config.discipline,
                pending: PendingQueue::new(id),
                lifecycle: None,
            }),
            total_enqueued: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
            total_cancelled: AtomicU64::new(0),
            total_shutdown_cancelled: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_undeliverable: AtomicU64::new(0),
            total_ticks: AtomicU64::new(0),
        };

        let shared = Arc::new(shared);
        shared.inner.lock().lifecycle = Some(Arc::clone(&shared));
        Ok(Self { shared })
    }

    fn target(&self) -> Weak<dyn TickTarget> {
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        weak
    }

    /// Submits `item` for rate-limited delivery to `destination`.
    ///
    /// An idle limiter arms its timer first. The returned [`Ticket`] can be
    /// passed to [`cancel`](Self::cancel) while the item is still queued.
    ///
    /// # Errors
    ///
    /// The item comes back inside the [`EnqueueError`] when:
    /// - the limiter is shutting down ([`Error::ShuttingDown`])
    /// - the timer could not be armed ([`Error::TimerArm`]); the limiter
    ///   stays idle
    pub fn enqueue(&self, destination: TaskId, item: T) -> Result<Ticket, EnqueueError<T>> {
        let mut inner = self.shared.inner.lock();

        match inner.state {
            State::ShuttingDown => {
                self.shared.total_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(EnqueueError::new(Error::ShuttingDown, item));
            }
            State::Idle => {
                let armed =
                    self.shared
                        .timers
                        .arm_recurring(self.shared.timer, inner.interval, self.target());
                if let Err(err) = armed {
                    self.shared.total_rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(limiter = %self.shared.name, error = %err, "failed to arm timer on enqueue");
                    return Err(EnqueueError::new(Error::TimerArm(err), item));
                }
                inner.state = State::Active;
                debug!(limiter = %self.shared.name, interval = ?inner.interval, "timer armed");
            }
            State::Active | State::Stalled => {}
        }

        let discipline = inner.discipline;
        let ticket = inner.pending.push(destination, item, discipline);
        self.shared.total_enqueued.fetch_add(1, Ordering::Relaxed);
        trace!(limiter = %self.shared.name, task = %destination, pending = inner.pending.len(), "enqueued");
        Ok(ticket)
    }

    /// Withdraws a queued item and returns it to the caller.
    ///
    /// The item is not delivered to its destination. Losing the race to a
    /// tick is normal and reported as [`Error::NotFound`].
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after shutdown
    /// - [`Error::NotFound`] if the item already left the queue or the ticket
    ///   belongs to another limiter
    pub fn cancel(&self, ticket: &Ticket) -> Result<T, Error> {
        let mut inner = self.shared.inner.lock();
        if inner.state == State::ShuttingDown {
            return Err(Error::ShuttingDown);
        }
        match inner.pending.remove(ticket) {
            Some(slot) => {
                self.shared.total_cancelled.fetch_add(1, Ordering::Relaxed);
                trace!(limiter = %self.shared.name, task = %slot.destination, "cancelled");
                Ok(slot.item)
            }
            None => Err(Error::NotFound),
        }
    }

    /// Returns `true` if the ticket's item is still waiting.
    pub fn is_queued(&self, ticket: &Ticket) -> bool {
        self.shared.inner.lock().pending.contains(ticket)
    }

    /// Changes the time between ticks.
    ///
    /// An active limiter re-arms at once, so the new interval applies from the
    /// next fire.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after shutdown
    /// - [`Error::TimerArm`] if re-arming fails; the old interval and
    ///   schedule stay in place
    pub fn set_interval(&self, interval: Duration) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock();
        if inner.state == State::ShuttingDown {
            return Err(Error::ShuttingDown);
        }
        if inner.state == State::Active {
            self.shared
                .timers
                .arm_recurring(self.shared.timer, interval, self.target())?;
        }
        debug!(limiter = %self.shared.name, old = ?inner.interval, new = ?interval, "interval changed");
        inner.interval = interval;
        Ok(())
    }

    /// Sets how many items leave per tick. Zero is treated as one.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] after shutdown.
    pub fn set_per_tick(&self, per_tick: u32) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock();
        if inner.state == State::ShuttingDown {
            return Err(Error::ShuttingDown);
        }
        inner.per_tick = normalize_per_tick(per_tick);
        Ok(())
    }

    /// Switches new insertions between FIFO and LIFO.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] after shutdown.
    pub fn set_lifo_mode(&self, lifo: bool) -> Result<(), Error> {
        self.set_discipline(QueueDiscipline::from_lifo(lifo))
    }

    /// Sets the discipline used for future insertions. Items already queued
    /// keep their place.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] after shutdown.
    pub fn set_discipline(&self, discipline: QueueDiscipline) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock();
        if inner.state == State::ShuttingDown {
            return Err(Error::ShuttingDown);
        }
        inner.discipline = discipline;
        Ok(())
    }

    /// Holds releases. Enqueues are still accepted.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] after shutdown.
    pub fn stall(&self) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            State::ShuttingDown => Err(Error::ShuttingDown),
            State::Active => {
                self.shared.timers.disarm(self.shared.timer);
                inner.state = State::Stalled;
                debug!(limiter = %self.shared.name, pending = inner.pending.len(), "stalled");
                Ok(())
            }
            State::Idle | State::Stalled => {
                inner.state = State::Stalled;
                Ok(())
            }
        }
    }

    /// Lifts a [`stall`](Self::stall).
    ///
    /// With items waiting the timer is re-armed; otherwise the limiter goes
    /// idle. Does nothing unless stalled.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after shutdown
    /// - [`Error::TimerArm`] if re-arming fails; the limiter stays stalled
    pub fn resume(&self) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            State::ShuttingDown => Err(Error::ShuttingDown),
            State::Active | State::Idle => Ok(()),
            State::Stalled if inner.pending.is_empty() => {
                inner.state = State::Idle;
                Ok(())
            }
            State::Stalled => {
                self.shared
                    .timers
                    .arm_recurring(self.shared.timer, inner.interval, self.target())?;
                inner.state = State::Active;
                debug!(limiter = %self.shared.name, pending = inner.pending.len(), "resumed");
                Ok(())
            }
        }
    }

    /// Stops the limiter for good.
    ///
    /// The first call disarms the timer, sends every queued item back to its
    /// destination as [`Event::Cancelled`] and then delivers one
    /// [`Event::ShutdownComplete`] to the owner task. Later calls do nothing.
    ///
    /// A tick that was already running may still finish its batch.
    pub fn shutdown(&self) {
        let (drained, lifecycle) = {
            let mut inner = self.shared.inner.lock();
            if inner.state == State::ShuttingDown {
                debug!(limiter = %self.shared.name, "shutdown already requested");
                return;
            }
            inner.state = State::ShuttingDown;
            self.shared.timers.disarm(self.shared.timer);
            (inner.pending.drain(), inner.lifecycle.take())
        };

        info!(limiter = %self.shared.name, cancelled = drained.len(), "shutting down");

        for slot in drained {
            if self.shared.deliver(slot.destination, Event::Cancelled(slot.item)) {
                self.shared.total_shutdown_cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }

        let Some(lifecycle) = lifecycle else {
            warn!(limiter = %self.shared.name, "lifecycle reference already released");
            return;
        };
        // An unreachable owner drops the notice here, releasing the lifecycle reference
        let notice = ShutdownComplete::new(lifecycle);
        self.shared
            .deliver(self.shared.owner, Event::ShutdownComplete(notice));
    }

    /// Takes another reference and returns a handle to the same limiter.
    pub fn attach(&self) -> Self {
        self.shared.take_reference();
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Releases this handle's reference.
    ///
    /// Does not stop the timer. A limiter with no handles left keeps
    /// releasing its queue until [`shutdown`](Self::shutdown) is called from
    /// another handle or a [`RateLimiterSet`](crate::RateLimiterSet).
    pub fn detach(self) {
        drop(self);
    }

    /// Live references, including the lifecycle reference until the owner
    /// drops its [`ShutdownComplete`].
    pub fn references(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    /// Number of queued items.
    pub fn pending(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Time between ticks.
    pub fn interval(&self) -> Duration {
        self.shared.inner.lock().interval
    }

    /// Items released per tick.
    pub fn per_tick(&self) -> u32 {
        self.shared.inner.lock().per_tick
    }

    /// Discipline applied to new insertions.
    pub fn discipline(&self) -> QueueDiscipline {
        self.shared.inner.lock().discipline
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state() == State::ShuttingDown
    }

    /// Label used in log records.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The task that receives [`Event::ShutdownComplete`].
    pub fn owner(&self) -> TaskId {
        self.shared.owner
    }

    /// Timer slot this limiter arms.
    pub fn timer(&self) -> TimerId {
        self.shared.timer
    }

    /// Snapshot of configuration, state and lifetime counters.
    pub fn metrics(&self) -> RateLimiterMetrics {
        let (state, pending, interval, per_tick, discipline) = {
            let inner = self.shared.inner.lock();
            (
                inner.state,
                inner.pending.len(),
                inner.interval,
                inner.per_tick,
                inner.discipline,
            )
        };
        let shared = &self.shared;

        RateLimiterMetrics {
            name: shared.name.clone(),
            state,
            pending,
            interval,
            per_tick,
            discipline,
            references: self.references(),
            total_enqueued: shared.total_enqueued.load(Ordering::Relaxed),
            total_released: shared.total_released.load(Ordering::Relaxed),
            total_cancelled: shared.total_cancelled.load(Ordering::Relaxed),
            total_shutdown_cancelled: shared.total_shutdown_cancelled.load(Ordering::Relaxed),
            total_rejected: shared.total_rejected.load(Ordering::Relaxed),
            total_undeliverable: shared.total_undeliverable.load(Ordering::Relaxed),
            total_ticks: shared.total_ticks.load(Ordering::Relaxed),
        }
    }

    /// Returns `true` if both handles point at the same limiter.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    #[cfg(test)]
    pub(crate) fn tick_now(&self) {
        self.shared.on_tick(self.shared.timer);
    }

    #[cfg(test)]
    pub(crate) fn limiter_id(&self) -> u64 {
        self.shared.id
    }
}

impl<T: Send + 'static> Clone for RateLimiter<T> {
    fn clone(&self) -> Self {
        self.attach()
    }
}

impl<T: Send + 'static> Drop for RateLimiter<T> {
    fn drop(&mut self) {
        self.shared.release_reference();
    }
}

impl<T: Send + 'static> fmt::Debug for RateLimiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("RateLimiter")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &inner.state)
            .field("interval", &inner.interval)
            .field("per_tick", &inner.per_tick)
            .field("discipline", &inner.discipline)
            .field("pending", &inner.pending.len())
            .finish()
    }
}
