//! # Pacer - Tick-Driven Rate-Limited Event Dispatcher
//!
//! Pacer sits between producers of work and the tasks that consume it. You
//! hand it items; it hands them on to their destination task at a controlled
//! pace, at most `per_tick` items every `interval`.
//!
//! ## How It Works
//!
//! ```text
//!     enqueue(A, B, C, D, E)           per_tick = 2, interval = 100ms
//!
//!     t=0ms     pending: [A B C D E]   timer armed
//!     t=100ms   release A B  ──► destination
//!     t=200ms   release C D  ──► destination
//!     t=300ms   release E    ──► destination, queue empty, timer disarmed
//! ```
//!
//! - **Tick-driven**: a shared [`TimerService`] fires the limiter; nothing
//!   sleeps or spins
//! - **Asynchronous hand-off**: released items go through an [`Executor`] to
//!   the destination task's mailbox; the limiter never runs destination code
//! - **Stall / resume**: hold releases without dropping queued work
//! - **Cancellable**: every enqueue returns a [`Ticket`]
//! - **Graceful shutdown**: queued items come back to their destinations as
//!   [`Event::Cancelled`] and the owner task receives exactly one
//!   [`Event::ShutdownComplete`]
//!
//! ## Quick Start
//!
//! ```rust
//! use pacer::{Event, RateLimiterBuilder, ThreadExecutor, ThreadTimer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let timers = ThreadTimer::start("pacer-timer").unwrap();
//! let executor = Arc::new(ThreadExecutor::<String>::new());
//! let owner = executor.register();
//! let worker = executor.register();
//!
//! let limiter = RateLimiterBuilder::new()
//!     .interval(Duration::from_millis(10))
//!     .per_tick(2)
//!     .name("outbound")
//!     .build(timers.clone(), executor.clone(), owner.id())
//!     .unwrap();
//!
//! for n in 0..4 {
//!     limiter.enqueue(worker.id(), format!("message {n}")).unwrap();
//! }
//!
//! for _ in 0..4 {
//!     match worker.recv_timeout(Duration::from_secs(1)) {
//!         Some(Event::Released(msg)) => println!("sending {msg}"),
//!         other => panic!("unexpected {:?}", other),
//!     }
//! }
//!
//! limiter.shutdown();
//! assert!(matches!(owner.recv(), Some(Event::ShutdownComplete(_))));
//! timers.shutdown();
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │   Your Application      │
//!                    └──────────┬──────────────┘
//!                               │ enqueue / cancel / stall / resume
//!                    ┌──────────▼──────────────┐
//!                    │  RateLimiter / Set      │
//!                    │  one mutex per limiter  │
//!                    └───┬─────────────────┬───┘
//!            arm/disarm  │                 │  deliver (outside the lock)
//!              on_tick   │                 │
//!     ┌──────────────────▼──┐       ┌──────▼────────────────┐
//!     │   TimerService      │       │   Executor            │
//!     │ • ThreadTimer       │       │ • ThreadExecutor      │
//!     │ • ManualTimer       │       │ • per-task Mailbox    │
//!     └─────────────────────┘       └───────────────────────┘
//! ```
//!
//! Timer services and executors are shared, externally owned resources. Many
//! limiters can use one of each.
//!
//! ## Logging
//!
//! Pacer emits [`tracing`](https://docs.rs/tracing) events with the limiter
//! name as a structured field. It never installs a subscriber.
//!
//! ## Examples
//!
//! The `demos/` directory holds runnable programs:
//! - `basic.rs` - one limiter, stall/resume, shutdown
//! - `keyed.rs` - per-key pacing with [`RateLimiterSet`]

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

mod rate_limiter;

pub use rate_limiter::{
    DeliveryError, EnqueueError, Error, Event, EventKind, Executor, HealthStatus, Mailbox,
    ManualTimer, QueueDiscipline, RateLimiter, RateLimiterConfig, RateLimiterMetrics,
    RateLimiterSet, SetStats, ShutdownComplete, State, TaskId, ThreadExecutor, ThreadTimer,
    TickTarget, Ticket, TimerError, TimerId, TimerService, CRITICAL_BACKLOG_TICKS,
    DEFAULT_MAX_LIMITERS, DEFAULT_MAX_TIMERS, DEGRADED_BACKLOG_TICKS, MAX_INTERVAL,
};

use std::sync::Arc;
use std::time::Duration;

/// Timer service shared between limiters.
pub type SharedTimers = Arc<dyn TimerService>;

/// Executor shared between limiters.
pub type SharedExecutor<T> = Arc<dyn Executor<T>>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// ```rust
/// use pacer::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for typical dispatcher use.
    //!
    //! ```rust
    //! use pacer::prelude::*;
    //!
    //! let config = RateLimiterConfig::per_second(50);
    //! let discipline = QueueDiscipline::Lifo;
    //! let status = HealthStatus::Healthy;
    //! ```

    pub use crate::{
        EnqueueError, Error, Event, Executor, HealthStatus, Mailbox, ManualTimer,
        QueueDiscipline, RateLimiter, RateLimiterBuilder, RateLimiterConfig, RateLimiterMetrics,
        RateLimiterSet, SharedExecutor, SharedTimers, State, TaskId, ThreadExecutor, ThreadTimer,
        Ticket, TimerService,
    };
}

/// Fluent construction of a [`RateLimiter`].
///
/// Unlike [`RateLimiter::new`], the builder validates its configuration, so
/// the interval must be set.
///
/// ```rust
/// use pacer::{Error, ManualTimer, RateLimiterBuilder, ThreadExecutor};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timers = Arc::new(ManualTimer::new());
/// let executor = Arc::new(ThreadExecutor::<u8>::new());
/// let owner = executor.register();
///
/// let limiter = RateLimiterBuilder::new()
///     .interval(Duration::from_millis(250))
///     .per_tick(4)
///     .lifo(true)
///     .name("retries")
///     .build(timers.clone(), executor.clone(), owner.id())
///     .unwrap();
/// assert_eq!(limiter.per_tick(), 4);
///
/// // No interval
/// let err = RateLimiterBuilder::new()
///     .build(timers, executor, owner.id())
///     .unwrap_err();
/// assert!(matches!(err, Error::InvalidConfig(_)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RateLimiterBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterBuilder {
    /// Starts from [`RateLimiterConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing configuration.
    pub fn from_config(config: RateLimiterConfig) -> Self {
        Self { config }
    }

    /// Time between ticks. Must be non-zero.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Items released per tick. Zero is treated as one.
    pub fn per_tick(mut self, per_tick: u32) -> Self {
        self.config = self.config.with_per_tick(per_tick);
        self
    }

    /// Releases newest items first when `true`.
    pub fn lifo(mut self, lifo: bool) -> Self {
        self.config.discipline = QueueDiscipline::from_lifo(lifo);
        self
    }

    /// Label used in log records.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Creates the limiter.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a bad configuration and
    /// [`Error::ResourceExhaustion`] if no timer can be allocated.
    pub fn build<T: Send + 'static>(
        self,
        timers: SharedTimers,
        executor: SharedExecutor<T>,
        owner: TaskId,
    ) -> Result<RateLimiter<T>, Error> {
        RateLimiter::with_config(timers, executor, owner, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_builder_applies_settings() {
        let timers = Arc::new(ManualTimer::new());
        let executor = Arc::new(ThreadExecutor::<u32>::new());
        let owner = executor.register();

        let limiter = RateLimiterBuilder::new()
            .interval(Duration::from_millis(40))
            .per_tick(0)
            .lifo(true)
            .name("built")
            .build(timers, executor, owner.id())
            .unwrap();

        assert_eq!(limiter.interval(), Duration::from_millis(40));
        assert_eq!(limiter.per_tick(), 1);
        assert_eq!(limiter.discipline(), QueueDiscipline::Lifo);
        assert_eq!(limiter.name(), "built");
        assert_eq!(limiter.state(), State::Idle);
    }

    #[test]
    fn test_builder_validation() {
        let timers = Arc::new(ManualTimer::new());
        let executor = Arc::new(ThreadExecutor::<u32>::new());
        let owner = executor.register();

        let no_interval = RateLimiterBuilder::new().build(timers.clone(), executor.clone(), owner.id());
        assert!(matches!(no_interval, Err(Error::InvalidConfig(_))));

        let unnamed = RateLimiterBuilder::from_config(RateLimiterConfig::per_second(5))
            .name("")
            .build(timers, executor, owner.id());
        assert!(matches!(unnamed, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_real_threads_end_to_end() {
        let timers = ThreadTimer::start("pacer-lib-test").unwrap();
        let executor = Arc::new(ThreadExecutor::<usize>::new());
        let owner = executor.register();
        let worker = executor.register();

        let limiter = RateLimiterBuilder::new()
            .interval(Duration::from_millis(5))
            .per_tick(3)
            .build(timers.clone(), executor.clone(), owner.id())
            .unwrap();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let limiter = limiter.clone();
                let dest = worker.id();
                thread::spawn(move || {
                    for n in 0..25 {
                        limiter.enqueue(dest, p * 100 + n).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 100 {
            match worker.recv_timeout(Duration::from_secs(5)) {
                Some(Event::Released(n)) => received.push(n),
                other => panic!("expected a release, got {:?}", other),
            }
        }
        received.sort_unstable();
        received.dedup();
        assert_eq!(received.len(), 100);

        limiter.shutdown();
        timers.shutdown();
    }

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let _config = RateLimiterConfig::default();
        let _discipline = QueueDiscipline::Fifo;
        let _status = HealthStatus::Healthy;
        let _builder = RateLimiterBuilder::new();
    }

    #[test]
    fn test_shared_types() {
        let _timers: SharedTimers = Arc::new(ManualTimer::new());
        let _executor: SharedExecutor<u8> = Arc::new(ThreadExecutor::new());
    }

    #[test]
    fn test_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(MSRV, "1.70.0");
    }
}
