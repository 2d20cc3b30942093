//! # Rate Limiter Module
//!
//! Internal layout of the dispatcher. Everything public is re-exported from
//! the crate root.
//!
//! ## Module Structure
//!
//! ```text
//!     rate_limiter/
//!     ├── mod.rs          (module organization)
//!     ├── config.rs       (interval, per_tick, discipline, validation)
//!     ├── core.rs         (RateLimiter state machine)
//!     ├── queue.rs        (pending slots and cancellation tickets)
//!     ├── timer.rs        (TimerService, ThreadTimer, ManualTimer)
//!     ├── executor.rs     (Executor, ThreadExecutor, mailboxes, events)
//!     ├── error.rs        (error taxonomy)
//!     ├── manager.rs      (keyed RateLimiterSet)
//!     └── metrics.rs      (snapshots and health)
//! ```
//!
//! ## Architecture Flow
//!
//! ```text
//!     caller ──enqueue──► ┌──────────┐ ──arm/disarm──► ┌──────────────┐
//!                         │   Core   │                 │ TimerService │
//!     caller ◄──cancel─── │ (queue)  │ ◄───on_tick──── └──────────────┘
//!                         └────┬─────┘
//!                              │ deliver(Released | Cancelled | ShutdownComplete)
//!                              ▼
//!                         ┌──────────┐
//!                         │ Executor │ ──► task mailboxes
//!                         └──────────┘
//! ```

mod config;
mod core;
mod error;
mod executor;
mod manager;
mod metrics;
mod queue;
mod timer;

/// Configuration types
pub use config::{QueueDiscipline, RateLimiterConfig, MAX_INTERVAL};

/// The dispatcher itself
pub use core::{RateLimiter, State};

/// Error taxonomy
pub use error::{DeliveryError, EnqueueError, Error, TimerError};

/// Task side: events, executors and mailboxes
pub use executor::{Event, EventKind, Executor, Mailbox, ShutdownComplete, TaskId, ThreadExecutor};

/// Keyed limiter families
pub use manager::{RateLimiterSet, SetStats, DEFAULT_MAX_LIMITERS};

/// Observability
pub use metrics::{HealthStatus, RateLimiterMetrics, CRITICAL_BACKLOG_TICKS, DEGRADED_BACKLOG_TICKS};

/// Cancellation handles
pub use queue::Ticket;

/// Timer side
pub use timer::{ManualTimer, ThreadTimer, TickTarget, TimerId, TimerService, DEFAULT_MAX_TIMERS};
