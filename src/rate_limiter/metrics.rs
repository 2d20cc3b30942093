//! # Rate Limiter Metrics
//!
//! Point-in-time snapshots of a limiter's configuration, queue and lifetime
//! counters, plus a coarse health assessment.
//!
//! ```text
//!     Flow accounting:
//!
//!     enqueued ──┬──► released ───────────► destination (Released)
//!                ├──► cancelled ──────────► caller (cancel())
//!                ├──► shutdown_cancelled ─► destination (Cancelled)
//!                ├──► undeliverable ──────► dropped, logged
//!                └──► pending (still queued)
//!
//!     rejected: refused at enqueue, never counted as enqueued
//! ```

use super::config::QueueDiscipline;
use super::core::State;
use std::fmt;
use std::time::Duration;

/// Backlog (in ticks) above which a limiter reports [`HealthStatus::Degraded`].
pub const DEGRADED_BACKLOG_TICKS: u64 = 100;

/// Backlog (in ticks) above which a limiter reports [`HealthStatus::Critical`].
pub const CRITICAL_BACKLOG_TICKS: u64 = 1_000;

/// Snapshot of one limiter.
///
/// ## Example
///
/// ```rust
/// use pacer::{HealthStatus, ManualTimer, RateLimiter, RateLimiterConfig, ThreadExecutor};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timers = Arc::new(ManualTimer::new());
/// let executor = Arc::new(ThreadExecutor::<u64>::new());
/// let owner = executor.register();
/// let worker = executor.register();
///
/// let config = RateLimiterConfig::new(Duration::from_millis(10), 5);
/// let limiter = RateLimiter::with_config(timers, executor, owner.id(), config).unwrap();
/// for n in 0..20 {
///     limiter.enqueue(worker.id(), n).unwrap();
/// }
///
/// let metrics = limiter.metrics();
/// assert_eq!(metrics.backlog_ticks(), 4);
/// assert_eq!(metrics.estimated_drain_time(), Duration::from_millis(40));
/// assert_eq!(metrics.health_status(), HealthStatus::Healthy);
/// println!("{}", metrics.summary());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterMetrics {
    /// Limiter label.
    pub name: String,

    /// State when the snapshot was taken.
    pub state: State,

    /// Items waiting in the queue.
    pub pending: usize,

    /// Time between ticks.
    pub interval: Duration,

    /// Items released per tick.
    pub per_tick: u32,

    /// Discipline for new insertions.
    pub discipline: QueueDiscipline,

    /// Live references to the limiter.
    pub references: usize,

    /// Items accepted by `enqueue`.
    pub total_enqueued: u64,

    /// Items handed to their destination on a tick.
    pub total_released: u64,

    /// Items withdrawn through `cancel`.
    pub total_cancelled: u64,

    /// Items returned to their destination by shutdown.
    pub total_shutdown_cancelled: u64,

    /// Enqueues refused (shutting down or timer arm failure).
    pub total_rejected: u64,

    /// Events the executor could not deliver, including the shutdown notice.
    pub total_undeliverable: u64,

    /// Ticks that found the limiter active.
    pub total_ticks: u64,
}

impl RateLimiterMetrics {
    /// Ticks needed to release everything currently queued.
    #[inline]
    pub fn backlog_ticks(&self) -> u64 {
        let per_tick = u64::from(self.per_tick.max(1));
        (self.pending as u64 + per_tick - 1) / per_tick
    }

    /// Time to drain the queue at the configured rate if nothing else arrives.
    ///
    /// A stalled limiter never drains on its own, but the estimate still
    /// reports the time it would take once resumed.
    pub fn estimated_drain_time(&self) -> Duration {
        let ticks = u32::try_from(self.backlog_ticks()).unwrap_or(u32::MAX);
        self.interval.saturating_mul(ticks)
    }

    /// Sustained release rate in items per second.
    pub fn release_rate_per_second(&self) -> f64 {
        if self.interval.is_zero() {
            0.0
        } else {
            f64::from(self.per_tick.max(1)) / self.interval.as_secs_f64()
        }
    }

    /// Fraction of accepted items that reached their destination normally.
    ///
    /// Returns 1.0 when nothing has left the queue yet.
    pub fn delivery_ratio(&self) -> f64 {
        let settled = self.total_released + self.total_undeliverable;
        if settled == 0 {
            1.0
        } else {
            self.total_released as f64 / settled as f64
        }
    }

    /// Returns `true` if some released or cancelled item was dropped.
    #[inline]
    pub fn has_undeliverable(&self) -> bool {
        self.total_undeliverable > 0
    }

    /// Coarse health of the limiter.
    ///
    /// - **Critical**: backlog above [`CRITICAL_BACKLOG_TICKS`], or a stalled
    ///   limiter holding work while also dropping deliveries
    /// - **Degraded**: backlog above [`DEGRADED_BACKLOG_TICKS`], a stall with
    ///   work queued, or any undeliverable event
    /// - **Healthy**: otherwise, including after shutdown
    pub fn health_status(&self) -> HealthStatus {
        let backlog = self.backlog_ticks();
        let stalled_with_work = self.state == State::Stalled && self.pending > 0;

        if backlog > CRITICAL_BACKLOG_TICKS || (stalled_with_work && self.has_undeliverable()) {
            HealthStatus::Critical
        } else if backlog > DEGRADED_BACKLOG_TICKS || stalled_with_work || self.has_undeliverable() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Multi-line report for logs and consoles.
    ///
    /// ```text
    /// RateLimiter `notify` Metrics:
    /// ├─ Configuration:
    /// │  ├─ Interval: 100ms
    /// │  ├─ Per Tick: 2
    /// │  └─ Discipline: Fifo
    /// ├─ Queue:
    /// │  ├─ State: active
    /// │  ├─ Pending: 3
    /// │  └─ Estimated Drain: 200ms
    /// ├─ Counters:
    /// │  ├─ Enqueued: 10
    /// │  ...
    /// └─ Health: Healthy
    /// ```
    pub fn summary(&self) -> String {
        format!(
            "RateLimiter `{}` Metrics:\n\
             ├─ Configuration:\n\
             │  ├─ Interval: {:?}\n\
             │  ├─ Per Tick: {}\n\
             │  └─ Discipline: {:?}\n\
             ├─ Queue:\n\
             │  ├─ State: {}\n\
             │  ├─ Pending: {}\n\
             │  └─ Estimated Drain: {:?}\n\
             ├─ Counters:\n\
             │  ├─ Enqueued: {}\n\
             │  ├─ Released: {}\n\
             │  ├─ Cancelled: {}\n\
             │  ├─ Shutdown Cancelled: {}\n\
             │  ├─ Rejected: {}\n\
             │  ├─ Undeliverable: {}\n\
             │  └─ Ticks: {}\n\
             └─ Health: {:?}",
            self.name,
            self.interval,
            self.per_tick,
            self.discipline,
            self.state,
            self.pending,
            self.estimated_drain_time(),
            self.total_enqueued,
            self.total_released,
            self.total_cancelled,
            self.total_shutdown_cancelled,
            self.total_rejected,
            self.total_undeliverable,
            self.total_ticks,
            self.health_status(),
        )
    }
}

impl fmt::Display for RateLimiterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Three-level health indicator.
///
/// ```text
///     Healthy ──────► queue keeps up with the configured rate
///        │
///     Degraded ─────► backlog growing, stalled with work, or drops
///        │
///     Critical ─────► very deep backlog, or stalled while dropping
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// Draining normally.
    Healthy,
    /// Needs attention but still working.
    Degraded,
    /// Needs intervention.
    Critical,
}

impl HealthStatus {
    /// Returns `true` for anything but [`HealthStatus::Healthy`].
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// Operator hint for this status.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Healthy => "No action needed",
            Self::Degraded => "Check for stalls, dead destinations or rising backlog",
            Self::Critical => "Immediate action required: resume, raise per_tick or shorten interval",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: State, pending: usize, per_tick: u32) -> RateLimiterMetrics {
        RateLimiterMetrics {
            name: "m".into(),
            state,
            pending,
            interval: Duration::from_millis(100),
            per_tick,
            discipline: QueueDiscipline::Fifo,
            references: 2,
            total_enqueued: 0,
            total_released: 0,
            total_cancelled: 0,
            total_shutdown_cancelled: 0,
            total_rejected: 0,
            total_undeliverable: 0,
            total_ticks: 0,
        }
    }

    #[test]
    fn test_backlog_and_drain_time() {
        let m = snapshot(State::Active, 5, 2);
        assert_eq!(m.backlog_ticks(), 3);
        assert_eq!(m.estimated_drain_time(), Duration::from_millis(300));
        assert_eq!(m.release_rate_per_second(), 20.0);

        let empty = snapshot(State::Idle, 0, 2);
        assert_eq!(empty.backlog_ticks(), 0);
        assert_eq!(empty.estimated_drain_time(), Duration::ZERO);
    }

    #[test]
    fn test_zero_per_tick_counts_as_one() {
        let m = snapshot(State::Active, 3, 0);
        assert_eq!(m.backlog_ticks(), 3);
    }

    #[test]
    fn test_health_levels() {
        assert_eq!(snapshot(State::Active, 10, 1).health_status(), HealthStatus::Healthy);
        assert_eq!(snapshot(State::Active, 101, 1).health_status(), HealthStatus::Degraded);
        assert_eq!(snapshot(State::Active, 1_001, 1).health_status(), HealthStatus::Critical);
        assert_eq!(snapshot(State::Stalled, 1, 1).health_status(), HealthStatus::Degraded);
        assert_eq!(snapshot(State::Stalled, 0, 1).health_status(), HealthStatus::Healthy);

        let mut dropping = snapshot(State::Stalled, 1, 1);
        dropping.total_undeliverable = 1;
        assert_eq!(dropping.health_status(), HealthStatus::Critical);

        assert_eq!(snapshot(State::ShuttingDown, 0, 1).health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_delivery_ratio() {
        let mut m = snapshot(State::Idle, 0, 1);
        assert_eq!(m.delivery_ratio(), 1.0);
        m.total_released = 3;
        m.total_undeliverable = 1;
        assert_eq!(m.delivery_ratio(), 0.75);
        assert!(m.has_undeliverable());
    }

    #[test]
    fn test_health_status_methods() {
        assert!(!HealthStatus::Healthy.is_unhealthy());
        assert!(HealthStatus::Degraded.is_unhealthy());
        assert!(HealthStatus::Critical.suggested_action().contains("Immediate"));
        assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
    }

    #[test]
    fn test_summary_display() {
        let m = snapshot(State::Active, 3, 2);
        let text = m.to_string();
        assert!(text.contains("RateLimiter `m` Metrics"));
        assert!(text.contains("Pending: 3"));
        assert!(text.contains("State: active"));
        assert!(text.contains("Estimated Drain: 200ms"));
        assert!(text.contains("Health: Healthy"));
    }
}
