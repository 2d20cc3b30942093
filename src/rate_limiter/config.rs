//! # Rate Limiter Configuration
//!
//! This module holds the knobs that shape how a limiter releases queued work.
//! Think of it as the "settings panel" for the dispatcher.
//!
//! ## Key Concepts
//!
//! ```text
//!     Tick-driven release:
//!
//!     interval ──►│      │      │      │
//!                 ▼      ▼      ▼      ▼
//!     per_tick:  [A B]  [C D]  [E]    (idle)
//!
//!     Every `interval` the timer fires once and at most `per_tick`
//!     items leave the queue as one burst.
//! ```
//!
//! ### Queue Discipline
//!
//! ```text
//!     Fifo: enqueue A, B, C ──► release A, B, C
//!     Lifo: enqueue A, B, C ──► release C, B, A
//! ```
//!
//! The discipline is applied when an item is inserted. Switching it later
//! never reorders items that are already waiting.

use super::error::Error;
use std::time::Duration;

/// Largest interval a limiter accepts through [`RateLimiterConfig::validate`].
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Order in which newly queued items are released relative to older ones.
///
/// ```rust
/// use pacer::{QueueDiscipline, RateLimiterConfig};
/// use std::time::Duration;
///
/// let config = RateLimiterConfig::new(Duration::from_millis(50), 4)
///     .with_discipline(QueueDiscipline::Lifo);
/// assert!(config.discipline.is_lifo());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueDiscipline {
    /// New items go to the tail; oldest released first.
    #[default]
    Fifo,

    /// New items go to the head; newest released first.
    Lifo,
}

impl QueueDiscipline {
    /// Maps the `lifo_mode` flag onto a discipline.
    #[inline]
    pub fn from_lifo(lifo: bool) -> Self {
        if lifo {
            Self::Lifo
        } else {
            Self::Fifo
        }
    }

    /// Returns `true` for [`QueueDiscipline::Lifo`].
    #[inline]
    pub fn is_lifo(&self) -> bool {
        matches!(self, Self::Lifo)
    }
}

/// Configuration for rate limiter instances.
///
/// The defaults match a freshly created limiter: zero interval, one item per
/// tick, FIFO. A zero interval is legal on a live limiter but the first
/// enqueue will fail to arm the timer until an interval is set, so
/// [`validate`](Self::validate) rejects it.
///
/// ## Examples
///
/// ```rust
/// use pacer::RateLimiterConfig;
/// use std::time::Duration;
///
/// // 20 releases per second, one at a time, evenly spaced
/// let smooth = RateLimiterConfig::per_second(20);
/// assert_eq!(smooth.interval, Duration::from_millis(50));
///
/// // Bursts of 10 every second
/// let bursty = RateLimiterConfig::new(Duration::from_secs(1), 10);
/// assert_eq!(bursty.effective_rate_per_second(), 10.0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Time between ticks.
    pub interval: Duration,

    /// Items released per tick. Zero is treated as one.
    pub per_tick: u32,

    /// Insertion discipline for new items.
    pub discipline: QueueDiscipline,

    /// Label used in log records.
    pub name: String,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            per_tick: 1,
            discipline: QueueDiscipline::Fifo,
            name: String::from("ratelimiter"),
        }
    }
}

impl RateLimiterConfig {
    /// Creates a configuration releasing `per_tick` items every `interval`.
    pub fn new(interval: Duration, per_tick: u32) -> Self {
        Self {
            interval,
            per_tick: normalize_per_tick(per_tick),
            ..Default::default()
        }
    }

    /// Evenly paced release of `items_per_second` items, one per tick.
    ///
    /// Zero is treated as one item per second.
    pub fn per_second(items_per_second: u32) -> Self {
        let rate = normalize_per_tick(items_per_second);
        Self::new(Duration::from_secs(1) / rate, 1)
    }

    /// Sets the per-tick quantum (zero becomes one).
    pub fn with_per_tick(mut self, per_tick: u32) -> Self {
        self.per_tick = normalize_per_tick(per_tick);
        self
    }

    /// Sets the insertion discipline.
    pub fn with_discipline(mut self, discipline: QueueDiscipline) -> Self {
        self.discipline = discipline;
        self
    }

    /// Sets the label used in log records.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Checks the configuration before it is applied to a new limiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if:
    /// - `interval` is zero
    /// - `interval` exceeds [`MAX_INTERVAL`]
    /// - `name` is empty
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig("interval must be greater than zero"));
        }
        if self.interval > MAX_INTERVAL {
            return Err(Error::InvalidConfig("interval must not exceed one day"));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name must not be empty"));
        }
        Ok(())
    }

    /// Sustained release rate in items per second.
    pub fn effective_rate_per_second(&self) -> f64 {
        if self.interval.is_zero() {
            0.0
        } else {
            normalize_per_tick(self.per_tick) as f64 / self.interval.as_secs_f64()
        }
    }
}

/// Applies the "at least one item per tick" rule.
#[inline]
pub(crate) fn normalize_per_tick(n: u32) -> u32 {
    n.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fresh_limiter() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.interval, Duration::ZERO);
        assert_eq!(config.per_tick, 1);
        assert_eq!(config.discipline, QueueDiscipline::Fifo);
        assert_eq!(config.effective_rate_per_second(), 0.0);
    }

    #[test]
    fn test_zero_per_tick_is_coerced() {
        assert_eq!(RateLimiterConfig::new(Duration::from_millis(10), 0).per_tick, 1);
        assert_eq!(RateLimiterConfig::default().with_per_tick(0).per_tick, 1);
        assert_eq!(RateLimiterConfig::default().with_per_tick(7).per_tick, 7);
    }

    #[test]
    fn test_per_second_paces_evenly() {
        let config = RateLimiterConfig::per_second(4);
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.per_tick, 1);
        assert_eq!(config.effective_rate_per_second(), 4.0);

        let floor = RateLimiterConfig::per_second(0);
        assert_eq!(floor.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_validation() {
        assert!(RateLimiterConfig::default().validate().is_err());
        assert!(RateLimiterConfig::per_second(10).validate().is_ok());

        let too_long = RateLimiterConfig::new(MAX_INTERVAL + Duration::from_secs(1), 1);
        assert!(too_long.validate().is_err());

        let unnamed = RateLimiterConfig::per_second(1).with_name("");
        assert_eq!(
            unnamed.validate(),
            Err(Error::InvalidConfig("name must not be empty"))
        );
    }

    #[test]
    fn test_discipline_helpers() {
        assert_eq!(QueueDiscipline::from_lifo(true), QueueDiscipline::Lifo);
        assert_eq!(QueueDiscipline::from_lifo(false), QueueDiscipline::Fifo);
        assert!(!QueueDiscipline::default().is_lifo());

        let config = RateLimiterConfig::per_second(1)
            .with_discipline(QueueDiscipline::Lifo)
            .with_name("notify");
        assert!(config.discipline.is_lifo());
        assert_eq!(config.name, "notify");
    }
}
