//! # Keyed Rate Limiter Set
//!
//! Many systems pace work per peer, per zone or per tenant. A
//! [`RateLimiterSet`] keeps one [`RateLimiter`] per key, created lazily from
//! a template configuration, with every limiter sharing one timer service,
//! one executor and one owner task.
//!
//! ```text
//!     enqueue(key, dest, item)
//!              │
//!              ▼
//!     ┌───────────────────────┐
//!     │  DashMap (sharded)    │
//!     │  key ─► RateLimiter   │──► shared TimerService
//!     │  key ─► RateLimiter   │──► shared Executor
//!     │  key ─► RateLimiter   │──► owner gets every ShutdownComplete
//!     └───────────────────────┘
//! ```
//!
//! Limiters that go idle can be reaped with [`RateLimiterSet::reap_idle`];
//! each reaped limiter is shut down first so its owner notice is still sent.

use super::{
    config::RateLimiterConfig,
    core::{RateLimiter, State},
    error::{EnqueueError, Error, TimerError},
    executor::{Executor, TaskId},
    queue::Ticket,
    timer::TimerService,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default cap on live limiters in one set.
pub const DEFAULT_MAX_LIMITERS: usize = 10_000;

/// Fraction of capacity above which [`SetStats::is_near_capacity`] reports.
const NEAR_CAPACITY_RATIO: f64 = 0.8;

/// A family of rate limiters addressed by key.
///
/// ## Example
///
/// ```rust
/// use pacer::{ManualTimer, RateLimiterConfig, RateLimiterSet, ThreadExecutor};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timers = Arc::new(ManualTimer::new());
/// let executor = Arc::new(ThreadExecutor::<String>::new());
/// let owner = executor.register();
/// let worker = executor.register();
///
/// let template = RateLimiterConfig::new(Duration::from_millis(10), 1).with_name("zone");
/// let set = RateLimiterSet::new(timers.clone(), executor, owner.id(), template).unwrap();
///
/// set.enqueue("example.com", worker.id(), "refresh".to_string()).unwrap();
/// set.enqueue("example.org", worker.id(), "refresh".to_string()).unwrap();
/// assert_eq!(set.len(), 2);
///
/// timers.fire_all();
/// assert_eq!(worker.drain().len(), 2);
/// assert_eq!(set.reap_idle(), 2);
/// ```
pub struct RateLimiterSet<K, T: Send + 'static>
where
    K: Eq + Hash,
{
    limiters: DashMap<K, RateLimiter<T>, ahash::RandomState>,
    timers: Arc<dyn TimerService>,
    executor: Arc<dyn Executor<T>>,
    owner: TaskId,
    template: RateLimiterConfig,
    max_limiters: usize,
    active_count: AtomicUsize,
    total_created: AtomicU64,
    total_removed: AtomicU64,
    shutting_down: AtomicBool,
}

impl<K, T> RateLimiterSet<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Send + 'static,
{
    /// Creates an empty set holding at most [`DEFAULT_MAX_LIMITERS`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `template` fails validation.
    pub fn new(
        timers: Arc<dyn TimerService>,
        executor: Arc<dyn Executor<T>>,
        owner: TaskId,
        template: RateLimiterConfig,
    ) -> Result<Self, Error> {
        Self::with_capacity_limit(timers, executor, owner, template, DEFAULT_MAX_LIMITERS)
    }

    /// Creates an empty set holding at most `max_limiters` limiters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `template` fails validation or
    /// `max_limiters` is zero.
    pub fn with_capacity_limit(
        timers: Arc<dyn TimerService>,
        executor: Arc<dyn Executor<T>>,
        owner: TaskId,
        template: RateLimiterConfig,
        max_limiters: usize,
    ) -> Result<Self, Error> {
        template.validate()?;
        if max_limiters == 0 {
            return Err(Error::InvalidConfig("max_limiters must be greater than zero"));
        }

        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .next_power_of_two()
            .clamp(2, 64);

        Ok(Self {
            limiters: DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                ahash::RandomState::new(),
                shards,
            ),
            timers,
            executor,
            owner,
            template,
            max_limiters,
            active_count: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            total_removed: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Returns the limiter for `key`, creating it from the template if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown_all`](Self::shutdown_all)
    /// - [`Error::ResourceExhaustion`] if the set is full or no timer is left
    pub fn get_or_create(&self, key: K) -> Result<RateLimiter<T>, Error> {
        if let Some(limiter) = self.limiters.get(&key) {
            return Ok(limiter.attach());
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        match self.limiters.entry(key) {
            Entry::Occupied(occupied) => Ok(occupied.get().attach()),
            Entry::Vacant(vacant) => {
                // Re-checked under the shard lock so shutdown_all cannot miss us
                if self.shutting_down.load(Ordering::SeqCst) {
                    return Err(Error::ShuttingDown);
                }

                let prev = self.active_count.fetch_add(1, Ordering::AcqRel);
                if prev >= self.max_limiters {
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                    warn!(key = ?vacant.key(), max = self.max_limiters, "rate limiter set is full");
                    return Err(Error::ResourceExhaustion(TimerError::Exhausted));
                }

                let config = self
                    .template
                    .clone()
                    .with_name(format!("{}/{:?}", self.template.name, vacant.key()));
                let created = RateLimiter::with_config(
                    Arc::clone(&self.timers),
                    Arc::clone(&self.executor),
                    self.owner,
                    config,
                );

                match created {
                    Ok(limiter) => {
                        let handle = limiter.attach();
                        debug!(key = ?vacant.key(), live = prev + 1, "created keyed rate limiter");
                        vacant.insert(limiter);
                        self.total_created.fetch_add(1, Ordering::Relaxed);
                        Ok(handle)
                    }
                    Err(err) => {
                        self.active_count.fetch_sub(1, Ordering::AcqRel);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Enqueues `item` on the limiter for `key`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Everything [`get_or_create`](Self::get_or_create) and
    /// [`RateLimiter::enqueue`] can return. The item is handed back.
    pub fn enqueue(&self, key: K, destination: TaskId, item: T) -> Result<Ticket, EnqueueError<T>> {
        match self.get_or_create(key) {
            Ok(limiter) => limiter.enqueue(destination, item),
            Err(err) => Err(EnqueueError::new(err, item)),
        }
    }

    /// Withdraws an item queued on `key`'s limiter.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if there is no limiter for `key`, otherwise
    /// whatever [`RateLimiter::cancel`] returns.
    pub fn cancel(&self, key: &K, ticket: &Ticket) -> Result<T, Error> {
        match self.get(key) {
            Some(limiter) => limiter.cancel(ticket),
            None => Err(Error::NotFound),
        }
    }

    /// Returns the limiter for `key` without creating one.
    pub fn get(&self, key: &K) -> Option<RateLimiter<T>> {
        self.limiters.get(key).map(|limiter| limiter.attach())
    }

    /// Returns `true` if a limiter exists for `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.limiters.contains_key(key)
    }

    /// Removes and shuts down the limiter for `key`.
    ///
    /// Queued items go back to their destinations as cancellations.
    pub fn remove(&self, key: &K) -> bool {
        match self.limiters.remove(key) {
            Some((key, limiter)) => {
                self.retire(&key, limiter);
                true
            }
            None => false,
        }
    }

    /// Shuts down and removes every limiter that is idle with nothing queued.
    ///
    /// Handles obtained earlier keep working but every mutation on a reaped
    /// limiter fails with [`Error::ShuttingDown`]; fetch a fresh one with
    /// [`get_or_create`](Self::get_or_create).
    pub fn reap_idle(&self) -> usize {
        let candidates: Vec<K> = self
            .limiters
            .iter()
            .filter(|entry| is_reapable(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for key in candidates {
            // The limiter may have picked up work since the scan
            if let Some((key, limiter)) = self.limiters.remove_if(&key, |_, l| is_reapable(l)) {
                self.retire(&key, limiter);
                reaped += 1;
            }
        }

        if reaped > 0 {
            debug!(reaped, live = self.len(), "reaped idle rate limiters");
        }
        reaped
    }

    /// Shuts down every limiter and refuses new keys from now on.
    ///
    /// Returns the number of limiters shut down.
    pub fn shutdown_all(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("rate limiter set already shut down");
        }

        let keys: Vec<K> = self.limiters.iter().map(|entry| entry.key().clone()).collect();
        let mut count = 0;
        for key in keys {
            if let Some((key, limiter)) = self.limiters.remove(&key) {
                self.retire(&key, limiter);
                count += 1;
            }
        }

        info!(count, "shut down rate limiter set");
        count
    }

    fn retire(&self, key: &K, limiter: RateLimiter<T>) {
        limiter.shutdown();
        self.active_count.fetch_sub(1, Ordering::AcqRel);
        self.total_removed.fetch_add(1, Ordering::Relaxed);
        debug!(key = ?key, "retired keyed rate limiter");
    }

    /// Number of live limiters.
    #[inline]
    pub fn len(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Returns `true` if the set holds no limiters.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once [`shutdown_all`](Self::shutdown_all) has run.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Template applied to new limiters.
    pub fn template(&self) -> &RateLimiterConfig {
        &self.template
    }

    /// Aggregated view over every live limiter.
    pub fn stats(&self) -> SetStats {
        let mut stats = SetStats {
            limiters: 0,
            active: 0,
            stalled: 0,
            pending: 0,
            total_created: self.total_created.load(Ordering::Relaxed),
            total_removed: self.total_removed.load(Ordering::Relaxed),
            max_limiters: self.max_limiters,
        };

        for entry in self.limiters.iter() {
            let limiter = entry.value();
            stats.limiters += 1;
            match limiter.state() {
                State::Active => stats.active += 1,
                State::Stalled => stats.stalled += 1,
                State::Idle | State::ShuttingDown => {}
            }
            stats.pending += limiter.pending();
        }
        stats
    }
}

fn is_reapable<T: Send + 'static>(limiter: &RateLimiter<T>) -> bool {
    limiter.state() == State::Idle && limiter.pending() == 0
}

impl<K, T> fmt::Debug for RateLimiterSet<K, T>
where
    K: Eq + Hash,
    T: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterSet")
            .field("template", &self.template.name)
            .field("limiters", &self.active_count.load(Ordering::Acquire))
            .field("max_limiters", &self.max_limiters)
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

/// Aggregate statistics for a [`RateLimiterSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStats {
    /// Live limiters.
    pub limiters: usize,
    /// Limiters with an armed timer.
    pub active: usize,
    /// Limiters holding releases.
    pub stalled: usize,
    /// Items queued across all limiters.
    pub pending: usize,
    /// Limiters created since the set was built.
    pub total_created: u64,
    /// Limiters removed, reaped or shut down since the set was built.
    pub total_removed: u64,
    /// Capacity of the set.
    pub max_limiters: usize,
}

impl SetStats {
    /// Fraction of capacity in use (0.0 to 1.0).
    pub fn capacity_used(&self) -> f64 {
        if self.max_limiters == 0 {
            0.0
        } else {
            self.limiters as f64 / self.max_limiters as f64
        }
    }

    /// Returns `true` above 80% of capacity.
    pub fn is_near_capacity(&self) -> bool {
        self.capacity_used() > NEAR_CAPACITY_RATIO
    }

    /// Multi-line report for logs and consoles.
    pub fn summary(&self) -> String {
        format!(
            "Rate Limiter Set Stats:\n\
             ├─ Limiters:\n\
             │  ├─ Live: {}/{}\n\
             │  ├─ Active: {}\n\
             │  ├─ Stalled: {}\n\
             │  └─ Capacity Used: {:.2}%\n\
             ├─ Queue:\n\
             │  └─ Pending Items: {}\n\
             └─ Lifetime:\n\
                ├─ Created: {}\n\
                └─ Removed: {}",
            self.limiters,
            self.max_limiters,
            self.active,
            self.stalled,
            self.capacity_used() * 100.0,
            self.pending,
            self.total_created,
            self.total_removed,
        )
    }
}

impl fmt::Display for SetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::executor::{Event, EventKind, Mailbox, ThreadExecutor};
    use crate::rate_limiter::timer::ManualTimer;
    use std::thread;
    use std::time::Duration;

    type Item = u32;

    struct Fixture {
        timers: Arc<ManualTimer>,
        owner: Mailbox<Item>,
        dest: Mailbox<Item>,
        set: RateLimiterSet<&'static str, Item>,
    }

    fn fixture(max: usize) -> Fixture {
        let timers = Arc::new(ManualTimer::new());
        let executor = Arc::new(ThreadExecutor::<Item>::new());
        let owner = executor.register();
        let dest = executor.register();
        let template = RateLimiterConfig::new(Duration::from_millis(10), 1).with_name("peer");
        let set =
            RateLimiterSet::with_capacity_limit(timers.clone(), executor, owner.id(), template, max)
                .unwrap();
        Fixture {
            timers,
            owner,
            dest,
            set,
        }
    }

    #[test]
    fn test_limiters_are_created_lazily_per_key() {
        let f = fixture(16);
        assert!(f.set.is_empty());

        let a = f.set.get_or_create("a").unwrap();
        let again = f.set.get_or_create("a").unwrap();
        assert!(a.ptr_eq(&again));
        assert_eq!(a.name(), "peer/\"a\"");

        f.set.get_or_create("b").unwrap();
        assert_eq!(f.set.len(), 2);
        assert!(f.set.contains_key(&"b"));
        assert!(f.set.get(&"c").is_none());
        assert_eq!(f.timers.timer_count(), 2);
    }

    #[test]
    fn test_each_key_is_paced_independently() {
        let f = fixture(16);
        for n in 0..3 {
            f.set.enqueue("a", f.dest.id(), n).unwrap();
            f.set.enqueue("b", f.dest.id(), 100 + n).unwrap();
        }

        // One tick per limiter, one item each
        f.timers.fire_all();
        let mut got: Vec<Item> = f.dest.drain().into_iter().filter_map(Event::into_item).collect();
        got.sort();
        assert_eq!(got, vec![0, 100]);

        let stats = f.set.stats();
        assert_eq!(stats.limiters, 2);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.pending, 4);
    }

    #[test]
    fn test_capacity_limit() {
        let f = fixture(2);
        f.set.get_or_create("a").unwrap();
        f.set.get_or_create("b").unwrap();

        assert_eq!(
            f.set.get_or_create("c").unwrap_err(),
            Error::ResourceExhaustion(TimerError::Exhausted)
        );
        // Existing keys are still served
        assert!(f.set.get_or_create("a").is_ok());

        let refused = f.set.enqueue("c", f.dest.id(), 7).unwrap_err();
        assert_eq!(refused.into_inner(), 7);

        assert!(f.set.remove(&"a"));
        assert!(f.set.get_or_create("c").is_ok());
    }

    #[test]
    fn test_remove_shuts_down() {
        let f = fixture(16);
        f.set.enqueue("a", f.dest.id(), 1).unwrap();
        let handle = f.set.get(&"a").unwrap();

        assert!(f.set.remove(&"a"));
        assert!(!f.set.remove(&"a"));
        assert!(handle.is_shutting_down());

        let events = f.dest.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Cancelled);
        assert_eq!(f.owner.drain().len(), 1);
        assert_eq!(f.set.stats().total_removed, 1);
    }

    #[test]
    fn test_reap_idle_only_takes_drained_limiters() {
        let f = fixture(16);
        f.set.enqueue("busy", f.dest.id(), 1).unwrap();
        f.set.enqueue("busy", f.dest.id(), 2).unwrap();
        f.set.enqueue("quick", f.dest.id(), 3).unwrap();
        f.set.get_or_create("never-used").unwrap();
        f.set.get_or_create("stalled").unwrap().stall().unwrap();

        f.timers.fire_all();

        assert_eq!(f.set.reap_idle(), 2);
        assert!(f.set.contains_key(&"busy"));
        assert!(f.set.contains_key(&"stalled"));
        assert!(!f.set.contains_key(&"quick"));
        assert!(!f.set.contains_key(&"never-used"));
        assert_eq!(f.owner.drain().len(), 2);
    }

    #[test]
    fn test_cancel_through_set() {
        let f = fixture(16);
        let ticket = f.set.enqueue("a", f.dest.id(), 9).unwrap();
        assert_eq!(f.set.cancel(&"b", &ticket), Err(Error::NotFound));
        assert_eq!(f.set.cancel(&"a", &ticket), Ok(9));
    }

    #[test]
    fn test_shutdown_all_refuses_new_keys() {
        let f = fixture(16);
        f.set.enqueue("a", f.dest.id(), 1).unwrap();
        f.set.enqueue("b", f.dest.id(), 2).unwrap();

        assert_eq!(f.set.shutdown_all(), 2);
        assert!(f.set.is_empty());
        assert!(f.set.is_shutting_down());
        assert_eq!(f.owner.drain().len(), 2);
        assert_eq!(f.dest.drain().len(), 2);

        assert_eq!(f.set.get_or_create("c").unwrap_err(), Error::ShuttingDown);
        let refused = f.set.enqueue("a", f.dest.id(), 3).unwrap_err();
        assert_eq!(refused.error(), &Error::ShuttingDown);

        assert_eq!(f.set.shutdown_all(), 0);
    }

    #[test]
    fn test_invalid_template() {
        let timers = Arc::new(ManualTimer::new());
        let executor = Arc::new(ThreadExecutor::<Item>::new());
        let owner = executor.register();
        let err = RateLimiterSet::<&str, Item>::new(
            timers,
            executor,
            owner.id(),
            RateLimiterConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_concurrent_get_or_create() {
        let f = fixture(64);
        let set = Arc::new(f.set);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for key in ["a", "b", "c", "d"] {
                        set.get_or_create(key).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(set.len(), 4);
        assert_eq!(set.stats().total_created, 4);
        assert_eq!(f.timers.timer_count(), 4);
    }

    #[test]
    fn test_stats_summary() {
        let f = fixture(10);
        f.set.enqueue("a", f.dest.id(), 1).unwrap();
        let stats = f.set.stats();
        assert_eq!(stats.capacity_used(), 0.1);
        assert!(!stats.is_near_capacity());

        let text = stats.to_string();
        assert!(text.contains("Live: 1/10"));
        assert!(text.contains("Pending Items: 1"));
    }
}
