//! # Timer Services
//!
//! A limiter never sleeps. It asks a [`TimerService`] to call it back every
//! `interval` while it has work, and to stop when it goes idle.
//!
//! ```text
//!     ThreadTimer
//!
//!     limiter ──arm/disarm──► command channel ──► timer thread
//!                                                    │
//!                                     ┌──────────────┘
//!                                     ▼
//!                              deadline heap
//!                           (when, timer, gen)
//!                                     │ due
//!                                     ▼
//!                          target.on_tick(timer)
//!                         (no timer lock held)
//! ```
//!
//! Arming and disarming are plain channel sends, so a limiter can call them
//! while holding its own lock without any risk of lock-order inversion: the
//! timer thread never takes a timer-side lock while it runs a callback.
//!
//! [`ManualTimer`] implements the same contract but only fires when told to,
//! which makes tick-by-tick behavior easy to test.

use super::error::TimerError;
use crossbeam_channel::{RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Default number of timers a [`ThreadTimer`] will hand out.
pub const DEFAULT_MAX_TIMERS: usize = 4096;

/// Stale heap entries tolerated beyond twice the armed count before a prune.
const STALE_DEADLINE_SLACK: usize = 64;

/// Handle to one timer slot inside a [`TimerService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// The raw id.
    #[inline]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Something a timer can fire into.
pub trait TickTarget: Send + Sync {
    /// Called once per expiry of `timer`.
    fn on_tick(&self, timer: TimerId);
}

/// Recurring timers consumed by rate limiters.
///
/// Implementations must not block in `arm_recurring` or `disarm`, and must
/// never invoke a target from inside those calls. At most one `on_tick` may
/// be in flight per timer.
pub trait TimerService: Send + Sync {
    /// Allocates an inactive timer.
    fn create_timer(&self) -> Result<TimerId, TimerError>;

    /// Starts (or restarts) `timer`, firing into `target` every `interval`.
    fn arm_recurring(
        &self,
        timer: TimerId,
        interval: Duration,
        target: Weak<dyn TickTarget>,
    ) -> Result<(), TimerError>;

    /// Stops `timer`. Disarming an inactive timer is a no-op.
    fn disarm(&self, timer: TimerId);

    /// Stops and releases `timer`.
    fn destroy_timer(&self, timer: TimerId);
}

enum Command {
    Arm {
        timer: TimerId,
        interval: Duration,
        target: Weak<dyn TickTarget>,
    },
    Disarm(TimerId),
    Shutdown,
}

struct Armed {
    interval: Duration,
    target: Weak<dyn TickTarget>,
    generation: u64,
}

/// Timer service running on one dedicated thread.
///
/// ```rust
/// use pacer::ThreadTimer;
///
/// let timers = ThreadTimer::start("pacer-timer").unwrap();
/// // share with limiters as Arc<dyn TimerService>
/// timers.shutdown();
/// ```
pub struct ThreadTimer {
    commands: Sender<Command>,
    next_id: AtomicU64,
    allocated: DashMap<TimerId, (), ahash::RandomState>,
    live: AtomicUsize,
    max_timers: usize,
    shutting_down: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThreadTimer {
    /// Starts the timer thread with [`DEFAULT_MAX_TIMERS`] slots.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn start(name: &str) -> io::Result<Arc<Self>> {
        Self::with_capacity(name, DEFAULT_MAX_TIMERS)
    }

    /// Starts the timer thread with room for `max_timers` timers.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn with_capacity(name: &str, max_timers: usize) -> io::Result<Arc<Self>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_timer_thread(rx))?;

        info!(thread = name, max_timers, "started timer service");

        Ok(Arc::new(Self {
            commands: tx,
            next_id: AtomicU64::new(1),
            allocated: DashMap::with_hasher(ahash::RandomState::new()),
            live: AtomicUsize::new(0),
            max_timers,
            shutting_down: AtomicBool::new(false),
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// Number of timers currently allocated.
    pub fn live_timers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stops the timer thread and waits for it to exit.
    ///
    /// Callbacks already running finish first. Later arms fail with
    /// [`TimerError::ShuttingDown`].
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(Command::Shutdown);

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            // A callback may drop the last Arc to us from the timer thread
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

impl TimerService for ThreadTimer {
    fn create_timer(&self) -> Result<TimerId, TimerError> {
        if self.is_shutting_down() {
            return Err(TimerError::ShuttingDown);
        }

        let prev = self.live.fetch_add(1, Ordering::AcqRel);
        if prev >= self.max_timers {
            self.live.fetch_sub(1, Ordering::AcqRel);
            warn!(max_timers = self.max_timers, "timer table full");
            return Err(TimerError::Exhausted);
        }

        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.allocated.insert(id, ());
        Ok(id)
    }

    fn arm_recurring(
        &self,
        timer: TimerId,
        interval: Duration,
        target: Weak<dyn TickTarget>,
    ) -> Result<(), TimerError> {
        if interval.is_zero() {
            return Err(TimerError::ZeroInterval);
        }
        if self.is_shutting_down() {
            return Err(TimerError::ShuttingDown);
        }
        if !self.allocated.contains_key(&timer) {
            return Err(TimerError::UnknownTimer);
        }
        self.commands
            .send(Command::Arm {
                timer,
                interval,
                target,
            })
            .map_err(|_| TimerError::ShuttingDown)
    }

    fn disarm(&self, timer: TimerId) {
        let _ = self.commands.send(Command::Disarm(timer));
    }

    fn destroy_timer(&self, timer: TimerId) {
        if self.allocated.remove(&timer).is_none() {
            debug!(timer = %timer, "ignoring destroy of unknown timer");
            return;
        }
        self.disarm(timer);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTimer")
            .field("live_timers", &self.live_timers())
            .field("max_timers", &self.max_timers)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

fn run_timer_thread(rx: crossbeam_channel::Receiver<Command>) {
    let mut armed: HashMap<TimerId, Armed> = HashMap::new();
    let mut deadlines: BinaryHeap<Reverse<(Instant, TimerId, u64)>> = BinaryHeap::new();
    let mut generation: u64 = 0;

    loop {
        let command = match deadlines.peek() {
            Some(Reverse((when, _, _))) => match rx.recv_deadline(*when) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        match command {
            Some(Command::Arm {
                timer,
                interval,
                target,
            }) => {
                generation += 1;
                deadlines.push(Reverse((Instant::now() + interval, timer, generation)));
                armed.insert(
                    timer,
                    Armed {
                        interval,
                        target,
                        generation,
                    },
                );
                trace!(timer = %timer, ?interval, "armed");
                prune_stale(&armed, &mut deadlines);
            }
            Some(Command::Disarm(timer)) => {
                if armed.remove(&timer).is_some() {
                    trace!(timer = %timer, "disarmed");
                    prune_stale(&armed, &mut deadlines);
                }
            }
            Some(Command::Shutdown) => break,
            None => fire_due(&mut armed, &mut deadlines),
        }
    }

    debug!(pending = armed.len(), "timer thread exiting");
}

/// Drops heap entries left behind by re-arms and disarms once they outnumber
/// the live ones.
fn prune_stale(
    armed: &HashMap<TimerId, Armed>,
    deadlines: &mut BinaryHeap<Reverse<(Instant, TimerId, u64)>>,
) {
    if deadlines.len() <= armed.len() * 2 + STALE_DEADLINE_SLACK {
        return;
    }
    let before = deadlines.len();
    deadlines.retain(|Reverse((_, timer, generation))| {
        armed
            .get(timer)
            .map_or(false, |entry| entry.generation == *generation)
    });
    trace!(before, after = deadlines.len(), "pruned stale deadlines");
}

fn fire_due(
    armed: &mut HashMap<TimerId, Armed>,
    deadlines: &mut BinaryHeap<Reverse<(Instant, TimerId, u64)>>,
) {
    let now = Instant::now();
    while let Some(Reverse((when, timer, generation))) = deadlines.peek().copied() {
        if when > now {
            break;
        }
        deadlines.pop();

        // Stale entry from a disarm or re-arm
        let Some(entry) = armed.get(&timer) else { continue };
        if entry.generation != generation {
            continue;
        }

        let Some(target) = entry.target.upgrade() else {
            trace!(timer = %timer, "target gone, dropping timer");
            armed.remove(&timer);
            continue;
        };

        // Skip missed periods instead of bursting to catch up
        let mut next = when + entry.interval;
        if next <= now {
            next = now + entry.interval;
        }
        deadlines.push(Reverse((next, timer, generation)));

        target.on_tick(timer);
    }
}

#[derive(Default)]
struct ManualState {
    next_id: u64,
    timers: HashMap<TimerId, Option<(Duration, Weak<dyn TickTarget>)>>,
    fail_next_arm: Option<TimerError>,
    shutting_down: bool,
    arms: u64,
}

/// Timer service that only fires when told to.
///
/// ```rust
/// use pacer::{Event, ManualTimer, RateLimiterConfig, RateLimiter, ThreadExecutor};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let timers = Arc::new(ManualTimer::new());
/// let executor = Arc::new(ThreadExecutor::<&str>::new());
/// let owner = executor.register();
/// let worker = executor.register();
///
/// let config = RateLimiterConfig::new(Duration::from_millis(100), 1);
/// let limiter = RateLimiter::with_config(timers.clone(), executor, owner.id(), config).unwrap();
/// limiter.enqueue(worker.id(), "job").unwrap();
///
/// assert!(worker.try_recv().is_none());
/// timers.fire_all();
/// assert!(matches!(worker.try_recv(), Some(Event::Released("job"))));
/// ```
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<ManualState>,
}

impl ManualTimer {
    /// Creates a timer service with no timers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires `timer` once if it is armed. Returns whether a target ran.
    pub fn fire(&self, timer: TimerId) -> bool {
        let target = {
            let state = self.state.lock();
            match state.timers.get(&timer) {
                Some(Some((_, target))) => target.clone(),
                _ => return false,
            }
        };

        match target.upgrade() {
            Some(target) => {
                target.on_tick(timer);
                true
            }
            None => false,
        }
    }

    /// Fires every armed timer once, in id order. Returns how many ran.
    pub fn fire_all(&self) -> usize {
        let mut ids: Vec<TimerId> = {
            let state = self.state.lock();
            state
                .timers
                .iter()
                .filter(|(_, slot)| slot.is_some())
                .map(|(id, _)| *id)
                .collect()
        };
        ids.sort();
        ids.into_iter().filter(|id| self.fire(*id)).count()
    }

    /// Returns `true` if `timer` is armed.
    pub fn is_armed(&self, timer: TimerId) -> bool {
        matches!(self.state.lock().timers.get(&timer), Some(Some(_)))
    }

    /// Interval `timer` is armed with.
    pub fn armed_interval(&self, timer: TimerId) -> Option<Duration> {
        match self.state.lock().timers.get(&timer) {
            Some(Some((interval, _))) => Some(*interval),
            _ => None,
        }
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.state.lock().timers.values().filter(|slot| slot.is_some()).count()
    }

    /// Number of allocated timers, armed or not.
    pub fn timer_count(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// Lifetime count of successful arms.
    pub fn arm_count(&self) -> u64 {
        self.state.lock().arms
    }

    /// Makes the next `arm_recurring` call fail with `err`.
    pub fn fail_next_arm(&self, err: TimerError) {
        self.state.lock().fail_next_arm = Some(err);
    }

    /// Refuses all further creates and arms.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        for slot in state.timers.values_mut() {
            *slot = None;
        }
    }
}

impl TimerService for ManualTimer {
    fn create_timer(&self) -> Result<TimerId, TimerError> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(TimerError::ShuttingDown);
        }
        state.next_id += 1;
        let id = TimerId(state.next_id);
        state.timers.insert(id, None);
        Ok(id)
    }

    fn arm_recurring(
        &self,
        timer: TimerId,
        interval: Duration,
        target: Weak<dyn TickTarget>,
    ) -> Result<(), TimerError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_arm.take() {
            return Err(err);
        }
        if state.shutting_down {
            return Err(TimerError::ShuttingDown);
        }
        if interval.is_zero() {
            return Err(TimerError::ZeroInterval);
        }
        match state.timers.get_mut(&timer) {
            Some(slot) => {
                *slot = Some((interval, target));
                state.arms += 1;
                Ok(())
            }
            None => Err(TimerError::UnknownTimer),
        }
    }

    fn disarm(&self, timer: TimerId) {
        if let Some(slot) = self.state.lock().timers.get_mut(&timer) {
            *slot = None;
        }
    }

    fn destroy_timer(&self, timer: TimerId) {
        self.state.lock().timers.remove(&timer);
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualTimer")
            .field("timers", &state.timers.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}
