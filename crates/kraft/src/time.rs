use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::input::{Input, SampledInput};

/// Monotonic time reader supplied by the animation driver.
pub trait Clock: Send + Sync {
    /// Time since an arbitrary fixed origin. Must never go backwards.
    fn now(&self) -> Duration;
}

/// Clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock advanced by hand. Used by deterministic renders and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_millis(&self, millis: u64) {
        self.set_nanos(millis.saturating_mul(1_000_000));
    }

    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug)]
struct TimerInner {
    state: TimerState,
    start_epoch: Option<Duration>,
    accumulated: Duration,
    last_sampled: f32,
}

impl TimerInner {
    fn elapsed(&self, now: Duration) -> Duration {
        match (self.state, self.start_epoch) {
            (TimerState::Running, Some(epoch)) => self.accumulated + now.saturating_sub(epoch),
            _ => self.accumulated,
        }
    }
}

/// Elapsed seconds of play time, excluding paused intervals.
///
/// Starts [`TimerState::Stopped`] at zero. Elapsed time only accrues while
/// running, so it stays at zero until the first [`start`](TimeInput::start)
/// no matter how far the clock advances.
pub struct TimeInput {
    clock: Arc<dyn Clock>,
    inner: Mutex<TimerInner>,
}

impl TimeInput {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(TimerInner {
                state: TimerState::Stopped,
                start_epoch: None,
                accumulated: Duration::ZERO,
                last_sampled: 0.0,
            }),
        }
    }

    /// Convenience constructor over the process monotonic clock.
    pub fn monotonic() -> Self {
        Self::new(Arc::new(MonotonicClock::new()))
    }

    pub fn state(&self) -> TimerState {
        self.lock().state
    }

    /// Stopped or paused → running. Already running is a no-op.
    pub fn start(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.state == TimerState::Running {
            return;
        }
        inner.start_epoch = Some(now);
        inner.state = TimerState::Running;
    }

    /// Running → paused, freezing elapsed time. Also refreshes the cached
    /// value so `get()` reports the frozen time immediately.
    pub fn pause(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.state != TimerState::Running {
            return;
        }
        inner.accumulated = inner.elapsed(now);
        inner.start_epoch = None;
        inner.state = TimerState::Paused;
        inner.last_sampled = inner.accumulated.as_secs_f32();
    }

    /// Back to stopped with elapsed reset to zero.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.state = TimerState::Stopped;
        inner.start_epoch = None;
        inner.accumulated = Duration::ZERO;
        inner.last_sampled = 0.0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Input<f32> for TimeInput {
    fn get(&self) -> f32 {
        self.lock().last_sampled
    }
}

impl SampledInput<f32> for TimeInput {
    fn sample(&self) -> f32 {
        let now = self.clock.now();
        let mut inner = self.lock();
        let seconds = inner.elapsed(now).as_secs_f32();
        inner.last_sampled = seconds;
        seconds
    }
}
