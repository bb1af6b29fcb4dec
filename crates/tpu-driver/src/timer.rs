//! Countdown timers and clocks
//!
//! A [`CountdownTimer`] is the hardware-timer interface the watchdogs block
//! on. [`CondvarTimer`] works everywhere; on Linux `TimerFd` wraps a kernel
//! `timerfd`. [`Clock`] is the time source for real-time admission.

use crate::error::Result;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// One-shot countdown timer
pub trait CountdownTimer: Send + Sync {
    /// Arm the timer to expire after `duration`; zero disarms it
    ///
    /// Re-arming replaces any pending expiry.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying timer cannot be programmed.
    fn set(&self, duration: Duration) -> Result<()>;

    /// Block until the timer expires
    ///
    /// Returns the number of expirations observed (at least one).
    ///
    /// # Errors
    ///
    /// Returns error if waiting on the underlying timer fails.
    fn wait(&self) -> Result<u64>;
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
}

/// Portable countdown timer built on a mutex and condition variable
#[derive(Debug, Default)]
pub struct CondvarTimer {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl CondvarTimer {
    /// Create a disarmed timer
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CountdownTimer for CondvarTimer {
    fn set(&self, duration: Duration) -> Result<()> {
        let mut state = self.lock();
        state.deadline = if duration.is_zero() {
            None
        } else {
            Some(Instant::now() + duration)
        };
        self.changed.notify_all();
        Ok(())
    }

    fn wait(&self) -> Result<u64> {
        let mut state = self.lock();
        loop {
            match state.deadline {
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.deadline = None;
                        return Ok(1);
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

/// Timer backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerBackend {
    /// Portable mutex/condvar timer
    #[default]
    Condvar,
    /// Kernel `timerfd` (Linux only)
    TimerFd,
}

impl TimerBackend {
    /// Create a fresh timer of this kind
    ///
    /// # Errors
    ///
    /// Returns error if the kernel timer cannot be created, or
    /// `FailedPrecondition` when `TimerFd` is requested off Linux.
    pub fn create(self) -> Result<Arc<dyn CountdownTimer>> {
        match self {
            Self::Condvar => Ok(Arc::new(CondvarTimer::new())),
            #[cfg(target_os = "linux")]
            Self::TimerFd => Ok(Arc::new(crate::timerfd::TimerFd::new()?)),
            #[cfg(not(target_os = "linux"))]
            Self::TimerFd => Err(crate::TpuError::failed_precondition(
                "timerfd backend is only available on Linux",
            )),
        }
    }
}

impl std::fmt::Display for TimerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Condvar => write!(f, "condvar"),
            Self::TimerFd => write!(f, "timerfd"),
        }
    }
}

/// Monotonic time source, as an offset from an arbitrary epoch
pub trait Clock: Send + Sync {
    /// Current time since the clock's epoch
    fn now(&self) -> Duration;
}

/// Wall-independent clock backed by [`Instant`]
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Clock whose epoch is "now"
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Hand-driven clock for deterministic tests and simulation
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// Clock starting at `start`
    pub fn starting_at(start: Duration) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Jump to an absolute time; never moves backwards
    pub fn set(&self, to: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if to > *now {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn condvar_timer_expires_once() {
        let timer = CondvarTimer::new();
        timer.set(Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        assert_eq!(timer.wait().unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    #[test]
    fn rearm_postpones_expiry() {
        let timer = Arc::new(CondvarTimer::new());
        timer.set(Duration::from_millis(100)).unwrap();
        let start = Instant::now();
        let rearm = Arc::clone(&timer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            rearm.set(Duration::from_millis(200)).unwrap();
        });
        timer.wait().unwrap();
        handle.join().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn disarmed_timer_blocks_until_armed() {
        let timer = Arc::new(CondvarTimer::new());
        let arm = Arc::clone(&timer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            arm.set(Duration::from_nanos(1)).unwrap();
        });
        assert_eq!(timer.wait().unwrap(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn manual_clock_is_monotonic() {
        let clock = ManualClock::starting_at(Duration::from_secs(1));
        clock.advance(Duration::from_millis(5));
        clock.set(Duration::from_millis(2));
        assert_eq!(clock.now(), Duration::from_millis(1005));
    }

    #[test]
    fn condvar_backend_creates_timer() {
        let timer = TimerBackend::Condvar.create().unwrap();
        timer.set(Duration::from_millis(1)).unwrap();
        assert_eq!(timer.wait().unwrap(), 1);
    }
}
