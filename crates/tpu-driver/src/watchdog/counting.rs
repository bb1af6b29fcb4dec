//! Watchdog armed while work is outstanding

use super::Watchdog;
use crate::error::{ErrorKind, Result, TpuError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Adapts a [`Watchdog`] to "N outstanding units of work"
///
/// The watchdog is armed on the 0 → 1 transition, signaled on every
/// completed unit and disarmed when the count returns to zero. Progress
/// after an expiry re-arms it.
pub struct CountingWatch {
    watchdog: Arc<dyn Watchdog>,
    depth: Mutex<u64>,
}

impl std::fmt::Debug for CountingWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingWatch")
            .field("depth", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl CountingWatch {
    /// Wrap `watchdog`; starts at depth zero
    pub fn new(watchdog: Arc<dyn Watchdog>) -> Self {
        Self {
            watchdog,
            depth: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.depth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current pipeline depth
    pub fn depth(&self) -> u64 {
        *self.lock()
    }

    /// One more unit of work in flight
    ///
    /// # Errors
    ///
    /// `Internal` if the counter would overflow, or the watchdog's
    /// activation error.
    pub fn increment(&self) -> Result<()> {
        let mut depth = self.lock();
        if *depth == u64::MAX {
            return Err(TpuError::internal("counting watch overflow"));
        }
        if *depth == 0 {
            self.watchdog.activate()?;
        }
        *depth += 1;
        Ok(())
    }

    /// One unit of work finished
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if nothing is outstanding. The count is
    /// decremented even when the watchdog then reports an error.
    pub fn decrement(&self) -> Result<()> {
        let mut depth = self.lock();
        if *depth == 0 {
            return Err(TpuError::failed_precondition(
                "counting watch decremented at zero",
            ));
        }
        *depth -= 1;
        if *depth == 0 {
            return self.watchdog.deactivate();
        }
        match self.watchdog.signal() {
            Err(e) if e.kind() == ErrorKind::FailedPrecondition => {
                self.watchdog.activate().map(|_| ())
            }
            other => other,
        }
    }
}

impl Drop for CountingWatch {
    fn drop(&mut self) {
        let depth = *self.lock();
        if depth != 0 {
            warn!("counting watch dropped with {depth} units outstanding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::{TimerWatchdog, WatchdogState};
    use std::time::Duration;

    #[test]
    fn arms_on_first_and_disarms_on_last() {
        let dog = Arc::new(TimerWatchdog::new(Duration::from_secs(10), |_| {}).unwrap());
        let watch = CountingWatch::new(Arc::clone(&dog) as Arc<dyn Watchdog>);

        watch.increment().unwrap();
        assert_eq!(dog.state(), WatchdogState::Active);
        let id = dog.activation_id();
        watch.increment().unwrap();
        assert_eq!(dog.activation_id(), id);
        assert_eq!(watch.depth(), 2);

        watch.decrement().unwrap();
        assert_eq!(dog.state(), WatchdogState::Active);
        watch.decrement().unwrap();
        assert_eq!(dog.state(), WatchdogState::Inactive);
    }

    #[test]
    fn progress_after_expiry_rearms() {
        let dog = Arc::new(TimerWatchdog::new(Duration::from_millis(10), |_| {}).unwrap());
        let watch = CountingWatch::new(Arc::clone(&dog) as Arc<dyn Watchdog>);

        watch.increment().unwrap();
        watch.increment().unwrap();
        watch.increment().unwrap();
        let first = dog.activation_id();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(dog.state(), WatchdogState::Inactive);

        watch.decrement().unwrap();
        assert_eq!(watch.depth(), 2);
        assert_eq!(dog.state(), WatchdogState::Active);
        assert!(dog.activation_id() > first);

        watch.decrement().unwrap();
        watch.decrement().unwrap();
        assert_eq!(watch.depth(), 0);
        assert_eq!(dog.state(), WatchdogState::Inactive);
    }

    #[test]
    fn decrement_at_zero_fails() {
        let watch = CountingWatch::new(Arc::new(crate::watchdog::NoopWatchdog));
        let err = watch.decrement().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn increment_at_max_fails() {
        let watch = CountingWatch::new(Arc::new(crate::watchdog::NoopWatchdog));
        *watch.lock() = u64::MAX;
        let err = watch.increment().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
        *watch.lock() = 0;
    }
}
