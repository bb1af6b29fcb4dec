//! Liveness supervision for the hardware queue
//!
//! ```text
//! TimerWatchdog    one timeout; fires a callback unless signaled in time
//! CascadeWatchdog  N timeouts escalating level by level
//! CountingWatch    arms while N > 0 units of work are outstanding
//! NoopWatchdog     always succeeds; for tests and simulation
//! ```
//!
//! Expiry never runs user code on the timer thread: the watcher posts an
//! event to a callback-executor thread, which invokes the callback with no
//! lock held so the callback may call back into the watchdog.

mod cascade;
mod counting;
mod timer;

pub use cascade::{CascadeLevel, CascadeWatchdog};
pub use counting::CountingWatch;
pub use timer::TimerWatchdog;

use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Called with the activation id of the arm cycle that expired
pub type ExpireCallback = Arc<dyn Fn(u64) + Send + Sync + 'static>;

/// Watchdog lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Not armed
    Inactive,
    /// Armed, timer running
    Active,
    /// Expired; callback pending or running
    Barking,
    /// Shut down; terminal
    Destroyed,
}

/// Liveness timer contract
pub trait Watchdog: Send + Sync {
    /// Arm the watchdog
    ///
    /// Idempotent while active: returns the current activation id.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` once destroyed.
    fn activate(&self) -> Result<u64>;

    /// Refresh the timer so it does not expire
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` when inactive or destroyed.
    fn signal(&self) -> Result<()>;

    /// Disarm the watchdog
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` once destroyed.
    fn deactivate(&self) -> Result<()>;

    /// Change the timeout used from the next arm onwards
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero timeout.
    fn update_timeout(&self, timeout: Duration) -> Result<()>;
}

/// Watchdog that never fires
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn activate(&self) -> Result<u64> {
        Ok(0)
    }

    fn signal(&self) -> Result<()> {
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    fn update_timeout(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

fn validate_timeout(timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(crate::TpuError::invalid_argument(
            "watchdog timeout must be greater than zero",
        ));
    }
    Ok(())
}
