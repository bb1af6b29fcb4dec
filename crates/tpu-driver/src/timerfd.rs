//! Kernel-backed countdown timer
//!
//! Wraps a Linux `timerfd` on `CLOCK_MONOTONIC` through rustix. `wait`
//! blocks in `read(2)` and returns the kernel's expiration count.

use crate::error::{Result, TpuError};
use crate::timer::CountdownTimer;
use rustix::fd::OwnedFd;
use rustix::io::{read, Errno};
use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags,
    Timespec,
};
use std::time::Duration;

/// `timerfd`-backed [`CountdownTimer`]
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    /// Create a disarmed monotonic timer
    ///
    /// # Errors
    ///
    /// Returns error if the kernel refuses to create the timer.
    pub fn new() -> Result<Self> {
        let fd = timerfd_create(TimerfdClockId::Monotonic, TimerfdFlags::CLOEXEC)
            .map_err(|e| TpuError::unknown(format!("timerfd_create failed: {e}")))?;
        Ok(Self { fd })
    }
}

#[allow(clippy::cast_possible_wrap)]
fn timespec(duration: Duration) -> Timespec {
    Timespec {
        tv_sec: duration.as_secs() as _,
        tv_nsec: duration.subsec_nanos() as _,
    }
}

impl CountdownTimer for TimerFd {
    fn set(&self, duration: Duration) -> Result<()> {
        let spec = Itimerspec {
            it_interval: timespec(Duration::ZERO),
            it_value: timespec(duration),
        };
        timerfd_settime(&self.fd, TimerfdTimerFlags::empty(), &spec)
            .map(|_| ())
            .map_err(|e| TpuError::unknown(format!("timerfd_settime failed: {e}")))
    }

    fn wait(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        loop {
            match read(&self.fd, &mut buf) {
                Ok(8) => return Ok(u64::from_ne_bytes(buf)),
                Ok(n) => {
                    return Err(TpuError::unknown(format!(
                        "timerfd read returned {n} bytes"
                    )))
                }
                Err(Errno::INTR) => continue,
                Err(e) => return Err(TpuError::unknown(format!("timerfd read failed: {e}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn timerfd_expires_after_duration() {
        let timer = TimerFd::new().unwrap();
        let start = Instant::now();
        timer.set(Duration::from_millis(10)).unwrap();
        assert!(timer.wait().unwrap() >= 1);
        assert!(start.elapsed() >= Duration::from_millis(9));
    }
}
