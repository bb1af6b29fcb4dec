//! Driver configuration
//!
//! Plain structs with defaults. [`DriverConfig::from_env`] applies
//! overrides from the process environment:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `TPU_WATCHDOG_TIMEOUT_MS` | comma-separated cascade level timeouts |
//! | `TPU_WATCHDOG_TIMER` | `condvar` or `timerfd` |
//! | `TPU_REALTIME` | `1`/`true` enables deadline admission |
//! | `TPU_REGISTER_POLL_TIMEOUT_MS` | bound on register polls |

use crate::error::{Result, TpuError};
use crate::timer::TimerBackend;
use std::time::Duration;
use tracing::debug;

/// Cascade watchdog levels and timer backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Timeout per escalation level, level 0 first
    pub levels: Vec<Duration>,
    /// Timer used by every level
    pub timer: TimerBackend,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            levels: vec![Duration::from_millis(500), Duration::from_secs(2)],
            timer: TimerBackend::default(),
        }
    }
}

/// Deadline admission settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealTimeConfig {
    /// Start with real-time mode on
    pub enabled: bool,
    /// Frames of silence after which an executable stops constraining
    /// admission
    pub inactive_frame_multiple: u32,
}

impl Default for RealTimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            inactive_frame_multiple: 2,
        }
    }
}

/// Top-level driver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Liveness supervision
    pub watchdog: WatchdogConfig,
    /// Deadline admission
    pub real_time: RealTimeConfig,
    /// Bound on register polls
    pub register_poll_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            watchdog: WatchdogConfig::default(),
            real_time: RealTimeConfig::default(),
            register_poll_timeout: Duration::from_millis(100),
        }
    }
}

impl DriverConfig {
    /// Defaults overridden from the process environment
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through `lookup`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("TPU_WATCHDOG_TIMEOUT_MS") {
            config.watchdog.levels = raw
                .split(',')
                .map(|ms| parse_millis("TPU_WATCHDOG_TIMEOUT_MS", ms))
                .collect::<Result<_>>()?;
        }
        if let Some(raw) = lookup("TPU_WATCHDOG_TIMER") {
            config.watchdog.timer = parse_timer(&raw)?;
        }
        if let Some(raw) = lookup("TPU_REALTIME") {
            config.real_time.enabled = parse_flag("TPU_REALTIME", &raw)?;
        }
        if let Some(raw) = lookup("TPU_REGISTER_POLL_TIMEOUT_MS") {
            config.register_poll_timeout = parse_millis("TPU_REGISTER_POLL_TIMEOUT_MS", &raw)?;
        }

        config.validate()?;
        debug!("driver config: {config:?}");
        Ok(config)
    }

    /// Reject configurations the stack cannot be built from
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty or zero watchdog level, a zero poll
    /// timeout or a zero inactivity multiple.
    pub fn validate(&self) -> Result<()> {
        if self.watchdog.levels.is_empty() {
            return Err(TpuError::invalid_argument("no watchdog levels configured"));
        }
        if let Some(level) = self.watchdog.levels.iter().position(Duration::is_zero) {
            return Err(TpuError::invalid_argument(format!(
                "watchdog level {level} has a zero timeout"
            )));
        }
        if self.register_poll_timeout.is_zero() {
            return Err(TpuError::invalid_argument("register poll timeout is zero"));
        }
        if self.real_time.inactive_frame_multiple == 0 {
            return Err(TpuError::invalid_argument(
                "inactive frame multiple must be at least 1",
            ));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| TpuError::invalid_argument(format!("{key}={raw:?}: {e}")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TpuError::invalid_argument(format!(
            "{key}={raw:?}: expected a boolean"
        ))),
    }
}

fn parse_timer(raw: &str) -> Result<TimerBackend> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "condvar" => Ok(TimerBackend::Condvar),
        "timerfd" => Ok(TimerBackend::TimerFd),
        _ => Err(TpuError::invalid_argument(format!(
            "TPU_WATCHDOG_TIMER={raw:?}: expected condvar or timerfd"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = DriverConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.watchdog.levels.len(), 2);
        assert!(!config.real_time.enabled);
    }

    #[test]
    fn overrides_apply() {
        let config = DriverConfig::from_lookup(lookup(&[
            ("TPU_WATCHDOG_TIMEOUT_MS", "50, 200,1000"),
            ("TPU_WATCHDOG_TIMER", "TimerFd"),
            ("TPU_REALTIME", "on"),
            ("TPU_REGISTER_POLL_TIMEOUT_MS", "7"),
        ]))
        .unwrap();
        assert_eq!(
            config.watchdog.levels,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(200),
                Duration::from_secs(1)
            ]
        );
        assert_eq!(config.watchdog.timer, TimerBackend::TimerFd);
        assert!(config.real_time.enabled);
        assert_eq!(config.register_poll_timeout, Duration::from_millis(7));
    }

    #[test]
    fn bad_values_rejected() {
        for vars in [
            [("TPU_WATCHDOG_TIMEOUT_MS", "fast")],
            [("TPU_WATCHDOG_TIMEOUT_MS", "0")],
            [("TPU_REALTIME", "maybe")],
            [("TPU_WATCHDOG_TIMER", "hpet")],
            [("TPU_REGISTER_POLL_TIMEOUT_MS", "0")],
        ] {
            let err = DriverConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{vars:?}");
        }
    }
}
