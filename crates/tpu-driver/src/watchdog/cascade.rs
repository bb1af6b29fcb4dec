//! Multi-level escalating watchdog
//!
//! Level 0 is armed on activate/signal. When level *i* expires its callback
//! is queued on the cascade's executor and level *i + 1* is armed, so a
//! silent device walks up the chain (e.g. warn → soft reset → fatal).

use super::{validate_timeout, ExpireCallback, TimerWatchdog, Watchdog};
use crate::error::{Result, TpuError};
use crate::executor::CallbackExecutor;
use crate::timer::{CondvarTimer, CountdownTimer};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// One rung of a [`CascadeWatchdog`]
#[derive(Clone)]
pub struct CascadeLevel {
    /// Silence tolerated at this level before escalating
    pub timeout: Duration,
    /// Invoked when this level expires
    pub on_expire: ExpireCallback,
}

impl CascadeLevel {
    /// Create a level
    pub fn new(timeout: Duration, on_expire: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            timeout,
            on_expire: Arc::new(on_expire),
        }
    }
}

impl std::fmt::Debug for CascadeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeLevel")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct CascadeInner {
    active_level: Option<usize>,
    /// Child activation id recorded when each level was last armed.
    armed_ids: Vec<u64>,
}

struct CascadeShared {
    inner: Mutex<CascadeInner>,
    children: OnceLock<Vec<TimerWatchdog>>,
    callbacks: Vec<ExpireCallback>,
    executor: CallbackExecutor,
}

impl CascadeShared {
    fn lock(&self) -> MutexGuard<'_, CascadeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn children(&self) -> &[TimerWatchdog] {
        self.children.get().map_or(&[], Vec::as_slice)
    }

    fn restart(&self) -> Result<u64> {
        let mut inner = self.lock();
        let children = self.children();
        if let Some(level) = inner.active_level.take() {
            children[level].deactivate()?;
        }
        let id = children[0].activate()?;
        inner.armed_ids[0] = id;
        inner.active_level = Some(0);
        Ok(id)
    }

    fn on_child_expired(&self, level: usize, activation_id: u64) {
        let mut inner = self.lock();
        if inner.active_level != Some(level) || inner.armed_ids[level] != activation_id {
            debug!("cascade level {level}: discarding stale expiry (activation {activation_id})");
            return;
        }

        warn!("cascade level {level} expired");
        let callback = Arc::clone(&self.callbacks[level]);
        self.executor.execute(move || callback(activation_id));

        let next = level + 1;
        let children = self.children();
        if next < children.len() {
            match children[next].activate() {
                Ok(id) => {
                    inner.armed_ids[next] = id;
                    inner.active_level = Some(next);
                }
                Err(e) => {
                    error!("cascade level {next} failed to arm: {e}");
                    inner.active_level = None;
                }
            }
        } else {
            inner.active_level = None;
        }
    }
}

/// Escalating chain of [`TimerWatchdog`]s
pub struct CascadeWatchdog {
    shared: Arc<CascadeShared>,
}

impl std::fmt::Debug for CascadeWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeWatchdog")
            .field("levels", &self.shared.children().len())
            .field("active_level", &self.shared.lock().active_level)
            .finish()
    }
}

impl CascadeWatchdog {
    /// Cascade whose levels each run on a [`CondvarTimer`]
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty level list or a zero timeout.
    pub fn new(levels: Vec<CascadeLevel>) -> Result<Self> {
        Self::with_timers(levels, || {
            Ok(Arc::new(CondvarTimer::new()) as Arc<dyn CountdownTimer>)
        })
    }

    /// Cascade whose per-level timers come from `make_timer`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty level list or a zero timeout, or the
    /// error from `make_timer` / thread creation.
    pub fn with_timers(
        levels: Vec<CascadeLevel>,
        mut make_timer: impl FnMut() -> Result<Arc<dyn CountdownTimer>>,
    ) -> Result<Self> {
        if levels.is_empty() {
            return Err(TpuError::invalid_argument(
                "cascade watchdog needs at least one level",
            ));
        }
        for level in &levels {
            validate_timeout(level.timeout)?;
        }

        let shared = Arc::new(CascadeShared {
            inner: Mutex::new(CascadeInner {
                active_level: None,
                armed_ids: vec![0; levels.len()],
            }),
            children: OnceLock::new(),
            callbacks: levels.iter().map(|l| Arc::clone(&l.on_expire)).collect(),
            executor: CallbackExecutor::spawn("tpu-cascade-cb")?,
        });

        let children = levels
            .iter()
            .enumerate()
            .map(|(level, cfg)| {
                let weak = Arc::downgrade(&shared);
                TimerWatchdog::with_timer(
                    cfg.timeout,
                    make_timer()?,
                    Arc::new(move |id| {
                        if let Some(cascade) = weak.upgrade() {
                            cascade.on_child_expired(level, id);
                        }
                    }),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        shared
            .children
            .set(children)
            .map_err(|_| TpuError::internal("cascade children initialised twice"))?;

        debug!("cascade watchdog created with {} levels", levels.len());
        Ok(Self { shared })
    }

    /// Number of levels
    pub fn level_count(&self) -> usize {
        self.shared.children().len()
    }

    /// Level currently armed, if any
    pub fn active_level(&self) -> Option<usize> {
        self.shared.lock().active_level
    }

    /// Change the timeout of one level
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero timeout.
    ///
    /// # Panics
    ///
    /// Panics if `level` is out of range.
    pub fn update_timeout_at(&self, level: usize, timeout: Duration) -> Result<()> {
        let children = self.shared.children();
        assert!(
            level < children.len(),
            "cascade level {level} out of range ({} levels)",
            children.len()
        );
        children[level].update_timeout(timeout)
    }
}

impl Watchdog for CascadeWatchdog {
    fn activate(&self) -> Result<u64> {
        self.shared.restart()
    }

    fn signal(&self) -> Result<()> {
        self.shared.restart().map(|_| ())
    }

    fn deactivate(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if let Some(level) = inner.active_level.take() {
            self.shared.children()[level].deactivate()?;
        }
        Ok(())
    }

    fn update_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_timeout_at(0, timeout)
    }
}

impl Drop for CascadeWatchdog {
    fn drop(&mut self) {
        if let Err(e) = self.deactivate() {
            debug!("cascade deactivate on drop: {e}");
        }
    }
}
