//! Explicitly wired driver object graph
//!
//! ```text
//! Request ─split─> HardwareRequest ─> RealTimeDmaScheduler
//!                                        └─> SingleQueueDmaScheduler ─> CascadeWatchdog
//! ```
//!
//! Everything is built from a [`DriverConfig`] and owned by the stack; there
//! is no process-wide state.

use crate::backends::{EngineConfig, SoftwareDmaEngine};
use crate::config::DriverConfig;
use crate::error::{Result, TpuError};
use crate::registers::Registers;
use crate::request::{Request, RequestState};
use crate::scheduler::{CloseMode, DmaScheduler, RealTimeDmaScheduler, SingleQueueDmaScheduler};
use crate::timer::{Clock, MonotonicClock};
use crate::tpu_request::{HardwareRequest, TpuRequest};
use crate::watchdog::{CascadeLevel, CascadeWatchdog, Watchdog};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Scheduler stack the I/O layer drives
pub type StackScheduler = RealTimeDmaScheduler<SingleQueueDmaScheduler>;

/// Cascade watchdog, single-queue scheduler and real-time admission
pub struct DriverStack {
    config: DriverConfig,
    watchdog: Arc<CascadeWatchdog>,
    scheduler: Arc<StackScheduler>,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for DriverStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverStack")
            .field("config", &self.config)
            .field("watchdog", &self.watchdog)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl DriverStack {
    /// Build and open a stack on the monotonic clock
    ///
    /// `on_expire` receives the escalation level and activation id of every
    /// watchdog expiry.
    ///
    /// # Errors
    ///
    /// Invalid configuration, or timer/thread creation failures.
    pub fn new(
        config: DriverConfig,
        on_expire: impl Fn(usize, u64) + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()), on_expire)
    }

    /// Build and open a stack on `clock`
    ///
    /// # Errors
    ///
    /// As [`DriverStack::new`].
    pub fn with_clock(
        config: DriverConfig,
        clock: Arc<dyn Clock>,
        on_expire: impl Fn(usize, u64) + Send + Sync + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let on_expire = Arc::new(on_expire);
        let levels = config
            .watchdog
            .levels
            .iter()
            .enumerate()
            .map(|(level, &timeout)| {
                let on_expire = Arc::clone(&on_expire);
                CascadeLevel::new(timeout, move |id| on_expire(level, id))
            })
            .collect();
        let timer = config.watchdog.timer;
        let watchdog = Arc::new(CascadeWatchdog::with_timers(levels, || timer.create())?);

        let single = SingleQueueDmaScheduler::new(Arc::clone(&watchdog) as Arc<dyn Watchdog>);
        let scheduler = Arc::new(RealTimeDmaScheduler::new(
            single,
            clock,
            config.real_time.inactive_frame_multiple,
        ));
        scheduler.set_realtime_mode(config.real_time.enabled);
        scheduler.open()?;

        info!(
            "driver stack up: {} watchdog level(s) on {}, real-time {}",
            config.watchdog.levels.len(),
            timer,
            config.real_time.enabled
        );
        Ok(Self {
            config,
            watchdog,
            scheduler,
            next_request_id: AtomicU64::new(0),
        })
    }

    /// Configuration the stack was built from
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Top of the scheduler chain
    pub fn scheduler(&self) -> &Arc<StackScheduler> {
        &self.scheduler
    }

    /// Liveness supervisor
    pub fn watchdog(&self) -> &Arc<CascadeWatchdog> {
        &self.watchdog
    }

    /// Software engine over `registers`, driving this stack's scheduler
    ///
    /// # Errors
    ///
    /// Register access failures during queue reset.
    pub fn software_engine(
        &self,
        registers: Arc<dyn Registers>,
        engine: EngineConfig,
    ) -> Result<SoftwareDmaEngine> {
        SoftwareDmaEngine::new(
            Arc::clone(&self.scheduler) as Arc<dyn DmaScheduler>,
            registers,
            EngineConfig {
                poll_timeout: self.config.register_poll_timeout,
                ..engine
            },
        )
    }

    /// Split a prepared request into hardware requests and submit them all
    ///
    /// On a rejected submission or a failed preparation the remaining
    /// sub-requests are completed with the same error, so the request's done
    /// callback still fires exactly once.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` unless the request is `Prepared`, otherwise the
    /// first preparation or submission error.
    pub fn submit(&self, request: &Arc<Request>) -> Result<usize> {
        if request.state() != RequestState::Prepared {
            return Err(TpuError::failed_precondition(format!(
                "request {} is {:?}, not prepared",
                request.id(),
                request.state()
            )));
        }
        let mut submitted = 0;
        let mut failure: Option<TpuError> = None;
        while request.remaining_tpu_request_count() > 0 {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let sub = Arc::new(HardwareRequest::new(id, Arc::clone(request.executable())));
            if let Err(e) = request.prepare_tpu_request(&sub) {
                warn!("request {}: sub-request {id} not prepared: {e}", request.id());
                request.fail_unprepared(e.clone());
                return Err(failure.unwrap_or(e));
            }
            if let Some(e) = &failure {
                sub.notify_completion(Err(e.clone()));
                continue;
            }
            match self.scheduler.submit(Arc::clone(&sub) as Arc<dyn TpuRequest>) {
                Ok(()) => submitted += 1,
                Err(e) => {
                    warn!("request {}: sub-request {id} rejected: {e}", request.id());
                    sub.notify_completion(Err(e.clone()));
                    failure = Some(e);
                }
            }
        }
        failure.map_or(Ok(submitted), Err)
    }

    /// Close the scheduler chain
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if already shut down.
    pub fn shutdown(&self, mode: CloseMode) -> Result<()> {
        self.scheduler.close(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::{Buffer, Executable, ExecutableId, LayerInfo};
    use crate::registers::MemoryRegisters;
    use crate::ErrorKind;
    use crossbeam_channel::unbounded;

    fn executable(hw_batch: usize) -> Arc<Executable> {
        Arc::new(
            Executable::builder(ExecutableId::new(1), "net")
                .hardware_batch_size(hw_batch)
                .input(LayerInfo::new("in", 64))
                .output(LayerInfo::new("out", 64))
                .instruction_bytes(128)
                .build()
                .unwrap(),
        )
    }

    type Done = crossbeam_channel::Receiver<Result<()>>;

    fn request(exe: &Arc<Executable>, batch: usize) -> (Arc<Request>, Done) {
        let (tx, rx) = unbounded();
        let req = Arc::new(Request::new(1, Arc::clone(exe)));
        for _ in 0..batch {
            req.add_input("in", Buffer::from(vec![1; 64])).unwrap();
            req.add_output("out", Buffer::from(vec![0; 64])).unwrap();
        }
        req.set_done(move |_, status| {
            let _ = tx.send(status);
        })
        .unwrap();
        req.prepare().unwrap();
        (req, rx)
    }

    #[test]
    fn request_runs_end_to_end() {
        let stack = DriverStack::new(DriverConfig::default(), |_, _| {}).unwrap();
        let mut engine = stack
            .software_engine(Arc::new(MemoryRegisters::new()), EngineConfig::default())
            .unwrap();
        let exe = executable(2);
        let (req, rx) = request(&exe, 3);

        assert_eq!(stack.submit(&req).unwrap(), 2);
        let stats = engine.run_until_idle().unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert!(stack.scheduler().is_empty());
        assert_eq!(stack.watchdog().active_level(), None);
    }

    #[test]
    fn rejected_submission_still_completes_request() {
        let config = DriverConfig {
            real_time: crate::config::RealTimeConfig {
                enabled: true,
                ..Default::default()
            },
            ..DriverConfig::default()
        };
        let stack = DriverStack::new(config, |_, _| {}).unwrap();
        let exe = executable(1);
        let (req, rx) = request(&exe, 3);

        let err = stack.submit(&req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(req.remaining_tpu_request_count(), 0);
        assert_eq!(rx.try_recv().unwrap().unwrap_err().kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn unprepared_request_rejected() {
        let stack = DriverStack::new(DriverConfig::default(), |_, _| {}).unwrap();
        let req = Arc::new(Request::new(1, executable(1)));
        let err = stack.submit(&req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert!(stack.scheduler().is_empty());
    }

    #[test]
    fn invalid_config_rejected() {
        let config = DriverConfig {
            watchdog: crate::config::WatchdogConfig {
                levels: Vec::new(),
                ..Default::default()
            },
            ..DriverConfig::default()
        };
        let err = DriverStack::new(config, |_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
