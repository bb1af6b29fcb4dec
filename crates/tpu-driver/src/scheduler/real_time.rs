//! Deadline admission for periodic models
//!
//! Each executable may carry a timing contract: frame rate, worst-case
//! execution time and arrival jitter tolerance. In real-time mode a
//! submission is admitted only if the hardware time booked so far plus its
//! execution time ends before the next deadline of any other recently
//! active real-time executable.

use super::{CloseMode, DmaScheduler};
use crate::dma::{DmaDescriptorType, DmaHandle};
use crate::error::{Result, TpuError};
use crate::executable::ExecutableId;
use crate::timer::Clock;
use crate::tpu_request::TpuRequest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Timing contract of one executable
///
/// `fps == 0` with a zero execution time marks a model without a real-time
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutableTiming {
    /// Frames per second
    pub fps: u32,
    /// Worst-case hardware time per frame
    pub max_execution_time: Duration,
    /// Arrival jitter the model tolerates
    pub tolerance: Duration,
}

impl ExecutableTiming {
    /// Period implied by `fps`, if any
    pub fn frame_time(&self) -> Option<Duration> {
        (self.fps > 0).then(|| Duration::from_secs(1) / self.fps)
    }

    /// Whether this contract takes part in deadline admission
    pub fn is_real_time(&self) -> bool {
        self.fps > 0 && !self.max_execution_time.is_zero()
    }

    fn validate(&self, executable: ExecutableId) -> Result<()> {
        let bad = |why: String| Err(TpuError::invalid_argument(format!("{executable}: {why}")));
        match self.frame_time() {
            None if !self.max_execution_time.is_zero() => {
                bad("execution time without a frame rate".into())
            }
            None => Ok(()),
            Some(_) if self.max_execution_time.is_zero() => {
                bad(format!("{} fps without an execution time", self.fps))
            }
            Some(frame) if self.max_execution_time > frame => bad(format!(
                "execution time {:?} exceeds frame time {frame:?}",
                self.max_execution_time
            )),
            Some(frame) if self.tolerance > frame - self.max_execution_time => bad(format!(
                "tolerance {:?} exceeds slack {:?}",
                self.tolerance,
                frame - self.max_execution_time
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Partial timing update; unset fields keep their stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingUpdate {
    /// New frame rate
    pub fps: Option<u32>,
    /// New worst-case execution time
    pub max_execution_time: Option<Duration>,
    /// New tolerance
    pub tolerance: Option<Duration>,
}

impl From<ExecutableTiming> for TimingUpdate {
    fn from(t: ExecutableTiming) -> Self {
        Self {
            fps: Some(t.fps),
            max_execution_time: Some(t.max_execution_time),
            tolerance: Some(t.tolerance),
        }
    }
}

#[derive(Debug, Default)]
struct RtState {
    enabled: bool,
    timings: HashMap<ExecutableId, ExecutableTiming>,
    /// Latest real-time submission per executable, contract or not
    arrivals: HashMap<ExecutableId, Duration>,
    /// Clock time up to which the hardware is booked
    busy_until: Duration,
}

/// Real-time admission in front of another [`DmaScheduler`]
pub struct RealTimeDmaScheduler<S> {
    backing: S,
    clock: Arc<dyn Clock>,
    inactive_frame_multiple: u32,
    state: Mutex<RtState>,
}

impl<S: std::fmt::Debug> std::fmt::Debug for RealTimeDmaScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RealTimeDmaScheduler")
            .field("backing", &self.backing)
            .field("enabled", &state.enabled)
            .field("executables", &state.timings.len())
            .field("busy_until", &state.busy_until)
            .finish_non_exhaustive()
    }
}

impl<S> RealTimeDmaScheduler<S> {
    /// Wrap `backing`; real-time mode starts off
    ///
    /// An executable silent for more than `inactive_frame_multiple` of its
    /// own frames no longer constrains admission.
    pub fn new(backing: S, clock: Arc<dyn Clock>, inactive_frame_multiple: u32) -> Self {
        Self {
            backing,
            clock,
            inactive_frame_multiple: inactive_frame_multiple.max(1),
            state: Mutex::new(RtState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RtState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The wrapped scheduler
    pub fn backing(&self) -> &S {
        &self.backing
    }
}

impl<S: DmaScheduler> RealTimeDmaScheduler<S> {

    /// Turn deadline admission on or off
    pub fn set_realtime_mode(&self, enabled: bool) {
        let mut state = self.lock();
        if state.enabled != enabled {
            info!(
                "real-time mode {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        state.enabled = enabled;
    }

    /// Whether deadline admission is on
    pub fn realtime_mode(&self) -> bool {
        self.lock().enabled
    }

    /// Create or update the timing contract of `executable`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when a new entry lacks `fps` or
    /// `max_execution_time`, or when the merged contract is inconsistent.
    pub fn set_executable_timing(
        &self,
        executable: ExecutableId,
        update: TimingUpdate,
    ) -> Result<()> {
        let mut state = self.lock();
        let base = match state.timings.get(&executable) {
            Some(timing) => *timing,
            None if update.fps.is_none() || update.max_execution_time.is_none() => {
                return Err(TpuError::invalid_argument(format!(
                    "{executable}: new timing needs fps and max execution time"
                )));
            }
            None => ExecutableTiming::default(),
        };

        let timing = ExecutableTiming {
            fps: update.fps.unwrap_or(base.fps),
            max_execution_time: update
                .max_execution_time
                .unwrap_or(base.max_execution_time),
            tolerance: update.tolerance.unwrap_or(base.tolerance),
        };
        timing.validate(executable)?;

        debug!("{executable}: timing {timing:?}");
        state.timings.insert(executable, timing);
        Ok(())
    }

    /// Stored timing contract of `executable`
    ///
    /// # Errors
    ///
    /// `NotFound` if none is stored.
    pub fn executable_timing(&self, executable: ExecutableId) -> Result<ExecutableTiming> {
        self.lock()
            .timings
            .get(&executable)
            .copied()
            .ok_or_else(|| TpuError::not_found(format!("timing for {executable}")))
    }

    /// Forget the timing contract of `executable`
    ///
    /// # Errors
    ///
    /// `NotFound` if none is stored.
    pub fn remove_executable_timing(&self, executable: ExecutableId) -> Result<()> {
        self.lock()
            .timings
            .remove(&executable)
            .map(|_| ())
            .ok_or_else(|| TpuError::not_found(format!("timing for {executable}")))
    }

    /// Clock time of the latest real-time submission of `executable`
    ///
    /// # Errors
    ///
    /// `NotFound` if it has never been submitted in real-time mode.
    pub fn last_arrival_time(&self, executable: ExecutableId) -> Result<Duration> {
        self.lock()
            .arrivals
            .get(&executable)
            .copied()
            .ok_or_else(|| TpuError::not_found(format!("arrival of {executable}")))
    }

    /// Earliest upcoming deadline among other recently active executables
    fn nearest_deadline(
        &self,
        state: &RtState,
        exclude: ExecutableId,
        now: Duration,
    ) -> Option<Duration> {
        state
            .timings
            .iter()
            .filter(|(id, timing)| **id != exclude && timing.is_real_time())
            .filter_map(|(id, timing)| {
                let frame = timing.frame_time()?;
                let last = *state.arrivals.get(id)?;
                let idle = now.saturating_sub(last);
                if idle > frame * self.inactive_frame_multiple {
                    return None;
                }
                let frames_elapsed = u32::try_from(idle.as_nanos() / frame.as_nanos()).ok()?;
                let next_arrival = last + frame * (frames_elapsed + 1);
                Some(next_arrival + timing.tolerance)
            })
            .min()
    }

    fn admit(&self, state: &mut RtState, request: &Arc<dyn TpuRequest>) -> Result<Duration> {
        let executable = request.executable();
        let now = self.clock.now();
        state.arrivals.insert(executable, now);
        // no contract reads as fps 0 / no execution time
        let timing = state.timings.get(&executable).copied().unwrap_or_default();

        if timing.max_execution_time.is_zero() {
            return Err(if timing.fps == 0 {
                TpuError::deadline_exceeded(format!(
                    "{executable} has no real-time contract; not admitted in real-time mode"
                ))
            } else {
                TpuError::invalid_argument(format!(
                    "{executable}: {} fps without an execution time",
                    timing.fps
                ))
            });
        }

        let start = state.busy_until.max(now);
        let finish = start + timing.max_execution_time;
        if let Some(deadline) = self.nearest_deadline(state, executable, now) {
            if finish > deadline {
                return Err(TpuError::deadline_exceeded(format!(
                    "request {} of {executable} would finish at {finish:?}, next deadline {deadline:?}",
                    request.id()
                )));
            }
        }
        Ok(finish)
    }
}

impl<S: DmaScheduler> DmaScheduler for RealTimeDmaScheduler<S> {
    fn open(&self) -> Result<()> {
        self.backing.open()
    }

    fn close(&self, mode: CloseMode) -> Result<()> {
        self.backing.close(mode)
    }

    fn submit(&self, request: Arc<dyn TpuRequest>) -> Result<()> {
        let mut state = self.lock();
        if !state.enabled {
            drop(state);
            return self.backing.submit(request);
        }

        let finish = self.admit(&mut state, &request)?;
        let booked = state.busy_until;
        state.busy_until = finish;
        if let Err(e) = self.backing.submit(Arc::clone(&request)) {
            state.busy_until = booked;
            return Err(e);
        }
        debug!(
            "request {} admitted; hardware booked until {finish:?}",
            request.id()
        );
        Ok(())
    }

    fn peek_next_dma(&self) -> Option<DmaDescriptorType> {
        self.backing.peek_next_dma()
    }

    fn get_next_dma(&self) -> Option<DmaHandle> {
        self.backing.get_next_dma()
    }

    fn notify_dma_completion(&self, handle: &DmaHandle) -> Result<()> {
        self.backing.notify_dma_completion(handle)
    }

    fn notify_request_completion(&self) -> Result<()> {
        self.backing.notify_request_completion()
    }

    fn wait_active_requests(&self) -> Result<()> {
        self.backing.wait_active_requests()
    }

    fn max_remaining_cycles(&self) -> u64 {
        self.backing.max_remaining_cycles()
    }

    fn oldest_active_request(&self) -> Option<Arc<dyn TpuRequest>> {
        self.backing.oldest_active_request()
    }

    fn is_empty(&self) -> bool {
        self.backing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaDescriptor;
    use crate::error::ErrorKind;
    use crate::executable::Executable;
    use crate::scheduler::SingleQueueDmaScheduler;
    use crate::timer::ManualClock;
    use crate::tpu_request::HardwareRequest;
    use crate::watchdog::NoopWatchdog;

    const A: ExecutableId = ExecutableId::new(1);
    const B: ExecutableId = ExecutableId::new(2);
    const C: ExecutableId = ExecutableId::new(3);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn contract(fps: u32, met: u64, tolerance: u64) -> TimingUpdate {
        ExecutableTiming {
            fps,
            max_execution_time: ms(met),
            tolerance: ms(tolerance),
        }
        .into()
    }

    fn scheduler() -> (RealTimeDmaScheduler<SingleQueueDmaScheduler>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let backing = SingleQueueDmaScheduler::new(Arc::new(NoopWatchdog));
        let rt = RealTimeDmaScheduler::new(backing, Arc::clone(&clock) as Arc<dyn Clock>, 2);
        rt.open().unwrap();
        rt.set_realtime_mode(true);
        (rt, clock)
    }

    fn request(id: u64, exe: ExecutableId) -> Arc<dyn TpuRequest> {
        let exe = Executable::builder(exe, "model").build().unwrap();
        let req = HardwareRequest::new(id, Arc::new(exe));
        req.set_dmas(vec![DmaDescriptor::transfer(
            DmaDescriptorType::InputActivation,
            0x2000,
            64,
        )]);
        Arc::new(req)
    }

    #[test]
    fn model_without_contract_rejected() {
        let (rt, _clock) = scheduler();
        rt.set_executable_timing(A, contract(30, 10, 5)).unwrap();
        rt.set_executable_timing(B, contract(0, 0, 0)).unwrap();
        let err = rt.submit(request(1, B)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert!(rt.backing().is_empty());
    }

    #[test]
    fn unregistered_model_rejected_in_real_time_mode() {
        let (rt, _clock) = scheduler();
        let err = rt.submit(request(1, C)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert!(rt.last_arrival_time(C).is_ok());
        // the rejected submission does not invent a contract
        assert_eq!(
            rt.executable_timing(C).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            rt.set_executable_timing(
                C,
                TimingUpdate {
                    tolerance: Some(ms(1)),
                    ..TimingUpdate::default()
                }
            )
            .unwrap_err()
            .kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn single_model_within_budget_always_admitted() {
        let (rt, clock) = scheduler();
        rt.set_executable_timing(A, contract(30, 10, 5)).unwrap();
        for id in 0..10 {
            rt.submit(request(id, A)).unwrap();
            clock.advance(ms(33));
        }
    }

    #[test]
    fn booking_past_next_deadline_rejected() {
        let (rt, _clock) = scheduler();
        rt.set_executable_timing(A, contract(30, 10, 5)).unwrap();
        rt.set_executable_timing(C, contract(30, 10, 5)).unwrap();

        // C arrives at 0: its next deadline is 33.3ms + 5ms
        rt.submit(request(1, C)).unwrap();
        rt.submit(request(2, A)).unwrap(); // booked to 20ms
        rt.submit(request(3, A)).unwrap(); // booked to 30ms
        let err = rt.submit(request(4, A)).unwrap_err(); // would end at 40ms
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn idle_models_stop_constraining_admission() {
        let (rt, clock) = scheduler();
        rt.set_executable_timing(A, contract(30, 10, 5)).unwrap();
        rt.set_executable_timing(C, contract(30, 10, 5)).unwrap();
        rt.submit(request(1, C)).unwrap();

        // three C periods without a frame: C counts as inactive
        clock.advance(ms(100));
        for id in 2..6 {
            rt.submit(request(id, A)).unwrap();
        }
    }

    #[test]
    fn failed_backing_submit_releases_booking() {
        let (rt, clock) = scheduler();
        rt.set_executable_timing(A, contract(30, 10, 5)).unwrap();
        rt.set_executable_timing(C, contract(30, 10, 5)).unwrap();
        rt.submit(request(1, C)).unwrap(); // booked to 10ms

        let empty = Arc::new(HardwareRequest::new(
            2,
            Arc::new(Executable::builder(A, "model").build().unwrap()),
        ));
        empty.set_dmas(Vec::new());
        let err = rt.submit(empty).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // 10 + 10 + 10 still fits before 38.3ms
        clock.advance(ms(1));
        rt.submit(request(3, A)).unwrap();
        rt.submit(request(4, A)).unwrap();
    }

    #[test]
    fn pass_through_when_disabled() {
        let (rt, _clock) = scheduler();
        rt.set_realtime_mode(false);
        rt.submit(request(1, B)).unwrap();
        assert!(!rt.is_empty());
        assert!(rt.last_arrival_time(B).is_err());
    }

    #[test]
    fn timing_validation() {
        let (rt, _clock) = scheduler();
        let invalid = [
            contract(30, 0, 0),
            contract(0, 10, 0),
            contract(30, 40, 0),
            contract(30, 30, 10),
        ];
        for update in invalid {
            let err = rt.set_executable_timing(A, update).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{update:?}");
        }
        let partial = TimingUpdate {
            fps: Some(30),
            ..TimingUpdate::default()
        };
        let err = rt.set_executable_timing(A, partial).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn partial_update_merges() {
        let (rt, _clock) = scheduler();
        rt.set_executable_timing(A, contract(30, 10, 0)).unwrap();
        rt.set_executable_timing(
            A,
            TimingUpdate {
                tolerance: Some(ms(5)),
                ..TimingUpdate::default()
            },
        )
        .unwrap();
        let timing = rt.executable_timing(A).unwrap();
        assert_eq!(timing.fps, 30);
        assert_eq!(timing.tolerance, ms(5));

        rt.remove_executable_timing(A).unwrap();
        assert_eq!(
            rt.executable_timing(A).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            rt.remove_executable_timing(A).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn debug_reports_admission_state() {
        let (rt, _clock) = scheduler();
        rt.set_executable_timing(A, contract(30, 10, 5)).unwrap();
        let text = format!("{rt:?}");
        assert!(text.starts_with("RealTimeDmaScheduler"));
        assert!(text.contains("enabled: true"));
        assert!(text.contains("executables: 1"));
    }

    #[test]
    fn arrival_time_recorded() {
        let (rt, clock) = scheduler();
        rt.set_executable_timing(A, contract(30, 10, 5)).unwrap();
        clock.advance(ms(7));
        rt.submit(request(1, A)).unwrap();
        assert_eq!(rt.last_arrival_time(A).unwrap(), ms(7));
    }
}
