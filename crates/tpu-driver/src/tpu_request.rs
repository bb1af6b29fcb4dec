//! Hardware-level (sub-)requests
//!
//! The scheduler only sees [`TpuRequest`]: an ordered descriptor list plus
//! lifecycle notifications. [`HardwareRequest`] is the concrete type an
//! application [`Request`](crate::Request) fills one hardware batch into.

use crate::dma::{DmaDescriptor, DmaDescriptorType};
use crate::error::{Result, TpuError};
use crate::executable::{Buffer, Executable, ExecutableId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle timestamps of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTiming {
    /// Creation
    pub created: Instant,
    /// Handed to the scheduler
    pub submitted: Option<Instant>,
    /// First descriptor dispatched
    pub active: Option<Instant>,
    /// Completion reported
    pub completed: Option<Instant>,
}

impl RequestTiming {
    /// Timing starting now
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            submitted: None,
            active: None,
            completed: None,
        }
    }

    /// Time spent queued behind other work
    pub fn queue_latency(&self) -> Option<Duration> {
        Some(self.active?.saturating_duration_since(self.submitted?))
    }

    /// Creation to completion
    pub fn total(&self) -> Option<Duration> {
        Some(self.completed?.saturating_duration_since(self.created))
    }

    /// Keep the earliest submission/activation of `other`
    pub(crate) fn absorb(&mut self, other: &Self) {
        self.submitted = earliest(self.submitted, other.submitted);
        self.active = earliest(self.active, other.active);
    }
}

impl Default for RequestTiming {
    fn default() -> Self {
        Self::new()
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Opaque DMA-bearing request as seen by a scheduler
pub trait TpuRequest: Send + Sync + std::fmt::Debug {
    /// Request id
    fn id(&self) -> u64;

    /// Executable this request runs
    fn executable(&self) -> ExecutableId;

    /// Ordered descriptor list
    ///
    /// # Errors
    ///
    /// Implementation-defined; a scheduler rejects the submission.
    fn dmas(&self) -> Result<Vec<DmaDescriptor>>;

    /// Estimated core cycles
    fn estimated_cycles(&self) -> u64;

    /// Accepted by a scheduler
    fn notify_submission(&self);

    /// First descriptor about to be dispatched
    fn notify_active(&self);

    /// Finished with `status`; only the first call has an effect
    fn notify_completion(&self, status: Result<()>);

    /// Tear down; completes the request with `Cancelled`
    fn cancel(&self) {
        self.notify_completion(Err(TpuError::cancelled(format!(
            "request {} cancelled",
            self.id()
        ))));
    }
}

/// Invoked once when a hardware request completes
pub type TpuDoneCallback = Box<dyn FnOnce(RequestTiming, Result<()>) + Send + 'static>;

struct HwState {
    inputs: Vec<(String, Vec<Buffer>)>,
    outputs: Vec<(String, Vec<Buffer>)>,
    dmas: Option<Vec<DmaDescriptor>>,
    done: Option<TpuDoneCallback>,
    timing: RequestTiming,
    completed: bool,
}

/// One native hardware batch of an executable
pub struct HardwareRequest {
    id: u64,
    executable: Arc<Executable>,
    state: Mutex<HwState>,
}

impl std::fmt::Debug for HardwareRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareRequest")
            .field("id", &self.id)
            .field("executable", &self.executable.id())
            .field("completed", &self.lock().completed)
            .finish_non_exhaustive()
    }
}

impl HardwareRequest {
    /// Empty request for `executable`
    pub fn new(id: u64, executable: Arc<Executable>) -> Self {
        Self {
            id,
            executable,
            state: Mutex::new(HwState {
                inputs: Vec::new(),
                outputs: Vec::new(),
                dmas: None,
                done: None,
                timing: RequestTiming::new(),
                completed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HwState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executable description
    pub fn executable_info(&self) -> &Arc<Executable> {
        &self.executable
    }

    /// Replace the buffers of input layer `name`
    pub fn set_input_buffers(&self, name: &str, buffers: Vec<Buffer>) {
        set_layer(&mut self.lock().inputs, name, buffers);
    }

    /// Replace the buffers of output layer `name`
    pub fn set_output_buffers(&self, name: &str, buffers: Vec<Buffer>) {
        set_layer(&mut self.lock().outputs, name, buffers);
    }

    /// Buffers of input layer `name`
    pub fn input_buffers(&self, name: &str) -> Vec<Buffer> {
        get_layer(&self.lock().inputs, name)
    }

    /// Buffers of output layer `name`
    pub fn output_buffers(&self, name: &str) -> Vec<Buffer> {
        get_layer(&self.lock().outputs, name)
    }

    /// Use an explicit descriptor list instead of the derived one
    pub fn set_dmas(&self, dmas: Vec<DmaDescriptor>) {
        self.lock().dmas = Some(dmas);
    }

    /// Install the completion callback
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a callback is already installed,
    /// `FailedPrecondition` once completed.
    pub fn set_done(&self, done: TpuDoneCallback) -> Result<()> {
        let mut state = self.lock();
        if state.completed {
            return Err(TpuError::failed_precondition(format!(
                "hardware request {} already completed",
                self.id
            )));
        }
        if state.done.is_some() {
            return Err(TpuError::invalid_argument(format!(
                "hardware request {} already has a done callback",
                self.id
            )));
        }
        state.done = Some(done);
        Ok(())
    }

    /// Lifecycle timestamps so far
    pub fn timing(&self) -> RequestTiming {
        self.lock().timing
    }

    /// Whether completion has been reported
    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Instruction fetch, inputs, local fence, outputs, global fence
    fn derived_dmas(&self, state: &HwState) -> Vec<DmaDescriptor> {
        let mut dmas = vec![DmaDescriptor::transfer(
            DmaDescriptorType::Instruction,
            0,
            self.executable.instruction_bytes(),
        )];
        let transfers = |kind, layers: &[(String, Vec<Buffer>)]| {
            layers
                .iter()
                .flat_map(|(_, buffers)| buffers.iter())
                .map(move |b| DmaDescriptor::transfer(kind, b.address(), b.size()))
                .collect::<Vec<_>>()
        };
        dmas.extend(transfers(DmaDescriptorType::InputActivation, &state.inputs));
        dmas.push(DmaDescriptor::marker(DmaDescriptorType::LocalFence));
        dmas.extend(transfers(DmaDescriptorType::OutputActivation, &state.outputs));
        dmas.push(DmaDescriptor::marker(DmaDescriptorType::GlobalFence));
        dmas
    }
}

fn set_layer(layers: &mut Vec<(String, Vec<Buffer>)>, name: &str, buffers: Vec<Buffer>) {
    match layers.iter_mut().find(|(n, _)| n == name) {
        Some((_, existing)) => *existing = buffers,
        None => layers.push((name.to_owned(), buffers)),
    }
}

fn get_layer(layers: &[(String, Vec<Buffer>)], name: &str) -> Vec<Buffer> {
    layers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, b)| b.clone())
        .unwrap_or_default()
}

impl TpuRequest for HardwareRequest {
    fn id(&self) -> u64 {
        self.id
    }

    fn executable(&self) -> ExecutableId {
        self.executable.id()
    }

    fn dmas(&self) -> Result<Vec<DmaDescriptor>> {
        let state = self.lock();
        Ok(match &state.dmas {
            Some(dmas) => dmas.clone(),
            None => self.derived_dmas(&state),
        })
    }

    fn estimated_cycles(&self) -> u64 {
        self.executable.estimated_cycles()
    }

    fn notify_submission(&self) {
        self.lock().timing.submitted = Some(Instant::now());
    }

    fn notify_active(&self) {
        let mut state = self.lock();
        if state.timing.active.is_none() {
            state.timing.active = Some(Instant::now());
        }
    }

    fn notify_completion(&self, status: Result<()>) {
        let (done, timing) = {
            let mut state = self.lock();
            if state.completed {
                warn!("hardware request {} completed twice; ignoring", self.id);
                return;
            }
            state.completed = true;
            state.timing.completed = Some(Instant::now());
            (state.done.take(), state.timing)
        };
        debug!("hardware request {} done: {:?}", self.id, status);
        if let Some(done) = done {
            done(timing, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::LayerInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exe() -> Arc<Executable> {
        Arc::new(
            Executable::builder(ExecutableId::new(3), "net")
                .input(LayerInfo::new("in", 64))
                .output(LayerInfo::new("out", 64))
                .instruction_bytes(256)
                .estimated_cycles(1000)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn derived_descriptor_list() {
        let req = HardwareRequest::new(1, exe());
        req.set_input_buffers("in", vec![Buffer::from(vec![0; 64]), Buffer::noop(64)]);
        req.set_output_buffers("out", vec![Buffer::from(vec![0; 64])]);
        let kinds: Vec<_> = req.dmas().unwrap().iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                DmaDescriptorType::Instruction,
                DmaDescriptorType::InputActivation,
                DmaDescriptorType::InputActivation,
                DmaDescriptorType::LocalFence,
                DmaDescriptorType::OutputActivation,
                DmaDescriptorType::GlobalFence,
            ]
        );
    }

    #[test]
    fn explicit_descriptors_override() {
        let req = HardwareRequest::new(1, exe());
        req.set_dmas(vec![DmaDescriptor::marker(DmaDescriptorType::LocalFence)]);
        assert_eq!(req.dmas().unwrap().len(), 1);
    }

    #[test]
    fn completion_fires_at_most_once() {
        let req = HardwareRequest::new(9, exe());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        req.set_done(Box::new(move |timing, status| {
            assert!(status.is_ok());
            assert!(timing.completed.is_some());
            seen.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        req.notify_completion(Ok(()));
        req.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(req.is_completed());
    }

    #[test]
    fn done_callback_set_once() {
        let req = HardwareRequest::new(1, exe());
        req.set_done(Box::new(|_, _| {})).unwrap();
        let err = req.set_done(Box::new(|_, _| {})).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn cancel_reports_cancelled() {
        let req = HardwareRequest::new(4, exe());
        let (tx, rx) = crossbeam_channel::bounded(1);
        req.set_done(Box::new(move |_, status| {
            let _ = tx.send(status);
        }))
        .unwrap();
        req.cancel();
        let status = rx.try_recv().unwrap();
        assert_eq!(status.unwrap_err().kind(), crate::ErrorKind::Cancelled);
    }

    #[test]
    fn queue_latency_needs_both_stamps() {
        let req = HardwareRequest::new(1, exe());
        assert!(req.timing().queue_latency().is_none());
        req.notify_submission();
        req.notify_active();
        assert!(req.timing().queue_latency().is_some());
    }
}
