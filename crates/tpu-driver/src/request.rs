//! Application-level inference request
//!
//! One [`Request`] carries a whole application batch. After
//! [`Request::prepare`] it is cut into hardware batches: each call to
//! [`Request::prepare_tpu_request`] fills the next slice into a
//! [`HardwareRequest`], padding the last slice with no-op buffers. The done
//! callback fires exactly once, after every sub-request has completed, with
//! the merged status.
//!
//! ```text
//! Initial --prepare--> Prepared --last sub-request done--> Done
//! ```

use crate::error::{merge_status, Result, TpuError};
use crate::executable::{Buffer, Executable, LayerInfo};
use crate::tpu_request::{HardwareRequest, RequestTiming, TpuRequest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

/// Called once with the request id and merged status
pub type DoneCallback = Box<dyn FnOnce(u64, Result<()>) + Send + 'static>;

/// Request lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    /// Accepting buffers
    Initial,
    /// Batch size known; sub-requests may be prepared
    Prepared,
    /// Done callback fired
    Done,
}

struct RequestInner {
    state: RequestState,
    inputs: HashMap<String, Vec<Buffer>>,
    outputs: HashMap<String, Vec<Buffer>>,
    priority: i32,
    done: Option<DoneCallback>,
    request_batch_size: usize,
    required_sub_requests: usize,
    prepared_sub_requests: usize,
    pending_sub_requests: usize,
    status: Result<()>,
    timing: RequestTiming,
}

/// One application inference call
pub struct Request {
    id: u64,
    executable: Arc<Executable>,
    inner: Mutex<RequestInner>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("executable", &self.executable.id())
            .field("state", &inner.state)
            .field("batch", &inner.request_batch_size)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// New request against `executable`
    pub fn new(id: u64, executable: Arc<Executable>) -> Self {
        Self {
            id,
            executable,
            inner: Mutex::new(RequestInner {
                state: RequestState::Initial,
                inputs: HashMap::new(),
                outputs: HashMap::new(),
                priority: 0,
                done: None,
                request_batch_size: 0,
                required_sub_requests: 0,
                prepared_sub_requests: 0,
                pending_sub_requests: 0,
                status: Ok(()),
                timing: RequestTiming::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RequestInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expect_state(&self, inner: &RequestInner, want: RequestState, op: &str) -> Result<()> {
        if inner.state == want {
            Ok(())
        } else {
            Err(TpuError::failed_precondition(format!(
                "request {}: {op} not allowed in state {:?}",
                self.id, inner.state
            )))
        }
    }

    /// Request id
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Executable this request runs
    pub fn executable(&self) -> &Arc<Executable> {
        &self.executable
    }

    /// Current lifecycle state
    pub fn state(&self) -> RequestState {
        self.lock().state
    }

    /// Append one batch element to input layer `name`
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` after `prepare`, `NotFound` for an undeclared
    /// layer, `InvalidArgument` for a size matching neither the actual nor
    /// the padded layer size.
    pub fn add_input(&self, name: &str, buffer: Buffer) -> Result<()> {
        let layer = self
            .executable
            .input_layer(name)
            .ok_or_else(|| TpuError::not_found(format!("input layer '{name}'")))?;
        let mut inner = self.lock();
        self.expect_state(&inner, RequestState::Initial, "add_input")?;
        check_size(layer, &buffer)?;
        inner.inputs.entry(name.to_owned()).or_default().push(buffer);
        Ok(())
    }

    /// Append one batch element to output layer `name`
    ///
    /// # Errors
    ///
    /// As [`Request::add_input`].
    pub fn add_output(&self, name: &str, buffer: Buffer) -> Result<()> {
        let layer = self
            .executable
            .output_layer(name)
            .ok_or_else(|| TpuError::not_found(format!("output layer '{name}'")))?;
        let mut inner = self.lock();
        self.expect_state(&inner, RequestState::Initial, "add_output")?;
        check_size(layer, &buffer)?;
        inner.outputs.entry(name.to_owned()).or_default().push(buffer);
        Ok(())
    }

    /// Scheduling priority; zero is the default and highest
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a negative priority, `FailedPrecondition`
    /// after `prepare`.
    pub fn set_priority(&self, priority: i32) -> Result<()> {
        if priority < 0 {
            return Err(TpuError::invalid_argument(format!(
                "request {}: negative priority {priority}",
                self.id
            )));
        }
        let mut inner = self.lock();
        self.expect_state(&inner, RequestState::Initial, "set_priority")?;
        inner.priority = priority;
        Ok(())
    }

    /// Scheduling priority
    pub fn priority(&self) -> i32 {
        self.lock().priority
    }

    /// Install the completion callback
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` after `prepare`, `InvalidArgument` if already set.
    pub fn set_done(&self, done: impl FnOnce(u64, Result<()>) + Send + 'static) -> Result<()> {
        let mut inner = self.lock();
        self.expect_state(&inner, RequestState::Initial, "set_done")?;
        if inner.done.is_some() {
            return Err(TpuError::invalid_argument(format!(
                "request {}: done callback already set",
                self.id
            )));
        }
        inner.done = Some(Box::new(done));
        Ok(())
    }

    /// Fix the batch size and the number of hardware sub-requests
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` unless `Initial`; `InvalidArgument` without a
    /// done callback, or when the declared layers disagree on (or have no)
    /// batch elements.
    pub fn prepare(&self) -> Result<()> {
        let mut inner = self.lock();
        self.expect_state(&inner, RequestState::Initial, "prepare")?;
        if inner.done.is_none() {
            return Err(TpuError::invalid_argument(format!(
                "request {}: prepare without a done callback",
                self.id
            )));
        }

        let hw_batch = self.executable.hardware_batch_size();
        let (batch, required) = if self.executable.inputs().is_empty()
            && self.executable.outputs().is_empty()
        {
            (1, 1)
        } else {
            let batch = self.common_batch_size(&inner)?;
            (batch, batch.div_ceil(hw_batch))
        };

        inner.request_batch_size = batch;
        inner.required_sub_requests = required;
        inner.pending_sub_requests = required;
        inner.state = RequestState::Prepared;
        debug!(
            "request {} prepared: batch {batch}, {required} sub-request(s) of {hw_batch}",
            self.id
        );
        Ok(())
    }

    fn common_batch_size(&self, inner: &RequestInner) -> Result<usize> {
        let declared = self
            .executable
            .inputs()
            .iter()
            .map(|l| (l.name(), inner.inputs.get(l.name())))
            .chain(
                self.executable
                    .outputs()
                    .iter()
                    .map(|l| (l.name(), inner.outputs.get(l.name()))),
            );

        let mut common: Option<(&str, usize)> = None;
        for (name, buffers) in declared {
            let len = buffers.map_or(0, Vec::len);
            match common {
                None => common = Some((name, len)),
                Some((first, n)) if n != len => {
                    return Err(TpuError::invalid_argument(format!(
                        "request {}: layer '{name}' has {len} buffers, '{first}' has {n}",
                        self.id
                    )));
                }
                Some(_) => {}
            }
        }
        match common {
            Some((_, n)) if n > 0 => Ok(n),
            _ => Err(TpuError::invalid_argument(format!(
                "request {}: no buffers supplied",
                self.id
            ))),
        }
    }

    /// Batch size fixed by `prepare`
    pub fn request_batch_size(&self) -> usize {
        self.lock().request_batch_size
    }

    /// Hardware sub-requests still to be prepared
    pub fn remaining_tpu_request_count(&self) -> usize {
        let inner = self.lock();
        inner.required_sub_requests - inner.prepared_sub_requests
    }

    /// Fill the next hardware batch into `sub_request`
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` unless `Prepared` or when every sub-request is
    /// already prepared; `InvalidArgument` if `sub_request` already has a
    /// done callback.
    pub fn prepare_tpu_request(self: &Arc<Self>, sub_request: &HardwareRequest) -> Result<()> {
        let mut inner = self.lock();
        self.expect_state(&inner, RequestState::Prepared, "prepare_tpu_request")?;
        if inner.prepared_sub_requests == inner.required_sub_requests {
            return Err(TpuError::failed_precondition(format!(
                "request {}: all {} sub-requests already prepared",
                self.id, inner.required_sub_requests
            )));
        }

        let this = Arc::clone(self);
        sub_request.set_done(Box::new(move |timing, status| {
            this.on_sub_request_done(timing, status);
        }))?;

        let hw_batch = self.executable.hardware_batch_size();
        let start = inner.prepared_sub_requests * hw_batch;
        for layer in self.executable.inputs() {
            let slice = batch_slice(inner.inputs.get(layer.name()), layer, start, hw_batch);
            sub_request.set_input_buffers(layer.name(), slice);
        }
        for layer in self.executable.outputs() {
            let slice = batch_slice(inner.outputs.get(layer.name()), layer, start, hw_batch);
            sub_request.set_output_buffers(layer.name(), slice);
        }
        inner.prepared_sub_requests += 1;
        debug!(
            "request {}: sub-request {} prepared ({}/{})",
            self.id,
            sub_request.id(),
            inner.prepared_sub_requests,
            inner.required_sub_requests
        );
        Ok(())
    }

    /// Give up on every sub-request not yet prepared
    ///
    /// They count as finished with `error`; the done callback fires once the
    /// already prepared ones complete, or right away if there are none.
    /// A no-op outside `Prepared`.
    pub fn fail_unprepared(&self, error: TpuError) {
        let fire = {
            let mut inner = self.lock();
            if inner.state != RequestState::Prepared {
                return;
            }
            let abandoned = inner.required_sub_requests - inner.prepared_sub_requests;
            if abandoned == 0 {
                return;
            }
            debug!("request {}: {abandoned} sub-request(s) abandoned: {error}", self.id);
            inner.prepared_sub_requests = inner.required_sub_requests;
            inner.pending_sub_requests = inner.pending_sub_requests.saturating_sub(abandoned);
            merge_status(&mut inner.status, Err(error));
            Self::take_done(&mut inner)
        };
        self.fire(fire);
    }

    fn on_sub_request_done(&self, timing: RequestTiming, status: Result<()>) {
        let fire = {
            let mut inner = self.lock();
            merge_status(&mut inner.status, status);
            inner.timing.absorb(&timing);
            inner.pending_sub_requests = inner.pending_sub_requests.saturating_sub(1);
            Self::take_done(&mut inner)
        };
        self.fire(fire);
    }

    fn take_done(inner: &mut RequestInner) -> Option<(DoneCallback, Result<()>)> {
        if inner.pending_sub_requests != 0 || inner.state != RequestState::Prepared {
            return None;
        }
        inner.state = RequestState::Done;
        inner.timing.completed = Some(Instant::now());
        let status = inner.status.clone();
        inner.done.take().map(|done| (done, status))
    }

    fn fire(&self, fire: Option<(DoneCallback, Result<()>)>) {
        if let Some((done, status)) = fire {
            debug!("request {} done: {:?}", self.id, status);
            done(self.id, status);
        }
    }

    /// Lifecycle timestamps, merged over sub-requests
    pub fn timing(&self) -> RequestTiming {
        self.lock().timing
    }
}

fn check_size(layer: &LayerInfo, buffer: &Buffer) -> Result<()> {
    if layer.accepts(buffer.size()) {
        Ok(())
    } else {
        Err(TpuError::invalid_argument(format!(
            "layer '{}' expects {} or {} bytes, got {}",
            layer.name(),
            layer.actual_size_bytes(),
            layer.padded_size_bytes(),
            buffer.size()
        )))
    }
}

/// `hw_batch` buffers starting at `start`, padded with no-op buffers
fn batch_slice(
    buffers: Option<&Vec<Buffer>>,
    layer: &LayerInfo,
    start: usize,
    hw_batch: usize,
) -> Vec<Buffer> {
    let mut slice: Vec<Buffer> = buffers
        .map(|b| b.iter().skip(start).take(hw_batch).cloned().collect())
        .unwrap_or_default();
    slice.resize(hw_batch, Buffer::noop(layer.padded_size_bytes()));
    slice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::ExecutableId;
    use crate::ErrorKind;
    use crossbeam_channel::{unbounded, Receiver};

    fn exe(inputs: &[&str], hw_batch: usize) -> Arc<Executable> {
        let mut b = Executable::builder(ExecutableId::new(1), "net").hardware_batch_size(hw_batch);
        for name in inputs {
            b = b.input(LayerInfo::new(*name, 16));
        }
        Arc::new(b.build().unwrap())
    }

    fn request(exe: Arc<Executable>) -> (Arc<Request>, Receiver<Result<()>>) {
        let (tx, rx) = unbounded();
        let req = Arc::new(Request::new(1, exe));
        req.set_done(move |_, status| {
            let _ = tx.send(status);
        })
        .unwrap();
        (req, rx)
    }

    #[test]
    fn batch_split_pads_last_sub_request() {
        let exe = exe(&["a", "b", "c"], 4);
        let (req, rx) = request(Arc::clone(&exe));
        for layer in ["a", "b", "c"] {
            for _ in 0..10 {
                req.add_input(layer, Buffer::from(vec![0; 16])).unwrap();
            }
        }
        req.prepare().unwrap();
        assert_eq!(req.request_batch_size(), 10);
        assert_eq!(req.remaining_tpu_request_count(), 3);

        let subs: Vec<_> = (0..3)
            .map(|i| {
                let sub = HardwareRequest::new(i, Arc::clone(&exe));
                req.prepare_tpu_request(&sub).unwrap();
                sub
            })
            .collect();
        assert_eq!(req.remaining_tpu_request_count(), 0);

        for layer in ["a", "b", "c"] {
            let last = subs[2].input_buffers(layer);
            assert_eq!(last.len(), 4);
            assert_eq!(last.iter().filter(|b| b.is_noop()).count(), 2);
            assert!(subs[0].input_buffers(layer).iter().all(|b| !b.is_noop()));
        }

        subs[0].notify_completion(Ok(()));
        subs[2].notify_completion(Ok(()));
        assert!(rx.try_recv().is_err());
        subs[1].notify_completion(Ok(()));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert!(rx.try_recv().is_err());
        assert_eq!(req.state(), RequestState::Done);
    }

    #[test]
    fn one_failed_sub_request_fails_the_request() {
        let exe = exe(&["a"], 1);
        let (req, rx) = request(Arc::clone(&exe));
        req.add_input("a", Buffer::from(vec![0; 16])).unwrap();
        req.add_input("a", Buffer::from(vec![0; 16])).unwrap();
        req.prepare().unwrap();
        let first = HardwareRequest::new(1, Arc::clone(&exe));
        let second = HardwareRequest::new(2, Arc::clone(&exe));
        req.prepare_tpu_request(&first).unwrap();
        req.prepare_tpu_request(&second).unwrap();
        first.cancel();
        second.notify_completion(Ok(()));
        assert_eq!(rx.try_recv().unwrap().unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn abandoned_sub_requests_fail_the_request() {
        let (req, rx) = request(exe(&["a"], 2));
        for _ in 0..5 {
            req.add_input("a", Buffer::from(vec![0u8; 16])).unwrap();
        }
        req.prepare().unwrap();
        assert_eq!(req.remaining_tpu_request_count(), 3);

        let first = HardwareRequest::new(1, Arc::clone(req.executable()));
        req.prepare_tpu_request(&first).unwrap();
        req.fail_unprepared(TpuError::internal("no descriptors"));
        assert_eq!(req.remaining_tpu_request_count(), 0);
        assert!(rx.try_recv().is_err(), "waits for the prepared sub-request");

        first.notify_completion(Ok(()));
        let status = rx.try_recv().unwrap();
        assert_eq!(status.unwrap_err().kind(), ErrorKind::Internal);
        assert_eq!(req.state(), RequestState::Done);
    }

    #[test]
    fn no_layers_means_one_sub_request() {
        let exe = exe(&[], 8);
        let (req, rx) = request(Arc::clone(&exe));
        req.prepare().unwrap();
        assert_eq!(req.request_batch_size(), 1);
        assert_eq!(req.remaining_tpu_request_count(), 1);
        let sub = HardwareRequest::new(1, exe);
        req.prepare_tpu_request(&sub).unwrap();
        sub.notify_completion(Ok(()));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn mismatched_batches_rejected() {
        let exe = exe(&["a", "b"], 2);
        let (req, _rx) = request(exe);
        req.add_input("a", Buffer::from(vec![0; 16])).unwrap();
        req.add_input("a", Buffer::from(vec![0; 16])).unwrap();
        req.add_input("b", Buffer::from(vec![0; 16])).unwrap();
        assert_eq!(req.prepare().unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(req.state(), RequestState::Initial);
    }

    #[test]
    fn layer_and_size_checks() {
        let (req, _rx) = request(exe(&["a"], 1));
        let err = req.add_input("nope", Buffer::from(vec![0; 16])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = req.add_input("a", Buffer::from(vec![0; 17])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        // padded size is accepted
        req.add_input("a", Buffer::from(vec![0; 64])).unwrap();
    }

    #[test]
    fn state_machine_is_monotonic() {
        let exe = exe(&["a"], 1);
        let req = Arc::new(Request::new(5, Arc::clone(&exe)));
        assert_eq!(req.prepare().unwrap_err().kind(), ErrorKind::InvalidArgument);
        req.set_done(|_, _| {}).unwrap();
        assert_eq!(
            req.set_done(|_, _| {}).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        let sub = HardwareRequest::new(1, Arc::clone(&exe));
        assert_eq!(
            req.prepare_tpu_request(&sub).unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
        req.add_input("a", Buffer::from(vec![0; 16])).unwrap();
        req.prepare().unwrap();
        assert_eq!(req.prepare().unwrap_err().kind(), ErrorKind::FailedPrecondition);
        assert_eq!(
            req.add_input("a", Buffer::from(vec![0; 16])).unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
        assert_eq!(
            req.set_priority(1).unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
        req.prepare_tpu_request(&sub).unwrap();
        let extra = HardwareRequest::new(2, exe);
        assert_eq!(
            req.prepare_tpu_request(&extra).unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
    }

    #[test]
    fn negative_priority_rejected() {
        let (req, _rx) = request(exe(&["a"], 1));
        assert_eq!(
            req.set_priority(-1).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        req.set_priority(3).unwrap();
        assert_eq!(req.priority(), 3);
    }
}
