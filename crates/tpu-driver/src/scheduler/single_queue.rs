//! Single hardware queue scheduler
//!
//! Four queues, all behind one mutex:
//!
//! ```text
//! pending_tasks    submitted, nothing dispatched yet
//! pending_dmas     remaining descriptors of the one task being drained
//! active_tasks     dispatched; descriptors may still be in flight
//! completed_tasks  request completion seen; waiting on in-flight descriptors
//! ```
//!
//! Work moves strictly front to back. Completion callbacks run after the
//! lock is released, oldest task first.

use super::{CloseMode, DmaScheduler};
use crate::dma::{DmaDescriptor, DmaDescriptorType, DmaHandle, DmaInfo, DmaState};
use crate::error::{Result, TpuError};
use crate::tpu_request::TpuRequest;
use crate::watchdog::Watchdog;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};

struct Task {
    id: u64,
    request: Arc<dyn TpuRequest>,
    dmas: Vec<DmaInfo>,
}

impl Task {
    fn new(id: u64, request: Arc<dyn TpuRequest>, dmas: Vec<DmaDescriptor>) -> Self {
        Self {
            id,
            request,
            dmas: dmas.into_iter().map(DmaInfo::new).collect(),
        }
    }

    fn is_drained(&self) -> bool {
        self.dmas.iter().all(DmaInfo::is_completed)
    }

    fn has_active_dmas(&self) -> bool {
        self.dmas.iter().any(DmaInfo::is_active)
    }

    fn has_pending_transfers(&self) -> bool {
        self.dmas
            .iter()
            .any(|d| !d.kind().is_fence() && d.state() == DmaState::Pending)
    }

    fn completed_before(&self, index: usize) -> bool {
        self.dmas[..index].iter().all(DmaInfo::is_completed)
    }
}

#[derive(Default)]
struct Queues {
    open: bool,
    next_task_id: u64,
    pending_tasks: VecDeque<Task>,
    /// `(task id, descriptor index)` of the task being drained
    pending_dmas: VecDeque<(u64, usize)>,
    active_tasks: VecDeque<Task>,
    completed_tasks: VecDeque<Task>,
}

impl Queues {
    fn in_flight(&self) -> bool {
        !self.active_tasks.is_empty() || !self.completed_tasks.is_empty()
    }

    fn has_active_dmas(&self) -> bool {
        self.completed_tasks
            .iter()
            .chain(&self.active_tasks)
            .any(Task::has_active_dmas)
    }

    fn find_task(&self, id: u64) -> Option<&Task> {
        self.completed_tasks
            .iter()
            .chain(&self.active_tasks)
            .find(|t| t.id == id)
    }

    fn find_task_mut(&mut self, id: u64) -> Option<&mut Task> {
        self.completed_tasks
            .iter_mut()
            .chain(self.active_tasks.iter_mut())
            .find(|t| t.id == id)
    }

    fn promote(&mut self, task: Task) {
        trace!("task {} promoted with {} descriptors", task.id, task.dmas.len());
        self.pending_dmas
            .extend((0..task.dmas.len()).map(|index| (task.id, index)));
        task.request.notify_active();
        self.active_tasks.push_back(task);
    }

    /// Pop local fences at the head whose predecessors have all completed
    fn resolve_local_fences(&mut self) {
        while let Some(&(task_id, index)) = self.pending_dmas.front() {
            let resolved = match self.find_task_mut(task_id) {
                Some(task)
                    if task.dmas[index].kind() == DmaDescriptorType::LocalFence
                        && task.completed_before(index) =>
                {
                    task.dmas[index].mark_completed();
                    true
                }
                _ => false,
            };
            if !resolved {
                break;
            }
            trace!("task {task_id}: local fence at {index} resolved");
            self.pending_dmas.pop_front();
        }
    }

    /// Hand the head of `pending_dmas` to hardware unless it is a fence
    fn dispatch_head(&mut self) -> Option<DmaHandle> {
        let &(task_id, index) = self.pending_dmas.front()?;
        let info = self.find_task_mut(task_id)?.dmas.get_mut(index)?;
        if info.kind().is_fence() {
            return None;
        }
        info.mark_active();
        let handle = DmaHandle {
            task_id,
            index,
            descriptor: *info.descriptor(),
        };
        self.pending_dmas.pop_front();
        Some(handle)
    }

    /// Pop drained tasks from the front, oldest first
    fn take_finished(&mut self) -> Vec<Arc<dyn TpuRequest>> {
        let mut finished = Vec::new();
        while self.completed_tasks.front().is_some_and(Task::is_drained) {
            if let Some(task) = self.completed_tasks.pop_front() {
                finished.push(task.request);
            }
        }
        if self.completed_tasks.is_empty() {
            while self.active_tasks.front().is_some_and(Task::is_drained) {
                if let Some(task) = self.active_tasks.pop_front() {
                    self.pending_dmas.retain(|&(id, _)| id != task.id);
                    finished.push(task.request);
                }
            }
        }
        finished
    }

    /// Remove every task, oldest first
    fn drain_all(&mut self) -> Vec<Arc<dyn TpuRequest>> {
        self.pending_dmas.clear();
        self.completed_tasks
            .drain(..)
            .chain(self.active_tasks.drain(..))
            .chain(self.pending_tasks.drain(..))
            .map(|t| t.request)
            .collect()
    }
}

/// Multiplexes hardware requests onto one ordered descriptor queue
///
/// Descriptors are dispatched in submission order and, within a task, in
/// list order. A local fence holds back the rest of its task until every
/// earlier descriptor of that task has completed; a global fence holds back
/// everything until [`DmaScheduler::notify_request_completion`].
pub struct SingleQueueDmaScheduler {
    queues: Mutex<Queues>,
    changed: Condvar,
    watchdog: Arc<dyn Watchdog>,
}

impl std::fmt::Debug for SingleQueueDmaScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let q = self.lock();
        f.debug_struct("SingleQueueDmaScheduler")
            .field("open", &q.open)
            .field("pending_tasks", &q.pending_tasks.len())
            .field("pending_dmas", &q.pending_dmas.len())
            .field("active_tasks", &q.active_tasks.len())
            .field("completed_tasks", &q.completed_tasks.len())
            .finish()
    }
}

impl SingleQueueDmaScheduler {
    /// Closed scheduler supervised by `watchdog`
    pub fn new(watchdog: Arc<dyn Watchdog>) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            changed: Condvar::new(),
            watchdog,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Queues>) -> MutexGuard<'a, Queues> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal on progress, disarm once nothing is in flight
    fn kick_watchdog(&self, q: &Queues) {
        if q.in_flight() {
            if self.watchdog.signal().is_err() {
                // expired in the meantime; progress re-arms it
                if let Err(e) = self.watchdog.activate() {
                    warn!("watchdog re-arm failed: {e}");
                }
            }
        } else if let Err(e) = self.watchdog.deactivate() {
            debug!("watchdog deactivate failed: {e}");
        }
    }

    fn finish(finished: Vec<Arc<dyn TpuRequest>>) {
        for request in finished {
            debug!("request {} complete", request.id());
            request.notify_completion(Ok(()));
        }
    }
}

impl DmaScheduler for SingleQueueDmaScheduler {
    fn open(&self) -> Result<()> {
        let mut q = self.lock();
        if q.open {
            return Err(TpuError::failed_precondition("scheduler already open"));
        }
        q.open = true;
        info!("DMA scheduler opened");
        Ok(())
    }

    fn close(&self, mode: CloseMode) -> Result<()> {
        let cancelled = {
            let mut q = self.lock();
            if !q.open {
                return Err(TpuError::failed_precondition("scheduler is not open"));
            }
            q.open = false;
            if mode == CloseMode::Graceful {
                while q.has_active_dmas() {
                    q = self.wait(q);
                }
            }
            let cancelled = q.drain_all();
            if let Err(e) = self.watchdog.deactivate() {
                debug!("watchdog deactivate on close failed: {e}");
            }
            self.changed.notify_all();
            cancelled
        };
        info!(
            "DMA scheduler closed ({mode:?}); cancelling {} request(s)",
            cancelled.len()
        );
        for request in cancelled {
            request.cancel();
        }
        Ok(())
    }

    fn submit(&self, request: Arc<dyn TpuRequest>) -> Result<()> {
        let dmas = request.dmas()?;
        if dmas.is_empty() {
            return Err(TpuError::invalid_argument(format!(
                "request {} has no descriptors",
                request.id()
            )));
        }
        for d in &dmas {
            d.kind.validate()?;
        }
        let mut q = self.lock();
        if !q.open {
            return Err(TpuError::failed_precondition("scheduler is not open"));
        }
        request.notify_submission();
        let id = q.next_task_id;
        q.next_task_id = q.next_task_id.wrapping_add(1);
        debug!(
            "request {} submitted as task {id} ({} descriptors)",
            request.id(),
            dmas.len()
        );
        q.pending_tasks.push_back(Task::new(id, request, dmas));
        Ok(())
    }

    fn peek_next_dma(&self) -> Option<DmaDescriptorType> {
        let q = self.lock();
        match q.pending_dmas.front() {
            Some(&(task_id, index)) => q.find_task(task_id).map(|t| t.dmas[index].kind()),
            None => q
                .pending_tasks
                .front()
                .and_then(|t| t.dmas.first())
                .map(DmaInfo::kind),
        }
    }

    fn get_next_dma(&self) -> Option<DmaHandle> {
        let (handle, finished) = {
            let mut q = self.lock();
            if !q.open {
                return None;
            }
            // a task made only of resolvable local fences leaves nothing
            // to dispatch; move on to the next one
            let mut promoted = false;
            while q.pending_dmas.is_empty() {
                let Some(task) = q.pending_tasks.pop_front() else {
                    break;
                };
                q.promote(task);
                q.resolve_local_fences();
                promoted = true;
            }
            if promoted {
                if let Err(e) = self.watchdog.activate() {
                    warn!("watchdog activate failed: {e}");
                }
            }
            let handle = q.dispatch_head();
            let finished = q.take_finished();
            if !finished.is_empty() {
                self.kick_watchdog(&q);
                self.changed.notify_all();
            }
            (handle, finished)
        };
        Self::finish(finished);
        handle
    }

    fn notify_dma_completion(&self, handle: &DmaHandle) -> Result<()> {
        let finished = {
            let mut q = self.lock();
            let task = q.find_task_mut(handle.task_id).ok_or_else(|| {
                TpuError::failed_precondition(format!("task {} is not in flight", handle.task_id))
            })?;
            let info = task.dmas.get_mut(handle.index).ok_or_else(|| {
                TpuError::failed_precondition(format!(
                    "task {} has no descriptor {}",
                    handle.task_id, handle.index
                ))
            })?;
            if !info.is_active() {
                return Err(TpuError::failed_precondition(format!(
                    "descriptor {} of task {} is {:?}, not active",
                    handle.index,
                    handle.task_id,
                    info.state()
                )));
            }
            info.mark_completed();
            trace!(
                "task {}: {} at {} completed",
                handle.task_id,
                handle.descriptor.kind,
                handle.index
            );
            q.resolve_local_fences();
            let finished = q.take_finished();
            self.kick_watchdog(&q);
            self.changed.notify_all();
            finished
        };
        Self::finish(finished);
        Ok(())
    }

    fn notify_request_completion(&self) -> Result<()> {
        let finished = {
            let mut q = self.lock();
            let Some(task) = q.active_tasks.front_mut() else {
                return Err(TpuError::failed_precondition(
                    "request completion with no active request",
                ));
            };
            if task.has_pending_transfers() {
                return Err(TpuError::failed_precondition(format!(
                    "task {} completed with transfers still pending",
                    task.id
                )));
            }
            // only fences can be left; the global one needs exactly this signal
            for info in &mut task.dmas {
                if info.state() == DmaState::Pending {
                    info.mark_completed();
                }
            }
            let task_id = task.id;
            q.pending_dmas.retain(|&(id, _)| id != task_id);
            if let Some(task) = q.active_tasks.pop_front() {
                debug!("task {task_id}: request completion received");
                q.completed_tasks.push_back(task);
            }
            let finished = q.take_finished();
            self.kick_watchdog(&q);
            self.changed.notify_all();
            finished
        };
        Self::finish(finished);
        Ok(())
    }

    fn wait_active_requests(&self) -> Result<()> {
        let mut q = self.lock();
        while q.in_flight() {
            q = self.wait(q);
        }
        Ok(())
    }

    fn max_remaining_cycles(&self) -> u64 {
        let q = self.lock();
        q.pending_tasks
            .iter()
            .chain(&q.active_tasks)
            .map(|t| t.request.estimated_cycles())
            .fold(0, u64::saturating_add)
    }

    fn oldest_active_request(&self) -> Option<Arc<dyn TpuRequest>> {
        let q = self.lock();
        q.completed_tasks
            .front()
            .or_else(|| q.active_tasks.front())
            .map(|t| Arc::clone(&t.request))
    }

    fn is_empty(&self) -> bool {
        let q = self.lock();
        q.pending_tasks.is_empty()
            && q.pending_dmas.is_empty()
            && q.active_tasks.is_empty()
            && q.completed_tasks.is_empty()
    }
}

impl Drop for SingleQueueDmaScheduler {
    fn drop(&mut self) {
        if self.lock().open {
            warn!("DMA scheduler dropped while open; cancelling outstanding work");
            let _ = self.close(CloseMode::Asap);
        }
    }
}
