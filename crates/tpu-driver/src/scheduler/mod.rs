//! DMA schedulers
//!
//! A scheduler owns the ordered stream of descriptors feeding the single
//! hardware queue. Applications call `submit`; the I/O or interrupt layer
//! drives `get_next_dma`, `notify_dma_completion` and
//! `notify_request_completion`.

mod real_time;
mod single_queue;

pub use real_time::{ExecutableTiming, RealTimeDmaScheduler, TimingUpdate};
pub use single_queue::SingleQueueDmaScheduler;

use crate::dma::{DmaDescriptorType, DmaHandle};
use crate::error::Result;
use crate::tpu_request::TpuRequest;
use std::sync::Arc;

/// How `close` treats outstanding work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Cancel everything now
    Asap,
    /// Let dispatched descriptors finish, then cancel the rest
    #[default]
    Graceful,
}

/// Scheduler contract shared by the single-queue scheduler and its
/// decorators
pub trait DmaScheduler: Send + Sync {
    /// Start accepting work
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if already open.
    fn open(&self) -> Result<()>;

    /// Stop accepting work and tear down what is queued
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if not open.
    fn close(&self, mode: CloseMode) -> Result<()>;

    /// Queue a hardware request
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if not open; `InvalidArgument` for an empty
    /// descriptor list; decorators add their own admission errors.
    fn submit(&self, request: Arc<dyn TpuRequest>) -> Result<()>;

    /// Kind of the descriptor `get_next_dma` would look at next
    fn peek_next_dma(&self) -> Option<DmaDescriptorType>;

    /// Next descriptor to hand to hardware, if one is ready
    fn get_next_dma(&self) -> Option<DmaHandle>;

    /// Hardware finished the descriptor behind `handle`
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if that descriptor is not active.
    fn notify_dma_completion(&self, handle: &DmaHandle) -> Result<()>;

    /// Hardware finished the oldest active request as a whole
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` if there is no active request or it still has
    /// pending transfers.
    fn notify_request_completion(&self) -> Result<()>;

    /// Block until no dispatched request remains
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn wait_active_requests(&self) -> Result<()>;

    /// Estimated cycles of pending and active requests
    fn max_remaining_cycles(&self) -> u64;

    /// Oldest dispatched request still awaiting completion
    fn oldest_active_request(&self) -> Option<Arc<dyn TpuRequest>>;

    /// No queued, dispatched or completing work
    fn is_empty(&self) -> bool;
}
