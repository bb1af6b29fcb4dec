//! Scheduling core of a user-space TPU driver.
//!
//! Turns concurrent application inference requests into one ordered stream
//! of DMA descriptors on the accelerator's single hardware queue, and
//! supervises the queue for liveness.
//!
//! # Layering
//!
//! ```text
//! Request               application call; split into hardware batches
//!   HardwareRequest     one native batch, an ordered descriptor list
//! RealTimeDmaScheduler  deadline admission for periodic models
//!   SingleQueueDmaScheduler   FIFO hand-off with local/global fences
//! CascadeWatchdog       escalating liveness timeouts
//! SoftwareDmaEngine     register-level stand-in for the hardware queue
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tpu_driver::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let stack = DriverStack::new(DriverConfig::from_env()?, |level, _| {
//!     eprintln!("watchdog level {level} expired");
//! })?;
//! let mut engine =
//!     stack.software_engine(Arc::new(MemoryRegisters::new()), EngineConfig::default())?;
//!
//! let exe = Arc::new(
//!     Executable::builder(ExecutableId::new(1), "mobilenet")
//!         .hardware_batch_size(4)
//!         .input(LayerInfo::new("image", 150_528))
//!         .output(LayerInfo::new("logits", 1_001))
//!         .build()?,
//! );
//! let request = Arc::new(Request::new(1, Arc::clone(&exe)));
//! request.add_input("image", Buffer::from(vec![0u8; 150_528]))?;
//! request.add_output("logits", Buffer::from(vec![0u8; 1_001]))?;
//! request.set_done(|id, status| println!("request {id}: {status:?}"))?;
//! request.prepare()?;
//!
//! stack.submit(&request)?;
//! engine.run_until_idle()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod config;
mod dma;
mod error;
mod executable;
mod executor;
mod registers;
mod request;
pub mod scheduler;
mod stack;
mod timer;
#[cfg(target_os = "linux")]
mod timerfd;
mod tpu_request;
pub mod watchdog;

/// Queue CSR layout (re-exported from tpu-chip).
pub mod csr {
    pub use tpu_chip::descriptor::{
        align_transfer, DEFAULT_HARDWARE_BATCH_SIZE, SCALAR_CORE_INTERRUPT_COUNT,
        TRANSFER_ALIGNMENT,
    };
    pub use tpu_chip::regs;
}

pub use backends::{EngineConfig, EngineStats, SoftwareDmaEngine, StepOutcome};
pub use config::{DriverConfig, RealTimeConfig, WatchdogConfig};
pub use dma::{DmaDescriptor, DmaDescriptorType, DmaHandle, DmaInfo, DmaState};
pub use error::{ErrorKind, Result, TpuError};
pub use executable::{Buffer, Executable, ExecutableBuilder, ExecutableId, LayerInfo};
pub use registers::{MemoryRegisters, Registers};
pub use request::{DoneCallback, Request, RequestState};
pub use scheduler::{
    CloseMode, DmaScheduler, ExecutableTiming, RealTimeDmaScheduler, SingleQueueDmaScheduler,
    TimingUpdate,
};
pub use stack::{DriverStack, StackScheduler};
pub use timer::{Clock, CondvarTimer, CountdownTimer, ManualClock, MonotonicClock, TimerBackend};
#[cfg(target_os = "linux")]
pub use timerfd::TimerFd;
pub use tpu_request::{HardwareRequest, RequestTiming, TpuDoneCallback, TpuRequest};
pub use watchdog::{
    CascadeLevel, CascadeWatchdog, CountingWatch, NoopWatchdog, TimerWatchdog, Watchdog,
    WatchdogState,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Buffer, CloseMode, DmaScheduler, DriverConfig, DriverStack, EngineConfig, Executable,
        ExecutableId, ExecutableTiming, HardwareRequest, LayerInfo, MemoryRegisters, Request,
        Result, SoftwareDmaEngine, TimingUpdate, TpuError, TpuRequest, Watchdog,
    };
}
