// SPDX-License-Identifier: AGPL-3.0-only

//! Software DMA engine
//!
//! Plays the part of the hardware queue and its interrupt handler against a
//! [`Registers`] implementation: it pulls descriptors from a
//! [`DmaScheduler`], issues them through the descriptor CSRs, waits for the
//! retired count to catch up and reports completion. When the scheduler
//! shows a global fence, the engine raises "task done" and reports request
//! completion. This enables:
//!
//! 1. **CI without hardware**: every scheduler path runs end to end against
//!    [`MemoryRegisters`](crate::MemoryRegisters).
//!
//! 2. **Fault drills**: `stall_after` stops the engine mid-stream so the
//!    watchdog escalation chain can be observed.
//!
//! ## One step
//!
//! ```text
//! get_next_dma ─┬─ Some(d) → ADDR/SIZE/TAG → DOORBELL → poll COMPLETED_COUNT
//!               │            → notify_dma_completion
//!               └─ None ──── peek == GlobalFence → INTERRUPT_STATUS(TASK_DONE)
//!                                                → notify_request_completion
//! ```

use crate::dma::{DmaDescriptorType, DmaHandle};
use crate::error::{Result, TpuError};
use crate::registers::Registers;
use crate::scheduler::DmaScheduler;
use std::sync::Arc;
use std::time::Duration;
use tpu_chip::regs;
use tracing::{debug, info, trace, warn};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Simulated time per transfer
    pub transfer_time: Duration,
    /// Stop retiring descriptors after this many
    pub stall_after: Option<u64>,
    /// Bound on waiting for the retired count
    pub poll_timeout: Duration,
    /// Hardware watchdog reload value written at start-up (core cycles)
    pub hw_watchdog_cycles: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer_time: Duration::ZERO,
            stall_after: None,
            poll_timeout: Duration::from_millis(100),
            hw_watchdog_cycles: 1_000_000,
        }
    }
}

/// Counters since the engine was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Descriptors issued and retired
    pub descriptors: u64,
    /// Bytes moved by transfer descriptors
    pub bytes: u64,
    /// Whole-request completions raised
    pub requests: u64,
}

/// What one [`SoftwareDmaEngine::step`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A descriptor was issued and retired
    Dispatched(DmaHandle),
    /// A request completion was raised
    RequestCompleted,
    /// Nothing ready
    Idle,
    /// Stall injection reached; the queue is halted
    Stalled,
}

/// Software stand-in for the hardware queue and its interrupt handler
pub struct SoftwareDmaEngine {
    scheduler: Arc<dyn DmaScheduler>,
    registers: Arc<dyn Registers>,
    config: EngineConfig,
    stats: EngineStats,
    issued: u64,
}

impl std::fmt::Debug for SoftwareDmaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDmaEngine")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl SoftwareDmaEngine {
    /// Reset and enable the queue behind `registers`
    ///
    /// # Errors
    ///
    /// Returns error if a register access fails.
    pub fn new(
        scheduler: Arc<dyn DmaScheduler>,
        registers: Arc<dyn Registers>,
        config: EngineConfig,
    ) -> Result<Self> {
        registers.write(regs::QUEUE_CONTROL, regs::control::RESET)?;
        registers.write(regs::DOORBELL, 0)?;
        registers.write(regs::COMPLETED_COUNT, 0)?;
        registers.write(regs::INTERRUPT_CLEAR, u64::MAX)?;
        registers.write(regs::INTERRUPT_STATUS, 0)?;
        registers.write(regs::WATCHDOG_TIMEOUT, config.hw_watchdog_cycles)?;
        registers.write(regs::QUEUE_CONTROL, regs::control::ENABLE)?;
        registers.write(regs::QUEUE_STATUS, regs::status::IDLE)?;
        info!("software DMA engine enabled ({config:?})");
        Ok(Self {
            scheduler,
            registers,
            config,
            stats: EngineStats::default(),
            issued: 0,
        })
    }

    /// Counters so far
    pub const fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Advance the queue by one descriptor or one request completion
    ///
    /// # Errors
    ///
    /// Register failures, a retired count that never catches up
    /// (`DeadlineExceeded`), or scheduler notification errors.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self
            .config
            .stall_after
            .is_some_and(|limit| self.stats.descriptors >= limit)
        {
            if self.registers.read(regs::QUEUE_STATUS)? != regs::status::HALTED {
                warn!("engine stalled after {} descriptors", self.stats.descriptors);
                self.registers.write(regs::QUEUE_STATUS, regs::status::HALTED)?;
            }
            return Ok(StepOutcome::Stalled);
        }

        if let Some(handle) = self.scheduler.get_next_dma() {
            self.issue(&handle)?;
            self.scheduler.notify_dma_completion(&handle)?;
            return Ok(StepOutcome::Dispatched(handle));
        }

        if self.scheduler.peek_next_dma() == Some(DmaDescriptorType::GlobalFence) {
            self.raise(regs::interrupt::TASK_DONE)?;
            self.scheduler.notify_request_completion()?;
            self.stats.requests += 1;
            return Ok(StepOutcome::RequestCompleted);
        }

        Ok(StepOutcome::Idle)
    }

    /// Step until nothing is ready or the engine stalls
    ///
    /// # Errors
    ///
    /// The first error from [`SoftwareDmaEngine::step`].
    pub fn run_until_idle(&mut self) -> Result<EngineStats> {
        loop {
            match self.step()? {
                StepOutcome::Idle | StepOutcome::Stalled => return Ok(self.stats),
                StepOutcome::Dispatched(_) | StepOutcome::RequestCompleted => {}
            }
        }
    }

    fn issue(&mut self, handle: &DmaHandle) -> Result<()> {
        let d = handle.descriptor;
        trace!(
            "issue task {} #{}: {} {:#x}+{}",
            handle.task_id,
            handle.index,
            d.kind,
            d.address,
            d.size_bytes
        );
        self.registers.write(regs::DESCRIPTOR_ADDR, d.address)?;
        self.registers.write(regs::DESCRIPTOR_SIZE, d.size_bytes as u64)?;
        self.registers.write(regs::DESCRIPTOR_TAG, d.kind.hw_tag())?;
        self.issued = self.issued.wrapping_add(1);
        self.registers.write(regs::DOORBELL, self.issued)?;
        self.registers.write(regs::QUEUE_STATUS, regs::status::RUNNING)?;

        self.execute(handle)?;
        self.registers
            .poll_timeout(regs::COMPLETED_COUNT, self.issued, self.config.poll_timeout)?;

        self.registers.write(regs::WATCHDOG_KICK, 1)?;
        self.registers.write(regs::QUEUE_STATUS, regs::status::IDLE)?;
        self.stats.descriptors += 1;
        self.stats.bytes += d.size_bytes as u64;
        Ok(())
    }

    /// The "hardware" side: move the data, retire the descriptor
    fn execute(&self, handle: &DmaHandle) -> Result<()> {
        if !self.config.transfer_time.is_zero() {
            std::thread::sleep(self.config.transfer_time);
        }
        if let DmaDescriptorType::ScalarCoreInterrupt(line) = handle.descriptor.kind {
            let bit = regs::interrupt::scalar_core(line).ok_or_else(|| {
                TpuError::invalid_argument(format!("no scalar core interrupt line {line}"))
            })?;
            self.raise(bit)?;
        }
        let retired = self.registers.read(regs::COMPLETED_COUNT)?;
        self.registers
            .write(regs::COMPLETED_COUNT, retired.wrapping_add(1))
    }

    /// Latch and acknowledge an interrupt bit
    fn raise(&self, bit: u64) -> Result<()> {
        let status = self.registers.read(regs::INTERRUPT_STATUS)? | bit;
        self.registers.write(regs::INTERRUPT_STATUS, status)?;
        debug!("interrupt {bit:#x} raised");
        self.registers.write(regs::INTERRUPT_CLEAR, bit)?;
        self.registers.write(regs::INTERRUPT_STATUS, status & !bit)
    }
}
