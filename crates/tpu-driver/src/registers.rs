//! Register access for the TPU DMA queue
//!
//! The platform layer (mmap'd BAR, ioctl bridge, USB control transfers)
//! implements [`Registers`]; the core only needs read, write and poll.
//! [`MemoryRegisters`] backs the software engine and tests.

use crate::error::{Result, TpuError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Interval between reads while polling
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// CSR access interface
pub trait Registers: Send + Sync {
    /// Read a 64-bit register
    ///
    /// # Errors
    ///
    /// Returns error if the platform access fails.
    fn read(&self, offset: u64) -> Result<u64>;

    /// Write a 64-bit register
    ///
    /// # Errors
    ///
    /// Returns error if the platform access fails.
    fn write(&self, offset: u64, value: u64) -> Result<()>;

    /// Spin until `offset` reads `expected`, without bound
    ///
    /// # Errors
    ///
    /// Returns error if a read fails.
    fn poll(&self, offset: u64, expected: u64) -> Result<()> {
        loop {
            if self.read(offset)? == expected {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Spin until `offset` reads `expected` or `timeout` elapses
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` on timeout, or the read error.
    fn poll_timeout(&self, offset: u64, expected: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self.read(offset)?;
            if value == expected {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TpuError::deadline_exceeded(format!(
                    "register {offset:#x} reads {value:#x}, expected {expected:#x} after {timeout:?}"
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Read the low 32 bits of a register
    ///
    /// # Errors
    ///
    /// Returns error if the platform access fails.
    #[allow(clippy::cast_possible_truncation)]
    fn read32(&self, offset: u64) -> Result<u32> {
        self.read(offset).map(|v| v as u32)
    }

    /// Write a 32-bit value, zero-extended
    ///
    /// # Errors
    ///
    /// Returns error if the platform access fails.
    fn write32(&self, offset: u64, value: u32) -> Result<()> {
        self.write(offset, u64::from(value))
    }
}

/// In-process register file
///
/// Unwritten registers read as zero. Optionally bounded so stray offsets
/// surface as errors the way an out-of-range BAR access would.
#[derive(Debug, Default)]
pub struct MemoryRegisters {
    values: Mutex<HashMap<u64, u64>>,
    size: Option<u64>,
}

impl MemoryRegisters {
    /// Unbounded register file
    pub fn new() -> Self {
        Self::default()
    }

    /// Register file that rejects offsets at or beyond `size`
    pub fn with_size(size: u64) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            size: Some(size),
        }
    }

    fn check(&self, offset: u64) -> Result<()> {
        if offset % 8 != 0 {
            return Err(TpuError::invalid_argument(format!(
                "register offset {offset:#x} is not 64-bit aligned"
            )));
        }
        match self.size {
            Some(size) if offset + 8 > size => Err(TpuError::invalid_argument(format!(
                "register offset {offset:#x} out of bounds (size {size:#x})"
            ))),
            _ => Ok(()),
        }
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<u64, u64>> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Registers for MemoryRegisters {
    fn read(&self, offset: u64) -> Result<u64> {
        self.check(offset)?;
        Ok(self.values().get(&offset).copied().unwrap_or(0))
    }

    fn write(&self, offset: u64, value: u64) -> Result<()> {
        self.check(offset)?;
        tracing::trace!("csr write {offset:#06x} <- {value:#x}");
        self.values().insert(offset, value);
        Ok(())
    }
}
