//! CSR map for the single hardware DMA descriptor queue.
//!
//! The scheduler never touches these directly; they are written by the
//! I/O layer (or the software engine) when a descriptor is handed over.
//!
//! ```text
//! 0x0000  QUEUE_STATUS        idle / running / halted / error
//! 0x0008  QUEUE_CONTROL       enable, reset
//! 0x0010  DESCRIPTOR_ADDR     host/device address of the transfer
//! 0x0018  DESCRIPTOR_SIZE     transfer size in bytes
//! 0x0020  DESCRIPTOR_TAG      descriptor type tag (see `descriptor::tag`)
//! 0x0028  DOORBELL            running count of descriptors issued
//! 0x0030  COMPLETED_COUNT     running count of descriptors retired
//! 0x0040  INTERRUPT_STATUS    scalar-core interrupt lines + task done
//! 0x0048  INTERRUPT_CLEAR
//! 0x0100  WATCHDOG_TIMEOUT    hardware watchdog reload value (cycles)
//! 0x0108  WATCHDOG_KICK
//! ```

// ── Queue status and control ─────────────────────────────────────────────────

/// Queue status register.
pub const QUEUE_STATUS: u64 = 0x0000;

/// Queue control register.
pub const QUEUE_CONTROL: u64 = 0x0008;

// ── Descriptor hand-off ──────────────────────────────────────────────────────

/// Address of the descriptor being issued.
pub const DESCRIPTOR_ADDR: u64 = 0x0010;
/// Size in bytes of the descriptor being issued.
pub const DESCRIPTOR_SIZE: u64 = 0x0018;
/// Type tag of the descriptor being issued.
pub const DESCRIPTOR_TAG: u64 = 0x0020;
/// Doorbell. Writing the new issue count hands the descriptor to hardware.
pub const DOORBELL: u64 = 0x0028;
/// Count of descriptors retired by hardware. Monotonic, wraps at 2^64.
pub const COMPLETED_COUNT: u64 = 0x0030;

// ── Interrupts ───────────────────────────────────────────────────────────────

/// Interrupt status. Bits 0..=3 are scalar-core lines, bit 8 is task done.
pub const INTERRUPT_STATUS: u64 = 0x0040;
/// Write-one-to-clear for `INTERRUPT_STATUS`.
pub const INTERRUPT_CLEAR: u64 = 0x0048;

// ── Hardware watchdog ────────────────────────────────────────────────────────

/// Hardware watchdog reload value in core cycles.
pub const WATCHDOG_TIMEOUT: u64 = 0x0100;
/// Hardware watchdog kick.
pub const WATCHDOG_KICK: u64 = 0x0108;

// ── Status register values ───────────────────────────────────────────────────

/// `QUEUE_STATUS` values.
pub mod status {
    /// Queue empty, nothing in flight.
    pub const IDLE: u64 = 0;
    /// Descriptors in flight.
    pub const RUNNING: u64 = 1;
    /// Halted by host.
    pub const HALTED: u64 = 2;
    /// Fault latched; requires reset.
    pub const ERROR: u64 = 3;
}

// ── Control register bit definitions ─────────────────────────────────────────

/// `QUEUE_CONTROL` bits.
pub mod control {
    /// Enable descriptor fetch.
    pub const ENABLE: u64 = 1 << 0;
    /// Soft reset of the queue.
    pub const RESET: u64 = 1 << 1;
}

// ── Interrupt status bit definitions ─────────────────────────────────────────

/// `INTERRUPT_STATUS` bits.
pub mod interrupt {
    use crate::descriptor::SCALAR_CORE_INTERRUPT_COUNT;

    /// Bit for scalar-core interrupt line `n`, `None` past the last line.
    pub const fn scalar_core(n: u8) -> Option<u64> {
        if n < SCALAR_CORE_INTERRUPT_COUNT {
            Some(1 << n)
        } else {
            None
        }
    }
    /// Whole-task completion, raised after a global fence is reached.
    pub const TASK_DONE: u64 = 1 << 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets_non_overlapping() {
        let all = [
            QUEUE_STATUS,
            QUEUE_CONTROL,
            DESCRIPTOR_ADDR,
            DESCRIPTOR_SIZE,
            DESCRIPTOR_TAG,
            DOORBELL,
            COMPLETED_COUNT,
            INTERRUPT_STATUS,
            INTERRUPT_CLEAR,
            WATCHDOG_TIMEOUT,
            WATCHDOG_KICK,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
            assert_eq!(a % 8, 0, "CSR {a:#x} not 64-bit aligned");
        }
    }

    #[test]
    fn interrupt_lines_distinct_from_task_done() {
        for n in 0..4 {
            let bit = interrupt::scalar_core(n).expect("valid line");
            assert_eq!(bit & interrupt::TASK_DONE, 0);
        }
    }

    #[test]
    fn interrupt_line_out_of_range() {
        assert_eq!(interrupt::scalar_core(4), None);
        assert_eq!(interrupt::scalar_core(64), None);
        assert_eq!(interrupt::scalar_core(u8::MAX), None);
    }
}
