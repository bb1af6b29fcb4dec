//! Descriptor tag encoding as written to `regs::DESCRIPTOR_TAG`.
//!
//! Fence tags exist for completeness of the encoding; fences are
//! host-side synchronisation markers and are never written to the queue.

/// Number of scalar-core interrupt lines a descriptor can raise.
pub const SCALAR_CORE_INTERRUPT_COUNT: u8 = 4;

/// Native hardware batch size of the reference parts.
pub const DEFAULT_HARDWARE_BATCH_SIZE: usize = 1;

/// Alignment of every activation/parameter transfer, in bytes.
pub const TRANSFER_ALIGNMENT: usize = 64;

/// Descriptor tag values.
pub mod tag {
    /// Instruction stream fetch.
    pub const INSTRUCTION: u64 = 0x01;
    /// Input activation transfer (host → device).
    pub const INPUT_ACTIVATION: u64 = 0x02;
    /// Parameter (weights) transfer.
    pub const PARAMETER: u64 = 0x03;
    /// Output activation transfer (device → host).
    pub const OUTPUT_ACTIVATION: u64 = 0x04;
    /// Local fence marker.
    pub const LOCAL_FENCE: u64 = 0x10;
    /// Global fence marker.
    pub const GLOBAL_FENCE: u64 = 0x11;
    /// Base tag for scalar-core interrupts; line `n` uses `BASE + n`.
    pub const SCALAR_CORE_INTERRUPT_BASE: u64 = 0x20;
}

/// Round `size` up to the transfer alignment.
pub const fn align_transfer(size: usize) -> usize {
    size.div_ceil(TRANSFER_ALIGNMENT) * TRANSFER_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_tags_do_not_collide() {
        let last = tag::SCALAR_CORE_INTERRUPT_BASE + u64::from(SCALAR_CORE_INTERRUPT_COUNT) - 1;
        assert!(last > tag::GLOBAL_FENCE);
        assert!(tag::SCALAR_CORE_INTERRUPT_BASE > tag::GLOBAL_FENCE);
    }

    #[test]
    fn transfer_alignment_rounds_up() {
        assert_eq!(align_transfer(0), 0);
        assert_eq!(align_transfer(1), 64);
        assert_eq!(align_transfer(64), 64);
        assert_eq!(align_transfer(65), 128);
    }
}
