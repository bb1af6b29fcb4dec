//! DMA descriptor model
//!
//! A hardware request carries an ordered list of [`DmaDescriptor`]s. Inside
//! the scheduler each one is wrapped in a [`DmaInfo`] that tracks its
//! progress; the I/O layer sees a [`DmaHandle`].

use crate::error::{Result, TpuError};
use tpu_chip::descriptor::{tag, SCALAR_CORE_INTERRUPT_COUNT};

/// Kind of descriptor in a task's list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDescriptorType {
    /// Instruction stream fetch
    Instruction,
    /// Input activation transfer
    InputActivation,
    /// Parameter (weights) transfer
    Parameter,
    /// Output activation transfer
    OutputActivation,
    /// Resolves once earlier descriptors of the same task completed
    LocalFence,
    /// Resolves only on an explicit whole-task completion
    GlobalFence,
    /// Scalar-core interrupt line 0..=3
    ScalarCoreInterrupt(u8),
}

impl DmaDescriptorType {
    /// Scalar-core interrupt on `line`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `line` is not a valid interrupt line.
    pub fn scalar_core_interrupt(line: u8) -> Result<Self> {
        if line >= SCALAR_CORE_INTERRUPT_COUNT {
            return Err(TpuError::invalid_argument(format!(
                "scalar core interrupt {line} out of range (0..{SCALAR_CORE_INTERRUPT_COUNT})"
            )));
        }
        Ok(Self::ScalarCoreInterrupt(line))
    }

    /// Reject variants built directly with an out-of-range line
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a scalar-core interrupt past the last line.
    pub fn validate(self) -> Result<()> {
        match self {
            Self::ScalarCoreInterrupt(line) => Self::scalar_core_interrupt(line).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Fences never reach hardware
    pub const fn is_fence(self) -> bool {
        matches!(self, Self::LocalFence | Self::GlobalFence)
    }

    /// Tag written to the descriptor-tag CSR
    pub fn hw_tag(self) -> u64 {
        match self {
            Self::Instruction => tag::INSTRUCTION,
            Self::InputActivation => tag::INPUT_ACTIVATION,
            Self::Parameter => tag::PARAMETER,
            Self::OutputActivation => tag::OUTPUT_ACTIVATION,
            Self::LocalFence => tag::LOCAL_FENCE,
            Self::GlobalFence => tag::GLOBAL_FENCE,
            Self::ScalarCoreInterrupt(line) => tag::SCALAR_CORE_INTERRUPT_BASE + u64::from(line),
        }
    }
}

impl std::fmt::Display for DmaDescriptorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instruction => write!(f, "instruction"),
            Self::InputActivation => write!(f, "input-activation"),
            Self::Parameter => write!(f, "parameter"),
            Self::OutputActivation => write!(f, "output-activation"),
            Self::LocalFence => write!(f, "local-fence"),
            Self::GlobalFence => write!(f, "global-fence"),
            Self::ScalarCoreInterrupt(line) => write!(f, "scalar-core-interrupt{line}"),
        }
    }
}

/// One hardware queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// Descriptor kind
    pub kind: DmaDescriptorType,
    /// Transfer address (zero for fences and interrupts)
    pub address: u64,
    /// Transfer size in bytes (zero for fences and interrupts)
    pub size_bytes: usize,
}

impl DmaDescriptor {
    /// Transfer descriptor
    pub const fn transfer(kind: DmaDescriptorType, address: u64, size_bytes: usize) -> Self {
        Self {
            kind,
            address,
            size_bytes,
        }
    }

    /// Payload-free marker (fence or interrupt)
    pub const fn marker(kind: DmaDescriptorType) -> Self {
        Self {
            kind,
            address: 0,
            size_bytes: 0,
        }
    }
}

/// Progress of one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaState {
    /// Not yet handed to hardware
    Pending,
    /// Handed to hardware, completion outstanding
    Active,
    /// Done
    Completed,
}

/// A descriptor plus its progress, owned by a scheduler task
#[derive(Debug, Clone)]
pub struct DmaInfo {
    descriptor: DmaDescriptor,
    state: DmaState,
}

impl DmaInfo {
    /// Wrap a descriptor in the pending state
    pub const fn new(descriptor: DmaDescriptor) -> Self {
        Self {
            descriptor,
            state: DmaState::Pending,
        }
    }

    /// The wrapped descriptor
    pub const fn descriptor(&self) -> &DmaDescriptor {
        &self.descriptor
    }

    /// Descriptor kind
    pub const fn kind(&self) -> DmaDescriptorType {
        self.descriptor.kind
    }

    /// Current progress
    pub const fn state(&self) -> DmaState {
        self.state
    }

    /// Handed to hardware
    pub fn mark_active(&mut self) {
        self.state = DmaState::Active;
    }

    /// Retired
    pub fn mark_completed(&mut self) {
        self.state = DmaState::Completed;
    }

    /// Shorthand for `state() == Active`
    pub fn is_active(&self) -> bool {
        self.state == DmaState::Active
    }

    /// Shorthand for `state() == Completed`
    pub fn is_completed(&self) -> bool {
        self.state == DmaState::Completed
    }
}

/// What the scheduler hands to the I/O layer for one descriptor
///
/// Passed back unchanged to `notify_dma_completion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaHandle {
    /// Scheduler-assigned task id
    pub task_id: u64,
    /// Position in the task's descriptor list
    pub index: usize,
    /// Copy of the descriptor
    pub descriptor: DmaDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_core_interrupt_range_checked() {
        assert!(DmaDescriptorType::scalar_core_interrupt(3).is_ok());
        let err = DmaDescriptorType::scalar_core_interrupt(4).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn only_fences_are_fences() {
        assert!(DmaDescriptorType::LocalFence.is_fence());
        assert!(DmaDescriptorType::GlobalFence.is_fence());
        assert!(!DmaDescriptorType::InputActivation.is_fence());
        assert!(!DmaDescriptorType::ScalarCoreInterrupt(0).is_fence());
    }

    #[test]
    fn hw_tags_are_distinct() {
        let kinds = [
            DmaDescriptorType::Instruction,
            DmaDescriptorType::InputActivation,
            DmaDescriptorType::Parameter,
            DmaDescriptorType::OutputActivation,
            DmaDescriptorType::LocalFence,
            DmaDescriptorType::GlobalFence,
            DmaDescriptorType::ScalarCoreInterrupt(0),
            DmaDescriptorType::ScalarCoreInterrupt(3),
        ];
        let mut tags: Vec<u64> = kinds.iter().map(|k| k.hw_tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), kinds.len());
    }

    #[test]
    fn dma_info_progresses() {
        let mut info = DmaInfo::new(DmaDescriptor::transfer(
            DmaDescriptorType::Parameter,
            0x1000,
            256,
        ));
        assert_eq!(info.state(), DmaState::Pending);
        info.mark_active();
        assert!(info.is_active());
        info.mark_completed();
        assert!(info.is_completed());
    }
}
