//! Executable metadata and host buffers
//!
//! The package layer parses and verifies executables; what reaches the
//! scheduling core is this summary: layer names and sizes, the native
//! hardware batch size and a cycle estimate.

use crate::error::{Result, TpuError};
use bytes::Bytes;
use std::collections::HashSet;
use tpu_chip::descriptor::{align_transfer, DEFAULT_HARDWARE_BATCH_SIZE};

/// Identifies a hardware-level executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutableId(u64);

impl ExecutableId {
    /// Create new executable id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ExecutableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exe#{}", self.0)
    }
}

/// One named input or output layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    name: String,
    actual_size_bytes: usize,
    padded_size_bytes: usize,
}

impl LayerInfo {
    /// Layer whose padded size is the transfer-aligned actual size
    pub fn new(name: impl Into<String>, actual_size_bytes: usize) -> Self {
        Self {
            name: name.into(),
            actual_size_bytes,
            padded_size_bytes: align_transfer(actual_size_bytes),
        }
    }

    /// Layer with an explicit padded size (never below the actual size)
    pub fn with_padding(
        name: impl Into<String>,
        actual_size_bytes: usize,
        padded_size_bytes: usize,
    ) -> Self {
        Self {
            name: name.into(),
            actual_size_bytes,
            padded_size_bytes: padded_size_bytes.max(actual_size_bytes),
        }
    }

    /// Layer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unpadded size of one batch element
    pub const fn actual_size_bytes(&self) -> usize {
        self.actual_size_bytes
    }

    /// Padded size of one batch element
    pub const fn padded_size_bytes(&self) -> usize {
        self.padded_size_bytes
    }

    /// Whether a buffer of `size` bytes fits this layer
    pub const fn accepts(&self, size: usize) -> bool {
        size == self.actual_size_bytes || size == self.padded_size_bytes
    }
}

/// Hardware-level executable summary
#[derive(Debug, Clone)]
pub struct Executable {
    id: ExecutableId,
    name: String,
    hardware_batch_size: usize,
    inputs: Vec<LayerInfo>,
    outputs: Vec<LayerInfo>,
    estimated_cycles: u64,
    instruction_bytes: usize,
}

impl Executable {
    /// Start describing an executable
    pub fn builder(id: ExecutableId, name: impl Into<String>) -> ExecutableBuilder {
        ExecutableBuilder {
            exe: Self {
                id,
                name: name.into(),
                hardware_batch_size: DEFAULT_HARDWARE_BATCH_SIZE,
                inputs: Vec::new(),
                outputs: Vec::new(),
                estimated_cycles: 0,
                instruction_bytes: 0,
            },
        }
    }

    /// Executable id
    pub const fn id(&self) -> ExecutableId {
        self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Batch the accelerator always executes natively
    pub const fn hardware_batch_size(&self) -> usize {
        self.hardware_batch_size
    }

    /// Declared input layers, in order
    pub fn inputs(&self) -> &[LayerInfo] {
        &self.inputs
    }

    /// Declared output layers, in order
    pub fn outputs(&self) -> &[LayerInfo] {
        &self.outputs
    }

    /// Input layer by name
    pub fn input_layer(&self, name: &str) -> Option<&LayerInfo> {
        self.inputs.iter().find(|l| l.name == name)
    }

    /// Output layer by name
    pub fn output_layer(&self, name: &str) -> Option<&LayerInfo> {
        self.outputs.iter().find(|l| l.name == name)
    }

    /// Estimated core cycles per hardware batch
    pub const fn estimated_cycles(&self) -> u64 {
        self.estimated_cycles
    }

    /// Size of the instruction stream
    pub const fn instruction_bytes(&self) -> usize {
        self.instruction_bytes
    }
}

/// Builder for [`Executable`]
#[derive(Debug)]
pub struct ExecutableBuilder {
    exe: Executable,
}

impl ExecutableBuilder {
    /// Native hardware batch size
    #[must_use]
    pub fn hardware_batch_size(mut self, size: usize) -> Self {
        self.exe.hardware_batch_size = size;
        self
    }

    /// Append an input layer
    #[must_use]
    pub fn input(mut self, layer: LayerInfo) -> Self {
        self.exe.inputs.push(layer);
        self
    }

    /// Append an output layer
    #[must_use]
    pub fn output(mut self, layer: LayerInfo) -> Self {
        self.exe.outputs.push(layer);
        self
    }

    /// Cycle estimate per hardware batch
    #[must_use]
    pub fn estimated_cycles(mut self, cycles: u64) -> Self {
        self.exe.estimated_cycles = cycles;
        self
    }

    /// Instruction stream size
    #[must_use]
    pub fn instruction_bytes(mut self, bytes: usize) -> Self {
        self.exe.instruction_bytes = bytes;
        self
    }

    /// Validate and finish
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero hardware batch size or duplicate layer
    /// names within inputs or within outputs.
    pub fn build(self) -> Result<Executable> {
        if self.exe.hardware_batch_size == 0 {
            return Err(TpuError::invalid_argument(format!(
                "{}: hardware batch size must be at least 1",
                self.exe.name
            )));
        }
        for (what, layers) in [("input", &self.exe.inputs), ("output", &self.exe.outputs)] {
            let mut seen = HashSet::new();
            for layer in layers {
                if !seen.insert(layer.name.as_str()) {
                    return Err(TpuError::invalid_argument(format!(
                        "{}: duplicate {what} layer '{}'",
                        self.exe.name, layer.name
                    )));
                }
            }
        }
        Ok(self.exe)
    }
}

/// Host buffer for one batch element of one layer
///
/// A no-op buffer has a size but no data; it pads the last hardware batch
/// of a request and is never read or written by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Option<Bytes>,
    size: usize,
}

impl Buffer {
    /// Buffer over shared bytes
    pub fn from_bytes(data: Bytes) -> Self {
        let size = data.len();
        Self {
            data: Some(data),
            size,
        }
    }

    /// Padding buffer
    pub const fn noop(size: usize) -> Self {
        Self { data: None, size }
    }

    /// Size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether this is padding
    pub const fn is_noop(&self) -> bool {
        self.data.is_none()
    }

    /// Host data, if any
    pub const fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Host address used for the transfer; zero for padding
    pub fn address(&self) -> u64 {
        self.data.as_ref().map_or(0, |d| d.as_ptr() as u64)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_accepts_actual_or_padded() {
        let layer = LayerInfo::new("image", 100);
        assert_eq!(layer.padded_size_bytes(), 128);
        assert!(layer.accepts(100));
        assert!(layer.accepts(128));
        assert!(!layer.accepts(101));
    }

    #[test]
    fn builder_rejects_zero_batch() {
        let err = Executable::builder(ExecutableId::new(1), "m")
            .hardware_batch_size(0)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn builder_rejects_duplicate_layers() {
        let err = Executable::builder(ExecutableId::new(1), "m")
            .input(LayerInfo::new("x", 4))
            .input(LayerInfo::new("x", 8))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn layer_lookup_by_name() {
        let exe = Executable::builder(ExecutableId::new(7), "m")
            .input(LayerInfo::new("a", 4))
            .output(LayerInfo::new("b", 8))
            .build()
            .unwrap();
        assert!(exe.input_layer("a").is_some());
        assert!(exe.input_layer("b").is_none());
        assert_eq!(exe.output_layer("b").unwrap().actual_size_bytes(), 8);
    }

    #[test]
    fn noop_buffer_has_no_address() {
        let pad = Buffer::noop(64);
        assert!(pad.is_noop());
        assert_eq!(pad.address(), 0);
        let real = Buffer::from(vec![1u8; 64]);
        assert!(!real.is_noop());
        assert_ne!(real.address(), 0);
    }
}
