//! Queue backends
//!
//! Only the software engine lives here; a platform backend implements the
//! same loop over its own [`Registers`](crate::Registers) and interrupt source.

pub mod software;

pub use software::{EngineConfig, EngineStats, SoftwareDmaEngine, StepOutcome};
