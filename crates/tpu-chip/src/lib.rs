//! Silicon model for the TPU DMA descriptor queue.
//!
//! This crate has **no dependencies** and **no hardware access**: it is a
//! pure model of the parts of the silicon the scheduling core cares about,
//! namely the queue CSR map and the descriptor tag encoding.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | DMA queue, interrupt and hardware watchdog CSR offsets |
//! | [`descriptor`] | Descriptor tag encoding, scalar-core interrupt count, alignment |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod descriptor;
pub mod regs;
