//! Frontend of the relift decompiler
//!
//! This crate hosts what sits between a machine-code decoder and the IR:
//! the decoder and RTL-dictionary facades, the incrementally discovered
//! low-level CFG, the entry-driven discovery loop, and the derivation of
//! per-procedure fragments.

pub mod block;
pub mod cfg;
pub mod decoder;
pub mod discover;
pub mod lift;

pub use block::BasicBlock;
pub use cfg::LowLevelCfg;
pub use decoder::{
    canonical_template_name, DecodeError, DecodeResult, InstructionDecoder, LiftedInstruction,
    MachineInstruction, RtlDictionary,
};
pub use discover::{BlockDiscoverer, Discovery};
pub use lift::derive_proc;
