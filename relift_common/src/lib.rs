//! Shared utilities and error types for the relift decompiler
//!
//! This crate provides common functionality used across all decompiler
//! components:
//! - Machine address handling
//! - Error types and result aliases
//! - Analysis settings

pub mod address;
pub mod error;
pub mod settings;

pub use address::*;
pub use error::*;
pub use settings::*;
