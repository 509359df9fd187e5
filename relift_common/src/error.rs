//! Error handling utilities for the relift decompiler

use thiserror::Error;

use crate::address::Address;

/// The main error type for the relift decompiler core.
#[derive(Error, Debug, Clone)]
pub enum ReliftError {
    #[error("Decode error at {addr}: {message}")]
    Decode { addr: Address, message: String },

    #[error("No RTL template named '{template}' (instruction at {addr})")]
    MissingTemplate { addr: Address, template: String },

    #[error("CFG integrity error in '{proc}': {message}")]
    CfgIntegrity { proc: String, message: String },

    #[error("Dataflow error in '{proc}': {message}")]
    Dataflow { proc: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for relift operations.
pub type ReliftResult<T> = Result<T, ReliftError>;

impl ReliftError {
    pub fn decode(addr: Address, message: impl Into<String>) -> Self {
        Self::Decode { addr, message: message.into() }
    }

    pub fn missing_template(addr: Address, template: impl Into<String>) -> Self {
        Self::MissingTemplate { addr, template: template.into() }
    }

    pub fn cfg_integrity(proc: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CfgIntegrity { proc: proc.into(), message: message.into() }
    }

    pub fn dataflow(proc: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dataflow { proc: proc.into(), message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}
