//! Analysis settings consumed by the decompiler core

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Settings shared by the frontend and analysis passes.
///
/// These mirror the options an embedding driver would expose. The core never
/// reads them from a file itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Override path of the SSL specification file, if any.
    pub ssl_file_name: Option<PathBuf>,

    /// Directory the driver was started from.
    pub working_directory: PathBuf,

    /// Directory holding architecture data files.
    pub data_directory: PathBuf,

    /// Emit per-instruction decoder diagnostics.
    pub debug_decoder: bool,

    /// Assume calls respect the platform ABI. When set, callee-saved
    /// registers are not treated as modified by calls.
    pub assume_abi: bool,

    /// Registers treated as callee-saved when `assume_abi` is set.
    pub callee_saved_regs: Vec<i64>,

    /// Maximum expression depth copy propagation will push into a use
    /// site that has several other uses.
    pub prop_max_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssl_file_name: None,
            working_directory: PathBuf::from("."),
            data_directory: PathBuf::from("."),
            debug_decoder: false,
            assume_abi: false,
            callee_saved_regs: vec![27, 29, 30, 31],
            prop_max_depth: 3,
        }
    }
}
