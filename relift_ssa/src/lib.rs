//! SSA construction and propagation for the relift decompiler
//!
//! Builds on the IR crate: Lengauer-Tarjan dominators and dominance
//! frontiers, phi placement over the iterated frontier, SSA renaming, copy
//! propagation with flag-call lowering, call bypassing, and the
//! fixed-order pass pipeline tying them together.

pub mod bypass;
pub mod dataflow;
pub mod passes;
pub mod propagate;
pub mod rename;

pub use bypass::{bypass_stmt, CallBypasser, BYPASS_REWRITE_LIMIT};
pub use dataflow::{can_rename_exp, DataFlow, INDEX_INVALID};
pub use passes::{
    count_ref_uses, decompile_proc, decompile_program, remove_null_statements,
    update_call_defines, DECOMPILE_PASS_LIMIT,
};
pub use propagate::{
    can_propagate_to_exp, propagate_flags_to_stmt, propagate_to_stmt, Def, Definitions,
    FlagFunc, PROPAGATION_PASS_LIMIT,
};
pub use rename::{rename_block_vars, strip_refs, BlockVarRenamer};
