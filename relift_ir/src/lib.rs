//! Intermediate representation for the relift decompiler
//!
//! This crate provides the IR the decompiler core operates on: a symbolic
//! expression algebra over CPU-level operands, the statement variants of
//! the RTL language, and the per-procedure containers (RTLs, fragments,
//! procedures) that the SSA and propagation passes transform.

pub mod exp;
pub mod location_set;
pub mod operator;
pub mod proc;
pub mod rtl;
pub mod simplify;
pub mod stmt;
pub mod ty;

pub use exp::{Const, Exp, ExpModifier, ExpVisitor, LocKind, Terminal};
pub use location_set::LocationSet;
pub use operator::Operator;
pub use proc::{
    is_stack_local_pattern, FlowKind, Fragment, FragmentId, ProcCfg, Procedure, Program,
};
pub use rtl::Rtl;
pub use stmt::{
    Assign, BoolAssign, BranchStatement, BranchType, CallStatement, CalleeInfo, CaseStatement,
    DefCollector, GotoStatement, ImplicitAssign, PhiAssign, PhiCase, ReturnStatement, Statement,
    StatementId, StatementIdAllocator, SwitchInfo,
};
pub use ty::{NullTypeOracle, Ty, TypeOracle};
