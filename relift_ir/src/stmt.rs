//! IR statements of the RTL language
//!
//! Every statement carries a program-wide unique identity assigned by a
//! [`StatementIdAllocator`]. Statement equality and ordering are defined on
//! that identity; SSA subscripts refer to it.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use relift_common::Address;

use crate::exp::{Exp, ExpModifier};
use crate::location_set::LocationSet;
use crate::operator::Operator;
use crate::proc::FragmentId;
use crate::ty::Ty;

/// Unique statement identity. Monotonically increasing within a program,
/// never recycled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StatementId(pub u32);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for statement identities, owned by the program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementIdAllocator {
    next: u32,
}

impl StatementIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering at `first`, used by tests that want stable ids.
    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    pub fn alloc(&mut self) -> StatementId {
        let id = StatementId(self.next);
        self.next += 1;
        id
    }
}

/// Registers treated as callee-saved when the ABI is assumed.
pub const CALLEE_SAVED_REGS: [i64; 4] = [27, 29, 30, 31];

/// The condition kinds a branch or bool-assign can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchType {
    JE,
    JNE,
    JSL,
    JSLE,
    JSGE,
    JSG,
    JUL,
    JULE,
    JUGE,
    JUG,
    JMI,
    JPOS,
    JOF,
    JNOF,
    JPAR,
    JNPAR,
}

impl fmt::Display for BranchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BranchType::JE => "equals",
            BranchType::JNE => "not equals",
            BranchType::JSL => "signed less",
            BranchType::JSLE => "signed less or equals",
            BranchType::JSGE => "signed greater or equals",
            BranchType::JSG => "signed greater",
            BranchType::JUL => "unsigned less",
            BranchType::JULE => "unsigned less or equals",
            BranchType::JUGE => "unsigned greater or equals",
            BranchType::JUG => "unsigned greater",
            BranchType::JMI => "minus",
            BranchType::JPOS => "plus",
            BranchType::JOF => "overflow",
            BranchType::JNOF => "no overflow",
            BranchType::JPAR => "ev parity",
            BranchType::JNPAR => "odd parity",
        };
        write!(f, "{}", s)
    }
}

/// Switch analysis results attached to a computed jump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchInfo {
    pub switch_exp: Exp,
    pub lower: i64,
    pub upper: i64,
    pub table_addr: Address,
}

/// One incoming arm of a phi function: the defining statement reaching us
/// through a particular predecessor, together with the base expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhiCase {
    pub def: Option<StatementId>,
    pub base: Exp,
}

/// Reaching definitions collected at a call (or return), as pairs of base
/// location and its subscripted definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefCollector {
    defs: Vec<(Exp, Exp)>,
}

impl DefCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `base` is defined by `def_ref` here. An existing entry
    /// for the same base is replaced.
    pub fn collect_def(&mut self, base: Exp, def_ref: Exp) {
        if let Some(entry) = self.defs.iter_mut().find(|(l, _)| *l == base) {
            entry.1 = def_ref;
        } else {
            self.defs.push((base, def_ref));
        }
    }

    /// The reaching definition for `base`, if one was collected.
    pub fn find_def_for(&self, base: &Exp) -> Option<&Exp> {
        self.defs.iter().find(|(l, _)| l == base).map(|(_, r)| r)
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn clear(&mut self) {
        self.defs.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Exp, Exp)> {
        self.defs.iter()
    }
}

impl fmt::Display for DefCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.defs.is_empty() {
            return write!(f, "<None>");
        }
        for (i, (l, r)) in self.defs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", l, r)?;
        }
        Ok(())
    }
}

/// What the analysis knows about the callee of a call statement.
///
/// `return_stmt` is a non-owning reference into the callee and may go stale
/// when the callee is rebuilt; consumers must re-resolve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalleeInfo {
    pub name: String,
    /// Identities proven to hold over the call, e.g. `r28 = r28 + 4`.
    pub proven: Vec<(Exp, Exp)>,
    /// Locations the callee is known to modify.
    pub modifieds: Vec<Exp>,
    pub return_stmt: Option<StatementId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assign {
    pub id: StatementId,
    pub ty: Ty,
    pub lhs: Exp,
    pub rhs: Exp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhiAssign {
    pub id: StatementId,
    pub ty: Ty,
    pub lhs: Exp,
    pub cases: IndexMap<FragmentId, PhiCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplicitAssign {
    pub id: StatementId,
    pub ty: Ty,
    pub lhs: Exp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoolAssign {
    pub id: StatementId,
    pub lhs: Exp,
    pub cond_type: BranchType,
    pub cond: Exp,
    pub is_float: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GotoStatement {
    pub id: StatementId,
    pub dest: Exp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStatement {
    pub id: StatementId,
    pub dest: Exp,
    pub cond: Exp,
    pub cond_type: BranchType,
    pub is_float: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseStatement {
    pub id: StatementId,
    pub dest: Exp,
    pub switch_info: Option<SwitchInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatement {
    pub id: StatementId,
    pub dest: Exp,
    /// Arguments as (callee parameter slot, actual) pairs.
    pub arguments: Vec<(Exp, Exp)>,
    /// Caller-side locations modified by the call.
    pub defines: Vec<Exp>,
    /// Live locations at the call.
    pub use_collector: LocationSet,
    /// Reaching definitions into the call.
    pub def_collector: DefCollector,
    pub callee: Option<CalleeInfo>,
    /// True when the call is effectively followed by a return (tail call).
    pub return_after_call: bool,
}

impl CallStatement {
    /// A call whose callee has not been analyzed. Such a call is assumed to
    /// define every renameable variable.
    pub fn is_childless(&self) -> bool {
        self.callee.is_none()
    }

    /// Localise `e` to this call: replace each contained location with its
    /// reaching definition at the call.
    pub fn localise_exp(&self, e: &Exp) -> Exp {
        let mut out = e.clone();
        for (base, def_ref) in self.def_collector.iter() {
            let (next, _) = out.search_replace_all(base, def_ref);
            out = next;
        }
        out
    }

    /// The call bypass step: for a reference `base{this-call}`, produce the
    /// callee's proven identity for `base`, localized to the reaching
    /// definitions of this call. Returns `None` when `base` is not
    /// bypassable through this call.
    pub fn bypass_ref(&self, base: &Exp) -> Option<Exp> {
        let callee = self.callee.as_ref()?;
        let proven = callee
            .proven
            .iter()
            .find(|(lhs, _)| lhs == base)
            .map(|(_, rhs)| rhs)?;
        Some(self.localise_exp(proven).simplify())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnStatement {
    pub id: StatementId,
    /// Locations modified by the enclosing procedure.
    pub modifieds: Vec<Exp>,
    /// Returned values as (location, value) pairs.
    pub returns: Vec<(Exp, Exp)>,
    pub def_collector: DefCollector,
}

/// An IR statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Assign(Assign),
    Phi(PhiAssign),
    Implicit(ImplicitAssign),
    Bool(BoolAssign),
    Goto(GotoStatement),
    Branch(BranchStatement),
    Case(CaseStatement),
    Call(CallStatement),
    Return(ReturnStatement),
}

impl Statement {
    pub fn assign(id: StatementId, lhs: Exp, rhs: Exp) -> Statement {
        Statement::Assign(Assign { id, ty: Ty::default(), lhs, rhs })
    }

    pub fn assign_typed(id: StatementId, ty: Ty, lhs: Exp, rhs: Exp) -> Statement {
        Statement::Assign(Assign { id, ty, lhs, rhs })
    }

    pub fn phi(id: StatementId, lhs: Exp) -> Statement {
        Statement::Phi(PhiAssign { id, ty: Ty::default(), lhs, cases: IndexMap::new() })
    }

    pub fn implicit(id: StatementId, lhs: Exp) -> Statement {
        Statement::Implicit(ImplicitAssign { id, ty: Ty::default(), lhs })
    }

    pub fn id(&self) -> StatementId {
        match self {
            Statement::Assign(s) => s.id,
            Statement::Phi(s) => s.id,
            Statement::Implicit(s) => s.id,
            Statement::Bool(s) => s.id,
            Statement::Goto(s) => s.id,
            Statement::Branch(s) => s.id,
            Statement::Case(s) => s.id,
            Statement::Call(s) => s.id,
            Statement::Return(s) => s.id,
        }
    }

    pub fn set_id(&mut self, id: StatementId) {
        match self {
            Statement::Assign(s) => s.id = id,
            Statement::Phi(s) => s.id = id,
            Statement::Implicit(s) => s.id = id,
            Statement::Bool(s) => s.id = id,
            Statement::Goto(s) => s.id = id,
            Statement::Branch(s) => s.id = id,
            Statement::Case(s) => s.id = id,
            Statement::Call(s) => s.id = id,
            Statement::Return(s) => s.id = id,
        }
    }

    pub fn is_assign(&self) -> bool {
        matches!(self, Statement::Assign(_))
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Statement::Phi(_))
    }

    pub fn is_implicit(&self) -> bool {
        matches!(self, Statement::Implicit(_))
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Statement::Call(_))
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Statement::Return(_))
    }

    /// An assignment of a flag function to the flag soup.
    pub fn is_flag_assign(&self) -> bool {
        matches!(self, Statement::Assign(a) if a.rhs.is_flag_call())
    }

    /// The assigned location, for the assignment family.
    pub fn lhs(&self) -> Option<&Exp> {
        match self {
            Statement::Assign(s) => Some(&s.lhs),
            Statement::Phi(s) => Some(&s.lhs),
            Statement::Implicit(s) => Some(&s.lhs),
            Statement::Bool(s) => Some(&s.lhs),
            _ => None,
        }
    }

    /// The value side, where one exists: the rhs of an assign, the
    /// condition of a bool-assign.
    pub fn rhs(&self) -> Option<&Exp> {
        match self {
            Statement::Assign(s) => Some(&s.rhs),
            Statement::Bool(s) => Some(&s.cond),
            _ => None,
        }
    }

    /// A statement of the form `x := x` or `x := x{self}`. Null statements
    /// must not take part in propagation.
    pub fn is_null_statement(&self) -> bool {
        let Statement::Assign(a) = self else {
            return false;
        };
        match &a.rhs {
            Exp::Ref { def, .. } => *def == Some(a.id),
            rhs => a.lhs == *rhs,
        }
    }

    /// Collect the locations defined by this statement.
    pub fn get_definitions(&self, defs: &mut LocationSet, assume_abi: bool) {
        match self {
            Statement::Assign(s) => {
                defs.insert(s.lhs.clone());
            }
            Statement::Phi(s) => {
                defs.insert(s.lhs.clone());
            }
            Statement::Implicit(s) => {
                defs.insert(s.lhs.clone());
            }
            Statement::Bool(s) => {
                defs.insert(s.lhs.clone());
            }
            Statement::Call(s) => {
                for d in &s.defines {
                    if assume_abi {
                        if let Some(n) = d.reg_num() {
                            if CALLEE_SAVED_REGS.contains(&n) {
                                continue;
                            }
                        }
                    }
                    defs.insert(d.clone());
                }
            }
            Statement::Return(s) => {
                for m in &s.modifieds {
                    defs.insert(m.clone());
                }
            }
            Statement::Goto(_) | Statement::Branch(_) | Statement::Case(_) => {}
        }
    }

    pub fn defines_loc(&self, loc: &Exp) -> bool {
        let mut defs = LocationSet::new();
        self.get_definitions(&mut defs, false);
        defs.contains(loc)
    }

    /// Collect the locations used by this statement. With
    /// `with_collectors`, uses recorded in call collectors are included.
    /// With `mem_only`, only memory locations are collected.
    pub fn add_used_locs(&self, used: &mut LocationSet, with_collectors: bool, mem_only: bool) {
        let lhs_address_uses = |lhs: &Exp, used: &mut LocationSet| {
            // Assigning to m[x] uses x, but not m[x] itself.
            if let Exp::Loc(_, inner) = lhs {
                if lhs.is_mem_of() {
                    used.add_used_locs(inner, mem_only);
                }
            }
        };

        match self {
            Statement::Assign(s) => {
                used.add_used_locs(&s.rhs, mem_only);
                lhs_address_uses(&s.lhs, used);
            }
            Statement::Phi(s) => {
                for case in s.cases.values() {
                    let r = Exp::Ref { base: Box::new(case.base.clone()), def: case.def };
                    used.add_used_locs(&r, mem_only);
                }
                lhs_address_uses(&s.lhs, used);
            }
            Statement::Implicit(s) => {
                lhs_address_uses(&s.lhs, used);
            }
            Statement::Bool(s) => {
                used.add_used_locs(&s.cond, mem_only);
                lhs_address_uses(&s.lhs, used);
            }
            Statement::Goto(s) => {
                used.add_used_locs(&s.dest, mem_only);
            }
            Statement::Branch(s) => {
                used.add_used_locs(&s.dest, mem_only);
                used.add_used_locs(&s.cond, mem_only);
            }
            Statement::Case(s) => {
                used.add_used_locs(&s.dest, mem_only);
                if let Some(si) = &s.switch_info {
                    used.add_used_locs(&si.switch_exp, mem_only);
                }
            }
            Statement::Call(s) => {
                used.add_used_locs(&s.dest, mem_only);
                for (_, actual) in &s.arguments {
                    used.add_used_locs(actual, mem_only);
                }
                for d in &s.defines {
                    lhs_address_uses(d, used);
                }
                if with_collectors {
                    for (_, def_ref) in s.def_collector.iter() {
                        used.add_used_locs(def_ref, mem_only);
                    }
                }
            }
            Statement::Return(s) => {
                for (lhs, rhs) in &s.returns {
                    used.add_used_locs(rhs, mem_only);
                    lhs_address_uses(lhs, used);
                }
                if with_collectors {
                    for (_, def_ref) in s.def_collector.iter() {
                        used.add_used_locs(def_ref, mem_only);
                    }
                }
            }
        }
    }

    /// True if `pattern` occurs anywhere in this statement.
    pub fn search(&self, pattern: &Exp) -> bool {
        let mut found = false;
        self.for_each_exp(&mut |e| {
            found |= e.search(pattern).is_some();
        });
        found
    }

    fn for_each_exp(&self, f: &mut impl FnMut(&Exp)) {
        match self {
            Statement::Assign(s) => {
                f(&s.lhs);
                f(&s.rhs);
            }
            Statement::Phi(s) => {
                f(&s.lhs);
                for case in s.cases.values() {
                    f(&case.base);
                }
            }
            Statement::Implicit(s) => f(&s.lhs),
            Statement::Bool(s) => {
                f(&s.lhs);
                f(&s.cond);
            }
            Statement::Goto(s) => f(&s.dest),
            Statement::Branch(s) => {
                f(&s.dest);
                f(&s.cond);
            }
            Statement::Case(s) => {
                f(&s.dest);
                if let Some(si) = &s.switch_info {
                    f(&si.switch_exp);
                }
            }
            Statement::Call(s) => {
                f(&s.dest);
                for (slot, actual) in &s.arguments {
                    f(slot);
                    f(actual);
                }
                for d in &s.defines {
                    f(d);
                }
            }
            Statement::Return(s) => {
                for (lhs, rhs) in &s.returns {
                    f(lhs);
                    f(rhs);
                }
                for m in &s.modifieds {
                    f(m);
                }
            }
        }
    }

    /// Visit every expression of this statement mutably, including
    /// assignment targets, phi case bases and collectors.
    pub fn for_each_exp_mut(&mut self, f: &mut impl FnMut(&mut Exp)) {
        match self {
            Statement::Assign(s) => {
                f(&mut s.lhs);
                f(&mut s.rhs);
            }
            Statement::Phi(s) => {
                f(&mut s.lhs);
                for case in s.cases.values_mut() {
                    f(&mut case.base);
                }
            }
            Statement::Implicit(s) => f(&mut s.lhs),
            Statement::Bool(s) => {
                f(&mut s.lhs);
                f(&mut s.cond);
            }
            Statement::Goto(s) => f(&mut s.dest),
            Statement::Branch(s) => {
                f(&mut s.dest);
                f(&mut s.cond);
            }
            Statement::Case(s) => {
                f(&mut s.dest);
                if let Some(si) = &mut s.switch_info {
                    f(&mut si.switch_exp);
                }
            }
            Statement::Call(s) => {
                f(&mut s.dest);
                for (slot, actual) in &mut s.arguments {
                    f(slot);
                    f(actual);
                }
                for d in &mut s.defines {
                    f(d);
                }
                let mut defs: Vec<(Exp, Exp)> = s.def_collector.iter().cloned().collect();
                for (_, def_ref) in &mut defs {
                    f(def_ref);
                }
                s.def_collector.clear();
                for (base, def_ref) in defs {
                    s.def_collector.collect_def(base, def_ref);
                }
            }
            Statement::Return(s) => {
                for (lhs, rhs) in &mut s.returns {
                    f(lhs);
                    f(rhs);
                }
                for m in &mut s.modifieds {
                    f(m);
                }
                let mut defs: Vec<(Exp, Exp)> = s.def_collector.iter().cloned().collect();
                for (_, def_ref) in &mut defs {
                    f(def_ref);
                }
                s.def_collector.clear();
                for (base, def_ref) in defs {
                    s.def_collector.collect_def(base, def_ref);
                }
            }
        }
    }

    /// Rewrite every statement reference held by this statement (SSA
    /// subscripts, phi case definitions, callee return links) through `f`.
    /// References `f` maps to `None` are left unchanged.
    pub fn rewrite_refs(&mut self, f: &mut impl FnMut(StatementId) -> Option<StatementId>) {
        fn rewrite_exp(e: &mut Exp, f: &mut impl FnMut(StatementId) -> Option<StatementId>) {
            if let Exp::Ref { def: Some(d), .. } = e {
                if let Some(new) = f(*d) {
                    *d = new;
                }
            }
            // Walk children in place
            match e {
                Exp::Unary(_, a) | Exp::Loc(_, a) | Exp::Ref { base: a, .. } => rewrite_exp(a, f),
                Exp::Binary(_, a, b) => {
                    rewrite_exp(a, f);
                    rewrite_exp(b, f);
                }
                Exp::Ternary(_, a, b, c) => {
                    rewrite_exp(a, f);
                    rewrite_exp(b, f);
                    rewrite_exp(c, f);
                }
                Exp::Const(_) | Exp::Terminal(_) => {}
            }
        }

        self.for_each_exp_mut(&mut |e| rewrite_exp(e, f));

        match self {
            Statement::Phi(s) => {
                for case in s.cases.values_mut() {
                    if let Some(d) = case.def {
                        if let Some(new) = f(d) {
                            case.def = Some(new);
                        }
                    }
                }
            }
            Statement::Call(s) => {
                if let Some(callee) = &mut s.callee {
                    if let Some(d) = callee.return_stmt {
                        if let Some(new) = f(d) {
                            callee.return_stmt = Some(new);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Replace every occurrence of `pattern` in this statement. With
    /// `change_collectors`, call collectors are rewritten as well.
    pub fn search_and_replace(
        &mut self,
        pattern: &Exp,
        replacement: &Exp,
        change_collectors: bool,
    ) -> bool {
        let mut changed = false;
        let mut rep = |e: &mut Exp| {
            let (new, ch) = e.search_replace_all(pattern, replacement);
            *e = new;
            changed |= ch;
        };

        match self {
            Statement::Assign(s) => {
                rep(&mut s.lhs);
                rep(&mut s.rhs);
            }
            Statement::Phi(s) => {
                rep(&mut s.lhs);
                for case in s.cases.values_mut() {
                    rep(&mut case.base);
                }
            }
            Statement::Implicit(s) => rep(&mut s.lhs),
            Statement::Bool(s) => {
                rep(&mut s.lhs);
                rep(&mut s.cond);
            }
            Statement::Goto(s) => rep(&mut s.dest),
            Statement::Branch(s) => {
                rep(&mut s.dest);
                rep(&mut s.cond);
            }
            Statement::Case(s) => {
                rep(&mut s.dest);
                if let Some(si) = &mut s.switch_info {
                    rep(&mut si.switch_exp);
                }
            }
            Statement::Call(s) => {
                rep(&mut s.dest);
                for (_, actual) in &mut s.arguments {
                    rep(actual);
                }
                if change_collectors {
                    let mut defs: Vec<(Exp, Exp)> = s.def_collector.iter().cloned().collect();
                    for (_, def_ref) in &mut defs {
                        rep(def_ref);
                    }
                    s.def_collector.clear();
                    for (base, def_ref) in defs {
                        s.def_collector.collect_def(base, def_ref);
                    }
                }
            }
            Statement::Return(s) => {
                for (lhs, rhs) in &mut s.returns {
                    rep(lhs);
                    rep(rhs);
                }
            }
        }
        changed
    }

    /// Rebuild the used expressions of this statement through a modifier.
    ///
    /// Assignment targets are not rewritten, except that the address
    /// operand of a memory target is (assigning to `m[x]` uses `x`).
    pub fn modify_exps<M: ExpModifier + ?Sized>(&mut self, m: &mut M) {
        fn modify_mem_lhs<M: ExpModifier + ?Sized>(lhs: &mut Exp, m: &mut M) {
            if !lhs.is_mem_of() {
                return;
            }
            let old = std::mem::replace(lhs, Exp::nil());
            match old {
                Exp::Loc(kind, inner) => {
                    *lhs = Exp::Loc(kind, Box::new(inner.accept_modifier(m)));
                }
                other => *lhs = other,
            }
        }

        let take = |e: &mut Exp| std::mem::replace(e, Exp::nil());

        match self {
            Statement::Assign(s) => {
                let rhs = take(&mut s.rhs);
                s.rhs = rhs.accept_modifier(m);
                modify_mem_lhs(&mut s.lhs, m);
            }
            Statement::Phi(s) => {
                modify_mem_lhs(&mut s.lhs, m);
            }
            Statement::Implicit(s) => {
                modify_mem_lhs(&mut s.lhs, m);
            }
            Statement::Bool(s) => {
                let cond = take(&mut s.cond);
                s.cond = cond.accept_modifier(m);
                modify_mem_lhs(&mut s.lhs, m);
            }
            Statement::Goto(s) => {
                let dest = take(&mut s.dest);
                s.dest = dest.accept_modifier(m);
            }
            Statement::Branch(s) => {
                let dest = take(&mut s.dest);
                s.dest = dest.accept_modifier(m);
                let cond = take(&mut s.cond);
                s.cond = cond.accept_modifier(m);
            }
            Statement::Case(s) => {
                let dest = take(&mut s.dest);
                s.dest = dest.accept_modifier(m);
                if let Some(si) = &mut s.switch_info {
                    let e = take(&mut si.switch_exp);
                    si.switch_exp = e.accept_modifier(m);
                }
            }
            Statement::Call(s) => {
                let dest = take(&mut s.dest);
                s.dest = dest.accept_modifier(m);
                for (_, actual) in &mut s.arguments {
                    let e = take(actual);
                    *actual = e.accept_modifier(m);
                }
                for d in &mut s.defines {
                    modify_mem_lhs(d, m);
                }
            }
            Statement::Return(s) => {
                for (lhs, rhs) in &mut s.returns {
                    let e = take(rhs);
                    *rhs = e.accept_modifier(m);
                    modify_mem_lhs(lhs, m);
                }
            }
        }
    }

    /// Simplify every expression in this statement. Branch and bool-assign
    /// conditions on flag functions are lowered to relational form.
    pub fn simplify(&mut self) {
        let simp = |e: &mut Exp| {
            let old = std::mem::replace(e, Exp::nil());
            *e = old.simplify();
        };

        match self {
            Statement::Assign(s) => {
                simp(&mut s.lhs);
                simp(&mut s.rhs);
            }
            Statement::Phi(s) => {
                // A renamed phi must select between at least one case;
                // tolerated in release builds
                debug_assert!(
                    !s.cases.is_empty(),
                    "phi statement {} simplified with no cases",
                    s.id
                );
                simp(&mut s.lhs);
            }
            Statement::Implicit(s) => simp(&mut s.lhs),
            Statement::Bool(s) => {
                simp(&mut s.lhs);
                simp(&mut s.cond);
                if let Some(rel) = cond_to_relational(&s.cond, s.cond_type) {
                    s.cond = rel.simplify();
                }
            }
            Statement::Goto(s) => simp(&mut s.dest),
            Statement::Branch(s) => {
                simp(&mut s.dest);
                simp(&mut s.cond);
                if let Some(rel) = cond_to_relational(&s.cond, s.cond_type) {
                    s.cond = rel.simplify();
                }
            }
            Statement::Case(s) => {
                simp(&mut s.dest);
                if let Some(si) = &mut s.switch_info {
                    simp(&mut si.switch_exp);
                }
            }
            Statement::Call(s) => {
                simp(&mut s.dest);
                for (_, actual) in &mut s.arguments {
                    simp(actual);
                }
            }
            Statement::Return(s) => {
                for (_, rhs) in &mut s.returns {
                    simp(rhs);
                }
            }
        }
    }

    fn body(&self) -> String {
        match self {
            Statement::Assign(s) => {
                format!("*{}* {} := {}", s.ty.size_bits(), s.lhs, s.rhs)
            }
            Statement::Phi(s) => {
                let mut cases = String::new();
                for (i, case) in s.cases.values().enumerate() {
                    if i > 0 {
                        cases.push_str(", ");
                    }
                    match case.def {
                        Some(id) => cases.push_str(&id.to_string()),
                        None => cases.push('-'),
                    }
                }
                format!("*{}* {} := phi{{{}}}", s.ty.size_bits(), s.lhs, cases)
            }
            Statement::Implicit(s) => {
                format!("*{}* {} := -", s.ty.size_bits(), s.lhs)
            }
            Statement::Bool(s) => {
                let float = if s.is_float { ", float" } else { "" };
                format!(
                    "BOOL {} := CC({}){}\nHigh level: {}",
                    s.lhs, s.cond_type, float, s.cond
                )
            }
            Statement::Goto(s) => format!("GOTO {}", s.dest),
            Statement::Branch(s) => {
                let float = if s.is_float { " float" } else { "" };
                format!(
                    "BRANCH {}, condition {}{}\nHigh level: {}",
                    s.dest, s.cond_type, float, s.cond
                )
            }
            Statement::Case(s) => format!("CASE [{}]", s.dest),
            Statement::Call(s) => {
                let mut out = String::new();
                match &s.callee {
                    Some(callee) => out.push_str(&format!("CALL {}(\n", callee.name)),
                    None => out.push_str(&format!("CALL {}(\n", s.dest)),
                }
                for (slot, actual) in &s.arguments {
                    out.push_str(&format!("  {} := {}\n", slot, actual));
                }
                out.push_str(")\n");
                out.push_str(&format!("Reaching definitions: {}\n", s.def_collector));
                if s.use_collector.is_empty() {
                    out.push_str("Live variables: <None>");
                } else {
                    out.push_str(&format!("Live variables: {}", s.use_collector));
                }
                out
            }
            Statement::Return(s) => {
                let mut out = String::from("RET");
                for (i, (lhs, rhs)) in s.returns.iter().enumerate() {
                    if i == 0 {
                        out.push(' ');
                    } else {
                        out.push_str(", ");
                    }
                    out.push_str(&format!("{} := {}", lhs, rhs));
                }
                out.push('\n');
                if s.modifieds.is_empty() {
                    out.push_str("Modifieds: <None>\n");
                } else {
                    let mods: Vec<String> = s.modifieds.iter().map(|m| m.to_string()).collect();
                    out.push_str(&format!("Modifieds: {}\n", mods.join(", ")));
                }
                out.push_str(&format!("Reaching definitions: {}", s.def_collector));
                out
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4} {}", self.id().0, self.body())
    }
}

/// Lower a flag-function condition to relational form under the given
/// branch type. Returns `None` for shapes the table does not cover.
pub fn cond_to_relational(cond: &Exp, bt: BranchType) -> Option<Exp> {
    let name = cond.flag_call_name()?;
    let args = cond.flag_call_args()?;

    // Longest prefix first: SUBFLAGSFL is also a SUBFLAGS prefix
    if name.starts_with("SUBFLAGSFL") {
        if args.len() < 2 {
            return None;
        }
        let (p1, p2) = (args[0].clone(), args[1].clone());
        // Float compares set ZF on equality and CF on P1 < P2, so the
        // unsigned branch types test a signed relation here
        let rel = match bt {
            BranchType::JE => Exp::binary(Operator::Equals, p1, p2),
            BranchType::JNE => Exp::binary(Operator::NotEquals, p1, p2),
            BranchType::JSL | BranchType::JUL => Exp::binary(Operator::Less, p1, p2),
            BranchType::JSLE | BranchType::JULE => Exp::binary(Operator::LessEq, p1, p2),
            BranchType::JSGE | BranchType::JUGE => Exp::binary(Operator::GreaterEq, p1, p2),
            BranchType::JSG | BranchType::JUG => Exp::binary(Operator::Greater, p1, p2),
            _ => return None,
        };
        return Some(rel);
    }

    if name.starts_with("SUBFLAGS") {
        if args.len() < 3 {
            return None;
        }
        let (p1, p2, p3) = (args[0].clone(), args[1].clone(), args[2].clone());
        let rel = match bt {
            BranchType::JE => Exp::binary(Operator::Equals, p1, p2),
            BranchType::JNE => Exp::binary(Operator::NotEquals, p1, p2),
            BranchType::JSL => Exp::binary(Operator::Less, p1, p2),
            BranchType::JSLE => Exp::binary(Operator::LessEq, p1, p2),
            BranchType::JSGE => Exp::binary(Operator::GreaterEq, p1, p2),
            BranchType::JSG => Exp::binary(Operator::Greater, p1, p2),
            BranchType::JUL => Exp::binary(Operator::LessUns, p1, p2),
            BranchType::JULE => Exp::binary(Operator::LessEqUns, p1, p2),
            BranchType::JUGE => Exp::binary(Operator::GreaterEqUns, p1, p2),
            BranchType::JUG => Exp::binary(Operator::GreaterUns, p1, p2),
            BranchType::JMI => Exp::binary(Operator::Less, p3, Exp::int(0)),
            BranchType::JPOS => Exp::binary(Operator::GreaterEq, p3, Exp::int(0)),
            _ => return None,
        };
        return Some(rel);
    }

    if name.starts_with("LOGICALFLAGS") || name.starts_with("INCDECFLAGS") {
        if args.is_empty() {
            return None;
        }
        let p1 = args[0].clone();
        let rel = match bt {
            BranchType::JE => Exp::binary(Operator::Equals, p1, Exp::int(0)),
            BranchType::JNE => Exp::binary(Operator::NotEquals, p1, Exp::int(0)),
            BranchType::JMI => Exp::binary(Operator::Less, p1, Exp::int(0)),
            BranchType::JPOS => Exp::binary(Operator::GreaterEq, p1, Exp::int(0)),
            // The overflow flag is identically zero for both families
            BranchType::JOF => Exp::int(0),
            BranchType::JNOF => Exp::int(1),
            _ => return None,
        };
        return Some(rel);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exp::Terminal;
    use pretty_assertions::assert_eq;

    fn ids() -> StatementIdAllocator {
        StatementIdAllocator::new()
    }

    #[test]
    fn test_statement_ids_are_monotonic() {
        let mut alloc = ids();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert!(a < b);
        assert_eq!(a, StatementId(0));
        assert_eq!(b, StatementId(1));
    }

    #[test]
    fn test_is_null_statement() {
        let mut alloc = StatementIdAllocator::starting_at(5);
        let eax = Exp::reg(24);
        let ecx = Exp::reg(25);

        // %eax := - is not null
        let imp = Statement::implicit(alloc.alloc(), eax.clone());
        assert!(!imp.is_null_statement());

        // %eax := %ecx is not null
        let asgn = Statement::assign(alloc.alloc(), eax.clone(), ecx.clone());
        assert!(!asgn.is_null_statement());

        // %eax := %eax is null
        let asgn = Statement::assign(alloc.alloc(), eax.clone(), eax.clone());
        assert!(asgn.is_null_statement());

        // n: %eax := %eax{n} is null
        let id = alloc.alloc();
        let asgn = Statement::assign(id, eax.clone(), Exp::ref_to(eax.clone(), id));
        assert!(asgn.is_null_statement());

        // n: %eax := %ecx{n} is null (self-reference, whatever the base)
        let id = alloc.alloc();
        let asgn = Statement::assign(id, eax.clone(), Exp::ref_to(ecx.clone(), id));
        assert!(asgn.is_null_statement());

        // n: %eax := %ecx{m} with m != n is not null
        let id = alloc.alloc();
        let asgn = Statement::assign(id, eax, Exp::ref_to(ecx, StatementId(1)));
        assert!(!asgn.is_null_statement());
    }

    #[test]
    fn test_is_flag_assign() {
        let mut alloc = ids();
        let fc = Statement::assign(
            alloc.alloc(),
            Exp::terminal(Terminal::Flags),
            Exp::flag_call("addFlags", vec![Exp::reg(26), Exp::int(99)]),
        );
        let plain = Statement::assign(
            alloc.alloc(),
            Exp::reg(25),
            Exp::binary(Operator::Plus, Exp::reg(26), Exp::int(4)),
        );
        assert!(fc.is_flag_assign());
        assert!(!plain.is_flag_assign());
    }

    #[test]
    fn test_used_locs_assign() {
        // m[r28 - 4] := m[r28 - 8] * r26
        let mut alloc = ids();
        let a = Statement::assign(
            alloc.alloc(),
            Exp::mem(Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(4))),
            Exp::binary(
                Operator::Mult,
                Exp::mem(Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(8))),
                Exp::reg(26),
            ),
        );
        let mut used = LocationSet::new();
        a.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "r26, r28, m[r28 - 8]");
    }

    #[test]
    fn test_used_locs_goto() {
        let mut alloc = ids();
        let g = Statement::Goto(GotoStatement {
            id: alloc.alloc(),
            dest: Exp::mem(Exp::reg(26)),
        });
        let mut used = LocationSet::new();
        g.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "r26, m[r26]");
    }

    #[test]
    fn test_used_locs_branch() {
        // branch to m[r26{99}]{55} on %flags
        let b = Statement::Branch(BranchStatement {
            id: StatementId(99),
            dest: Exp::ref_to(
                Exp::mem(Exp::ref_to(Exp::reg(26), StatementId(99))),
                StatementId(55),
            ),
            cond: Exp::terminal(Terminal::Flags),
            cond_type: BranchType::JE,
            is_float: false,
        });
        let mut used = LocationSet::new();
        b.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "r26{99}, m[r26{99}]{55}, %flags");
    }

    #[test]
    fn test_used_locs_case() {
        let c = Statement::Case(CaseStatement {
            id: StatementId(0),
            dest: Exp::mem(Exp::reg(26)),
            switch_info: Some(SwitchInfo {
                switch_exp: Exp::mem(Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(12))),
                lower: 0,
                upper: 4,
                table_addr: Address(0x2000),
            }),
        });
        let mut used = LocationSet::new();
        c.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "r26, r28, m[r28 - 12], m[r26]");
    }

    #[test]
    fn test_used_locs_call() {
        // call m[r26] with args m[r27] and r28{55}, defines r31 and r24
        let ca = Statement::Call(CallStatement {
            id: StatementId(0),
            dest: Exp::mem(Exp::reg(26)),
            arguments: vec![
                (Exp::reg(8), Exp::mem(Exp::reg(27))),
                (Exp::reg(9), Exp::ref_to(Exp::reg(28), StatementId(55))),
            ],
            defines: vec![Exp::reg(31), Exp::reg(24)],
            use_collector: LocationSet::new(),
            def_collector: DefCollector::new(),
            callee: None,
            return_after_call: false,
        });
        let mut used = LocationSet::new();
        ca.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "r26, r27, m[r26], m[r27], r28{55}");
    }

    #[test]
    fn test_used_locs_return() {
        let r = Statement::Return(ReturnStatement {
            id: StatementId(0),
            modifieds: vec![],
            returns: vec![
                (Exp::reg(31), Exp::int(100)),
                (Exp::mem(Exp::reg(24)), Exp::int(0)),
                (
                    Exp::mem(Exp::binary(
                        Operator::Plus,
                        Exp::ref_to(Exp::reg(25), StatementId(55)),
                        Exp::ref_to(Exp::reg(26), StatementId(99)),
                    )),
                    Exp::int(5),
                ),
            ],
            def_collector: DefCollector::new(),
        });
        let mut used = LocationSet::new();
        r.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "r24, r25{55}, r26{99}");
    }

    #[test]
    fn test_used_locs_bool_assign() {
        // BOOL m[r26] := CC(equals) on m[r24] = r25
        let bs = Statement::Bool(BoolAssign {
            id: StatementId(0),
            lhs: Exp::mem(Exp::reg(26)),
            cond_type: BranchType::JE,
            cond: Exp::binary(Operator::Equals, Exp::mem(Exp::reg(24)), Exp::reg(25)),
            is_float: false,
        });
        let mut used = LocationSet::new();
        bs.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "r24, r25, r26, m[r24]");
    }

    #[test]
    fn test_used_locs_implicit_assign() {
        // m[r28{-} - 4] := -
        let ia = Statement::implicit(
            StatementId(0),
            Exp::mem(Exp::binary(
                Operator::Minus,
                Exp::implicit_ref(Exp::reg(28)),
                Exp::int(4),
            )),
        );
        let mut used = LocationSet::new();
        ia.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "r28{-}");
    }

    #[test]
    fn test_used_locs_phi() {
        // m[local21 + 16] := phi with one case defined at 372
        let base = Exp::mem(Exp::binary(Operator::Plus, Exp::local("local21"), Exp::int(16)));
        let mut phi = PhiAssign {
            id: StatementId(0),
            ty: Ty::default(),
            lhs: base.clone(),
            cases: IndexMap::new(),
        };
        phi.cases.insert(
            FragmentId(0),
            PhiCase { def: Some(StatementId(372)), base: base.clone() },
        );
        let s = Statement::Phi(phi);
        let mut used = LocationSet::new();
        s.add_used_locs(&mut used, false, false);
        assert_eq!(used.to_string(), "local21, m[local21 + 16]{372}");
    }

    #[test]
    fn test_definitions() {
        let mut alloc = ids();
        let a = Statement::assign(alloc.alloc(), Exp::reg(24), Exp::reg(25));
        let mut defs = LocationSet::new();
        a.get_definitions(&mut defs, false);
        assert_eq!(defs.to_string(), "r24");
        assert!(a.defines_loc(&Exp::reg(24)));
        assert!(!a.defines_loc(&Exp::reg(25)));
    }

    #[test]
    fn test_call_definitions_respect_abi() {
        let call = Statement::Call(CallStatement {
            id: StatementId(0),
            dest: Exp::int(0x1000),
            arguments: vec![],
            defines: vec![Exp::reg(24), Exp::reg(27)],
            use_collector: LocationSet::new(),
            def_collector: DefCollector::new(),
            callee: None,
            return_after_call: false,
        });

        let mut defs = LocationSet::new();
        call.get_definitions(&mut defs, false);
        assert_eq!(defs.to_string(), "r24, r27");

        // r27 is callee-saved, assumed preserved under the ABI
        let mut defs = LocationSet::new();
        call.get_definitions(&mut defs, true);
        assert_eq!(defs.to_string(), "r24");
    }

    #[test]
    fn test_print_assign() {
        let s = Statement::assign(
            StatementId(19),
            Exp::reg(28),
            Exp::binary(
                Operator::Plus,
                Exp::ref_to(Exp::reg(28), StatementId(17)),
                Exp::int(16),
            ),
        );
        assert_eq!(s.to_string(), "  19 *32* r28 := r28{17} + 16");
    }

    #[test]
    fn test_print_implicit() {
        let s = Statement::implicit(StatementId(0), Exp::reg(24));
        assert_eq!(s.to_string(), "   0 *32* r24 := -");
    }

    #[test]
    fn test_search_and_replace() {
        let mut s = Statement::assign(
            StatementId(40),
            Exp::mem(Exp::ref_to(Exp::reg(24), StatementId(10))),
            Exp::ref_to(Exp::reg(25), StatementId(20)),
        );
        let changed = s.search_and_replace(
            &Exp::ref_to(Exp::reg(24), StatementId(10)),
            &Exp::int(0x1000),
            true,
        );
        assert!(changed);
        assert_eq!(s.to_string(), "  40 *32* m[0x1000] := r25{20}");
    }

    #[test]
    fn test_cond_to_relational() {
        let sub = Exp::flag_call("SUBFLAGS", vec![Exp::reg(24), Exp::reg(25), Exp::reg(26)]);
        assert_eq!(
            cond_to_relational(&sub, BranchType::JE).unwrap().to_string(),
            "r24 = r25"
        );
        assert_eq!(
            cond_to_relational(&sub, BranchType::JUL).unwrap().to_string(),
            "r24 <u r25"
        );
        assert_eq!(
            cond_to_relational(&sub, BranchType::JMI).unwrap().to_string(),
            "r26 < 0"
        );

        let log = Exp::flag_call("LOGICALFLAGS8", vec![Exp::reg(24)]);
        assert_eq!(
            cond_to_relational(&log, BranchType::JNE).unwrap().to_string(),
            "r24 ~= 0"
        );

        // not a flag call
        assert!(cond_to_relational(&Exp::reg(24), BranchType::JE).is_none());
    }

    #[test]
    fn test_cond_to_relational_subflagsfl() {
        let sub = Exp::flag_call("SUBFLAGSFLD", vec![Exp::reg(32), Exp::reg(33)]);
        assert_eq!(
            cond_to_relational(&sub, BranchType::JE).unwrap().to_string(),
            "r32 = r33"
        );
        // Float compares put their result in CF/ZF, so the unsigned
        // branch lowers to a signed relation
        assert_eq!(
            cond_to_relational(&sub, BranchType::JUL).unwrap().to_string(),
            "r32 < r33"
        );
        assert_eq!(
            cond_to_relational(&sub, BranchType::JSGE).unwrap().to_string(),
            "r32 >= r33"
        );
        assert!(cond_to_relational(&sub, BranchType::JPAR).is_none());
    }

    #[test]
    fn test_cond_to_relational_incdecflags() {
        let inc = Exp::flag_call("INCDECFLAGS32", vec![Exp::reg(24)]);
        assert_eq!(
            cond_to_relational(&inc, BranchType::JE).unwrap().to_string(),
            "r24 = 0"
        );
        assert_eq!(
            cond_to_relational(&inc, BranchType::JMI).unwrap().to_string(),
            "r24 < 0"
        );
        // Increment and decrement never overflow in this model
        assert_eq!(
            cond_to_relational(&inc, BranchType::JOF).unwrap().to_string(),
            "0"
        );
        assert_eq!(
            cond_to_relational(&inc, BranchType::JNOF).unwrap().to_string(),
            "1"
        );
        assert!(cond_to_relational(&inc, BranchType::JUL).is_none());
    }

    #[test]
    fn test_bypass_ref() {
        // call 17 proven to set r28 := r28 + 4, with r28 reaching as r28{15}
        let mut def_collector = DefCollector::new();
        def_collector.collect_def(Exp::reg(28), Exp::ref_to(Exp::reg(28), StatementId(15)));

        let call = CallStatement {
            id: StatementId(17),
            dest: Exp::int(0x2000),
            arguments: vec![],
            defines: vec![Exp::reg(28)],
            use_collector: LocationSet::new(),
            def_collector,
            callee: Some(CalleeInfo {
                name: "foo".into(),
                proven: vec![(
                    Exp::reg(28),
                    Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)),
                )],
                modifieds: vec![Exp::reg(28)],
                return_stmt: None,
            }),
            return_after_call: false,
        };

        let bypassed = call.bypass_ref(&Exp::reg(28)).unwrap();
        assert_eq!(bypassed.to_string(), "r28{15} + 4");

        // r29 has no proven identity through this call
        assert!(call.bypass_ref(&Exp::reg(29)).is_none());
    }
}
