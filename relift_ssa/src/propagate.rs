//! Copy propagation and flag lowering
//!
//! Propagation resolves SSA references through a [`Definitions`] snapshot
//! built from the procedure before each pass, so statements can be
//! rewritten without live pointers into the rest of the IR. Flag-call
//! definitions of `%flags` are lowered into explicit comparisons when a
//! bare flag like `%CF` is used.

use std::collections::HashMap;

use indexmap::IndexMap;

use relift_ir::{Exp, Operator, Procedure, Statement, StatementId, Terminal, Ty};

/// Iteration cap for the statement-local rewrite loops.
pub const PROPAGATION_PASS_LIMIT: usize = 10;

/// What a statement reference can resolve to.
#[derive(Debug, Clone)]
pub enum Def {
    Assign { lhs: Exp, rhs: Exp, ty: Ty },
    Phi { lhs: Exp },
    Implicit { lhs: Exp },
    Bool { lhs: Exp, cond: Exp },
    Call { proven: Vec<(Exp, Exp)>, reaching: Vec<(Exp, Exp)> },
    Other,
}

impl Def {
    /// The call bypass step: the callee's proven identity for `base`,
    /// localized to the definitions reaching the call.
    pub fn bypass_ref(&self, base: &Exp) -> Option<Exp> {
        let Def::Call { proven, reaching } = self else {
            return None;
        };
        let rhs = proven.iter().find(|(l, _)| l == base).map(|(_, r)| r)?;
        let mut out = rhs.clone();
        for (l, def_ref) in reaching {
            let (next, _) = out.search_replace_all(l, def_ref);
            out = next;
        }
        Some(out.simplify())
    }
}

/// A snapshot of the definitions a pass may resolve references through.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    map: IndexMap<StatementId, Def>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot every definition in the procedure.
    pub fn collect(proc: &Procedure) -> Self {
        let mut defs = Self::new();
        for stmt in proc.statements() {
            defs.insert_statement(stmt);
        }
        defs
    }

    /// Record one statement's definition view. Useful for tests that build
    /// statements without a full procedure.
    pub fn insert_statement(&mut self, stmt: &Statement) {
        let def = match stmt {
            Statement::Assign(a) => Def::Assign {
                lhs: a.lhs.clone(),
                rhs: a.rhs.clone(),
                ty: a.ty.clone(),
            },
            Statement::Phi(p) => Def::Phi { lhs: p.lhs.clone() },
            Statement::Implicit(i) => Def::Implicit { lhs: i.lhs.clone() },
            Statement::Bool(b) => Def::Bool { lhs: b.lhs.clone(), cond: b.cond.clone() },
            Statement::Call(c) => Def::Call {
                proven: c
                    .callee
                    .as_ref()
                    .map(|callee| callee.proven.clone())
                    .unwrap_or_default(),
                reaching: c.def_collector.iter().cloned().collect(),
            },
            _ => Def::Other,
        };
        self.map.insert(stmt.id(), def);
    }

    pub fn get(&self, id: StatementId) -> Option<&Def> {
        self.map.get(&id)
    }

    /// True when the definition is `x := x` or `x := x{self}`.
    fn is_null_def(&self, id: StatementId) -> bool {
        match self.map.get(&id) {
            Some(Def::Assign { lhs, rhs, .. }) => match rhs {
                Exp::Ref { def, .. } => *def == Some(id),
                other => other == lhs,
            },
            _ => false,
        }
    }
}

/// True iff propagating through `e` is legal: `e` must be a reference to
/// an ordinary, non-null assignment whose right hand side is not of array
/// type. Implicit definitions, phis and calls never propagate this way.
pub fn can_propagate_to_exp(e: &Exp, defs: &Definitions) -> bool {
    let Exp::Ref { def: Some(id), .. } = e else {
        return false;
    };

    if defs.is_null_def(*id) {
        // A null statement would propagate forever without effect
        return false;
    }

    match defs.get(*id) {
        Some(Def::Assign { ty, .. }) => !ty.is_array(),
        _ => false,
    }
}

/// The flag functions understood by the lowering table. The raw name is
/// kept only for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagFunc {
    SubFlagsFl,
    SubFlags,
    LogicalFlags,
    IncDecFlags,
}

impl FlagFunc {
    pub fn parse(name: &str) -> Option<FlagFunc> {
        // Longest prefix first: SUBFLAGSFL is also a SUBFLAGS prefix
        if name.starts_with("SUBFLAGSFL") {
            Some(FlagFunc::SubFlagsFl)
        } else if name.starts_with("SUBFLAGS") {
            Some(FlagFunc::SubFlags)
        } else if name.starts_with("LOGICALFLAGS") {
            Some(FlagFunc::LogicalFlags)
        } else if name.starts_with("INCDECFLAGS") {
            Some(FlagFunc::IncDecFlags)
        } else {
            None
        }
    }
}

/// The lowering of one (flag function, flag) pair, in terms of the flag
/// call's positional arguments. `None` means the pair is not supported and
/// propagation must be skipped.
fn lower_flag(func: FlagFunc, flag: Terminal, args: &[&Exp]) -> Option<Exp> {
    let arg = |i: usize| -> Option<Exp> { args.get(i).map(|e| (*e).clone()) };
    let zero = Exp::int(0);

    match (func, flag) {
        (FlagFunc::SubFlagsFl, Terminal::CF) => {
            Some(Exp::binary(Operator::Less, arg(0)?, arg(1)?))
        }
        (FlagFunc::SubFlagsFl, Terminal::ZF) => {
            Some(Exp::binary(Operator::Equals, arg(0)?, arg(1)?))
        }
        (FlagFunc::SubFlags, Terminal::CF) => {
            Some(Exp::binary(Operator::LessUns, arg(0)?, arg(1)?))
        }
        (FlagFunc::SubFlags, Terminal::ZF) => {
            Some(Exp::binary(Operator::Equals, arg(2)?, zero))
        }
        (FlagFunc::SubFlags, Terminal::NF) => {
            Some(Exp::binary(Operator::Less, arg(2)?, zero))
        }
        (FlagFunc::SubFlags, Terminal::OF) => {
            // (op1 < 0 and op2 >= 0 and result >= 0) or
            // (op1 >= 0 and op2 < 0 and result < 0)
            let (p1, p2, p3) = (arg(0)?, arg(1)?, arg(2)?);
            let neg = |e: Exp| Exp::binary(Operator::Less, e, Exp::int(0));
            let pos = |e: Exp| Exp::binary(Operator::GreaterEq, e, Exp::int(0));
            Some(Exp::binary(
                Operator::Or,
                Exp::binary(
                    Operator::And,
                    Exp::binary(Operator::And, neg(p1.clone()), pos(p2.clone())),
                    pos(p3.clone()),
                ),
                Exp::binary(
                    Operator::And,
                    Exp::binary(Operator::And, pos(p1), neg(p2)),
                    neg(p3),
                ),
            ))
        }
        (FlagFunc::LogicalFlags, Terminal::NF) => {
            Some(Exp::binary(Operator::Less, arg(0)?, zero))
        }
        (FlagFunc::LogicalFlags, Terminal::ZF) => {
            Some(Exp::binary(Operator::Equals, arg(0)?, zero))
        }
        (FlagFunc::LogicalFlags, Terminal::CF) => Some(zero),
        (FlagFunc::LogicalFlags, Terminal::OF) => Some(zero),
        (FlagFunc::IncDecFlags, Terminal::OF) => Some(zero),
        (FlagFunc::IncDecFlags, Terminal::ZF) => {
            Some(Exp::binary(Operator::Equals, arg(0)?, zero))
        }
        (FlagFunc::IncDecFlags, Terminal::NF) => {
            Some(Exp::binary(Operator::Less, arg(0)?, zero))
        }
        _ => None,
    }
}

/// Replace the use `e` (a reference) in `stmt` with the definition's right
/// hand side, applying the flag-call semantics when the definition targets
/// the flag soup.
fn replace_ref(stmt: &mut Statement, e: &Exp, def_id: StatementId, lhs: &Exp, rhs: &Exp) -> bool {
    if lhs.is_flags() {
        // e.g. %flags := 0 propagates the constant directly
        if rhs.is_int_const() && lhs != rhs {
            return stmt.search_and_replace(e, rhs, true);
        }
        if !rhs.is_flag_call() {
            return false;
        }

        // When a main flag is used bare and was defined through a flag
        // function, apply the semantics of that function for the flag
        if let Some(Exp::Terminal(flag)) = e.ref_base() {
            if flag.is_main_flag() {
                let name = rhs.flag_call_name().unwrap_or("");
                let Some(func) = FlagFunc::parse(name) else {
                    log::debug!("unknown flag function '{}', skipping propagation", name);
                    return false;
                };
                let args = rhs.flag_call_args().unwrap_or_default();
                let Some(replacement) = lower_flag(func, *flag, &args) else {
                    log::debug!("no lowering for {} of '{}', skipping propagation", flag, name);
                    return false;
                };

                let pattern = Exp::ref_to(Exp::Terminal(*flag), def_id);
                return stmt.search_and_replace(&pattern, &replacement, true);
            }
        }
        // The whole flag soup is used (e.g. a branch condition); the flag
        // call itself is the replacement
    }

    stmt.search_and_replace(e, rhs, true)
}

/// Copy propagation into one statement, gated by a destination-count map.
///
/// Iterates to a local fixed point (at most [`PROPAGATION_PASS_LIMIT`]
/// rounds) and simplifies once at the end. Returns whether the statement
/// changed.
pub fn propagate_to_stmt(
    stmt: &mut Statement,
    defs: &Definitions,
    prop_max_depth: usize,
    dest_counts: Option<&HashMap<Exp, usize>>,
    force: bool,
) -> bool {
    let mut changes = 0;

    loop {
        let mut used = relift_ir::LocationSet::new();
        stmt.add_used_locs(&mut used, true, false);
        let mut this_change = false;

        let used: Vec<Exp> = used.iter().cloned().collect();
        for e in &used {
            if !can_propagate_to_exp(e, defs) {
                continue;
            }
            let def_id = e.ref_def().expect("propagatable exp is a reference");
            let Some(Def::Assign { lhs, rhs, .. }) = defs.get(def_id) else {
                continue;
            };

            // Never propagate unsubscripted memory reads; they could be
            // carried past a definition of the same memory
            if rhs.contains_bad_mem_of() && !(force && rhs.is_mem_of()) {
                continue;
            }

            // The destination-count gate limits propagation of expensive
            // expressions into many use sites; flags always propagate
            let allowed = match dest_counts {
                None => true,
                Some(_) if lhs.is_flags() || rhs.contains_flags() => true,
                Some(counts) => match counts.get(e) {
                    None => true,
                    Some(&c) if c <= 1 => true,
                    Some(_) => rhs.complexity_depth() < prop_max_depth,
                },
            };

            if allowed {
                this_change |= replace_ref(stmt, e, def_id, lhs, rhs);
            }
        }

        if !this_change {
            break;
        }
        changes += 1;
        if changes >= PROPAGATION_PASS_LIMIT {
            log::debug!("propagation iteration cap hit for statement {}", stmt.id());
            break;
        }
    }

    // Simplification is costly; do it once at the end
    stmt.simplify();

    changes > 0
}

/// Propagate flag definitions (`%flags`, `%CF`, ...) into this statement,
/// lowering flag calls into comparisons.
pub fn propagate_flags_to_stmt(stmt: &mut Statement, defs: &Definitions) -> bool {
    let mut changes = 0;

    loop {
        let mut used = relift_ir::LocationSet::new();
        stmt.add_used_locs(&mut used, true, false);
        let mut this_change = false;

        let used: Vec<Exp> = used.iter().cloned().collect();
        for e in &used {
            let Exp::Ref { base, def: Some(def_id) } = e else {
                continue; // e.g. %pc
            };
            if !base.is_flags() && !base.is_main_flag() {
                continue;
            }

            // Only definitions that actually carry a right hand side
            let (lhs, rhs) = match defs.get(*def_id) {
                Some(Def::Assign { lhs, rhs, .. }) => (lhs.clone(), rhs.clone()),
                Some(Def::Bool { lhs, cond }) => (lhs.clone(), cond.clone()),
                _ => continue,
            };

            this_change |= replace_ref(stmt, e, *def_id, &lhs, &rhs);
        }

        if !this_change {
            break;
        }
        changes += 1;
        if changes >= PROPAGATION_PASS_LIMIT {
            break;
        }
    }

    stmt.simplify();

    changes > 0
}
