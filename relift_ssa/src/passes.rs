//! The per-procedure pass pipeline
//!
//! The order is fixed: statement init, dominators, call define update, phi
//! placement and renaming, then propagation, bypassing and null-statement
//! removal iterated to a fixed point (or the iteration cap). A CFG
//! integrity failure aborts the procedure; the program driver reports it
//! and moves on to the next procedure.

use std::collections::HashMap;

use relift_common::{Address, ReliftError, ReliftResult, Settings};
use relift_ir::{Exp, LocationSet, Procedure, Program, Statement, StatementId, StatementIdAllocator};

use crate::bypass::bypass_stmt;
use crate::dataflow::DataFlow;
use crate::propagate::{propagate_flags_to_stmt, propagate_to_stmt, Definitions};
use crate::rename::rename_block_vars;

/// Cap on the propagate/bypass fixpoint iteration.
pub const DECOMPILE_PASS_LIMIT: usize = 10;

/// Refresh each call's defines from its callee's modifieds. Childless
/// calls keep their decoder-provided defines; phi placement treats them as
/// defining everything anyway.
pub fn update_call_defines(proc: &mut Procedure, settings: &Settings) {
    for stmt in proc.statements_mut() {
        let Statement::Call(call) = stmt else {
            continue;
        };
        let Some(callee) = &call.callee else {
            continue;
        };

        let mut defines: Vec<Exp> = callee.modifieds.clone();
        if settings.assume_abi {
            defines.retain(|d| match d.reg_num() {
                Some(n) => !settings.callee_saved_regs.contains(&n),
                None => true,
            });
        }
        call.defines = defines;
    }
}

/// Count how often each subscripted location is used across the whole
/// procedure. Feeds the propagation gate.
pub fn count_ref_uses(proc: &Procedure) -> HashMap<Exp, usize> {
    let mut counts: HashMap<Exp, usize> = HashMap::new();
    for stmt in proc.statements() {
        let mut used = LocationSet::new();
        stmt.add_used_locs(&mut used, true, false);
        for e in used.iter() {
            if e.is_subscript() {
                *counts.entry(e.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Remove `x := x{d}` statements, rewiring references to them onto `d`.
/// Returns whether anything was removed.
pub fn remove_null_statements(proc: &mut Procedure) -> bool {
    // id of the null statement -> definition its references move to
    let mut retired: HashMap<StatementId, Option<StatementId>> = HashMap::new();
    for stmt in proc.statements() {
        if stmt.is_null_statement() {
            if let Statement::Assign(a) = stmt {
                if let Exp::Ref { def, .. } = &a.rhs {
                    retired.insert(a.id, *def);
                }
            }
        }
    }

    if retired.is_empty() {
        return false;
    }

    for frag in proc.cfg.iter_mut() {
        frag.retain_statements(|s| !retired.contains_key(&s.id()));
    }

    for stmt in proc.statements_mut() {
        stmt.rewrite_refs(&mut |id| retired.get(&id).copied().flatten());
    }

    true
}

/// Run the full pipeline on one procedure.
pub fn decompile_proc(
    proc: &mut Procedure,
    ids: &mut StatementIdAllocator,
    settings: &Settings,
) -> ReliftResult<()> {
    proc.cfg.check_integrity(&proc.name)?;

    // Statement init: bring fresh RTLs into normal form
    for stmt in proc.statements_mut() {
        stmt.simplify();
    }

    let mut df = DataFlow::new();
    if !df.calculate_dominators(proc)? {
        return Ok(());
    }

    // Call defines must be up to date before the transformation to SSA
    // form, otherwise definitions of calls are ignored
    update_call_defines(proc, settings);

    df.place_phi_functions(proc, ids, settings.assume_abi)?;
    rename_block_vars(proc, &df, settings.assume_abi)?;

    let mut pass = 0;
    loop {
        pass += 1;
        let mut changed = false;

        let defs = Definitions::collect(proc);
        let dest_counts = count_ref_uses(proc);
        for stmt in proc.statements_mut() {
            if stmt.is_phi() {
                continue;
            }
            changed |= propagate_to_stmt(
                stmt,
                &defs,
                settings.prop_max_depth,
                Some(&dest_counts),
                false,
            );
            changed |= propagate_flags_to_stmt(stmt, &defs);
        }

        // Refresh the snapshot; propagation may have rewritten collectors
        let defs = Definitions::collect(proc);
        for stmt in proc.statements_mut() {
            if stmt.is_phi() {
                continue;
            }
            changed |= bypass_stmt(stmt, &defs);
        }

        changed |= remove_null_statements(proc);

        if !changed {
            break;
        }
        if pass >= DECOMPILE_PASS_LIMIT {
            log::warn!(
                "'{}': decompile iteration cap reached after {} passes",
                proc.name,
                pass
            );
            break;
        }
    }

    Ok(())
}

/// Run the pipeline over every procedure of the program. Failures are
/// reported per procedure; the remaining procedures still run.
pub fn decompile_program(
    program: &mut Program,
    settings: &Settings,
) -> Vec<(Address, ReliftError)> {
    let mut failures = Vec::new();
    let Program { procs, ids, .. } = program;

    for (addr, proc) in procs.iter_mut() {
        if let Err(err) = decompile_proc(proc, ids, settings) {
            log::error!("decompilation of '{}' failed: {}", proc.name, err);
            failures.push((*addr, err));
        }
    }

    failures
}
