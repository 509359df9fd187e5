//! SSA renaming
//!
//! Walks the dominator tree depth-first keeping a stack of definitions per
//! renameable expression. Uses are annotated with the defining statement on
//! top of the stack (or the implicit `{-}` sentinel when there is none),
//! phi cases are filled in from the predecessor side, and call statements
//! capture their reaching definitions in their collector.

use indexmap::IndexMap;

use relift_common::ReliftResult;
use relift_ir::{
    Exp, ExpModifier, FragmentId, LocationSet, Procedure, Statement, StatementId,
};

use crate::dataflow::{can_rename_exp, DataFlow, INDEX_INVALID};

/// Strip all SSA subscripts from an expression, yielding the bare location
/// used as the renaming stack key.
pub fn strip_refs(e: &Exp) -> Exp {
    let stripped = e.clone().map_children(&mut |c| strip_refs(&c));
    match stripped {
        Exp::Ref { base, .. } => *base,
        other => other,
    }
}

/// Expression modifier that subscripts every bare renameable location with
/// the definition on top of its stack.
struct ExpSubscripter<'a> {
    stacks: &'a IndexMap<Exp, Vec<StatementId>>,
    sp_reg: i64,
    rename_locals_and_params: bool,
}

impl ExpSubscripter<'_> {
    fn current_def(&self, key: &Exp) -> Option<StatementId> {
        self.stacks.get(key).and_then(|s| s.last().copied())
    }
}

impl ExpModifier for ExpSubscripter<'_> {
    fn open(&mut self, e: Exp, visit_children: &mut bool) -> Exp {
        // Already-subscripted subtrees are left alone; renaming runs on
        // freshly built fragments
        if e.is_subscript() {
            *visit_children = false;
        }
        e
    }

    fn close(&mut self, e: Exp) -> Exp {
        if (e.is_location() || e.is_flags() || e.is_main_flag())
            && can_rename_exp(&e, self.sp_reg, self.rename_locals_and_params)
        {
            let key = strip_refs(&e);
            let def = self.current_def(&key);
            return Exp::Ref { base: Box::new(e), def };
        }
        e
    }
}

/// Renaming engine state.
pub struct BlockVarRenamer<'a> {
    df: &'a DataFlow,
    assume_abi: bool,
    stacks: IndexMap<Exp, Vec<StatementId>>,
}

impl<'a> BlockVarRenamer<'a> {
    pub fn new(df: &'a DataFlow, assume_abi: bool) -> Self {
        Self { df, assume_abi, stacks: IndexMap::new() }
    }

    /// Rename all block variables of `proc`. Dominators and phi placement
    /// must have run.
    pub fn rename(mut self, proc: &mut Procedure) -> ReliftResult<()> {
        let Some(entry) = proc.cfg.entry_fragment() else {
            return Ok(());
        };
        self.rename_in_frag(proc, entry.index());
        Ok(())
    }

    fn subscripter(&self, sp_reg: i64) -> ExpSubscripter<'_> {
        ExpSubscripter {
            stacks: &self.stacks,
            sp_reg,
            rename_locals_and_params: self.df.rename_locals_and_params,
        }
    }

    fn rename_in_frag(&mut self, proc: &mut Procedure, n: usize) {
        let mut pushes: Vec<Exp> = Vec::new();
        let sp_reg = proc.sp_reg;

        // Rename within the fragment, statement by statement
        let num_rtls = proc
            .cfg
            .frag(FragmentId(n as u32))
            .map(|f| f.rtls.len())
            .unwrap_or(0);

        for r in 0..num_rtls {
            let num_stmts =
                proc.cfg.frag(FragmentId(n as u32)).map(|f| f.rtls[r].stmts.len()).unwrap_or(0);

            for s in 0..num_stmts {
                let is_phi = {
                    let stmt = &proc.cfg.frag(FragmentId(n as u32)).unwrap().rtls[r].stmts[s];
                    stmt.is_phi()
                };

                if is_phi {
                    // A phi is a fresh definition of its variable
                    let (key, id) = {
                        let stmt = &proc.cfg.frag(FragmentId(n as u32)).unwrap().rtls[r].stmts[s];
                        (strip_refs(stmt.lhs().expect("phi has a target")), stmt.id())
                    };
                    self.stacks.entry(key.clone()).or_default().push(id);
                    pushes.push(key);
                    continue;
                }

                // Subscript the uses with the reaching definitions
                {
                    let mut sub = self.subscripter(sp_reg);
                    let stmt =
                        &mut proc.cfg.frag_mut(FragmentId(n as u32)).unwrap().rtls[r].stmts[s];
                    stmt.modify_exps(&mut sub);
                }

                let stmt = &mut proc.cfg.frag_mut(FragmentId(n as u32)).unwrap().rtls[r].stmts[s];

                // Calls capture the definitions reaching them
                if let Statement::Call(call) = stmt {
                    for (key, stack) in self.stacks.iter() {
                        if let Some(top) = stack.last() {
                            call.def_collector
                                .collect_def(key.clone(), Exp::ref_to(key.clone(), *top));
                        }
                    }
                }

                // Push this statement's renameable definitions
                let mut defs = LocationSet::new();
                stmt.get_definitions(&mut defs, self.assume_abi);
                let id = stmt.id();
                for d in defs.iter() {
                    if can_rename_exp(d, sp_reg, self.df.rename_locals_and_params) {
                        let key = strip_refs(d);
                        self.stacks.entry(key.clone()).or_default().push(id);
                        pushes.push(key);
                    }
                }
            }
        }

        // Fill in our side of the phi cases of every successor
        let succs: Vec<FragmentId> = proc
            .cfg
            .frag(FragmentId(n as u32))
            .map(|f| f.successors.to_vec())
            .unwrap_or_default();
        for succ in succs {
            let tops: Vec<(Exp, Option<StatementId>)> = {
                let frag = proc.cfg.frag(succ).unwrap();
                frag.phis()
                    .map(|phi| {
                        let key = strip_refs(phi.lhs().expect("phi has a target"));
                        let def = self.stacks.get(&key).and_then(|s| s.last().copied());
                        (key, def)
                    })
                    .collect()
            };

            let frag = proc.cfg.frag_mut(succ).unwrap();
            for (stmt, (key, def)) in frag.phis_mut().zip(tops) {
                if let Statement::Phi(phi) = stmt {
                    phi.cases.insert(
                        FragmentId(n as u32),
                        relift_ir::PhiCase { def, base: key },
                    );
                }
            }
        }

        // Recurse into the dominator-tree children
        let num_frags = proc.cfg.num_fragments();
        for c in 0..num_frags {
            if c != n && self.df.idom_of(c) == n && self.df.idom_of(c) != INDEX_INVALID {
                self.rename_in_frag(proc, c);
            }
        }

        // Leave the fragment: undo this fragment's pushes
        for key in pushes.into_iter().rev() {
            if let Some(stack) = self.stacks.get_mut(&key) {
                stack.pop();
            }
        }
    }
}

/// Convenience wrapper running the renamer.
pub fn rename_block_vars(
    proc: &mut Procedure,
    df: &DataFlow,
    assume_abi: bool,
) -> ReliftResult<()> {
    BlockVarRenamer::new(df, assume_abi).rename(proc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relift_common::Address;
    use relift_ir::{FlowKind, Operator, Rtl, StatementIdAllocator};

    #[test]
    fn test_strip_refs() {
        let e = Exp::mem(Exp::binary(
            Operator::Minus,
            Exp::ref_to(Exp::reg(28), StatementId(5)),
            Exp::int(4),
        ));
        assert_eq!(
            strip_refs(&e),
            Exp::mem(Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(4)))
        );
        assert_eq!(strip_refs(&Exp::reg(24)), Exp::reg(24));
    }

    /// One straight-line fragment: uses before defs get the implicit
    /// sentinel, later uses see earlier definitions.
    #[test]
    fn test_rename_straight_line() {
        let mut ids = StatementIdAllocator::starting_at(1);
        let mut proc = Procedure::new("straight", Address(0x1000));

        let s1 = ids.alloc();
        let s2 = ids.alloc();
        let f = proc.cfg.add_fragment(
            FlowKind::Ret,
            vec![Rtl::with_stmts(
                Address(0x1000),
                vec![
                    // r24 := r25 + 1 (r25 undefined on entry)
                    Statement::assign(
                        s1,
                        Exp::reg(24),
                        Exp::binary(Operator::Plus, Exp::reg(25), Exp::int(1)),
                    ),
                    // r26 := r24 (sees the definition above)
                    Statement::assign(s2, Exp::reg(26), Exp::reg(24)),
                ],
            )],
        );
        proc.cfg.set_entry(f);

        let mut df = DataFlow::new();
        df.calculate_dominators(&proc).unwrap();
        df.place_phi_functions(&mut proc, &mut ids, false).unwrap();
        rename_block_vars(&mut proc, &df, false).unwrap();

        let stmts: Vec<String> = proc.statements().map(|s| s.to_string()).collect();
        assert_eq!(stmts[0], format!("{:>4} *32* r24 := r25{{-}} + 1", s1.0));
        assert_eq!(stmts[1], format!("{:>4} *32* r26 := r24{{{}}}", s2.0, s1.0));
    }

    /// Diamond with a redefinition on one arm: the join's phi collects one
    /// case per predecessor, annotated with the reaching definition.
    #[test]
    fn test_rename_diamond_fills_phi_cases() {
        let mut ids = StatementIdAllocator::starting_at(1);
        let mut proc = Procedure::new("diamond", Address(0x1000));

        let d0 = ids.alloc();
        let d1 = ids.alloc();
        let u = ids.alloc();

        let entry = proc.cfg.add_fragment(
            FlowKind::Twoway,
            vec![Rtl::with_stmts(
                Address(0x1000),
                vec![Statement::assign(d0, Exp::reg(24), Exp::int(1))],
            )],
        );
        let then = proc.cfg.add_fragment(
            FlowKind::Oneway,
            vec![Rtl::with_stmts(
                Address(0x1010),
                vec![Statement::assign(d1, Exp::reg(24), Exp::int(2))],
            )],
        );
        let els = proc.cfg.add_fragment(FlowKind::Fall, vec![Rtl::new(Address(0x1020))]);
        let join = proc.cfg.add_fragment(
            FlowKind::Ret,
            vec![Rtl::with_stmts(
                Address(0x1030),
                vec![Statement::assign(u, Exp::reg(26), Exp::reg(24))],
            )],
        );
        proc.cfg.set_entry(entry);
        proc.cfg.add_edge(entry, then);
        proc.cfg.add_edge(entry, els);
        proc.cfg.add_edge(then, join);
        proc.cfg.add_edge(els, join);

        let mut df = DataFlow::new();
        df.calculate_dominators(&proc).unwrap();
        df.place_phi_functions(&mut proc, &mut ids, false).unwrap();
        rename_block_vars(&mut proc, &df, false).unwrap();

        let join_frag = proc.cfg.frag(join).unwrap();
        let phi_stmt = join_frag.first_stmt().expect("phi at top of join");
        let Statement::Phi(phi) = phi_stmt else {
            panic!("expected a phi at the join, got {}", phi_stmt);
        };

        assert_eq!(phi.cases.len(), 2);
        let from_then = &phi.cases[&then];
        let from_els = &phi.cases[&els];
        assert_eq!(from_then.def, Some(d1));
        assert_eq!(from_els.def, Some(d0));
        assert_eq!(from_then.base, Exp::reg(24));

        // The use in the join sees the phi's definition
        let use_stmt = join_frag.statements().nth(1).unwrap();
        let Statement::Assign(a) = use_stmt else {
            panic!("expected an assign");
        };
        assert_eq!(a.rhs, Exp::ref_to(Exp::reg(24), phi_stmt.id()));
    }

    /// Every use is annotated with exactly one definition or the implicit
    /// sentinel after renaming.
    #[test]
    fn test_every_use_is_annotated() {
        let mut ids = StatementIdAllocator::starting_at(1);
        let mut proc = Procedure::new("p", Address(0x1000));

        let f = proc.cfg.add_fragment(
            FlowKind::Ret,
            vec![Rtl::with_stmts(
                Address(0x1000),
                vec![
                    Statement::assign(ids.alloc(), Exp::reg(24), Exp::reg(25)),
                    Statement::assign(
                        ids.alloc(),
                        Exp::mem(Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(4))),
                        Exp::binary(Operator::Plus, Exp::reg(24), Exp::reg(25)),
                    ),
                ],
            )],
        );
        proc.cfg.set_entry(f);

        let mut df = DataFlow::new();
        df.calculate_dominators(&proc).unwrap();
        df.place_phi_functions(&mut proc, &mut ids, false).unwrap();
        rename_block_vars(&mut proc, &df, false).unwrap();

        let mut used = LocationSet::new();
        for stmt in proc.statements() {
            stmt.add_used_locs(&mut used, false, false);
        }
        for e in used.iter() {
            if e.is_reg_of() {
                panic!("bare register {} survived renaming", e);
            }
        }
    }

    /// Call statements capture the reaching definitions in their
    /// collector during renaming.
    #[test]
    fn test_call_collects_reaching_defs() {
        use relift_ir::{CallStatement, DefCollector};

        let mut ids = StatementIdAllocator::starting_at(1);
        let mut proc = Procedure::new("p", Address(0x1000));

        let d = ids.alloc();
        let call_id = ids.alloc();
        let f = proc.cfg.add_fragment(
            FlowKind::Call,
            vec![Rtl::with_stmts(
                Address(0x1000),
                vec![
                    Statement::assign(d, Exp::reg(28), Exp::int(0x4000)),
                    Statement::Call(CallStatement {
                        id: call_id,
                        dest: Exp::int(0x5000),
                        arguments: vec![],
                        defines: vec![Exp::reg(24)],
                        use_collector: LocationSet::new(),
                        def_collector: DefCollector::new(),
                        callee: None,
                        return_after_call: false,
                    }),
                ],
            )],
        );
        proc.cfg.set_entry(f);

        let mut df = DataFlow::new();
        df.calculate_dominators(&proc).unwrap();
        df.place_phi_functions(&mut proc, &mut ids, false).unwrap();
        rename_block_vars(&mut proc, &df, false).unwrap();

        let call = proc
            .statements()
            .find_map(|s| match s {
                Statement::Call(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            call.def_collector.find_def_for(&Exp::reg(28)),
            Some(&Exp::ref_to(Exp::reg(28), d))
        );
    }
}
