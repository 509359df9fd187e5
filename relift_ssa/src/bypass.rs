//! Call bypassing
//!
//! A reference defined by a call, like `r28{17}`, can be rewritten using
//! the callee's proven identity for the location, localized to the
//! definitions reaching the call: `r28{17}` becomes `r28{15} + 4`. The
//! modifier re-runs itself on the produced expression to chase chains of
//! bypassable calls, bounded per statement.

use relift_ir::{Exp, ExpModifier, Statement};

use crate::propagate::Definitions;

/// Upper bound on rewrites per statement per pass.
pub const BYPASS_REWRITE_LIMIT: usize = 10;

/// Expression modifier performing the bypass rewrite.
pub struct CallBypasser<'a> {
    defs: &'a Definitions,
    changed: bool,
    rewrites: usize,
}

impl<'a> CallBypasser<'a> {
    pub fn new(defs: &'a Definitions) -> Self {
        Self { defs, changed: false, rewrites: 0 }
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }
}

impl ExpModifier for CallBypasser<'_> {
    fn close(&mut self, e: Exp) -> Exp {
        if let Exp::Ref { base, def: Some(id) } = &e {
            let bypassed = if self.rewrites < BYPASS_REWRITE_LIMIT {
                self.defs.get(*id).and_then(|def| def.bypass_ref(base))
            } else {
                None
            };
            return match bypassed {
                Some(bypassed) => {
                    self.changed = true;
                    self.rewrites += 1;
                    // Chase further bypassable calls in the result
                    bypassed.accept_modifier(self)
                }
                None => e,
            };
        }

        // Locations touched by a rewrite below are re-simplified
        if e.is_location() {
            return e.simplify();
        }
        e
    }
}

/// Bypass call-defined references in one statement. Assignment targets are
/// guarded; only their memory address operands are rewritten. Simplifies
/// the statement when anything changed.
pub fn bypass_stmt(stmt: &mut Statement, defs: &Definitions) -> bool {
    let mut bypasser = CallBypasser::new(defs);
    stmt.modify_exps(&mut bypasser);
    let changed = bypasser.is_changed();
    if changed {
        stmt.simplify();
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use relift_ir::{
        CallStatement, CalleeInfo, DefCollector, LocationSet, Operator, StatementId,
    };

    /// Build the call `17: CALL foo` proven to set `r28 := r28 + 4`, with
    /// `r28{15}` reaching it.
    fn call_17() -> Statement {
        let mut def_collector = DefCollector::new();
        def_collector.collect_def(Exp::reg(28), Exp::ref_to(Exp::reg(28), StatementId(15)));

        Statement::Call(CallStatement {
            id: StatementId(17),
            dest: Exp::int(0x2000),
            arguments: vec![],
            defines: vec![Exp::reg(28)],
            use_collector: LocationSet::new(),
            def_collector,
            callee: Some(CalleeInfo {
                name: "foo2".into(),
                proven: vec![(
                    Exp::reg(28),
                    Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)),
                )],
                modifieds: vec![Exp::reg(28)],
                return_stmt: None,
            }),
            return_after_call: false,
        })
    }

    #[test]
    fn test_bypass_stack_pointer() {
        // 19: r28 := r28{17} + 16, with 17 the call above:
        // bypassing gives r28 := r28{15} + 20
        let call = call_17();
        let s15 = Statement::implicit(StatementId(15), Exp::reg(28));

        let mut defs = Definitions::new();
        defs.insert_statement(&call);
        defs.insert_statement(&s15);

        let mut s19 = Statement::assign(
            StatementId(19),
            Exp::reg(28),
            Exp::binary(
                Operator::Plus,
                Exp::ref_to(Exp::reg(28), StatementId(17)),
                Exp::int(16),
            ),
        );

        assert!(bypass_stmt(&mut s19, &defs));
        assert_eq!(s19.to_string(), "  19 *32* r28 := r28{15} + 20");

        // A second run changes nothing: r28{15} does not reach a call
        assert!(!bypass_stmt(&mut s19, &defs));
        assert_eq!(s19.to_string(), "  19 *32* r28 := r28{15} + 20");
    }

    #[test]
    fn test_bypass_chases_call_chains() {
        // 17 is proven r28 := r28 + 4 with r28{13} reaching it, and 13 is
        // itself a call proven r28 := r28 + 8 with r28{11} reaching it
        let mut dc17 = DefCollector::new();
        dc17.collect_def(Exp::reg(28), Exp::ref_to(Exp::reg(28), StatementId(13)));
        let call17 = Statement::Call(CallStatement {
            id: StatementId(17),
            dest: Exp::int(0x2000),
            arguments: vec![],
            defines: vec![Exp::reg(28)],
            use_collector: LocationSet::new(),
            def_collector: dc17,
            callee: Some(CalleeInfo {
                name: "f".into(),
                proven: vec![(
                    Exp::reg(28),
                    Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)),
                )],
                modifieds: vec![Exp::reg(28)],
                return_stmt: None,
            }),
            return_after_call: false,
        });

        let mut dc13 = DefCollector::new();
        dc13.collect_def(Exp::reg(28), Exp::ref_to(Exp::reg(28), StatementId(11)));
        let call13 = Statement::Call(CallStatement {
            id: StatementId(13),
            dest: Exp::int(0x3000),
            arguments: vec![],
            defines: vec![Exp::reg(28)],
            use_collector: LocationSet::new(),
            def_collector: dc13,
            callee: Some(CalleeInfo {
                name: "g".into(),
                proven: vec![(
                    Exp::reg(28),
                    Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(8)),
                )],
                modifieds: vec![Exp::reg(28)],
                return_stmt: None,
            }),
            return_after_call: false,
        });

        let mut defs = Definitions::new();
        defs.insert_statement(&call17);
        defs.insert_statement(&call13);

        let mut stmt = Statement::assign(
            StatementId(19),
            Exp::reg(28),
            Exp::binary(
                Operator::Plus,
                Exp::ref_to(Exp::reg(28), StatementId(17)),
                Exp::int(16),
            ),
        );

        assert!(bypass_stmt(&mut stmt, &defs));
        // 16 + 4 + 8 folded onto r28{11}
        assert_eq!(stmt.to_string(), "  19 *32* r28 := r28{11} + 28");
    }

    #[test]
    fn test_bypass_leaves_unprovable_refs() {
        // The call proves nothing about r29
        let call = call_17();
        let mut defs = Definitions::new();
        defs.insert_statement(&call);

        let mut stmt = Statement::assign(
            StatementId(20),
            Exp::reg(29),
            Exp::ref_to(Exp::reg(29), StatementId(17)),
        );
        assert!(!bypass_stmt(&mut stmt, &defs));
        assert_eq!(stmt.to_string(), "  20 *32* r29 := r29{17}");
    }

    #[test]
    fn test_bypass_guards_assignment_target() {
        // The top-level lhs must not be bypassed, but a memory target's
        // address must be
        let call = call_17();
        let mut defs = Definitions::new();
        defs.insert_statement(&call);

        let mut stmt = Statement::assign(
            StatementId(21),
            Exp::mem(Exp::ref_to(Exp::reg(28), StatementId(17))),
            Exp::int(0),
        );
        assert!(bypass_stmt(&mut stmt, &defs));
        assert_eq!(stmt.to_string(), "  21 *32* m[r28{15} + 4] := 0");
    }
}
