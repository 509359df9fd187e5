//! Register transfer lists
//!
//! One RTL holds the statements realizing a single machine instruction.
//! The print format is the fixture format of the test suite: the address in
//! fixed-width hex on the first line, ten spaces on continuation lines, the
//! statement number right-aligned in four columns.

use std::fmt;

use serde::{Deserialize, Serialize};

use relift_common::Address;

use crate::stmt::Statement;

/// The statements of one lifted instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rtl {
    pub addr: Address,
    pub stmts: Vec<Statement>,
}

impl Rtl {
    pub fn new(addr: Address) -> Self {
        Self { addr, stmts: Vec::new() }
    }

    pub fn with_stmts(addr: Address, stmts: Vec<Statement>) -> Self {
        Self { addr, stmts }
    }

    pub fn push(&mut self, stmt: Statement) {
        self.stmts.push(stmt);
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }
}

impl fmt::Display for Rtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stmts.is_empty() {
            return writeln!(f, "{}", self.addr);
        }
        for (i, stmt) in self.stmts.iter().enumerate() {
            let text = stmt.to_string();
            let mut lines = text.lines();
            let first = lines.next().unwrap_or("");
            if i == 0 {
                writeln!(f, "{} {}", self.addr, first)?;
            } else {
                writeln!(f, "{:10} {}", "", first)?;
            }
            for cont in lines {
                writeln!(f, "{:14}{}", "", cont)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exp::Exp;
    use crate::operator::Operator;
    use crate::stmt::StatementId;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_print_single_statement() {
        let rtl = Rtl::with_stmts(
            Address(0x1000),
            vec![Statement::assign(
                StatementId(0),
                Exp::reg(0),
                Exp::binary(Operator::Plus, Exp::reg(1), Exp::reg(2)),
            )],
        );
        assert_eq!(rtl.to_string(), "0x00001000    0 *32* r0 := r1 + r2\n");
    }

    #[test]
    fn test_print_multiple_statements() {
        let rtl = Rtl::with_stmts(
            Address(0x10684),
            vec![
                Statement::assign(
                    StatementId(0),
                    Exp::temp("tmp"),
                    Exp::binary(Operator::Minus, Exp::reg(14), Exp::int(112)),
                ),
                Statement::assign(
                    StatementId(0),
                    Exp::mem(Exp::reg(14)),
                    Exp::reg(16),
                ),
            ],
        );
        assert_eq!(
            rtl.to_string(),
            "0x00010684    0 *32* tmp := r14 - 112\n\
             \u{20}             0 *32* m[r14] := r16\n"
        );
    }

    #[test]
    fn test_print_empty_rtl() {
        let rtl = Rtl::new(Address(0x10694));
        assert_eq!(rtl.to_string(), "0x00010694\n");
    }
}
