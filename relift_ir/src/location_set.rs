//! Ordered sets of location expressions
//!
//! Used for definition sets, live variable sets and the used-location
//! queries of the rewriting passes. Iteration order follows the expression
//! ordering, which keeps dumps and pass behavior deterministic.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exp::{Exp, LocKind, Terminal};

/// A set of locations (registers, memory, flags, subscripted locations).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSet {
    locs: BTreeSet<Exp>,
}

impl LocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, e: Exp) -> bool {
        self.locs.insert(e)
    }

    pub fn remove(&mut self, e: &Exp) -> bool {
        self.locs.remove(e)
    }

    pub fn contains(&self, e: &Exp) -> bool {
        self.locs.contains(e)
    }

    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.locs.len()
    }

    pub fn clear(&mut self) {
        self.locs.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exp> {
        self.locs.iter()
    }

    pub fn make_union(&mut self, other: &LocationSet) {
        for e in other.iter() {
            self.locs.insert(e.clone());
        }
    }

    /// Collect the locations used by `e` into this set.
    ///
    /// Subscripted locations are collected whole (`r28{55}`, not `r28`);
    /// the address operand of a memory access is searched for further
    /// uses. With `mem_only`, only memory locations are collected.
    pub fn add_used_locs(&mut self, e: &Exp, mem_only: bool) {
        match e {
            Exp::Ref { base, .. } => {
                if !mem_only || base.is_mem_of() {
                    self.insert(e.clone());
                }
                // The base itself is covered by the subscript; only its
                // operands can contain further uses.
                if let Exp::Loc(_, inner) = base.as_ref() {
                    self.add_used_locs(inner, mem_only);
                }
            }
            Exp::Loc(LocKind::MemOf, addr) => {
                self.insert(e.clone());
                self.add_used_locs(addr, mem_only);
            }
            Exp::Loc(_, inner) => {
                if !mem_only {
                    self.insert(e.clone());
                }
                self.add_used_locs(inner, mem_only);
            }
            Exp::Terminal(t) => {
                if !mem_only && *t != Terminal::Nil {
                    self.insert(e.clone());
                }
            }
            other => {
                for c in other.children() {
                    self.add_used_locs(c, mem_only);
                }
            }
        }
    }
}

impl FromIterator<Exp> for LocationSet {
    fn from_iter<I: IntoIterator<Item = Exp>>(iter: I) -> Self {
        Self { locs: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a LocationSet {
    type Item = &'a Exp;
    type IntoIter = std::collections::btree_set::Iter<'a, Exp>;

    fn into_iter(self) -> Self::IntoIter {
        self.locs.iter()
    }
}

impl fmt::Display for LocationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.locs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Operator;
    use crate::stmt::StatementId;

    #[test]
    fn test_used_locs_in_memof() {
        // m[r28 - 8] * r26 uses r26, r28 and m[r28 - 8]
        let e = Exp::binary(
            Operator::Mult,
            Exp::mem(Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(8))),
            Exp::reg(26),
        );
        let mut set = LocationSet::new();
        set.add_used_locs(&e, false);
        assert_eq!(set.to_string(), "r26, r28, m[r28 - 8]");
    }

    #[test]
    fn test_used_locs_subscripted() {
        // m[r26{99}]{55} uses r26{99} and the subscripted memof, but not
        // the bare r26 or bare m[r26{99}]
        let r26_99 = Exp::ref_to(Exp::reg(26), StatementId(99));
        let e = Exp::ref_to(Exp::mem(r26_99), StatementId(55));
        let mut set = LocationSet::new();
        set.add_used_locs(&e, false);
        assert_eq!(set.to_string(), "r26{99}, m[r26{99}]{55}");
    }

    #[test]
    fn test_used_locs_terminal() {
        let mut set = LocationSet::new();
        set.add_used_locs(&Exp::terminal(Terminal::Flags), false);
        assert_eq!(set.to_string(), "%flags");
    }

    #[test]
    fn test_used_locs_implicit_ref() {
        let e = Exp::implicit_ref(Exp::reg(28));
        let mut set = LocationSet::new();
        set.add_used_locs(&e, false);
        assert_eq!(set.to_string(), "r28{-}");
    }

    #[test]
    fn test_mem_only() {
        let e = Exp::binary(
            Operator::Plus,
            Exp::mem(Exp::reg(26)),
            Exp::reg(27),
        );
        let mut set = LocationSet::new();
        set.add_used_locs(&e, true);
        assert_eq!(set.to_string(), "m[r26]");
    }

    #[test]
    fn test_union_and_membership() {
        let mut a = LocationSet::new();
        a.insert(Exp::reg(1));
        let mut b = LocationSet::new();
        b.insert(Exp::reg(2));
        a.make_union(&b);
        assert_eq!(a.len(), 2);
        assert!(a.contains(&Exp::reg(1)));
        assert!(a.contains(&Exp::reg(2)));
    }
}
