//! Algebraic simplification of expressions
//!
//! `simplify` runs bottom-up rewrite passes to a fixed point. All rules are
//! total and the result is idempotent: simplifying twice yields the same
//! tree.

use crate::exp::{Const, Exp, LocKind};
use crate::operator::Operator;

impl Exp {
    /// Reduce the expression to its simplified normal form.
    pub fn simplify(self) -> Exp {
        let mut e = self;
        loop {
            let (next, changed) = simplify_pass(e);
            e = next;
            if !changed {
                return e;
            }
        }
    }
}

fn simplify_pass(e: Exp) -> (Exp, bool) {
    let mut changed = false;
    let mut e = e.map_children(&mut |c| {
        let (n, ch) = simplify_pass(c);
        changed |= ch;
        n
    });
    while let Some(next) = simplify_node(&e) {
        e = next;
        changed = true;
    }
    (e, changed)
}

fn fold_int(op: Operator, a: i64, b: i64) -> Option<i64> {
    let v = match op {
        Operator::Plus => a.wrapping_add(b),
        Operator::Minus => a.wrapping_sub(b),
        Operator::Mult => a.wrapping_mul(b),
        Operator::Div if b != 0 => a.wrapping_div(b),
        Operator::Mod if b != 0 => a.wrapping_rem(b),
        Operator::BitAnd => a & b,
        Operator::BitOr => a | b,
        Operator::BitXor => a ^ b,
        Operator::Shl if (0..64).contains(&b) => a.wrapping_shl(b as u32),
        Operator::Shr if (0..64).contains(&b) => ((a as u64) >> b) as i64,
        Operator::Shra if (0..64).contains(&b) => a >> b,
        Operator::Equals => (a == b) as i64,
        Operator::NotEquals => (a != b) as i64,
        Operator::Less => (a < b) as i64,
        Operator::Greater => (a > b) as i64,
        Operator::LessEq => (a <= b) as i64,
        Operator::GreaterEq => (a >= b) as i64,
        Operator::LessUns => ((a as u64) < (b as u64)) as i64,
        Operator::GreaterUns => ((a as u64) > (b as u64)) as i64,
        Operator::LessEqUns => ((a as u64) <= (b as u64)) as i64,
        Operator::GreaterEqUns => ((a as u64) >= (b as u64)) as i64,
        Operator::And => ((a != 0) && (b != 0)) as i64,
        Operator::Or => ((a != 0) || (b != 0)) as i64,
        _ => return None,
    };
    Some(v)
}

/// Apply one top-level rewrite if any rule matches.
fn simplify_node(e: &Exp) -> Option<Exp> {
    match e {
        Exp::Unary(op, a) => simplify_unary(*op, a),
        Exp::Binary(op, a, b) => simplify_binary(*op, a, b),
        Exp::Loc(LocKind::MemOf, addr) => {
            // m[a[x]] = x
            if let Exp::Unary(Operator::AddrOf, x) = addr.as_ref() {
                return Some((**x).clone());
            }
            None
        }
        _ => None,
    }
}

fn simplify_unary(op: Operator, a: &Exp) -> Option<Exp> {
    match (op, a) {
        // Constant folding
        (Operator::Neg, Exp::Const(Const::Int(v))) => Some(Exp::int(v.wrapping_neg())),
        (Operator::BitNot, Exp::Const(Const::Int(v))) => Some(Exp::int(!v)),
        (Operator::LogNot, Exp::Const(Const::Int(v))) => Some(Exp::int((*v == 0) as i64)),

        // Involutions
        (Operator::Neg, Exp::Unary(Operator::Neg, x)) => Some((**x).clone()),
        (Operator::BitNot, Exp::Unary(Operator::BitNot, x)) => Some((**x).clone()),

        // a[m[x]] = x
        (Operator::AddrOf, Exp::Loc(LocKind::MemOf, x)) => Some((**x).clone()),

        _ => None,
    }
}

fn simplify_binary(op: Operator, a: &Exp, b: &Exp) -> Option<Exp> {
    // Constant folding
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if let Some(v) = fold_int(op, x, y) {
            return Some(Exp::int(v));
        }
    }

    // Normalize constants to the right for commutative operators
    if op.is_commutative() && a.is_const() && !b.is_const() {
        return Some(Exp::binary(op, b.clone(), a.clone()));
    }

    match op {
        Operator::Plus => {
            if b.as_int() == Some(0) {
                return Some(a.clone());
            }
            // x + (-k) = x - k
            if let Some(k) = b.as_int() {
                if k < 0 {
                    return Some(Exp::binary(Operator::Minus, a.clone(), Exp::int(-k)));
                }
            }
            // (x +- j) + k = x + (k +- j)
            if let (Exp::Binary(inner_op @ (Operator::Plus | Operator::Minus), x, j), Some(k)) =
                (a, b.as_int())
            {
                if let Some(j) = j.as_int() {
                    let folded = if *inner_op == Operator::Plus { j + k } else { k - j };
                    return Some(Exp::binary(Operator::Plus, (**x).clone(), Exp::int(folded)));
                }
            }
            None
        }
        Operator::Minus => {
            if a == b {
                return Some(Exp::int(0));
            }
            if b.as_int() == Some(0) {
                return Some(a.clone());
            }
            // x - (-k) = x + k; x - k = x + (-k) is not applied, subtraction
            // of a positive constant is already normal form
            if let Some(k) = b.as_int() {
                if k < 0 {
                    return Some(Exp::binary(Operator::Plus, a.clone(), Exp::int(-k)));
                }
                // (x +- j) - k = x + (+-j - k)
                if let Exp::Binary(inner_op @ (Operator::Plus | Operator::Minus), x, j) = a {
                    if let Some(j) = j.as_int() {
                        let folded = if *inner_op == Operator::Plus { j - k } else { -j - k };
                        return Some(Exp::binary(Operator::Plus, (**x).clone(), Exp::int(folded)));
                    }
                }
            }
            None
        }
        Operator::Mult => match b.as_int() {
            Some(0) => Some(Exp::int(0)),
            Some(1) => Some(a.clone()),
            _ => None,
        },
        Operator::Div => match b.as_int() {
            Some(1) => Some(a.clone()),
            _ => None,
        },
        Operator::BitAnd => {
            if b.as_int() == Some(0) {
                return Some(Exp::int(0));
            }
            if a == b {
                return Some(a.clone());
            }
            None
        }
        Operator::BitOr => {
            if b.as_int() == Some(0) {
                return Some(a.clone());
            }
            if a == b {
                return Some(a.clone());
            }
            None
        }
        Operator::BitXor => {
            if b.as_int() == Some(0) {
                return Some(a.clone());
            }
            if a == b {
                return Some(Exp::int(0));
            }
            None
        }
        Operator::Shl | Operator::Shr | Operator::Shra => {
            if b.as_int() == Some(0) {
                return Some(a.clone());
            }
            None
        }
        Operator::Equals | Operator::NotEquals => {
            if a == b && !a.contains_bad_mem_of() {
                return Some(Exp::int((op == Operator::Equals) as i64));
            }
            None
        }
        _ => None,
    }
}
