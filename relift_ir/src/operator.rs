//! Operators of the symbolic expression algebra

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operators appearing in unary, binary and ternary expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operator {
    // Arithmetic
    Plus,
    Minus,
    Mult,
    Div,
    Mod,

    // Unary
    Neg,
    BitNot,
    LogNot,
    AddrOf,

    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Shra,

    // Comparison
    Equals,
    NotEquals,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    LessUns,
    GreaterUns,
    LessEqUns,
    GreaterEqUns,

    // Logical
    And,
    Or,

    // Structural: flag function application and its argument list
    FlagCall,
    List,

    // Ternary select (cond ? a : b)
    Tern,
}

impl Operator {
    /// True for operators whose operands may be reordered. The simplifier
    /// uses this to push constants to the right.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Operator::Plus
                | Operator::Mult
                | Operator::BitAnd
                | Operator::BitOr
                | Operator::BitXor
                | Operator::And
                | Operator::Or
                | Operator::Equals
                | Operator::NotEquals
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Equals
                | Operator::NotEquals
                | Operator::Less
                | Operator::Greater
                | Operator::LessEq
                | Operator::GreaterEq
                | Operator::LessUns
                | Operator::GreaterUns
                | Operator::LessEqUns
                | Operator::GreaterEqUns
        )
    }

    /// Printing precedence. Higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            Operator::Neg | Operator::BitNot | Operator::LogNot | Operator::AddrOf => 10,
            Operator::Mult | Operator::Div | Operator::Mod => 9,
            Operator::Plus | Operator::Minus => 8,
            Operator::Shl | Operator::Shr | Operator::Shra => 7,
            Operator::Less
            | Operator::Greater
            | Operator::LessEq
            | Operator::GreaterEq
            | Operator::LessUns
            | Operator::GreaterUns
            | Operator::LessEqUns
            | Operator::GreaterEqUns => 6,
            Operator::Equals | Operator::NotEquals => 5,
            Operator::BitAnd => 4,
            Operator::BitXor => 3,
            Operator::BitOr => 2,
            Operator::And => 1,
            Operator::Or => 0,
            Operator::FlagCall | Operator::List | Operator::Tern => 0,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Mult => "*",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::Neg => "-",
            Operator::BitNot => "~",
            Operator::LogNot => "not",
            Operator::AddrOf => "a[",
            Operator::BitAnd => "&",
            Operator::BitOr => "|",
            Operator::BitXor => "^",
            Operator::Shl => "<<",
            Operator::Shr => ">>",
            Operator::Shra => ">>A",
            Operator::Equals => "=",
            Operator::NotEquals => "~=",
            Operator::Less => "<",
            Operator::Greater => ">",
            Operator::LessEq => "<=",
            Operator::GreaterEq => ">=",
            Operator::LessUns => "<u",
            Operator::GreaterUns => ">u",
            Operator::LessEqUns => "<=u",
            Operator::GreaterEqUns => ">=u",
            Operator::And => "and",
            Operator::Or => "or",
            Operator::FlagCall => "flagcall",
            Operator::List => "list",
            Operator::Tern => "?:",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commutativity() {
        assert!(Operator::Plus.is_commutative());
        assert!(Operator::BitXor.is_commutative());
        assert!(!Operator::Minus.is_commutative());
        assert!(!Operator::LessUns.is_commutative());
    }

    #[test]
    fn test_display() {
        assert_eq!(Operator::LessUns.to_string(), "<u");
        assert_eq!(Operator::NotEquals.to_string(), "~=");
        assert_eq!(Operator::Shra.to_string(), ">>A");
    }
}
