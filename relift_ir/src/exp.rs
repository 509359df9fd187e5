//! Symbolic expression algebra over CPU-level operands
//!
//! Expressions are value types: transformations build new trees rather than
//! mutating in place. SSA subscripts are represented by [`Exp::Ref`], which
//! carries the identity of the defining statement (or `None` for the
//! implicit "value on entry" sentinel, printed `{-}`).

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::operator::Operator;
use crate::stmt::StatementId;

/// A constant operand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Const {
    Int(i64),
    Flt(f64),
    Str(String),
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Flt(a), Const::Flt(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl PartialOrd for Const {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Const {
    fn cmp(&self, other: &Self) -> Ordering {
        use Const::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Flt(a), Flt(b)) => a.total_cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Int(_), _) => Ordering::Less,
            (_, Int(_)) => Ordering::Greater,
            (Flt(_), _) => Ordering::Less,
            (_, Flt(_)) => Ordering::Greater,
        }
    }
}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Const::Int(v) => v.hash(state),
            Const::Flt(v) => v.to_bits().hash(state),
            Const::Str(s) => s.hash(state),
        }
    }
}

/// Symbolic terminals such as `%flags` or `%CF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Terminal {
    Pc,
    Flags,
    FFlags,
    CF,
    ZF,
    NF,
    OF,
    DF,
    Nil,
}

impl Terminal {
    /// One of the individually named flag terminals (`%CF`, `%ZF`, ...).
    pub fn is_main_flag(self) -> bool {
        matches!(
            self,
            Terminal::CF | Terminal::ZF | Terminal::NF | Terminal::OF | Terminal::DF
        )
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Terminal::Pc => "%pc",
            Terminal::Flags => "%flags",
            Terminal::FFlags => "%fflags",
            Terminal::CF => "%CF",
            Terminal::ZF => "%ZF",
            Terminal::NF => "%NF",
            Terminal::OF => "%OF",
            Terminal::DF => "%DF",
            Terminal::Nil => "%nil",
        };
        write!(f, "{}", s)
    }
}

/// The kinds of addressable locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LocKind {
    RegOf,
    MemOf,
    Temp,
    Local,
    Global,
    Param,
}

/// A symbolic expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exp {
    Const(Const),
    Terminal(Terminal),
    Unary(Operator, Box<Exp>),
    Binary(Operator, Box<Exp>, Box<Exp>),
    Ternary(Operator, Box<Exp>, Box<Exp>, Box<Exp>),
    Loc(LocKind, Box<Exp>),
    Ref {
        base: Box<Exp>,
        def: Option<StatementId>,
    },
}

// Ordering is what makes location-set dumps deterministic: operator trees
// first, then locations (registers before memory), then subscripted
// locations, then constants and terminals.
impl Exp {
    fn rank(&self) -> u8 {
        match self {
            Exp::Unary(..) => 10,
            Exp::Binary(..) => 11,
            Exp::Ternary(..) => 12,
            Exp::Loc(LocKind::RegOf, _) => 20,
            Exp::Loc(LocKind::MemOf, _) => 21,
            Exp::Loc(LocKind::Temp, _) => 22,
            Exp::Loc(LocKind::Local, _) => 23,
            Exp::Loc(LocKind::Global, _) => 24,
            Exp::Loc(LocKind::Param, _) => 25,
            Exp::Ref { .. } => 30,
            Exp::Const(_) => 40,
            Exp::Terminal(_) => 50,
        }
    }
}

impl PartialOrd for Exp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Exp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank()).then_with(|| match (self, other) {
            (Exp::Const(a), Exp::Const(b)) => a.cmp(b),
            (Exp::Terminal(a), Exp::Terminal(b)) => a.cmp(b),
            (Exp::Unary(op1, a1), Exp::Unary(op2, a2)) => op1.cmp(op2).then_with(|| a1.cmp(a2)),
            (Exp::Binary(op1, a1, b1), Exp::Binary(op2, a2, b2)) => {
                op1.cmp(op2).then_with(|| a1.cmp(a2)).then_with(|| b1.cmp(b2))
            }
            (Exp::Ternary(op1, a1, b1, c1), Exp::Ternary(op2, a2, b2, c2)) => op1
                .cmp(op2)
                .then_with(|| a1.cmp(a2))
                .then_with(|| b1.cmp(b2))
                .then_with(|| c1.cmp(c2)),
            (Exp::Loc(k1, a1), Exp::Loc(k2, a2)) => k1.cmp(k2).then_with(|| a1.cmp(a2)),
            (Exp::Ref { base: b1, def: d1 }, Exp::Ref { base: b2, def: d2 }) => {
                b1.cmp(b2).then_with(|| d1.cmp(d2))
            }
            _ => Ordering::Equal,
        })
    }
}

impl Exp {
    // Constructors

    pub fn int(v: i64) -> Exp {
        Exp::Const(Const::Int(v))
    }

    pub fn flt(v: f64) -> Exp {
        Exp::Const(Const::Flt(v))
    }

    pub fn str_const(s: impl Into<String>) -> Exp {
        Exp::Const(Const::Str(s.into()))
    }

    pub fn terminal(t: Terminal) -> Exp {
        Exp::Terminal(t)
    }

    pub fn nil() -> Exp {
        Exp::Terminal(Terminal::Nil)
    }

    /// The register location `r<n>`.
    pub fn reg(n: i64) -> Exp {
        Exp::Loc(LocKind::RegOf, Box::new(Exp::int(n)))
    }

    /// The memory location `m[addr]`.
    pub fn mem(addr: Exp) -> Exp {
        Exp::Loc(LocKind::MemOf, Box::new(addr))
    }

    pub fn temp(name: impl Into<String>) -> Exp {
        Exp::Loc(LocKind::Temp, Box::new(Exp::str_const(name)))
    }

    pub fn local(name: impl Into<String>) -> Exp {
        Exp::Loc(LocKind::Local, Box::new(Exp::str_const(name)))
    }

    pub fn global(name: impl Into<String>) -> Exp {
        Exp::Loc(LocKind::Global, Box::new(Exp::str_const(name)))
    }

    pub fn param(name: impl Into<String>) -> Exp {
        Exp::Loc(LocKind::Param, Box::new(Exp::str_const(name)))
    }

    pub fn unary(op: Operator, a: Exp) -> Exp {
        Exp::Unary(op, Box::new(a))
    }

    pub fn binary(op: Operator, a: Exp, b: Exp) -> Exp {
        Exp::Binary(op, Box::new(a), Box::new(b))
    }

    pub fn ternary(op: Operator, a: Exp, b: Exp, c: Exp) -> Exp {
        Exp::Ternary(op, Box::new(a), Box::new(b), Box::new(c))
    }

    /// The address-of wrapper `a[e]`.
    pub fn addr_of(e: Exp) -> Exp {
        Exp::unary(Operator::AddrOf, e)
    }

    /// Subscript `base{def}`.
    pub fn ref_to(base: Exp, def: StatementId) -> Exp {
        Exp::Ref { base: Box::new(base), def: Some(def) }
    }

    /// The implicit subscript `base{-}`.
    pub fn implicit_ref(base: Exp) -> Exp {
        Exp::Ref { base: Box::new(base), def: None }
    }

    /// A flag function application, e.g. `SUBFLAGS(a, b, c)`. The argument
    /// list is a cons chain of [`Operator::List`] nodes terminated by
    /// `%nil`, which keeps positional access uniform.
    pub fn flag_call(name: impl Into<String>, args: Vec<Exp>) -> Exp {
        Exp::binary(Operator::FlagCall, Exp::str_const(name), Exp::list_of(args))
    }

    pub fn list_of(items: Vec<Exp>) -> Exp {
        let mut e = Exp::nil();
        for item in items.into_iter().rev() {
            e = Exp::binary(Operator::List, item, e);
        }
        e
    }

    // Accessors

    pub fn op(&self) -> Option<Operator> {
        match self {
            Exp::Unary(op, _) | Exp::Binary(op, _, _) | Exp::Ternary(op, _, _, _) => Some(*op),
            _ => None,
        }
    }

    pub fn sub1(&self) -> Option<&Exp> {
        match self {
            Exp::Unary(_, a) | Exp::Binary(_, a, _) | Exp::Ternary(_, a, _, _) => Some(a),
            Exp::Loc(_, a) => Some(a),
            Exp::Ref { base, .. } => Some(base),
            _ => None,
        }
    }

    pub fn sub2(&self) -> Option<&Exp> {
        match self {
            Exp::Binary(_, _, b) | Exp::Ternary(_, _, b, _) => Some(b),
            _ => None,
        }
    }

    pub fn sub3(&self) -> Option<&Exp> {
        match self {
            Exp::Ternary(_, _, _, c) => Some(c),
            _ => None,
        }
    }

    pub fn children(&self) -> Vec<&Exp> {
        match self {
            Exp::Const(_) | Exp::Terminal(_) => vec![],
            Exp::Unary(_, a) | Exp::Loc(_, a) => vec![a],
            Exp::Binary(_, a, b) => vec![a, b],
            Exp::Ternary(_, a, b, c) => vec![a, b, c],
            Exp::Ref { base, .. } => vec![base],
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Exp::Const(Const::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Exp::Const(Const::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// The register number of a `r<n>` location.
    pub fn reg_num(&self) -> Option<i64> {
        match self {
            Exp::Loc(LocKind::RegOf, inner) => inner.as_int(),
            _ => None,
        }
    }

    pub fn ref_base(&self) -> Option<&Exp> {
        match self {
            Exp::Ref { base, .. } => Some(base),
            _ => None,
        }
    }

    pub fn ref_def(&self) -> Option<StatementId> {
        match self {
            Exp::Ref { def, .. } => *def,
            _ => None,
        }
    }

    /// The name of a flag call, e.g. `"SUBFLAGS"`.
    pub fn flag_call_name(&self) -> Option<&str> {
        match self {
            Exp::Binary(Operator::FlagCall, name, _) => name.as_str(),
            _ => None,
        }
    }

    /// The positional arguments of a flag call.
    pub fn flag_call_args(&self) -> Option<Vec<&Exp>> {
        match self {
            Exp::Binary(Operator::FlagCall, _, args) => Some(args.list_items()),
            _ => None,
        }
    }

    /// Flatten a `List` cons chain into its items.
    pub fn list_items(&self) -> Vec<&Exp> {
        let mut items = Vec::new();
        let mut cur = self;
        while let Exp::Binary(Operator::List, head, tail) = cur {
            items.push(head.as_ref());
            cur = tail;
        }
        items
    }

    // Predicates

    pub fn is_const(&self) -> bool {
        matches!(self, Exp::Const(_))
    }

    pub fn is_int_const(&self) -> bool {
        matches!(self, Exp::Const(Const::Int(_)))
    }

    pub fn is_location(&self) -> bool {
        matches!(self, Exp::Loc(..))
    }

    pub fn is_reg_of(&self) -> bool {
        matches!(self, Exp::Loc(LocKind::RegOf, _))
    }

    pub fn is_mem_of(&self) -> bool {
        matches!(self, Exp::Loc(LocKind::MemOf, _))
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Exp::Loc(LocKind::Temp, _))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Exp::Loc(LocKind::Local, _))
    }

    pub fn is_flags(&self) -> bool {
        matches!(self, Exp::Terminal(Terminal::Flags) | Exp::Terminal(Terminal::FFlags))
    }

    pub fn is_main_flag(&self) -> bool {
        matches!(self, Exp::Terminal(t) if t.is_main_flag())
    }

    pub fn is_pc(&self) -> bool {
        matches!(self, Exp::Terminal(Terminal::Pc))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Exp::Terminal(Terminal::Nil))
    }

    pub fn is_flag_call(&self) -> bool {
        matches!(self, Exp::Binary(Operator::FlagCall, _, _))
    }

    pub fn is_subscript(&self) -> bool {
        matches!(self, Exp::Ref { .. })
    }

    pub fn is_implicit_ref(&self) -> bool {
        matches!(self, Exp::Ref { def: None, .. })
    }

    pub fn is_addr_of(&self) -> bool {
        matches!(self, Exp::Unary(Operator::AddrOf, _))
    }

    /// True if any subexpression is the `%flags`/`%fflags` soup terminal.
    pub fn contains_flags(&self) -> bool {
        if self.is_flags() {
            return true;
        }
        self.children().iter().any(|c| c.contains_flags())
    }

    /// True if the expression contains a memory access that is not
    /// subscripted. Propagating such an expression could carry a read past
    /// a definition of the same memory, invalidating the IR.
    pub fn contains_bad_mem_of(&self) -> bool {
        match self {
            Exp::Ref { base, .. } => match base.as_ref() {
                // The memof itself is subscripted, but its address may
                // still hide a bare one.
                Exp::Loc(LocKind::MemOf, addr) => addr.contains_bad_mem_of(),
                other => other.contains_bad_mem_of(),
            },
            Exp::Loc(LocKind::MemOf, _) => true,
            other => other.children().iter().any(|c| c.contains_bad_mem_of()),
        }
    }

    /// Operator nesting depth, used to gate propagation of expensive
    /// subexpressions. Plain registers, temps and named locations count as
    /// atoms; memory accesses and operators add a level.
    pub fn complexity_depth(&self) -> usize {
        match self {
            Exp::Const(_) | Exp::Terminal(_) => 0,
            Exp::Ref { base, .. } => base.complexity_depth(),
            Exp::Loc(LocKind::MemOf, addr) => 1 + addr.complexity_depth(),
            Exp::Loc(_, _) => 0,
            Exp::Unary(_, a) => 1 + a.complexity_depth(),
            Exp::Binary(_, a, b) => 1 + a.complexity_depth().max(b.complexity_depth()),
            Exp::Ternary(_, a, b, c) => {
                1 + a.complexity_depth().max(b.complexity_depth()).max(c.complexity_depth())
            }
        }
    }

    // Search and replace

    /// Find the first subexpression structurally equal to `pattern`.
    pub fn search(&self, pattern: &Exp) -> Option<&Exp> {
        if self == pattern {
            return Some(self);
        }
        self.children().into_iter().find_map(|c| c.search(pattern))
    }

    /// Collect all subexpressions structurally equal to `pattern`.
    pub fn search_all<'a>(&'a self, pattern: &Exp, results: &mut Vec<&'a Exp>) {
        if self == pattern {
            results.push(self);
        }
        for c in self.children() {
            c.search_all(pattern, results);
        }
    }

    /// Replace every subexpression equal to `pattern` with `replacement`.
    /// Returns the rebuilt tree and whether anything changed.
    pub fn search_replace_all(&self, pattern: &Exp, replacement: &Exp) -> (Exp, bool) {
        if self == pattern {
            return (replacement.clone(), true);
        }
        let mut changed = false;
        let out = self.clone().map_children(&mut |c: Exp| {
            let (new, ch) = c.search_replace_all(pattern, replacement);
            changed |= ch;
            new
        });
        (out, changed)
    }

    /// Rebuild this node with each direct child passed through `f`.
    pub fn map_children(self, f: &mut impl FnMut(Exp) -> Exp) -> Exp {
        match self {
            Exp::Const(_) | Exp::Terminal(_) => self,
            Exp::Unary(op, a) => Exp::Unary(op, Box::new(f(*a))),
            Exp::Binary(op, a, b) => Exp::Binary(op, Box::new(f(*a)), Box::new(f(*b))),
            Exp::Ternary(op, a, b, c) => {
                Exp::Ternary(op, Box::new(f(*a)), Box::new(f(*b)), Box::new(f(*c)))
            }
            Exp::Loc(kind, a) => Exp::Loc(kind, Box::new(f(*a))),
            Exp::Ref { base, def } => Exp::Ref { base: Box::new(f(*base)), def },
        }
    }

    // Visitation

    /// Walk the tree in pre/post order. The visitor may clear the
    /// visit-children flag to skip a subtree.
    pub fn accept<V: ExpVisitor + ?Sized>(&self, v: &mut V) {
        let mut visit_children = true;
        v.open(self, &mut visit_children);
        if visit_children {
            for c in self.children() {
                c.accept(v);
            }
        }
        v.close(self);
    }

    /// Rebuild the tree through a modifier. The modifier may clear the
    /// visit-children flag in `open` to keep a subtree as returned.
    pub fn accept_modifier<M: ExpModifier + ?Sized>(self, m: &mut M) -> Exp {
        let mut visit_children = true;
        let e = m.open(self, &mut visit_children);
        let e = if visit_children {
            e.map_children(&mut |c| c.accept_modifier(m))
        } else {
            e
        };
        m.close(e)
    }

    fn print_prec(&self, f: &mut fmt::Formatter<'_>, parent_prec: u8, rightmost: bool) -> fmt::Result {
        match self {
            Exp::Const(Const::Int(v)) => {
                if *v >= 1000 {
                    write!(f, "{:#x}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Exp::Const(Const::Flt(v)) => write!(f, "{}", v),
            Exp::Const(Const::Str(s)) => write!(f, "{}", s),
            Exp::Terminal(t) => write!(f, "{}", t),
            Exp::Unary(Operator::AddrOf, a) => write!(f, "a[{}]", a),
            Exp::Unary(Operator::LogNot, a) => {
                write!(f, "not ")?;
                a.print_prec(f, 10, true)
            }
            Exp::Unary(op, a) => {
                write!(f, "{}", op)?;
                a.print_prec(f, 10, true)
            }
            Exp::Binary(Operator::FlagCall, name, args) => {
                name.print_prec(f, 0, false)?;
                write!(f, "(")?;
                let items = args.list_items();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Exp::Binary(Operator::List, _, _) => {
                let items = self.list_items();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Exp::Binary(op, a, b) => {
                let prec = op.precedence();
                let parens = prec < parent_prec || (prec == parent_prec && rightmost);
                if parens {
                    write!(f, "(")?;
                }
                a.print_prec(f, prec, false)?;
                write!(f, " {} ", op)?;
                b.print_prec(f, prec, true)?;
                if parens {
                    write!(f, ")")?;
                }
                Ok(())
            }
            Exp::Ternary(_, a, b, c) => {
                write!(f, "(")?;
                a.print_prec(f, 0, false)?;
                write!(f, " ? ")?;
                b.print_prec(f, 0, false)?;
                write!(f, " : ")?;
                c.print_prec(f, 0, false)?;
                write!(f, ")")
            }
            Exp::Loc(LocKind::RegOf, inner) => match inner.as_int() {
                Some(n) => write!(f, "r{}", n),
                None => write!(f, "r[{}]", inner),
            },
            Exp::Loc(LocKind::MemOf, inner) => write!(f, "m[{}]", inner),
            Exp::Loc(LocKind::Temp, inner)
            | Exp::Loc(LocKind::Local, inner)
            | Exp::Loc(LocKind::Global, inner)
            | Exp::Loc(LocKind::Param, inner) => match inner.as_str() {
                Some(name) => write!(f, "{}", name),
                None => write!(f, "{}", inner),
            },
            Exp::Ref { base, def } => {
                base.print_prec(f, 10, false)?;
                match def {
                    Some(id) => write!(f, "{{{}}}", id),
                    None => write!(f, "{{-}}"),
                }
            }
        }
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print_prec(f, 0, false)
    }
}

/// Read-only expression visitor with an explicit visit-children flag.
pub trait ExpVisitor {
    fn open(&mut self, e: &Exp, visit_children: &mut bool);
    fn close(&mut self, _e: &Exp) {}
}

/// Rebuilding expression visitor with an explicit visit-children flag.
pub trait ExpModifier {
    fn open(&mut self, e: Exp, _visit_children: &mut bool) -> Exp {
        e
    }
    fn close(&mut self, e: Exp) -> Exp {
        e
    }
}
