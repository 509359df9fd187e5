//! Procedures, fragments and the program container
//!
//! A fragment is a maximal straight-line region of IR statements ending in
//! a control transfer; it is the unit SSA construction works on. The
//! program owns the statement identity allocator, so identities stay unique
//! across every procedure.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use relift_common::{Address, ReliftError, ReliftResult};

use crate::exp::Exp;
use crate::operator::Operator;
use crate::rtl::Rtl;
use crate::stmt::{Statement, StatementId, StatementIdAllocator};

/// Dense per-procedure fragment index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FragmentId(pub u32);

impl FragmentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How control leaves a block or fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKind {
    /// Placeholder for blocks that are not yet complete.
    Invalid,
    Fall,
    Oneway,
    Twoway,
    Nway,
    Call,
    Ret,
    CompJump,
    CompCall,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowKind::Invalid => "invalid",
            FlowKind::Fall => "fall",
            FlowKind::Oneway => "oneway",
            FlowKind::Twoway => "twoway",
            FlowKind::Nway => "nway",
            FlowKind::Call => "call",
            FlowKind::Ret => "ret",
            FlowKind::CompJump => "compjump",
            FlowKind::CompCall => "compcall",
        };
        write!(f, "{}", s)
    }
}

/// A straight-line region of RTLs with its control-flow edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub kind: FlowKind,
    pub rtls: Vec<Rtl>,
    pub successors: SmallVec<[FragmentId; 2]>,
    pub predecessors: SmallVec<[FragmentId; 4]>,
}

impl Fragment {
    pub fn low_addr(&self) -> Option<Address> {
        self.rtls.first().map(|r| r.addr)
    }

    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.rtls.iter().flat_map(|r| r.stmts.iter())
    }

    pub fn statements_mut(&mut self) -> impl Iterator<Item = &mut Statement> {
        self.rtls.iter_mut().flat_map(|r| r.stmts.iter_mut())
    }

    pub fn first_stmt(&self) -> Option<&Statement> {
        self.statements().next()
    }

    pub fn last_stmt(&self) -> Option<&Statement> {
        self.rtls.iter().rev().flat_map(|r| r.stmts.iter().rev()).next()
    }

    /// The phi assignments at the top of this fragment.
    pub fn phis(&self) -> impl Iterator<Item = &Statement> {
        self.statements().take_while(|s| s.is_phi())
    }

    pub fn phis_mut(&mut self) -> impl Iterator<Item = &mut Statement> {
        self.statements_mut().take_while(|s| s.is_phi())
    }

    /// Insert a trivial phi function `lhs := phi()` at the top of the
    /// fragment and return its identity.
    pub fn add_phi(&mut self, lhs: Exp, alloc: &mut StatementIdAllocator) -> StatementId {
        let id = alloc.alloc();
        let addr = self.low_addr().unwrap_or(Address::ZERO);
        if self.rtls.is_empty() {
            self.rtls.push(Rtl::new(addr));
        }
        self.rtls[0].stmts.insert(0, Statement::phi(id, lhs));
        id
    }

    /// Remove all phi functions from this fragment.
    pub fn clear_phis(&mut self) {
        for rtl in &mut self.rtls {
            rtl.stmts.retain(|s| !s.is_phi());
        }
    }

    /// Drop statements matching the predicate.
    pub fn retain_statements(&mut self, mut keep: impl FnMut(&Statement) -> bool) {
        for rtl in &mut self.rtls {
            rtl.stmts.retain(|s| keep(s));
        }
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rtl in &self.rtls {
            write!(f, "{}", rtl)?;
        }
        Ok(())
    }
}

/// Per-procedure control-flow graph over fragments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcCfg {
    fragments: Vec<Fragment>,
    entry: Option<FragmentId>,
}

impl ProcCfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fragment(&mut self, kind: FlowKind, rtls: Vec<Rtl>) -> FragmentId {
        let id = FragmentId(self.fragments.len() as u32);
        self.fragments.push(Fragment {
            id,
            kind,
            rtls,
            successors: SmallVec::new(),
            predecessors: SmallVec::new(),
        });
        id
    }

    pub fn num_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn frag(&self, id: FragmentId) -> Option<&Fragment> {
        self.fragments.get(id.index())
    }

    pub fn frag_mut(&mut self, id: FragmentId) -> Option<&mut Fragment> {
        self.fragments.get_mut(id.index())
    }

    pub fn set_entry(&mut self, id: FragmentId) {
        self.entry = Some(id);
    }

    pub fn entry_fragment(&self) -> Option<FragmentId> {
        self.entry
    }

    pub fn add_edge(&mut self, from: FragmentId, to: FragmentId) {
        if let Some(f) = self.fragments.get_mut(from.index()) {
            f.successors.push(to);
        }
        if let Some(t) = self.fragments.get_mut(to.index()) {
            t.predecessors.push(from);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Fragment> {
        self.fragments.iter_mut()
    }

    /// Check edge symmetry and index validity. Violations are fatal for
    /// the owning procedure.
    pub fn check_integrity(&self, proc_name: &str) -> ReliftResult<()> {
        let n = self.fragments.len();
        if n > 0 && self.entry.is_none() {
            return Err(ReliftError::cfg_integrity(proc_name, "no entry fragment"));
        }
        for frag in &self.fragments {
            for succ in &frag.successors {
                let Some(s) = self.frag(*succ) else {
                    return Err(ReliftError::cfg_integrity(
                        proc_name,
                        format!("fragment {} has out-of-range successor {}", frag.id, succ),
                    ));
                };
                if !s.predecessors.contains(&frag.id) {
                    return Err(ReliftError::cfg_integrity(
                        proc_name,
                        format!("edge {} -> {} is not symmetric", frag.id, succ),
                    ));
                }
            }
            for pred in &frag.predecessors {
                let Some(p) = self.frag(*pred) else {
                    return Err(ReliftError::cfg_integrity(
                        proc_name,
                        format!("fragment {} has out-of-range predecessor {}", frag.id, pred),
                    ));
                };
                if !p.successors.contains(&frag.id) {
                    return Err(ReliftError::cfg_integrity(
                        proc_name,
                        format!("edge {} -> {} is not symmetric", pred, frag.id),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// True when `e` is a memory access whose address is the stack pointer
/// plus or minus a constant, possibly through a subscript.
pub fn is_stack_local_pattern(e: &Exp, sp_reg: i64) -> bool {
    let Exp::Loc(_, addr) = e else {
        return false;
    };
    if !e.is_mem_of() {
        return false;
    }
    let is_sp = |e: &Exp| -> bool {
        match e {
            Exp::Ref { base, .. } => base.reg_num() == Some(sp_reg),
            other => other.reg_num() == Some(sp_reg),
        }
    };
    match addr.as_ref() {
        e if is_sp(e) => true,
        Exp::Binary(Operator::Plus | Operator::Minus, base, off) => {
            is_sp(base) && off.is_int_const()
        }
        _ => false,
    }
}

/// A procedure under decompilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    pub entry_addr: Address,
    pub cfg: ProcCfg,
    /// Stack pointer register of the target, used by the local-or-param
    /// pattern test.
    pub sp_reg: i64,
}

impl Procedure {
    pub fn new(name: impl Into<String>, entry_addr: Address) -> Self {
        Self { name: name.into(), entry_addr, cfg: ProcCfg::new(), sp_reg: 28 }
    }

    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.cfg.iter().flat_map(|f| f.statements())
    }

    pub fn statements_mut(&mut self) -> impl Iterator<Item = &mut Statement> {
        self.cfg.iter_mut().flat_map(|f| f.statements_mut())
    }

    pub fn find_statement(&self, id: StatementId) -> Option<&Statement> {
        self.statements().find(|s| s.id() == id)
    }

    /// True when `e` is a memory access whose address follows the
    /// stack-local or parameter pattern (`m[sp +- k]`).
    pub fn is_local_or_param_pattern(&self, e: &Exp) -> bool {
        is_stack_local_pattern(e, self.sp_reg)
    }

    /// Print all statements in fragment order, one RTL per line group.
    pub fn print_listing(&self) -> String {
        let mut out = String::new();
        for frag in self.cfg.iter() {
            out.push_str(&frag.to_string());
        }
        out
    }
}

/// The program: the shared root owning procedures and the statement
/// identity counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub procs: IndexMap<Address, Procedure>,
    pub ids: StatementIdAllocator,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procs: IndexMap::new(),
            // Id 0 is reserved so printed statement numbers start at 1
            ids: StatementIdAllocator::starting_at(1),
        }
    }

    pub fn add_proc(&mut self, proc: Procedure) {
        self.procs.insert(proc.entry_addr, proc);
    }

    pub fn proc_at(&self, addr: Address) -> Option<&Procedure> {
        self.procs.get(&addr)
    }

    pub fn proc_at_mut(&mut self, addr: Address) -> Option<&mut Procedure> {
        self.procs.get_mut(&addr)
    }

    /// Renumber all statements densely in program order, rewriting every
    /// reference to match. Printable numbers stay small after heavy
    /// rewriting has retired many identities.
    pub fn number_statements(&mut self) {
        let mut map: HashMap<StatementId, StatementId> = HashMap::new();
        let mut next = 1u32;
        for proc in self.procs.values() {
            for stmt in proc.statements() {
                map.insert(stmt.id(), StatementId(next));
                next += 1;
            }
        }

        for proc in self.procs.values_mut() {
            for stmt in proc.statements_mut() {
                let old = stmt.id();
                stmt.rewrite_refs(&mut |id| map.get(&id).copied());
                if let Some(new) = map.get(&old) {
                    stmt.set_id(*new);
                }
            }
        }

        self.ids = StatementIdAllocator::starting_at(next);
    }
}
