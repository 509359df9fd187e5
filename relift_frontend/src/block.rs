//! Low-level basic blocks
//!
//! A block is either complete (instructions and type known) or incomplete
//! (forward-declared by a jump to an address we have not decoded yet). The
//! block's identity is its low address; edges are stored as addresses.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use relift_common::Address;
use relift_ir::FlowKind;

use crate::decoder::MachineInstruction;

/// A basic block of machine instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    lo: Address,
    kind: FlowKind,
    insns: Vec<MachineInstruction>,
    complete: bool,
    pub successors: SmallVec<[Address; 2]>,
    pub predecessors: SmallVec<[Address; 4]>,
    /// Entry address of the owning procedure, once assigned.
    pub proc: Option<Address>,
}

impl BasicBlock {
    /// A forward-declared block: address known, contents not yet decoded.
    pub fn incomplete(lo: Address) -> Self {
        Self {
            lo,
            kind: FlowKind::Invalid,
            insns: Vec::new(),
            complete: false,
            successors: SmallVec::new(),
            predecessors: SmallVec::new(),
            proc: None,
        }
    }

    pub fn new(kind: FlowKind, insns: Vec<MachineInstruction>) -> Self {
        debug_assert!(!insns.is_empty());
        let lo = insns[0].addr;
        Self {
            lo,
            kind,
            insns,
            complete: true,
            successors: SmallVec::new(),
            predecessors: SmallVec::new(),
            proc: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Fill in a previously incomplete block.
    pub fn complete_with(&mut self, insns: Vec<MachineInstruction>, kind: FlowKind) {
        debug_assert!(!insns.is_empty());
        debug_assert_eq!(insns[0].addr, self.lo);
        self.insns = insns;
        self.kind = kind;
        self.complete = true;
    }

    pub fn lo(&self) -> Address {
        self.lo
    }

    /// One past the last instruction. Incomplete blocks have an empty
    /// range.
    pub fn hi(&self) -> Address {
        match self.insns.last() {
            Some(last) => last.addr + last.size as u64,
            None => self.lo,
        }
    }

    pub fn contains_addr(&self, addr: Address) -> bool {
        self.lo <= addr && addr < self.hi()
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: FlowKind) {
        self.kind = kind;
    }

    pub fn insns(&self) -> &[MachineInstruction] {
        &self.insns
    }

    /// Detach and return the instructions from `idx` onward.
    pub fn split_insns(&mut self, idx: usize) -> Vec<MachineInstruction> {
        self.insns.split_off(idx)
    }

    pub fn num_successors(&self) -> usize {
        self.successors.len()
    }

    pub fn num_predecessors(&self) -> usize {
        self.predecessors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(addr: u64, size: u32) -> MachineInstruction {
        MachineInstruction::new(Address(addr), size, "insn")
    }

    #[test]
    fn test_bounds() {
        let bb = BasicBlock::new(FlowKind::Fall, vec![insn(0x1000, 4), insn(0x1004, 4)]);
        assert_eq!(bb.lo(), Address(0x1000));
        assert_eq!(bb.hi(), Address(0x1008));
        assert!(bb.contains_addr(Address(0x1004)));
        assert!(!bb.contains_addr(Address(0x1008)));
    }

    #[test]
    fn test_incomplete_block() {
        let mut bb = BasicBlock::incomplete(Address(0x2000));
        assert!(!bb.is_complete());
        assert_eq!(bb.hi(), bb.lo());
        assert_eq!(bb.kind(), FlowKind::Invalid);

        bb.complete_with(vec![insn(0x2000, 2)], FlowKind::Ret);
        assert!(bb.is_complete());
        assert_eq!(bb.hi(), Address(0x2002));
        assert_eq!(bb.kind(), FlowKind::Ret);
    }

    #[test]
    fn test_split_insns() {
        let mut bb = BasicBlock::new(
            FlowKind::Oneway,
            vec![insn(0x1000, 4), insn(0x1004, 4), insn(0x1008, 4)],
        );
        let tail = bb.split_insns(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].addr, Address(0x1004));
        assert_eq!(bb.insns().len(), 1);
        assert_eq!(bb.hi(), Address(0x1004));
    }
}
