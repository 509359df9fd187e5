//! The low-level control flow graph
//!
//! Blocks are keyed by their low address. Discovery is incremental: jumps
//! forward-declare incomplete blocks, and a jump into the middle of an
//! already-decoded block splits it. The invariants kept here are that the
//! map key always equals the block's low address and that no two complete
//! blocks overlap.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};

use serde::{Deserialize, Serialize};

use relift_common::Address;
use relift_ir::FlowKind;

use crate::block::BasicBlock;
use crate::decoder::MachineInstruction;

/// The per-image basic block map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LowLevelCfg {
    blocks: BTreeMap<Address, BasicBlock>,
}

impl LowLevelCfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_bbs(&self) -> usize {
        self.blocks.len()
    }

    pub fn bb_at(&self, addr: Address) -> Option<&BasicBlock> {
        self.blocks.get(&addr)
    }

    pub fn bb_at_mut(&mut self, addr: Address) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn is_start_of_bb(&self, addr: Address) -> bool {
        self.blocks.contains_key(&addr)
    }

    pub fn is_start_of_complete_bb(&self, addr: Address) -> bool {
        self.blocks.get(&addr).map(|b| b.is_complete()).unwrap_or(false)
    }

    /// Create or complete a block from the given instructions.
    ///
    /// Returns `None` when a complete block already starts at the same
    /// address; the caller must not wire out edges in that case. On
    /// overlap with the following block the new block is truncated into a
    /// fall-through, and the following block's address is returned if it
    /// was completed by the split.
    pub fn create_bb(
        &mut self,
        kind: FlowKind,
        insns: Vec<MachineInstruction>,
    ) -> Option<Address> {
        assert!(!insns.is_empty());
        let start = insns[0].addr;

        match self.blocks.get_mut(&start) {
            Some(bb) if bb.is_complete() => {
                // Forward jumps into the middle of a loop produce this;
                // not an error.
                log::debug!("not creating a BB at {}: complete BB already exists", start);
                return None;
            }
            Some(bb) => bb.complete_with(insns, kind),
            None => {
                self.blocks.insert(start, BasicBlock::new(kind, insns));
            }
        }

        // A previously decoded block may run over our start address; split
        // it so block starts stay unique.
        let prev = self
            .blocks
            .range(..start)
            .next_back()
            .map(|(a, b)| (*a, b.is_complete(), b.hi()));
        if let Some((prev_addr, true, prev_hi)) = prev {
            if prev_hi > start {
                self.split_bb(prev_addr, start);
                return Some(start);
            }
        }

        // Conversely, our new block may run over the start of the next
        // one. Truncate to a fall-through.
        let cur_hi = self.blocks[&start].hi();
        let next = self
            .blocks
            .range((Excluded(start), Unbounded))
            .next()
            .map(|(a, b)| (*a, b.is_complete()));
        if let Some((next_addr, next_complete)) = next {
            if next_addr < cur_hi {
                self.split_bb(start, next_addr);
                if !next_complete {
                    // The split completed the overlapped block; hand it
                    // back so out edges can be added.
                    return Some(next_addr);
                }
                log::debug!("not creating a BB at {}: overlap with existing BB", next_addr);
                return None;
            }
        }

        Some(start)
    }

    /// Forward-declare a block at `lo`.
    pub fn create_incomplete_bb(&mut self, lo: Address) -> Address {
        self.blocks.entry(lo).or_insert_with(|| BasicBlock::incomplete(lo));
        lo
    }

    /// Guarantee a block boundary at `addr`.
    ///
    /// Returns true if `addr` lies within an existing complete block
    /// (which is split as needed); false if a new incomplete block was
    /// created or the covering block is still incomplete. When a split
    /// occurs and `curr_bb` pointed at the block being split, it is
    /// rewritten to the tail block.
    pub fn ensure_bb_exists(&mut self, addr: Address, curr_bb: &mut Address) -> bool {
        let overlapping = if self.blocks.contains_key(&addr) {
            Some(addr)
        } else {
            self.blocks
                .range(..addr)
                .next_back()
                .filter(|(_, bb)| bb.contains_addr(addr))
                .map(|(a, _)| *a)
        };

        let Some(lo) = overlapping else {
            self.create_incomplete_bb(addr);
            return false;
        };

        if !self.blocks[&lo].is_complete() {
            return false;
        }

        if lo < addr {
            self.split_bb(lo, addr);
            if *curr_bb == lo {
                // The block we were about to attach out edges to has been
                // split; the tail is now the interesting part.
                *curr_bb = addr;
            }
            return true;
        }

        // addr is the start of a complete block
        true
    }

    /// Split the block at `at` so that a new block boundary exists at
    /// `split_addr`. Returns the tail block's address, or `at` unchanged
    /// when `split_addr` does not fall on an instruction boundary.
    pub fn split_bb(&mut self, at: Address, split_addr: Address) -> Address {
        let Some(head) = self.blocks.get(&at) else {
            return at;
        };
        let Some(idx) = head.insns().iter().position(|i| i.addr == split_addr) else {
            // Jump into the middle of an instruction; fail gracefully.
            log::warn!("cannot split BB at {} at split address {}", at, split_addr);
            return at;
        };

        // Detach the tail instructions and the head's edges.
        let (tail_insns, head_kind, head_succs) = {
            let head = self.blocks.get_mut(&at).unwrap();
            let tail_insns = head.split_insns(idx);
            let kind = head.kind();
            let succs = std::mem::take(&mut head.successors);
            head.set_kind(FlowKind::Fall);
            (tail_insns, kind, succs)
        };

        let tail_exists_complete =
            self.blocks.get(&split_addr).map(|b| b.is_complete()).unwrap_or(false);

        if tail_exists_complete {
            // The tail range was already discovered separately; the
            // detached duplicate instructions are discarded and the
            // existing block keeps its own out edges.
            for succ in &head_succs {
                if let Some(s) = self.blocks.get_mut(succ) {
                    s.predecessors.retain(|p| *p != at);
                }
            }
        } else {
            let proc = self.blocks[&at].proc;
            {
                let tail = self
                    .blocks
                    .entry(split_addr)
                    .or_insert_with(|| BasicBlock::incomplete(split_addr));
                tail.complete_with(tail_insns, head_kind);
                tail.proc = proc;
                // The tail inherits the head's original out edges.
                tail.successors = head_succs.clone();
            }
            for succ in &head_succs {
                if let Some(s) = self.blocks.get_mut(succ) {
                    for p in s.predecessors.iter_mut() {
                        if *p == at {
                            *p = split_addr;
                        }
                    }
                }
            }
        }

        self.add_edge(at, split_addr);
        split_addr
    }

    /// Wire an edge, forward-declaring the destination if needed. A oneway
    /// source gaining a second successor becomes twoway.
    pub fn add_edge(&mut self, src: Address, dst: Address) {
        self.create_incomplete_bb(dst);
        if let Some(s) = self.blocks.get_mut(&src) {
            s.successors.push(dst);
            if s.kind() == FlowKind::Oneway && s.num_successors() > 1 {
                s.set_kind(FlowKind::Twoway);
            }
        }
        if let Some(d) = self.blocks.get_mut(&dst) {
            d.predecessors.push(src);
        }
    }

    /// Every block complete, every edge symmetric, no edges between
    /// procedures.
    pub fn is_well_formed(&self) -> bool {
        for bb in self.blocks.values() {
            if !bb.is_complete() {
                log::error!("CFG is not well formed: BB at {} is incomplete", bb.lo());
                return false;
            }

            for pred in &bb.predecessors {
                let Some(p) = self.blocks.get(pred) else {
                    log::error!("CFG is not well formed: dangling predecessor {} of {}", pred, bb.lo());
                    return false;
                };
                if !p.successors.contains(&bb.lo()) {
                    log::error!(
                        "CFG is not well formed: edge from {} to {} is malformed",
                        pred,
                        bb.lo()
                    );
                    return false;
                }
                if p.proc != bb.proc {
                    log::error!(
                        "CFG is not well formed: interprocedural edge from {} to {}",
                        pred,
                        bb.lo()
                    );
                    return false;
                }
            }

            for succ in &bb.successors {
                let Some(s) = self.blocks.get(succ) else {
                    log::error!("CFG is not well formed: dangling successor {} of {}", succ, bb.lo());
                    return false;
                };
                if !s.predecessors.contains(&bb.lo()) {
                    log::error!(
                        "CFG is not well formed: edge from {} to {} is malformed",
                        bb.lo(),
                        succ
                    );
                    return false;
                }
            }
        }
        true
    }

    /// The first return block, if any.
    pub fn find_ret_node(&self) -> Option<Address> {
        self.blocks
            .values()
            .find(|b| b.kind() == FlowKind::Ret)
            .map(|b| b.lo())
    }
}

impl fmt::Display for LowLevelCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Control Flow Graph:")?;
        for bb in self.blocks.values() {
            writeln!(
                f,
                "{} -> {} ({})",
                bb.lo(),
                bb.hi(),
                bb.kind()
            )?;
        }
        Ok(())
    }
}
