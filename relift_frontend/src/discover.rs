//! Entry-driven block discovery
//!
//! Drives an [`InstructionDecoder`] from a procedure entry point, building
//! the low-level CFG and the per-instruction RTLs. Decode failures are
//! non-fatal: the affected path is abandoned and its block left incomplete,
//! which later shows up in the well-formedness check.

use indexmap::IndexMap;

use relift_common::{Address, Settings};
use relift_ir::{FlowKind, Rtl, Statement, StatementIdAllocator};

use crate::cfg::LowLevelCfg;
use crate::decoder::{DecodeError, InstructionDecoder, LiftedInstruction, MachineInstruction};

/// The outcome of discovering one procedure.
#[derive(Debug)]
pub struct Discovery {
    pub cfg: LowLevelCfg,
    /// Lifted RTL for each decoded instruction address.
    pub rtls: IndexMap<Address, Rtl>,
}

/// Builds a low-level CFG by following control flow from an entry point.
pub struct BlockDiscoverer<'a, D: InstructionDecoder> {
    decoder: &'a D,
    settings: &'a Settings,
    cfg: LowLevelCfg,
    rtls: IndexMap<Address, Rtl>,
}

impl<'a, D: InstructionDecoder> BlockDiscoverer<'a, D> {
    pub fn new(decoder: &'a D, settings: &'a Settings) -> Self {
        Self {
            decoder,
            settings,
            cfg: LowLevelCfg::new(),
            rtls: IndexMap::new(),
        }
    }

    /// Discover all blocks reachable from `entry`.
    pub fn discover_proc(
        mut self,
        ids: &mut StatementIdAllocator,
        entry: Address,
    ) -> Discovery {
        let mut work = vec![entry];
        while let Some(start) = work.pop() {
            if self.cfg.is_start_of_complete_bb(start) {
                continue;
            }
            self.decode_block(start, ids, &mut work);
        }

        // Everything discovered from one entry belongs to that procedure.
        let addrs: Vec<Address> = self.cfg.iter().map(|b| b.lo()).collect();
        for addr in addrs {
            if let Some(bb) = self.cfg.bb_at_mut(addr) {
                bb.proc = Some(entry);
            }
        }

        Discovery { cfg: self.cfg, rtls: self.rtls }
    }

    fn decode_block(
        &mut self,
        start: Address,
        ids: &mut StatementIdAllocator,
        work: &mut Vec<Address>,
    ) {
        let mut insns: Vec<MachineInstruction> = Vec::new();
        let mut addr = start;

        loop {
            // Falling into a known block boundary closes the current one.
            if !insns.is_empty() && self.cfg.is_start_of_bb(addr) {
                self.finish_block(FlowKind::Fall, insns, &[addr], work);
                return;
            }

            let insn = match self.decoder.disassemble(addr, 0) {
                Ok(insn) => insn,
                Err(err) => {
                    log::warn!("giving up on path at {}: {}", addr, err);
                    self.cfg.create_incomplete_bb(start);
                    return;
                }
            };

            if self.settings.debug_decoder {
                log::debug!("{} {} {}", insn.addr, insn.mnemonic, insn.operand_str);
            }

            let lifted = match self.decoder.lift(&insn, ids) {
                Ok(lifted) => lifted,
                Err(DecodeError::NotImplemented { addr, template }) => {
                    // The instruction decodes but has no RTL template; its
                    // statements are omitted.
                    log::warn!("no RTL template '{}' for instruction at {}", template, addr);
                    LiftedInstruction::single(Rtl::new(addr))
                }
                Err(err) => {
                    log::warn!("giving up on path at {}: {}", addr, err);
                    self.cfg.create_incomplete_bb(start);
                    return;
                }
            };

            let next = insn.addr + insn.size as u64;
            insns.push(insn);

            let rtl = lifted
                .rtls
                .into_iter()
                .next()
                .unwrap_or_else(|| Rtl::new(addr));
            let control = rtl.stmts.last().cloned();
            self.rtls.insert(addr, rtl);

            match control {
                Some(Statement::Goto(g)) => {
                    match g.dest.as_int() {
                        Some(t) => {
                            let target = Address(t as u64);
                            self.finish_block(FlowKind::Oneway, insns, &[target], work);
                        }
                        None => {
                            // Computed jump; no static successors
                            self.finish_block(FlowKind::CompJump, insns, &[], work);
                        }
                    }
                    return;
                }
                Some(Statement::Branch(b)) => {
                    let mut targets = vec![next];
                    if let Some(t) = b.dest.as_int() {
                        targets.push(Address(t as u64));
                    }
                    self.finish_block(FlowKind::Twoway, insns, &targets, work);
                    return;
                }
                Some(Statement::Case(_)) => {
                    self.finish_block(FlowKind::Nway, insns, &[], work);
                    return;
                }
                Some(Statement::Call(c)) => {
                    if c.return_after_call {
                        self.finish_block(FlowKind::Ret, insns, &[], work);
                    } else if c.dest.is_int_const() {
                        self.finish_block(FlowKind::Call, insns, &[next], work);
                    } else {
                        self.finish_block(FlowKind::CompCall, insns, &[next], work);
                    }
                    return;
                }
                Some(Statement::Return(_)) => {
                    self.finish_block(FlowKind::Ret, insns, &[], work);
                    return;
                }
                _ => {
                    addr = next;
                }
            }
        }
    }

    fn finish_block(
        &mut self,
        kind: FlowKind,
        insns: Vec<MachineInstruction>,
        targets: &[Address],
        work: &mut Vec<Address>,
    ) {
        let Some(bb) = self.cfg.create_bb(kind, insns) else {
            // A complete block already covers this range; its edges exist.
            return;
        };
        let mut src = bb;
        for target in targets {
            self.cfg.ensure_bb_exists(*target, &mut src);
            self.cfg.add_edge(src, *target);
            work.push(*target);
        }
    }
}
