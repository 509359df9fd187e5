//! Fragment derivation
//!
//! Converts a well-formed low-level CFG plus the lifted per-instruction
//! RTLs into a procedure of fragments with mirrored edges. This is the
//! hand-over point from discovery to the dataflow engine.

use std::collections::HashMap;

use indexmap::IndexMap;

use relift_common::{Address, ReliftError, ReliftResult};
use relift_ir::{Procedure, Rtl};

use crate::cfg::LowLevelCfg;

/// Build a [`Procedure`] from discovered blocks and their RTLs.
///
/// Fails with a CFG integrity error when the low-level CFG is not well
/// formed (incomplete blocks, asymmetric edges) or the entry block is
/// missing.
pub fn derive_proc(
    name: &str,
    entry: Address,
    cfg: &LowLevelCfg,
    rtls: &IndexMap<Address, Rtl>,
) -> ReliftResult<Procedure> {
    if !cfg.is_well_formed() {
        return Err(ReliftError::cfg_integrity(name, "low-level CFG is not well formed"));
    }

    let mut proc = Procedure::new(name, entry);
    let mut index = HashMap::new();

    for bb in cfg.iter() {
        let frag_rtls: Vec<Rtl> = bb
            .insns()
            .iter()
            .map(|insn| {
                rtls.get(&insn.addr)
                    .cloned()
                    .unwrap_or_else(|| Rtl::new(insn.addr))
            })
            .collect();
        let id = proc.cfg.add_fragment(bb.kind(), frag_rtls);
        index.insert(bb.lo(), id);
    }

    for bb in cfg.iter() {
        let from = index[&bb.lo()];
        for succ in &bb.successors {
            let Some(to) = index.get(succ) else {
                return Err(ReliftError::cfg_integrity(
                    name,
                    format!("successor {} of block {} has no fragment", succ, bb.lo()),
                ));
            };
            proc.cfg.add_edge(from, *to);
        }
    }

    match index.get(&entry) {
        Some(id) => proc.cfg.set_entry(*id),
        None => {
            return Err(ReliftError::cfg_integrity(
                name,
                format!("no block at entry address {}", entry),
            ));
        }
    }

    Ok(proc)
}
