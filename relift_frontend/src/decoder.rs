//! Decoder and RTL dictionary facades
//!
//! The core does not decode machine code itself. It consumes two
//! collaborators: an [`InstructionDecoder`] that disassembles and lifts one
//! instruction at a time, and an [`RtlDictionary`] that instantiates RTL
//! templates by name. Both report failure through [`DecodeError`], which
//! the discovery loop degrades to "stop exploring this path".

use thiserror::Error;

use relift_common::Address;
use relift_ir::{Exp, Rtl, StatementIdAllocator};

use serde::{Deserialize, Serialize};

/// One decoded machine instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInstruction {
    pub addr: Address,
    pub size: u32,
    /// Decoder-internal instruction id.
    pub id: u32,
    pub mnemonic: String,
    pub operand_str: String,
    /// Template name used for RTL dictionary lookup.
    pub template: String,
}

impl MachineInstruction {
    pub fn new(addr: Address, size: u32, mnemonic: impl Into<String>) -> Self {
        let mnemonic = mnemonic.into();
        Self {
            addr,
            size,
            id: 0,
            template: mnemonic.to_uppercase(),
            mnemonic,
            operand_str: String::new(),
        }
    }
}

/// The RTLs realizing one instruction. Usually one, but delayed-branch
/// architectures may lift an instruction to several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftedInstruction {
    pub rtls: Vec<Rtl>,
}

impl LiftedInstruction {
    pub fn single(rtl: Rtl) -> Self {
        Self { rtls: vec![rtl] }
    }

    pub fn first_rtl(&self) -> Option<&Rtl> {
        self.rtls.first()
    }
}

/// Decoder-level failures.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
    #[error("invalid instruction at {addr}")]
    InvalidInstruction { addr: Address },

    #[error("could not read memory at {addr}")]
    ReadFailure { addr: Address },

    #[error("instruction at {addr} not implemented (template '{template}')")]
    NotImplemented { addr: Address, template: String },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

impl From<DecodeError> for relift_common::ReliftError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::NotImplemented { addr, template } => {
                relift_common::ReliftError::missing_template(addr, template)
            }
            DecodeError::InvalidInstruction { addr } => {
                relift_common::ReliftError::decode(addr, "invalid instruction")
            }
            DecodeError::ReadFailure { addr } => {
                relift_common::ReliftError::decode(addr, "could not read memory")
            }
        }
    }
}

/// The decoder collaborator.
pub trait InstructionDecoder {
    /// Disassemble the instruction at `pc`. `delta` is the host/native
    /// address difference of the mapped image.
    fn disassemble(&self, pc: Address, delta: i64) -> DecodeResult<MachineInstruction>;

    /// Attach RTLs to a decoded instruction.
    fn lift(
        &self,
        insn: &MachineInstruction,
        ids: &mut StatementIdAllocator,
    ) -> DecodeResult<LiftedInstruction>;
}

/// The RTL template dictionary collaborator.
pub trait RtlDictionary {
    /// Instantiate the template `name` at `addr` with the given actual
    /// operands. `None` means the template does not exist; the caller
    /// treats this as "instruction not implemented".
    fn instantiate(
        &self,
        name: &str,
        addr: Address,
        operands: &[Exp],
        ids: &mut StatementIdAllocator,
    ) -> Option<Rtl>;
}

/// Canonicalize a decoder-produced template name for dictionary lookup:
/// uppercase with dots removed.
pub fn canonical_template_name(name: &str) -> String {
    name.chars().filter(|c| *c != '.').collect::<String>().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relift_ir::Statement;

    #[test]
    fn test_canonical_template_name() {
        assert_eq!(canonical_template_name("add.w"), "ADDW");
        assert_eq!(canonical_template_name("BNE,a"), "BNE,A");
        assert_eq!(canonical_template_name("ret"), "RET");
    }

    #[test]
    fn test_machine_instruction_defaults() {
        let insn = MachineInstruction::new(Address(0x1000), 4, "add");
        assert_eq!(insn.template, "ADD");
        assert_eq!(insn.size, 4);
        assert_eq!(insn.operand_str, "");
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: relift_common::ReliftError = DecodeError::NotImplemented {
            addr: Address(0x1000),
            template: "IDLE".into(),
        }
        .into();
        assert!(err.to_string().contains("IDLE"));

        let err: relift_common::ReliftError =
            DecodeError::ReadFailure { addr: Address(0x2000) }.into();
        assert!(err.to_string().contains("0x00002000"));
    }

    /// A two-entry dictionary: templates are looked up by canonical name,
    /// unknown templates yield None.
    struct ToyDictionary;

    impl RtlDictionary for ToyDictionary {
        fn instantiate(
            &self,
            name: &str,
            addr: Address,
            operands: &[Exp],
            ids: &mut StatementIdAllocator,
        ) -> Option<Rtl> {
            let mut rtl = Rtl::new(addr);
            match name {
                "ADD" => {
                    let sum = Exp::binary(
                        relift_ir::Operator::Plus,
                        operands[1].clone(),
                        operands[2].clone(),
                    );
                    rtl.push(Statement::assign(ids.alloc(), operands[0].clone(), sum));
                    Some(rtl)
                }
                "NOP" => Some(rtl),
                _ => None,
            }
        }
    }

    #[test]
    fn test_rtl_dictionary_facade() {
        let dict = ToyDictionary;
        let mut ids = StatementIdAllocator::new();

        let operands = [Exp::reg(0), Exp::reg(1), Exp::reg(2)];
        let rtl = dict
            .instantiate(
                &canonical_template_name("add"),
                Address(0x1000),
                &operands,
                &mut ids,
            )
            .expect("ADD template exists");
        assert_eq!(rtl.to_string(), "0x00001000    0 *32* r0 := r1 + r2\n");

        // A nonexistent template means "instruction not implemented"
        assert!(dict
            .instantiate("FROBNICATE", Address(0x1004), &operands, &mut ids)
            .is_none());
    }
}
