//! Opcode enum and per-opcode operand descriptors (spec §4.A).
//!
//! Slot layouts below were reverse-engineered from the exact operand
//! indices `Pass.Emit.cpp`'s `encodeInstruction` switch reads per opcode,
//! cross-checked against the indices `MicroLegalizePass.cpp`'s rewrite
//! functions and `MicroRegisterAllocationPass.cpp`'s spill-store/-load
//! construction use for the same opcodes. A descriptor is the single
//! source of truth for operand count, which slots hold registers (and in
//! which role), and whether the opcode is a call.

use crate::reg::MicroReg;

/// How a register-holding slot is used by this opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegRole {
    Use,
    Def,
    UseDef,
}

/// What an operand slot at a given index holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Reg(RegRole),
    OpBits,
    Cond,
    Op,
    ValueU64,
    ValueI32,
    ValueU32,
    CallConv,
    /// Label/instruction-ref operand.
    InstrRef,
    Symbol,
    /// Declared-but-unused slot (e.g. `LoadAmcMemImm` slot 2).
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MicroInstrOpcode {
    Nop,
    End,
    Debug,
    Ignore,
    Label,
    JumpCond,
    JumpCondImm,
    JumpReg,
    JumpTable,
    PatchJump,
    Push,
    Pop,
    Ret,
    CallLocal,
    CallExtern,
    CallIndirect,
    LoadRegPtrImm,
    LoadRegReg,
    LoadRegImm,
    LoadRegMem,
    LoadMemReg,
    LoadMemImm,
    LoadSignedExtRegMem,
    LoadZeroExtRegMem,
    LoadSignedExtRegReg,
    LoadZeroExtRegReg,
    LoadAddrRegMem,
    LoadAmcMemReg,
    LoadAmcMemImm,
    LoadAmcRegMem,
    LoadAddrAmcRegMem,
    CmpRegReg,
    CmpRegZero,
    CmpRegImm,
    CmpMemReg,
    CmpMemImm,
    SetCondReg,
    LoadCondRegReg,
    ClearReg,
    OpUnaryMem,
    OpUnaryReg,
    OpBinaryRegReg,
    OpBinaryMemReg,
    OpBinaryRegImm,
    OpBinaryMemImm,
    OpBinaryRegMem,
    OpTernaryRegRegReg,
    SymbolRelocAddr,
    SymbolRelocValue,
}

/// Static description of an opcode's operand slots.
pub struct OpcodeDescriptor {
    pub slots: &'static [SlotKind],
    pub is_call: bool,
    /// Index of the `SlotKind::CallConv` slot, for call opcodes.
    pub call_conv_slot: Option<usize>,
}

impl OpcodeDescriptor {
    pub fn operand_count(&self) -> usize {
        self.slots.len()
    }
}

macro_rules! desc {
    ([$($slot:expr),* $(,)?]) => {
        OpcodeDescriptor { slots: &[$($slot),*], is_call: false, call_conv_slot: None }
    };
    ([$($slot:expr),* $(,)?], call_conv = $idx:expr) => {
        OpcodeDescriptor { slots: &[$($slot),*], is_call: true, call_conv_slot: Some($idx) }
    };
}

use RegRole::*;
use SlotKind::*;

impl MicroInstrOpcode {
    pub fn descriptor(self) -> OpcodeDescriptor {
        match self {
            MicroInstrOpcode::Nop
            | MicroInstrOpcode::End
            | MicroInstrOpcode::Debug
            | MicroInstrOpcode::Ignore
            | MicroInstrOpcode::Ret
            | MicroInstrOpcode::PatchJump => desc!([]),

            MicroInstrOpcode::Label => desc!([InstrRef]),

            MicroInstrOpcode::JumpCond => desc!([Cond, OpBits, InstrRef]),
            MicroInstrOpcode::JumpCondImm => desc!([Cond, OpBits, ValueU64]),

            MicroInstrOpcode::JumpReg => desc!([Reg(Use)]),
            MicroInstrOpcode::JumpTable => {
                desc!([Reg(Use), Reg(Use), ValueI32, ValueU32, ValueU32])
            }

            MicroInstrOpcode::Push => desc!([Reg(Use)]),
            MicroInstrOpcode::Pop => desc!([Reg(Def)]),

            MicroInstrOpcode::CallLocal | MicroInstrOpcode::CallExtern => {
                desc!([Symbol, CallConv], call_conv = 1)
            }
            MicroInstrOpcode::CallIndirect => desc!([Reg(Use), CallConv], call_conv = 1),

            MicroInstrOpcode::LoadRegPtrImm => desc!([Reg(Def), OpBits, ValueU64]),

            MicroInstrOpcode::LoadRegReg => desc!([Reg(Def), Reg(Use), OpBits]),
            MicroInstrOpcode::LoadRegImm => desc!([Reg(Def), OpBits, ValueU64]),
            MicroInstrOpcode::LoadRegMem => desc!([Reg(Def), Reg(Use), OpBits, ValueU64]),
            MicroInstrOpcode::LoadMemReg => desc!([Reg(Use), Reg(Use), OpBits, ValueU64]),
            MicroInstrOpcode::LoadMemImm => desc!([Reg(Use), OpBits, ValueU64, ValueU64]),

            MicroInstrOpcode::LoadSignedExtRegMem | MicroInstrOpcode::LoadZeroExtRegMem => {
                desc!([Reg(Def), Reg(Use), OpBits, OpBits, ValueU64])
            }
            MicroInstrOpcode::LoadSignedExtRegReg | MicroInstrOpcode::LoadZeroExtRegReg => {
                desc!([Reg(Def), Reg(Use), OpBits, OpBits])
            }

            MicroInstrOpcode::LoadAddrRegMem => desc!([Reg(Def), Reg(Use), OpBits, ValueU64]),

            MicroInstrOpcode::LoadAmcMemReg => desc!([
                Reg(Use),
                Reg(Use),
                Reg(Use),
                OpBits,
                OpBits,
                ValueU64,
                ValueU64,
            ]),
            MicroInstrOpcode::LoadAmcMemImm => desc!([
                Reg(Use),
                Reg(Use),
                Reserved,
                OpBits,
                OpBits,
                ValueU64,
                ValueU64,
                ValueU64,
            ]),
            MicroInstrOpcode::LoadAmcRegMem | MicroInstrOpcode::LoadAddrAmcRegMem => desc!([
                Reg(Def),
                Reg(Use),
                Reg(Use),
                OpBits,
                OpBits,
                ValueU64,
                ValueU64,
            ]),

            MicroInstrOpcode::CmpRegReg => desc!([Reg(Use), Reg(Use), OpBits]),
            MicroInstrOpcode::CmpRegZero => desc!([Reg(Use), OpBits]),
            MicroInstrOpcode::CmpRegImm => desc!([Reg(Use), OpBits, ValueU64]),
            MicroInstrOpcode::CmpMemReg => desc!([Reg(Use), Reg(Use), OpBits, ValueU64]),
            MicroInstrOpcode::CmpMemImm => desc!([Reg(Use), OpBits, ValueU64, ValueU64]),

            MicroInstrOpcode::SetCondReg => desc!([Reg(Def), Cond]),
            MicroInstrOpcode::LoadCondRegReg => desc!([Reg(UseDef), Reg(Use), Cond, OpBits]),
            MicroInstrOpcode::ClearReg => desc!([Reg(Def), OpBits]),

            MicroInstrOpcode::OpUnaryMem => desc!([Reg(Use), OpBits, Op, ValueU64]),
            MicroInstrOpcode::OpUnaryReg => desc!([Reg(UseDef), OpBits, Op]),

            MicroInstrOpcode::OpBinaryRegReg => desc!([Reg(UseDef), Reg(Use), OpBits, Op]),
            MicroInstrOpcode::OpBinaryMemReg => {
                desc!([Reg(Use), Reg(Use), OpBits, Op, ValueU64])
            }
            MicroInstrOpcode::OpBinaryRegImm => desc!([Reg(UseDef), OpBits, Op, ValueU64]),
            MicroInstrOpcode::OpBinaryMemImm => {
                desc!([Reg(Use), OpBits, Op, ValueU64, ValueU64])
            }
            MicroInstrOpcode::OpBinaryRegMem => {
                desc!([Reg(UseDef), Reg(Use), OpBits, Op, ValueU64])
            }
            MicroInstrOpcode::OpTernaryRegRegReg => {
                desc!([Reg(Def), Reg(Use), Reg(Use), OpBits, Op])
            }

            MicroInstrOpcode::SymbolRelocAddr | MicroInstrOpcode::SymbolRelocValue => {
                desc!([Symbol])
            }
        }
    }

    /// True for the opcodes whose operand-0/operand-1 register roles flip
    /// from `Use`/`Use` to `UseDef`/`UseDef`-ish (really: the second
    /// operand becomes both read and written) for the exchange-family
    /// micro-ops, per `MicroInstr.cpp::resolveRegModes`.
    pub fn has_exchange_role_flip(self, op: Option<crate::operand::MicroOp>) -> bool {
        use crate::operand::MicroOp;
        matches!(
            (self, op),
            (MicroInstrOpcode::OpBinaryRegReg, Some(MicroOp::Exchange))
                | (MicroInstrOpcode::OpBinaryMemReg, Some(MicroOp::Exchange))
                | (
                    MicroInstrOpcode::OpTernaryRegRegReg,
                    Some(MicroOp::CompareExchange)
                )
        )
    }
}

/// A register operand together with the role it plays, as reported by
/// `MicroInstr::collect_reg_operands` (spec §4.C use/def derivation).
#[derive(Debug, Clone, Copy)]
pub struct RegOperand {
    pub slot: usize,
    pub reg: MicroReg,
    pub role: RegRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_mem_reg_matches_spill_store_shape() {
        let d = MicroInstrOpcode::LoadMemReg.descriptor();
        assert_eq!(d.operand_count(), 4);
        assert_eq!(d.slots[0], Reg(Use));
        assert_eq!(d.slots[1], Reg(Use));
    }

    #[test]
    fn load_amc_mem_imm_has_reserved_gap() {
        let d = MicroInstrOpcode::LoadAmcMemImm.descriptor();
        assert_eq!(d.slots[2], Reserved);
        assert_eq!(d.operand_count(), 8);
    }

    #[test]
    fn call_opcodes_flag_call_conv_slot() {
        let d = MicroInstrOpcode::CallIndirect.descriptor();
        assert!(d.is_call);
        assert_eq!(d.call_conv_slot, Some(1));
    }

    #[test]
    fn nullary_opcodes_have_no_slots() {
        assert_eq!(MicroInstrOpcode::Nop.descriptor().operand_count(), 0);
        assert_eq!(MicroInstrOpcode::Ret.descriptor().operand_count(), 0);
    }
}
