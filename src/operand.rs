//! Instruction operand payloads (spec §3 `MicroInstrOperand` and friends).
//!
//! An instruction's operand array is a fixed-size slice of
//! [`MicroInstrOperand`] slots; what a slot *means* (register role,
//! immediate, condition code, micro-op selector, label/offset) is decided
//! entirely by the opcode descriptor in `opcode.rs`, not by the operand
//! value itself — the union carries no tag of its own, matching the
//! source's `MicroInstrOperand`.

use crate::reg::MicroReg;
use crate::storage::Ref;

/// Bit-width / signedness qualifier carried by most opcodes (`opBits` in
/// the original source), used by both the legalizer and the encoder to
/// pick an operand-size prefix / instruction form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MicroOpBits {
    B8,
    B16,
    B32,
    B64,
    F32,
    F64,
}

impl MicroOpBits {
    pub fn byte_size(self) -> u32 {
        match self {
            MicroOpBits::B8 => 1,
            MicroOpBits::B16 => 2,
            MicroOpBits::B32 | MicroOpBits::F32 => 4,
            MicroOpBits::B64 | MicroOpBits::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, MicroOpBits::F32 | MicroOpBits::F64)
    }

    /// True if `value` needs more than 32 bits to represent signed, i.e.
    /// cannot be folded into a 32-bit sign-extended immediate form.
    pub fn fits_imm32(value: u64) -> bool {
        let v = value as i64;
        v >= i32::MIN as i64 && v <= i32::MAX as i64
    }
}

/// CPU condition code for conditional jumps, sets, and moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MicroCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LtUnsigned,
    LeUnsigned,
    GtUnsigned,
    GeUnsigned,
    Overflow,
    NotOverflow,
    Sign,
    NotSign,
}

impl MicroCond {
    /// The condition that holds exactly when `self` does not.
    pub fn inverse(self) -> MicroCond {
        use MicroCond::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Le => Gt,
            Gt => Le,
            Ge => Lt,
            LtUnsigned => GeUnsigned,
            LeUnsigned => GtUnsigned,
            GtUnsigned => LeUnsigned,
            GeUnsigned => LtUnsigned,
            Overflow => NotOverflow,
            NotOverflow => Overflow,
            Sign => NotSign,
            NotSign => Sign,
        }
    }
}

/// Arithmetic/logical micro-op selector for the generic unary/binary/
/// ternary register-register-register opcode families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MicroOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
    ShiftLeft,
    ShiftRight,
    ShiftRightArith,
    Not,
    Neg,
    Exchange,
    CompareExchange,
}

impl MicroOp {
    /// True for shift-family ops, which need their shift count in `%cl`
    /// when it is not an immediate (drives the
    /// `RewriteRegRegOperandToFixedReg` conformance issue).
    pub fn is_shift(self) -> bool {
        matches!(
            self,
            MicroOp::ShiftLeft | MicroOp::ShiftRight | MicroOp::ShiftRightArith
        )
    }
}

/// One operand slot. Only the field matching the slot's declared role
/// (see `opcode.rs`) is meaningful; the rest is left at its default.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MicroInstrOperand {
    Reg(MicroReg),
    OpBits(MicroOpBits),
    Cond(MicroCond),
    Op(MicroOp),
    ValueU64(u64),
    ValueI32(i32),
    ValueU32(u32),
    CallConv(crate::callconv::CallConvKind),
    /// An instruction-arena reference, used for label operands.
    InstrRef(Ref),
    /// A still-unresolved symbol/identifier (front-end owned, opaque here).
    Symbol(SymbolRef),
    /// Declared-but-unused slot (e.g. `LoadAmcMemImm` slot 2, see
    /// `SPEC_FULL.md` §D).
    None,
}

impl Default for MicroInstrOperand {
    fn default() -> Self {
        MicroInstrOperand::None
    }
}

impl MicroInstrOperand {
    pub fn as_reg(&self) -> MicroReg {
        match self {
            MicroInstrOperand::Reg(r) => *r,
            other => panic!("operand slot is not a register: {other:?}"),
        }
    }

    pub fn as_reg_mut(&mut self) -> &mut MicroReg {
        match self {
            MicroInstrOperand::Reg(r) => r,
            other => panic!("operand slot is not a register: {other:?}"),
        }
    }

    pub fn as_op_bits(&self) -> MicroOpBits {
        match self {
            MicroInstrOperand::OpBits(b) => *b,
            other => panic!("operand slot is not opBits: {other:?}"),
        }
    }

    pub fn as_cond(&self) -> MicroCond {
        match self {
            MicroInstrOperand::Cond(c) => *c,
            other => panic!("operand slot is not a condition: {other:?}"),
        }
    }

    pub fn as_op(&self) -> MicroOp {
        match self {
            MicroInstrOperand::Op(op) => *op,
            other => panic!("operand slot is not a micro-op: {other:?}"),
        }
    }

    pub fn as_u64(&self) -> u64 {
        match self {
            MicroInstrOperand::ValueU64(v) => *v,
            other => panic!("operand slot is not a u64 value: {other:?}"),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            MicroInstrOperand::ValueI32(v) => *v,
            other => panic!("operand slot is not an i32 value: {other:?}"),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            MicroInstrOperand::ValueU32(v) => *v,
            other => panic!("operand slot is not a u32 value: {other:?}"),
        }
    }

    pub fn as_instr_ref(&self) -> Ref {
        match self {
            MicroInstrOperand::InstrRef(r) => *r,
            other => panic!("operand slot is not an instruction ref: {other:?}"),
        }
    }
}

/// Opaque reference to a front-end symbol (function name, global). The
/// symbol table itself is out of this crate's scope (spec §1); this crate
/// only carries the reference through to relocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SymbolRef(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_inverse_is_involutive() {
        for cond in [
            MicroCond::Eq,
            MicroCond::Lt,
            MicroCond::GeUnsigned,
            MicroCond::Overflow,
            MicroCond::Sign,
        ] {
            assert_eq!(cond.inverse().inverse(), cond);
            assert_ne!(cond.inverse(), cond);
        }
    }

    #[test]
    fn fits_imm32_boundaries() {
        assert!(MicroOpBits::fits_imm32(i32::MAX as u64));
        assert!(MicroOpBits::fits_imm32(i32::MIN as i64 as u64));
        assert!(!MicroOpBits::fits_imm32(i32::MAX as u64 + 1));
        assert!(!MicroOpBits::fits_imm32(u64::MAX));
    }

    #[test]
    fn shift_ops_flagged() {
        assert!(MicroOp::ShiftLeft.is_shift());
        assert!(!MicroOp::Add.is_shift());
    }
}
