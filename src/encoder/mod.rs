//! Encoder capability contract (spec §4.E), grounded in the
//! `Encoder`/`X64Encoder` contract as consumed by
//! `MicroLegalizePass.cpp`/`Pass.Emit.cpp`: `queryConformanceIssue`,
//! `stackPointerReg`, `updateRegUseDef`, and the jump-encoding pair
//! `encodeJump`/`encodePatchJump`.

mod x64;

pub use x64::X64Encoder;

use crate::callconv::CallConv;
use crate::instr::{MicroInstr, MicroInstrUseDef};
use crate::operand::MicroInstrOperand;
use crate::reg::MicroReg;

/// One specific, targeted non-conformance the legalizer knows how to fix.
/// An encoder reports at most one issue per query; the legalizer applies
/// its rewrite and re-queries until the encoder reports none (spec §4.H's
/// fixed-point loop).
#[derive(Debug, Clone, Copy)]
pub enum ConformanceIssue {
    /// `operand_index`'s immediate exceeds `value_limit` and must be
    /// clamped (lossy, used for opcodes whose immediate is a bounded
    /// count, e.g. a shift amount).
    ClampImmediate {
        operand_index: u8,
        value_limit: u64,
    },
    /// `operand_index`'s declared width is not directly encodable and must
    /// be normalized to `normalized` (e.g. 8/16-bit forms promoted to 32).
    NormalizeOpBits {
        operand_index: u8,
        normalized: crate::operand::MicroOpBits,
    },
    /// A `LoadMemImm` with a 64-bit immediate has no direct encoding; split
    /// into two 32-bit stores.
    SplitLoadMemImm64,
    /// Same split, for the address-mode-combined memory-store opcode.
    SplitLoadAmcMemImm64,
    /// A float-destination `LoadRegImm`/`LoadRegPtrImm` has no direct
    /// immediate-to-float-register form; round-trip through a stack slot.
    RewriteLoadFloatRegImm,
    /// `OpBinaryRegReg`'s operand at `operand_index` (0 = dst, 1 = src)
    /// must be pinned into `required_reg` (e.g. variable shift counts into
    /// `%cl`). `helper_reg` is a scratch register to use if the other
    /// operand already holds `required_reg`.
    RewriteRegRegOperandToFixedReg {
        operand_index: u8,
        required_reg: MicroReg,
        helper_reg: MicroReg,
    },
    /// `OpBinaryRegReg`'s operand at `operand_index` must avoid
    /// `forbidden_reg`; move it into `scratch_reg` first.
    RewriteRegRegOperandAwayFromFixedReg {
        operand_index: u8,
        forbidden_reg: MicroReg,
        scratch_reg: MicroReg,
    },
}

impl ConformanceIssue {
    pub fn debug_name(&self) -> &'static str {
        match self {
            ConformanceIssue::ClampImmediate { .. } => "ClampImmediate",
            ConformanceIssue::NormalizeOpBits { .. } => "NormalizeOpBits",
            ConformanceIssue::SplitLoadMemImm64 => "SplitLoadMemImm64",
            ConformanceIssue::SplitLoadAmcMemImm64 => "SplitLoadAmcMemImm64",
            ConformanceIssue::RewriteLoadFloatRegImm => "RewriteLoadFloatRegImm",
            ConformanceIssue::RewriteRegRegOperandToFixedReg { .. } => {
                "RewriteRegRegOperandToFixedReg"
            }
            ConformanceIssue::RewriteRegRegOperandAwayFromFixedReg { .. } => {
                "RewriteRegRegOperandAwayFromFixedReg"
            }
        }
    }

    /// The scratch-frame bytes this rewrite may need, before the register
    /// allocator's own spill slots exist (the legalizer runs after regalloc
    /// and may still need a small preserved-register staging area).
    pub fn scratch_reg(&self) -> Option<MicroReg> {
        match self {
            ConformanceIssue::RewriteRegRegOperandAwayFromFixedReg { scratch_reg, .. } => {
                Some(*scratch_reg)
            }
            _ => None,
        }
    }

    pub fn required_reg(&self) -> Option<MicroReg> {
        match self {
            ConformanceIssue::RewriteRegRegOperandToFixedReg { required_reg, .. } => {
                Some(*required_reg)
            }
            _ => None,
        }
    }
}

/// A resolved jump encoding: either a short/near relative form or a form
/// requiring a later patch once the target label's offset is known.
#[derive(Debug, Clone, Copy)]
pub struct MicroJump {
    pub byte_len: usize,
    /// Offset, from the start of this instruction's encoding, of the
    /// 4-byte relative displacement field that must be patched once the
    /// target's final address is known.
    pub patch_offset: usize,
}

/// What a target's encoder must be able to answer to drive legalization
/// and emission. One `Encoder` implementation exists per target ISA; this
/// crate ships `X64Encoder` (spec §4.E, §1 scope: x86-64 only).
pub trait Encoder {
    /// Checks whether `instr` is directly encodable. Returns the single
    /// most pressing non-conformance if not.
    fn query_conformance_issue(
        &self,
        instr: &MicroInstr,
        ops: &[MicroInstrOperand],
    ) -> Option<ConformanceIssue>;

    /// Lets the encoder add target-specific implicit register uses/defs
    /// (e.g. inputs consumed by an implicit flags register) on top of
    /// what `MicroInstr::collect_use_def` derives generically.
    fn update_reg_use_def(&self, _instr: &MicroInstr, _ops: &[MicroInstrOperand], _use_def: &mut MicroInstrUseDef) {}

    fn stack_pointer_reg(&self) -> MicroReg;

    /// Encodes `instr` into `out`, appending relocations for any operand
    /// that needs one. `call_conv` is consulted for call-shaped opcodes.
    fn encode(
        &self,
        instr: &MicroInstr,
        ops: &[MicroInstrOperand],
        call_conv: &CallConv,
        out: &mut Vec<u8>,
    ) -> Result<EncodedInstr, crate::error::BackendError>;

    /// Byte length and patch-site offset for an unconditional near jump
    /// to an as-yet-unresolved label, used before the final pass knows
    /// target offsets.
    fn jump_form(&self) -> MicroJump;
}

/// What `Encoder::encode` reports back about the bytes it just wrote.
#[derive(Debug, Default, Clone)]
pub struct EncodedInstr {
    /// Byte offset (within the instruction's own encoding) of the operand
    /// that needs a relocation, if any.
    pub reloc_patch_offset: Option<usize>,
}
