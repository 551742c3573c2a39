//! x86-64 encoder, grounded in `Backend/Encoder/X64Encoder.cpp`.
//!
//! This implements one real, working encoding per opcode shape the rest of
//! the pipeline exercises (spec's own encoder budget table puts the full
//! original at roughly a fifth of the whole backend — every legacy
//! addressing-mode special case is out of scope here the same way linking
//! and object-file emission are, see `DESIGN.md`). Unhandled shapes report
//! [`crate::error::BackendError::UnsupportedForm`] rather than panicking.

use crate::callconv::{gpr, CallConv};
use crate::error::BackendError;
use crate::instr::{MicroInstr, MicroInstrUseDef};
use crate::opcode::MicroInstrOpcode;
use crate::operand::{MicroCond, MicroInstrOperand, MicroOp, MicroOpBits};
use crate::reg::MicroReg;

use super::{ConformanceIssue, EncodedInstr, Encoder, MicroJump};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModRmMode {
    Memory = 0b00,
    Disp8 = 0b01,
    Disp32 = 0b10,
    Register = 0b11,
}

const MODRM_RM_SIB: u8 = 0b100;
const SIB_NO_INDEX: u8 = 0b100;

fn is_extended(index: u32) -> bool {
    index & 0b1000 != 0
}

fn encode_reg_bits(reg: MicroReg) -> u8 {
    (reg.index() & 0b111) as u8
}

fn needs_rex_for_byte_reg(reg: MicroReg) -> bool {
    reg.is_int() && matches!(reg.index(), gpr::RSP | gpr::RBP | gpr::RSI | gpr::RDI)
}

fn can_encode_signed8(value: u64) -> bool {
    let v = value as i64;
    (-0x80..=0x7F).contains(&v)
}

fn can_encode_signed32(value: u64) -> bool {
    let v = value as i64;
    (i32::MIN as i64..=i32::MAX as i64).contains(&v)
}

fn get_rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    let mut rex = 0x40;
    if w {
        rex |= 8;
    }
    if r {
        rex |= 4;
    }
    if x {
        rex |= 2;
    }
    if b {
        rex |= 1;
    }
    rex
}

fn get_modrm(mode: ModRmMode, reg: u8, rm: u8) -> u8 {
    ((mode as u8) << 6) | ((reg & 0b111) << 3) | (rm & 0b111)
}

/// Emits a REX prefix if `opBits`/either operand needs one. `opBits == B16`
/// additionally needs the 0x66 operand-size override, emitted first.
fn emit_rex(out: &mut Vec<u8>, op_bits: MicroOpBits, reg0: Option<MicroReg>, reg1: Option<MicroReg>) {
    if op_bits == MicroOpBits::B16 {
        out.push(0x66);
    }

    let ext0 = reg0.map_or(false, |r| is_extended(r.index()));
    let ext1 = reg1.map_or(false, |r| is_extended(r.index()));
    let byte_reg0 = reg0.map_or(false, needs_rex_for_byte_reg);
    let byte_reg1 = reg1.map_or(false, needs_rex_for_byte_reg);

    if op_bits == MicroOpBits::B64 || ext0 || ext1 || byte_reg0 || byte_reg1 {
        out.push(get_rex(op_bits == MicroOpBits::B64, ext1, false, ext0));
    }
}

fn emit_value(out: &mut Vec<u8>, value: u64, op_bits: MicroOpBits) {
    match op_bits {
        MicroOpBits::B8 => out.push(value as u8),
        MicroOpBits::B16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
        MicroOpBits::B32 | MicroOpBits::F32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
        MicroOpBits::B64 | MicroOpBits::F64 => out.extend_from_slice(&value.to_le_bytes()),
    }
}

/// ModRM + optional SIB + displacement for a `[mem_reg + offset]` operand,
/// handling the RSP/R12-needs-SIB and RBP/R13-needs-explicit-disp0 special
/// cases of the x86-64 ModRM encoding.
fn emit_mem_modrm(out: &mut Vec<u8>, reg_bits: u8, mem_reg: MicroReg, offset: u64) {
    let rm = mem_reg.index() & 0b111;
    let needs_sib = matches!(mem_reg.index(), gpr::RSP | gpr::R12);
    let needs_disp0 = matches!(mem_reg.index(), gpr::RBP | 13);

    if offset == 0 && !needs_disp0 {
        if needs_sib {
            out.push(get_modrm(ModRmMode::Memory, reg_bits, MODRM_RM_SIB));
            out.push((0u8 << 6) | (SIB_NO_INDEX << 3) | (rm as u8));
        } else {
            out.push(get_modrm(ModRmMode::Memory, reg_bits, rm as u8));
        }
    } else if can_encode_signed8(offset) {
        if needs_sib {
            out.push(get_modrm(ModRmMode::Disp8, reg_bits, MODRM_RM_SIB));
            out.push((0u8 << 6) | (SIB_NO_INDEX << 3) | (rm as u8));
        } else {
            out.push(get_modrm(ModRmMode::Disp8, reg_bits, rm as u8));
        }
        emit_value(out, offset, MicroOpBits::B8);
    } else {
        debug_assert!(can_encode_signed32(offset));
        if needs_sib {
            out.push(get_modrm(ModRmMode::Disp32, reg_bits, MODRM_RM_SIB));
            out.push((0u8 << 6) | (SIB_NO_INDEX << 3) | (rm as u8));
        } else {
            out.push(get_modrm(ModRmMode::Disp32, reg_bits, rm as u8));
        }
        emit_value(out, offset, MicroOpBits::B32);
    }
}

fn group1_digit(op: MicroOp) -> Option<u8> {
    match op {
        MicroOp::Add => Some(0),
        MicroOp::Or => Some(1),
        MicroOp::And => Some(4),
        MicroOp::Sub => Some(5),
        MicroOp::Xor => Some(6),
        _ => None,
    }
}

fn shift_digit(op: MicroOp) -> Option<u8> {
    match op {
        MicroOp::ShiftLeft => Some(4),
        MicroOp::ShiftRight => Some(5),
        MicroOp::ShiftRightArith => Some(7),
        _ => None,
    }
}

fn binary_reg_reg_opcode(op: MicroOp) -> Option<u8> {
    match op {
        MicroOp::Add => Some(0x01),
        MicroOp::Or => Some(0x09),
        MicroOp::And => Some(0x21),
        MicroOp::Sub => Some(0x29),
        MicroOp::Xor => Some(0x31),
        MicroOp::Exchange => Some(0x87),
        _ => None,
    }
}

fn cond_code(cond: MicroCond) -> u8 {
    match cond {
        MicroCond::Overflow => 0x0,
        MicroCond::NotOverflow => 0x1,
        MicroCond::LtUnsigned => 0x2,
        MicroCond::GeUnsigned => 0x3,
        MicroCond::Eq => 0x4,
        MicroCond::Ne => 0x5,
        MicroCond::LeUnsigned => 0x6,
        MicroCond::GtUnsigned => 0x7,
        MicroCond::Sign => 0x8,
        MicroCond::NotSign => 0x9,
        MicroCond::Lt => 0xC,
        MicroCond::Ge => 0xD,
        MicroCond::Le => 0xE,
        MicroCond::Gt => 0xF,
    }
}

/// Target x86-64, System V / Windows x64 calling conventions (spec §1, §6).
pub struct X64Encoder;

impl X64Encoder {
    pub fn new() -> Self {
        X64Encoder
    }

    fn unsupported(instr: &MicroInstr) -> BackendError {
        BackendError::UnsupportedForm {
            instr: crate::storage::Ref::INVALID,
            opcode: instr.opcode,
        }
    }
}

impl Default for X64Encoder {
    fn default() -> Self {
        X64Encoder::new()
    }
}

impl Encoder for X64Encoder {
    fn query_conformance_issue(
        &self,
        instr: &MicroInstr,
        ops: &[MicroInstrOperand],
    ) -> Option<ConformanceIssue> {
        match instr.opcode {
            MicroInstrOpcode::LoadMemImm => {
                let op_bits = ops[1].as_op_bits();
                let value = ops[3].as_u64();
                if op_bits == MicroOpBits::B64 && !can_encode_signed32(value) {
                    return Some(ConformanceIssue::SplitLoadMemImm64);
                }
                None
            }
            MicroInstrOpcode::LoadAmcMemImm => {
                let op_bits_value = ops[4].as_op_bits();
                let value = ops[7].as_u64();
                if op_bits_value == MicroOpBits::B64 && !can_encode_signed32(value) {
                    return Some(ConformanceIssue::SplitLoadAmcMemImm64);
                }
                None
            }
            MicroInstrOpcode::LoadRegImm | MicroInstrOpcode::LoadRegPtrImm => {
                let op_bits = ops[1].as_op_bits();
                if op_bits.is_float() {
                    return Some(ConformanceIssue::RewriteLoadFloatRegImm);
                }
                None
            }
            MicroInstrOpcode::OpBinaryRegReg => {
                let src = ops[1].as_reg();
                let op = ops[3].as_op();
                let cl = MicroReg::physical_int(gpr::RCX);
                if op.is_shift() && src.is_physical() && src != cl {
                    let helper = if src == MicroReg::physical_int(gpr::RAX) {
                        MicroReg::physical_int(gpr::RDX)
                    } else {
                        MicroReg::physical_int(gpr::RAX)
                    };
                    return Some(ConformanceIssue::RewriteRegRegOperandToFixedReg {
                        operand_index: 1,
                        required_reg: cl,
                        helper_reg: helper,
                    });
                }
                if op == MicroOp::Exchange {
                    let dst = ops[0].as_reg();
                    let sp = MicroReg::physical_int(gpr::RSP);
                    let forbidden = if dst == sp {
                        Some(0u8)
                    } else if src == sp {
                        Some(1u8)
                    } else {
                        None
                    };
                    if let Some(operand_index) = forbidden {
                        let scratch = if dst == MicroReg::physical_int(gpr::RAX) || src == MicroReg::physical_int(gpr::RAX) {
                            MicroReg::physical_int(gpr::RDX)
                        } else {
                            MicroReg::physical_int(gpr::RAX)
                        };
                        return Some(ConformanceIssue::RewriteRegRegOperandAwayFromFixedReg {
                            operand_index,
                            forbidden_reg: sp,
                            scratch_reg: scratch,
                        });
                    }
                }
                None
            }
            MicroInstrOpcode::OpBinaryRegImm => {
                let op = ops[2].as_op();
                let value = ops[3].as_u64();
                if op.is_shift() && value > 0x3F {
                    return Some(ConformanceIssue::ClampImmediate {
                        operand_index: 3,
                        value_limit: 0x3F,
                    });
                }
                None
            }
            MicroInstrOpcode::SetCondReg => {
                None
            }
            _ => None,
        }
    }

    fn update_reg_use_def(&self, instr: &MicroInstr, _ops: &[MicroInstrOperand], use_def: &mut MicroInstrUseDef) {
        if matches!(
            instr.opcode,
            MicroInstrOpcode::OpBinaryRegReg | MicroInstrOpcode::OpBinaryRegImm
        ) {
            // The flags register is an implicit def of every arithmetic/
            // logic opcode; this crate does not model it as a `MicroReg`
            // (spec §1 scope: no flags-dependent scheduling), so nothing is
            // added here. Kept as the seam `update_reg_use_def` exists for.
            let _ = use_def;
        }
    }

    fn stack_pointer_reg(&self) -> MicroReg {
        MicroReg::physical_int(gpr::RSP)
    }

    fn encode(
        &self,
        instr: &MicroInstr,
        ops: &[MicroInstrOperand],
        call_conv: &CallConv,
        out: &mut Vec<u8>,
    ) -> Result<EncodedInstr, BackendError> {
        let _ = call_conv;
        let start = out.len();
        match instr.opcode {
            MicroInstrOpcode::Nop => out.push(0x90),
            MicroInstrOpcode::End | MicroInstrOpcode::Debug | MicroInstrOpcode::Ignore | MicroInstrOpcode::Label => {}
            MicroInstrOpcode::Ret => out.push(0xC3),

            MicroInstrOpcode::Push => {
                let reg = ops[0].as_reg();
                if is_extended(reg.index()) {
                    out.push(get_rex(false, false, false, true));
                }
                out.push(0x50 + encode_reg_bits(reg));
            }
            MicroInstrOpcode::Pop => {
                let reg = ops[0].as_reg();
                if is_extended(reg.index()) {
                    out.push(get_rex(false, false, false, true));
                }
                out.push(0x58 + encode_reg_bits(reg));
            }

            MicroInstrOpcode::LoadRegReg => {
                let (dst, src, op_bits) = (ops[0].as_reg(), ops[1].as_reg(), ops[2].as_op_bits());
                emit_rex(out, op_bits, Some(src), Some(dst));
                out.push(0x8B);
                out.push(get_modrm(ModRmMode::Register, encode_reg_bits(dst), encode_reg_bits(src)));
            }
            MicroInstrOpcode::LoadRegImm | MicroInstrOpcode::LoadRegPtrImm => {
                let (dst, op_bits, value) = (ops[0].as_reg(), ops[1].as_op_bits(), ops[2].as_u64());
                emit_rex(out, op_bits, None, Some(dst));
                out.push(0xB8 + encode_reg_bits(dst));
                let reloc_at = out.len();
                emit_value(out, value, op_bits);
                if instr.opcode == MicroInstrOpcode::LoadRegPtrImm {
                    return Ok(EncodedInstr {
                        reloc_patch_offset: Some(reloc_at - start),
                    });
                }
            }
            MicroInstrOpcode::LoadRegMem => {
                let (dst, mem, op_bits, offset) = (ops[0].as_reg(), ops[1].as_reg(), ops[2].as_op_bits(), ops[3].as_u64());
                emit_rex(out, op_bits, Some(mem), Some(dst));
                out.push(0x8B);
                emit_mem_modrm(out, encode_reg_bits(dst), mem, offset);
            }
            MicroInstrOpcode::LoadMemReg => {
                let (mem, src, op_bits, offset) = (ops[0].as_reg(), ops[1].as_reg(), ops[2].as_op_bits(), ops[3].as_u64());
                emit_rex(out, op_bits, Some(mem), Some(src));
                out.push(0x89);
                emit_mem_modrm(out, encode_reg_bits(src), mem, offset);
            }
            MicroInstrOpcode::LoadMemImm => {
                let (mem, op_bits, offset, value) = (ops[0].as_reg(), ops[1].as_op_bits(), ops[2].as_u64(), ops[3].as_u64());
                emit_rex(out, op_bits, Some(mem), None);
                out.push(0xC7);
                emit_mem_modrm(out, 0, mem, offset);
                emit_value(out, value, if op_bits == MicroOpBits::B64 { MicroOpBits::B32 } else { op_bits });
            }
            MicroInstrOpcode::LoadAddrRegMem => {
                let (dst, mem, op_bits, offset) = (ops[0].as_reg(), ops[1].as_reg(), ops[2].as_op_bits(), ops[3].as_u64());
                emit_rex(out, op_bits, Some(mem), Some(dst));
                out.push(0x8D);
                emit_mem_modrm(out, encode_reg_bits(dst), mem, offset);
            }

            MicroInstrOpcode::CmpRegReg => {
                let (a, b, op_bits) = (ops[0].as_reg(), ops[1].as_reg(), ops[2].as_op_bits());
                emit_rex(out, op_bits, Some(a), Some(b));
                out.push(0x39);
                out.push(get_modrm(ModRmMode::Register, encode_reg_bits(b), encode_reg_bits(a)));
            }
            MicroInstrOpcode::CmpRegImm => {
                let (reg, op_bits, value) = (ops[0].as_reg(), ops[1].as_op_bits(), ops[2].as_u64());
                emit_rex(out, op_bits, Some(reg), None);
                if can_encode_signed8(value) {
                    out.push(0x83);
                    out.push(get_modrm(ModRmMode::Register, 7, encode_reg_bits(reg)));
                    emit_value(out, value, MicroOpBits::B8);
                } else {
                    out.push(0x81);
                    out.push(get_modrm(ModRmMode::Register, 7, encode_reg_bits(reg)));
                    emit_value(out, value, MicroOpBits::B32);
                }
            }
            MicroInstrOpcode::SetCondReg => {
                let (reg, cond) = (ops[0].as_reg(), ops[1].as_cond());
                if is_extended(reg.index()) || needs_rex_for_byte_reg(reg) {
                    out.push(get_rex(false, false, false, is_extended(reg.index())));
                }
                out.push(0x0F);
                out.push(0x90 + cond_code(cond));
                out.push(get_modrm(ModRmMode::Register, 0, encode_reg_bits(reg)));
            }
            MicroInstrOpcode::ClearReg => {
                let (reg, op_bits) = (ops[0].as_reg(), ops[1].as_op_bits());
                emit_rex(out, op_bits, Some(reg), Some(reg));
                out.push(0x31);
                out.push(get_modrm(ModRmMode::Register, encode_reg_bits(reg), encode_reg_bits(reg)));
            }

            MicroInstrOpcode::OpUnaryReg => {
                let (reg, op_bits, op) = (ops[0].as_reg(), ops[1].as_op_bits(), ops[2].as_op());
                let digit = match op {
                    MicroOp::Not => 2,
                    MicroOp::Neg => 3,
                    _ => return Err(Self::unsupported(instr)),
                };
                emit_rex(out, op_bits, None, Some(reg));
                out.push(0xF7);
                out.push(get_modrm(ModRmMode::Register, digit, encode_reg_bits(reg)));
            }
            MicroInstrOpcode::OpBinaryRegReg => {
                let (dst, src, op_bits, op) = (ops[0].as_reg(), ops[1].as_reg(), ops[2].as_op_bits(), ops[3].as_op());
                if op.is_shift() {
                    let digit = shift_digit(op).ok_or_else(|| Self::unsupported(instr))?;
                    emit_rex(out, op_bits, None, Some(dst));
                    out.push(0xD3);
                    out.push(get_modrm(ModRmMode::Register, digit, encode_reg_bits(dst)));
                } else if op == MicroOp::Mul {
                    emit_rex(out, op_bits, Some(dst), Some(src));
                    out.push(0x0F);
                    out.push(0xAF);
                    out.push(get_modrm(ModRmMode::Register, encode_reg_bits(dst), encode_reg_bits(src)));
                } else {
                    let opcode = binary_reg_reg_opcode(op).ok_or_else(|| Self::unsupported(instr))?;
                    emit_rex(out, op_bits, Some(dst), Some(src));
                    out.push(opcode);
                    out.push(get_modrm(ModRmMode::Register, encode_reg_bits(src), encode_reg_bits(dst)));
                }
            }
            MicroInstrOpcode::OpBinaryRegImm => {
                let (reg, op_bits, op, value) = (ops[0].as_reg(), ops[1].as_op_bits(), ops[2].as_op(), ops[3].as_u64());
                if op.is_shift() {
                    let digit = shift_digit(op).ok_or_else(|| Self::unsupported(instr))?;
                    emit_rex(out, op_bits, None, Some(reg));
                    out.push(0xC1);
                    out.push(get_modrm(ModRmMode::Register, digit, encode_reg_bits(reg)));
                    emit_value(out, value, MicroOpBits::B8);
                } else {
                    let digit = group1_digit(op).ok_or_else(|| Self::unsupported(instr))?;
                    emit_rex(out, op_bits, None, Some(reg));
                    if can_encode_signed8(value) {
                        out.push(0x83);
                        out.push(get_modrm(ModRmMode::Register, digit, encode_reg_bits(reg)));
                        emit_value(out, value, MicroOpBits::B8);
                    } else {
                        out.push(0x81);
                        out.push(get_modrm(ModRmMode::Register, digit, encode_reg_bits(reg)));
                        emit_value(out, value, MicroOpBits::B32);
                    }
                }
            }

            MicroInstrOpcode::CallLocal | MicroInstrOpcode::CallExtern => {
                out.push(0xE8);
                let reloc_at = out.len();
                emit_value(out, 0, MicroOpBits::B32);
                return Ok(EncodedInstr {
                    reloc_patch_offset: Some(reloc_at - start),
                });
            }
            MicroInstrOpcode::CallIndirect => {
                let reg = ops[0].as_reg();
                if is_extended(reg.index()) {
                    out.push(get_rex(false, false, false, true));
                }
                out.push(0xFF);
                out.push(get_modrm(ModRmMode::Register, 2, encode_reg_bits(reg)));
            }
            MicroInstrOpcode::JumpReg => {
                let reg = ops[0].as_reg();
                if is_extended(reg.index()) {
                    out.push(get_rex(false, false, false, true));
                }
                out.push(0xFF);
                out.push(get_modrm(ModRmMode::Register, 4, encode_reg_bits(reg)));
            }
            MicroInstrOpcode::JumpCond => {
                let cond = ops[0].as_cond();
                out.push(0x0F);
                out.push(0x80 + cond_code(cond));
                let reloc_at = out.len();
                emit_value(out, 0, MicroOpBits::B32);
                return Ok(EncodedInstr {
                    reloc_patch_offset: Some(reloc_at - start),
                });
            }
            MicroInstrOpcode::JumpCondImm => {
                // Destination is already a resolved displacement, unlike
                // `JumpCond` (label-relative, patched after emission) -
                // written directly, no pending patch needed.
                let (cond, value) = (ops[0].as_cond(), ops[2].as_u64());
                out.push(0x0F);
                out.push(0x80 + cond_code(cond));
                emit_value(out, value, MicroOpBits::B32);
            }

            _ => return Err(Self::unsupported(instr)),
        }

        Ok(EncodedInstr {
            reloc_patch_offset: None,
        })
    }

    fn jump_form(&self) -> MicroJump {
        // `0x0F 0x80+cc` (6 bytes) is the widest near-conditional form this
        // encoder emits; patch site is the trailing 4-byte displacement.
        MicroJump {
            byte_len: 6,
            patch_offset: 2,
        }
    }
}
