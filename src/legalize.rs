//! Legalization pass (spec §4.H), grounded in
//! `Backend/Micro/Passes/MicroLegalizePass.cpp`.
//!
//! Runs after register allocation and prolog/epilog insertion, so every
//! operand this pass sees is a concrete physical register or a resolved
//! stack offset — its job is purely to rewrite instruction *shapes* the
//! target encoder cannot emit directly into ones it can, by repeatedly
//! asking the encoder what is wrong (`Encoder::query_conformance_issue`)
//! and applying the matching rewrite until nothing is left to fix.

use crate::callconv::CallConv;
use crate::encoder::ConformanceIssue;
use crate::error::{BackendError, BackendResult};
use crate::instr::MicroInstr;
use crate::opcode::MicroInstrOpcode;
use crate::operand::{MicroInstrOperand, MicroOp, MicroOpBits};
use crate::pass::{MicroPassContext, Pass, PassKind};
use crate::reg::MicroReg;
use crate::storage::Ref;

/// Bytes a single reusable scratch slot occupies for register-stash
/// rewrites (`RewriteRegRegOperandToFixedReg`/`AwayFromFixedReg`).
const REG_STACK_SLOT_SIZE: u64 = 8;
/// Bytes needed to round-trip a float immediate through the stack
/// (`RewriteLoadFloatRegImm`).
const FLOAT_STACK_SCRATCH: u64 = 8;
const LEGALIZE_STACK_ALIGN: u64 = 16;
/// Bound on the per-instruction rewrite-then-requery loop; if an encoder
/// keeps reporting issues past this, legalization is not converging and
/// `BackendError::LegalizationStuck` is the honest answer instead of an
/// infinite loop.
const MAX_REWRITES_PER_INSTRUCTION: u32 = 8;

fn required_scratch_for_issue(issue: &ConformanceIssue) -> u64 {
    match issue {
        ConformanceIssue::RewriteLoadFloatRegImm => FLOAT_STACK_SCRATCH,
        ConformanceIssue::RewriteRegRegOperandToFixedReg { .. } => REG_STACK_SLOT_SIZE,
        ConformanceIssue::RewriteRegRegOperandAwayFromFixedReg { .. } => REG_STACK_SLOT_SIZE,
        _ => 0,
    }
}

pub struct LegalizePass {
    call_conv: &'static CallConv,
}

impl LegalizePass {
    pub fn new(call_conv: &'static CallConv) -> Self {
        LegalizePass { call_conv }
    }

    fn stack_pointer(&self, ctx: &MicroPassContext) -> MicroReg {
        ctx.encoder.stack_pointer_reg()
    }

    /// Pre-scans every instruction for the scratch space its first
    /// conformance issue (if any) would need, and inserts one aligned
    /// `sub sp, n` at the function's first instruction plus a matching
    /// `add sp, n` before every `Ret`, mirroring the source's single
    /// shared scratch frame rather than a per-rewrite allocation.
    fn insert_scratch_frame(&self, ctx: &mut MicroPassContext) -> BackendResult<u64> {
        let mut max_scratch = 0u64;
        let mut cur = ctx.instructions.head();
        while cur.is_valid() {
            let instr = *ctx.instructions.get(cur);
            let ops = instr.ops(ctx.operands).to_vec();
            if let Some(issue) = ctx.encoder.query_conformance_issue(&instr, &ops) {
                max_scratch = max_scratch.max(required_scratch_for_issue(&issue));
            }
            cur = ctx.instructions.next(cur);
        }

        if max_scratch == 0 {
            return Ok(0);
        }

        let aligned = (max_scratch + LEGALIZE_STACK_ALIGN - 1) / LEGALIZE_STACK_ALIGN * LEGALIZE_STACK_ALIGN;
        let sp = self.stack_pointer(ctx);

        let head = ctx.instructions.head();
        if head.is_valid() {
            insert_binary_reg_imm_before(ctx, head, sp, aligned, MicroOp::Sub);
        }

        let mut cur = ctx.instructions.head();
        while cur.is_valid() {
            let instr = *ctx.instructions.get(cur);
            if instr.opcode == MicroInstrOpcode::Ret {
                insert_binary_reg_imm_before(ctx, cur, sp, aligned, MicroOp::Add);
            }
            cur = ctx.instructions.next(cur);
        }

        Ok(aligned)
    }

    fn apply_issue(
        &self,
        ctx: &mut MicroPassContext,
        instr_ref: Ref,
        scratch_offset: u64,
        issue: ConformanceIssue,
    ) -> BackendResult<bool> {
        match issue {
            ConformanceIssue::ClampImmediate {
                operand_index,
                value_limit,
            } => {
                let instr = *ctx.instructions.get(instr_ref);
                let ops = instr.ops_mut(ctx.operands);
                let clamped = ops[operand_index as usize].as_u64().min(value_limit);
                ops[operand_index as usize] = MicroInstrOperand::ValueU64(clamped);
                Ok(true)
            }
            ConformanceIssue::NormalizeOpBits {
                operand_index,
                normalized,
            } => {
                let instr = *ctx.instructions.get(instr_ref);
                let ops = instr.ops_mut(ctx.operands);
                ops[operand_index as usize] = MicroInstrOperand::OpBits(normalized);
                Ok(true)
            }
            ConformanceIssue::SplitLoadMemImm64 => {
                self.split_load_mem_imm64(ctx, instr_ref);
                Ok(true)
            }
            ConformanceIssue::SplitLoadAmcMemImm64 => {
                self.split_load_amc_mem_imm64(ctx, instr_ref);
                Ok(true)
            }
            ConformanceIssue::RewriteLoadFloatRegImm => {
                self.rewrite_load_float_reg_imm(ctx, instr_ref, scratch_offset);
                Ok(true)
            }
            ConformanceIssue::RewriteRegRegOperandToFixedReg {
                operand_index,
                required_reg,
                helper_reg,
            } => {
                self.rewrite_to_fixed_reg(ctx, instr_ref, operand_index, required_reg, helper_reg, scratch_offset);
                Ok(true)
            }
            ConformanceIssue::RewriteRegRegOperandAwayFromFixedReg {
                operand_index,
                forbidden_reg,
                scratch_reg,
            } => {
                let _ = forbidden_reg;
                self.rewrite_away_from_fixed_reg(ctx, instr_ref, operand_index, scratch_reg, scratch_offset);
                Ok(true)
            }
        }
    }

    /// A 64-bit immediate store has no direct x86-64 encoding (the `mov
    /// m64, imm32` form sign-extends); split into a low/high 32-bit pair of
    /// stores at `offset`/`offset + 4`.
    fn split_load_mem_imm64(&self, ctx: &mut MicroPassContext, instr_ref: Ref) {
        let instr = *ctx.instructions.get(instr_ref);
        let ops = instr.ops(ctx.operands);
        let (mem, op_bits, offset, value) = (ops[0].as_reg(), ops[1].as_op_bits(), ops[2].as_u64(), ops[3].as_u64());
        debug_assert_eq!(op_bits, MicroOpBits::B64);
        let low = value & 0xFFFF_FFFF;
        let high = (value >> 32) & 0xFFFF_FFFF;
        insert_load_mem_imm_before(ctx, instr_ref, mem, offset, low, MicroOpBits::B32);
        insert_load_mem_imm_before(ctx, instr_ref, mem, offset + 4, high, MicroOpBits::B32);
        ctx.instructions.erase(instr_ref);
    }

    fn split_load_amc_mem_imm64(&self, ctx: &mut MicroPassContext, instr_ref: Ref) {
        let instr = *ctx.instructions.get(instr_ref);
        let ops = instr.ops(ctx.operands);
        let (base, mul_reg, op_bits_base_mul, mul_value, add_value, value) = (
            ops[0].as_reg(),
            ops[1].as_reg(),
            ops[3].as_op_bits(),
            ops[5].as_u64(),
            ops[6].as_u64(),
            ops[7].as_u64(),
        );
        let low = value & 0xFFFF_FFFF;
        let high = (value >> 32) & 0xFFFF_FFFF;
        insert_load_amc_mem_imm_before(ctx, instr_ref, base, mul_reg, mul_value, add_value, op_bits_base_mul, low, MicroOpBits::B32);
        insert_load_amc_mem_imm_before(ctx, instr_ref, base, mul_reg, mul_value, add_value + 4, op_bits_base_mul, high, MicroOpBits::B32);
        ctx.instructions.erase(instr_ref);
    }

    /// `LoadRegImm` into a float register has no direct encoding (there is
    /// no move-immediate-to-xmm form); round-trip the bit pattern through
    /// an integer register and the scratch stack slot.
    fn rewrite_load_float_reg_imm(&self, ctx: &mut MicroPassContext, instr_ref: Ref, scratch_offset: u64) {
        let instr = *ctx.instructions.get(instr_ref);
        let ops = instr.ops(ctx.operands);
        let (dst, op_bits, value) = (ops[0].as_reg(), ops[1].as_op_bits(), ops[2].as_u64());
        let sp = self.stack_pointer(ctx);
        let int_bits = if op_bits == MicroOpBits::F64 { MicroOpBits::B64 } else { MicroOpBits::B32 };
        let scratch_int = MicroReg::physical_int(crate::callconv::gpr::RAX);

        insert_load_reg_imm_before(ctx, instr_ref, scratch_int, value, int_bits);
        insert_load_mem_reg_before(ctx, instr_ref, sp, scratch_offset, scratch_int, int_bits);
        insert_load_reg_mem_before(ctx, instr_ref, dst, sp, scratch_offset, op_bits);
        ctx.instructions.erase(instr_ref);
    }

    /// Pins `ops[operand_index]` into `required_reg`. Two independent
    /// conflicts are resolved, per spec §4.H:
    ///
    /// - if the *other* operand already holds `required_reg`, it is routed
    ///   through `helper_reg` for the duration of the rewritten instruction
    ///   and the result moved back afterward (the helper is pure scratch —
    ///   whatever it held is not live past this rewrite, so no save/restore
    ///   of `helper_reg` itself is needed);
    /// - if `required_reg`'s own prior value is still live past this
    ///   instruction (per `must_preserve_past`), it is stashed to the
    ///   scratch slot and restored afterward.
    fn rewrite_to_fixed_reg(
        &self,
        ctx: &mut MicroPassContext,
        instr_ref: Ref,
        operand_index: u8,
        required_reg: MicroReg,
        helper_reg: MicroReg,
        scratch_offset: u64,
    ) {
        debug_assert_eq!(ctx.instructions.get(instr_ref).opcode, MicroInstrOpcode::OpBinaryRegReg);
        let other_index = if operand_index == 0 { 1 } else { 0 };
        let sp = self.stack_pointer(ctx);

        let instr = *ctx.instructions.get(instr_ref);
        let ops = instr.ops(ctx.operands);
        let moving = ops[operand_index as usize].as_reg();
        let other = ops[other_index as usize].as_reg();
        let op_bits = ops[2].as_op_bits();

        let other_conflicts = other == required_reg;
        let must_preserve = !other_conflicts && must_preserve_past(ctx, instr_ref, required_reg);

        if other_conflicts {
            insert_load_reg_reg_before(ctx, instr_ref, helper_reg, required_reg, op_bits);
            let instr = *ctx.instructions.get(instr_ref);
            instr.ops_mut(ctx.operands)[other_index as usize] = MicroInstrOperand::Reg(helper_reg);
        } else if must_preserve {
            insert_load_mem_reg_before(ctx, instr_ref, sp, scratch_offset, required_reg, op_bits);
        }

        if moving != required_reg {
            insert_load_reg_reg_before(ctx, instr_ref, required_reg, moving, op_bits);
        }
        let instr = *ctx.instructions.get(instr_ref);
        instr.ops_mut(ctx.operands)[operand_index as usize] = MicroInstrOperand::Reg(required_reg);

        if other_conflicts {
            // `other_index` was a UseDef slot wearing `helper_reg`; copy its
            // post-instruction value back into the register it logically
            // belongs to.
            insert_load_reg_reg_after(ctx, instr_ref, required_reg, helper_reg, op_bits);
        } else if must_preserve {
            insert_load_reg_mem_after(ctx, instr_ref, required_reg, sp, scratch_offset, op_bits);
        }
    }

    /// Moves `ops[operand_index]` out of `forbidden_reg` into `scratch_reg`
    /// before the instruction runs, saving/restoring `scratch_reg`'s own
    /// prior value around the rewrite if it is still live afterward.
    fn rewrite_away_from_fixed_reg(
        &self,
        ctx: &mut MicroPassContext,
        instr_ref: Ref,
        operand_index: u8,
        scratch_reg: MicroReg,
        scratch_offset: u64,
    ) {
        debug_assert_eq!(ctx.instructions.get(instr_ref).opcode, MicroInstrOpcode::OpBinaryRegReg);
        let sp = self.stack_pointer(ctx);
        let instr = *ctx.instructions.get(instr_ref);
        let ops = instr.ops(ctx.operands);
        let op_bits = ops[2].as_op_bits();
        let current = ops[operand_index as usize].as_reg();

        let must_preserve = must_preserve_past(ctx, instr_ref, scratch_reg);
        if must_preserve {
            insert_load_mem_reg_before(ctx, instr_ref, sp, scratch_offset, scratch_reg, op_bits);
        }
        insert_load_reg_reg_before(ctx, instr_ref, scratch_reg, current, op_bits);
        let instr = *ctx.instructions.get(instr_ref);
        instr.ops_mut(ctx.operands)[operand_index as usize] = MicroInstrOperand::Reg(scratch_reg);

        if must_preserve {
            insert_load_reg_mem_after(ctx, instr_ref, scratch_reg, sp, scratch_offset, op_bits);
        }
    }
}

/// Forward data-flow scan: is `reg`'s current value still observable after
/// `start`? Walks instructions strictly after `start`; a use before any
/// redefinition means yes, a redefinition before any use means no, and a
/// call/return/label placement is a conservative barrier (spec §4.H).
fn must_preserve_past(ctx: &MicroPassContext, start: Ref, reg: MicroReg) -> bool {
    let mut cur = ctx.instructions.next(start);
    while cur.is_valid() {
        let instr = *ctx.instructions.get(cur);
        match instr.opcode {
            MicroInstrOpcode::CallLocal
            | MicroInstrOpcode::CallExtern
            | MicroInstrOpcode::CallIndirect
            | MicroInstrOpcode::Ret
            | MicroInstrOpcode::Label => return true,
            _ => {}
        }
        let use_def = instr.collect_use_def(ctx.operands);
        if use_def.uses.contains(&reg) {
            return true;
        }
        if use_def.defs.contains(&reg) {
            return false;
        }
        cur = ctx.instructions.next(cur);
    }
    false
}

fn insert_binary_reg_imm_before(ctx: &mut MicroPassContext, before: Ref, reg: MicroReg, value: u64, op: MicroOp) {
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(reg);
    slots[1] = MicroInstrOperand::OpBits(MicroOpBits::B64);
    slots[2] = MicroInstrOperand::Op(op);
    slots[3] = MicroInstrOperand::ValueU64(value);
    let new_instr = MicroInstr::new(MicroInstrOpcode::OpBinaryRegImm, base, 4);
    ctx.instructions.insert_before(before, new_instr);
}

fn insert_load_mem_imm_before(ctx: &mut MicroPassContext, before: Ref, mem: MicroReg, offset: u64, value: u64, op_bits: MicroOpBits) {
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(mem);
    slots[1] = MicroInstrOperand::OpBits(op_bits);
    slots[2] = MicroInstrOperand::ValueU64(offset);
    slots[3] = MicroInstrOperand::ValueU64(value);
    let new_instr = MicroInstr::new(MicroInstrOpcode::LoadMemImm, base, 4);
    ctx.instructions.insert_before(before, new_instr);
}

#[allow(clippy::too_many_arguments)]
fn insert_load_amc_mem_imm_before(
    ctx: &mut MicroPassContext,
    before: Ref,
    base_reg: MicroReg,
    mul_reg: MicroReg,
    mul_value: u64,
    add_value: u64,
    op_bits_base_mul: MicroOpBits,
    value: u64,
    op_bits_value: MicroOpBits,
) {
    let base = ctx.operands.emplace_array(8);
    let slots = ctx.operands.slice_mut(base, 8);
    slots[0] = MicroInstrOperand::Reg(base_reg);
    slots[1] = MicroInstrOperand::Reg(mul_reg);
    slots[2] = MicroInstrOperand::None;
    slots[3] = MicroInstrOperand::OpBits(op_bits_base_mul);
    slots[4] = MicroInstrOperand::OpBits(op_bits_value);
    slots[5] = MicroInstrOperand::ValueU64(mul_value);
    slots[6] = MicroInstrOperand::ValueU64(add_value);
    slots[7] = MicroInstrOperand::ValueU64(value);
    let new_instr = MicroInstr::new(MicroInstrOpcode::LoadAmcMemImm, base, 8);
    ctx.instructions.insert_before(before, new_instr);
}

fn insert_load_reg_imm_before(ctx: &mut MicroPassContext, before: Ref, dst: MicroReg, value: u64, op_bits: MicroOpBits) {
    let base = ctx.operands.emplace_array(3);
    let slots = ctx.operands.slice_mut(base, 3);
    slots[0] = MicroInstrOperand::Reg(dst);
    slots[1] = MicroInstrOperand::OpBits(op_bits);
    slots[2] = MicroInstrOperand::ValueU64(value);
    let new_instr = MicroInstr::new(MicroInstrOpcode::LoadRegImm, base, 3);
    ctx.instructions.insert_before(before, new_instr);
}

fn insert_load_reg_reg_before(ctx: &mut MicroPassContext, before: Ref, dst: MicroReg, src: MicroReg, op_bits: MicroOpBits) {
    let base = ctx.operands.emplace_array(3);
    let slots = ctx.operands.slice_mut(base, 3);
    slots[0] = MicroInstrOperand::Reg(dst);
    slots[1] = MicroInstrOperand::Reg(src);
    slots[2] = MicroInstrOperand::OpBits(op_bits);
    let new_instr = MicroInstr::new(MicroInstrOpcode::LoadRegReg, base, 3);
    ctx.instructions.insert_before(before, new_instr);
}

fn insert_load_mem_reg_before(ctx: &mut MicroPassContext, before: Ref, mem: MicroReg, offset: u64, reg: MicroReg, op_bits: MicroOpBits) {
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(mem);
    slots[1] = MicroInstrOperand::Reg(reg);
    slots[2] = MicroInstrOperand::OpBits(op_bits);
    slots[3] = MicroInstrOperand::ValueU64(offset);
    let new_instr = MicroInstr::new(MicroInstrOpcode::LoadMemReg, base, 4);
    ctx.instructions.insert_before(before, new_instr);
}

fn insert_load_reg_mem_before(ctx: &mut MicroPassContext, before: Ref, dst: MicroReg, mem: MicroReg, offset: u64, op_bits: MicroOpBits) {
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(dst);
    slots[1] = MicroInstrOperand::Reg(mem);
    slots[2] = MicroInstrOperand::OpBits(op_bits);
    slots[3] = MicroInstrOperand::ValueU64(offset);
    let new_instr = MicroInstr::new(MicroInstrOpcode::LoadRegMem, base, 4);
    ctx.instructions.insert_before(before, new_instr);
}

fn insert_load_reg_mem_after(ctx: &mut MicroPassContext, after: Ref, dst: MicroReg, mem: MicroReg, offset: u64, op_bits: MicroOpBits) {
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(dst);
    slots[1] = MicroInstrOperand::Reg(mem);
    slots[2] = MicroInstrOperand::OpBits(op_bits);
    slots[3] = MicroInstrOperand::ValueU64(offset);
    let new_instr = MicroInstr::new(MicroInstrOpcode::LoadRegMem, base, 4);
    ctx.instructions.insert_after(after, new_instr);
}

fn insert_load_reg_reg_after(ctx: &mut MicroPassContext, after: Ref, dst: MicroReg, src: MicroReg, op_bits: MicroOpBits) {
    let base = ctx.operands.emplace_array(3);
    let slots = ctx.operands.slice_mut(base, 3);
    slots[0] = MicroInstrOperand::Reg(dst);
    slots[1] = MicroInstrOperand::Reg(src);
    slots[2] = MicroInstrOperand::OpBits(op_bits);
    let new_instr = MicroInstr::new(MicroInstrOpcode::LoadRegReg, base, 3);
    ctx.instructions.insert_after(after, new_instr);
}

impl Pass for LegalizePass {
    fn kind(&self) -> PassKind {
        PassKind::Legalize
    }

    fn run(&mut self, ctx: &mut MicroPassContext) -> BackendResult<bool> {
        let scratch_bytes = self.insert_scratch_frame(ctx)?;
        let mut changed = false;

        let mut cur = ctx.instructions.head();
        while cur.is_valid() {
            let next = ctx.instructions.next(cur);
            let mut iterations = 0;
            loop {
                if !ctx.instructions.is_alive(cur) {
                    break;
                }
                let instr = *ctx.instructions.get(cur);
                let ops = instr.ops(ctx.operands).to_vec();
                let issue = ctx.encoder.query_conformance_issue(&instr, &ops);
                let Some(issue) = issue else { break };

                if iterations >= MAX_REWRITES_PER_INSTRUCTION {
                    return Err(BackendError::LegalizationStuck {
                        instr: cur,
                        kind: issue.debug_name(),
                    });
                }
                iterations += 1;
                changed |= self.apply_issue(ctx, cur, scratch_bytes, issue)?;
                if !ctx.instructions.is_alive(cur) {
                    break;
                }
            }
            cur = next;
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MicroBuilder;
    use crate::callconv::{gpr, CallConvKind};
    use crate::encoder::X64Encoder;

    fn run_legalize(builder: &mut MicroBuilder) -> bool {
        let encoder = X64Encoder::new();
        let call_conv = CallConv::get(CallConvKind::SystemV);
        let (instructions, operands) = builder.storages_mut();
        let mut ctx = MicroPassContext::new(&encoder, instructions, operands, CallConvKind::SystemV);
        let mut pass = LegalizePass::new(call_conv);
        pass.run(&mut ctx).unwrap()
    }

    #[test]
    fn already_legal_stream_is_a_no_op() {
        let mut b = MicroBuilder::new();
        b.emit_load_reg_imm(MicroReg::physical_int(gpr::RAX), 7, MicroOpBits::B64);
        b.emit_ret();
        let changed = run_legalize(&mut b);
        assert!(!changed, "a stream the encoder already accepts must not be rewritten");
    }

    #[test]
    fn shift_count_clamp_at_the_limit_is_not_rewritten() {
        let mut b = MicroBuilder::new();
        b.emit_op_binary_reg_imm(MicroReg::physical_int(gpr::RAX), 0x3F, MicroOp::ShiftLeft, MicroOpBits::B32);
        b.emit_ret();
        let changed = run_legalize(&mut b);
        assert!(!changed, "0x3F is already within range for a shift count immediate");
    }

    #[test]
    fn shift_count_past_the_limit_gets_clamped() {
        let mut b = MicroBuilder::new();
        b.emit_op_binary_reg_imm(MicroReg::physical_int(gpr::RAX), 0xFF, MicroOp::ShiftLeft, MicroOpBits::B32);
        b.emit_ret();
        run_legalize(&mut b);

        let (instructions, operands) = b.storages_mut();
        let instr = instructions.get(instructions.head());
        assert_eq!(instr.ops(operands)[2].as_u64(), 0x3F);
    }

    #[test]
    fn shift_count_just_past_the_limit_is_clamped_not_masked() {
        // 0x40 & 0x3F == 0 but min(0x40, 0x3F) == 0x3F: this distinguishes a
        // bitwise-mask bug from the numeric clamp spec §4.H actually asks for.
        let mut b = MicroBuilder::new();
        b.emit_op_binary_reg_imm(MicroReg::physical_int(gpr::RAX), 0x40, MicroOp::ShiftLeft, MicroOpBits::B32);
        b.emit_ret();
        run_legalize(&mut b);

        let (instructions, operands) = b.storages_mut();
        let instr = instructions.get(instructions.head());
        assert_eq!(instr.ops(operands)[2].as_u64(), 0x3F);
    }

    #[test]
    fn sixty_four_bit_mem_imm_store_is_split_in_two() {
        let mut b = MicroBuilder::new();
        let sp = MicroReg::physical_int(gpr::RSP);
        b.emit_load_mem_imm(sp, 0, 0xFFFF_FFFF_0000_0001, MicroOpBits::B64);
        b.emit_ret();
        run_legalize(&mut b);

        let (instructions, _operands) = b.storages_mut();
        let opcodes: Vec<_> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(opcodes, vec![MicroInstrOpcode::LoadMemImm, MicroInstrOpcode::LoadMemImm, MicroInstrOpcode::Ret]);
    }

    #[test]
    fn variable_shift_not_in_cl_is_routed_through_rcx() {
        let mut b = MicroBuilder::new();
        let dst = MicroReg::physical_int(gpr::RAX);
        let src = MicroReg::physical_int(gpr::RDX);
        b.emit_op_binary_reg_reg(dst, src, MicroOp::ShiftLeft, MicroOpBits::B32);
        b.emit_ret();
        run_legalize(&mut b);

        let (instructions, operands) = b.storages_mut();
        let rcx = MicroReg::physical_int(gpr::RCX);
        let shift = instructions
            .iter()
            .find(|i| i.opcode == MicroInstrOpcode::OpBinaryRegReg)
            .expect("shift instruction must survive legalization");
        assert_eq!(shift.ops(operands)[1].as_reg(), rcx);
    }

    #[test]
    fn legalizing_twice_is_idempotent() {
        let mut b = MicroBuilder::new();
        b.emit_op_binary_reg_reg(
            MicroReg::physical_int(gpr::RAX),
            MicroReg::physical_int(gpr::RDX),
            MicroOp::ShiftLeft,
            MicroOpBits::B32,
        );
        b.emit_ret();
        run_legalize(&mut b);

        let (instructions, _operands) = b.storages_mut();
        let opcodes_after_first: Vec<_> = instructions.iter().map(|i| i.opcode).collect();

        let changed_second = run_legalize(&mut b);
        assert!(!changed_second, "re-running legalization on an already-legal stream must be a no-op");

        let (instructions, _operands) = b.storages_mut();
        let opcodes_after_second: Vec<_> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(opcodes_after_first, opcodes_after_second);
    }
}
