//! Prolog/epilog pass (spec §4.G), grounded in
//! `Backend/Micro/Passes/MicroPrologEpilogPass.cpp`.
//!
//! Runs before register allocation (spec §2's documented pipeline order),
//! so it only ever sees operands that are already concrete physical
//! registers — virtual registers have not been assigned yet. In practice
//! that means this pass is a no-op on vreg-heavy input and only fires when
//! the builder itself hands it fixed physical registers directly (e.g. an
//! ABI-mandated calling sequence), which matches spec §8's boundary case:
//! "`preservePersistentRegs` true but no persistent reg is used inserts
//! nothing".

use crate::callconv::CallConv;
use crate::error::BackendResult;
use crate::instr::MicroInstr;
use crate::opcode::MicroInstrOpcode;
use crate::operand::{MicroInstrOperand, MicroOp, MicroOpBits};
use crate::pass::{MicroPassContext, Pass, PassKind};
use crate::reg::MicroReg;
use crate::storage::Ref;

const FLOAT_SLOT_SIZE: u64 = 16;

pub struct PrologEpilogPass {
    call_conv: &'static CallConv,
}

impl PrologEpilogPass {
    pub fn new(call_conv: &'static CallConv) -> Self {
        PrologEpilogPass { call_conv }
    }

    /// Scans concrete register operands across the whole stream, in order
    /// of first appearance, and returns the persistent int/float regs that
    /// are actually used (spec §4.G "Scans concrete register operands").
    fn used_persistent_regs(&self, ctx: &MicroPassContext) -> (Vec<MicroReg>, Vec<MicroReg>) {
        let mut int_regs = Vec::new();
        let mut float_regs = Vec::new();
        let mut cur = ctx.instructions.head();
        while cur.is_valid() {
            let instr = *ctx.instructions.get(cur);
            for ro in instr.collect_reg_operands(ctx.operands) {
                let reg = ro.reg;
                if reg.is_virtual() {
                    continue;
                }
                if reg.is_int() && self.call_conv.is_int_persistent_reg(reg) && !int_regs.contains(&reg) {
                    int_regs.push(reg);
                } else if reg.is_float() && self.call_conv.is_float_persistent_reg(reg) && !float_regs.contains(&reg) {
                    float_regs.push(reg);
                }
            }
            cur = ctx.instructions.next(cur);
        }
        (int_regs, float_regs)
    }
}

fn insert_push_before(ctx: &mut MicroPassContext, before: Ref, reg: MicroReg) {
    let base = ctx.operands.emplace_array(1);
    ctx.operands.slice_mut(base, 1)[0] = MicroInstrOperand::Reg(reg);
    let instr = MicroInstr::new(MicroInstrOpcode::Push, base, 1);
    ctx.instructions.insert_before(before, instr);
}

fn insert_pop_before(ctx: &mut MicroPassContext, before: Ref, reg: MicroReg) {
    let base = ctx.operands.emplace_array(1);
    ctx.operands.slice_mut(base, 1)[0] = MicroInstrOperand::Reg(reg);
    let instr = MicroInstr::new(MicroInstrOpcode::Pop, base, 1);
    ctx.instructions.insert_before(before, instr);
}

fn insert_binary_reg_imm_before(ctx: &mut MicroPassContext, before: Ref, reg: MicroReg, value: u64, op: MicroOp) {
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(reg);
    slots[1] = MicroInstrOperand::OpBits(MicroOpBits::B64);
    slots[2] = MicroInstrOperand::Op(op);
    slots[3] = MicroInstrOperand::ValueU64(value);
    let instr = MicroInstr::new(MicroInstrOpcode::OpBinaryRegImm, base, 4);
    ctx.instructions.insert_before(before, instr);
}

fn insert_store_float_before(ctx: &mut MicroPassContext, before: Ref, sp: MicroReg, reg: MicroReg, offset: u64) {
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(sp);
    slots[1] = MicroInstrOperand::Reg(reg);
    slots[2] = MicroInstrOperand::OpBits(MicroOpBits::F64);
    slots[3] = MicroInstrOperand::ValueU64(offset);
    let instr = MicroInstr::new(MicroInstrOpcode::LoadMemReg, base, 4);
    ctx.instructions.insert_before(before, instr);
}

fn insert_load_float_before(ctx: &mut MicroPassContext, before: Ref, reg: MicroReg, sp: MicroReg, offset: u64) {
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(reg);
    slots[1] = MicroInstrOperand::Reg(sp);
    slots[2] = MicroInstrOperand::OpBits(MicroOpBits::F64);
    slots[3] = MicroInstrOperand::ValueU64(offset);
    let instr = MicroInstr::new(MicroInstrOpcode::LoadRegMem, base, 4);
    ctx.instructions.insert_before(before, instr);
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

impl Pass for PrologEpilogPass {
    fn kind(&self) -> PassKind {
        PassKind::PrologEpilog
    }

    fn run(&mut self, ctx: &mut MicroPassContext) -> BackendResult<bool> {
        if !ctx.preserve_persistent_regs {
            return Ok(false);
        }

        let head = ctx.instructions.head();
        if !head.is_valid() {
            return Ok(false);
        }

        let (int_regs, float_regs) = self.used_persistent_regs(ctx);
        if int_regs.is_empty() && float_regs.is_empty() {
            return Ok(false);
        }

        let push_area = int_regs.len() as u64 * 8;
        let slot_area = float_regs.len() as u64 * FLOAT_SLOT_SIZE;
        let total = push_area + slot_area;
        let aligned_total = round_up(total, self.call_conv.stack_alignment);
        let extra = aligned_total - total;
        let sub_amount = slot_area + extra;

        let sp = self.call_conv.stack_pointer;

        // Prologue: pushes in appearance order, then the float slot area,
        // then the float stores.
        for &reg in &int_regs {
            insert_push_before(ctx, head, reg);
        }
        if sub_amount > 0 {
            insert_binary_reg_imm_before(ctx, head, sp, sub_amount, MicroOp::Sub);
        }
        for (i, &reg) in float_regs.iter().enumerate() {
            insert_store_float_before(ctx, head, sp, reg, i as u64 * FLOAT_SLOT_SIZE);
        }

        // Epilogue, mirror image, inserted before every `Ret`.
        let order: Vec<Ref> = ctx.instructions.iter_refs().map(|(r, _)| r).collect();
        for &r in &order {
            if !ctx.instructions.is_alive(r) {
                continue;
            }
            if ctx.instructions.get(r).opcode != MicroInstrOpcode::Ret {
                continue;
            }
            for (i, &reg) in float_regs.iter().enumerate() {
                insert_load_float_before(ctx, r, reg, sp, i as u64 * FLOAT_SLOT_SIZE);
            }
            if sub_amount > 0 {
                insert_binary_reg_imm_before(ctx, r, sp, sub_amount, MicroOp::Add);
            }
            for &reg in int_regs.iter().rev() {
                insert_pop_before(ctx, r, reg);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MicroBuilder;
    use crate::callconv::{gpr, CallConvKind};
    use crate::encoder::X64Encoder;

    fn run_pass(builder: &mut MicroBuilder) -> bool {
        let encoder = X64Encoder::new();
        let call_conv = CallConv::get(CallConvKind::SystemV);
        let (instructions, operands) = builder.storages_mut();
        let mut ctx = MicroPassContext::new(&encoder, instructions, operands, CallConvKind::SystemV);
        let mut pass = PrologEpilogPass::new(call_conv);
        pass.run(&mut ctx).unwrap()
    }

    #[test]
    fn no_persistent_regs_used_inserts_nothing() {
        let mut b = MicroBuilder::new();
        b.emit_load_reg_imm(MicroReg::physical_int(gpr::RAX), 1, MicroOpBits::B64);
        b.emit_ret();
        let before = b.storages_mut().0.len();
        let changed = run_pass(&mut b);
        assert!(!changed);
        assert_eq!(b.storages_mut().0.len(), before);
    }

    #[test]
    fn preserve_persistent_regs_false_is_a_no_op() {
        let mut b = MicroBuilder::new();
        b.emit_load_reg_imm(MicroReg::physical_int(gpr::RBX), 1, MicroOpBits::B64);
        b.emit_ret();
        let encoder = X64Encoder::new();
        let call_conv = CallConv::get(CallConvKind::SystemV);
        let (instructions, operands) = b.storages_mut();
        let mut ctx = MicroPassContext::new(&encoder, instructions, operands, CallConvKind::SystemV);
        ctx.preserve_persistent_regs = false;
        let mut pass = PrologEpilogPass::new(call_conv);
        assert!(!pass.run(&mut ctx).unwrap());
    }

    #[test]
    fn used_persistent_int_reg_gets_pushed_and_popped() {
        let mut b = MicroBuilder::new();
        b.emit_load_reg_imm(MicroReg::physical_int(gpr::RBX), 1, MicroOpBits::B64);
        b.emit_ret();
        let changed = run_pass(&mut b);
        assert!(changed);

        let (instructions, _operands) = b.storages_mut();
        let opcodes: Vec<MicroInstrOpcode> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(opcodes.first(), Some(&MicroInstrOpcode::Push));
        assert!(opcodes.iter().any(|o| *o == MicroInstrOpcode::Pop));
    }
}
