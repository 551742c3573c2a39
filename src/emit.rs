//! Emission pass (spec §4.I), grounded in
//! `Backend/Micro/Passes/MicroEmitPass.cpp`.
//!
//! A single forward pass over the fully legalized instruction stream that
//! turns every instruction into bytes via `Encoder::encode`, tracking two
//! things the encoder cannot know on its own: label offsets (resolved as
//! they're reached) and pending jump-to-label patches (resolved once every
//! label in the function has been seen).

use std::collections::HashMap;

use crate::callconv::CallConv;
use crate::error::{BackendError, BackendResult};
use crate::opcode::MicroInstrOpcode;
use crate::operand::{MicroInstrOperand, MicroOpBits};
use crate::pass::{MicroPassContext, Pass, PassKind};

struct PendingJump {
    label_id: u32,
    patch_offset: usize,
    instr_end_offset: u32,
}

pub struct EmitPass;

impl EmitPass {
    pub fn new() -> Self {
        EmitPass
    }
}

impl Default for EmitPass {
    fn default() -> Self {
        EmitPass::new()
    }
}

impl Pass for EmitPass {
    fn kind(&self) -> PassKind {
        PassKind::Emit
    }

    fn run(&mut self, ctx: &mut MicroPassContext) -> BackendResult<bool> {
        let call_conv = CallConv::get(ctx.call_conv_kind);
        let order: Vec<_> = ctx.instructions.iter_refs().map(|(r, _)| r).collect();

        let mut label_offsets: HashMap<u32, u32> = HashMap::new();
        let mut pending_jumps: Vec<PendingJump> = Vec::new();

        for cur in order {
            let instr = *ctx.instructions.get(cur);
            let ops: Vec<MicroInstrOperand> = instr.ops(ctx.operands).to_vec();
            let start = ctx.code.len() as u32;

            if instr.opcode == MicroInstrOpcode::Label {
                let label_id = ops[0].as_instr_ref().index() as u32;
                label_offsets.insert(label_id, start);
            }

            let encoded = ctx
                .encoder
                .encode(&instr, &ops, call_conv, &mut ctx.code)?;

            match instr.opcode {
                MicroInstrOpcode::JumpCond => {
                    let patch_offset = encoded.reloc_patch_offset.ok_or_else(|| {
                        BackendError::invariant("JumpCond encoding reported no patch offset")
                    })?;
                    let label_id = ops[2].as_instr_ref().index() as u32;
                    pending_jumps.push(PendingJump {
                        label_id,
                        patch_offset: start as usize + patch_offset,
                        instr_end_offset: ctx.code.len() as u32,
                    });
                }
                MicroInstrOpcode::LoadRegPtrImm => {
                    let op_bits = ops[1].as_op_bits();
                    if op_bits == MicroOpBits::B64 {
                        let patch_offset = encoded.reloc_patch_offset.ok_or_else(|| {
                            BackendError::invariant("B64 LoadRegPtrImm has no matching relocation")
                        })?;
                        ctx.resolved_relocations.push((cur, start + patch_offset as u32));
                    }
                }
                _ => {}
            }
        }

        for pending in &pending_jumps {
            let target = label_offsets.get(&pending.label_id).copied().ok_or_else(|| {
                BackendError::invariant(format!("unresolved label {} at end of emission", pending.label_id))
            })?;
            let rel = target as i64 - pending.instr_end_offset as i64;
            let rel = i32::try_from(rel).map_err(|_| BackendError::invariant("jump displacement out of i32 range"))?;
            ctx.code[pending.patch_offset..pending.patch_offset + 4].copy_from_slice(&rel.to_le_bytes());
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MicroBuilder;
    use crate::callconv::CallConvKind;
    use crate::encoder::X64Encoder;
    use crate::operand::MicroCond;
    use crate::reg::MicroReg;

    fn run_emit(builder: &mut MicroBuilder) -> Vec<u8> {
        let encoder = X64Encoder::new();
        let (instructions, operands) = builder.storages_mut();
        let mut ctx = MicroPassContext::new(&encoder, instructions, operands, CallConvKind::SystemV);
        let mut pass = EmitPass::new();
        pass.run(&mut ctx).unwrap();
        ctx.code
    }

    #[test]
    fn ret_only_function_encodes_a_single_byte() {
        let mut b = MicroBuilder::new();
        b.emit_ret();
        let code = run_emit(&mut b);
        assert_eq!(code, vec![0xC3]);
    }

    #[test]
    fn forward_jump_to_label_gets_patched_with_correct_displacement() {
        let mut b = MicroBuilder::new();
        let label = b.create_label();
        b.emit_jump_to_label(MicroCond::Eq, crate::operand::MicroOpBits::B64, label);
        b.emit_load_reg_imm(MicroReg::physical_int(crate::callconv::gpr::RAX), 0, crate::operand::MicroOpBits::B64);
        b.place_label(label);
        b.emit_ret();
        let code = run_emit(&mut b);

        // JumpCond: 0x0F 0x80+cc then 4-byte displacement.
        assert_eq!(code[0], 0x0F);
        let disp = i32::from_le_bytes([code[2], code[3], code[4], code[5]]);
        let jump_end = 6u32;
        let label_offset = (code.len() - 1) as u32; // Ret is the final byte, Label emits nothing.
        assert_eq!(disp, label_offset as i32 - jump_end as i32);
    }

    #[test]
    fn relocation_bearing_pointer_load_is_recorded() {
        let mut b = MicroBuilder::new();
        let reg = MicroReg::physical_int(crate::callconv::gpr::RAX);
        b.emit_load_reg_ptr_imm(reg, 0, crate::builder::MicroRelocationKind::ConstantAddress, None);
        b.emit_ret();
        let encoder = X64Encoder::new();
        let (instructions, operands) = b.storages_mut();
        let mut ctx = MicroPassContext::new(&encoder, instructions, operands, CallConvKind::SystemV);
        let mut pass = EmitPass::new();
        pass.run(&mut ctx).unwrap();
        assert_eq!(ctx.resolved_relocations.len(), 1);
        let (_, offset) = ctx.resolved_relocations[0];
        // LoadRegPtrImm(RAX): REX.W(1) + opcode(1) + 8-byte immediate = 10 bytes, reloc at byte 2.
        assert_eq!(offset, 2);
    }
}
