//! Instruction builder (spec §4.D), grounded in `Backend/Micro/MicroBuilder.h`
//! and `Backend/CodeGen/Micro/MicroBuilder.cpp`.
//!
//! `MicroBuilder` owns the instruction/operand storages for one function and
//! exposes one `emit_*` method per opcode, mirroring the source's
//! `encode*`/`emit*` surface. It also owns the side tables the mandatory
//! pipeline consults: labels, relocations, per-vreg forbidden-physical-reg
//! hints (`SPEC_FULL.md` Supplemented feature 2), and debug info
//! (Supplemented feature 3).

use crate::callconv::CallConvKind;
use crate::instr::MicroInstr;
use crate::opcode::MicroInstrOpcode;
use crate::operand::{MicroCond, MicroInstrOperand, MicroOp, MicroOpBits, SymbolRef};
use crate::reg::MicroReg;
use crate::storage::{MicroInstrStorage, MicroOperandStorage, Ref};

/// Debug-info record attached to an instruction at the point it was built,
/// keyed by source range rather than anything reconstructible from the
/// instruction stream itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MicroDebugInfo {
    pub file: u32,
    pub line: u32,
    pub column: u32,
}

impl MicroDebugInfo {
    pub fn has_data(&self) -> bool {
        *self != MicroDebugInfo::default()
    }
}

/// One relocation the emitted code needs resolved once final addresses are
/// known. The three kinds named here are the spec's own closed taxonomy
/// (§3); each binds to the abs64 immediate of a `LoadRegImm`/`LoadRegPtrImm`
/// or the rel32 displacement of a near `CallLocal`/`CallExtern`.
#[derive(Debug, Clone, Copy)]
pub struct MicroRelocation {
    pub kind: MicroRelocationKind,
    pub instruction_ref: Ref,
    /// Byte offset into the final code buffer where the patch site begins
    /// (`codeOffset = endOfInstruction - 8` for abs64 forms, computed by the
    /// emit pass once it knows each instruction's final offset).
    pub code_offset: u32,
    pub target_symbol: Option<SymbolRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroRelocationKind {
    /// Absolute 64-bit pointer to a foreign (extern) function.
    ForeignFunctionAddress,
    /// Absolute 64-bit pointer to a local function.
    LocalFunctionAddress,
    /// Absolute 64-bit pointer to a constant-pool entry.
    ConstantAddress,
}

/// Flags controlling how an instruction stream is built. Kept as a small
/// bitset (rather than separate bools) to match the source's
/// `MicroBuilderFlagsE`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MicroBuilderFlags(u8);

impl MicroBuilderFlags {
    const DEBUG_INFO: u8 = 1 << 0;

    pub fn empty() -> Self {
        MicroBuilderFlags(0)
    }

    pub fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// How the printer should render register operands (Supplemented feature 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegPrintMode {
    Default,
    Virtual,
    Concrete,
}

/// Builds one function's micro-instruction stream.
pub struct MicroBuilder {
    instructions: MicroInstrStorage,
    operands: MicroOperandStorage,
    flags: MicroBuilderFlags,
    labels: Vec<Ref>,
    relocations: Vec<MicroRelocation>,
    forbidden_phys_regs: std::collections::HashMap<MicroReg, Vec<MicroReg>>,
    debug_infos: Vec<Option<MicroDebugInfo>>,
    current_debug_info: MicroDebugInfo,
}

impl MicroBuilder {
    pub fn new() -> Self {
        MicroBuilder {
            instructions: MicroInstrStorage::new(),
            operands: MicroOperandStorage::new(),
            flags: MicroBuilderFlags::empty(),
            labels: Vec::new(),
            relocations: Vec::new(),
            forbidden_phys_regs: std::collections::HashMap::new(),
            debug_infos: Vec::new(),
            current_debug_info: MicroDebugInfo::default(),
        }
    }

    pub fn enable_debug_info(&mut self) {
        self.flags.insert(MicroBuilderFlags::DEBUG_INFO);
    }

    fn has_debug_info_flag(&self) -> bool {
        self.flags.contains(MicroBuilderFlags::DEBUG_INFO)
    }

    pub fn instructions(&self) -> &MicroInstrStorage {
        &self.instructions
    }

    pub fn instructions_mut(&mut self) -> &mut MicroInstrStorage {
        &mut self.instructions
    }

    pub fn operands(&self) -> &MicroOperandStorage {
        &self.operands
    }

    pub fn operands_mut(&mut self) -> &mut MicroOperandStorage {
        &mut self.operands
    }

    pub fn storages_mut(&mut self) -> (&mut MicroInstrStorage, &mut MicroOperandStorage) {
        (&mut self.instructions, &mut self.operands)
    }

    pub fn relocations(&self) -> &[MicroRelocation] {
        &self.relocations
    }

    pub fn add_relocation(&mut self, relocation: MicroRelocation) {
        self.relocations.push(relocation);
    }

    pub fn set_current_debug_info(&mut self, info: MicroDebugInfo) {
        self.current_debug_info = info;
    }

    pub fn debug_info(&self, instruction_ref: Ref) -> Option<MicroDebugInfo> {
        self.debug_infos.get(instruction_ref.index())?.clone()
    }

    /// Hints the allocator away from handing `forbidden` out for `vreg`
    /// (Supplemented feature 2 — not in the distilled spec, present in
    /// `addVirtualRegForbiddenPhysReg` in the original source).
    pub fn add_virtual_reg_forbidden_phys_reg(&mut self, vreg: MicroReg, forbidden: MicroReg) {
        self.forbidden_phys_regs.entry(vreg).or_default().push(forbidden);
    }

    pub fn is_virtual_reg_phys_reg_forbidden(&self, vreg: MicroReg, phys: MicroReg) -> bool {
        self.forbidden_phys_regs
            .get(&vreg)
            .map_or(false, |list| list.contains(&phys))
    }

    pub fn forbidden_phys_regs(&self) -> &std::collections::HashMap<MicroReg, Vec<MicroReg>> {
        &self.forbidden_phys_regs
    }

    /// Writes back the final `code_offset` the emit pass computed for each
    /// relocation, keyed by the instruction that owns it (see
    /// `MicroPassContext::resolved_relocations`).
    pub fn set_relocation_code_offsets(&mut self, resolved: &[(Ref, u32)]) {
        for reloc in &mut self.relocations {
            if let Some((_, offset)) = resolved.iter().find(|(r, _)| *r == reloc.instruction_ref) {
                reloc.code_offset = *offset;
            }
        }
    }

    fn store_debug_info(&mut self, instruction_ref: Ref) {
        if !self.has_debug_info_flag() {
            return;
        }
        if !self.current_debug_info.has_data() {
            return;
        }
        if instruction_ref.index() >= self.debug_infos.len() {
            self.debug_infos.resize(instruction_ref.index() + 1, None);
        }
        self.debug_infos[instruction_ref.index()] = Some(self.current_debug_info);
    }

    fn add_instruction(&mut self, opcode: MicroInstrOpcode, num_operands: u8) -> (Ref, u32) {
        let base = if num_operands == 0 {
            0
        } else {
            self.operands.emplace_array(num_operands as usize)
        };
        let instr = MicroInstr::new(opcode, base, num_operands);
        let instr_ref = self.instructions.push_back(instr);
        self.store_debug_info(instr_ref);
        (instr_ref, base)
    }

    fn slots(&mut self, base: u32, count: u8) -> &mut [MicroInstrOperand] {
        self.operands.slice_mut(base, count as usize)
    }

    pub fn create_label(&mut self) -> Ref {
        let label_ref = Ref::from_raw(self.labels.len() as u32);
        self.labels.push(Ref::INVALID);
        label_ref
    }

    pub fn place_label(&mut self, label: Ref) -> Ref {
        debug_assert!(!self.labels[label.index()].is_valid(), "label placed twice");
        let (instr_ref, base) = self.add_instruction(MicroInstrOpcode::Label, 1);
        self.slots(base, 1)[0] = MicroInstrOperand::InstrRef(label);
        self.labels[label.index()] = instr_ref;
        instr_ref
    }

    pub fn label_instruction(&self, label: Ref) -> Ref {
        self.labels[label.index()]
    }

    pub fn emit_nop(&mut self) {
        self.add_instruction(MicroInstrOpcode::Nop, 0);
    }

    pub fn emit_ret(&mut self) {
        self.add_instruction(MicroInstrOpcode::Ret, 0);
    }

    pub fn emit_push(&mut self, reg: MicroReg) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::Push, 1);
        self.slots(base, 1)[0] = MicroInstrOperand::Reg(reg);
    }

    pub fn emit_pop(&mut self, reg: MicroReg) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::Pop, 1);
        self.slots(base, 1)[0] = MicroInstrOperand::Reg(reg);
    }

    pub fn emit_call_local(&mut self, symbol: SymbolRef, call_conv: CallConvKind) -> Ref {
        let (instr_ref, base) = self.add_instruction(MicroInstrOpcode::CallLocal, 2);
        let slots = self.slots(base, 2);
        slots[0] = MicroInstrOperand::Symbol(symbol);
        slots[1] = MicroInstrOperand::CallConv(call_conv);
        instr_ref
    }

    pub fn emit_call_extern(&mut self, symbol: SymbolRef, call_conv: CallConvKind) -> Ref {
        let (instr_ref, base) = self.add_instruction(MicroInstrOpcode::CallExtern, 2);
        let slots = self.slots(base, 2);
        slots[0] = MicroInstrOperand::Symbol(symbol);
        slots[1] = MicroInstrOperand::CallConv(call_conv);
        instr_ref
    }

    pub fn emit_call_reg(&mut self, reg: MicroReg, call_conv: CallConvKind) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::CallIndirect, 2);
        let slots = self.slots(base, 2);
        slots[0] = MicroInstrOperand::Reg(reg);
        slots[1] = MicroInstrOperand::CallConv(call_conv);
    }

    pub fn emit_jump_to_label(&mut self, cond: MicroCond, op_bits: MicroOpBits, label: Ref) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::JumpCond, 3);
        let slots = self.slots(base, 3);
        slots[0] = MicroInstrOperand::Cond(cond);
        slots[1] = MicroInstrOperand::OpBits(op_bits);
        slots[2] = MicroInstrOperand::InstrRef(label);
    }

    pub fn emit_jump_reg(&mut self, reg: MicroReg) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::JumpReg, 1);
        self.slots(base, 1)[0] = MicroInstrOperand::Reg(reg);
    }

    pub fn emit_load_reg_mem(&mut self, dst: MicroReg, mem: MicroReg, offset: u64, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::LoadRegMem, 4);
        let slots = self.slots(base, 4);
        slots[0] = MicroInstrOperand::Reg(dst);
        slots[1] = MicroInstrOperand::Reg(mem);
        slots[2] = MicroInstrOperand::OpBits(op_bits);
        slots[3] = MicroInstrOperand::ValueU64(offset);
    }

    pub fn emit_load_reg_imm(&mut self, reg: MicroReg, value: u64, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::LoadRegImm, 3);
        let slots = self.slots(base, 3);
        slots[0] = MicroInstrOperand::Reg(reg);
        slots[1] = MicroInstrOperand::OpBits(op_bits);
        slots[2] = MicroInstrOperand::ValueU64(value);
    }

    /// Loads a 64-bit pointer immediate and records the relocation needed to
    /// patch it once the target address is known (spec §8 scenario 5).
    pub fn emit_load_reg_ptr_imm(&mut self, reg: MicroReg, placeholder: u64, kind: MicroRelocationKind, target_symbol: Option<SymbolRef>) -> Ref {
        let (instr_ref, base) = self.add_instruction(MicroInstrOpcode::LoadRegPtrImm, 3);
        let slots = self.slots(base, 3);
        slots[0] = MicroInstrOperand::Reg(reg);
        slots[1] = MicroInstrOperand::OpBits(MicroOpBits::B64);
        slots[2] = MicroInstrOperand::ValueU64(placeholder);
        self.add_relocation(MicroRelocation {
            kind,
            instruction_ref: instr_ref,
            code_offset: 0,
            target_symbol,
        });
        instr_ref
    }

    pub fn emit_load_reg_reg(&mut self, dst: MicroReg, src: MicroReg, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::LoadRegReg, 3);
        let slots = self.slots(base, 3);
        slots[0] = MicroInstrOperand::Reg(dst);
        slots[1] = MicroInstrOperand::Reg(src);
        slots[2] = MicroInstrOperand::OpBits(op_bits);
    }

    pub fn emit_load_mem_reg(&mut self, mem: MicroReg, offset: u64, reg: MicroReg, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::LoadMemReg, 4);
        let slots = self.slots(base, 4);
        slots[0] = MicroInstrOperand::Reg(mem);
        slots[1] = MicroInstrOperand::Reg(reg);
        slots[2] = MicroInstrOperand::OpBits(op_bits);
        slots[3] = MicroInstrOperand::ValueU64(offset);
    }

    pub fn emit_load_mem_imm(&mut self, mem: MicroReg, offset: u64, value: u64, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::LoadMemImm, 4);
        let slots = self.slots(base, 4);
        slots[0] = MicroInstrOperand::Reg(mem);
        slots[1] = MicroInstrOperand::OpBits(op_bits);
        slots[2] = MicroInstrOperand::ValueU64(offset);
        slots[3] = MicroInstrOperand::ValueU64(value);
    }

    pub fn emit_load_amc_mem_imm(
        &mut self,
        base_reg: MicroReg,
        mul_reg: MicroReg,
        mul_value: u64,
        add_value: u64,
        op_bits_base_mul: MicroOpBits,
        value: u64,
        op_bits_value: MicroOpBits,
    ) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::LoadAmcMemImm, 8);
        let slots = self.slots(base, 8);
        slots[0] = MicroInstrOperand::Reg(base_reg);
        slots[1] = MicroInstrOperand::Reg(mul_reg);
        slots[2] = MicroInstrOperand::None;
        slots[3] = MicroInstrOperand::OpBits(op_bits_base_mul);
        slots[4] = MicroInstrOperand::OpBits(op_bits_value);
        slots[5] = MicroInstrOperand::ValueU64(mul_value);
        slots[6] = MicroInstrOperand::ValueU64(add_value);
        slots[7] = MicroInstrOperand::ValueU64(value);
    }

    pub fn emit_cmp_reg_reg(&mut self, a: MicroReg, b: MicroReg, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::CmpRegReg, 3);
        let slots = self.slots(base, 3);
        slots[0] = MicroInstrOperand::Reg(a);
        slots[1] = MicroInstrOperand::Reg(b);
        slots[2] = MicroInstrOperand::OpBits(op_bits);
    }

    pub fn emit_cmp_reg_imm(&mut self, reg: MicroReg, value: u64, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::CmpRegImm, 3);
        let slots = self.slots(base, 3);
        slots[0] = MicroInstrOperand::Reg(reg);
        slots[1] = MicroInstrOperand::OpBits(op_bits);
        slots[2] = MicroInstrOperand::ValueU64(value);
    }

    pub fn emit_set_cond_reg(&mut self, reg: MicroReg, cond: MicroCond) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::SetCondReg, 2);
        let slots = self.slots(base, 2);
        slots[0] = MicroInstrOperand::Reg(reg);
        slots[1] = MicroInstrOperand::Cond(cond);
    }

    pub fn emit_clear_reg(&mut self, reg: MicroReg, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::ClearReg, 2);
        let slots = self.slots(base, 2);
        slots[0] = MicroInstrOperand::Reg(reg);
        slots[1] = MicroInstrOperand::OpBits(op_bits);
    }

    pub fn emit_op_unary_reg(&mut self, reg: MicroReg, op: MicroOp, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::OpUnaryReg, 3);
        let slots = self.slots(base, 3);
        slots[0] = MicroInstrOperand::Reg(reg);
        slots[1] = MicroInstrOperand::OpBits(op_bits);
        slots[2] = MicroInstrOperand::Op(op);
    }

    pub fn emit_op_binary_reg_reg(&mut self, dst: MicroReg, src: MicroReg, op: MicroOp, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::OpBinaryRegReg, 4);
        let slots = self.slots(base, 4);
        slots[0] = MicroInstrOperand::Reg(dst);
        slots[1] = MicroInstrOperand::Reg(src);
        slots[2] = MicroInstrOperand::OpBits(op_bits);
        slots[3] = MicroInstrOperand::Op(op);
    }

    pub fn emit_op_binary_reg_imm(&mut self, reg: MicroReg, value: u64, op: MicroOp, op_bits: MicroOpBits) {
        let (_, base) = self.add_instruction(MicroInstrOpcode::OpBinaryRegImm, 4);
        let slots = self.slots(base, 4);
        slots[0] = MicroInstrOperand::Reg(reg);
        slots[1] = MicroInstrOperand::OpBits(op_bits);
        slots[2] = MicroInstrOperand::Op(op);
        slots[3] = MicroInstrOperand::ValueU64(value);
    }
}

impl Default for MicroBuilder {
    fn default() -> Self {
        MicroBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callconv::gpr;

    #[test]
    fn create_label_then_place_records_instruction_ref() {
        let mut b = MicroBuilder::new();
        let label = b.create_label();
        b.emit_nop();
        let placed = b.place_label(label);
        assert_eq!(b.label_instruction(label), placed);
    }

    #[test]
    fn forbidden_phys_reg_hint_is_queryable() {
        let mut b = MicroBuilder::new();
        let v = MicroReg::virtual_int(0);
        let rsp = MicroReg::physical_int(gpr::RSP);
        assert!(!b.is_virtual_reg_phys_reg_forbidden(v, rsp));
        b.add_virtual_reg_forbidden_phys_reg(v, rsp);
        assert!(b.is_virtual_reg_phys_reg_forbidden(v, rsp));
    }

    #[test]
    fn load_reg_ptr_imm_records_relocation() {
        let mut b = MicroBuilder::new();
        let reg = MicroReg::physical_int(gpr::RAX);
        b.emit_load_reg_ptr_imm(reg, 0, MicroRelocationKind::ConstantAddress, None);
        assert_eq!(b.relocations().len(), 1);
    }

    #[test]
    fn debug_info_absent_without_enabling_flag() {
        let mut b = MicroBuilder::new();
        b.set_current_debug_info(MicroDebugInfo { file: 1, line: 2, column: 3 });
        b.emit_nop();
        assert!(b.debug_info(Ref::INVALID).is_none());
    }
}
