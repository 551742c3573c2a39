//! A single micro-instruction and its use/def derivation (spec §4.C),
//! grounded in `Backend/Micro/MicroInstr.cpp`.

use smallvec::SmallVec;

use crate::callconv::CallConvKind;
use crate::opcode::{MicroInstrOpcode, RegRole, SlotKind};
use crate::operand::MicroInstrOperand;
use crate::reg::MicroReg;
use crate::storage::MicroOperandStorage;

/// An instruction: an opcode plus a reference to its operand slots. The
/// slots themselves live in `MicroOperandStorage`, addressed by
/// `operand_base`; `MicroInstr` only records where its own run starts,
/// mirroring the source's `opsRef`/`numOperands` pair.
#[derive(Debug, Clone, Copy)]
pub struct MicroInstr {
    pub opcode: MicroInstrOpcode,
    operand_base: u32,
    num_operands: u8,
    /// Index into the function's debug-info table, or `u32::MAX` if this
    /// instruction was emitted without a current debug-info record (see
    /// `SPEC_FULL.md` Supplemented Feature 3).
    pub debug_info: u32,
}

impl MicroInstr {
    pub fn new(opcode: MicroInstrOpcode, operand_base: u32, num_operands: u8) -> Self {
        MicroInstr {
            opcode,
            operand_base,
            num_operands,
            debug_info: u32::MAX,
        }
    }

    pub fn operand_base(&self) -> u32 {
        self.operand_base
    }

    pub fn num_operands(&self) -> usize {
        self.num_operands as usize
    }

    pub fn ops<'a>(&self, operands: &'a MicroOperandStorage) -> &'a [MicroInstrOperand] {
        if self.num_operands == 0 {
            return &[];
        }
        operands.slice(self.operand_base, self.num_operands())
    }

    pub fn ops_mut<'a>(&self, operands: &'a mut MicroOperandStorage) -> &'a mut [MicroInstrOperand] {
        if self.num_operands == 0 {
            return &mut [];
        }
        operands.slice_mut(self.operand_base, self.num_operands())
    }

    pub fn is_call(&self) -> bool {
        self.opcode.descriptor().is_call
    }

    pub fn call_conv(&self, operands: &MicroOperandStorage) -> Option<CallConvKind> {
        let desc = self.opcode.descriptor();
        let slot = desc.call_conv_slot?;
        match self.ops(operands)[slot] {
            MicroInstrOperand::CallConv(kind) => Some(kind),
            _ => None,
        }
    }

    /// Register mode per slot, after applying the exchange/compare-exchange
    /// role flip special cases (`resolveRegModes` in the source).
    fn resolved_reg_roles(&self, operands: &MicroOperandStorage) -> SmallVec<[(usize, RegRole); 3]> {
        let desc = self.opcode.descriptor();
        let ops = self.ops(operands);
        let op_value = ops.iter().find_map(|o| match o {
            MicroInstrOperand::Op(op) => Some(*op),
            _ => None,
        });

        let flip = self.opcode.has_exchange_role_flip(op_value);

        let mut out = SmallVec::new();
        for (i, slot) in desc.slots.iter().enumerate() {
            if let SlotKind::Reg(role) = slot {
                let role = if flip {
                    match (self.opcode, i) {
                        (MicroInstrOpcode::OpBinaryRegReg, 0) | (MicroInstrOpcode::OpBinaryRegReg, 1) => {
                            RegRole::UseDef
                        }
                        (MicroInstrOpcode::OpBinaryMemReg, 1) => RegRole::UseDef,
                        (MicroInstrOpcode::OpTernaryRegRegReg, 1) => RegRole::UseDef,
                        _ => *role,
                    }
                } else {
                    *role
                };
                out.push((i, role));
            }
        }
        out
    }

    /// Use/def register sets for liveness and legalization, matching
    /// `MicroInstr::collectUseDef`. `uses`/`defs` exclude `INVALID` and
    /// `NO_BASE` sentinels, same as the source's `addUse`/`addDef`.
    pub fn collect_use_def(&self, operands: &MicroOperandStorage) -> MicroInstrUseDef {
        let mut use_def = MicroInstrUseDef::default();
        use_def.is_call = self.is_call();
        use_def.call_conv = self.call_conv(operands);

        let ops = self.ops(operands);
        for (slot, role) in self.resolved_reg_roles(operands) {
            let reg = ops[slot].as_reg();
            if !reg.is_valid() || reg.is_no_base() {
                continue;
            }
            match role {
                RegRole::Use => use_def.uses.push(reg),
                RegRole::Def => use_def.defs.push(reg),
                RegRole::UseDef => {
                    use_def.uses.push(reg);
                    use_def.defs.push(reg);
                }
            }
        }
        use_def
    }

    /// Register operands with a pointer-like identity (slot index), used
    /// by the allocator to rewrite in place. Matches
    /// `MicroInstr::collectRegOperands`.
    pub fn collect_reg_operands(&self, operands: &MicroOperandStorage) -> SmallVec<[RegOperandRef; 3]> {
        let ops = self.ops(operands);
        let mut out = SmallVec::new();
        for (slot, role) in self.resolved_reg_roles(operands) {
            let reg = ops[slot].as_reg();
            if !reg.is_valid() || reg.is_no_base() {
                continue;
            }
            out.push(RegOperandRef {
                slot,
                reg,
                is_use: matches!(role, RegRole::Use | RegRole::UseDef),
                is_def: matches!(role, RegRole::Def | RegRole::UseDef),
            });
        }
        out
    }
}

/// Use/def register sets for one instruction, plus call metadata.
#[derive(Debug, Default, Clone)]
pub struct MicroInstrUseDef {
    pub uses: SmallVec<[MicroReg; 3]>,
    pub defs: SmallVec<[MicroReg; 3]>,
    pub is_call: bool,
    pub call_conv: Option<CallConvKind>,
}

/// A register operand's slot index and current role, for in-place rewrite.
#[derive(Debug, Clone, Copy)]
pub struct RegOperandRef {
    pub slot: usize,
    pub reg: MicroReg,
    pub is_use: bool,
    pub is_def: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{MicroOp, MicroOpBits};
    use crate::storage::MicroOperandStorage;

    fn build_op_binary_reg_reg(op: MicroOp, operands: &mut MicroOperandStorage) -> MicroInstr {
        let base = operands.emplace_array(4);
        let slots = operands.slice_mut(base, 4);
        slots[0] = MicroInstrOperand::Reg(MicroReg::physical_int(0));
        slots[1] = MicroInstrOperand::Reg(MicroReg::physical_int(1));
        slots[2] = MicroInstrOperand::OpBits(MicroOpBits::B64);
        slots[3] = MicroInstrOperand::Op(op);
        MicroInstr::new(MicroInstrOpcode::OpBinaryRegReg, base, 4)
    }

    #[test]
    fn ordinary_binary_op_has_usedef_dst_and_use_src() {
        let mut operands = MicroOperandStorage::new();
        let instr = build_op_binary_reg_reg(MicroOp::Add, &mut operands);
        let ud = instr.collect_use_def(&operands);
        assert_eq!(ud.defs.len(), 1);
        assert_eq!(ud.uses.len(), 2);
    }

    #[test]
    fn exchange_flips_both_regs_to_usedef() {
        let mut operands = MicroOperandStorage::new();
        let instr = build_op_binary_reg_reg(MicroOp::Exchange, &mut operands);
        let ud = instr.collect_use_def(&operands);
        assert_eq!(ud.defs.len(), 2);
        assert_eq!(ud.uses.len(), 2);
    }

    #[test]
    fn no_base_sentinel_excluded_from_use_def() {
        let mut operands = MicroOperandStorage::new();
        let base = operands.emplace_array(4);
        let slots = operands.slice_mut(base, 4);
        slots[0] = MicroInstrOperand::Reg(MicroReg::NO_BASE);
        slots[1] = MicroInstrOperand::Reg(MicroReg::physical_int(2));
        slots[2] = MicroInstrOperand::OpBits(MicroOpBits::B64);
        slots[3] = MicroInstrOperand::Op(MicroOp::Add);
        let instr = MicroInstr::new(MicroInstrOpcode::OpBinaryRegReg, base, 4);
        let ud = instr.collect_use_def(&operands);
        assert_eq!(ud.defs.len(), 0);
        assert_eq!(ud.uses.len(), 1);
    }
}
