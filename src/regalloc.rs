//! Linear-scan register allocator (spec §4.F), grounded in
//! `Backend/Micro/Passes/MicroRegisterAllocationPass.cpp`: liveness, use
//! positions, free-list pools, eviction scoring, spill slots, and
//! call-clobber handling.
//!
//! This allocator is deliberately not SSA-based and builds no interference
//! graph (spec §1 Non-goals, §9 design notes): it runs a single backward
//! liveness pass, a single forward use-position pass, then a single
//! forward rewrite pass that assigns, spills, and reloads as it goes. That
//! trades allocation quality for the O(n) cost and predictability the
//! source's design notes call out.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use crate::callconv::CallConv;
use crate::error::BackendResult;
use crate::instr::MicroInstr;
use crate::opcode::MicroInstrOpcode;
use crate::operand::{MicroInstrOperand, MicroOp, MicroOpBits};
use crate::pass::{MicroPassContext, Pass, PassKind};
use crate::reg::MicroReg;
use crate::storage::Ref;

const INT_SLOT_SIZE: u64 = 8;
const FLOAT_SLOT_SIZE: u64 = 16;

#[derive(Clone, Copy)]
struct Mapping {
    phys: MicroReg,
    dirty: bool,
}

/// Free-list pools for one register class, partitioned the way the call
/// convention splits callee-saved ("persistent") from caller-saved
/// ("transient") registers (spec §4.F "Pools").
struct Pool {
    persistent: Vec<MicroReg>,
    transient: Vec<MicroReg>,
}

impl Pool {
    fn new(persistent: &[MicroReg], all: &[MicroReg]) -> Self {
        let transient: Vec<MicroReg> = all.iter().copied().filter(|r| !persistent.contains(r)).rev().collect();
        Pool {
            persistent: persistent.iter().copied().rev().collect(),
            transient,
        }
    }

    fn is_persistent(&self, reg: MicroReg) -> bool {
        self.persistent.contains(&reg)
    }
}

pub struct RegAllocPass {
    call_conv: &'static CallConv,
    forbidden: HashMap<MicroReg, Vec<MicroReg>>,
}

impl RegAllocPass {
    pub fn new(call_conv: &'static CallConv, forbidden: HashMap<MicroReg, Vec<MicroReg>>) -> Self {
        RegAllocPass { call_conv, forbidden }
    }

    fn is_forbidden(&self, vreg: MicroReg, phys: MicroReg) -> bool {
        self.forbidden.get(&vreg).map_or(false, |list| list.contains(&phys))
    }
}

/// Per-function working state for one run of the allocator.
struct Alloc {
    int_pool: Pool,
    float_pool: Pool,
    mapped: HashMap<MicroReg, Mapping>,
    spill_slot: HashMap<MicroReg, u64>,
    spill_frame_used: u64,
    live_across_call: HashSet<MicroReg>,
    use_positions: HashMap<MicroReg, Vec<usize>>,
    live_out: Vec<SmallVec<[MicroReg; 8]>>,
}

impl Alloc {
    fn pool_for(&mut self, want_int: bool) -> &mut Pool {
        if want_int {
            &mut self.int_pool
        } else {
            &mut self.float_pool
        }
    }

    fn slot_size(reg: MicroReg) -> u64 {
        if reg.is_int() {
            INT_SLOT_SIZE
        } else {
            FLOAT_SLOT_SIZE
        }
    }

    fn slot_for(&mut self, vreg: MicroReg) -> u64 {
        if let Some(existing) = self.spill_slot.get(&vreg) {
            return *existing;
        }
        let size = Self::slot_size(vreg);
        let aligned = (self.spill_frame_used + size - 1) / size * size;
        self.spill_frame_used = aligned + size;
        self.spill_slot.insert(vreg, aligned);
        aligned
    }

    fn is_live_out(&self, idx: usize, vreg: MicroReg) -> bool {
        self.live_out[idx].contains(&vreg)
    }

    fn next_use_distance(&self, idx: usize, vreg: MicroReg) -> usize {
        match self.use_positions.get(&vreg) {
            Some(positions) => positions.iter().find(|&&p| p > idx).map(|&p| p - idx).unwrap_or(usize::MAX),
            None => usize::MAX,
        }
    }

    fn pool_is_persistent(&self, phys: MicroReg) -> bool {
        if phys.is_int() {
            self.int_pool.is_persistent(phys)
        } else {
            self.float_pool.is_persistent(phys)
        }
    }

    /// Picks the most evictable currently-mapped vreg of the same class as
    /// `want_int`, excluding anything in `protected`. Criteria are compared
    /// lexicographically in the order spec §4.F step 4 lists them: dead >
    /// clean-spill > distance-to-next-use > wrong-pool-class > larger vreg
    /// key, with the earlier criteria dominating ties.
    fn pick_victim(&self, idx: usize, want_int: bool, want_persistent: bool, protected: &[MicroReg]) -> Option<MicroReg> {
        let mut best: Option<(MicroReg, (bool, bool, usize, bool, u32))> = None;
        for (&vreg, mapping) in &self.mapped {
            if vreg.is_int() != want_int || protected.contains(&vreg) {
                continue;
            }
            let is_dead = !self.is_live_out(idx, vreg);
            let has_clean_spill = self.spill_slot.contains_key(&vreg) && !mapping.dirty;
            let distance = self.next_use_distance(idx, vreg);
            let wrong_class = self.pool_is_persistent(mapping.phys) != want_persistent;
            let score = (is_dead, has_clean_spill, distance, wrong_class, vreg.packed());
            if best.as_ref().map_or(true, |(_, b)| score > *b) {
                best = Some((vreg, score));
            }
        }
        best.map(|(v, _)| v)
    }

    fn unmap(&mut self, vreg: MicroReg) -> MicroReg {
        self.mapped.remove(&vreg).expect("unmap of unmapped vreg").phys
    }

    fn release_to_pool(&mut self, phys: MicroReg) {
        let persistent = self.pool_is_persistent(phys);
        let pool = self.pool_for(phys.is_int());
        if persistent {
            pool.persistent.push(phys);
        } else {
            pool.transient.push(phys);
        }
    }

    fn take_from_pool(&mut self, want_int: bool, want_persistent: bool, forbidden: &dyn Fn(MicroReg) -> bool) -> Option<MicroReg> {
        let pool = self.pool_for(want_int);
        let primary = if want_persistent { &mut pool.persistent } else { &mut pool.transient };
        if let Some(pos) = primary.iter().rposition(|&r| !forbidden(r)) {
            return Some(primary.remove(pos));
        }
        let secondary = if want_persistent { &mut pool.transient } else { &mut pool.persistent };
        secondary.iter().rposition(|&r| !forbidden(r)).map(|pos| secondary.remove(pos))
    }
}

fn emit_spill_store(ctx: &mut MicroPassContext, before: Ref, call_conv: &CallConv, vreg: MicroReg, phys: MicroReg, offset: u64) {
    let op_bits = if vreg.is_int() { MicroOpBits::B64 } else { MicroOpBits::F64 };
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(call_conv.stack_pointer);
    slots[1] = MicroInstrOperand::Reg(phys);
    slots[2] = MicroInstrOperand::OpBits(op_bits);
    slots[3] = MicroInstrOperand::ValueU64(offset);
    let instr = MicroInstr::new(MicroInstrOpcode::LoadMemReg, base, 4);
    ctx.instructions.insert_before(before, instr);
}

fn emit_spill_load(ctx: &mut MicroPassContext, before: Ref, call_conv: &CallConv, vreg: MicroReg, phys: MicroReg, offset: u64) {
    let op_bits = if vreg.is_int() { MicroOpBits::B64 } else { MicroOpBits::F64 };
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(phys);
    slots[1] = MicroInstrOperand::Reg(call_conv.stack_pointer);
    slots[2] = MicroInstrOperand::OpBits(op_bits);
    slots[3] = MicroInstrOperand::ValueU64(offset);
    let instr = MicroInstr::new(MicroInstrOpcode::LoadRegMem, base, 4);
    ctx.instructions.insert_before(before, instr);
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Emits `sub sp, size` (grow=true) or `add sp, size` (grow=false) before
/// `before`, as a plain `OpBinaryRegImm` the legalizer and encoder already
/// handle.
fn insert_frame_adjust(ctx: &mut MicroPassContext, before: Ref, sp: MicroReg, size: u64, grow: bool) {
    let op = if grow { MicroOp::Sub } else { MicroOp::Add };
    let base = ctx.operands.emplace_array(4);
    let slots = ctx.operands.slice_mut(base, 4);
    slots[0] = MicroInstrOperand::Reg(sp);
    slots[1] = MicroInstrOperand::OpBits(MicroOpBits::B64);
    slots[2] = MicroInstrOperand::Op(op);
    slots[3] = MicroInstrOperand::ValueU64(size);
    let instr = MicroInstr::new(MicroInstrOpcode::OpBinaryRegImm, base, 4);
    ctx.instructions.insert_before(before, instr);
}

impl Pass for RegAllocPass {
    fn kind(&self) -> PassKind {
        PassKind::RegisterAllocation
    }

    fn run(&mut self, ctx: &mut MicroPassContext) -> BackendResult<bool> {
        let order: Vec<Ref> = ctx.instructions.iter_refs().map(|(r, _)| r).collect();
        if order.is_empty() {
            return Ok(false);
        }

        // Backward liveness pass (spec §4.F "Live-out analysis").
        let mut live: HashSet<MicroReg> = HashSet::new();
        let mut live_out = vec![SmallVec::<[MicroReg; 8]>::new(); order.len()];
        let mut live_across_call = HashSet::new();
        for (idx, &r) in order.iter().enumerate().rev() {
            live_out[idx] = live.iter().copied().collect();
            let instr = *ctx.instructions.get(r);
            let mut use_def = instr.collect_use_def(ctx.operands);
            ctx.encoder.update_reg_use_def(&instr, instr.ops(ctx.operands), &mut use_def);
            if use_def.is_call {
                for &v in &live {
                    live_across_call.insert(v);
                }
            }
            for d in use_def.defs.iter().filter(|r| r.is_virtual()) {
                live.remove(d);
            }
            for u in use_def.uses.iter().filter(|r| r.is_virtual()) {
                live.insert(*u);
            }
        }

        // Forward use-position pass (spec §4.F "Use-position map").
        let mut use_positions: HashMap<MicroReg, Vec<usize>> = HashMap::new();
        for (idx, &r) in order.iter().enumerate() {
            let instr = *ctx.instructions.get(r);
            let use_def = instr.collect_use_def(ctx.operands);
            for u in use_def.uses.iter().filter(|r| r.is_virtual()) {
                use_positions.entry(*u).or_default().push(idx);
            }
        }

        let call_conv = self.call_conv;
        let mut alloc = Alloc {
            int_pool: Pool::new(call_conv.int_persistent_regs, call_conv.int_regs),
            float_pool: Pool::new(call_conv.float_persistent_regs, call_conv.float_regs),
            mapped: HashMap::new(),
            spill_slot: HashMap::new(),
            spill_frame_used: 0,
            live_across_call,
            use_positions,
            live_out,
        };

        let mut changed = false;

        for (idx, &cur) in order.iter().enumerate() {
            let instr = *ctx.instructions.get(cur);
            let reg_operands = instr.collect_reg_operands(ctx.operands);

            let mut protected: SmallVec<[MicroReg; 4]> = SmallVec::new();
            for ro in &reg_operands {
                if ro.reg.is_virtual() && !protected.contains(&ro.reg) {
                    protected.push(ro.reg);
                }
            }

            for ro in &reg_operands {
                let vreg = ro.reg;
                if !vreg.is_virtual() {
                    continue;
                }

                let want_int = vreg.is_int();
                let persistent_available = if want_int {
                    !call_conv.int_persistent_regs.is_empty()
                } else {
                    !call_conv.float_persistent_regs.is_empty()
                };
                let want_persistent = alloc.live_across_call.contains(&vreg) && persistent_available;

                let phys = if let Some(mapping) = alloc.mapped.get(&vreg) {
                    mapping.phys
                } else {
                    let is_forbidden = |r: MicroReg| self.is_forbidden(vreg, r);
                    let mut newly_allocated = alloc.take_from_pool(want_int, want_persistent, &is_forbidden);

                    if newly_allocated.is_none() {
                        if let Some(victim) = alloc.pick_victim(idx, want_int, want_persistent, &protected) {
                            let victim_mapping = *alloc.mapped.get(&victim).unwrap();
                            let victim_phys = alloc.unmap(victim);
                            let victim_dead = !alloc.is_live_out(idx, victim);
                            if !victim_dead && (victim_mapping.dirty || !alloc.spill_slot.contains_key(&victim)) {
                                let offset = alloc.slot_for(victim);
                                emit_spill_store(ctx, cur, call_conv, victim, victim_phys, offset);
                                changed = true;
                            }
                            newly_allocated = Some(victim_phys);
                        }
                    }

                    let phys = newly_allocated.unwrap_or_else(|| {
                        panic!(
                            "register allocator exhausted for {:?}: no free or evictable {} register",
                            vreg,
                            if want_int { "int" } else { "float" }
                        )
                    });

                    if ro.is_use {
                        let offset = alloc.slot_for(vreg);
                        emit_spill_load(ctx, cur, call_conv, vreg, phys, offset);
                        changed = true;
                    }

                    alloc.mapped.insert(vreg, Mapping { phys, dirty: false });
                    phys
                };

                let instr_cur = *ctx.instructions.get(cur);
                *instr_cur.ops_mut(ctx.operands)[ro.slot].as_reg_mut() = phys;
                changed = true;

                if ro.is_def {
                    alloc.mapped.get_mut(&vreg).unwrap().dirty = true;
                }
            }

            let instr_after = *ctx.instructions.get(cur);
            let mut use_def_after = instr_after.collect_use_def(ctx.operands);
            ctx.encoder.update_reg_use_def(&instr_after, instr_after.ops(ctx.operands), &mut use_def_after);

            if use_def_after.is_call {
                let clobbered: Vec<MicroReg> = alloc
                    .mapped
                    .iter()
                    .filter(|(v, m)| !alloc.pool_is_persistent(m.phys) && alloc.is_live_out(idx, **v))
                    .map(|(v, _)| *v)
                    .collect();
                for vreg in clobbered {
                    let mapping = *alloc.mapped.get(&vreg).unwrap();
                    let offset = alloc.slot_for(vreg);
                    emit_spill_store(ctx, cur, call_conv, vreg, mapping.phys, offset);
                    changed = true;
                    let phys = alloc.unmap(vreg);
                    alloc.release_to_pool(phys);
                }
            }

            // Dead-mapping expiration (spec §4.F).
            let expired: Vec<MicroReg> = alloc.mapped.keys().copied().filter(|v| !alloc.is_live_out(idx, *v)).collect();
            for vreg in expired {
                let phys = alloc.unmap(vreg);
                alloc.release_to_pool(phys);
            }
        }

        if alloc.spill_frame_used > 0 {
            let aligned = round_up(alloc.spill_frame_used, call_conv.stack_alignment);
            insert_frame_adjust(ctx, order[0], call_conv.stack_pointer, aligned, true);
            for &r in &order {
                if ctx.instructions.is_alive(r) && ctx.instructions.get(r).opcode == MicroInstrOpcode::Ret {
                    insert_frame_adjust(ctx, r, call_conv.stack_pointer, aligned, false);
                }
            }
            changed = true;
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
    use crate::operand::SymbolRef;

    fn run_alloc(builder: &mut MicroBuilder) -> bool {
        let encoder = X64Encoder::new();
        let call_conv = CallConv::get(CallConvKind::SystemV);
        let forbidden = builder.forbidden_phys_regs().clone();
        let (instructions, operands) = builder.storages_mut();
        let mut ctx = MicroPassContext::new(&encoder, instructions, operands, CallConvKind::SystemV);
        let mut pass = RegAllocPass::new(call_conv, forbidden);
        pass.run(&mut ctx).unwrap()
    }

    #[test]
    fn already_physical_stream_is_a_no_op() {
        let mut b = MicroBuilder::new();
        b.emit_load_reg_imm(MicroReg::physical_int(gpr::RAX), 1, MicroOpBits::B64);
        b.emit_ret();
        let changed = run_alloc(&mut b);
        assert!(!changed, "no vregs present, allocator must not touch anything");
    }

    #[test]
    fn simple_vreg_def_and_use_gets_assigned_a_physical_register() {
        let mut b = MicroBuilder::new();
        let v0 = MicroReg::virtual_int(0);
        b.emit_load_reg_imm(v0, 42, MicroOpBits::B64);
        b.emit_op_binary_reg_imm(v0, 1, MicroOp::Add, MicroOpBits::B64);
        b.emit_ret();
        run_alloc(&mut b);

        let (instructions, operands) = b.storages_mut();
        for instr in instructions.iter() {
            for ro in instr.collect_reg_operands(operands) {
                assert!(ro.reg.is_physical(), "vreg survived register allocation");
            }
        }
    }

    #[test]
    fn vreg_live_across_call_is_not_left_in_a_clobbered_register() {
        let mut b = MicroBuilder::new();
        let v0 = MicroReg::virtual_int(0);
        b.emit_load_reg_imm(v0, 0x42, MicroOpBits::B64);
        b.emit_call_extern(SymbolRef(0), CallConvKind::SystemV);
        b.emit_op_binary_reg_imm(v0, 1, MicroOp::Add, MicroOpBits::B64);
        b.emit_ret();
        run_alloc(&mut b);

        let conv = CallConv::get(CallConvKind::SystemV);
        let (instructions, operands) = b.storages_mut();
        let mut saw_call = false;
        for instr in instructions.iter() {
            if instr.opcode == MicroInstrOpcode::CallExtern {
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
                        "a call-clobbered register held a live-across-call value without a reload"
                    );
                }
            }
        }
    }

    #[test]
    fn spilling_every_int_register_does_not_panic() {
        let mut b = MicroBuilder::new();
        let mut vregs = Vec::new();
        for i in 0..20u32 {
            let v = MicroReg::virtual_int(i);
            b.emit_load_reg_imm(v, i as u64, MicroOpBits::B64);
            vregs.push(v);
        }
        for &v in &vregs {
            b.emit_op_binary_reg_imm(v, 1, MicroOp::Add, MicroOpBits::B64);
        }
        b.emit_ret();
        run_alloc(&mut b);

        let (instructions, operands) = b.storages_mut();
        for instr in instructions.iter() {
            for ro in instr.collect_reg_operands(operands) {
                assert!(ro.reg.is_physical());
            }
        }
    }
}
