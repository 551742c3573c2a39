//! ABI descriptor (spec §6 `CallConv`), grounded in `isa/call_conv.rs`'s
//! `CallConv` seam and the field set `CallConv::get(...)` is expected to
//! provide throughout `MicroRegisterAllocationPass.cpp` and
//! `MicroPrologEpilogPass.cpp` (`intRegs`, `floatRegs`, `intPersistentRegs`,
//! `floatPersistentRegs`, `stackPointer`, `stackAlignment`).

use crate::reg::MicroReg;

/// Which concrete ABI a function was lowered for. The teacher's
/// `CallConv` is a triple-driven enum with seven variants for every
/// target cranelift supports; this crate targets x86-64 only, so the
/// surface shrinks to the two conventions the spec's scenarios exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallConvKind {
    SystemV,
    WindowsFastcall,
}

impl Default for CallConvKind {
    fn default() -> Self {
        CallConvKind::SystemV
    }
}

/// x86-64 GPR indices, matching the packed `MicroReg` class-local index
/// space used by `physical_int`.
pub mod gpr {
    pub const RAX: u32 = 0;
    pub const RCX: u32 = 1;
    pub const RDX: u32 = 2;
    pub const RBX: u32 = 3;
    pub const RSP: u32 = 4;
    pub const RBP: u32 = 5;
    pub const RSI: u32 = 6;
    pub const RDI: u32 = 7;
    pub const R8: u32 = 8;
    pub const R9: u32 = 9;
    pub const R10: u32 = 10;
    pub const R11: u32 = 11;
    pub const R12: u32 = 12;
    pub const R13: u32 = 13;
    pub const R14: u32 = 14;
    pub const R15: u32 = 15;
}

/// x86-64 XMM indices.
pub mod xmm {
    pub const XMM0: u32 = 0;
    pub const XMM1: u32 = 1;
    pub const XMM2: u32 = 2;
    pub const XMM3: u32 = 3;
    pub const XMM4: u32 = 4;
    pub const XMM5: u32 = 5;
    pub const XMM6: u32 = 6;
    pub const XMM7: u32 = 7;
    pub const XMM8: u32 = 8;
    pub const XMM9: u32 = 9;
    pub const XMM10: u32 = 10;
    pub const XMM11: u32 = 11;
    pub const XMM12: u32 = 12;
    pub const XMM13: u32 = 13;
    pub const XMM14: u32 = 14;
    pub const XMM15: u32 = 15;
}

/// Fully resolved ABI description for a single calling convention. The
/// allocator partitions `int_regs`/`float_regs` into persistent/transient
/// free-list pools from this at the start of every function (spec §4.F).
pub struct CallConv {
    pub kind: CallConvKind,
    /// Every physical int register available to the allocator, in
    /// preferred-allocation order.
    pub int_regs: &'static [MicroReg],
    pub float_regs: &'static [MicroReg],
    /// Callee-saved ("persistent" across a call) int registers.
    pub int_persistent_regs: &'static [MicroReg],
    /// Callee-saved float registers.
    pub float_persistent_regs: &'static [MicroReg],
    /// Caller-saved int registers that a call instruction clobbers.
    pub int_call_clobbered_regs: &'static [MicroReg],
    pub float_call_clobbered_regs: &'static [MicroReg],
    /// Integer argument registers, in order, for this convention.
    pub int_arg_regs: &'static [MicroReg],
    pub float_arg_regs: &'static [MicroReg],
    pub stack_pointer: MicroReg,
    pub frame_pointer: MicroReg,
    pub stack_alignment: u64,
    /// Fixed register the shift-family `RewriteRegRegOperandToFixedReg`
    /// conformance issue must pin the shift count into (`%cl` on x86-64).
    pub shift_count_reg: MicroReg,
}

impl CallConv {
    pub fn get(kind: CallConvKind) -> &'static CallConv {
        match kind {
            CallConvKind::SystemV => &SYSTEM_V,
            CallConvKind::WindowsFastcall => &WINDOWS_FASTCALL,
        }
    }

    pub fn is_int_persistent_reg(&self, reg: MicroReg) -> bool {
        self.int_persistent_regs.iter().any(|r| *r == reg)
    }

    pub fn is_float_persistent_reg(&self, reg: MicroReg) -> bool {
        self.float_persistent_regs.iter().any(|r| *r == reg)
    }

    pub fn is_int_call_clobbered(&self, reg: MicroReg) -> bool {
        self.int_call_clobbered_regs.iter().any(|r| *r == reg)
    }

    pub fn is_float_call_clobbered(&self, reg: MicroReg) -> bool {
        self.float_call_clobbered_regs.iter().any(|r| *r == reg)
    }
}

macro_rules! int_regs {
    ($($idx:expr),* $(,)?) => { &[$(MicroReg::physical_int($idx)),*] };
}
macro_rules! float_regs {
    ($($idx:expr),* $(,)?) => { &[$(MicroReg::physical_float($idx)),*] };
}

static SYSTEM_V: CallConv = CallConv {
    kind: CallConvKind::SystemV,
    int_regs: int_regs![
        gpr::RAX,
        gpr::RCX,
        gpr::RDX,
        gpr::RBX,
        gpr::RSI,
        gpr::RDI,
        gpr::R8,
        gpr::R9,
        gpr::R10,
        gpr::R11,
        gpr::R12,
        gpr::R13,
        gpr::R14,
        gpr::R15,
    ],
    float_regs: float_regs![
        xmm::XMM0,
        xmm::XMM1,
        xmm::XMM2,
        xmm::XMM3,
        xmm::XMM4,
        xmm::XMM5,
        xmm::XMM6,
        xmm::XMM7,
        xmm::XMM8,
        xmm::XMM9,
        xmm::XMM10,
        xmm::XMM11,
        xmm::XMM12,
        xmm::XMM13,
        xmm::XMM14,
        xmm::XMM15,
    ],
    int_persistent_regs: int_regs![gpr::RBX, gpr::R12, gpr::R13, gpr::R14, gpr::R15],
    float_persistent_regs: &[],
    int_call_clobbered_regs: int_regs![
        gpr::RAX,
        gpr::RCX,
        gpr::RDX,
        gpr::RSI,
        gpr::RDI,
        gpr::R8,
        gpr::R9,
        gpr::R10,
        gpr::R11,
    ],
    float_call_clobbered_regs: float_regs![
        xmm::XMM0,
        xmm::XMM1,
        xmm::XMM2,
        xmm::XMM3,
        xmm::XMM4,
        xmm::XMM5,
        xmm::XMM6,
        xmm::XMM7,
        xmm::XMM8,
        xmm::XMM9,
        xmm::XMM10,
        xmm::XMM11,
        xmm::XMM12,
        xmm::XMM13,
        xmm::XMM14,
        xmm::XMM15,
    ],
    int_arg_regs: int_regs![gpr::RDI, gpr::RSI, gpr::RDX, gpr::RCX, gpr::R8, gpr::R9],
    float_arg_regs: float_regs![
        xmm::XMM0,
        xmm::XMM1,
        xmm::XMM2,
        xmm::XMM3,
        xmm::XMM4,
        xmm::XMM5,
        xmm::XMM6,
        xmm::XMM7,
    ],
    stack_pointer: MicroReg::physical_int(gpr::RSP),
    frame_pointer: MicroReg::physical_int(gpr::RBP),
    stack_alignment: 16,
    shift_count_reg: MicroReg::physical_int(gpr::RCX),
};

static WINDOWS_FASTCALL: CallConv = CallConv {
    kind: CallConvKind::WindowsFastcall,
    int_regs: int_regs![
        gpr::RAX,
        gpr::RCX,
        gpr::RDX,
        gpr::RBX,
        gpr::RSI,
        gpr::RDI,
        gpr::R8,
        gpr::R9,
        gpr::R10,
        gpr::R11,
        gpr::R12,
        gpr::R13,
        gpr::R14,
        gpr::R15,
    ],
    float_regs: float_regs![
        xmm::XMM0,
        xmm::XMM1,
        xmm::XMM2,
        xmm::XMM3,
        xmm::XMM4,
        xmm::XMM5,
        xmm::XMM6,
        xmm::XMM7,
        xmm::XMM8,
        xmm::XMM9,
        xmm::XMM10,
        xmm::XMM11,
        xmm::XMM12,
        xmm::XMM13,
        xmm::XMM14,
        xmm::XMM15,
    ],
    int_persistent_regs: int_regs![
        gpr::RBX,
        gpr::RSI,
        gpr::RDI,
        gpr::R12,
        gpr::R13,
        gpr::R14,
        gpr::R15,
    ],
    float_persistent_regs: float_regs![
        xmm::XMM6,
        xmm::XMM7,
        xmm::XMM8,
        xmm::XMM9,
        xmm::XMM10,
        xmm::XMM11,
        xmm::XMM12,
        xmm::XMM13,
        xmm::XMM14,
        xmm::XMM15,
    ],
    int_call_clobbered_regs: int_regs![
        gpr::RAX,
        gpr::RCX,
        gpr::RDX,
        gpr::R8,
        gpr::R9,
        gpr::R10,
        gpr::R11,
    ],
    float_call_clobbered_regs: float_regs![xmm::XMM0, xmm::XMM1, xmm::XMM2, xmm::XMM3, xmm::XMM4, xmm::XMM5],
    int_arg_regs: int_regs![gpr::RCX, gpr::RDX, gpr::R8, gpr::R9],
    float_arg_regs: float_regs![xmm::XMM0, xmm::XMM1, xmm::XMM2, xmm::XMM3],
    stack_pointer: MicroReg::physical_int(gpr::RSP),
    frame_pointer: MicroReg::physical_int(gpr::RBP),
    stack_alignment: 16,
    shift_count_reg: MicroReg::physical_int(gpr::RCX),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_v_partitions_int_regs_without_overlap() {
        let conv = CallConv::get(CallConvKind::SystemV);
        for reg in conv.int_persistent_regs {
            assert!(!conv.is_int_call_clobbered(*reg));
        }
    }

    #[test]
    fn shift_count_reg_is_rcx() {
        let conv = CallConv::get(CallConvKind::SystemV);
        assert_eq!(conv.shift_count_reg, MicroReg::physical_int(gpr::RCX));
    }

    #[test]
    fn every_persistent_reg_is_in_int_regs() {
        let conv = CallConv::get(CallConvKind::WindowsFastcall);
        for reg in conv.int_persistent_regs {
            assert!(conv.int_regs.contains(reg));
        }
    }
}
