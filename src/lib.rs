//! Machine-code backend core: a target-agnostic micro-instruction model,
//! an intrusive instruction arena, a linear-scan register allocator, a
//! conformance-driven legalizer, and a single-pass x86-64 emitter, wired
//! together by a small fixed-pipeline pass manager (see `DESIGN.md`).
//!
//! A typical caller builds one function at a time:
//!
//! ```ignore
//! let mut builder = MicroBuilder::new();
//! builder.emit_load_reg_imm(MicroReg::physical_int(gpr::RAX), 42, MicroOpBits::B64);
//! builder.emit_ret();
//! let encoder = X64Encoder::new();
//! let result = compile_function(&mut builder, &encoder, CallConvKind::SystemV)?;
//! ```

pub mod builder;
pub mod callconv;
pub mod emit;
pub mod encoder;
pub mod error;
pub mod instr;
pub mod legalize;
pub mod opcode;
pub mod operand;
pub mod pass;
pub mod printer;
pub mod prolog_epilog;
pub mod reg;
pub mod regalloc;
pub mod storage;

pub use crate::builder::MicroBuilder;
pub use crate::callconv::{CallConv, CallConvKind};
pub use crate::emit::EmitPass;
pub use crate::encoder::{Encoder, X64Encoder};
pub use crate::error::{BackendError, BackendResult};
pub use crate::legalize::LegalizePass;
pub use crate::pass::{MicroPassContext, Pass, PassKind, PassManager};
pub use crate::prolog_epilog::PrologEpilogPass;
pub use crate::reg::MicroReg;
pub use crate::regalloc::RegAllocPass;

/// Result of running the mandatory pipeline (spec §2) to completion on one
/// function: the encoded bytes and (inside `builder`) the final,
/// offset-resolved relocation list.
pub struct CompiledFunction {
    pub code: Vec<u8>,
}

/// Runs the mandatory backend pipeline on `builder`'s instruction stream:
/// `[PrologEpilog -> RegAlloc -> Legalize -> Emit]` (spec §2), in that
/// literal order. `builder`'s relocation list is patched with final code
/// offsets once emission completes.
///
/// `call_conv` selects both the register pools the allocator/prolog-epilog
/// pass draw from and the calling convention the encoder consults for
/// call-shaped opcodes.
pub fn compile_function(
    builder: &mut MicroBuilder,
    encoder: &dyn Encoder,
    call_conv_kind: CallConvKind,
) -> BackendResult<CompiledFunction> {
    let call_conv = CallConv::get(call_conv_kind);
    let forbidden = builder.forbidden_phys_regs().clone();
    let (instructions, operands) = builder.storages_mut();
    let mut ctx = MicroPassContext::new(encoder, instructions, operands, call_conv_kind);

    let mut passes = PassManager::new();
    passes
        .add(Box::new(PrologEpilogPass::new(call_conv)))
        .add(Box::new(RegAllocPass::new(call_conv, forbidden)))
        .add(Box::new(LegalizePass::new(call_conv)))
        .add(Box::new(EmitPass::new()));
    passes.run(&mut ctx)?;

    let resolved = std::mem::take(&mut ctx.resolved_relocations);
    let code = std::mem::take(&mut ctx.code);
    drop(ctx);

    builder.set_relocation_code_offsets(&resolved);

    Ok(CompiledFunction { code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callconv::gpr;
    use crate::operand::MicroOpBits;

    #[test]
    fn compiles_a_trivial_function_to_a_ret_byte() {
        let mut builder = MicroBuilder::new();
        builder.emit_load_reg_imm(MicroReg::physical_int(gpr::RAX), 42, MicroOpBits::B64);
        builder.emit_ret();
        let encoder = X64Encoder::new();
        let result = compile_function(&mut builder, &encoder, CallConvKind::SystemV).unwrap();
        assert_eq!(result.code.last(), Some(&0xC3));
    }

    #[test]
    fn compiles_a_function_with_spilling_virtual_registers() {
        let mut builder = MicroBuilder::new();
        for i in 0..20u32 {
            let v = MicroReg::virtual_int(i);
            builder.emit_load_reg_imm(v, i as u64, MicroOpBits::B64);
        }
        builder.emit_ret();
        let encoder = X64Encoder::new();
        let result = compile_function(&mut builder, &encoder, CallConvKind::SystemV).unwrap();
        assert!(!result.code.is_empty());
        assert_eq!(result.code.last(), Some(&0xC3));
    }
}
