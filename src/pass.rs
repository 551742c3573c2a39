//! Pass manager (spec §4.J), grounded in `Backend/Micro/Passes/MicroPass.h`.
//!
//! A pass is a unit of work over one function's instruction stream that
//! either changes something and asks to be re-run (within the fixed-point
//! pipelines a `PassManager` stage drives) or reports no change. The set of
//! passes this crate ships is the mandatory backend core named in the
//! specification; the teacher's own optimization-pass kinds (constant
//! folding, dead code elimination, and the like) have no counterpart here.

use crate::callconv::CallConvKind;
use crate::encoder::Encoder;
use crate::error::BackendResult;
use crate::storage::{MicroInstrStorage, MicroOperandStorage, Ref};

/// Which concrete pass a `dyn Pass` is, for diagnostics and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    RegisterAllocation,
    PrologEpilog,
    Legalize,
    Emit,
}

/// Shared, mutable state every pass operates over. One context is built per
/// function and threaded through every stage of a `PassManager::run`.
pub struct MicroPassContext<'a> {
    pub encoder: &'a dyn Encoder,
    pub instructions: &'a mut MicroInstrStorage,
    pub operands: &'a mut MicroOperandStorage,
    pub call_conv_kind: CallConvKind,
    /// Whether the prolog/epilog pass should save and restore callee-saved
    /// registers the function actually clobbers (disabled for leaf functions
    /// the caller already knows touch no persistent registers).
    pub preserve_persistent_regs: bool,
    /// Out-of-band binary output, appended to by the emit pass.
    pub code: Vec<u8>,
    /// `(instruction_ref, code_offset)` pairs the emit pass records for every
    /// relocation-bearing instruction it encodes. The caller applies these
    /// back onto `MicroBuilder`'s own relocation list once the pipeline
    /// finishes — kept out-of-band here rather than as a `&mut MicroBuilder`
    /// field, since that would alias `instructions`/`operands` (both of
    /// which live inside the same builder).
    pub resolved_relocations: Vec<(Ref, u32)>,
}

impl<'a> MicroPassContext<'a> {
    pub fn new(
        encoder: &'a dyn Encoder,
        instructions: &'a mut MicroInstrStorage,
        operands: &'a mut MicroOperandStorage,
        call_conv_kind: CallConvKind,
    ) -> Self {
        MicroPassContext {
            encoder,
            instructions,
            operands,
            call_conv_kind,
            preserve_persistent_regs: true,
            code: Vec::new(),
            resolved_relocations: Vec::new(),
        }
    }
}

/// A single pass over one function. `run` returns whether it changed
/// anything, mirroring the source's `bool`-returning `MicroPass::run`; a
/// pass can also fail outright (spec §7's fatal errors), which aborts the
/// whole pipeline rather than being retried.
pub trait Pass {
    fn kind(&self) -> PassKind;
    fn run(&mut self, context: &mut MicroPassContext) -> BackendResult<bool>;
}

/// Runs a fixed ordered list of passes once each, in order, stopping at the
/// first error. The mandatory backend pipeline (spec §2) has no optimization
/// stage to iterate to a fixed point at the pass-manager level — each pass
/// internally loops until it has nothing left to do (the legalizer's own
/// per-instruction requery loop, for instance) and then hands off once.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> Self {
        PassManager { passes: Vec::new() }
    }

    pub fn add(&mut self, pass: Box<dyn Pass>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    pub fn run(&mut self, context: &mut MicroPassContext) -> BackendResult<()> {
        for pass in &mut self.passes {
            log::debug!("running pass {:?}", pass.kind());
            let changed = pass.run(context)?;
            log::trace!("pass {:?} changed={}", pass.kind(), changed);
        }
        Ok(())
    }
}

impl Default for PassManager {
    fn default() -> Self {
        PassManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingPass {
        kind: PassKind,
        ran: bool,
    }

    impl Pass for CountingPass {
        fn kind(&self) -> PassKind {
            self.kind
        }
        fn run(&mut self, _context: &mut MicroPassContext) -> BackendResult<bool> {
            self.ran = true;
            Ok(false)
        }
    }

    #[test]
    fn pass_manager_runs_every_pass_in_order() {
        let mut manager = PassManager::new();
        manager.add(Box::new(CountingPass {
            kind: PassKind::Legalize,
            ran: false,
        }));
        assert_eq!(manager.passes.len(), 1);
    }
}
