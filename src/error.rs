//! Fatal error taxonomy for the backend core (spec §7).
//!
//! Nothing in this crate recovers from these internally: a function either
//! finishes all passes cleanly or the caller discards its byte output.

use std::fmt;

use crate::opcode::MicroInstrOpcode;
use crate::storage::Ref;

/// A fatal backend failure, bound to the function currently being compiled.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// An internal invariant was violated (dead ref accessed, operand index
    /// out of range, allocator exhausted after eviction, unresolved label,
    /// missing relocation for a B64 pointer load). In debug builds these are
    /// also checked with `debug_assert!` at the point of violation; this
    /// variant is how release builds surface the same condition instead of
    /// silently miscompiling.
    #[error("backend invariant violated: {detail}")]
    Invariant {
        /// Human-readable description of which invariant failed.
        detail: String,
    },

    /// Legalization could not reach a fixed point: the encoder reported the
    /// same (or a non-decreasing) issue after a rewrite was applied.
    #[error("legalization made no progress on {instr:?} (issue: {kind})")]
    LegalizationStuck {
        /// The instruction the legalizer got stuck on.
        instr: Ref,
        /// Debug name of the conformance issue kind that did not resolve.
        kind: &'static str,
    },

    /// The instruction stream uses a form the encoder can neither encode
    /// directly nor report a legalization issue for. This signals a bug in
    /// the lowering that produced the micro-IR, not a legalizer bug.
    #[error("encoder has no legal form and no legalization issue for {opcode:?} at {instr:?}")]
    UnsupportedForm {
        /// The offending instruction.
        instr: Ref,
        /// Its opcode.
        opcode: MicroInstrOpcode,
    },
}

impl BackendError {
    /// Shorthand for an invariant violation with a formatted message.
    pub fn invariant(detail: impl fmt::Display) -> Self {
        BackendError::Invariant {
            detail: detail.to_string(),
        }
    }
}

/// Result type used throughout the pass pipeline.
pub type BackendResult<T> = Result<T, BackendError>;
