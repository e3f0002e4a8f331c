//! Error types for the QPU compiler.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

use super::instr::Label;

/// Main error type for kernel compilation.
///
/// Compile-time errors abort the pipeline; no partial artefacts are exposed
/// to the caller. Diagnostics that must not abort (only-assigned variables,
/// accumulator substitution inside rotates) go through `log::warn!` and the
/// compile-data record instead.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("branch refers to unknown label L{0}")]
    UnresolvedLabel(Label),

    #[error("register allocation failed: {reason}")]
    RegAllocFailure { reason: String },

    #[error("unsupported instruction for {target}: {mnemonic}")]
    UnsupportedInstruction { target: &'static str, mnemonic: String },

    #[error("cannot materialise {kind} immediate {value} on v3d")]
    ImmediateEncodingFailure { kind: &'static str, value: String },

    #[error("branch offset {offset} bytes exceeds the platform branch range")]
    BranchOffsetOutOfRange { offset: i64 },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("{0}")]
    UserAssertion(String),
}

impl CompileError {
    /// Shorthand for the pervasive internal-check failure.
    pub fn invariant(msg: impl Into<String>) -> Self {
        CompileError::InvariantViolation(msg.into())
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_readable() {
        let e = CompileError::UnresolvedLabel(3);
        assert_eq!(e.to_string(), "branch refers to unknown label L3");

        let e = CompileError::RegAllocFailure {
            reason: "insufficient capacity".into(),
        };
        assert!(e.to_string().contains("insufficient capacity"));

        let e = CompileError::UnsupportedInstruction {
            target: "v3d",
            mnemonic: "dma_load_wait".into(),
        };
        assert!(e.to_string().contains("v3d"));
        assert!(e.to_string().contains("dma_load_wait"));
    }
}
