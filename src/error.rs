//! Emitter error type.
//!
//! Every error here is a code-generation error, raised before any emitted
//! instruction runs. There is no recovery path: a failure aborts the
//! enclosing kernel compilation.

use thiserror::Error;

use crate::precision::Precision;

#[derive(Debug, Error)]
pub enum EmitError {
    /// The (source, destination) precision pair is outside the emitter's
    /// contract (load output must be F32/I32/same, store input likewise).
    #[error("{emitter} emitter: unsupported precision pair {src:?} -> {dst:?}")]
    UnsupportedPrecision {
        emitter: &'static str,
        src: Precision,
        dst: Precision,
    },
    /// Element or byte count exceeds what the register tier can hold.
    #[error("{emitter} emitter: unexpected number of elements ({num}) in {ctx}")]
    UnexpectedNum {
        emitter: &'static str,
        num: usize,
        ctx: &'static str,
    },
    /// Host ISA below the minimum supported vector width.
    #[error("unsupported isa: {0}")]
    UnsupportedIsa(&'static str),
    /// The caller supplied fewer scratch registers than the emitter declared.
    #[error("{emitter} emitter: not enough scratch registers ({need} {kind} needed, {got} passed)")]
    ScratchShortage {
        emitter: &'static str,
        kind: &'static str,
        need: usize,
        got: usize,
    },
    /// Register index outside the encodable range.
    #[error("register index {0} out of range")]
    BadRegister(u8),
    /// Constant-table entry referenced before registration.
    #[error("constant table entry {0:?} not registered")]
    MissingTableEntry(&'static str),
    /// Underlying assembler failure (invalid operand combination).
    #[error("assembler error: {0}")]
    Assembler(String),
    /// Executable-buffer mapping failure.
    #[error("executable buffer: {0}")]
    Exec(String),
}

impl From<iced_x86::IcedError> for EmitError {
    fn from(e: iced_x86::IcedError) -> Self {
        EmitError::Assembler(e.to_string())
    }
}
