//! Errors produced while compiling a module.

use thiserror::Error;

/// A compilation error. All of these abort the current compile; the module is
/// left in an unspecified state and should be discarded.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// An IR invariant did not hold after construction or a pass: a
    /// terminator in the middle of a block, an inconsistent use edge, an
    /// unknown label.
    #[error("IR invariant violated: {0}")]
    InvalidIr(String),

    /// The register allocator could not find a spill victim satisfying an
    /// opcode's register mask.
    #[error("register allocation ran out of registers in `{func}` while allocating `{value}`")]
    RegallocExhausted { func: String, value: String },

    /// An operand combination with no machine encoding reached the encoder.
    #[error("no encoding for {0}")]
    Unencodable(String),

    /// A resolved relocation displacement exceeds its field's signed range.
    #[error("relocation against `{name}` out of range (displacement {disp:#x})")]
    RelocOutOfRange { name: String, disp: i64 },

    /// A construct the backend does not lower.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type CodegenResult<T> = Result<T, CodegenError>;
