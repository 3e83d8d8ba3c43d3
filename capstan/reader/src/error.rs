//! Parse errors with source locations.

use capstan_codegen::CodegenError;
use thiserror::Error;

/// An error while reading textual IR. Line numbers are 1-based.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: `{name}` is already defined")]
    Redefinition { line: usize, name: String },

    #[error("line {line}: use of undefined name `{name}`")]
    UndefinedReference { line: usize, name: String },

    /// The text parsed but the resulting IR failed construction checks.
    #[error(transparent)]
    Construction(#[from] CodegenError),
}

pub type ParseResult<T> = Result<T, ParseError>;
