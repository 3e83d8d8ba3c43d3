//! Capstan textual IR reader.
//!
//! Parses the line-oriented textual form into a `capstan_codegen` module,
//! finishing construction (branch splitting and edge connection) on the way
//! out, so any program this crate returns is ready for the optimizer.

mod error;
mod parser;

pub use crate::error::{ParseError, ParseResult};
pub use crate::parser::parse_module;
