//! Capstan code generator library.
//!
//! This crate takes a block-argument SSA module (usually produced by
//! `capstan-reader`), optimizes it, allocates x86-64 registers, and emits
//! position-independent machine code with a symbol table and a log of
//! relocations for a JIT host to resolve.

pub mod binemit;
pub mod branch_splitting;
pub mod context;
pub mod error;
pub mod flowgraph;
pub mod inline;
pub mod ir;
pub mod isa;
pub mod legalizer;
pub mod mem2reg;
pub mod regalloc;
pub mod remove_dead_params;
pub mod remove_empty_blocks;
pub mod write;

pub use crate::binemit::Compilation;
pub use crate::context::{finish_construction, lower, optimize};
pub use crate::error::{CodegenError, CodegenResult};
pub use crate::isa::x64::abi::CallConv;
