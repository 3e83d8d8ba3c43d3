//! The x86-64 backend: registers, calling conventions, the direct encoder,
//! and statement lowering.

pub mod abi;
pub mod emit;
pub mod encoder;
pub mod regs;
