//! Target-specific code. The sole supported instruction set is x86-64.

pub mod x64;
