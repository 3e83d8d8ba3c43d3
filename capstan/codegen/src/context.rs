//! The compilation pipeline.
//!
//! One compile is a fixed sequence: finish construction (branch splitting and
//! edge connection), run the optimization passes in their fixed order, then
//! lower (register allocation, frame layout, emission, relocation). Errors
//! abort the compile; the module should be discarded afterwards.

use crate::binemit::Compilation;
use crate::error::CodegenResult;
use crate::ir::Module;
use crate::isa::x64::abi::CallConv;

/// Split blocks at conditional branches and connect use and control-flow
/// edges. Producers of freshly parsed or freshly built IR call this before
/// anything else.
pub fn finish_construction(module: &mut Module) -> CodegenResult<()> {
    for func in &mut module.functions {
        crate::branch_splitting::run(func);
        crate::flowgraph::compute(func)?;
    }
    Ok(())
}

/// The optimization pipeline: empty-block removal, inlining, global mem2reg,
/// and dead block-parameter removal, each running at most once.
pub fn optimize(module: &mut Module) -> CodegenResult<()> {
    crate::remove_empty_blocks::run(module);
    crate::inline::run(module)?;
    crate::mem2reg::run(module);
    crate::remove_dead_params::run(module);
    Ok(())
}

/// Lower the module to machine code: register allocation, stack layout,
/// instruction emission, and relocation resolution.
pub fn lower(module: &mut Module, conv: CallConv) -> CodegenResult<Compilation> {
    crate::regalloc::run(module, conv)?;
    crate::isa::x64::emit::emit_module(module, conv)
}
