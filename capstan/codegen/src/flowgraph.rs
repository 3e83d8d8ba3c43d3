//! Edge connection.
//!
//! One pass over a freshly constructed (and branch-split) function records
//! every value's use edges and resolves terminator labels into block
//! predecessor/successor lists. Edges are the sole representation of control
//! flow afterwards; the textual labels stay in the instructions for
//! emission-time relocation.

use crate::error::{CodegenError, CodegenResult};
use crate::ir::{separator_index, Function, Opcode, Operand};

/// Compute use edges and control-flow edges for `func`, checking the basic
/// shape invariants on the way: every block ends in exactly one terminator,
/// and terminators appear nowhere else.
pub fn compute(func: &mut Function) -> CodegenResult<()> {
    // Start from a clean slate so the pass is idempotent.
    for data in func.dfg.values.values_mut() {
        data.uses.clear();
    }
    for data in func.dfg.blocks.values_mut() {
        data.preds.clear();
        data.succs.clear();
    }

    for b in 0..func.layout.len() {
        let block = func.layout[b];
        let insts = func.dfg.blocks[block].insts.clone();
        let Some(last) = insts.last().copied() else {
            return Err(CodegenError::InvalidIr(format!(
                "block {} is empty",
                func.dfg.blocks[block].name
            )));
        };

        for inst in insts.iter().copied() {
            let opcode = func.dfg.insts[inst].opcode;
            if opcode.is_terminator() != (inst == last) {
                return Err(CodegenError::InvalidIr(format!(
                    "block {} is not terminated by its last statement",
                    func.dfg.blocks[block].name
                )));
            }

            func.dfg.attach_operands(inst);

            match opcode {
                Opcode::Goto => {
                    let target = resolve_label(func, inst, 0)?;
                    func.dfg.blocks[target].preds.push(inst);
                    func.dfg.blocks[block].succs.push(inst);
                }
                Opcode::If => {
                    let operands = &func.dfg.insts[inst].operands;
                    let Some(sep) = separator_index(operands) else {
                        return Err(CodegenError::InvalidIr(format!(
                            "`if` in block {} has no else arm; blocks were not split",
                            func.dfg.blocks[block].name
                        )));
                    };
                    let then_target = resolve_label(func, inst, 1)?;
                    let else_target = resolve_label(func, inst, sep + 1)?;
                    func.dfg.blocks[then_target].preds.push(inst);
                    func.dfg.blocks[block].succs.push(inst);
                    func.dfg.blocks[else_target].preds.push(inst);
                    func.dfg.blocks[block].succs.push(inst);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn resolve_label(
    func: &Function,
    inst: crate::ir::Inst,
    index: usize,
) -> CodegenResult<crate::ir::Block> {
    let operands = &func.dfg.insts[inst].operands;
    let name = match operands.get(index) {
        Some(Operand::Text(name)) => name,
        _ => {
            return Err(CodegenError::InvalidIr(format!(
                "terminator operand {index} is not a label"
            )))
        }
    };
    func.block_by_name(name)
        .ok_or_else(|| CodegenError::InvalidIr(format!("jump to unknown block `{name}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    #[test]
    fn connects_goto_edges() {
        let mut func = Function::new("f".to_string(), Type::None);
        let entry = func.dfg.make_block("__entry__".to_string());
        let exit = func.dfg.make_block("exit".to_string());
        func.layout.push(entry);
        func.layout.push(exit);
        func.entry = entry.into();

        let a = func.dfg.make_param(Type::I64, "a".to_string());
        func.params.push(a);
        let goto = func.dfg.make_inst(
            Opcode::Goto,
            vec![Operand::Text("exit".to_string()), Operand::Value(a)],
        );
        func.dfg.insts[goto].block = entry.into();
        func.dfg.blocks[entry].insts.push(goto);
        let ret = func.dfg.make_inst(Opcode::Return, vec![]);
        func.dfg.insts[ret].block = exit.into();
        func.dfg.blocks[exit].insts.push(ret);

        compute(&mut func).unwrap();
        assert_eq!(func.dfg.blocks[exit].preds, vec![goto]);
        assert_eq!(func.dfg.blocks[entry].succs, vec![goto]);
        assert_eq!(func.dfg.values[a].uses, vec![goto]);
    }

    #[test]
    fn rejects_unterminated_blocks() {
        let mut func = Function::new("f".to_string(), Type::None);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let a = func.dfg.make_param(Type::I64, "a".to_string());
        func.params.push(a);
        let add = func
            .dfg
            .make_inst(Opcode::Add, vec![Operand::Value(a), Operand::Value(a)]);
        func.dfg.insts[add].block = entry.into();
        func.dfg.blocks[entry].insts.push(add);
        assert!(compute(&mut func).is_err());
    }
}
