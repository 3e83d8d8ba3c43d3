//! Per-statement operand legalization.
//!
//! Runs as each statement is appended to a block, before edge connection.
//! Two rewrites bring operands into shapes the x86-64 backend can encode:
//!
//! 1. A stack-slot address used by anything other than `load`/`store`/`mov`
//!    is materialized through a fresh `mov` (a `lea` at emission time).
//! 2. A constant in an operand position whose opcode has no immediate form
//!    is materialized through a fresh `mov`.

use crate::ir::{Block, Function, Opcode, Operand, ValueDef};

/// Legalize the operands of the statement most recently appended to `block`.
pub fn legalize_appended(func: &mut Function, block: Block) {
    let end = func.dfg.blocks[block].insts.len();
    if end == 0 {
        return;
    }
    let inst = func.dfg.blocks[block].insts[end - 1];
    let opcode = func.dfg.insts[inst].opcode;

    // Stack addresses: only the memory-access statements take them raw.
    if !matches!(opcode, Opcode::Load | Opcode::Store | Opcode::Mov) {
        for i in 0..func.dfg.insts[inst].operands.len() {
            let Some(value) = func.dfg.insts[inst].operands[i].as_value() else {
                continue;
            };
            if !matches!(func.dfg.values[value].def, ValueDef::StackAddr(_)) {
                continue;
            }
            let copy = materialize(func, block, inst, value);
            func.dfg.insts[inst].operands[i] = Operand::Value(copy);
        }
    }

    // Constants in positions without an immediate form.
    for i in 0..func.dfg.insts[inst].operands.len().min(8) {
        if opcode.allows_imm(i) {
            continue;
        }
        let Some(value) = func.dfg.insts[inst].operands[i].as_value() else {
            continue;
        };
        if !matches!(func.dfg.values[value].def, ValueDef::Const(_)) {
            continue;
        }
        let copy = materialize(func, block, inst, value);
        func.dfg.insts[inst].operands[i] = Operand::Value(copy);
    }
}

// Insert `tmp = mov value` immediately before `before` and return `tmp`.
fn materialize(
    func: &mut Function,
    block: Block,
    before: crate::ir::Inst,
    value: crate::ir::Value,
) -> crate::ir::Value {
    let name = func.temp_name();
    let ty = func.dfg.value_type(value);
    let mov = func.dfg.make_inst(Opcode::Mov, vec![Operand::Value(value)]);
    let result = func.dfg.attach_result(mov, ty, name);
    func.dfg.insts[mov].block = block.into();
    let at = func.dfg.blocks[block]
        .insts
        .iter()
        .position(|i| *i == before)
        .expect("statement being legalized is in its block");
    func.dfg.blocks[block].insts.insert(at, mov);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{StackSlotKind, Type};

    #[test]
    fn stack_addresses_become_movs() {
        let mut func = Function::new("f".to_string(), Type::None);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let addr = func.create_stack_slot("s".to_string(), 8, StackSlotKind::Explicit);

        // `add` cannot take a raw stack address.
        let other = func.dfg.make_param(Type::IPtr, "p".to_string());
        func.params.push(other);
        let add = func
            .dfg
            .make_inst(Opcode::Add, vec![Operand::Value(other), Operand::Value(addr)]);
        func.dfg.attach_result(add, Type::IPtr, "q".to_string());
        func.dfg.insts[add].block = entry.into();
        func.dfg.blocks[entry].insts.push(add);

        legalize_appended(&mut func, entry);

        let insts = &func.dfg.blocks[entry].insts;
        assert_eq!(insts.len(), 2);
        let mov = insts[0];
        assert_eq!(func.dfg.insts[mov].opcode, Opcode::Mov);
        assert_eq!(func.dfg.insts[mov].operands, vec![Operand::Value(addr)]);
        let copy = func.dfg.insts[mov].result.expand().unwrap();
        assert_eq!(func.dfg.insts[add].operands[1], Operand::Value(copy));
    }

    #[test]
    fn left_immediates_become_movs() {
        let mut func = Function::new("f".to_string(), Type::None);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let a = func.dfg.make_param(Type::I64, "a".to_string());
        func.params.push(a);
        let k = func.dfg.make_const(Type::I64, 3);

        let sub = func
            .dfg
            .make_inst(Opcode::Sub, vec![Operand::Value(k), Operand::Value(a)]);
        func.dfg.attach_result(sub, Type::I64, "r".to_string());
        func.dfg.insts[sub].block = entry.into();
        func.dfg.blocks[entry].insts.push(sub);

        legalize_appended(&mut func, entry);

        let insts = &func.dfg.blocks[entry].insts;
        assert_eq!(insts.len(), 2);
        assert_eq!(func.dfg.insts[insts[0]].opcode, Opcode::Mov);
        // The right-hand side may stay an immediate.
        assert_eq!(func.dfg.insts[insts[1]].operands[1], Operand::Value(a));
    }
}
