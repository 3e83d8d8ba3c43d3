//! Block splitting at conditional branches.
//!
//! After parsing, a block may contain an `if` followed by more statements.
//! Lowering wants every conditional branch to be a block terminator, so each
//! such block is split: the trailing statements move into a fresh block, the
//! values that live across the split become parameters of that block, and the
//! `if` gains an else arm that jumps there with those values.
//!
//! This runs before edge connection, so it rewrites operands directly without
//! use-edge bookkeeping.

use hashbrown::HashMap;

use crate::ir::{Function, Inst, Opcode, Operand, Value, ValueDef};

/// Split every block of `func` so `if` only appears in terminator position.
pub fn run(func: &mut Function) {
    let mut b = 0;
    while b < func.layout.len() {
        let block = func.layout[b];

        // Last use of every value defined at or above the split candidates:
        // block (or function) parameters first, then statement results up to
        // the first branch.
        let params: Vec<Value> = func.block_params(block).to_vec();
        let insts: Vec<Inst> = func.dfg.blocks[block].insts.clone();

        let mut defs: Vec<(Value, String)> = params
            .iter()
            .map(|v| (*v, func.dfg.values[*v].name.clone()))
            .collect();
        let mut branch_found = false;
        for inst in &insts {
            if !branch_found {
                if let Some(result) = func.dfg.insts[*inst].result.expand() {
                    defs.push((result, func.dfg.values[result].name.clone()));
                }
            }
            if func.dfg.insts[*inst].opcode == Opcode::If {
                branch_found = true;
            }
        }

        let mut last_use: HashMap<Value, usize> = HashMap::new();
        for (i, inst) in insts.iter().enumerate() {
            for value in func.dfg.value_operands(*inst) {
                if matches!(
                    func.dfg.values[value].def,
                    ValueDef::Param | ValueDef::Inst(_)
                ) {
                    last_use.insert(value, i);
                }
            }
        }

        let split_at = insts
            .iter()
            .position(|i| func.dfg.insts[*i].opcode == Opcode::If)
            .filter(|at| at + 1 < insts.len());
        let Some(split_at) = split_at else {
            b += 1;
            continue;
        };

        let branch = insts[split_at];
        let next_name = func.temp_name();
        let next_block = func.dfg.make_block(next_name.clone());

        // Move the trailing statements.
        let moved: Vec<Inst> = func.dfg.blocks[block].insts.split_off(split_at + 1);
        for inst in &moved {
            func.dfg.insts[*inst].block = next_block.into();
        }
        func.dfg.blocks[next_block].insts = moved.clone();

        log::trace!(
            "splitting {} at statement {split_at}, {} statements move to {next_name}",
            func.dfg.blocks[block].name,
            moved.len()
        );

        // The branch grows a fall-through arm: `else next_name live...`.
        func.dfg.insts[branch].operands.push(Operand::Separator);
        func.dfg.insts[branch]
            .operands
            .push(Operand::Text(next_name));

        for (value, name) in defs {
            if last_use.get(&value).copied().unwrap_or(0) <= split_at {
                continue;
            }
            let ty = func.dfg.value_type(value);
            let param = func.dfg.make_param(ty, name);
            func.dfg.blocks[next_block].params.push(param);
            func.dfg.insts[branch].operands.push(Operand::Value(value));
            for inst in &moved {
                for op in func.dfg.insts[*inst].operands.iter_mut() {
                    if let Operand::Value(v) = op {
                        if *v == value {
                            *op = Operand::Value(param);
                        }
                    }
                }
            }
        }

        func.layout.insert(b + 1, next_block);
        b += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    // Build:
    //   entry(a):
    //     c = cmp_g a 0
    //     if c goto exit
    //     d = add a a      <- lives in the split-off block
    //     return d
    #[test]
    fn splits_at_interior_branch() {
        let mut func = Function::new("f".to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let a = func.dfg.make_param(Type::I64, "a".to_string());
        func.params.push(a);
        let exit = func.dfg.make_block("exit".to_string());
        func.layout.push(exit);

        let zero = func.dfg.make_const(Type::I64, 0);
        let cmp = func
            .dfg
            .make_inst(Opcode::CmpG, vec![Operand::Value(a), Operand::Value(zero)]);
        let c = func.dfg.attach_result(cmp, Type::I8, "c".to_string());
        let iff = func.dfg.make_inst(
            Opcode::If,
            vec![Operand::Value(c), Operand::Text("exit".to_string())],
        );
        let add = func
            .dfg
            .make_inst(Opcode::Add, vec![Operand::Value(a), Operand::Value(a)]);
        let d = func.dfg.attach_result(add, Type::I64, "d".to_string());
        let ret = func.dfg.make_inst(Opcode::Return, vec![Operand::Value(d)]);
        for inst in [cmp, iff, add, ret] {
            func.dfg.insts[inst].block = entry.into();
            func.dfg.blocks[entry].insts.push(inst);
        }
        let rete = func.dfg.make_inst(Opcode::Return, vec![]);
        func.dfg.insts[rete].block = exit.into();
        func.dfg.blocks[exit].insts.push(rete);

        run(&mut func);

        assert_eq!(func.layout.len(), 3);
        // `if` is now the entry terminator and carries an else arm.
        assert_eq!(func.dfg.blocks[entry].insts.last(), Some(&iff));
        let new_block = func.layout[1];
        assert_ne!(new_block, exit);
        assert_eq!(func.dfg.blocks[new_block].insts, vec![add, ret]);
        // `a` lives across the split, so it became a parameter.
        assert_eq!(func.dfg.blocks[new_block].params.len(), 1);
        let param = func.dfg.blocks[new_block].params[0];
        assert_eq!(
            func.dfg.insts[add].operands,
            vec![Operand::Value(param), Operand::Value(param)]
        );
        // The branch passes `a` along the else arm.
        let ops = &func.dfg.insts[iff].operands;
        assert!(ops.contains(&Operand::Separator));
        assert_eq!(ops.last(), Some(&Operand::Value(a)));
    }
}
