//! Unused block-parameter removal.
//!
//! A block parameter is dead when nothing reads it, or when its only reads
//! are jumps straight back to the defining block in the same positional slot
//! (a value circling a loop without ever being consumed). Dead parameters
//! are removed together with the matching operand of every incoming
//! terminator, iterating to a fixed point since one removal can expose
//! another.

use crate::ir::{separator_index, Block, Function, Inst, Module, Opcode, Value};

/// Run the pass over every function.
pub fn run(module: &mut Module) {
    for func in &mut module.functions {
        run_function(func);
    }
}

fn run_function(func: &mut Function) {
    let mut did_work = true;
    while did_work {
        did_work = false;
        for b in 1..func.layout.len() {
            let block = func.layout[b];
            let mut a = 0;
            while a < func.dfg.blocks[block].params.len() {
                let param = func.dfg.blocks[block].params[a];
                if param_is_dead(func, block, param, a) {
                    remove_param(func, block, a);
                    did_work = true;
                } else {
                    a += 1;
                }
            }
        }
    }
}

// True when every use of `param` is a jump back to `block` carrying it in
// slot `a`.
fn param_is_dead(func: &Function, block: Block, param: Value, a: usize) -> bool {
    func.dfg.values[param]
        .uses
        .iter()
        .all(|inst| use_is_self_cycle(func, block, param, a, *inst))
}

fn use_is_self_cycle(func: &Function, block: Block, param: Value, a: usize, inst: Inst) -> bool {
    let data = &func.dfg.insts[inst];
    let block_name = func.dfg.blocks[block].name.as_str();
    match data.opcode {
        Opcode::Goto => {
            data.operands[0].as_text() == Some(block_name)
                && arm_slot_holds(func, inst, 1, a, param)
                && occurrence_count(func, inst, param) == 1
        }
        Opcode::If => {
            let Some(sep) = separator_index(&data.operands) else {
                return false;
            };
            let then_self = data.operands[1].as_text() == Some(block_name);
            let else_self = data.operands[sep + 1].as_text() == Some(block_name);
            let mut expected = 0;
            if then_self {
                if !arm_slot_holds(func, inst, 2, a, param) {
                    return false;
                }
                expected += 1;
            }
            if else_self {
                if !arm_slot_holds(func, inst, sep + 2, a, param) {
                    return false;
                }
                expected += 1;
            }
            expected > 0 && occurrence_count(func, inst, param) == expected
        }
        _ => false,
    }
}

fn arm_slot_holds(func: &Function, inst: Inst, span_start: usize, a: usize, param: Value) -> bool {
    func.dfg.insts[inst]
        .operands
        .get(span_start + a)
        .and_then(|op| op.as_value())
        == Some(param)
}

fn occurrence_count(func: &Function, inst: Inst, param: Value) -> usize {
    func.dfg
        .value_operands(inst)
        .iter()
        .filter(|v| **v == param)
        .count()
}

// Drop parameter `a` of `block` and the matching operand of every incoming
// arm.
fn remove_param(func: &mut Function, block: Block, a: usize) {
    let param = func.dfg.blocks[block].params[a];
    log::trace!(
        "removing dead parameter {} of block {}",
        func.dfg.values[param].name,
        func.dfg.blocks[block].name
    );

    let block_name = func.dfg.blocks[block].name.clone();
    let mut preds = func.dfg.blocks[block].preds.clone();
    preds.dedup();
    for entry in preds {
        match func.dfg.insts[entry].opcode {
            Opcode::Goto => {
                debug_assert_eq!(
                    func.dfg.insts[entry].operands[0].as_text(),
                    Some(block_name.as_str())
                );
                func.dfg.remove_operand(entry, 1 + a);
            }
            Opcode::If => {
                // True arm first; recompute the separator before touching the
                // false arm since the removal shifts it.
                if func.dfg.insts[entry].operands[1].as_text() == Some(block_name.as_str()) {
                    func.dfg.remove_operand(entry, 2 + a);
                }
                let sep = separator_index(&func.dfg.insts[entry].operands)
                    .expect("if has an else arm");
                if func.dfg.insts[entry].operands[sep + 1].as_text() == Some(block_name.as_str())
                {
                    func.dfg.remove_operand(entry, sep + 2 + a);
                }
            }
            _ => unreachable!("in-edge from a non-terminator"),
        }
    }
    func.dfg.blocks[block].params.remove(a);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Operand, Type};

    // entry: goto loop a a / loop(x, y): if c goto loop x y else out
    // `y` is only ever carried around the loop; `x` feeds the comparison.
    #[test]
    fn removes_cycled_param() {
        let mut func = Function::new("f".to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        let looph = func.dfg.make_block("loop".to_string());
        let out = func.dfg.make_block("out".to_string());
        func.layout.extend([entry, looph, out]);
        func.entry = entry.into();
        let a = func.dfg.make_param(Type::I64, "a".to_string());
        func.params.push(a);

        let j = func.dfg.make_inst(
            Opcode::Goto,
            vec![
                Operand::Text("loop".to_string()),
                Operand::Value(a),
                Operand::Value(a),
            ],
        );
        func.dfg.insts[j].block = entry.into();
        func.dfg.blocks[entry].insts.push(j);

        let x = func.dfg.make_param(Type::I64, "x".to_string());
        let y = func.dfg.make_param(Type::I64, "y".to_string());
        func.dfg.blocks[looph].params.extend([x, y]);
        let zero = func.dfg.make_const(Type::I64, 0);
        let cmp = func
            .dfg
            .make_inst(Opcode::CmpG, vec![Operand::Value(x), Operand::Value(zero)]);
        let c = func.dfg.attach_result(cmp, Type::I8, "c".to_string());
        let iff = func.dfg.make_inst(
            Opcode::If,
            vec![
                Operand::Value(c),
                Operand::Text("loop".to_string()),
                Operand::Value(x),
                Operand::Value(y),
                Operand::Separator,
                Operand::Text("out".to_string()),
            ],
        );
        for inst in [cmp, iff] {
            func.dfg.insts[inst].block = looph.into();
            func.dfg.blocks[looph].insts.push(inst);
        }
        let ret = func.dfg.make_inst(Opcode::Return, vec![]);
        func.dfg.insts[ret].block = out.into();
        func.dfg.blocks[out].insts.push(ret);

        crate::flowgraph::compute(&mut func).unwrap();
        run_function(&mut func);

        // `y` went away everywhere; `x` stayed.
        assert_eq!(func.dfg.blocks[looph].params, vec![x]);
        assert_eq!(func.dfg.insts[j].operands.len(), 2);
        assert_eq!(
            func.dfg.insts[iff].operands,
            vec![
                Operand::Value(c),
                Operand::Text("loop".to_string()),
                Operand::Value(x),
                Operand::Separator,
                Operand::Text("out".to_string()),
            ]
        );
    }
}
