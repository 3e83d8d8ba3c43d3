//! Empty-block removal.
//!
//! A block whose body is a single `goto` adds nothing: every predecessor can
//! jump straight to its successor. Each predecessor's terminator is rewritten
//! to the successor's label with the dead block's parameters positionally
//! substituted into the argument list, and the successor's in-edge list is
//! repaired in place.

use crate::ir::{separator_index, Function, Inst, Module, Opcode, Operand};

/// Run the pass over every function.
pub fn run(module: &mut Module) {
    for func in &mut module.functions {
        run_function(func);
    }
}

fn run_function(func: &mut Function) {
    let mut b = 1;
    while b < func.layout.len() {
        let block = func.layout[b];
        if func.dfg.blocks[block].insts.len() != 1 {
            b += 1;
            continue;
        }
        let exit = func.dfg.blocks[block].insts[0];
        if func.dfg.insts[exit].opcode != Opcode::Goto {
            b += 1;
            continue;
        }
        let target_name = func.dfg.insts[exit].operands[0]
            .as_text()
            .expect("goto target")
            .to_string();
        let target = func
            .block_by_name(&target_name)
            .expect("goto target exists");
        if target == block {
            // A self-looping goto is not removable.
            b += 1;
            continue;
        }

        log::trace!(
            "removing empty block {} (forwards to {target_name})",
            func.dfg.blocks[block].name
        );

        let exit_in_idx = func.dfg.blocks[target]
            .preds
            .iter()
            .position(|p| *p == exit)
            .expect("forwarding goto is an in-edge of its target");

        func.layout.remove(b);

        // The forwarding goto dies with the block.
        let exit_args: Vec<Operand> = func.dfg.insts[exit].operands[1..].to_vec();
        func.dfg.detach_operands(exit);

        let block_name = func.dfg.blocks[block].name.clone();
        let params = func.dfg.blocks[block].params.clone();
        let preds = func.dfg.blocks[block].preds.clone();

        // The forwarding goto's slot in the target's in-edge list is taken
        // over by the first rewired arm; further arms insert beside it.
        let mut replaced_once = false;
        let mut record_pred = |func: &mut Function, entry: Inst| {
            if replaced_once {
                func.dfg.blocks[target].preds.insert(exit_in_idx, entry);
            } else {
                func.dfg.blocks[target].preds[exit_in_idx] = entry;
                replaced_once = true;
            }
        };
        for entry in preds {
            let opcode = func.dfg.insts[entry].opcode;
            match opcode {
                Opcode::Goto => {
                    rewire_arm(func, entry, 0, &params, &exit_args, &target_name);
                    record_pred(func, entry);
                }
                Opcode::If => {
                    if func.dfg.insts[entry].operands[1].as_text() == Some(block_name.as_str()) {
                        rewire_arm(func, entry, 1, &params, &exit_args, &target_name);
                        record_pred(func, entry);
                    }
                    let sep = separator_index(&func.dfg.insts[entry].operands)
                        .expect("if has an else arm");
                    if func.dfg.insts[entry].operands[sep + 1].as_text()
                        == Some(block_name.as_str())
                    {
                        rewire_arm(func, entry, sep + 1, &params, &exit_args, &target_name);
                        record_pred(func, entry);
                    }
                }
                _ => unreachable!("in-edge from a non-terminator"),
            }
        }
    }
}

// Rewrite one arm of `entry` (its label at `label_idx` plus the following
// argument span) from the dead block to `target_name`, substituting the dead
// block's parameters with the forwarding goto's own arguments.
fn rewire_arm(
    func: &mut Function,
    entry: Inst,
    label_idx: usize,
    params: &[crate::ir::Value],
    exit_args: &[Operand],
    target_name: &str,
) {
    let span_start = label_idx + 1;

    // The entry's argument span, one operand per dead-block parameter.
    let old_span: Vec<Operand> =
        func.dfg.insts[entry].operands[span_start..span_start + params.len()].to_vec();

    // Each forwarded argument is either one of the dead block's parameters
    // (pick the entry's positional value) or a constant of its own.
    let new_span: Vec<Operand> = exit_args
        .iter()
        .map(|arg| {
            if let Some(v) = arg.as_value() {
                if let Some(at) = params.iter().position(|p| *p == v) {
                    return old_span[at].clone();
                }
            }
            arg.clone()
        })
        .collect();

    for _ in 0..params.len() {
        func.dfg.remove_operand(entry, span_start);
    }
    func.dfg.insts[entry].operands[label_idx] = Operand::Text(target_name.to_string());
    for (i, op) in new_span.into_iter().enumerate() {
        func.dfg.insert_operand(entry, span_start + i, op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    // entry -> mid(x) -> exit(a b), where mid only forwards x twice.
    #[test]
    fn forwards_through_single_goto() {
        let mut func = Function::new("f".to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        let mid = func.dfg.make_block("mid".to_string());
        let exit = func.dfg.make_block("exit".to_string());
        func.layout.extend([entry, mid, exit]);
        func.entry = entry.into();

        let a = func.dfg.make_param(Type::I64, "a".to_string());
        func.params.push(a);

        let j0 = func.dfg.make_inst(
            Opcode::Goto,
            vec![Operand::Text("mid".to_string()), Operand::Value(a)],
        );
        func.dfg.insts[j0].block = entry.into();
        func.dfg.blocks[entry].insts.push(j0);

        let x = func.dfg.make_param(Type::I64, "x".to_string());
        func.dfg.blocks[mid].params.push(x);
        let j1 = func.dfg.make_inst(
            Opcode::Goto,
            vec![
                Operand::Text("exit".to_string()),
                Operand::Value(x),
                Operand::Value(x),
            ],
        );
        func.dfg.insts[j1].block = mid.into();
        func.dfg.blocks[mid].insts.push(j1);

        let p = func.dfg.make_param(Type::I64, "p".to_string());
        let q = func.dfg.make_param(Type::I64, "q".to_string());
        func.dfg.blocks[exit].params.extend([p, q]);
        let add = func
            .dfg
            .make_inst(Opcode::Add, vec![Operand::Value(p), Operand::Value(q)]);
        let r = func.dfg.attach_result(add, Type::I64, "r".to_string());
        let ret = func.dfg.make_inst(Opcode::Return, vec![Operand::Value(r)]);
        for inst in [add, ret] {
            func.dfg.insts[inst].block = exit.into();
            func.dfg.blocks[exit].insts.push(inst);
        }

        crate::flowgraph::compute(&mut func).unwrap();
        run_function(&mut func);

        assert_eq!(func.layout, vec![entry, exit]);
        assert_eq!(
            func.dfg.insts[j0].operands,
            vec![
                Operand::Text("exit".to_string()),
                Operand::Value(a),
                Operand::Value(a),
            ]
        );
        assert_eq!(func.dfg.blocks[exit].preds, vec![j0]);
        assert_eq!(func.dfg.values[a].uses, vec![j0, j0]);
        assert!(func.dfg.values[x].uses.is_empty());
    }
}
