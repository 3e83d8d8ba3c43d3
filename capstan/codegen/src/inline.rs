//! Function inlining.
//!
//! A call whose target is a statically known, leaf (no internal calls),
//! small (≤ 100 statements) function is replaced by a copy of its body:
//! the containing block is split at the call, every SSA value live across
//! the call is parked in a fresh stack slot (a store before the call, a
//! load at the top of the continuation), the callee is cloned into the
//! caller by table remap, its returns become jumps to the continuation,
//! and the call itself becomes a jump into the clone's entry.
//!
//! The pass edits operands directly and rebuilds use and control-flow edges
//! once per mutated function.

use cranelift_entity::EntityRef;
use hashbrown::HashSet;

use crate::error::CodegenResult;
use crate::ir::{
    Block, Function, Inst, Module, Opcode, Operand, StackSlot, StackSlotKind, Value, ValueDef,
};

/// Largest callee body, in statements, the inliner will copy.
const MAX_INLINE_STATEMENTS: usize = 100;

/// Run the pass over every function.
pub fn run(module: &mut Module) -> CodegenResult<()> {
    for f in 0..module.functions.len() {
        let mut changed = false;
        let mut b = 0;
        while b < module.functions[f].layout.len() {
            if let Some((call, callee_ix)) = find_inlinable_call(module, f, b) {
                let callee = module.functions[callee_ix].clone();
                inline_call(&mut module.functions[f], b, call, &callee);
                changed = true;
            }
            b += 1;
        }
        if changed {
            crate::flowgraph::compute(&mut module.functions[f])?;
        }
    }
    Ok(())
}

// The first call in block `b` of function `f` whose callee we can and want
// to inline.
fn find_inlinable_call(module: &Module, f: usize, b: usize) -> Option<(Inst, usize)> {
    let func = &module.functions[f];
    let block = func.layout[b];
    let call = func.dfg.blocks[block]
        .insts
        .iter()
        .copied()
        .find(|i| matches!(func.dfg.insts[*i].opcode, Opcode::Call | Opcode::CallEval))?;

    // The target must come straight from a symbol lookup.
    let target = func.dfg.insts[call].operands.iter().find_map(|op| {
        if let Operand::Value(v) = op {
            Some(*v)
        } else {
            None
        }
    })?;
    let lookup = func.dfg.value_def_inst(target)?;
    if !matches!(
        func.dfg.insts[lookup].opcode,
        Opcode::SymbolLookup | Opcode::SymbolLookupUnsized
    ) {
        return None;
    }
    let symbol = func.dfg.insts[lookup].operands[0].as_text()?;
    let callee_ix = module.find_function(symbol)?;
    let callee = &module.functions[callee_ix];
    if callee.contains_calls() || callee.statement_count() > MAX_INLINE_STATEMENTS {
        return None;
    }
    log::debug!("inlining {} into {}", callee.name, func.name);
    Some((call, callee_ix))
}

fn inline_call(func: &mut Function, b: usize, call: Inst, callee: &Function) {
    let block = func.layout[b];
    let is_eval = func.dfg.insts[call].opcode == Opcode::CallEval;
    let call_pos = func.dfg.blocks[block]
        .insts
        .iter()
        .position(|i| *i == call)
        .expect("call is in its block");

    // Last use index of every value defined above the call, scanning the
    // whole block so uses in the continuation count.
    let params: Vec<Value> = func.block_params(block).to_vec();
    let insts: Vec<Inst> = func.dfg.blocks[block].insts.clone();
    let mut defs: Vec<Value> = params;
    for inst in insts.iter().take(call_pos) {
        if let Some(result) = func.dfg.insts[*inst].result.expand() {
            defs.push(result);
        }
    }
    let mut last_use = hashbrown::HashMap::new();
    for (i, inst) in insts.iter().enumerate() {
        for value in func.dfg.value_operands(*inst) {
            last_use.insert(value, i);
        }
    }

    // Split off the continuation.
    let next_name = func.temp_name();
    let next_block = func.dfg.make_block(next_name.clone());
    let moved: Vec<Inst> = func.dfg.blocks[block].insts.split_off(call_pos + 1);
    for inst in &moved {
        func.dfg.insts[*inst].block = next_block.into();
    }
    func.dfg.blocks[next_block].insts = moved.clone();
    let moved_set: HashSet<Inst> = moved.iter().copied().collect();

    // Park the live-across values in stack slots.
    let mut loads_inserted = 0;
    for value in defs {
        if last_use.get(&value).copied().unwrap_or(0) <= call_pos {
            continue;
        }
        if matches!(func.dfg.values[value].def, ValueDef::StackAddr(_)) {
            continue;
        }
        let ty = func.dfg.value_type(value);
        let slot_name = format!("{}_{}", func.temp_name(), func.dfg.values[value].name);
        let slot_addr = func.create_stack_slot(slot_name, ty.bytes(), StackSlotKind::Spill);

        let store = func.dfg.make_inst(
            Opcode::Store,
            vec![Operand::Value(slot_addr), Operand::Value(value)],
        );
        func.dfg.insts[store].block = block.into();
        let at = func.dfg.blocks[block].insts.len() - 1;
        func.dfg.blocks[block].insts.insert(at, store);

        let reload_name = func.dfg.values[value].name.clone();
        let load = func.dfg.make_inst(
            Opcode::Load,
            vec![Operand::Type(ty.clone()), Operand::Value(slot_addr)],
        );
        let reloaded = func.dfg.attach_result(load, ty, reload_name);
        func.dfg.insts[load].block = next_block.into();
        func.dfg.blocks[next_block].insts.insert(loads_inserted, load);
        loads_inserted += 1;

        for inst in &moved_set {
            for op in func.dfg.insts[*inst].operands.iter_mut() {
                if *op == Operand::Value(value) {
                    *op = Operand::Value(reloaded);
                }
            }
        }
    }

    // A `call_eval` result turns into a parameter of the continuation.
    if is_eval {
        let result = func.dfg.insts[call].result.expand().expect("call_eval result");
        let ty = func.dfg.value_type(result);
        let name = func.dfg.values[result].name.clone();
        let param = func.dfg.make_param(ty, name);
        func.dfg.blocks[next_block].params.push(param);
        for inst in &moved_set {
            for op in func.dfg.insts[*inst].operands.iter_mut() {
                if *op == Operand::Value(result) {
                    *op = Operand::Value(param);
                }
            }
        }
    }

    // Copy the callee in and retarget its returns at the continuation.
    let prefix = format!("{}_", func.temp_name());
    let map = merge_function(func, callee, &prefix);
    let clone_entry = map.block(callee.entry.expand().expect("callee has an entry"));
    func.dfg.blocks[clone_entry].params =
        callee.params.iter().map(|v| map.value(*v)).collect();

    for old_block in callee.layout.iter() {
        let new_block = map.block(*old_block);
        for i in 0..func.dfg.blocks[new_block].insts.len() {
            let inst = func.dfg.blocks[new_block].insts[i];
            if func.dfg.insts[inst].opcode != Opcode::Return {
                continue;
            }
            func.dfg.insts[inst].opcode = Opcode::Goto;
            let mut operands = vec![Operand::Text(next_name.clone())];
            if is_eval {
                if let Some(v) = func.dfg.insts[inst].operands.first().cloned() {
                    operands.push(v);
                }
            }
            func.dfg.insts[inst].operands = operands;
        }
    }

    // The call becomes a jump into the clone; its value arguments (the type
    // operand and the callee address drop away) feed the clone's entry
    // parameters.
    func.dfg.insts[call].opcode = Opcode::Goto;
    func.dfg.insts[call].result = None.into();
    let entry_name = func.dfg.blocks[clone_entry].name.clone();
    let args: Vec<Operand> = func.dfg.insts[call]
        .operands
        .iter()
        .filter(|op| op.as_value().is_some())
        .skip(1)
        .cloned()
        .collect();
    let mut operands = vec![Operand::Text(entry_name)];
    operands.extend(args);
    func.dfg.insts[call].operands = operands;

    // Layout: block, clone's blocks, continuation.
    for (i, old_block) in callee.layout.iter().enumerate() {
        func.layout.insert(b + 1 + i, map.block(*old_block));
    }
    func.layout.insert(b + 1 + callee.layout.len(), next_block);
}

/// Entity offsets of a merged-in function; remapping is pure index
/// arithmetic because both tables are dense.
struct MergeMap {
    value_base: usize,
    inst_base: usize,
    block_base: usize,
    slot_base: usize,
}

impl MergeMap {
    fn value(&self, v: Value) -> Value {
        Value::new(v.index() + self.value_base)
    }
    fn inst(&self, i: Inst) -> Inst {
        Inst::new(i.index() + self.inst_base)
    }
    fn block(&self, b: Block) -> Block {
        Block::new(b.index() + self.block_base)
    }
    fn slot(&self, s: StackSlot) -> StackSlot {
        StackSlot::new(s.index() + self.slot_base)
    }
}

// Copy every entity of `callee` into `func`, prefixing names so nothing
// collides, and rewriting all internal references through the offset map.
fn merge_function(func: &mut Function, callee: &Function, prefix: &str) -> MergeMap {
    let map = MergeMap {
        value_base: func.dfg.values.len(),
        inst_base: func.dfg.insts.len(),
        block_base: func.dfg.blocks.len(),
        slot_base: func.stack_slots.len(),
    };

    for (_, data) in callee.stack_slots.iter() {
        let mut data = data.clone();
        data.name = format!("{prefix}{}", data.name);
        data.addr = data.addr.expand().map(|v| map.value(v)).into();
        func.stack_slots.push(data);
    }
    for slot in &callee.active_slots {
        func.active_slots.push(map.slot(*slot));
    }

    for (_, data) in callee.dfg.values.iter() {
        let mut data = data.clone();
        if !data.name.is_empty() {
            data.name = format!("{prefix}{}", data.name);
        }
        data.def = match data.def {
            ValueDef::Inst(i) => ValueDef::Inst(map.inst(i)),
            ValueDef::StackAddr(s) => ValueDef::StackAddr(map.slot(s)),
            other => other,
        };
        data.uses = data.uses.iter().map(|i| map.inst(*i)).collect();
        func.dfg.values.push(data);
    }

    for (_, data) in callee.dfg.insts.iter() {
        let mut data = data.clone();
        let prefixes_labels = matches!(data.opcode, Opcode::Goto | Opcode::If);
        for op in data.operands.iter_mut() {
            match op {
                Operand::Value(v) => *v = map.value(*v),
                Operand::Text(label) if prefixes_labels => {
                    *label = format!("{prefix}{label}");
                }
                _ => {}
            }
        }
        data.result = data.result.expand().map(|v| map.value(v)).into();
        data.block = data.block.expand().map(|b| map.block(b)).into();
        func.dfg.insts.push(data);
    }

    for (_, data) in callee.dfg.blocks.iter() {
        let mut data = data.clone();
        data.name = format!("{prefix}{}", data.name);
        data.params = data.params.iter().map(|v| map.value(*v)).collect();
        data.insts = data.insts.iter().map(|i| map.inst(*i)).collect();
        data.preds = data.preds.iter().map(|i| map.inst(*i)).collect();
        data.succs = data.succs.iter().map(|i| map.inst(*i)).collect();
        func.dfg.blocks.push(data);
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    fn leaf_double(name: &str) -> Function {
        // func double returns i64 / arg n i64 / r = add n n / return r
        let mut func = Function::new(name.to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let n = func.dfg.make_param(Type::I64, "n".to_string());
        func.params.push(n);
        let add = func
            .dfg
            .make_inst(Opcode::Add, vec![Operand::Value(n), Operand::Value(n)]);
        let r = func.dfg.attach_result(add, Type::I64, "r".to_string());
        let ret = func.dfg.make_inst(Opcode::Return, vec![Operand::Value(r)]);
        for inst in [add, ret] {
            func.dfg.insts[inst].block = entry.into();
            func.dfg.blocks[entry].insts.push(inst);
        }
        crate::flowgraph::compute(&mut func).unwrap();
        func
    }

    #[test]
    fn inlines_leaf_call() {
        let mut module = Module::new();
        module.functions.push(leaf_double("double"));

        // func main returns i64: p = symbol_lookup double;
        // x = call_eval i64 p 21; return x
        let mut main = Function::new("main".to_string(), Type::I64);
        let entry = main.dfg.make_block("__entry__".to_string());
        main.layout.push(entry);
        main.entry = entry.into();
        let lookup = main.dfg.make_inst(
            Opcode::SymbolLookup,
            vec![Operand::Text("double".to_string())],
        );
        let p = main.dfg.attach_result(lookup, Type::IPtr, "p".to_string());
        let k = main.dfg.make_const(Type::I64, 21);
        let call = main.dfg.make_inst(
            Opcode::CallEval,
            vec![
                Operand::Type(Type::I64),
                Operand::Value(p),
                Operand::Value(k),
            ],
        );
        let x = main.dfg.attach_result(call, Type::I64, "x".to_string());
        let ret = main.dfg.make_inst(Opcode::Return, vec![Operand::Value(x)]);
        for inst in [lookup, call, ret] {
            main.dfg.insts[inst].block = entry.into();
            main.dfg.blocks[entry].insts.push(inst);
        }
        crate::flowgraph::compute(&mut main).unwrap();
        module.functions.push(main);

        run(&mut module).unwrap();

        let main = &module.functions[1];
        // No calls remain.
        assert!(!main.contains_calls());
        // Layout: entry, clone of double's entry, continuation.
        assert_eq!(main.layout.len(), 3);
        // The entry now ends in a goto carrying the old call argument.
        let term = main.terminator(main.layout[0]).unwrap();
        assert_eq!(main.dfg.insts[term].opcode, Opcode::Goto);
        assert_eq!(main.dfg.insts[term].operands.len(), 2);
        // The continuation returns the clone's value through a parameter.
        let cont = main.layout[2];
        assert_eq!(main.dfg.blocks[cont].params.len(), 1);
        let cret = main.terminator(cont).unwrap();
        assert_eq!(main.dfg.insts[cret].opcode, Opcode::Return);
        assert_eq!(
            main.dfg.insts[cret].operands,
            vec![Operand::Value(main.dfg.blocks[cont].params[0])]
        );
    }
}
