//! Global promotion of stack slots to SSA values.
//!
//! A slot whose address is only ever consumed by `load` and `store` never
//! escapes, so its contents can be threaded through the function as an SSA
//! value: one live definition per block, passed along every control-flow edge
//! as a block argument. Loads collapse into `mov`s from the live value,
//! stores into `mov`s that shadow it, and the slot disappears from the frame.

use crate::ir::{separator_index, Function, Module, Opcode, Operand, StackSlot, Type};

/// Run the pass over every function.
pub fn run(module: &mut Module) {
    for func in &mut module.functions {
        run_function(func);
    }
}

fn run_function(func: &mut Function) {
    let mut s = 0;
    while s < func.active_slots.len() {
        let slot = func.active_slots[s];
        match promotable_type(func, slot) {
            Some(ty) => {
                promote(func, slot, ty);
                func.active_slots.remove(s);
            }
            None => s += 1,
        }
    }
}

// A slot is promotable when every use of its address is a load or a store of
// that address, and at least one load exists (a never-read slot is left
// alone). Returns the threaded type, taken from the loads.
fn promotable_type(func: &Function, slot: StackSlot) -> Option<Type> {
    let addr = func.stack_slots[slot].addr.expand()?;
    let mut loaded: Option<Type> = None;
    for inst in &func.dfg.values[addr].uses {
        let data = &func.dfg.insts[*inst];
        match data.opcode {
            Opcode::Load if data.operands[1].as_value() == Some(addr) => {
                let result = data.result.expand()?;
                loaded = Some(func.dfg.value_type(result));
            }
            Opcode::Store if data.operands[0].as_value() == Some(addr) => {}
            _ => return None,
        }
    }
    loaded
}

fn promote(func: &mut Function, slot: StackSlot, ty: Type) {
    let addr = func.stack_slots[slot].addr.expand().expect("slot address");
    let name = func.temp_name();
    log::trace!(
        "promoting stack slot {} to value {name}",
        func.stack_slots[slot].name
    );

    for b in 0..func.layout.len() {
        let block = func.layout[b];

        // The live definition entering this block: a zeroed `mov` in the
        // entry block, a fresh block parameter everywhere else.
        let mut live = if Some(block) == func.entry.expand() {
            let zero = func.dfg.make_const(ty.clone(), 0);
            let init = func.dfg.make_inst(Opcode::Mov, vec![Operand::Value(zero)]);
            let value = func.dfg.attach_result(init, ty.clone(), name.clone());
            func.dfg.insts[init].block = block.into();
            func.dfg.blocks[block].insts.insert(0, init);
            value
        } else {
            let param = func.dfg.make_param(ty.clone(), name.clone());
            func.dfg.blocks[block].params.push(param);
            param
        };

        let insts = func.dfg.blocks[block].insts.clone();
        for inst in insts {
            match func.dfg.insts[inst].opcode {
                Opcode::Load
                    if func.dfg.insts[inst].operands[1].as_value() == Some(addr) =>
                {
                    // `r = load T addr` becomes `r = mov live`.
                    func.dfg.insts[inst].opcode = Opcode::Mov;
                    func.dfg.remove_operand(inst, 0);
                    func.dfg.replace_operand(inst, 0, Operand::Value(live));
                }
                Opcode::Store
                    if func.dfg.insts[inst].operands[0].as_value() == Some(addr) =>
                {
                    // `store addr v` becomes `live' = mov v`.
                    let shadow_name = func.temp_name();
                    func.dfg.insts[inst].opcode = Opcode::Mov;
                    func.dfg.remove_operand(inst, 0);
                    live = func.dfg.attach_result(inst, ty.clone(), shadow_name);
                }
                Opcode::Goto => {
                    func.dfg.push_operand(inst, Operand::Value(live));
                }
                Opcode::If => {
                    // Append to the false arm's tail, then to the true arm's
                    // tail just before the separator.
                    func.dfg.push_operand(inst, Operand::Value(live));
                    let sep = separator_index(&func.dfg.insts[inst].operands)
                        .expect("if has an else arm");
                    func.dfg.insert_operand(inst, sep, Operand::Value(live));
                }
                _ => {}
            }
        }
    }

    debug_assert!(func.dfg.values[addr].uses.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::StackSlotKind;

    // entry: store s 1; goto next / next: r = load s; return r
    #[test]
    fn promotes_load_store_slot() {
        let mut func = Function::new("f".to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        let next = func.dfg.make_block("next".to_string());
        func.layout.extend([entry, next]);
        func.entry = entry.into();
        let addr = func.create_stack_slot("s".to_string(), 8, StackSlotKind::Explicit);

        let one = func.dfg.make_const(Type::I64, 1);
        let store = func.dfg.make_inst(
            Opcode::Store,
            vec![Operand::Value(addr), Operand::Value(one)],
        );
        let goto = func
            .dfg
            .make_inst(Opcode::Goto, vec![Operand::Text("next".to_string())]);
        for inst in [store, goto] {
            func.dfg.insts[inst].block = entry.into();
            func.dfg.blocks[entry].insts.push(inst);
        }
        let load = func.dfg.make_inst(
            Opcode::Load,
            vec![Operand::Type(Type::I64), Operand::Value(addr)],
        );
        let r = func.dfg.attach_result(load, Type::I64, "r".to_string());
        let ret = func.dfg.make_inst(Opcode::Return, vec![Operand::Value(r)]);
        for inst in [load, ret] {
            func.dfg.insts[inst].block = next.into();
            func.dfg.blocks[next].insts.push(inst);
        }

        crate::flowgraph::compute(&mut func).unwrap();
        run_function(&mut func);

        // The slot is gone and all memory traffic became movs.
        assert!(func.active_slots.is_empty());
        assert_eq!(func.dfg.insts[store].opcode, Opcode::Mov);
        assert_eq!(func.dfg.insts[load].opcode, Opcode::Mov);
        // The goto now passes the stored value; the target gained a param.
        assert_eq!(func.dfg.insts[goto].operands.len(), 2);
        assert_eq!(func.dfg.blocks[next].params.len(), 1);
        let param = func.dfg.blocks[next].params[0];
        assert_eq!(
            func.dfg.insts[load].operands,
            vec![Operand::Value(param)]
        );
    }

    // A slot whose address escapes into arithmetic stays put.
    #[test]
    fn keeps_escaping_slot() {
        let mut func = Function::new("f".to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let addr = func.create_stack_slot("s".to_string(), 8, StackSlotKind::Explicit);

        let mov = func.dfg.make_inst(Opcode::Mov, vec![Operand::Value(addr)]);
        let p = func.dfg.attach_result(mov, Type::IPtr, "p".to_string());
        let ret = func.dfg.make_inst(Opcode::Return, vec![Operand::Value(p)]);
        for inst in [mov, ret] {
            func.dfg.insts[inst].block = entry.into();
            func.dfg.blocks[entry].insts.push(inst);
        }

        crate::flowgraph::compute(&mut func).unwrap();
        run_function(&mut func);
        assert_eq!(func.active_slots.len(), 1);
    }
}
