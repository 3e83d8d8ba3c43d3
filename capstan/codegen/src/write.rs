//! Converting a module back to its textual form.
//!
//! The printer produces text the reader accepts, which is what the round-trip
//! tests and `--print-ir` rely on. Value references print as their names;
//! constants print as suffixed literals.

use core::fmt::Write;

use crate::ir::{Block, Function, Module, Operand, StaticInit, Type, Value, ValueDef};

/// Render a whole module.
pub fn module_to_string(module: &Module) -> String {
    let mut out = String::new();
    for stat in &module.statics {
        if stat.name.starts_with("__const") {
            continue;
        }
        if let StaticInit::Word(bits) = stat.init {
            let _ = writeln!(
                out,
                "static {} {} {}",
                stat.name,
                stat.ty,
                const_literal(&stat.ty, bits)
            );
        }
    }
    for func in &module.functions {
        function_to_string(func, &mut out);
    }
    out
}

/// Render one function.
pub fn function_to_string(func: &Function, out: &mut String) {
    let _ = write!(out, "func {}", func.name);
    if func.return_type != Type::None {
        let _ = write!(out, " returns {}", func.return_type);
    }
    let _ = writeln!(out);

    for param in &func.params {
        let data = &func.dfg.values[*param];
        let _ = writeln!(out, "    arg {} {}", data.name, data.ty);
    }
    for slot in &func.active_slots {
        let data = &func.stack_slots[*slot];
        let _ = writeln!(out, "    stack_slot {} {}", data.name, data.size);
    }

    for (i, block) in func.layout.iter().enumerate() {
        if i > 0 {
            let _ = writeln!(out, "block {}", func.dfg.blocks[*block].name);
            for param in &func.dfg.blocks[*block].params {
                let data = &func.dfg.values[*param];
                let _ = writeln!(out, "    arg {} {}", data.name, data.ty);
            }
        }
        write_block_body(func, *block, out);
    }
    let _ = writeln!(out, "endfunc");
}

fn write_block_body(func: &Function, block: Block, out: &mut String) {
    for inst in &func.dfg.blocks[block].insts {
        let data = &func.dfg.insts[*inst];
        let _ = write!(out, "    ");
        if let Some(result) = data.result.expand() {
            let _ = write!(out, "{} = ", func.dfg.values[result].name);
        }
        let _ = write!(out, "{}", data.opcode.name());
        for (i, op) in data.operands.iter().enumerate() {
            // `if COND goto L` spells out its `goto`.
            if data.opcode == crate::ir::Opcode::If && i == 1 {
                let _ = write!(out, " goto");
            }
            match op {
                Operand::Type(ty) => {
                    let _ = write!(out, " {ty}");
                }
                Operand::Value(v) => {
                    let _ = write!(out, " {}", value_text(func, *v));
                }
                Operand::Text(s) => {
                    let _ = write!(out, " {s}");
                }
                Operand::Separator => {
                    let _ = write!(out, " else");
                }
            }
        }
        let _ = writeln!(out);
    }
}

fn value_text(func: &Function, value: Value) -> String {
    let data = &func.dfg.values[value];
    match data.def {
        ValueDef::Const(bits) => const_literal(&data.ty, bits),
        _ => data.name.clone(),
    }
}

fn const_literal(ty: &Type, bits: u64) -> String {
    match ty {
        Type::F32 => format!("{:?}f32", f32::from_bits(bits as u32)),
        Type::F64 => format!("{:?}f64", f64::from_bits(bits)),
        _ => format!("{}{}", bits as i64, ty),
    }
}
