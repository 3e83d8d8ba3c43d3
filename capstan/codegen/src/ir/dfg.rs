//! Data flow graph: the tables holding values, instructions, and blocks.
//!
//! Every IR node lives in one of three `PrimaryMap` arenas owned by the
//! enclosing function and is referred to by its entity index. Use edges (the
//! instructions reading a value) are stored per value, with one entry per
//! textual occurrence, and are kept consistent by the attach/detach helpers
//! here as passes rewrite operands.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;

use crate::ir::instructions::{Opcode, Operand, ResultKind};
use crate::ir::types::Type;
use crate::ir::{Block, Inst, StackSlot, Value};

/// How a value comes into existence.
#[derive(Clone, PartialEq, Debug)]
pub enum ValueDef {
    /// An immediate. The bits are the raw little-endian contents; for floats
    /// they are the IEEE 754 bit pattern.
    Const(u64),
    /// The result of an instruction.
    Inst(Inst),
    /// A parameter of the function or of a block.
    Param,
    /// The address of a stack slot. Always of type `iptr`.
    StackAddr(StackSlot),
}

/// A value table entry.
#[derive(Clone, Debug)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
    /// Textual name. Empty for constants.
    pub name: String,
    /// Instructions reading this value, one entry per operand occurrence,
    /// ordered by position in the block.
    pub uses: Vec<Inst>,
}

/// An instruction table entry.
#[derive(Clone, Debug)]
pub struct InstData {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub result: PackedOption<Value>,
    pub block: PackedOption<Block>,
    /// Ordering key used by the register allocator's spill heuristic; zero
    /// until allocation numbers the block.
    pub num: u32,
}

/// A block table entry.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    pub name: String,
    /// Block parameters (the function's parameters for the entry block live
    /// on the function instead).
    pub params: Vec<Value>,
    /// Instructions in execution order.
    pub insts: Vec<Inst>,
    /// Terminators in other blocks that jump here.
    pub preds: Vec<Inst>,
    /// Terminators in this block that leave it.
    pub succs: Vec<Inst>,
}

/// The arenas for one function.
#[derive(Clone, Default, Debug)]
pub struct DataFlowGraph {
    pub values: PrimaryMap<Value, ValueData>,
    pub insts: PrimaryMap<Inst, InstData>,
    pub blocks: PrimaryMap<Block, BlockData>,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new value.
    pub fn make_value(&mut self, ty: Type, def: ValueDef, name: String) -> Value {
        self.values.push(ValueData {
            ty,
            def,
            name,
            uses: Vec::new(),
        })
    }

    /// Create an anonymous constant value.
    pub fn make_const(&mut self, ty: Type, bits: u64) -> Value {
        self.make_value(ty, ValueDef::Const(bits), String::new())
    }

    /// Create a parameter value.
    pub fn make_param(&mut self, ty: Type, name: String) -> Value {
        self.make_value(ty, ValueDef::Param, name)
    }

    /// Create a new block with the given name.
    pub fn make_block(&mut self, name: String) -> Block {
        self.blocks.push(BlockData {
            name,
            ..Default::default()
        })
    }

    /// Create an instruction. It is not yet inserted in any block and has no
    /// result.
    pub fn make_inst(&mut self, opcode: Opcode, operands: Vec<Operand>) -> Inst {
        self.insts.push(InstData {
            opcode,
            operands,
            result: None.into(),
            block: None.into(),
            num: 0,
        })
    }

    /// The type of a value.
    pub fn value_type(&self, value: Value) -> Type {
        self.values[value].ty.clone()
    }

    /// True if the value is a constant, and if so its bits.
    pub fn value_const(&self, value: Value) -> Option<u64> {
        match self.values[value].def {
            ValueDef::Const(bits) => Some(bits),
            _ => None,
        }
    }

    /// The stack slot a value addresses, if it is a stack address.
    pub fn value_stack_addr(&self, value: Value) -> Option<StackSlot> {
        match self.values[value].def {
            ValueDef::StackAddr(slot) => Some(slot),
            _ => None,
        }
    }

    /// The defining instruction of an SSA value.
    pub fn value_def_inst(&self, value: Value) -> Option<Inst> {
        match self.values[value].def {
            ValueDef::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    /// Infer the result type of an instruction from its opcode and operands.
    /// `None` means the opcode produces nothing.
    pub fn infer_result_type(&self, opcode: Opcode, operands: &[Operand]) -> Option<Type> {
        match opcode.result_kind() {
            ResultKind::None => None,
            ResultKind::Bool => Some(Type::I8),
            ResultKind::Pointer => Some(Type::IPtr),
            ResultKind::TypeOperand => operands.iter().find_map(|op| op.as_type()).cloned(),
            ResultKind::FirstOperand => {
                let v = operands.iter().find_map(Operand::as_value)?;
                Some(self.value_type(v))
            }
            ResultKind::SecondOperand => {
                let v = operands.iter().filter_map(Operand::as_value).nth(1)?;
                Some(self.value_type(v))
            }
        }
    }

    /// Give `inst` a freshly created result value.
    pub fn attach_result(&mut self, inst: Inst, ty: Type, name: String) -> Value {
        debug_assert!(self.insts[inst].result.is_none());
        let value = self.make_value(ty, ValueDef::Inst(inst), name);
        self.insts[inst].result = value.into();
        value
    }

    /// The values read by an instruction, one entry per occurrence.
    pub fn value_operands(&self, inst: Inst) -> Vec<Value> {
        self.insts[inst]
            .operands
            .iter()
            .filter_map(Operand::as_value)
            .collect()
    }

    /// Record that `inst` reads `value`.
    pub fn add_use(&mut self, value: Value, inst: Inst) {
        if self.use_tracked(value) {
            self.values[value].uses.push(inst);
        }
    }

    /// Remove one use record of `value` by `inst`.
    pub fn remove_use(&mut self, value: Value, inst: Inst) {
        if !self.use_tracked(value) {
            return;
        }
        let uses = &mut self.values[value].uses;
        if let Some(pos) = uses.iter().position(|u| *u == inst) {
            uses.remove(pos);
        }
    }

    // Constants don't track uses; everything else does.
    fn use_tracked(&self, value: Value) -> bool {
        !matches!(self.values[value].def, ValueDef::Const(_))
    }

    /// Record use edges for every value operand of `inst`.
    pub fn attach_operands(&mut self, inst: Inst) {
        for value in self.value_operands(inst) {
            self.add_use(value, inst);
        }
    }

    /// Drop the use edges for every value operand of `inst`.
    pub fn detach_operands(&mut self, inst: Inst) {
        for value in self.value_operands(inst) {
            self.remove_use(value, inst);
        }
    }

    /// Replace operand `index` of `inst`, keeping use edges consistent.
    pub fn replace_operand(&mut self, inst: Inst, index: usize, operand: Operand) {
        if let Some(old) = self.insts[inst].operands[index].as_value() {
            self.remove_use(old, inst);
        }
        let new = operand.as_value();
        self.insts[inst].operands[index] = operand;
        if let Some(new) = new {
            self.add_use(new, inst);
        }
    }

    /// Remove operand `index` of `inst`, keeping use edges consistent.
    pub fn remove_operand(&mut self, inst: Inst, index: usize) {
        if let Some(old) = self.insts[inst].operands[index].as_value() {
            self.remove_use(old, inst);
        }
        self.insts[inst].operands.remove(index);
    }

    /// Insert an operand at `index` of `inst`, keeping use edges consistent.
    pub fn insert_operand(&mut self, inst: Inst, index: usize, operand: Operand) {
        let new = operand.as_value();
        self.insts[inst].operands.insert(index, operand);
        if let Some(new) = new {
            self.add_use(new, inst);
        }
    }

    /// Append an operand to `inst`, keeping use edges consistent.
    pub fn push_operand(&mut self, inst: Inst, operand: Operand) {
        let index = self.insts[inst].operands.len();
        self.insert_operand(inst, index, operand);
    }
}
