//! Intermediate representation of a function.
//!
//! The `Function` struct owns all of its blocks, instructions, and values via
//! the data flow graph, plus the stack-slot table, the block layout order,
//! and the register assignments produced by allocation.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{PrimaryMap, SecondaryMap};

use crate::ir::dfg::{DataFlowGraph, ValueDef};
use crate::ir::types::{natural_align, Type};
use crate::ir::{Block, Opcode, StackSlot, Value};
use crate::isa::x64::regs::RegMask;

/// The flavor of a stack slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StackSlotKind {
    /// Declared in the source text.
    Explicit,
    /// Created by the register allocator or the inliner.
    Spill,
    /// An argument the caller passed on the stack; its offset is fixed above
    /// the frame pointer by the calling convention.
    IncomingArg,
}

/// Contents of a stack slot.
#[derive(Clone, Debug)]
pub struct StackSlotData {
    pub name: String,
    pub size: u32,
    pub align: u32,
    /// Displacement from RBP. For `IncomingArg` slots this is the positive
    /// caller-side offset; for everything else it is the positive distance
    /// below RBP, assigned during stack layout and meaningless before.
    pub offset: i32,
    pub kind: StackSlotKind,
    /// The `iptr` value holding this slot's address.
    pub addr: PackedOption<Value>,
}

/// Register assignment of a value.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum ValueLoc {
    #[default]
    Unassigned,
    /// An integer (0-15) or floating-point (16-31) register.
    Reg(u8),
}

impl ValueLoc {
    pub fn is_assigned(self) -> bool {
        self != Self::Unassigned
    }

    pub fn reg(self) -> Option<u8> {
        match self {
            Self::Reg(r) => Some(r),
            Self::Unassigned => None,
        }
    }
}

/// A function.
#[derive(Clone, Debug)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Declared return type; `Type::None` for procedures.
    pub return_type: Type,
    /// Parameter values, in declaration order.
    pub params: Vec<Value>,
    /// All stack slots ever created, including promoted and spilled ones.
    pub stack_slots: PrimaryMap<StackSlot, StackSlotData>,
    /// The live stack slots, in declaration order. mem2reg removes promoted
    /// slots from here; stack layout walks this list.
    pub active_slots: Vec<StackSlot>,
    /// Primary definition of all values, instructions, and blocks.
    pub dfg: DataFlowGraph,
    /// Blocks in emission order.
    pub layout: Vec<Block>,
    /// The designated entry block.
    pub entry: PackedOption<Block>,
    /// Register assigned to each value, filled in by register allocation.
    pub locations: SecondaryMap<Value, ValueLoc>,
    /// Registers the body writes; consumed by prologue emission.
    pub written_regs: RegMask,
    /// True once a `call`/`call_eval` is known to be present.
    pub performs_calls: bool,
    next_temp: u64,
}

impl Function {
    /// Create an empty function with the given name and return type.
    pub fn new(name: String, return_type: Type) -> Self {
        Self {
            name,
            return_type,
            params: Vec::new(),
            stack_slots: PrimaryMap::new(),
            active_slots: Vec::new(),
            dfg: DataFlowGraph::new(),
            layout: Vec::new(),
            entry: None.into(),
            locations: SecondaryMap::new(),
            written_regs: 0,
            performs_calls: false,
            next_temp: 0,
        }
    }

    /// Generate a fresh name for compiler-introduced entities. Unique within
    /// this function.
    pub fn temp_name(&mut self) -> String {
        self.next_temp += 1;
        format!("__tmp{}", self.next_temp)
    }

    /// Create a stack slot and its address value.
    pub fn create_stack_slot(&mut self, name: String, size: u32, kind: StackSlotKind) -> Value {
        let slot = self.stack_slots.push(StackSlotData {
            name: name.clone(),
            size,
            align: natural_align(size),
            offset: 0,
            kind,
            addr: None.into(),
        });
        let addr = self
            .dfg
            .make_value(Type::IPtr, ValueDef::StackAddr(slot), name);
        self.stack_slots[slot].addr = addr.into();
        self.active_slots.push(slot);
        addr
    }

    /// Find a block by its label.
    pub fn block_by_name(&self, name: &str) -> Option<Block> {
        self.layout
            .iter()
            .copied()
            .find(|b| self.dfg.blocks[*b].name == name)
    }

    /// The parameters of `block`: the function's own parameters when `block`
    /// is the entry block, the block's otherwise.
    pub fn block_params(&self, block: Block) -> &[Value] {
        if self.entry.expand() == Some(block) {
            &self.params
        } else {
            &self.dfg.blocks[block].params
        }
    }

    /// Number of instructions across all blocks in the layout.
    pub fn statement_count(&self) -> usize {
        self.layout
            .iter()
            .map(|b| self.dfg.blocks[*b].insts.len())
            .sum()
    }

    /// True if any instruction is a call. Used by the inliner and by the
    /// allocator's callee-saved preference.
    pub fn contains_calls(&self) -> bool {
        self.layout.iter().any(|b| {
            self.dfg.blocks[*b]
                .insts
                .iter()
                .any(|i| matches!(self.dfg.insts[*i].opcode, Opcode::Call | Opcode::CallEval))
        })
    }

    /// The terminator of a block, i.e. its final instruction.
    pub fn terminator(&self, block: Block) -> Option<crate::ir::Inst> {
        self.dfg.blocks[block].insts.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_slot_addresses() {
        let mut func = Function::new("f".to_string(), Type::None);
        let addr = func.create_stack_slot("x".to_string(), 12, StackSlotKind::Explicit);
        assert_eq!(func.dfg.value_type(addr), Type::IPtr);
        let slot = func.dfg.value_stack_addr(addr).unwrap();
        assert_eq!(func.stack_slots[slot].size, 12);
        assert_eq!(func.stack_slots[slot].align, 16);
        assert_eq!(func.stack_slots[slot].addr.expand(), Some(addr));
    }

    #[test]
    fn temp_names_are_unique() {
        let mut func = Function::new("f".to_string(), Type::None);
        let a = func.temp_name();
        let b = func.temp_name();
        assert_ne!(a, b);
    }
}
