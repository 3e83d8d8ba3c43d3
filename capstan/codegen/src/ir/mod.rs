//! Intermediate representation of the Capstan compiler.

mod entities;

pub mod dfg;
pub mod function;
pub mod instructions;
pub mod module;
pub mod types;

pub use self::dfg::{BlockData, DataFlowGraph, InstData, ValueData, ValueDef};
pub use self::entities::{Block, Inst, StackSlot, Value};
pub use self::function::{Function, StackSlotData, StackSlotKind, ValueLoc};
pub use self::instructions::{separator_index, Opcode, Operand, OperandClass, ResultKind};
pub use self::module::{Module, StaticData, StaticInit};
pub use self::types::{AggLayout, ByteClass, Type};
