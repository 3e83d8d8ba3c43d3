//! Capstan IR entity references.
//!
//! Instructions in the IR need to reference other entities in the function:
//! values, other instructions, basic blocks, and stack slots. These references
//! are not Rust references, both because Rust's ownership rules make cyclic
//! structures painful and because 64-bit pointers waste space. Instead, each
//! entity is a struct wrapping a `u32` index into a table in the function's
//! data flow graph. There is a separate index type for each entity kind, so we
//! don't lose type safety.

use cranelift_entity::entity_impl;

/// An opaque reference to an SSA value.
///
/// Values are defined by constants, instruction results, function or block
/// parameters, or stack-slot addresses. While the order is stable, it is
/// arbitrary.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to an instruction in a function.
///
/// The same type covers plain instructions, operations with a result, and
/// terminators; the opcode decides which.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a basic block.
///
/// Blocks carry parameters instead of phi instructions; every incoming
/// terminator supplies one positional argument per parameter.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a stack slot.
///
/// Stack slots represent a named, sized region of the enclosing function's
/// frame. Their frame offsets are assigned late, during stack layout.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSlot(u32);
entity_impl!(StackSlot, "ss");

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn display() {
        assert_eq!(Value::new(0).to_string(), "v0");
        assert_eq!(Block::new(3).to_string(), "block3");
        assert_eq!(StackSlot::new(12).to_string(), "ss12");
    }
}
