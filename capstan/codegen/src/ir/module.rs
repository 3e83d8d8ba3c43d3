//! A module: the collection of functions and static data making up one
//! compilation.

use crate::ir::function::Function;
use crate::ir::types::Type;

/// Initializer of a static data object.
#[derive(Clone, Debug)]
pub enum StaticInit {
    /// Up to eight bytes, stored inline.
    Word(u64),
    /// An arbitrary byte array.
    Bytes(Vec<u8>),
}

/// A named static data object. Statics are appended to the code buffer after
/// all functions and addressed RIP-relative.
#[derive(Clone, Debug)]
pub struct StaticData {
    pub name: String,
    pub ty: Type,
    pub init: StaticInit,
    /// Byte offset inside the emitted buffer; assigned during lowering.
    pub offset: Option<u32>,
}

/// A whole program: functions plus statics.
#[derive(Default, Debug)]
pub struct Module {
    pub functions: Vec<Function>,
    pub statics: Vec<StaticData>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the function with the given symbol name.
    pub fn find_function(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    /// Declare a named static with an inline word initializer.
    pub fn add_static_word(&mut self, name: String, ty: Type, bits: u64) {
        self.statics.push(StaticData {
            name,
            ty,
            init: StaticInit::Word(bits),
            offset: None,
        });
    }

    /// Intern an anonymous 8-byte static (float constants) and return its
    /// name. Identical bit patterns share one entry.
    pub fn intern_anon_static(&mut self, bits: u64) -> String {
        for stat in &self.statics {
            if stat.name.starts_with("__const") {
                if let StaticInit::Word(existing) = stat.init {
                    if existing == bits {
                        return stat.name.clone();
                    }
                }
            }
        }
        let name = format!("__const{}", self.statics.len());
        self.add_static_word(name.clone(), Type::I64, bits);
        name
    }

    pub fn find_static(&self, name: &str) -> Option<&StaticData> {
        self.statics.iter().find(|s| s.name == name)
    }
}
