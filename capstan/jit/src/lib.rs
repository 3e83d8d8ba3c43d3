//! A JIT runtime backed by capstan-codegen.
//!
//! The builder collects host symbols the generated code may reference; the
//! module places a finished compilation into executable memory near the
//! process, resolves the compiler's leftover external relocations, and hands
//! out function pointers by name.

mod memory;

use anyhow::{anyhow, bail, Result};
use hashbrown::HashMap;

use capstan_codegen::binemit::{Compilation, SymbolEntry};

pub use crate::memory::NearMemory;

/// Configuration for a [`JITModule`]: the host symbols callable from JIT
/// code.
#[derive(Default)]
pub struct JITBuilder {
    symbols: HashMap<String, *const u8>,
}

impl JITBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host symbol. Calls and lookups of `name` that the compiler
    /// could not resolve internally resolve to `ptr`.
    pub fn symbol(&mut self, name: impl Into<String>, ptr: *const u8) -> &mut Self {
        self.symbols.insert(name.into(), ptr);
        self
    }

    /// Place `compilation` into executable memory and resolve its external
    /// relocations.
    pub fn finish(self, compilation: Compilation) -> Result<JITModule> {
        JITModule::new(self, compilation)
    }
}

/// A finalized unit of JIT code: one read-execute mapping holding code and
/// statics, one read-write mapping for runtime data, and the symbol table.
pub struct JITModule {
    code: NearMemory,
    data: NearMemory,
    symbols: Vec<SymbolEntry>,
}

impl JITModule {
    fn new(builder: JITBuilder, compilation: Compilation) -> Result<Self> {
        let mut code = NearMemory::allocate(compilation.code.len())?;
        let data = NearMemory::allocate(1)?;
        code.as_mut_slice()[..compilation.code.len()].copy_from_slice(&compilation.code);

        // External relocations: the compiler resolved everything it could;
        // what is left points at host symbols registered on the builder.
        let base = code.as_ptr() as usize;
        for entry in &compilation.external_relocs {
            let target = *builder
                .symbols
                .get(&entry.name)
                .ok_or_else(|| anyhow!("undefined symbol `{}`", entry.name))?;
            let end = base + entry.offset as usize + entry.size as usize;
            let disp = (target as usize).wrapping_sub(end) as i64;
            let field =
                &mut code.as_mut_slice()[entry.offset as usize..][..entry.size as usize];
            match entry.size {
                4 => {
                    if i32::try_from(disp).is_err() {
                        bail!("symbol `{}` is out of signed-32 range", entry.name);
                    }
                    field.copy_from_slice(&(disp as i32).to_le_bytes());
                }
                1 => {
                    if i8::try_from(disp).is_err() {
                        bail!("symbol `{}` is out of signed-8 range", entry.name);
                    }
                    field.copy_from_slice(&(disp as i8).to_le_bytes());
                }
                other => bail!("unsupported relocation size {other}"),
            }
        }

        code.make_executable()?;
        Ok(Self {
            code,
            data,
            symbols: compilation.symbols,
        })
    }

    /// The entry point of the named function, or `None` if it was not
    /// compiled.
    pub fn lookup(&self, name: &str) -> Option<*const u8> {
        self.symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| unsafe { self.code.as_ptr().add(s.offset as usize) })
    }

    /// The symbol table of the compiled code.
    pub fn symbols(&self) -> &[SymbolEntry] {
        &self.symbols
    }

    /// Base of the read-write data mapping.
    pub fn data_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}
