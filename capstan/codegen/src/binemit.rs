//! Binary machine code emission: the byte sink, relocation records, and the
//! symbol table.

use crate::error::{CodegenError, CodegenResult};

/// Offset in bytes from the beginning of the emitted buffer.
pub type CodeOffset = u32;

/// A growable little-endian byte buffer the encoder writes into.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position.
    pub fn offset(&self) -> CodeOffset {
        self.bytes.len() as CodeOffset
    }

    pub fn put1(&mut self, b: u8) {
        self.bytes.push(b);
    }

    pub fn put2(&mut self, h: u16) {
        self.bytes.extend_from_slice(&h.to_le_bytes());
    }

    pub fn put4(&mut self, w: u32) {
        self.bytes.extend_from_slice(&w.to_le_bytes());
    }

    pub fn put8(&mut self, d: u64) {
        self.bytes.extend_from_slice(&d.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Overwrite 4 bytes at `offset`.
    pub fn patch4(&mut self, offset: CodeOffset, w: u32) {
        self.bytes[offset as usize..offset as usize + 4].copy_from_slice(&w.to_le_bytes());
    }

    /// Overwrite 1 byte at `offset`.
    pub fn patch1(&mut self, offset: CodeOffset, b: u8) {
        self.bytes[offset as usize] = b;
    }

    /// Pad with zero bytes until the position is `align`-aligned.
    pub fn align_zero(&mut self, align: u32) {
        while self.offset() % align != 0 {
            self.put1(0);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

/// A pending fixup of emitted bytes: when the named target's offset becomes
/// known, the signed displacement from the end of the field is written at
/// `offset`. Only 1- and 4-byte end-relative fields exist.
#[derive(Clone, Debug)]
pub struct RelocEntry {
    pub offset: CodeOffset,
    pub name: String,
    pub size: u8,
}

/// The three relocation classes, kept in separate tables because they resolve
/// at different times: labels after each function, statics and symbols after
/// all code.
#[derive(Default)]
pub struct RelocSink {
    pub labels: Vec<RelocEntry>,
    pub statics: Vec<RelocEntry>,
    pub symbols: Vec<RelocEntry>,
}

impl RelocSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reloc_label(&mut self, offset: CodeOffset, name: &str, size: u8) {
        self.labels.push(RelocEntry {
            offset,
            name: name.to_string(),
            size,
        });
    }

    pub fn reloc_static(&mut self, offset: CodeOffset, name: &str, size: u8) {
        self.statics.push(RelocEntry {
            offset,
            name: name.to_string(),
            size,
        });
    }

    pub fn reloc_symbol(&mut self, offset: CodeOffset, name: &str, size: u8) {
        self.symbols.push(RelocEntry {
            offset,
            name: name.to_string(),
            size,
        });
    }
}

/// What a symbol-table entry refers to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SymbolKind {
    Function,
}

/// One entry of the produced symbol table: a name and the byte offset of its
/// definition inside the code buffer.
#[derive(Clone, Debug)]
pub struct SymbolEntry {
    pub name: String,
    pub offset: CodeOffset,
    pub kind: SymbolKind,
}

/// The finished output of lowering a module: raw bytes (code followed by
/// aligned statics), the function symbol table, and the relocations that
/// could only be resolved against symbols outside the emitted buffer.
pub struct Compilation {
    pub code: Vec<u8>,
    pub symbols: Vec<SymbolEntry>,
    pub external_relocs: Vec<RelocEntry>,
}

impl Compilation {
    /// Offset of the named function inside the code buffer.
    pub fn symbol_offset(&self, name: &str) -> Option<CodeOffset> {
        self.symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.offset)
    }
}

/// Write one resolved relocation into the buffer, checking its signed range.
pub fn apply_reloc(buf: &mut CodeBuffer, entry: &RelocEntry, target: CodeOffset) -> CodegenResult<()> {
    let end = entry.offset as i64 + entry.size as i64;
    let disp = target as i64 - end;
    match entry.size {
        4 => {
            if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
                return Err(CodegenError::RelocOutOfRange {
                    name: entry.name.clone(),
                    disp,
                });
            }
            buf.patch4(entry.offset, disp as i32 as u32);
        }
        1 => {
            if disp < i8::MIN as i64 || disp > i8::MAX as i64 {
                return Err(CodegenError::RelocOutOfRange {
                    name: entry.name.clone(),
                    disp,
                });
            }
            buf.patch1(entry.offset, disp as i8 as u8);
        }
        size => {
            return Err(CodegenError::Unencodable(format!(
                "{size}-byte relocation against `{}`",
                entry.name
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patching() {
        let mut buf = CodeBuffer::new();
        buf.put4(0);
        buf.put4(0xdead_beef);
        buf.patch4(0, 0x0102_0304);
        assert_eq!(buf.as_slice()[..4], [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(buf.offset(), 8);
    }

    #[test]
    fn relocation_is_end_relative() {
        let mut buf = CodeBuffer::new();
        buf.put8(0);
        let entry = RelocEntry {
            offset: 2,
            name: "x".to_string(),
            size: 4,
        };
        // Target right after the field means a zero displacement.
        apply_reloc(&mut buf, &entry, 6).unwrap();
        assert_eq!(&buf.as_slice()[2..6], &[0, 0, 0, 0]);
        apply_reloc(&mut buf, &entry, 16).unwrap();
        assert_eq!(&buf.as_slice()[2..6], &[10, 0, 0, 0]);
    }
}
