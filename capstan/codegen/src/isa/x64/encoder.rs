//! Direct x86-64 instruction encoder.
//!
//! The encoder accepts typed operands (register, memory, immediate, each
//! carrying an access size) and writes bytes straight into a `CodeBuffer`.
//! Each mnemonic method dispatches on the operand shapes it was handed and
//! rejects combinations that have no encoding.
//!
//! Memory operands are base+displacement only (plus RIP-relative); the
//! compiler never needs scaled index addressing.

use crate::binemit::{CodeBuffer, CodeOffset};
use crate::error::{CodegenError, CodegenResult};
use crate::isa::x64::regs::{hw_enc, is_float_reg, Reg};

/// Base of a memory operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemBase {
    Reg(Reg),
    /// RIP-relative; the 4-byte displacement is usually patched later.
    Rip,
}

/// A memory operand: base plus signed displacement, with an access size.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MemArg {
    pub base: MemBase,
    pub disp: i32,
    pub size: u8,
}

impl MemArg {
    pub fn with_size(self, size: u8) -> Self {
        Self { size, ..self }
    }

    pub fn with_added_offset(self, add: i32) -> Self {
        Self {
            disp: self.disp + add,
            ..self
        }
    }
}

/// A typed encoder operand.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum EncOperand {
    /// A register (0-15 integer, 16-31 SSE) at an access size in bytes.
    Reg(Reg, u8),
    Mem(MemArg),
    /// An immediate with its logical size in bytes.
    Imm(i64, u8),
}

/// Shorthand constructors matching the shapes the lowering code works with.
pub fn reg(r: Reg, size: u8) -> EncOperand {
    EncOperand::Reg(r, size)
}

pub fn mem(base: Reg, disp: i32, size: u8) -> EncOperand {
    EncOperand::Mem(MemArg {
        base: MemBase::Reg(base),
        disp,
        size,
    })
}

pub fn rip(disp: i32, size: u8) -> EncOperand {
    EncOperand::Mem(MemArg {
        base: MemBase::Rip,
        disp,
        size,
    })
}

pub fn imm(value: i64, size: u8) -> EncOperand {
    EncOperand::Imm(value, size)
}

/// A condition code, numbered with its hardware encoding.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    /// The opposite condition.
    pub fn invert(self) -> Self {
        match self {
            Self::O => Self::No,
            Self::No => Self::O,
            Self::B => Self::Ae,
            Self::Ae => Self::B,
            Self::E => Self::Ne,
            Self::Ne => Self::E,
            Self::Be => Self::A,
            Self::A => Self::Be,
            Self::S => Self::Ns,
            Self::Ns => Self::S,
            Self::P => Self::Np,
            Self::Np => Self::P,
            Self::L => Self::Ge,
            Self::Ge => Self::L,
            Self::Le => Self::G,
            Self::G => Self::Le,
        }
    }
}

fn err(what: &str, ops: &[&EncOperand]) -> CodegenError {
    CodegenError::Unencodable(format!("{what} {ops:?}"))
}

/// The encoder proper. Borrows the output buffer for the duration of a
/// function's emission.
pub struct Asm<'a> {
    pub buf: &'a mut CodeBuffer,
}

impl<'a> Asm<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn offset(&self) -> CodeOffset {
        self.buf.offset()
    }

    // ---- core encoding ----------------------------------------------------

    /// Emit prefixes, opcode, ModRM (+SIB/displacement) and an optional
    /// trailing immediate.
    ///
    /// `reg_field` is the hardware number going into ModRM.reg; `rm` must be
    /// a register or memory operand. `mandatory` is an SSE prefix (F2/F3) or
    /// the 16-bit override, emitted before REX. `byte_regs` forces a REX
    /// prefix so that SPL/BPL/SIL/DIL encode instead of AH/CH/DH/BH.
    fn modrm(
        &mut self,
        mandatory: Option<u8>,
        rex_w: bool,
        opcode: &[u8],
        reg_field: u8,
        rm: &EncOperand,
        imm: Option<(i64, u8)>,
        byte_regs: bool,
    ) -> CodegenResult<()> {
        if let Some(p) = mandatory {
            self.buf.put1(p);
        }

        let (rm_hw, base_is_mem) = match rm {
            EncOperand::Reg(r, _) => (hw_enc(*r), false),
            EncOperand::Mem(m) => match m.base {
                MemBase::Reg(b) => (hw_enc(b), true),
                MemBase::Rip => (5, true),
            },
            EncOperand::Imm(..) => return Err(err("modrm with immediate r/m", &[rm])),
        };

        let rex_r = reg_field >> 3;
        let rex_b = match rm {
            EncOperand::Mem(MemArg {
                base: MemBase::Rip, ..
            }) => 0,
            _ => rm_hw >> 3,
        };
        let mut need_rex = rex_w || rex_r != 0 || rex_b != 0;
        if byte_regs {
            // Low byte of RSP/RBP/RSI/RDI is only addressable with a REX.
            let touches_high = (4..8).contains(&reg_field)
                || (!base_is_mem && (4..8).contains(&rm_hw));
            need_rex |= touches_high;
        }
        if need_rex {
            self.buf
                .put1(0x40 | ((rex_w as u8) << 3) | (rex_r & 1) << 2 | (rex_b & 1));
        }

        self.buf.put_bytes(opcode);

        let reg_bits = (reg_field & 7) << 3;
        match rm {
            EncOperand::Reg(..) => {
                self.buf.put1(0xc0 | reg_bits | (rm_hw & 7));
            }
            EncOperand::Mem(m) => match m.base {
                MemBase::Rip => {
                    self.buf.put1(reg_bits | 5);
                    self.buf.put4(m.disp as u32);
                }
                MemBase::Reg(_) => {
                    let low = rm_hw & 7;
                    let needs_sib = low == 4;
                    // RBP/R13 cannot take the no-displacement form.
                    let mode = if m.disp == 0 && low != 5 {
                        0u8
                    } else if (-128..=127).contains(&m.disp) {
                        1
                    } else {
                        2
                    };
                    self.buf.put1((mode << 6) | reg_bits | low);
                    if needs_sib {
                        self.buf.put1(0x24);
                    }
                    match mode {
                        1 => self.buf.put1(m.disp as i8 as u8),
                        2 => self.buf.put4(m.disp as u32),
                        _ => {}
                    }
                }
            },
            EncOperand::Imm(..) => unreachable!(),
        }

        if let Some((value, size)) = imm {
            match size {
                1 => self.buf.put1(value as i8 as u8),
                2 => self.buf.put2(value as i16 as u16),
                4 => self.buf.put4(value as i32 as u32),
                8 => self.buf.put8(value as u64),
                _ => return Err(CodegenError::Unencodable(format!("{size}-byte immediate"))),
            }
        }
        Ok(())
    }

    fn gpr(op: &EncOperand) -> CodegenResult<(Reg, u8)> {
        match op {
            EncOperand::Reg(r, size) if !is_float_reg(*r) => Ok((*r, *size)),
            _ => Err(err("expected general register", &[op])),
        }
    }

    fn xmm(op: &EncOperand) -> CodegenResult<Reg> {
        match op {
            EncOperand::Reg(r, _) if is_float_reg(*r) => Ok(*r),
            _ => Err(err("expected SSE register", &[op])),
        }
    }

    /// Sign-extendable-to-32 check for 64-bit immediate forms.
    fn imm32(value: i64) -> bool {
        i32::try_from(value).is_ok()
    }

    fn opsize_prefix(size: u8) -> Option<u8> {
        if size == 2 {
            Some(0x66)
        } else {
            None
        }
    }

    // ---- data movement ----------------------------------------------------

    /// Integer `mov` in all its reg/mem/imm shapes.
    pub fn mov(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        match (&dst, &src) {
            (EncOperand::Reg(d, size), EncOperand::Reg(..)) if !is_float_reg(*d) => {
                let (s, _) = Self::gpr(&src)?;
                let opc: &[u8] = if *size == 1 { &[0x8a] } else { &[0x8b] };
                self.modrm(
                    Self::opsize_prefix(*size),
                    *size == 8,
                    opc,
                    hw_enc(*d),
                    &EncOperand::Reg(s, *size),
                    None,
                    *size == 1,
                )
            }
            (EncOperand::Reg(d, size), EncOperand::Mem(_)) if !is_float_reg(*d) => {
                let opc: &[u8] = if *size == 1 { &[0x8a] } else { &[0x8b] };
                self.modrm(
                    Self::opsize_prefix(*size),
                    *size == 8,
                    opc,
                    hw_enc(*d),
                    &src,
                    None,
                    *size == 1,
                )
            }
            (EncOperand::Mem(m), EncOperand::Reg(s, _)) if !is_float_reg(*s) => {
                let size = m.size;
                let opc: &[u8] = if size == 1 { &[0x88] } else { &[0x89] };
                self.modrm(
                    Self::opsize_prefix(size),
                    size == 8,
                    opc,
                    hw_enc(*s),
                    &dst,
                    None,
                    size == 1,
                )
            }
            (EncOperand::Reg(d, size), EncOperand::Imm(value, _)) if !is_float_reg(*d) => {
                match *size {
                    8 if !Self::imm32(*value) => {
                        // movabs
                        self.buf.put1(0x48 | (hw_enc(*d) >> 3));
                        self.buf.put1(0xb8 | (hw_enc(*d) & 7));
                        self.buf.put8(*value as u64);
                        Ok(())
                    }
                    8 => self.modrm(None, true, &[0xc7], 0, &dst, Some((*value, 4)), false),
                    size @ (4 | 2 | 1) => {
                        if size == 2 {
                            self.buf.put1(0x66);
                        }
                        let hw = hw_enc(*d);
                        let force = size == 1 && (4..8).contains(&hw);
                        if hw >= 8 || force {
                            self.buf.put1(0x40 | (hw >> 3));
                        }
                        let base = if size == 1 { 0xb0 } else { 0xb8 };
                        self.buf.put1(base | (hw & 7));
                        match size {
                            1 => self.buf.put1(*value as i8 as u8),
                            2 => self.buf.put2(*value as i16 as u16),
                            _ => self.buf.put4(*value as i32 as u32),
                        }
                        Ok(())
                    }
                    _ => Err(err("mov", &[&dst, &src])),
                }
            }
            (EncOperand::Mem(m), EncOperand::Imm(value, _)) => {
                let size = m.size;
                if size == 8 && !Self::imm32(*value) {
                    return Err(err("mov m64 with non-sext imm", &[&dst, &src]));
                }
                let opc: &[u8] = if size == 1 { &[0xc6] } else { &[0xc7] };
                let imm_size = if size == 8 { 4 } else { size };
                self.modrm(
                    Self::opsize_prefix(size),
                    size == 8,
                    opc,
                    0,
                    &dst,
                    Some((*value, imm_size)),
                    false,
                )
            }
            _ => Err(err("mov", &[&dst, &src])),
        }
    }

    /// `lea dst, [mem]`.
    pub fn lea(&mut self, dst: EncOperand, addr: EncOperand) -> CodegenResult<()> {
        let (d, size) = Self::gpr(&dst)?;
        if !matches!(addr, EncOperand::Mem(_)) || size < 2 {
            return Err(err("lea", &[&dst, &addr]));
        }
        self.modrm(
            Self::opsize_prefix(size),
            size == 8,
            &[0x8d],
            hw_enc(d),
            &addr,
            None,
            false,
        )
    }

    /// Zero-extending move from an 8- or 16-bit source.
    pub fn movzx(&mut self, dst: EncOperand, src: EncOperand, from: u8) -> CodegenResult<()> {
        let (d, size) = Self::gpr(&dst)?;
        let opc: &[u8] = match from {
            1 => &[0x0f, 0xb6],
            2 => &[0x0f, 0xb7],
            _ => return Err(err("movzx", &[&dst, &src])),
        };
        self.modrm(None, size == 8, opc, hw_enc(d), &src, None, from == 1)
    }

    /// Sign-extending move from an 8-, 16-, or 32-bit source.
    pub fn movsx(&mut self, dst: EncOperand, src: EncOperand, from: u8) -> CodegenResult<()> {
        let (d, size) = Self::gpr(&dst)?;
        let opc: &[u8] = match from {
            1 => &[0x0f, 0xbe],
            2 => &[0x0f, 0xbf],
            4 => &[0x63],
            _ => return Err(err("movsx", &[&dst, &src])),
        };
        self.modrm(None, size == 8, opc, hw_enc(d), &src, None, from == 1)
    }

    pub fn push(&mut self, r: Reg) {
        if hw_enc(r) >= 8 {
            self.buf.put1(0x41);
        }
        self.buf.put1(0x50 | (hw_enc(r) & 7));
    }

    pub fn pop(&mut self, r: Reg) {
        if hw_enc(r) >= 8 {
            self.buf.put1(0x41);
        }
        self.buf.put1(0x58 | (hw_enc(r) & 7));
    }

    // ---- integer ALU ------------------------------------------------------

    fn alu(
        &mut self,
        base_opc: u8,
        ext: u8,
        dst: EncOperand,
        src: EncOperand,
    ) -> CodegenResult<()> {
        match (&dst, &src) {
            (EncOperand::Reg(d, size), EncOperand::Reg(..) | EncOperand::Mem(_))
                if !is_float_reg(*d) =>
            {
                let opc = if *size == 1 { base_opc + 2 } else { base_opc + 3 };
                self.modrm(
                    Self::opsize_prefix(*size),
                    *size == 8,
                    &[opc],
                    hw_enc(*d),
                    &src,
                    None,
                    *size == 1,
                )
            }
            (EncOperand::Mem(m), EncOperand::Reg(s, _)) if !is_float_reg(*s) => {
                let size = m.size;
                let opc = if size == 1 { base_opc } else { base_opc + 1 };
                self.modrm(
                    Self::opsize_prefix(size),
                    size == 8,
                    &[opc],
                    hw_enc(*s),
                    &dst,
                    None,
                    size == 1,
                )
            }
            (EncOperand::Reg(_, size) | EncOperand::Mem(MemArg { size, .. }), EncOperand::Imm(value, _)) => {
                let size = *size;
                if size == 8 && !Self::imm32(*value) {
                    return Err(err("alu imm64", &[&dst, &src]));
                }
                if size == 1 {
                    self.modrm(None, false, &[0x80], ext, &dst, Some((*value, 1)), true)
                } else if i8::try_from(*value).is_ok() {
                    self.modrm(
                        Self::opsize_prefix(size),
                        size == 8,
                        &[0x83],
                        ext,
                        &dst,
                        Some((*value, 1)),
                        false,
                    )
                } else {
                    let imm_size = if size == 2 { 2 } else { 4 };
                    self.modrm(
                        Self::opsize_prefix(size),
                        size == 8,
                        &[0x81],
                        ext,
                        &dst,
                        Some((*value, imm_size)),
                        false,
                    )
                }
            }
            _ => Err(err("alu", &[&dst, &src])),
        }
    }

    pub fn add(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.alu(0x00, 0, d, s)
    }
    pub fn or(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.alu(0x08, 1, d, s)
    }
    pub fn and(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.alu(0x20, 4, d, s)
    }
    pub fn sub(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.alu(0x28, 5, d, s)
    }
    pub fn xor(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.alu(0x30, 6, d, s)
    }
    pub fn cmp(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.alu(0x38, 7, d, s)
    }

    pub fn test(&mut self, a: EncOperand, b: EncOperand) -> CodegenResult<()> {
        match (&a, &b) {
            (EncOperand::Reg(_, size) | EncOperand::Mem(MemArg { size, .. }), EncOperand::Reg(s, _))
                if !is_float_reg(*s) =>
            {
                let size = *size;
                let opc: &[u8] = if size == 1 { &[0x84] } else { &[0x85] };
                self.modrm(
                    Self::opsize_prefix(size),
                    size == 8,
                    opc,
                    hw_enc(*s),
                    &a,
                    None,
                    size == 1,
                )
            }
            (EncOperand::Reg(_, size) | EncOperand::Mem(MemArg { size, .. }), EncOperand::Imm(v, _)) => {
                let size = *size;
                if size == 8 && !Self::imm32(*v) {
                    return Err(err("test imm64", &[&a, &b]));
                }
                let opc: &[u8] = if size == 1 { &[0xf6] } else { &[0xf7] };
                let imm_size = if size == 8 { 4 } else { size };
                self.modrm(
                    Self::opsize_prefix(size),
                    size == 8,
                    opc,
                    0,
                    &a,
                    Some((*v, imm_size)),
                    size == 1,
                )
            }
            _ => Err(err("test", &[&a, &b])),
        }
    }

    /// Two-operand signed multiply. No 8-bit form exists.
    pub fn imul(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        let (d, size) = Self::gpr(&dst)?;
        if size == 1 {
            return Err(err("imul r8", &[&dst, &src]));
        }
        self.modrm(
            Self::opsize_prefix(size),
            size == 8,
            &[0x0f, 0xaf],
            hw_enc(d),
            &src,
            None,
            false,
        )
    }

    fn shift(&mut self, ext: u8, dst: EncOperand, amount: EncOperand) -> CodegenResult<()> {
        let size = match &dst {
            EncOperand::Reg(r, size) if !is_float_reg(*r) => *size,
            EncOperand::Mem(m) => m.size,
            _ => return Err(err("shift", &[&dst, &amount])),
        };
        match amount {
            EncOperand::Imm(value, _) => {
                let opc: &[u8] = if size == 1 { &[0xc0] } else { &[0xc1] };
                self.modrm(
                    Self::opsize_prefix(size),
                    size == 8,
                    opc,
                    ext,
                    &dst,
                    Some((value, 1)),
                    size == 1,
                )
            }
            // Count in CL.
            EncOperand::Reg(r, _) if hw_enc(r) == 1 && !is_float_reg(r) => {
                let opc: &[u8] = if size == 1 { &[0xd2] } else { &[0xd3] };
                self.modrm(Self::opsize_prefix(size), size == 8, opc, ext, &dst, None, size == 1)
            }
            _ => Err(err("shift count", &[&dst, &amount])),
        }
    }

    pub fn shl(&mut self, d: EncOperand, amount: EncOperand) -> CodegenResult<()> {
        self.shift(4, d, amount)
    }
    pub fn shr(&mut self, d: EncOperand, amount: EncOperand) -> CodegenResult<()> {
        self.shift(5, d, amount)
    }
    pub fn sar(&mut self, d: EncOperand, amount: EncOperand) -> CodegenResult<()> {
        self.shift(7, d, amount)
    }

    fn group3(&mut self, ext: u8, op: EncOperand) -> CodegenResult<()> {
        let size = match &op {
            EncOperand::Reg(r, size) if !is_float_reg(*r) => *size,
            EncOperand::Mem(m) => m.size,
            _ => return Err(err("group3", &[&op])),
        };
        let opc: &[u8] = if size == 1 { &[0xf6] } else { &[0xf7] };
        self.modrm(Self::opsize_prefix(size), size == 8, opc, ext, &op, None, size == 1)
    }

    pub fn not(&mut self, op: EncOperand) -> CodegenResult<()> {
        self.group3(2, op)
    }
    pub fn neg(&mut self, op: EncOperand) -> CodegenResult<()> {
        self.group3(3, op)
    }
    pub fn div(&mut self, op: EncOperand) -> CodegenResult<()> {
        self.group3(6, op)
    }
    pub fn idiv(&mut self, op: EncOperand) -> CodegenResult<()> {
        self.group3(7, op)
    }

    /// Sign-extend the accumulator into the data register (CWD/CDQ/CQO).
    pub fn sign_extend_acc(&mut self, size: u8) {
        match size {
            2 => {
                self.buf.put1(0x66);
                self.buf.put1(0x99);
            }
            8 => {
                self.buf.put1(0x48);
                self.buf.put1(0x99);
            }
            _ => self.buf.put1(0x99),
        }
    }

    /// CBW: sign-extend AL into AX.
    pub fn cbw(&mut self) {
        self.buf.put1(0x66);
        self.buf.put1(0x98);
    }

    /// `mov al, ah` — fetch an 8-bit division remainder. AH has no encoding
    /// once a REX prefix is involved, so this is a fixed byte pair.
    pub fn mov_al_ah(&mut self) {
        self.buf.put1(0x88);
        self.buf.put1(0xe0);
    }

    // ---- flags and branches ------------------------------------------------

    pub fn setcc(&mut self, cc: Cond, dst: EncOperand) -> CodegenResult<()> {
        self.modrm(None, false, &[0x0f, 0x90 + cc as u8], 0, &dst, None, true)
    }

    pub fn cmovcc(&mut self, cc: Cond, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        let (d, size) = Self::gpr(&dst)?;
        if size == 1 {
            return Err(err("cmov r8", &[&dst, &src]));
        }
        self.modrm(
            Self::opsize_prefix(size),
            size == 8,
            &[0x0f, 0x40 + cc as u8],
            hw_enc(d),
            &src,
            None,
            false,
        )
    }

    /// Conditional jump with a 4-byte displacement. Returns the offset of the
    /// displacement field for patching.
    pub fn jcc(&mut self, cc: Cond) -> CodeOffset {
        self.buf.put1(0x0f);
        self.buf.put1(0x80 + cc as u8);
        let at = self.buf.offset();
        self.buf.put4(0);
        at
    }

    /// Unconditional jump with a 4-byte displacement. Returns the offset of
    /// the displacement field.
    pub fn jmp(&mut self) -> CodeOffset {
        self.buf.put1(0xe9);
        let at = self.buf.offset();
        self.buf.put4(0);
        at
    }

    /// Direct near call with a 4-byte displacement. Returns the offset of
    /// the displacement field.
    pub fn call_rel32(&mut self) -> CodeOffset {
        self.buf.put1(0xe8);
        let at = self.buf.offset();
        self.buf.put4(0);
        at
    }

    /// Indirect call through a register or memory.
    pub fn call(&mut self, target: EncOperand) -> CodegenResult<()> {
        match &target {
            EncOperand::Reg(r, _) if !is_float_reg(*r) => {
                self.modrm(None, false, &[0xff], 2, &EncOperand::Reg(*r, 8), None, false)
            }
            EncOperand::Mem(_) => self.modrm(None, false, &[0xff], 2, &target, None, false),
            _ => Err(err("call", &[&target])),
        }
    }

    pub fn ret(&mut self) {
        self.buf.put1(0xc3);
    }

    pub fn leave(&mut self) {
        self.buf.put1(0xc9);
    }

    pub fn int3(&mut self) {
        self.buf.put1(0xcc);
    }

    pub fn nops(&mut self, count: usize) {
        for _ in 0..count {
            self.buf.put1(0x90);
        }
    }

    // ---- SSE ---------------------------------------------------------------

    fn sse(
        &mut self,
        prefix: Option<u8>,
        opcode: &[u8],
        x: Reg,
        rm: &EncOperand,
        rex_w: bool,
    ) -> CodegenResult<()> {
        self.modrm(prefix, rex_w, opcode, hw_enc(x), rm, None, false)
    }

    /// Register-to-register (or load) aligned move; also the canonical
    /// xmm-to-xmm copy.
    pub fn movaps(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        if let Ok(d) = Self::xmm(&dst) {
            return self.sse(None, &[0x0f, 0x28], d, &src, false);
        }
        let s = Self::xmm(&src)?;
        self.sse(None, &[0x0f, 0x29], s, &dst, false)
    }

    /// Scalar f64 load/store.
    pub fn movsd(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        if let Ok(d) = Self::xmm(&dst) {
            return self.sse(Some(0xf2), &[0x0f, 0x10], d, &src, false);
        }
        let s = Self::xmm(&src)?;
        self.sse(Some(0xf2), &[0x0f, 0x11], s, &dst, false)
    }

    /// Scalar f32 load/store.
    pub fn movss(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        if let Ok(d) = Self::xmm(&dst) {
            return self.sse(Some(0xf3), &[0x0f, 0x10], d, &src, false);
        }
        let s = Self::xmm(&src)?;
        self.sse(Some(0xf3), &[0x0f, 0x11], s, &dst, false)
    }

    /// 64-bit moves between SSE registers, memory, and integer registers.
    pub fn movq(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        match (&dst, &src) {
            (EncOperand::Reg(d, _), _) if is_float_reg(*d) => match &src {
                EncOperand::Reg(s, _) if is_float_reg(*s) => {
                    self.sse(Some(0xf3), &[0x0f, 0x7e], *d, &src, false)
                }
                EncOperand::Mem(_) => self.sse(Some(0xf3), &[0x0f, 0x7e], *d, &src, false),
                EncOperand::Reg(s, _) => {
                    self.sse(Some(0x66), &[0x0f, 0x6e], *d, &EncOperand::Reg(*s, 8), true)
                }
                _ => Err(err("movq", &[&dst, &src])),
            },
            (EncOperand::Mem(_), EncOperand::Reg(s, _)) if is_float_reg(*s) => {
                self.sse(Some(0x66), &[0x0f, 0xd6], *s, &dst, false)
            }
            (EncOperand::Reg(d, _), EncOperand::Reg(s, _)) if is_float_reg(*s) => {
                self.sse(Some(0x66), &[0x0f, 0x7e], *s, &EncOperand::Reg(*d, 8), true)
            }
            _ => Err(err("movq", &[&dst, &src])),
        }
    }

    /// 32-bit moves between SSE registers, memory, and integer registers.
    pub fn movd(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        match (&dst, &src) {
            (EncOperand::Reg(d, _), _) if is_float_reg(*d) => {
                self.sse(Some(0x66), &[0x0f, 0x6e], *d, &src, false)
            }
            (_, EncOperand::Reg(s, _)) if is_float_reg(*s) => {
                self.sse(Some(0x66), &[0x0f, 0x7e], *s, &dst, false)
            }
            _ => Err(err("movd", &[&dst, &src])),
        }
    }

    fn sse_arith(&mut self, prefix: u8, opc: u8, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        let d = Self::xmm(&dst)?;
        self.sse(Some(prefix), &[0x0f, opc], d, &src, false)
    }

    pub fn addsd(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.sse_arith(0xf2, 0x58, d, s)
    }
    pub fn subsd(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.sse_arith(0xf2, 0x5c, d, s)
    }
    pub fn mulsd(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.sse_arith(0xf2, 0x59, d, s)
    }
    pub fn divsd(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.sse_arith(0xf2, 0x5e, d, s)
    }
    pub fn addss(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.sse_arith(0xf3, 0x58, d, s)
    }
    pub fn subss(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.sse_arith(0xf3, 0x5c, d, s)
    }
    pub fn mulss(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.sse_arith(0xf3, 0x59, d, s)
    }
    pub fn divss(&mut self, d: EncOperand, s: EncOperand) -> CodegenResult<()> {
        self.sse_arith(0xf3, 0x5e, d, s)
    }

    pub fn xorps(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        let d = Self::xmm(&dst)?;
        self.sse(None, &[0x0f, 0x57], d, &src, false)
    }

    pub fn ucomisd(&mut self, a: EncOperand, b: EncOperand) -> CodegenResult<()> {
        let x = Self::xmm(&a)?;
        self.sse(Some(0x66), &[0x0f, 0x2e], x, &b, false)
    }

    pub fn ucomiss(&mut self, a: EncOperand, b: EncOperand) -> CodegenResult<()> {
        let x = Self::xmm(&a)?;
        self.sse(None, &[0x0f, 0x2e], x, &b, false)
    }

    /// Signed integer to scalar double/single.
    pub fn cvtsi2sd(&mut self, dst: EncOperand, src: EncOperand, int_size: u8) -> CodegenResult<()> {
        let d = Self::xmm(&dst)?;
        self.sse(Some(0xf2), &[0x0f, 0x2a], d, &src, int_size == 8)
    }

    pub fn cvtsi2ss(&mut self, dst: EncOperand, src: EncOperand, int_size: u8) -> CodegenResult<()> {
        let d = Self::xmm(&dst)?;
        self.sse(Some(0xf3), &[0x0f, 0x2a], d, &src, int_size == 8)
    }

    /// Truncating scalar double/single to signed integer.
    pub fn cvttsd2si(&mut self, dst: EncOperand, src: EncOperand, int_size: u8) -> CodegenResult<()> {
        let (d, _) = Self::gpr(&dst)?;
        self.modrm(Some(0xf2), int_size == 8, &[0x0f, 0x2c], hw_enc(d), &src, None, false)
    }

    pub fn cvttss2si(&mut self, dst: EncOperand, src: EncOperand, int_size: u8) -> CodegenResult<()> {
        let (d, _) = Self::gpr(&dst)?;
        self.modrm(Some(0xf3), int_size == 8, &[0x0f, 0x2c], hw_enc(d), &src, None, false)
    }

    pub fn cvtss2sd(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        let d = Self::xmm(&dst)?;
        self.sse(Some(0xf3), &[0x0f, 0x5a], d, &src, false)
    }

    pub fn cvtsd2ss(&mut self, dst: EncOperand, src: EncOperand) -> CodegenResult<()> {
        let d = Self::xmm(&dst)?;
        self.sse(Some(0xf2), &[0x0f, 0x5a], d, &src, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x64::regs::*;

    fn emit(f: impl FnOnce(&mut Asm)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = Asm::new(&mut buf);
        f(&mut asm);
        buf.into_vec()
    }

    #[test]
    fn mov_forms() {
        assert_eq!(
            emit(|a| a.mov(reg(RAX, 8), reg(RBX, 8)).unwrap()),
            vec![0x48, 0x8b, 0xc3]
        );
        assert_eq!(
            emit(|a| a.mov(reg(RAX, 4), imm(5, 4)).unwrap()),
            vec![0xb8, 5, 0, 0, 0]
        );
        assert_eq!(
            emit(|a| a.mov(reg(RAX, 8), imm(5, 8)).unwrap()),
            vec![0x48, 0xc7, 0xc0, 5, 0, 0, 0]
        );
        assert_eq!(
            emit(|a| a.mov(reg(RAX, 8), imm(0x1_2345_6789, 8)).unwrap()),
            vec![0x48, 0xb8, 0x89, 0x67, 0x45, 0x23, 0x01, 0, 0, 0]
        );
        assert_eq!(
            emit(|a| a.mov(mem(RBP, -8, 8), reg(RAX, 8)).unwrap()),
            vec![0x48, 0x89, 0x45, 0xf8]
        );
        assert_eq!(
            emit(|a| a.mov(reg(RAX, 8), mem(RSP, 8, 8)).unwrap()),
            vec![0x48, 0x8b, 0x44, 0x24, 0x08]
        );
        assert_eq!(
            emit(|a| a.mov(reg(R9, 8), mem(R13, 0, 8)).unwrap()),
            vec![0x4d, 0x8b, 0x4d, 0x00]
        );
    }

    #[test]
    fn alu_forms() {
        assert_eq!(
            emit(|a| a.add(reg(RCX, 8), reg(RDX, 8)).unwrap()),
            vec![0x48, 0x03, 0xca]
        );
        assert_eq!(
            emit(|a| a.add(reg(RSP, 8), imm(16, 4)).unwrap()),
            vec![0x48, 0x83, 0xc4, 0x10]
        );
        assert_eq!(
            emit(|a| a.sub(reg(RSP, 8), imm(0x120, 4)).unwrap()),
            vec![0x48, 0x81, 0xec, 0x20, 0x01, 0, 0]
        );
        assert_eq!(
            emit(|a| a.cmp(reg(RAX, 8), imm(10, 4)).unwrap()),
            vec![0x48, 0x83, 0xf8, 0x0a]
        );
        assert_eq!(
            emit(|a| a.test(reg(RAX, 8), reg(RAX, 8)).unwrap()),
            vec![0x48, 0x85, 0xc0]
        );
        assert_eq!(
            emit(|a| a.xor(reg(RDX, 4), reg(RDX, 4)).unwrap()),
            vec![0x33, 0xd2]
        );
        assert_eq!(
            emit(|a| a.imul(reg(RAX, 8), reg(R8, 8)).unwrap()),
            vec![0x49, 0x0f, 0xaf, 0xc0]
        );
    }

    #[test]
    fn shifts_and_group3() {
        assert_eq!(
            emit(|a| a.shl(reg(RAX, 8), imm(3, 1)).unwrap()),
            vec![0x48, 0xc1, 0xe0, 0x03]
        );
        assert_eq!(
            emit(|a| a.shl(reg(RAX, 8), reg(RCX, 1)).unwrap()),
            vec![0x48, 0xd3, 0xe0]
        );
        assert_eq!(emit(|a| a.idiv(reg(R11, 8)).unwrap()), vec![0x49, 0xf7, 0xfb]);
        assert_eq!(emit(|a| a.neg(reg(RAX, 8)).unwrap()), vec![0x48, 0xf7, 0xd8]);
        assert_eq!(emit(|a| a.sign_extend_acc(8)), vec![0x48, 0x99]);
    }

    #[test]
    fn flags_and_branches() {
        assert_eq!(
            emit(|a| a.setcc(Cond::Ne, reg(RAX, 1)).unwrap()),
            vec![0x0f, 0x95, 0xc0]
        );
        // SIL needs a bare REX.
        assert_eq!(
            emit(|a| a.setcc(Cond::E, reg(RSI, 1)).unwrap()),
            vec![0x40, 0x0f, 0x94, 0xc6]
        );
        assert_eq!(
            emit(|a| a.cmovcc(Cond::Ne, reg(RAX, 8), reg(RBX, 8)).unwrap()),
            vec![0x48, 0x0f, 0x45, 0xc3]
        );
        assert_eq!(emit(|a| {
            a.jcc(Cond::Ne);
        }), vec![0x0f, 0x85, 0, 0, 0, 0]);
        assert_eq!(emit(|a| {
            a.jmp();
        }), vec![0xe9, 0, 0, 0, 0]);
        assert_eq!(
            emit(|a| a.call(reg(R11, 8)).unwrap()),
            vec![0x41, 0xff, 0xd3]
        );
        assert_eq!(Cond::E.invert(), Cond::Ne);
        assert_eq!(Cond::A.invert(), Cond::Be);
    }

    #[test]
    fn stack_ops() {
        assert_eq!(emit(|a| a.push(RBP)), vec![0x55]);
        assert_eq!(emit(|a| a.pop(R12)), vec![0x41, 0x5c]);
        assert_eq!(emit(|a| a.leave()), vec![0xc9]);
        assert_eq!(emit(|a| a.ret()), vec![0xc3]);
    }

    #[test]
    fn sse_forms() {
        assert_eq!(
            emit(|a| a.addsd(reg(XMM1, 8), reg(XMM2, 8)).unwrap()),
            vec![0xf2, 0x0f, 0x58, 0xca]
        );
        assert_eq!(
            emit(|a| a.movaps(reg(XMM0, 8), reg(XMM1, 8)).unwrap()),
            vec![0x0f, 0x28, 0xc1]
        );
        assert_eq!(
            emit(|a| a.xorps(reg(XMM0, 8), reg(XMM0, 8)).unwrap()),
            vec![0x0f, 0x57, 0xc0]
        );
        assert_eq!(
            emit(|a| a.movsd(reg(XMM0, 8), rip(0, 8)).unwrap()),
            vec![0xf2, 0x0f, 0x10, 0x05, 0, 0, 0, 0]
        );
        assert_eq!(
            emit(|a| a.cvtsi2sd(reg(XMM0, 8), reg(RAX, 8), 8).unwrap()),
            vec![0xf2, 0x48, 0x0f, 0x2a, 0xc0]
        );
        assert_eq!(
            emit(|a| a.movq(reg(XMM0, 8), reg(RAX, 8)).unwrap()),
            vec![0x66, 0x48, 0x0f, 0x6e, 0xc0]
        );
        assert_eq!(
            emit(|a| a.movq(reg(RAX, 8), reg(XMM0, 8)).unwrap()),
            vec![0x66, 0x48, 0x0f, 0x7e, 0xc0]
        );
        assert_eq!(
            emit(|a| a.movq(mem(RBP, -16, 8), reg(XMM3, 8)).unwrap()),
            vec![0x66, 0x0f, 0xd6, 0x5d, 0xf0]
        );
        assert_eq!(
            emit(|a| a.ucomisd(reg(XMM0, 8), reg(XMM1, 8)).unwrap()),
            vec![0x66, 0x0f, 0x2e, 0xc1]
        );
        assert_eq!(
            emit(|a| a.movd(reg(XMM0, 4), reg(RAX, 4)).unwrap()),
            vec![0x66, 0x0f, 0x6e, 0xc0]
        );
    }

    #[test]
    fn lea_and_ext() {
        assert_eq!(
            emit(|a| a.lea(reg(RAX, 8), mem(RBP, -16, 8)).unwrap()),
            vec![0x48, 0x8d, 0x45, 0xf0]
        );
        assert_eq!(
            emit(|a| a.movzx(reg(RAX, 4), reg(RAX, 1), 1).unwrap()),
            vec![0x0f, 0xb6, 0xc0]
        );
        assert_eq!(
            emit(|a| a.movzx(reg(RAX, 4), reg(R9, 1), 1).unwrap()),
            vec![0x41, 0x0f, 0xb6, 0xc1]
        );
        assert_eq!(
            emit(|a| a.movsx(reg(RAX, 8), reg(RAX, 4), 4).unwrap()),
            vec![0x48, 0x63, 0xc0]
        );
    }
}
