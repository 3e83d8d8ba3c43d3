//! Lowering allocated IR to x86-64 machine code.
//!
//! Functions are emitted in module order, 16-byte aligned, each contributing
//! one symbol-table entry. Inside a function, blocks are emitted in layout
//! order with their start offsets recorded; label relocations resolve against
//! those offsets as soon as the function body ends. Statics are appended
//! after all code with their natural alignment, then static and symbol
//! relocations are resolved; whatever remains unresolved is handed to the
//! JIT layer.

use hashbrown::HashMap;

use crate::binemit::{apply_reloc, CodeBuffer, Compilation, RelocSink, SymbolEntry, SymbolKind};
use crate::error::{CodegenError, CodegenResult};
use crate::ir::types::natural_align;
use crate::ir::{
    separator_index, Function, Inst, Module, Opcode, Operand, StackSlotKind, StaticInit, Type,
    Value, ValueDef,
};
use crate::isa::x64::abi::{AbiState, ArgLoc, CallConv};
use crate::isa::x64::encoder::{imm, mem, reg, rip, Asm, Cond, EncOperand};
use crate::isa::x64::regs::{
    is_float_reg, Reg, R11, RAX, RBP, RCX, RDX, RSP, XMM0, XMM5,
};

/// Assign frame offsets to every live slot of `func` and return the total
/// slot area size, 16-byte aligned.
pub fn layout_stack_slots(func: &mut Function) -> u32 {
    let mut offset = 0u32;
    for slot in &func.active_slots {
        let data = &mut func.stack_slots[*slot];
        if data.kind == StackSlotKind::IncomingArg {
            continue;
        }
        offset += data.size;
        while offset % data.align != 0 {
            offset += 1;
        }
        data.offset = offset as i32;
    }
    (offset + 15) & !15
}

/// Emit every function of `module` followed by its statics, resolving label,
/// static, and symbol relocations. Unresolvable symbol relocations are
/// returned for external resolution.
pub fn emit_module(module: &mut Module, conv: CallConv) -> CodegenResult<Compilation> {
    let mut slot_sizes = Vec::with_capacity(module.functions.len());
    for func in &mut module.functions {
        slot_sizes.push(layout_stack_slots(func));
    }

    let mut buf = CodeBuffer::new();
    let mut relocs = RelocSink::new();
    let mut symbols: Vec<SymbolEntry> = Vec::new();

    let functions = core::mem::take(&mut module.functions);
    for (func, slots_size) in functions.iter().zip(&slot_sizes) {
        emit_function(func, *slots_size, module, conv, &mut buf, &mut relocs, &mut symbols)?;
    }
    module.functions = functions;

    // Statics go after the code, each at its natural alignment.
    for stat in &mut module.statics {
        let (align, bytes): (u32, Vec<u8>) = match &stat.init {
            StaticInit::Word(bits) => (
                natural_align(stat.ty.bytes()),
                bits.to_le_bytes()[..stat.ty.bytes() as usize].to_vec(),
            ),
            StaticInit::Bytes(b) => (natural_align(b.len() as u32), b.clone()),
        };
        buf.align_zero(align.max(1));
        stat.offset = Some(buf.offset());
        log::debug!("static {} at {:#x}", stat.name, buf.offset());
        buf.put_bytes(&bytes);
    }

    for entry in &relocs.statics {
        let target = module
            .find_static(&entry.name)
            .and_then(|s| s.offset)
            .ok_or_else(|| CodegenError::InvalidIr(format!("unknown static `{}`", entry.name)))?;
        apply_reloc(&mut buf, entry, target)?;
    }

    let mut external = Vec::new();
    for entry in &relocs.symbols {
        if let Some(sym) = symbols.iter().find(|s| s.name == entry.name) {
            apply_reloc(&mut buf, entry, sym.offset)?;
        } else if let Some(target) = module.find_static(&entry.name).and_then(|s| s.offset) {
            apply_reloc(&mut buf, entry, target)?;
        } else {
            external.push(entry.clone());
        }
    }

    Ok(Compilation {
        code: buf.into_vec(),
        symbols,
        external_relocs: external,
    })
}

fn emit_function(
    func: &Function,
    slots_size: u32,
    module: &mut Module,
    conv: CallConv,
    buf: &mut CodeBuffer,
    relocs: &mut RelocSink,
    symbols: &mut Vec<SymbolEntry>,
) -> CodegenResult<()> {
    while buf.offset() % 16 != 0 {
        Asm::new(buf).nops(1);
    }
    symbols.push(SymbolEntry {
        name: func.name.clone(),
        offset: buf.offset(),
        kind: SymbolKind::Function,
    });
    log::debug!("emitting {} at {:#x}", func.name, buf.offset());

    // Callee-saved registers the body writes get saved below the slot area.
    let saved: Vec<Reg> = (0..32u8)
        .filter(|r| {
            func.written_regs & (1 << r) != 0
                && conv.is_callee_saved(*r)
                && *r != RBP
                && *r != RSP
        })
        .collect();
    let mut frame = slots_size + 8 * saved.len() as u32;
    frame = (frame + 15) & !15;

    let label_start = relocs.labels.len();
    let mut emitter = FuncEmitter {
        func,
        module,
        conv,
        buf,
        relocs,
        saved,
        frame,
    };
    emitter.prologue()?;

    let mut block_offsets: HashMap<String, u32> = HashMap::new();
    for (b, block) in func.layout.iter().enumerate() {
        block_offsets.insert(func.dfg.blocks[*block].name.clone(), emitter.buf.offset());
        let next_block_name = func
            .layout
            .get(b + 1)
            .map(|nb| func.dfg.blocks[*nb].name.clone());
        let insts = &func.dfg.blocks[*block].insts;
        for (k, inst) in insts.iter().enumerate() {
            let prev = k.checked_sub(1).map(|p| insts[p]);
            let next = insts.get(k + 1).copied();
            emitter.statement(*inst, prev, next, next_block_name.as_deref())?;
        }
    }

    // Labels resolve immediately: all of this function's block offsets are
    // now known.
    for entry in emitter.relocs.labels.split_off(label_start) {
        let target = *block_offsets
            .get(&entry.name)
            .ok_or_else(|| CodegenError::InvalidIr(format!("unknown label `{}`", entry.name)))?;
        apply_reloc(emitter.buf, &entry, target)?;
    }
    Ok(())
}

struct FuncEmitter<'a> {
    func: &'a Function,
    module: &'a mut Module,
    conv: CallConv,
    buf: &'a mut CodeBuffer,
    relocs: &'a mut RelocSink,
    saved: Vec<Reg>,
    frame: u32,
}

impl<'a> FuncEmitter<'a> {
    fn asm(&mut self) -> Asm<'_> {
        Asm::new(self.buf)
    }

    fn prologue(&mut self) -> CodegenResult<()> {
        let mut asm = Asm::new(self.buf);
        asm.push(RBP);
        asm.mov(reg(RBP, 8), reg(RSP, 8))?;
        if self.frame > 0 {
            asm.sub(reg(RSP, 8), imm(self.frame as i64, 4))?;
            for (n, r) in self.saved.clone().into_iter().enumerate() {
                let slot = mem(RSP, (n as i32) * 8, 8);
                if is_float_reg(r) {
                    Asm::new(self.buf).movq(slot, reg(r, 8))?;
                } else {
                    Asm::new(self.buf).mov(slot, reg(r, 8))?;
                }
            }
        }

        // A parameter evicted out of its ABI register still arrives in it;
        // shuffle incoming registers into the final assignments.
        let mut abi = AbiState::new(self.conv);
        let mut moves: Vec<(Reg, Reg)> = Vec::new();
        for param in &self.func.params {
            let ty = self.func.dfg.value_type(*param);
            let loc = abi.next_arg(ty.is_float());
            let (ArgLoc::Reg(incoming), Some(assigned)) =
                (loc, self.func.locations[*param].reg())
            else {
                continue;
            };
            if incoming != assigned {
                moves.push((incoming, assigned));
            }
        }
        self.parallel_moves(&moves)
    }

    // ---- operand helpers ---------------------------------------------------

    fn loc(&self, value: Value) -> CodegenResult<Reg> {
        self.func.locations[value].reg().ok_or_else(|| {
            CodegenError::InvalidIr(format!(
                "value {} has no register",
                self.func.dfg.values[value].name
            ))
        })
    }

    /// The slot address as a frame-relative memory operand.
    fn slot_mem(&self, value: Value, size: u8) -> EncOperand {
        let slot = self
            .func
            .dfg
            .value_stack_addr(value)
            .expect("stack address");
        let data = &self.func.stack_slots[slot];
        let disp = match data.kind {
            StackSlotKind::IncomingArg => data.offset,
            _ => -data.offset,
        };
        mem(RBP, disp, size)
    }

    /// A plain value operand: immediate, or its register.
    fn value_op(&self, value: Value) -> CodegenResult<EncOperand> {
        let data = &self.func.dfg.values[value];
        match data.def {
            ValueDef::Const(bits) => Ok(imm(bits as i64, data.ty.bytes() as u8)),
            ValueDef::StackAddr(_) => Ok(self.slot_mem(value, data.ty.bytes() as u8)),
            _ => Ok(reg(self.loc(value)?, data.ty.bytes() as u8)),
        }
    }

    /// A value used as a pointer: a frame slot or `[reg]`.
    fn ptr_op(&self, value: Value, access_size: u8) -> CodegenResult<EncOperand> {
        match self.func.dfg.values[value].def {
            ValueDef::StackAddr(_) => Ok(self.slot_mem(value, access_size)),
            _ => Ok(mem(self.loc(value)?, 0, access_size)),
        }
    }

    fn operand_value(&self, inst: Inst, index: usize) -> CodegenResult<Value> {
        self.func.dfg.insts[inst].operands[index]
            .as_value()
            .ok_or_else(|| CodegenError::InvalidIr("expected a value operand".to_string()))
    }

    fn result_reg(&self, inst: Inst) -> CodegenResult<(Reg, Type)> {
        let result = self.func.dfg.insts[inst]
            .result
            .expand()
            .ok_or_else(|| CodegenError::InvalidIr("statement has no result".to_string()))?;
        Ok((self.loc(result)?, self.func.dfg.value_type(result)))
    }

    /// Materialize a constant into a register, interning float bit patterns
    /// as anonymous statics loaded RIP-relative.
    fn mov_const(&mut self, dst: Reg, bits: u64, ty: &Type) -> CodegenResult<()> {
        if is_float_reg(dst) {
            if bits == 0 {
                return self.asm().xorps(reg(dst, 8), reg(dst, 8));
            }
            let name = self.module.intern_anon_static(bits);
            self.asm().movsd(reg(dst, 8), rip(0x7fff_ffff, 8))?;
            let at = self.buf.offset() - 4;
            self.relocs.reloc_static(at, &name, 4);
            Ok(())
        } else {
            self.asm().mov(reg(dst, ty.bytes() as u8), imm(bits as i64, 8))
        }
    }

    // ---- the lowering table ------------------------------------------------

    fn statement(
        &mut self,
        inst: Inst,
        prev: Option<Inst>,
        next: Option<Inst>,
        next_block: Option<&str>,
    ) -> CodegenResult<()> {
        use Opcode::*;
        let opcode = self.func.dfg.insts[inst].opcode;
        match opcode {
            Return => self.emit_return(inst),
            Mov | Freeze | PtraliasBless | Ptralias | PtraliasMerge | PtraliasDisjoint => {
                self.emit_mov(inst)
            }
            Add | Sub | Mul | Imul | And | Or | Xor | Shl | Shr | ShrUnsafe | Sar | SarUnsafe
            | Fadd | Fsub | Fmul | Fdiv | Fxor => self.emit_binary(inst),
            Div | Idiv | Rem | Irem | DivUnsafe | IdivUnsafe | RemUnsafe | IremUnsafe => {
                self.emit_division(inst)
            }
            Store => self.emit_store(inst),
            Load => self.emit_load(inst),
            Goto => self.emit_goto(inst, next_block),
            If => self.emit_if(inst, prev, next_block),
            CmpEq | CmpNe | CmpG | CmpGe | CmpL | CmpLe | IcmpG | IcmpGe | IcmpL | IcmpLe
            | FcmpEq | FcmpNe | FcmpG | FcmpGe | FcmpL | FcmpLe => self.emit_compare(inst, next),
            Bool => self.emit_logical_test(inst),
            Not | Bnot | Neg => self.emit_unary(inst),
            Trim | Qext | Zext | Sext => self.emit_int_resize(inst),
            F32ToF64 | F64ToF32 => self.emit_float_resize(inst),
            UintToFloat | SintToFloat => self.emit_int_to_float(inst),
            FloatToSint | FloatToSintUnsafe | FloatToUint | FloatToUintUnsafe => {
                self.emit_float_to_int(inst)
            }
            Bitcast => self.emit_bitcast(inst),
            Ternary => self.emit_ternary(inst),
            SymbolLookup | SymbolLookupUnsized => self.emit_symbol_lookup(inst),
            Call | CallEval => self.emit_call(inst),
            Breakpoint => {
                self.asm().int3();
                Ok(())
            }
            Inject => Err(CodegenError::Unencodable("inject".to_string())),
            Frem => Err(CodegenError::Unencodable("frem".to_string())),
        }
    }

    fn emit_return(&mut self, inst: Inst) -> CodegenResult<()> {
        if let Some(value) = self.func.dfg.insts[inst].operands.first().and_then(Operand::as_value)
        {
            let ty = self.func.dfg.value_type(value);
            if ty.is_float() {
                match self.func.dfg.value_const(value) {
                    Some(bits) => self.mov_const(XMM0, bits, &ty)?,
                    None => {
                        let src = self.loc(value)?;
                        if src != XMM0 {
                            self.asm().movaps(reg(XMM0, 8), reg(src, 8))?;
                        }
                    }
                }
            } else {
                match self.func.dfg.value_const(value) {
                    Some(bits) => self.mov_const(RAX, bits, &ty)?,
                    None => {
                        let src = self.loc(value)?;
                        if src != RAX {
                            self.asm()
                                .mov(reg(RAX, ty.bytes() as u8), reg(src, ty.bytes() as u8))?;
                        }
                    }
                }
            }
        }
        for (n, r) in self.saved.clone().into_iter().enumerate() {
            let slot = mem(RSP, (n as i32) * 8, 8);
            if is_float_reg(r) {
                self.asm().movq(reg(r, 8), slot)?;
            } else {
                self.asm().mov(reg(r, 8), slot)?;
            }
        }
        let mut asm = Asm::new(self.buf);
        asm.leave();
        asm.ret();
        Ok(())
    }

    fn emit_mov(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, ty) = self.result_reg(inst)?;
        let src = self.operand_value(inst, 0)?;
        let src_data = &self.func.dfg.values[src];

        if matches!(src_data.def, ValueDef::StackAddr(_)) {
            let addr = self.slot_mem(src, 8);
            return self.asm().lea(reg(dst, 8), addr);
        }
        if let Some(bits) = self.func.dfg.value_const(src) {
            return self.mov_const(dst, bits, &ty);
        }
        let src_reg = self.loc(src)?;
        if src_reg == dst {
            return Ok(());
        }
        if is_float_reg(dst) {
            self.asm().movaps(reg(dst, 8), reg(src_reg, 8))
        } else {
            self.asm()
                .mov(reg(dst, ty.bytes() as u8), reg(src_reg, ty.bytes() as u8))
        }
    }

    fn emit_binary(&mut self, inst: Inst) -> CodegenResult<()> {
        use Opcode::*;
        let opcode = self.func.dfg.insts[inst].opcode;
        let (dst, ty) = self.result_reg(inst)?;
        let size = ty.bytes() as u8;
        let lhs = self.operand_value(inst, 0)?;
        let rhs = self.operand_value(inst, 1)?;
        let mut op1 = self.value_op(lhs)?;
        let mut op2 = self.value_op(rhs)?;
        let out = reg(dst, size);

        // Two-operand form: the destination doubles as the left input. If the
        // right input already sits in the destination, swap for commutative
        // ops and fall back to the scratch register otherwise.
        let op2_in_dst = matches!(op2, EncOperand::Reg(r, _) if r == dst);
        if op2_in_dst {
            if opcode.is_commutative() {
                core::mem::swap(&mut op1, &mut op2);
            } else {
                let scratch = if ty.is_float() { XMM5 } else { R11 };
                if ty.is_float() {
                    self.asm().movaps(reg(scratch, 8), op2)?;
                } else {
                    self.asm().mov(reg(scratch, size), op2)?;
                }
                op2 = reg(scratch, size);
            }
        }

        // Relocate the left input first: a variable shift count moves into
        // CL below, and the left input may itself live in RCX.
        if op1 != out {
            if ty.is_float() {
                self.asm().movaps(out, op1)?;
            } else {
                self.asm().mov(out, op1)?;
            }
        }

        // A variable shift count lives in CL. A count sitting in the
        // destination was already staged through the scratch register above,
        // so the move cannot read a clobbered register.
        let shift_via_cl = matches!(opcode, Shl | Shr | ShrUnsafe | Sar | SarUnsafe)
            && !matches!(op2, EncOperand::Imm(..));
        let count_in_rcx = matches!(op2, EncOperand::Reg(r, _) if r == RCX);
        if shift_via_cl && !count_in_rcx {
            self.asm().mov(reg(RCX, size), op2)?;
        }

        let mut asm = Asm::new(self.buf);
        match opcode {
            Add => asm.add(out, op2),
            Sub => asm.sub(out, op2),
            And => asm.and(out, op2),
            Or => asm.or(out, op2),
            Xor => asm.xor(out, op2),
            Mul | Imul => asm.imul(out, op2),
            Shl | Shr | ShrUnsafe | Sar | SarUnsafe => {
                let amount = if shift_via_cl { reg(RCX, 1) } else { op2 };
                match opcode {
                    Shl => asm.shl(out, amount),
                    Shr | ShrUnsafe => asm.shr(out, amount),
                    _ => asm.sar(out, amount),
                }
            }
            Fadd if ty == Type::F32 => asm.addss(out, op2),
            Fadd => asm.addsd(out, op2),
            Fsub if ty == Type::F32 => asm.subss(out, op2),
            Fsub => asm.subsd(out, op2),
            Fmul if ty == Type::F32 => asm.mulss(out, op2),
            Fmul => asm.mulsd(out, op2),
            Fdiv if ty == Type::F32 => asm.divss(out, op2),
            Fdiv => asm.divsd(out, op2),
            Fxor => asm.xorps(out, op2),
            _ => Err(CodegenError::Unencodable(opcode.name().to_string())),
        }
    }

    fn emit_division(&mut self, inst: Inst) -> CodegenResult<()> {
        use Opcode::*;
        let opcode = self.func.dfg.insts[inst].opcode;
        let (dst, ty) = self.result_reg(inst)?;
        let size = ty.bytes() as u8;
        let signed = matches!(opcode, Idiv | IdivUnsafe | Irem | IremUnsafe);
        let is_rem = matches!(opcode, Rem | RemUnsafe | Irem | IremUnsafe);
        let lhs = self.loc(self.operand_value(inst, 0)?)?;
        let mut rhs = self.loc(self.operand_value(inst, 1)?)?;

        // The divisor cannot live in RAX or RDX: both are implicit operands.
        if rhs == RAX || rhs == RDX {
            self.asm().mov(reg(R11, 8), reg(rhs, 8))?;
            rhs = R11;
        }
        if lhs != RAX {
            self.asm().mov(reg(RAX, size.max(4)), reg(lhs, size.max(4)))?;
        }

        // The hardware result register. The value itself may have been
        // steered elsewhere by a later eviction, so finish with a move when
        // the assignment differs.
        let hw_dst;
        if size == 1 {
            // 8-bit division divides AX; the remainder lands in AH.
            hw_dst = RAX;
            if signed {
                self.asm().cbw();
            } else {
                self.asm().movzx(reg(RAX, 4), reg(RAX, 1), 1)?;
            }
            if signed {
                self.asm().idiv(reg(rhs, 1))?;
            } else {
                self.asm().div(reg(rhs, 1))?;
            }
            if is_rem {
                self.asm().mov_al_ah();
            }
        } else {
            hw_dst = if is_rem { RDX } else { RAX };
            if signed {
                self.asm().sign_extend_acc(size);
            } else {
                self.asm().xor(reg(RDX, 4), reg(RDX, 4))?;
            }
            if signed {
                self.asm().idiv(reg(rhs, size))?;
            } else {
                self.asm().div(reg(rhs, size))?;
            }
        }
        if dst != hw_dst {
            self.asm().mov(reg(dst, size.max(4)), reg(hw_dst, size.max(4)))?;
        }
        Ok(())
    }

    fn emit_store(&mut self, inst: Inst) -> CodegenResult<()> {
        let ptr = self.operand_value(inst, 0)?;
        let value = self.operand_value(inst, 1)?;
        let ty = self.func.dfg.value_type(value);
        let size = ty.bytes() as u8;
        let dst = self.ptr_op(ptr, size)?;

        if let Some(bits) = self.func.dfg.value_const(value) {
            if size == 8 && i32::try_from(bits as i64).is_err() {
                // Split a non-sign-extendable 64-bit immediate into two
                // 32-bit stores.
                let EncOperand::Mem(m) = dst else {
                    return Err(CodegenError::Unencodable("store to non-memory".to_string()));
                };
                let lo = EncOperand::Mem(m.with_size(4));
                let hi = EncOperand::Mem(m.with_size(4).with_added_offset(4));
                self.asm().mov(lo, imm((bits & 0xffff_ffff) as i64, 4))?;
                self.asm().mov(hi, imm((bits >> 32) as i64, 4))?;
                return Ok(());
            }
            return self.asm().mov(dst, imm(bits as i64, size));
        }

        let src = self.loc(value)?;
        match ty {
            Type::F64 => self.asm().movq(dst, reg(src, 8)),
            Type::F32 => self.asm().movd(dst, reg(src, 4)),
            _ => self.asm().mov(dst, reg(src, size)),
        }
    }

    fn emit_load(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, ty) = self.result_reg(inst)?;
        let ptr = self.operand_value(inst, 1)?;
        let size = ty.bytes() as u8;
        let src = self.ptr_op(ptr, size)?;
        match ty {
            Type::F64 => self.asm().movq(reg(dst, 8), src),
            Type::F32 => self.asm().movd(reg(dst, 4), src),
            _ => self.asm().mov(reg(dst, size), src),
        }
    }

    // ---- control flow ------------------------------------------------------

    fn emit_goto(&mut self, inst: Inst, next_block: Option<&str>) -> CodegenResult<()> {
        let operands = self.func.dfg.insts[inst].operands.clone();
        let target = operands[0].as_text().expect("goto label").to_string();
        self.shuffle_to_block(&target, &operands[1..])?;
        if next_block != Some(target.as_str()) {
            let at = self.asm().jmp();
            self.relocs.reloc_label(at, &target, 4);
        }
        Ok(())
    }

    fn emit_if(
        &mut self,
        inst: Inst,
        prev: Option<Inst>,
        next_block: Option<&str>,
    ) -> CodegenResult<()> {
        let operands = self.func.dfg.insts[inst].operands.clone();
        let cond = operands[0].as_value().expect("if condition");
        let sep = separator_index(&operands).expect("if has an else arm");
        let then_target = operands[1].as_text().expect("then label").to_string();
        let else_target = operands[sep + 1].as_text().expect("else label").to_string();
        let then_args = &operands[2..sep];
        let else_args = &operands[sep + 2..];

        // Use the condition codes of an immediately preceding compare that
        // produced our condition; otherwise test the value.
        let fused = prev.and_then(|p| {
            let data = &self.func.dfg.insts[p];
            if data.opcode.is_compare() && data.result.expand() == Some(cond) {
                Some(compare_cond(data.opcode))
            } else {
                None
            }
        });
        let yang = match fused {
            Some(cc) => cc,
            None => {
                let c = self.value_op(cond)?;
                self.asm().test(c, c)?;
                Cond::Ne
            }
        };
        let yin = yang.invert();

        let then_shuffle = self.shuffle_needed(&then_target, then_args)?;
        let else_shuffle = self.shuffle_needed(&else_target, else_args)?;

        if then_shuffle && else_shuffle {
            let over = self.asm().jcc(yin);
            self.shuffle_to_block(&then_target, then_args)?;
            let at = self.asm().jmp();
            self.relocs.reloc_label(at, &then_target, 4);
            let resume = self.buf.offset();
            self.buf.patch4(over, resume.wrapping_sub(over + 4));
            self.shuffle_to_block(&else_target, else_args)?;
            if next_block != Some(else_target.as_str()) {
                let at = self.asm().jmp();
                self.relocs.reloc_label(at, &else_target, 4);
            }
        } else if else_shuffle {
            let at = self.asm().jcc(yang);
            self.relocs.reloc_label(at, &then_target, 4);
            self.shuffle_to_block(&else_target, else_args)?;
            if next_block != Some(else_target.as_str()) {
                let at = self.asm().jmp();
                self.relocs.reloc_label(at, &else_target, 4);
            }
        } else if then_shuffle {
            let at = self.asm().jcc(yin);
            self.relocs.reloc_label(at, &else_target, 4);
            self.shuffle_to_block(&then_target, then_args)?;
            if next_block != Some(then_target.as_str()) {
                let at = self.asm().jmp();
                self.relocs.reloc_label(at, &then_target, 4);
            }
        } else if next_block == Some(else_target.as_str()) {
            let at = self.asm().jcc(yang);
            self.relocs.reloc_label(at, &then_target, 4);
        } else if next_block == Some(then_target.as_str()) {
            let at = self.asm().jcc(yin);
            self.relocs.reloc_label(at, &else_target, 4);
        } else {
            let at = self.asm().jcc(yin);
            self.relocs.reloc_label(at, &else_target, 4);
            let at = self.asm().jmp();
            self.relocs.reloc_label(at, &then_target, 4);
        }
        Ok(())
    }

    fn emit_compare(&mut self, inst: Inst, next: Option<Inst>) -> CodegenResult<()> {
        let opcode = self.func.dfg.insts[inst].opcode;
        let lhs = self.operand_value(inst, 0)?;
        let rhs = self.operand_value(inst, 1)?;
        let a = self.value_op(lhs)?;
        let b = self.value_op(rhs)?;
        if opcode.is_float_compare() {
            if self.func.dfg.value_type(lhs) == Type::F32 {
                self.asm().ucomiss(a, b)?;
            } else {
                self.asm().ucomisd(a, b)?;
            }
        } else {
            self.asm().cmp(a, b)?;
        }

        // When the following `if` consumes the flags and nothing else reads
        // the boolean, skip materializing it.
        let result = self.func.dfg.insts[inst].result.expand().expect("compare result");
        let only_fused_use = next.is_some_and(|n| {
            let data = &self.func.dfg.insts[n];
            data.opcode == Opcode::If
                && data.operands.first().and_then(Operand::as_value) == Some(result)
                && self.func.dfg.values[result].uses.len() == 1
        });
        if !only_fused_use {
            let (dst, _) = self.result_reg(inst)?;
            self.asm().setcc(compare_cond(opcode), reg(dst, 1))?;
        }
        Ok(())
    }

    fn emit_logical_test(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, _) = self.result_reg(inst)?;
        let src = self.value_op(self.operand_value(inst, 0)?)?;
        self.asm().test(src, src)?;
        self.asm().setcc(Cond::Ne, reg(dst, 1))
    }

    fn emit_unary(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, ty) = self.result_reg(inst)?;
        let size = ty.bytes() as u8;
        let src = self.value_op(self.operand_value(inst, 0)?)?;
        let out = reg(dst, size);
        if src != out {
            self.asm().mov(out, src)?;
        }
        if matches!(
            self.func.dfg.insts[inst].opcode,
            Opcode::Not | Opcode::Bnot
        ) {
            self.asm().not(out)
        } else {
            self.asm().neg(out)
        }
    }

    fn emit_int_resize(&mut self, inst: Inst) -> CodegenResult<()> {
        use Opcode::*;
        let opcode = self.func.dfg.insts[inst].opcode;
        let (dst, ty) = self.result_reg(inst)?;
        let to = ty.bytes() as u8;
        let src_value = self.operand_value(inst, 1)?;
        let from = self.func.dfg.value_type(src_value).bytes() as u8;
        let src = self.loc(src_value)?;

        match opcode {
            Trim => {
                if src != dst {
                    self.asm().mov(reg(dst, to), reg(src, to))?;
                }
                Ok(())
            }
            Zext | Qext => match from {
                1 | 2 => self.asm().movzx(reg(dst, 4), reg(src, from), from),
                4 => self.asm().mov(reg(dst, 4), reg(src, 4)),
                _ => {
                    if src != dst {
                        self.asm().mov(reg(dst, 8), reg(src, 8))?;
                    }
                    Ok(())
                }
            },
            Sext => match from {
                1 | 2 => self.asm().movsx(reg(dst, to.max(4)), reg(src, from), from),
                4 if to == 8 => self.asm().movsx(reg(dst, 8), reg(src, 4), 4),
                _ => {
                    if src != dst {
                        self.asm().mov(reg(dst, to.max(4)), reg(src, to.max(4)))?;
                    }
                    Ok(())
                }
            },
            _ => unreachable!(),
        }
    }

    fn emit_float_resize(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, _) = self.result_reg(inst)?;
        let src = self.value_op(self.operand_value(inst, 0)?)?;
        if self.func.dfg.insts[inst].opcode == Opcode::F32ToF64 {
            self.asm().cvtss2sd(reg(dst, 8), src)
        } else {
            self.asm().cvtsd2ss(reg(dst, 8), src)
        }
    }

    fn emit_int_to_float(&mut self, inst: Inst) -> CodegenResult<()> {
        let opcode = self.func.dfg.insts[inst].opcode;
        let (dst, ty) = self.result_reg(inst)?;
        let src_value = self.operand_value(inst, 1)?;
        let from = self.func.dfg.value_type(src_value).bytes() as u8;
        let src = self.loc(src_value)?;
        let out = reg(dst, 8);
        let signed = opcode == Opcode::SintToFloat;

        // Widen sub-word sources through the scratch register; 32-bit
        // unsigned sources zero-extend into a 64-bit convert.
        let (conv_src, conv_size) = if signed {
            match from {
                1 | 2 => {
                    self.asm().movsx(reg(R11, 4), reg(src, from), from)?;
                    (R11, 4)
                }
                _ => (src, from),
            }
        } else {
            match from {
                1 | 2 => {
                    self.asm().movzx(reg(R11, 4), reg(src, from), from)?;
                    (R11, 4)
                }
                4 => {
                    self.asm().mov(reg(R11, 4), reg(src, 4))?;
                    (R11, 8)
                }
                _ => (src, 8),
            }
        };
        if ty == Type::F32 {
            self.asm().cvtsi2ss(out, reg(conv_src, conv_size), conv_size)
        } else {
            self.asm().cvtsi2sd(out, reg(conv_src, conv_size), conv_size)
        }
    }

    fn emit_float_to_int(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, _) = self.result_reg(inst)?;
        let src_value = self.operand_value(inst, 1)?;
        let src_ty = self.func.dfg.value_type(src_value);
        let src = self.value_op(src_value)?;
        // Convert through the 64-bit form; sub-word results truncate out of
        // it naturally.
        if src_ty == Type::F32 {
            self.asm().cvttss2si(reg(dst, 8), src, 8)
        } else {
            self.asm().cvttsd2si(reg(dst, 8), src, 8)
        }
    }

    fn emit_bitcast(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, ty) = self.result_reg(inst)?;
        let src_value = self.operand_value(inst, 1)?;
        let src_ty = self.func.dfg.value_type(src_value);
        let src = self.loc(src_value)?;
        match (ty.is_int_reg(), src_ty.is_int_reg()) {
            (true, true) => {
                if src != dst {
                    self.asm()
                        .mov(reg(dst, ty.bytes() as u8), reg(src, ty.bytes() as u8))?;
                }
                Ok(())
            }
            (false, false) => self.asm().movaps(reg(dst, 8), reg(src, 8)),
            _ if ty.bytes() == 4 => self.asm().movd(reg(dst, 4), reg(src, 4)),
            _ => self.asm().movq(reg(dst, 8), reg(src, 8)),
        }
    }

    fn emit_ternary(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, ty) = self.result_reg(inst)?;
        if !ty.is_int_reg() {
            return Err(CodegenError::Unsupported(
                "ternary on float values".to_string(),
            ));
        }
        let size = (ty.bytes() as u8).max(4);
        let cond = self.value_op(self.operand_value(inst, 0)?)?;
        let a = self.loc(self.operand_value(inst, 1)?)?;
        let b = self.loc(self.operand_value(inst, 2)?)?;
        self.asm().test(cond, cond)?;
        if dst == a {
            self.asm().cmovcc(Cond::E, reg(dst, size), reg(b, size))
        } else if dst == b {
            self.asm().cmovcc(Cond::Ne, reg(dst, size), reg(a, size))
        } else {
            self.asm().mov(reg(dst, size), reg(b, size))?;
            self.asm().cmovcc(Cond::Ne, reg(dst, size), reg(a, size))
        }
    }

    fn emit_symbol_lookup(&mut self, inst: Inst) -> CodegenResult<()> {
        let (dst, _) = self.result_reg(inst)?;
        let symbol = self.func.dfg.insts[inst].operands[0]
            .as_text()
            .expect("symbol name")
            .to_string();
        self.asm().lea(reg(dst, 8), rip(0x7fff_ffff, 8))?;
        let at = self.buf.offset() - 4;
        self.relocs.reloc_symbol(at, &symbol, 4);
        Ok(())
    }

    fn emit_call(&mut self, inst: Inst) -> CodegenResult<()> {
        let operands = self.func.dfg.insts[inst].operands.clone();
        let mut values = operands.iter().filter_map(Operand::as_value);
        let target = values
            .next()
            .ok_or_else(|| CodegenError::InvalidIr("call without a target".to_string()))?;
        let args: Vec<Value> = values.collect();

        // Argument shuffle into ABI registers.
        let mut abi = AbiState::new(self.conv);
        let mut moves: Vec<(Reg, Reg)> = Vec::new();
        let mut consts: Vec<(Reg, u64, Type)> = Vec::new();
        for arg in args {
            let ty = self.func.dfg.value_type(arg);
            let loc = abi.next_arg(ty.is_float());
            let ArgLoc::Reg(dst) = loc else {
                return Err(CodegenError::Unsupported(
                    "stack-passed call arguments".to_string(),
                ));
            };
            if let Some(bits) = self.func.dfg.value_const(arg) {
                consts.push((dst, bits, ty));
                continue;
            }
            let src = self.loc(arg)?;
            if src != dst {
                moves.push((src, dst));
            }
        }
        self.parallel_moves(&moves)?;
        for (dst, bits, ty) in consts {
            self.mov_const(dst, bits, &ty)?;
        }

        // A target that is a plain symbol lookup gets a direct near call;
        // anything else goes through its register.
        let direct = self
            .func
            .dfg
            .value_def_inst(target)
            .filter(|def| {
                matches!(
                    self.func.dfg.insts[*def].opcode,
                    Opcode::SymbolLookup | Opcode::SymbolLookupUnsized
                )
            })
            .and_then(|def| self.func.dfg.insts[def].operands[0].as_text())
            .map(str::to_string);

        if self.conv == CallConv::WindowsFastcall {
            // Shadow space the callee may scribble on.
            self.asm().sub(reg(RSP, 8), imm(32, 4))?;
        }
        match direct {
            Some(symbol) => {
                let at = self.asm().call_rel32();
                self.relocs.reloc_symbol(at, &symbol, 4);
            }
            None => {
                let t = self.loc(target)?;
                self.asm().call(reg(t, 8))?;
            }
        }
        if self.conv == CallConv::WindowsFastcall {
            self.asm().add(reg(RSP, 8), imm(32, 4))?;
        }

        if let Some(result) = self.func.dfg.insts[inst].result.expand() {
            let ty = self.func.dfg.value_type(result);
            let dst = self.loc(result)?;
            if ty.is_float() {
                if dst != XMM0 {
                    self.asm().movaps(reg(dst, 8), reg(XMM0, 8))?;
                }
            } else if dst != RAX {
                self.asm()
                    .mov(reg(dst, ty.bytes() as u8), reg(RAX, ty.bytes() as u8))?;
            }
        }
        Ok(())
    }

    // ---- block-argument shuffling ------------------------------------------

    fn target_params(&self, name: &str) -> CodegenResult<Vec<Value>> {
        let block = self
            .func
            .block_by_name(name)
            .ok_or_else(|| CodegenError::InvalidIr(format!("unknown block `{name}`")))?;
        Ok(self.func.block_params(block).to_vec())
    }

    fn shuffle_needed(&self, target: &str, args: &[Operand]) -> CodegenResult<bool> {
        let params = self.target_params(target)?;
        if params.len() != args.len() {
            return Err(CodegenError::InvalidIr(format!(
                "wrong number of arguments to block `{target}`"
            )));
        }
        for (param, arg) in params.iter().zip(args) {
            let value = arg.as_value().ok_or_else(|| {
                CodegenError::InvalidIr("branch argument is not a value".to_string())
            })?;
            if self.func.dfg.value_const(value).is_some() {
                return Ok(true);
            }
            if self.loc(value)? != self.loc(*param)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Place the branch arguments into the target block's parameter
    /// registers: a parallel permutation first, then constant
    /// materializations into registers no remaining move reads.
    fn shuffle_to_block(&mut self, target: &str, args: &[Operand]) -> CodegenResult<()> {
        let params = self.target_params(target)?;
        if params.len() != args.len() {
            return Err(CodegenError::InvalidIr(format!(
                "wrong number of arguments to block `{target}`"
            )));
        }
        let mut moves: Vec<(Reg, Reg)> = Vec::new();
        let mut consts: Vec<(Reg, u64, Type)> = Vec::new();
        for (param, arg) in params.iter().zip(args) {
            let value = arg.as_value().ok_or_else(|| {
                CodegenError::InvalidIr("branch argument is not a value".to_string())
            })?;
            let dst = self.loc(*param)?;
            if let Some(bits) = self.func.dfg.value_const(value) {
                consts.push((dst, bits, self.func.dfg.value_type(value)));
                continue;
            }
            let src = self.loc(value)?;
            if src != dst {
                moves.push((src, dst));
            }
        }
        self.parallel_moves(&moves)?;
        for (dst, bits, ty) in consts {
            self.mov_const(dst, bits, &ty)?;
        }
        Ok(())
    }

    /// Realize a register permutation "simultaneously": straight chains are
    /// plain moves, and each cycle is broken once through the class scratch
    /// register.
    fn parallel_moves(&mut self, moves: &[(Reg, Reg)]) -> CodegenResult<()> {
        let mut in2out = [-1i32; 32];
        let mut color = [0u8; 32];
        for (src, dst) in moves {
            debug_assert_ne!(src, dst);
            in2out[*src as usize] = *dst as i32;
        }
        for r in 0..32 {
            if in2out[r] >= 0 {
                self.shuffle_one(&mut in2out, &mut color, r)?;
            }
        }
        Ok(())
    }

    fn shuffle_one(
        &mut self,
        in2out: &mut [i32; 32],
        color: &mut [u8; 32],
        r: usize,
    ) -> CodegenResult<()> {
        let out = in2out[r] as usize;
        let scratch = |reg_ix: usize| if reg_ix >= XMM0 as usize { XMM5 } else { R11 };
        if in2out[out] < 0 {
            self.shuffle_mov(out as Reg, r as Reg)?;
            in2out[r] = -1;
        } else if color[out] != 0 {
            // Closed a cycle: park the destination in the scratch register;
            // it drains back at the cycle head.
            self.shuffle_mov(scratch(out), out as Reg)?;
            self.shuffle_mov(out as Reg, r as Reg)?;
            in2out[r] = -1;
            color[out] = 2;
        } else {
            color[r] = 1;
            self.shuffle_one(in2out, color, out)?;
            if color[r] == 2 {
                self.shuffle_mov(out as Reg, scratch(r))?;
            } else {
                self.shuffle_mov(out as Reg, r as Reg)?;
            }
            in2out[r] = -1;
        }
        Ok(())
    }

    fn shuffle_mov(&mut self, dst: Reg, src: Reg) -> CodegenResult<()> {
        if is_float_reg(src) || is_float_reg(dst) {
            self.asm().movaps(reg(dst, 8), reg(src, 8))
        } else {
            self.asm().mov(reg(dst, 8), reg(src, 8))
        }
    }
}

fn compare_cond(opcode: Opcode) -> Cond {
    use Opcode::*;
    match opcode {
        CmpEq | FcmpEq => Cond::E,
        CmpNe | FcmpNe => Cond::Ne,
        CmpG | FcmpG => Cond::A,
        CmpGe | FcmpGe => Cond::Ae,
        CmpL | FcmpL => Cond::B,
        CmpLe | FcmpLe => Cond::Be,
        IcmpG => Cond::G,
        IcmpGe => Cond::Ge,
        IcmpL => Cond::L,
        IcmpLe => Cond::Le,
        _ => unreachable!("not a comparison"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x64::regs::{RBX, RDI};

    fn shuffle_bytes(moves: &[(Reg, Reg)]) -> Vec<u8> {
        let mut module = Module::new();
        let func = Function::new("f".to_string(), Type::None);
        let mut buf = CodeBuffer::new();
        let mut relocs = RelocSink::new();
        let mut emitter = FuncEmitter {
            func: &func,
            module: &mut module,
            conv: CallConv::SystemV,
            buf: &mut buf,
            relocs: &mut relocs,
            saved: Vec::new(),
            frame: 0,
        };
        emitter.parallel_moves(moves).unwrap();
        buf.into_vec()
    }

    #[test]
    fn straight_chain_has_no_scratch() {
        // rax -> rbx while rbx -> rdi: rdi gets rbx first, then rbx gets rax.
        let bytes = shuffle_bytes(&[(RAX, RBX), (RBX, RDI)]);
        let mut expect = CodeBuffer::new();
        {
            let mut asm = Asm::new(&mut expect);
            asm.mov(reg(RDI, 8), reg(RBX, 8)).unwrap();
            asm.mov(reg(RBX, 8), reg(RAX, 8)).unwrap();
        }
        assert_eq!(bytes, expect.into_vec());
    }

    #[test]
    fn two_cycle_uses_one_scratch_save() {
        let bytes = shuffle_bytes(&[(RAX, RBX), (RBX, RAX)]);
        let mut expect = CodeBuffer::new();
        {
            let mut asm = Asm::new(&mut expect);
            asm.mov(reg(R11, 8), reg(RBX, 8)).unwrap();
            asm.mov(reg(RBX, 8), reg(RAX, 8)).unwrap();
            asm.mov(reg(RAX, 8), reg(R11, 8)).unwrap();
        }
        assert_eq!(bytes, expect.into_vec());
    }

    #[test]
    fn three_cycle_uses_one_scratch_save() {
        // rax -> rbx -> rdi -> rax.
        let bytes = shuffle_bytes(&[(RAX, RBX), (RBX, RDI), (RDI, RAX)]);
        let mut expect = CodeBuffer::new();
        {
            let mut asm = Asm::new(&mut expect);
            asm.mov(reg(R11, 8), reg(RBX, 8)).unwrap();
            asm.mov(reg(RBX, 8), reg(RAX, 8)).unwrap();
            asm.mov(reg(RDI, 8), reg(R11, 8)).unwrap();
            asm.mov(reg(RAX, 8), reg(RDI, 8)).unwrap();
        }
        // One save into the scratch register, four moves total.
        let scratch_saves = bytes
            .windows(3)
            .filter(|w| *w == [0x4c, 0x8b, 0xdb] || *w == [0x4c, 0x8b, 0xd8])
            .count();
        assert_eq!(scratch_saves, 1);
        assert_eq!(bytes.len(), expect.into_vec().len());
    }

    #[test]
    fn fallthrough_suppresses_jump() {
        let mut module = Module::new();
        let mut func = Function::new("f".to_string(), Type::None);
        let entry = func.dfg.make_block("__entry__".to_string());
        let next = func.dfg.make_block("next".to_string());
        func.layout.extend([entry, next]);
        func.entry = entry.into();
        let goto = func
            .dfg
            .make_inst(Opcode::Goto, vec![Operand::Text("next".to_string())]);
        func.dfg.insts[goto].block = entry.into();
        func.dfg.blocks[entry].insts.push(goto);

        let mut buf = CodeBuffer::new();
        let mut relocs = RelocSink::new();
        let mut emitter = FuncEmitter {
            func: &func,
            module: &mut module,
            conv: CallConv::SystemV,
            buf: &mut buf,
            relocs: &mut relocs,
            saved: Vec::new(),
            frame: 0,
        };
        emitter.emit_goto(goto, Some("next")).unwrap();
        assert!(buf.into_vec().is_empty());

        let mut buf = CodeBuffer::new();
        let mut relocs = RelocSink::new();
        let mut emitter = FuncEmitter {
            func: &func,
            module: &mut module,
            conv: CallConv::SystemV,
            buf: &mut buf,
            relocs: &mut relocs,
            saved: Vec::new(),
            frame: 0,
        };
        emitter.emit_goto(goto, Some("other")).unwrap();
        assert_eq!(buf.into_vec()[0], 0xe9);
        assert_eq!(relocs.labels.len(), 1);
    }
}
