//! Register allocation.
//!
//! A per-block linear scan with look-ahead. Within one block, statements are
//! numbered (even numbers, so inserted spill code can slot between them) and
//! every value's use list is ordered by statement number, which makes "last
//! use", "next use", and Belady-style victim selection cheap list scans.
//!
//! Entry-block parameters take their ABI registers; other blocks inherit
//! parameter registers from an untouched predecessor where possible. Results
//! reuse a dying operand's register when the opcode's mask allows it, then
//! fall back to the first free register (preferring caller-saved registers in
//! call-free functions), and finally evict the value with the furthest next
//! use. Evictions prefer a pure register change (fast spill), then a copy
//! into a free register (MOV spill), and only then a store/reload through a
//! fresh stack slot.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;

use crate::error::{CodegenError, CodegenResult};
use crate::ir::{
    separator_index, Block, Function, Inst, Module, Opcode, Operand, StackSlot, StackSlotKind,
    Type, Value,
};
use crate::isa::x64::abi::{AbiState, ArgLoc, CallConv};
use crate::isa::x64::regs::{
    class_of, Reg, RegClass, RegMask, R11, RAX, RBP, RCX, RDX, RSP, XMM0, XMM5,
};

/// Allocate registers for every function in the module.
pub fn run(module: &mut Module, conv: CallConv) -> CodegenResult<()> {
    for func in &mut module.functions {
        func.performs_calls = func.contains_calls();
        legalize_signature(func, conv)?;
        let mut alloc = Allocator {
            func,
            conv,
            regs: [RegState::Free; 32],
            use_count: SecondaryMap::new(),
            spilled: SecondaryMap::new(),
        };
        for b in 0..alloc.func.layout.len() {
            alloc.block(alloc.func.layout[b])?;
        }
    }
    Ok(())
}

/// Rewrite stack-located incoming arguments into loads from fixed incoming
/// slots, so the block body only ever sees register values.
fn legalize_signature(func: &mut Function, conv: CallConv) -> CodegenResult<()> {
    let mut abi = AbiState::new(conv);
    let entry = func
        .entry
        .expand()
        .ok_or_else(|| CodegenError::InvalidIr(format!("function {} has no entry", func.name)))?;
    let mut loads_inserted = 0;
    for p in 0..func.params.len() {
        let param = func.params[p];
        let ty = func.dfg.value_type(param);
        if !ty.is_basic() {
            return Err(CodegenError::Unsupported(format!(
                "aggregate parameter `{}`",
                func.dfg.values[param].name
            )));
        }
        let loc = abi.next_arg(ty.is_float());
        let ArgLoc::Stack(offset) = loc else {
            continue;
        };
        if func.dfg.values[param].uses.is_empty() {
            continue;
        }

        let name = func.temp_name();
        let addr = func.create_stack_slot(name, ty.bytes(), StackSlotKind::IncomingArg);
        let slot = func.dfg.value_stack_addr(addr).expect("incoming slot");
        func.stack_slots[slot].offset = offset;

        let reload_name = func.dfg.values[param].name.clone();
        let load = func.dfg.make_inst(
            Opcode::Load,
            vec![Operand::Type(ty.clone()), Operand::Value(addr)],
        );
        let reloaded = func.dfg.attach_result(load, ty, reload_name);
        func.dfg.insts[load].block = entry.into();
        func.dfg.blocks[entry].insts.insert(loads_inserted, load);
        loads_inserted += 1;
        func.dfg.add_use(addr, load);

        for user in func.dfg.values[param].uses.clone() {
            for i in 0..func.dfg.insts[user].operands.len() {
                if func.dfg.insts[user].operands[i] == Operand::Value(param) {
                    func.dfg.replace_operand(user, i, Operand::Value(reloaded));
                }
            }
        }
    }
    Ok(())
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum RegState {
    Free,
    Reserved,
    Taken(Value),
}

/// Per-opcode allocation constraints.
struct Rules {
    mask: RegMask,
    clobbers: RegMask,
    special: bool,
}

const ALL_REGS: RegMask = 0xffff_ffff;

fn alloc_rules(func: &Function, inst: Inst, conv: CallConv) -> Rules {
    let data = &func.dfg.insts[inst];
    let mut rules = Rules {
        mask: ALL_REGS,
        clobbers: 0,
        special: false,
    };
    let result_ty = data
        .result
        .expand()
        .map(|r| func.dfg.value_type(r))
        .unwrap_or(Type::None);
    match data.opcode {
        Opcode::Div | Opcode::Idiv | Opcode::DivUnsafe | Opcode::IdivUnsafe => {
            rules.special = true;
            rules.mask = 1 << RAX;
            rules.clobbers |= 1 << RAX;
            // 8-bit division keeps its remainder in AH, leaving RDX alone.
            if result_ty != Type::I8 {
                rules.clobbers |= 1 << RDX;
            }
        }
        Opcode::Rem | Opcode::Irem | Opcode::RemUnsafe | Opcode::IremUnsafe => {
            rules.special = true;
            if result_ty != Type::I8 {
                rules.mask = 1 << RDX;
                rules.clobbers |= (1 << RAX) | (1 << RDX);
            } else {
                rules.mask = 1 << RAX;
                rules.clobbers |= 1 << RAX;
            }
        }
        Opcode::Shl | Opcode::Shr | Opcode::ShrUnsafe | Opcode::Sar | Opcode::SarUnsafe => {
            let count_is_const = data.operands[1]
                .as_value()
                .is_some_and(|v| func.dfg.value_const(v).is_some());
            if !count_is_const {
                rules.special = true;
                rules.clobbers |= 1 << RCX;
                // The count moves into CL, so the result cannot live there.
                rules.mask = ALL_REGS & !(1 << RCX);
            }
        }
        Opcode::Call | Opcode::CallEval => {
            rules.special = true;
            if result_ty.is_int_reg() {
                rules.mask = 1 << RAX;
            } else if result_ty.is_float() {
                rules.mask = 1 << XMM0;
            }
            rules.clobbers = conv.caller_saved_mask();
        }
        _ => {}
    }
    rules
}

// Operand values stay live past every statement except calls, whose argument
// registers die into the call itself.
fn ops_live_after(opcode: Opcode) -> bool {
    !matches!(opcode, Opcode::Call | Opcode::CallEval)
}

struct Allocator<'a> {
    func: &'a mut Function,
    conv: CallConv,
    regs: [RegState; 32],
    use_count: SecondaryMap<Value, u32>,
    spilled: SecondaryMap<Value, PackedOption<StackSlot>>,
}

impl<'a> Allocator<'a> {
    fn block(&mut self, block: Block) -> CodegenResult<()> {
        self.regs = [RegState::Free; 32];
        for r in [RSP, RBP, R11, XMM5] {
            self.regs[r as usize] = RegState::Reserved;
        }

        if self.func.entry.expand() == Some(block) {
            self.entry_params()?;
        } else {
            self.block_params(block)?;
        }

        // Number statements and order use lists for the heuristics below.
        let insts = self.func.dfg.blocks[block].insts.clone();
        for (i, inst) in insts.iter().enumerate() {
            self.func.dfg.insts[*inst].num = (i as u32) << 1;
        }
        let mut defined: Vec<Value> = self.func.block_params(block).to_vec();
        defined.extend(insts.iter().filter_map(|i| self.func.dfg.insts[*i].result.expand()));
        for value in defined {
            let dfg = &mut self.func.dfg;
            let mut uses = core::mem::take(&mut dfg.values[value].uses);
            uses.sort_by_key(|u| dfg.insts[*u].num);
            dfg.values[value].uses = uses;
        }

        let mut i = 0;
        while i < self.func.dfg.blocks[block].insts.len() {
            let inst = self.func.dfg.blocks[block].insts[i];
            let opcode = self.func.dfg.insts[inst].opcode;

            if ops_live_after(opcode) {
                self.tick_uses(inst, 0, 1);
            } else {
                self.tick_uses(inst, 0, usize::MAX);
            }
            self.expire();

            let rules = alloc_rules(self.func, inst, self.conv);

            if self.func.dfg.insts[inst].result.is_some() {
                self.alloc_result(block, inst, &rules, &mut i)?;
            }
            if ops_live_after(opcode) {
                self.tick_uses(inst, 1, usize::MAX);
            }

            if rules.special && rules.clobbers != 0 {
                self.spill_clobbered(block, inst, &rules, &mut i)?;
            }
            i += 1;
        }

        // Record which registers this block writes.
        for inst in self.func.dfg.blocks[block].insts.clone() {
            if let Some(result) = self.func.dfg.insts[inst].result.expand() {
                if let Some(reg) = self.func.locations[result].reg() {
                    self.func.written_regs |= 1 << reg;
                }
            }
        }
        if self.func.entry.expand() != Some(block) {
            for param in self.func.dfg.blocks[block].params.clone() {
                if let Some(reg) = self.func.locations[param].reg() {
                    self.func.written_regs |= 1 << reg;
                }
            }
        }
        Ok(())
    }

    // Pre-assign the ABI registers of the function's parameters.
    fn entry_params(&mut self) -> CodegenResult<()> {
        let mut abi = AbiState::new(self.conv);
        for param in self.func.params.clone() {
            let ty = self.func.dfg.value_type(param);
            let loc = abi.next_arg(ty.is_float());
            if self.func.dfg.values[param].uses.is_empty() {
                continue;
            }
            if let ArgLoc::Reg(reg) = loc {
                self.regs[reg as usize] = RegState::Taken(param);
                self.func.locations[param] = crate::ir::ValueLoc::Reg(reg);
                log::trace!(
                    "parameter {} in {}",
                    self.func.dfg.values[param].name,
                    crate::isa::x64::regs::reg_name(reg, 8)
                );
            }
            // Stack-located parameters were rewritten into loads already.
        }
        Ok(())
    }

    // Assign block parameters, preferring whatever register the matching
    // argument of an already-allocated predecessor sits in.
    fn block_params(&mut self, block: Block) -> CodegenResult<()> {
        let params = self.func.dfg.blocks[block].params.clone();
        let preds = self.func.dfg.blocks[block].preds.clone();
        let block_name = self.func.dfg.blocks[block].name.clone();
        for (i, param) in params.iter().enumerate() {
            let ty = self.func.dfg.value_type(*param);
            let class = RegClass::of(&ty);
            let mut chosen: Option<Reg> = None;

            'preds: for entry in &preds {
                for value in self.pred_arg_values(*entry, &block_name, i) {
                    if let Some(reg) = self.inheritable(value) {
                        if class_of(reg) == class {
                            chosen = Some(reg);
                            break 'preds;
                        }
                    }
                }
            }

            let reg = match chosen {
                Some(reg) => reg,
                None => self
                    .first_free(class, ALL_REGS, !self.func.performs_calls)
                    .ok_or_else(|| CodegenError::RegallocExhausted {
                        func: self.func.name.clone(),
                        value: self.func.dfg.values[*param].name.clone(),
                    })?,
            };
            self.regs[reg as usize] = RegState::Taken(*param);
            self.func.locations[*param] = crate::ir::ValueLoc::Reg(reg);
        }
        Ok(())
    }

    // The values a predecessor terminator passes for parameter slot `i` of
    // the named block, one per arm that targets it.
    fn pred_arg_values(&self, entry: Inst, block_name: &str, i: usize) -> SmallVec<[Value; 2]> {
        let data = &self.func.dfg.insts[entry];
        let mut out = SmallVec::new();
        match data.opcode {
            Opcode::Goto => {
                if let Some(Operand::Value(v)) = data.operands.get(1 + i) {
                    out.push(*v);
                }
            }
            Opcode::If => {
                let sep = separator_index(&data.operands).expect("if has an else arm");
                if data.operands[1].as_text() == Some(block_name) {
                    if let Some(Operand::Value(v)) = data.operands.get(2 + i) {
                        out.push(*v);
                    }
                }
                if data.operands[sep + 1].as_text() == Some(block_name) {
                    if let Some(Operand::Value(v)) = data.operands.get(sep + 2 + i) {
                        out.push(*v);
                    }
                }
            }
            _ => {}
        }
        out
    }

    // A value's register can seed a block parameter if the value has one, was
    // never spilled, and nothing in the current block state claims it yet.
    fn inheritable(&self, value: Value) -> Option<Reg> {
        if self.spilled[value].is_some() {
            return None;
        }
        let reg = self.func.locations[value].reg()?;
        if self.regs[reg as usize] == RegState::Free {
            Some(reg)
        } else {
            None
        }
    }

    fn tick_uses(&mut self, inst: Inst, from: usize, to: usize) {
        let values: Vec<Value> = self.func.dfg.insts[inst]
            .operands
            .iter()
            .skip(from)
            .take(to.saturating_sub(from))
            .filter_map(Operand::as_value)
            .collect();
        for value in values {
            if self.func.dfg.value_const(value).is_none() {
                self.use_count[value] += 1;
                debug_assert!(
                    self.use_count[value] as usize <= self.func.dfg.values[value].uses.len()
                );
            }
        }
    }

    // Free every register whose value has no unallocated uses left.
    fn expire(&mut self) {
        for r in 0..32 {
            if let RegState::Taken(value) = self.regs[r] {
                if self.use_count[value] as usize == self.func.dfg.values[value].uses.len() {
                    self.regs[r] = RegState::Free;
                }
            }
        }
    }

    fn first_free(&self, class: RegClass, mask: RegMask, prefer_caller_saved: bool) -> Option<Reg> {
        if prefer_caller_saved {
            let narrowed = mask & self.conv.caller_saved_mask();
            if let Some(reg) = self.first_free(class, narrowed, false) {
                return Some(reg);
            }
        }
        let mask = mask & class.mask();
        (0..32)
            .map(|r| r as Reg)
            .find(|r| mask & (1 << r) != 0 && self.regs[*r as usize] == RegState::Free)
    }

    fn alloc_result(
        &mut self,
        block: Block,
        inst: Inst,
        rules: &Rules,
        i: &mut usize,
    ) -> CodegenResult<()> {
        let result = self.func.dfg.insts[inst].result.expand().expect("result");
        debug_assert!(!self.func.locations[result].is_assigned());
        let ty = self.func.dfg.value_type(result);
        let class = RegClass::of(&ty);
        let mask = if rules.special { rules.mask } else { ALL_REGS };
        let commutative = self.func.dfg.insts[inst].opcode.is_commutative();

        // Reuse the register of an operand dying here.
        let operands = self.func.dfg.insts[inst].operands.clone();
        for (j, op) in operands.iter().enumerate() {
            if j > 0 && !commutative {
                break;
            }
            let Some(arg) = op.as_value() else { continue };
            let Some(reg) = self.func.locations[arg].reg() else {
                continue;
            };
            if self.use_count[arg] as usize != self.func.dfg.values[arg].uses.len() {
                continue;
            }
            if RegClass::of(&self.func.dfg.value_type(arg)) != class || class_of(reg) != class {
                continue;
            }
            if mask & (1 << reg) == 0 {
                continue;
            }
            self.regs[reg as usize] = RegState::Taken(result);
            self.func.locations[result] = crate::ir::ValueLoc::Reg(reg);
            return Ok(());
        }

        let reg = match self.first_free(class, mask, !self.func.performs_calls) {
            Some(reg) => reg,
            None => {
                // Evict the value whose next use is furthest away.
                let (victim_reg, next_use_num) =
                    self.find_spillable(inst, class, mask).ok_or_else(|| {
                        CodegenError::RegallocExhausted {
                            func: self.func.name.clone(),
                            value: self.func.dfg.values[result].name.clone(),
                        }
                    })?;
                let RegState::Taken(victim) = self.regs[victim_reg as usize] else {
                    unreachable!("spill victim is allocated");
                };
                let on_behalf_num = self.func.dfg.insts[inst].num;
                let allowed = !rules.clobbers & !(1 << victim_reg);
                self.spill(
                    block,
                    victim,
                    victim_reg,
                    next_use_num,
                    allowed,
                    on_behalf_num,
                    i,
                )?;
                victim_reg
            }
        };

        debug_assert_eq!(self.regs[reg as usize], RegState::Free);
        self.regs[reg as usize] = RegState::Taken(result);
        self.func.locations[result] = crate::ir::ValueLoc::Reg(reg);
        Ok(())
    }

    // Belady victim selection: among allocated registers permitted by `mask`,
    // the one whose owner's next use is latest.
    fn find_spillable(&self, inst: Inst, class: RegClass, mask: RegMask) -> Option<(Reg, u32)> {
        let current = self.func.dfg.insts[inst].num;
        let mask = mask & class.mask();
        let mut best: Option<(Reg, u32)> = None;
        for r in 0..32u8 {
            if mask & (1 << r) == 0 {
                continue;
            }
            let RegState::Taken(value) = self.regs[r as usize] else {
                continue;
            };
            let next = self.func.dfg.values[value]
                .uses
                .iter()
                .map(|u| self.func.dfg.insts[*u].num)
                .find(|n| *n > current);
            let Some(next) = next else { continue };
            if best.map_or(true, |(_, n)| next > n) {
                best = Some((r, next));
            }
        }
        best
    }

    // Evict `victim` from `victim_reg`. Prefers a pure register change, then
    // a copy into a free register, then a store/reload through a spill slot.
    // Uses numbered `to_spill_num` or later move to the replacement value.
    #[allow(clippy::too_many_arguments)]
    fn spill(
        &mut self,
        block: Block,
        victim: Value,
        victim_reg: Reg,
        to_spill_num: u32,
        allowed: RegMask,
        on_behalf_num: u32,
        i: &mut usize,
    ) -> CodegenResult<()> {
        debug_assert_eq!(self.regs[victim_reg as usize], RegState::Taken(victim));
        self.regs[victim_reg as usize] = RegState::Free;

        let class = class_of(victim_reg);
        let current_num = {
            let cur = self.func.dfg.blocks[block].insts[*i];
            self.func.dfg.insts[cur].num
        };

        if let Some(temp) = self.first_free(class, allowed, !self.func.performs_calls) {
            let first_use = self.func.dfg.values[victim].uses.first().copied();
            let first_use_num = first_use.map(|u| self.func.dfg.insts[u].num);
            if first_use_num.is_some_and(|n| n > current_num) {
                // Fast spill: nothing emitted referenced the old register yet.
                log::trace!(
                    "fast spilling {} into {}",
                    self.func.dfg.values[victim].name,
                    crate::isa::x64::regs::reg_name(temp, 8)
                );
                self.regs[temp as usize] = RegState::Taken(victim);
                self.func.locations[victim] = crate::ir::ValueLoc::Reg(temp);
                return Ok(());
            }

            // MOV spill: copy into the free register and steer later uses at
            // the copy.
            let name = self.func.temp_name();
            let ty = self.func.dfg.value_type(victim);
            let mov = self
                .func
                .dfg
                .make_inst(Opcode::Mov, vec![Operand::Value(victim)]);
            let copy = self.func.dfg.attach_result(mov, ty, name);
            self.func.dfg.insts[mov].block = block.into();
            self.func.dfg.insts[mov].num = on_behalf_num.wrapping_sub(1);
            self.func.dfg.blocks[block].insts.insert(*i, mov);
            *i += 1;
            self.regs[temp as usize] = RegState::Taken(copy);
            self.func.locations[copy] = crate::ir::ValueLoc::Reg(temp);
            log::trace!(
                "MOV spilling {} into {}",
                self.func.dfg.values[victim].name,
                crate::isa::x64::regs::reg_name(temp, 8)
            );

            self.move_later_uses(victim, copy, to_spill_num);
            self.func.dfg.add_use(victim, mov);
            self.sort_uses(victim);
            return Ok(());
        }

        // Memory spill.
        let ty = self.func.dfg.value_type(victim);
        let slot_name = self.func.temp_name();
        let addr = self
            .func
            .create_stack_slot(slot_name, ty.bytes(), StackSlotKind::Spill);
        let slot = self.func.dfg.value_stack_addr(addr).expect("spill slot");
        self.spilled[victim] = slot.into();
        log::trace!(
            "memory spilling {} into {}",
            self.func.dfg.values[victim].name,
            self.func.stack_slots[slot].name
        );

        let store = self.func.dfg.make_inst(
            Opcode::Store,
            vec![Operand::Value(addr), Operand::Value(victim)],
        );
        self.func.dfg.insts[store].block = block.into();
        self.func.dfg.insts[store].num = on_behalf_num.wrapping_sub(1);
        self.func.dfg.blocks[block].insts.insert(*i, store);
        *i += 1;
        self.func.dfg.add_use(addr, store);

        // Reload right before the next use and steer that and later uses at
        // the reload.
        let next_use = self.func.dfg.values[victim]
            .uses
            .iter()
            .copied()
            .find(|u| self.func.dfg.insts[*u].num >= to_spill_num)
            .expect("spill victim has a future use");
        let next_pos = self.func.dfg.blocks[block]
            .insts
            .iter()
            .position(|x| *x == next_use)
            .expect("future use is in this block");
        debug_assert!(next_pos > *i);

        let reload_name = self.func.temp_name();
        let load = self.func.dfg.make_inst(
            Opcode::Load,
            vec![Operand::Type(ty.clone()), Operand::Value(addr)],
        );
        let reloaded = self.func.dfg.attach_result(load, ty, reload_name);
        self.func.dfg.insts[load].block = block.into();
        self.func.dfg.insts[load].num = self.func.dfg.insts[next_use].num.wrapping_sub(1);
        self.func.dfg.blocks[block].insts.insert(next_pos, load);
        self.func.dfg.add_use(addr, load);

        self.move_later_uses(victim, reloaded, to_spill_num);
        self.func.dfg.add_use(victim, store);
        self.sort_uses(victim);
        Ok(())
    }

    // Rewrite every use of `from` numbered `cutoff` or later to read `to`,
    // moving the use edges along.
    fn move_later_uses(&mut self, from: Value, to: Value, cutoff: u32) {
        let users: Vec<Inst> = self.func.dfg.values[from].uses.clone();
        for user in users {
            if self.func.dfg.insts[user].num < cutoff {
                continue;
            }
            for idx in 0..self.func.dfg.insts[user].operands.len() {
                if self.func.dfg.insts[user].operands[idx] == Operand::Value(from) {
                    self.func.dfg.replace_operand(user, idx, Operand::Value(to));
                }
            }
        }
        self.sort_uses(to);
    }

    fn sort_uses(&mut self, value: Value) {
        let dfg = &mut self.func.dfg;
        let mut uses = core::mem::take(&mut dfg.values[value].uses);
        uses.sort_by_key(|u| dfg.insts[*u].num);
        dfg.values[value].uses = uses;
    }

    // After a clobbering statement, evict any live value sitting in a
    // clobbered register that is read again later.
    fn spill_clobbered(
        &mut self,
        block: Block,
        inst: Inst,
        rules: &Rules,
        i: &mut usize,
    ) -> CodegenResult<()> {
        let current = self.func.dfg.insts[inst].num;
        let result = self.func.dfg.insts[inst].result.expand();
        for r in 0..32u8 {
            if rules.clobbers & (1 << r) == 0 {
                continue;
            }
            let RegState::Taken(value) = self.regs[r as usize] else {
                continue;
            };
            if Some(value) == result {
                continue;
            }
            let last_use = self.func.dfg.values[value]
                .uses
                .last()
                .map(|u| self.func.dfg.insts[*u].num);
            if !last_use.is_some_and(|n| n > current) {
                continue;
            }
            log::trace!(
                "spilling {} out of clobbered {}",
                self.func.dfg.values[value].name,
                crate::isa::x64::regs::reg_name(r, 8)
            );
            self.spill(block, value, r, current + 1, !rules.clobbers, current, i)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ValueLoc;

    fn simple_func() -> Function {
        // func f returns i64 / arg a i64 / r = add a 1 / return r
        let mut func = Function::new("f".to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let a = func.dfg.make_param(Type::I64, "a".to_string());
        func.params.push(a);
        let one = func.dfg.make_const(Type::I64, 1);
        let add = func
            .dfg
            .make_inst(Opcode::Add, vec![Operand::Value(a), Operand::Value(one)]);
        let r = func.dfg.attach_result(add, Type::I64, "r".to_string());
        let ret = func.dfg.make_inst(Opcode::Return, vec![Operand::Value(r)]);
        for inst in [add, ret] {
            func.dfg.insts[inst].block = entry.into();
            func.dfg.blocks[entry].insts.push(inst);
        }
        crate::flowgraph::compute(&mut func).unwrap();
        func
    }

    #[test]
    fn reuses_dying_operand_register() {
        let mut module = Module::new();
        module.functions.push(simple_func());
        run(&mut module, CallConv::SystemV).unwrap();
        let func = &module.functions[0];
        let a = func.params[0];
        // `a` arrives in RDI and dies at the add, so the result takes RDI.
        assert_eq!(func.locations[a], ValueLoc::Reg(crate::isa::x64::regs::RDI));
        let entry = func.layout[0];
        let add = func.dfg.blocks[entry].insts[0];
        let r = func.dfg.insts[add].result.expand().unwrap();
        assert_eq!(func.locations[r], ValueLoc::Reg(crate::isa::x64::regs::RDI));
    }

    #[test]
    fn division_is_pinned_to_rax() {
        let mut func = Function::new("f".to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let a = func.dfg.make_param(Type::I64, "a".to_string());
        let b = func.dfg.make_param(Type::I64, "b".to_string());
        func.params.extend([a, b]);
        let div = func
            .dfg
            .make_inst(Opcode::Div, vec![Operand::Value(a), Operand::Value(b)]);
        let q = func.dfg.attach_result(div, Type::I64, "q".to_string());
        let ret = func.dfg.make_inst(Opcode::Return, vec![Operand::Value(q)]);
        for inst in [div, ret] {
            func.dfg.insts[inst].block = entry.into();
            func.dfg.blocks[entry].insts.push(inst);
        }
        crate::flowgraph::compute(&mut func).unwrap();

        let mut module = Module::new();
        module.functions.push(func);
        run(&mut module, CallConv::SystemV).unwrap();
        let func = &module.functions[0];
        let entry = func.layout[0];
        let div = func.dfg.blocks[entry]
            .insts
            .iter()
            .copied()
            .find(|i| func.dfg.insts[*i].opcode == Opcode::Div)
            .unwrap();
        let q = func.dfg.insts[div].result.expand().unwrap();
        assert_eq!(func.locations[q], ValueLoc::Reg(RAX));
    }

    #[test]
    fn spills_when_registers_run_out() {
        // Define 20 values, then use them all: 14 allocatable integer
        // registers force spill traffic, and the function must still
        // allocate with every value placed.
        let mut func = Function::new("f".to_string(), Type::I64);
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        let a = func.dfg.make_param(Type::I64, "a".to_string());
        func.params.push(a);

        let mut values = Vec::new();
        let mut insts = Vec::new();
        for n in 0..20 {
            let k = func.dfg.make_const(Type::I64, n);
            let add = func
                .dfg
                .make_inst(Opcode::Add, vec![Operand::Value(a), Operand::Value(k)]);
            let v = func.dfg.attach_result(add, Type::I64, format!("v{n}"));
            values.push(v);
            insts.push(add);
        }
        let mut acc = values[0];
        for v in &values[1..] {
            let add = func
                .dfg
                .make_inst(Opcode::Add, vec![Operand::Value(acc), Operand::Value(*v)]);
            acc = func
                .dfg
                .attach_result(add, Type::I64, format!("s{}", insts.len()));
            insts.push(add);
        }
        let ret = func.dfg.make_inst(Opcode::Return, vec![Operand::Value(acc)]);
        insts.push(ret);
        for inst in insts {
            func.dfg.insts[inst].block = entry.into();
            func.dfg.blocks[entry].insts.push(inst);
        }
        crate::flowgraph::compute(&mut func).unwrap();

        let mut module = Module::new();
        module.functions.push(func);
        run(&mut module, CallConv::SystemV).unwrap();

        let func = &module.functions[0];
        let entry = func.layout[0];
        // Everything that produces a value got a register.
        for inst in &func.dfg.blocks[entry].insts {
            if let Some(r) = func.dfg.insts[*inst].result.expand() {
                assert!(func.locations[r].is_assigned(), "unplaced value");
            }
        }
        // No two live values share a register at any point: walk the block
        // and track liveness by last use.
        let insts = func.dfg.blocks[entry].insts.clone();
        let mut live: hashbrown::HashMap<u8, Value> = hashbrown::HashMap::new();
        let mut remaining: hashbrown::HashMap<Value, usize> = hashbrown::HashMap::new();
        for inst in &insts {
            for v in func.dfg.value_operands(*inst) {
                *remaining.entry(v).or_insert(0) += 1;
            }
        }
        for inst in &insts {
            for v in func.dfg.value_operands(*inst) {
                let n = remaining.get_mut(&v).unwrap();
                *n -= 1;
                if *n == 0 {
                    if let Some(reg) = func.locations[v].reg() {
                        live.remove(&reg);
                    }
                }
            }
            if let Some(r) = func.dfg.insts[*inst].result.expand() {
                if let Some(reg) = func.locations[r].reg() {
                    let evicted = live.insert(reg, r);
                    assert!(
                        evicted.is_none(),
                        "register conflict in {}",
                        crate::isa::x64::regs::reg_name(reg, 8)
                    );
                }
            }
        }
    }
}
