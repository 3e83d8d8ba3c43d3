//! The textual IR parser.
//!
//! A line-oriented state machine: `func`/`static` directives at the root,
//! then argument and stack-slot declarations, then block bodies. Tokens are
//! maximal runs of non-space characters; `#` and `//` start comments. Each
//! parsed statement is legalized as it is appended, and the whole module goes
//! through branch splitting and edge connection before it is returned.

use hashbrown::HashMap;

use capstan_codegen::ir::{
    Block, Function, Module, Opcode, Operand, OperandClass, Type, Value,
};
use capstan_codegen::legalizer;

use crate::error::{ParseError, ParseResult};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    Root,
    FuncArgs,
    FuncSlots,
    BlockArgs,
    Block,
}

/// Parse a whole module from its textual form.
pub fn parse_module(text: &str) -> ParseResult<Module> {
    let mut parser = Parser {
        module: Module::new(),
        state: State::Root,
        func: None,
        block: None,
        slots: HashMap::new(),
        func_params: HashMap::new(),
        block_values: HashMap::new(),
        line: 0,
    };

    for (ix, raw) in text.lines().enumerate() {
        parser.line = ix + 1;
        let cut = raw
            .find(|c| c == '#')
            .or_else(|| raw.find("//"))
            .unwrap_or(raw.len());
        let tokens: Vec<&str> = raw[..cut].split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        parser.line_tokens(&tokens)?;
    }

    if parser.func.is_some() {
        return Err(parser.syntax("missing `endfunc`"));
    }
    let mut module = parser.module;
    log::debug!(
        "parsed {} function(s), {} static(s)",
        module.functions.len(),
        module.statics.len()
    );
    capstan_codegen::finish_construction(&mut module)?;
    Ok(module)
}

struct Parser {
    module: Module,
    state: State,
    func: Option<Function>,
    block: Option<Block>,
    /// Stack-slot address values, visible anywhere in the function.
    slots: HashMap<String, Value>,
    /// Function parameters, visible in the entry block only.
    func_params: HashMap<String, Value>,
    /// Parameters and statement results of the current block.
    block_values: HashMap<String, Value>,
    line: usize,
}

impl Parser {
    fn syntax(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn func_mut(&mut self) -> &mut Function {
        self.func.as_mut().expect("inside a function")
    }

    fn line_tokens(&mut self, tokens: &[&str]) -> ParseResult<()> {
        loop {
            return match self.state {
                State::Root => self.root_line(tokens),
                State::FuncArgs => {
                    if tokens[0] == "arg" {
                        self.func_arg_line(tokens)
                    } else {
                        self.state = State::FuncSlots;
                        continue;
                    }
                }
                State::FuncSlots => {
                    if tokens[0] == "stack_slot" {
                        self.slot_line(tokens)
                    } else {
                        self.begin_entry_block();
                        self.state = State::Block;
                        continue;
                    }
                }
                State::BlockArgs => {
                    if tokens[0] == "arg" {
                        self.block_arg_line(tokens)
                    } else {
                        self.state = State::Block;
                        continue;
                    }
                }
                State::Block => match tokens[0] {
                    "block" => self.block_line(tokens),
                    "endfunc" => self.endfunc_line(tokens),
                    _ => self.statement_line(tokens),
                },
            };
        }
    }

    fn root_line(&mut self, tokens: &[&str]) -> ParseResult<()> {
        match tokens[0] {
            "func" => {
                let name = *tokens
                    .get(1)
                    .ok_or_else(|| self.syntax("`func` needs a name"))?;
                let ret = match tokens.get(2) {
                    None => Type::None,
                    Some(&"returns") => {
                        let ty = tokens
                            .get(3)
                            .ok_or_else(|| self.syntax("`returns` needs a type"))?;
                        self.parse_type(ty)?
                    }
                    Some(other) => {
                        return Err(self.syntax(format!("unexpected token `{other}`")))
                    }
                };
                self.func = Some(Function::new(name.to_string(), ret));
                self.slots.clear();
                self.func_params.clear();
                self.block_values.clear();
                self.state = State::FuncArgs;
                Ok(())
            }
            "static" => {
                // static NAME TYPE LITERAL
                if tokens.len() != 4 {
                    return Err(self.syntax("`static` takes a name, a type, and a value"));
                }
                let ty = self.parse_type(tokens[2])?;
                let (bits, lit_ty) = self.parse_literal(tokens[3])?;
                if lit_ty != ty {
                    return Err(self.syntax("static initializer type mismatch"));
                }
                self.module
                    .add_static_word(tokens[1].to_string(), ty, bits);
                Ok(())
            }
            other => Err(self.syntax(format!("unknown directive `{other}`"))),
        }
    }

    fn func_arg_line(&mut self, tokens: &[&str]) -> ParseResult<()> {
        let (name, ty) = self.parse_arg_decl(tokens)?;
        self.check_redefinition(&name)?;
        let func = self.func_mut();
        let value = func.dfg.make_param(ty, name.clone());
        func.params.push(value);
        self.func_params.insert(name, value);
        Ok(())
    }

    fn slot_line(&mut self, tokens: &[&str]) -> ParseResult<()> {
        if tokens.len() != 3 {
            return Err(self.syntax("`stack_slot` takes a name and a size"));
        }
        let name = tokens[1].to_string();
        self.check_redefinition(&name)?;
        let size = parse_int(tokens[2])
            .ok_or_else(|| self.syntax(format!("bad stack slot size `{}`", tokens[2])))?;
        let addr = self.func_mut().create_stack_slot(
            name.clone(),
            size as u32,
            capstan_codegen::ir::StackSlotKind::Explicit,
        );
        self.slots.insert(name, addr);
        Ok(())
    }

    fn begin_entry_block(&mut self) {
        let func = self.func.as_mut().expect("inside a function");
        let entry = func.dfg.make_block("__entry__".to_string());
        func.layout.push(entry);
        func.entry = entry.into();
        self.block = Some(entry);
        self.block_values.clear();
    }

    fn block_line(&mut self, tokens: &[&str]) -> ParseResult<()> {
        let name = *tokens
            .get(1)
            .ok_or_else(|| self.syntax("`block` needs a name"))?;
        let func = self.func_mut();
        let block = func.dfg.make_block(name.to_string());
        func.layout.push(block);
        self.block = Some(block);
        self.block_values.clear();
        self.state = State::BlockArgs;
        Ok(())
    }

    fn block_arg_line(&mut self, tokens: &[&str]) -> ParseResult<()> {
        let (name, ty) = self.parse_arg_decl(tokens)?;
        self.check_redefinition(&name)?;
        let block = self.block.expect("inside a block");
        let func = self.func_mut();
        let value = func.dfg.make_param(ty, name.clone());
        func.dfg.blocks[block].params.push(value);
        self.block_values.insert(name, value);
        Ok(())
    }

    fn endfunc_line(&mut self, tokens: &[&str]) -> ParseResult<()> {
        if tokens.len() != 1 {
            return Err(self.syntax("`endfunc` takes nothing"));
        }
        let func = self.func.take().expect("inside a function");
        self.module.functions.push(func);
        self.block = None;
        self.state = State::Root;
        Ok(())
    }

    fn parse_arg_decl(&mut self, tokens: &[&str]) -> ParseResult<(String, Type)> {
        if tokens.len() != 3 {
            return Err(self.syntax("`arg` takes a name and a type"));
        }
        let ty = self.parse_type(tokens[2])?;
        Ok((tokens[1].to_string(), ty))
    }

    fn parse_type(&self, token: &str) -> ParseResult<Type> {
        Type::from_name(token).ok_or_else(|| self.syntax(format!("invalid type `{token}`")))
    }

    fn check_redefinition(&self, name: &str) -> ParseResult<()> {
        if self.func_params.contains_key(name)
            || self.slots.contains_key(name)
            || self.block_values.contains_key(name)
        {
            return Err(ParseError::Redefinition {
                line: self.line,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    // ---- statements --------------------------------------------------------

    fn statement_line(&mut self, tokens: &[&str]) -> ParseResult<()> {
        let (result_name, op_name, rest) = if tokens.len() >= 2 && tokens[1] == "=" {
            let op = *tokens
                .get(2)
                .ok_or_else(|| self.syntax("missing operation after `=`"))?;
            (Some(tokens[0]), op, &tokens[3..])
        } else {
            (None, tokens[0], &tokens[1..])
        };

        let opcode = Opcode::from_name(op_name)
            .ok_or_else(|| self.syntax(format!("unknown operation `{op_name}`")))?;
        if result_name.is_some() && !opcode.has_result() {
            return Err(self.syntax(format!("`{op_name}` produces no value")));
        }
        if let Some(name) = result_name {
            self.check_redefinition(name)?;
        }

        let operands = match opcode.operand_class() {
            OperandClass::UnaryValue => vec![Operand::Value(self.parse_value_at(rest, 0)?)],
            OperandClass::TypeValue => {
                let ty = self.parse_type(
                    rest.first()
                        .ok_or_else(|| self.syntax("missing type operand"))?,
                )?;
                vec![
                    Operand::Type(ty),
                    Operand::Value(self.parse_value_at(rest, 1)?),
                ]
            }
            OperandClass::BinaryValue => vec![
                Operand::Value(self.parse_value_at(rest, 0)?),
                Operand::Value(self.parse_value_at(rest, 1)?),
            ],
            OperandClass::TernaryValue => vec![
                Operand::Value(self.parse_value_at(rest, 0)?),
                Operand::Value(self.parse_value_at(rest, 1)?),
                Operand::Value(self.parse_value_at(rest, 2)?),
            ],
            OperandClass::Special => self.parse_special(opcode, rest)?,
        };

        let block = self.block.ok_or_else(|| self.syntax("statement outside a block"))?;
        let line = self.line;
        let func = self.func.as_mut().expect("inside a function");
        let inst = func.dfg.make_inst(opcode, operands);
        if let Some(name) = result_name {
            let ty = func
                .dfg
                .infer_result_type(opcode, &func.dfg.insts[inst].operands)
                .ok_or_else(|| {
                    ParseError::Syntax {
                        line,
                        message: format!("cannot infer the type of `{name}`"),
                    }
                })?;
            let result = func.dfg.attach_result(inst, ty, name.to_string());
            self.block_values.insert(name.to_string(), result);
        }
        let func = self.func_mut();
        func.dfg.insts[inst].block = block.into();
        func.dfg.blocks[block].insts.push(inst);
        legalizer::legalize_appended(func, block);
        Ok(())
    }

    fn parse_special(&mut self, opcode: Opcode, rest: &[&str]) -> ParseResult<Vec<Operand>> {
        match opcode {
            Opcode::Return => match rest {
                [] => Ok(vec![]),
                [v] => Ok(vec![Operand::Value(self.parse_value(v)?)]),
                _ => Err(self.syntax("`return` takes at most one value")),
            },
            Opcode::Breakpoint => {
                if rest.is_empty() {
                    Ok(vec![])
                } else {
                    Err(self.syntax("`breakpoint` takes nothing"))
                }
            }
            Opcode::SymbolLookup | Opcode::SymbolLookupUnsized => match rest {
                [name] => Ok(vec![Operand::Text(name.to_string())]),
                _ => Err(self.syntax("`symbol_lookup` takes one symbol name")),
            },
            Opcode::Goto => {
                let label = rest
                    .first()
                    .ok_or_else(|| self.syntax("`goto` needs a label"))?;
                let mut operands = vec![Operand::Text(label.to_string())];
                for token in &rest[1..] {
                    operands.push(Operand::Value(self.parse_value(token)?));
                }
                Ok(operands)
            }
            Opcode::If => {
                // if COND goto L1 [vals...] [else L2 [vals...]]
                let cond = self.parse_value_at(rest, 0)?;
                if rest.get(1) != Some(&"goto") {
                    return Err(self.syntax("expected `goto` after the condition"));
                }
                let label = rest
                    .get(2)
                    .ok_or_else(|| self.syntax("`if` needs a label"))?;
                let mut operands = vec![Operand::Value(cond), Operand::Text(label.to_string())];
                let mut ix = 3;
                while ix < rest.len() && rest[ix] != "else" {
                    operands.push(Operand::Value(self.parse_value(rest[ix])?));
                    ix += 1;
                }
                if ix < rest.len() {
                    // The else arm.
                    operands.push(Operand::Separator);
                    let label = rest
                        .get(ix + 1)
                        .ok_or_else(|| self.syntax("`else` needs a label"))?;
                    operands.push(Operand::Text(label.to_string()));
                    for token in &rest[ix + 2..] {
                        operands.push(Operand::Value(self.parse_value(token)?));
                    }
                }
                Ok(operands)
            }
            Opcode::Call => {
                let target = self.parse_value_at(rest, 0)?;
                let mut operands = vec![Operand::Value(target)];
                for token in &rest[1..] {
                    operands.push(Operand::Value(self.parse_value(token)?));
                }
                Ok(operands)
            }
            Opcode::CallEval => {
                // call_eval TYPE TARGET [vals...]
                let ty = self.parse_type(
                    rest.first()
                        .ok_or_else(|| self.syntax("`call_eval` needs a return type"))?,
                )?;
                let target = self.parse_value_at(rest, 1)?;
                let mut operands = vec![Operand::Type(ty), Operand::Value(target)];
                for token in &rest[2..] {
                    operands.push(Operand::Value(self.parse_value(token)?));
                }
                Ok(operands)
            }
            _ => unreachable!("not a special opcode"),
        }
    }

    fn parse_value_at(&mut self, tokens: &[&str], ix: usize) -> ParseResult<Value> {
        let token = tokens
            .get(ix)
            .ok_or_else(|| self.syntax("missing value operand"))?;
        self.parse_value(token)
    }

    fn parse_value(&mut self, token: &str) -> ParseResult<Value> {
        let first = token.as_bytes().first().copied().unwrap_or(0);
        if first.is_ascii_digit() || first == b'-' || first == b'.' {
            let (bits, ty) = self.parse_literal(token)?;
            return Ok(self.func_mut().dfg.make_const(ty, bits));
        }

        let in_entry = {
            let func = self.func.as_ref().expect("inside a function");
            func.entry.expand() == self.block
        };
        if let Some(v) = self.block_values.get(token) {
            return Ok(*v);
        }
        if in_entry {
            if let Some(v) = self.func_params.get(token) {
                return Ok(*v);
            }
        }
        if let Some(v) = self.slots.get(token) {
            return Ok(*v);
        }
        Err(ParseError::UndefinedReference {
            line: self.line,
            name: token.to_string(),
        })
    }

    /// A suffixed literal: `-12i64`, `0x10iptr`, `1.5f64`.
    fn parse_literal(&self, token: &str) -> ParseResult<(u64, Type)> {
        for (suffix, ty) in [("f32", Type::F32), ("f64", Type::F64)] {
            if let Some(body) = token.strip_suffix(suffix) {
                let bits = if ty == Type::F32 {
                    body.parse::<f32>().map(|f| f.to_bits() as u64)
                } else {
                    body.parse::<f64>().map(f64::to_bits)
                };
                return bits
                    .map(|b| (b, ty.clone()))
                    .map_err(|_| self.syntax(format!("invalid float literal `{token}`")));
            }
        }
        for (suffix, ty) in [
            ("iptr", Type::IPtr),
            ("i16", Type::I16),
            ("i32", Type::I32),
            ("i64", Type::I64),
            ("i8", Type::I8),
        ] {
            if let Some(body) = token.strip_suffix(suffix) {
                let bits = parse_int(body)
                    .ok_or_else(|| self.syntax(format!("invalid integer literal `{token}`")))?;
                return Ok((bits, ty));
            }
        }
        Err(self.syntax(format!("literal `{token}` has no type suffix")))
    }
}

/// Truncating integer parse: optional sign, optional `0x`, wrapping on
/// overflow the way hardware constants do.
fn parse_int(text: &str) -> Option<u64> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (radix, digits) = match rest.strip_prefix("0x") {
        Some(d) => (16, d),
        None => (10, rest),
    };
    if digits.is_empty() {
        return None;
    }
    let mut out: u64 = 0;
    for c in digits.chars() {
        let v = c.to_digit(radix)?;
        out = out.wrapping_mul(radix as u64).wrapping_add(v as u64);
    }
    Some(if negative { out.wrapping_neg() } else { out })
}
