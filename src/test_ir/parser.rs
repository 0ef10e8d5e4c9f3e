//! Textual IR parser.

use std::collections::HashMap;

use crate::ir::{BlockId, Graph, GraphBuilder, IrOp, Mode, NodeId, Relation};

/// Parses every function of `text` into a graph.
pub fn parse_module(text: &str) -> Result<Vec<Graph>, String> {
    let mut parser = Parser::new(text);
    match parser.parse() {
        Ok(graphs) => Ok(graphs),
        Err(e) => Err(parser.with_context(e)),
    }
}

/// A phi whose operands are resolved once the whole function is known.
struct PendingPhi<'a> {
    phi: NodeId,
    block: BlockId,
    incoming: Vec<(&'a str, &'a str)>,
    pos: usize,
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

/// Per-function name maps.
struct FunctionScope<'a> {
    builder: GraphBuilder,
    values: HashMap<&'a str, NodeId>,
    blocks: HashMap<&'a str, BlockId>,
    defined_blocks: Vec<&'a str>,
    phis: Vec<PendingPhi<'a>>,
    terminated: bool,
}

impl<'a> FunctionScope<'a> {
    fn block(&mut self, name: &'a str) -> BlockId {
        if let Some(&block) = self.blocks.get(name) {
            return block;
        }
        let block = self.builder.new_block(name);
        self.blocks.insert(name, block);
        block
    }

    fn value(&self, name: &str) -> Result<NodeId, String> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| format!("Undefined value %{}", name))
    }

    fn define(&mut self, name: &'a str, value: NodeId) -> Result<(), String> {
        if self.values.insert(name, value).is_some() {
            return Err(format!("Value %{} defined twice", name));
        }
        Ok(())
    }
}

fn parse_relation(name: &str) -> Result<Relation, String> {
    Ok(match name {
        "eq" => Relation::Eq,
        "ne" => Relation::Ne,
        "lt" => Relation::Lt,
        "le" => Relation::Le,
        "gt" => Relation::Gt,
        "ge" => Relation::Ge,
        other => return Err(format!("Unknown relation '{}'", other)),
    })
}

fn binop_kind(name: &str) -> Option<IrOp> {
    Some(match name {
        "add" => IrOp::Add,
        "sub" => IrOp::Sub,
        "mul" => IrOp::Mul,
        "mulh" => IrOp::Mulh,
        "quot" => IrOp::Quot,
        "and" => IrOp::And,
        "or" => IrOp::Or,
        "eor" => IrOp::Eor,
        "shl" => IrOp::Shl,
        "shr" => IrOp::Shr,
        "shrs" => IrOp::Shrs,
        "rotl" => IrOp::Rotl,
        _ => return None,
    })
}

fn unop_kind(name: &str) -> Option<IrOp> {
    Some(match name {
        "minus" => IrOp::Minus,
        "abs" => IrOp::Abs,
        "not" => IrOp::Not,
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Prefixes `message` with the line and column of the current position.
    fn with_context(&self, message: String) -> String {
        let consumed = &self.text[..self.pos.min(self.text.len())];
        let line = consumed.matches('\n').count() + 1;
        let column = consumed.rfind('\n').map_or(consumed.len(), |nl| consumed.len() - nl - 1) + 1;
        format!("line {}:{}: {}", line, column, message)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // comment until end of line
                while let Some(ch) = self.current_char() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.current_char()
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), String> {
        if !self.try_read(ch) {
            return Err(format!("Expected '{}' but found {:?}", ch, self.current_char()));
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace();
        let start = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' || ch == '.' => {}
            Some(ch) => return Err(format!("Expected identifier but found '{}'", ch)),
            None => return Err("Expected identifier but found EOF".to_string()),
        }
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_keyword(&mut self, keyword: &str) -> Result<(), String> {
        let ident = self.read_identifier()?;
        if ident != keyword {
            return Err(format!("Expected '{}' but found '{}'", keyword, ident));
        }
        Ok(())
    }

    fn read_value_name(&mut self) -> Result<&'a str, String> {
        self.expect('%')?;
        self.read_name()
    }

    /// Value and block names may start with a digit.
    fn read_name(&mut self) -> Result<&'a str, String> {
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(format!("Expected name but found {:?}", self.current_char()));
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_block_name(&mut self) -> Result<&'a str, String> {
        self.expect('^')?;
        self.read_name()
    }

    fn read_mode(&mut self) -> Result<Mode, String> {
        let name = self.read_identifier()?;
        name.parse::<Mode>()
            .map_err(|e| format!("{} in mode position", e))
    }

    fn read_literal(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '+' | '.') {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(format!("Expected number but found {:?}", self.current_char()));
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_int(&mut self) -> Result<i64, String> {
        let literal = self.read_literal()?;
        let (negative, digits) = match literal.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, literal),
        };
        let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => digits.parse::<u64>(),
        }
        .map_err(|e| format!("Invalid integer '{}': {}", literal, e))?;
        let value = magnitude as i64;
        Ok(if negative { value.wrapping_neg() } else { value })
    }

    fn read_float(&mut self) -> Result<f64, String> {
        let literal = self.read_literal()?;
        literal
            .parse::<f64>()
            .map_err(|e| format!("Invalid float '{}': {}", literal, e))
    }

    fn read_value(&mut self, scope: &FunctionScope<'a>) -> Result<NodeId, String> {
        let name = self.read_value_name()?;
        scope.value(name)
    }

    /// Comma-separated value operands.
    fn read_values(
        &mut self,
        scope: &FunctionScope<'a>,
        count: usize,
    ) -> Result<Vec<NodeId>, String> {
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                self.expect(',')?;
            }
            values.push(self.read_value(scope)?);
        }
        Ok(values)
    }

    // ---------------------------------------------------------------------
    // Functions
    // ---------------------------------------------------------------------

    fn parse(&mut self) -> Result<Vec<Graph>, String> {
        let mut graphs = Vec::new();
        while self.peek().is_some() {
            graphs.push(self.parse_function()?);
        }
        Ok(graphs)
    }

    fn parse_function(&mut self) -> Result<Graph, String> {
        self.read_keyword("func")?;
        let name = self.read_identifier()?;
        self.expect('(')?;
        let mut arg_names = Vec::new();
        let mut arg_modes = Vec::new();
        if !self.try_read(')') {
            loop {
                arg_names.push(self.read_value_name()?);
                self.expect(':')?;
                arg_modes.push(self.read_mode()?);
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }
        self.expect('{')?;

        let builder = GraphBuilder::new(name, &arg_modes);
        let mut scope = FunctionScope {
            values: HashMap::new(),
            blocks: HashMap::new(),
            defined_blocks: Vec::new(),
            phis: Vec::new(),
            terminated: true,
            builder,
        };
        for (i, arg) in arg_names.into_iter().enumerate() {
            let value = scope.builder.arg(i);
            scope.define(arg, value)?;
        }
        let initial_mem = scope.builder.initial_mem();
        scope.define("mem", initial_mem)?;

        while !self.try_read('}') {
            if self.is_eof() {
                return Err(format!("Unterminated function {}", name));
            }
            self.parse_line(&mut scope)?;
        }
        if !scope.terminated {
            return Err(format!("Last block of {} has no terminator", name));
        }
        for (block_name, _) in scope.blocks.iter() {
            if !scope.defined_blocks.contains(block_name) {
                return Err(format!("Block ^{} is referenced but never defined", block_name));
            }
        }
        Self::resolve_phis(&mut scope)?;
        log::debug!("parsed function {} ({} values)", name, scope.values.len());
        Ok(scope.builder.finish())
    }

    /// Binds phi operands in predecessor order.
    fn resolve_phis(scope: &mut FunctionScope<'a>) -> Result<(), String> {
        let phis = std::mem::take(&mut scope.phis);
        for pending in phis {
            let graph = scope.builder.graph();
            let preds = graph.block_preds(pending.block).len();
            let mut operands = Vec::with_capacity(preds);
            let mut used = vec![false; pending.incoming.len()];
            for pos in 0..preds {
                let pred_block = graph
                    .pred_block(pending.block, pos)
                    .ok_or_else(|| format!("Predecessor {} of a phi block has no block", pos))?;
                let found = pending.incoming.iter().enumerate().find(|(i, (_, block))| {
                    !used[*i] && scope.blocks.get(block).copied() == Some(pred_block)
                });
                let Some((i, (value, _))) = found else {
                    return Err(format!(
                        "Phi in {} has no incoming value for predecessor {}",
                        graph.block(pending.block).name(),
                        graph.block(pred_block).name()
                    ));
                };
                used[i] = true;
                operands.push(scope.value(value)?);
            }
            if used.iter().any(|u| !u) {
                return Err(format!(
                    "Phi in {} names a block that is not a predecessor (operand list at {})",
                    graph.block(pending.block).name(),
                    pending.pos
                ));
            }
            scope.builder.set_phi_operands(pending.phi, &operands);
        }
        Ok(())
    }

    fn parse_line(&mut self, scope: &mut FunctionScope<'a>) -> Result<(), String> {
        if self.peek() == Some('%') {
            let mut results = vec![self.read_value_name()?];
            while self.try_read(',') {
                results.push(self.read_value_name()?);
            }
            self.expect('=')?;
            if scope.terminated {
                return Err("Instruction outside of a block".to_string());
            }
            let opcode = self.read_identifier()?;
            return self.parse_instruction(scope, opcode, &results);
        }

        let ident = self.read_identifier()?;
        if self.try_read(':') {
            if !scope.terminated {
                return Err(format!(
                    "Block {} starts before the previous block is terminated",
                    ident
                ));
            }
            if scope.defined_blocks.contains(&ident) {
                return Err(format!("Block {} defined twice", ident));
            }
            let block = if scope.defined_blocks.is_empty() {
                if scope.blocks.contains_key(ident) {
                    return Err(format!("Entry block {} cannot be a branch target", ident));
                }
                let start = scope.builder.start_block();
                scope.blocks.insert(ident, start);
                start
            } else {
                scope.block(ident)
            };
            scope.defined_blocks.push(ident);
            scope.builder.switch_to(block);
            scope.terminated = false;
            return Ok(());
        }
        if scope.terminated {
            return Err(format!("'{}' outside of a block", ident));
        }
        self.parse_terminator(scope, ident)?;
        scope.terminated = true;
        Ok(())
    }

    fn parse_terminator(
        &mut self,
        scope: &mut FunctionScope<'a>,
        opcode: &str,
    ) -> Result<(), String> {
        match opcode {
            "jmp" => {
                let target = self.read_block_name()?;
                let target = scope.block(target);
                scope.builder.jmp(target);
            }
            "br" => {
                let sel = self.read_value(scope)?;
                self.expect(',')?;
                let if_true = self.read_block_name()?;
                self.expect(',')?;
                let if_false = self.read_block_name()?;
                let (t, f) = (scope.block(if_true), scope.block(if_false));
                scope.builder.cond(sel, t, f);
            }
            "switch" => {
                let sel = self.read_value(scope)?;
                self.expect(',')?;
                let default = self.read_block_name()?;
                let default = scope.block(default);
                let mut cases = Vec::new();
                self.expect('[')?;
                if !self.try_read(']') {
                    loop {
                        let value = self.read_int()?;
                        self.expect(':')?;
                        let target = self.read_block_name()?;
                        cases.push((value, scope.block(target)));
                        if self.try_read(']') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                scope.builder.switch(sel, default, &cases);
            }
            "ret" => {
                let mem = self.read_value(scope)?;
                let mut values = Vec::new();
                while self.try_read(',') {
                    values.push(self.read_value(scope)?);
                }
                scope.builder.ret(mem, &values);
            }
            other => return Err(format!("Unknown terminator '{}'", other)),
        }
        Ok(())
    }

    fn parse_instruction(
        &mut self,
        scope: &mut FunctionScope<'a>,
        opcode: &'a str,
        results: &[&'a str],
    ) -> Result<(), String> {
        let expect_results = |n: usize| -> Result<(), String> {
            if results.len() != n {
                return Err(format!("'{}' defines {} value(s), {} given", opcode, n, results.len()));
            }
            Ok(())
        };

        let defined: Vec<NodeId> = if let Some(op) = binop_kind(opcode) {
            expect_results(1)?;
            let ops = self.read_values(scope, 2)?;
            vec![scope.builder.binop(op, ops[0], ops[1])]
        } else if let Some(op) = unop_kind(opcode) {
            expect_results(1)?;
            let value = self.read_value(scope)?;
            vec![scope.builder.unop(op, value)]
        } else {
            match opcode {
                "const" => {
                    expect_results(1)?;
                    let mode = self.read_mode()?;
                    let node = if mode.is_float() {
                        let value = self.read_float()?;
                        scope.builder.fconst(mode, value)
                    } else {
                        let value = self.read_int()?;
                        scope.builder.konst(mode, value)
                    };
                    vec![node]
                }
                "symconst" => {
                    expect_results(1)?;
                    let name = self.read_identifier()?;
                    vec![scope.builder.symconst(name)]
                }
                "frame" => {
                    expect_results(1)?;
                    let size = self.read_int()?;
                    self.expect(',')?;
                    let align = self.read_int()?;
                    let (size, align) = u32::try_from(size)
                        .ok()
                        .zip(u32::try_from(align).ok())
                        .ok_or_else(|| "Frame size and alignment must be positive".to_string())?;
                    let entity = scope.builder.alloc_slot(results[0], size, align);
                    vec![scope.builder.frame_addr(entity)]
                }
                "unknown" => {
                    expect_results(1)?;
                    let mode = self.read_mode()?;
                    vec![scope.builder.unknown(mode)]
                }
                "conv" => {
                    expect_results(1)?;
                    let mode = self.read_mode()?;
                    let value = self.read_value(scope)?;
                    vec![scope.builder.conv(value, mode)]
                }
                "cmp" => {
                    expect_results(1)?;
                    let relation = parse_relation(self.read_identifier()?)?;
                    let ops = self.read_values(scope, 2)?;
                    vec![scope.builder.cmp(relation, ops[0], ops[1])]
                }
                "mux" => {
                    expect_results(1)?;
                    let ops = self.read_values(scope, 3)?;
                    vec![scope.builder.mux(ops[0], ops[1], ops[2])]
                }
                "load" => {
                    expect_results(2)?;
                    let mode = self.read_mode()?;
                    let ops = self.read_values(scope, 2)?;
                    let (value, mem) = scope.builder.load(ops[0], ops[1], mode);
                    vec![value, mem]
                }
                "store" => {
                    expect_results(1)?;
                    let ops = self.read_values(scope, 3)?;
                    vec![scope.builder.store(ops[0], ops[1], ops[2])]
                }
                "div" | "mod" => {
                    expect_results(2)?;
                    let ops = self.read_values(scope, 3)?;
                    let (value, mem) = if opcode == "div" {
                        scope.builder.div(ops[0], ops[1], ops[2])
                    } else {
                        scope.builder.modulo(ops[0], ops[1], ops[2])
                    };
                    vec![value, mem]
                }
                "sync" => {
                    expect_results(1)?;
                    let mut mems = vec![self.read_value(scope)?];
                    while self.try_read(',') {
                        mems.push(self.read_value(scope)?);
                    }
                    vec![scope.builder.sync(&mems)]
                }
                "call" => {
                    // %r..., %m = call name(%mem, args...) -> modes
                    let callee = self.read_identifier()?;
                    self.expect('(')?;
                    let mem = self.read_value(scope)?;
                    let mut args = Vec::new();
                    while self.try_read(',') {
                        args.push(self.read_value(scope)?);
                    }
                    self.expect(')')?;
                    let mut modes = Vec::new();
                    if self.try_read('-') {
                        self.expect('>')?;
                        modes.push(self.read_mode()?);
                        while self.try_read(',') {
                            modes.push(self.read_mode()?);
                        }
                    }
                    expect_results(modes.len() + 1)?;
                    let (mut values, mem) = scope.builder.call(mem, callee, &args, &modes);
                    values.push(mem);
                    values
                }
                "phi" => {
                    expect_results(1)?;
                    let mode = self.read_mode()?;
                    let pos = self.pos;
                    let mut incoming = Vec::new();
                    loop {
                        self.expect('[')?;
                        let value = self.read_value_name()?;
                        self.expect(',')?;
                        let block = self.read_block_name()?;
                        self.expect(']')?;
                        incoming.push((value, block));
                        if !self.try_read(',') {
                            break;
                        }
                    }
                    let phi = scope.builder.phi_placeholder(mode);
                    let block = scope.builder.current_block();
                    scope.phis.push(PendingPhi {
                        phi,
                        block,
                        incoming,
                        pos,
                    });
                    vec![phi]
                }
                other => return Err(format!("Unknown instruction '{}'", other)),
            }
        };

        for (name, value) in results.iter().zip(defined) {
            scope.define(name, value)?;
        }
        Ok(())
    }
}
