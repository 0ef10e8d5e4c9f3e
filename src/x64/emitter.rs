// This module prints AT&T assembly for a selected and scheduled function. Blocks are laid
// out in reverse post-order; every block's scheduled nodes are emitted in order through the
// emitf template engine, whose conversions name registers, addresses, immediates, labels and
// width suffixes of the node being emitted. Register names come from an optional
// RegisterMap handed over by a register allocator; without one every value prints as a
// virtual %v<n> register. Two-address operations copy their left operand into the result
// first, jumps to the next block in layout are elided and a conditional jump whose true
// target falls through is emitted with the negated condition. Frame slots are addressed
// relative to %rbp; functions with a non-empty frame get the matching prologue and epilogue.
// Jump tables are emitted after the function, constants created by the session once per
// module through emit_constants.

use std::fmt::Write as _;

use hashbrown::HashMap;

use crate::core::error::{CompileError, CompileResult};
use crate::core::session::ConstEntity;
use crate::ir::{pn, reverse_postorder, BlockId, FrameLayout, Graph, Mode, NodeId, Relation};
use crate::sched::Schedule;

use super::ops::{MachAttr, OpType, X64Op};
use super::regs::{mode_reg_bits, AsmReg, RegisterMap};

/// Argument of an [`AsmEmitter::emitf`] conversion.
#[derive(Debug, Clone, Copy)]
pub enum FmtArg<'a> {
    /// `%R`: a register at the given access width.
    Reg(AsmReg, u32),
    /// `%S*`: an operand position.
    Pos(usize),
    /// `%E`: an entity or symbol name.
    Entity(&'a str),
    /// `%d`
    Int(i64),
    /// `%u`
    Uint(u64),
    /// `%s`
    Str(&'a str),
}

/// Where the second source of an instruction comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Src {
    Imm,
    Reg(usize),
    Mem,
}

impl Src {
    fn template(self) -> &'static str {
        match self {
            Src::Imm => "%C",
            Src::Reg(2) => "%S2",
            Src::Reg(_) => "%S3",
            Src::Mem => "%A",
        }
    }
}

fn int_suffix(bits: u32) -> Option<&'static str> {
    match bits {
        8 => Some("b"),
        16 => Some("w"),
        32 => Some("l"),
        64 => Some("q"),
        _ => None,
    }
}

fn sse_suffix(mode: Mode) -> &'static str {
    if mode.bits() == 32 {
        "s"
    } else {
        "d"
    }
}

/// Condition code of `relation` for signed or unsigned operands.
fn condition_code(relation: Relation, unsigned: bool) -> &'static str {
    match (relation, unsigned) {
        (Relation::Eq, _) => "e",
        (Relation::Ne, _) => "ne",
        (Relation::Lt, false) => "l",
        (Relation::Le, false) => "le",
        (Relation::Gt, false) => "g",
        (Relation::Ge, false) => "ge",
        (Relation::Lt, true) => "b",
        (Relation::Le, true) => "be",
        (Relation::Gt, true) => "a",
        (Relation::Ge, true) => "ae",
    }
}

/// Sign or zero extending move from a `src`-wide value into a `dst_bits` register.
fn extend_mnemonic(src: Mode, dst_bits: u32) -> &'static str {
    let wide = dst_bits == 64;
    match (src.bits(), src.is_signed()) {
        (8, true) if wide => "movsbq",
        (8, true) => "movsbl",
        (8, false) if wide => "movzbq",
        (8, false) => "movzbl",
        (16, true) if wide => "movswq",
        (16, true) => "movswl",
        (16, false) if wide => "movzwq",
        (16, false) => "movzwl",
        (32, true) if wide => "movslq",
        (32, _) => "movl",
        _ => "movq",
    }
}

fn int_mnemonic(op: X64Op) -> Option<&'static str> {
    Some(match op {
        X64Op::Add => "add",
        X64Op::Sub => "sub",
        X64Op::IMul => "imul",
        X64Op::And => "and",
        X64Op::Or => "or",
        X64Op::Xor => "xor",
        X64Op::Shl => "shl",
        X64Op::Shr => "shr",
        X64Op::Sar => "sar",
        X64Op::Rol => "rol",
        X64Op::Cmp => "cmp",
        X64Op::Inc => "inc",
        X64Op::Dec => "dec",
        X64Op::Neg => "neg",
        X64Op::Not => "not",
        _ => return None,
    })
}

/// AT&T assembly printer for one scheduled function.
pub struct AsmEmitter<'a> {
    graph: &'a Graph,
    schedule: &'a Schedule,
    regs: Option<&'a RegisterMap>,
    verbose: bool,
    layout: FrameLayout,
    order: Vec<BlockId>,
    next_block: HashMap<BlockId, BlockId>,
    targets: std::collections::HashMap<NodeId, BlockId>,
    /// Jump tables emitted after the function: label and entry labels.
    tables: Vec<(String, Vec<String>)>,
    out: String,
    lines: usize,
}

impl<'a> AsmEmitter<'a> {
    pub fn new(graph: &'a Graph, schedule: &'a Schedule) -> Self {
        let order: Vec<BlockId> = reverse_postorder(graph)
            .into_iter()
            .filter(|&b| b != graph.end_block())
            .collect();
        let next_block = order.windows(2).map(|w| (w[0], w[1])).collect();
        Self {
            graph,
            schedule,
            regs: None,
            verbose: false,
            layout: graph.frame().layout(),
            order,
            next_block,
            targets: graph.cf_targets(),
            tables: Vec::new(),
            out: String::new(),
            lines: 0,
        }
    }

    /// Prints registers assigned by an allocator instead of virtual names.
    pub fn with_registers(mut self, regs: &'a RegisterMap) -> Self {
        self.regs = Some(regs);
        self
    }

    /// Annotates every instruction with the node it was emitted for.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Instruction lines emitted so far.
    pub fn line_count(&self) -> usize {
        self.lines
    }

    /// Text emitted so far.
    pub fn output(&self) -> &str {
        &self.out
    }

    fn label(&self, block: BlockId) -> String {
        format!(".L{}_{}", self.graph.name(), block)
    }

    fn attr(&self, node: NodeId) -> CompileResult<&'a MachAttr> {
        self.graph
            .mach(node)
            .ok_or_else(|| {
                CompileError::emit(format!(
                    "{} {} has no machine attributes",
                    self.graph.op(node),
                    node
                ))
            })
    }

    // ---------------------------------------------------------------------
    // Template engine
    // ---------------------------------------------------------------------

    /// Emits one or more instruction lines for `node` from the template `fmt`. A newline
    /// in the template starts a new line.
    pub fn emitf(&mut self, node: NodeId, fmt: &str, args: &[FmtArg<'_>]) -> CompileResult<()> {
        let bad_arg = |conv: char| {
            CompileError::emit(format!("missing or mistyped argument for %{} in '{}'", conv, fmt))
        };
        let mut line = String::from("\t");
        let mut args = args.iter();
        let mut chars = fmt.chars();
        while let Some(c) = chars.next() {
            match c {
                '\n' => {
                    self.finish_line(node, &mut line);
                    line.push('\t');
                }
                '%' => {
                    let conv = chars
                        .next()
                        .ok_or_else(|| {
                            CompileError::emit(format!("format '{}' ends in '%'", fmt))
                        })?;
                    match conv {
                        '%' => line.push('%'),
                        'R' => match args.next() {
                            Some(FmtArg::Reg(reg, bits)) => {
                                line.push('%');
                                line.push_str(reg.name(*bits));
                            }
                            _ => return Err(bad_arg('R')),
                        },
                        'D' => {
                            let n = chars
                                .next()
                                .and_then(|d| d.to_digit(10))
                                .ok_or_else(|| {
                                    CompileError::emit(format!(
                                        "%D needs an output number in '{}'",
                                        fmt
                                    ))
                                })?;
                            let value = self.dest(node, n)?;
                            line.push_str(&self.value_name(value)?);
                        }
                        'S' => {
                            let pos = match chars.next() {
                                Some('*') => match args.next() {
                                    Some(FmtArg::Pos(pos)) => *pos,
                                    _ => return Err(bad_arg('S')),
                                },
                                Some(d) if d.is_ascii_digit() => d as usize - '0' as usize,
                                _ => {
                                    return Err(CompileError::emit(format!(
                                        "%S needs an operand position in '{}'",
                                        fmt
                                    )))
                                }
                            };
                            let operand = self.graph.operands(node).get(pos).copied();
                            let operand = operand.ok_or_else(|| {
                                CompileError::emit(format!(
                                    "{} {} has no operand {}",
                                    self.graph.op(node),
                                    node,
                                    pos
                                ))
                            })?;
                            line.push_str(&self.value_name(operand)?);
                        }
                        'E' => match args.next() {
                            Some(FmtArg::Entity(name)) => line.push_str(name),
                            _ => return Err(bad_arg('E')),
                        },
                        'L' => {
                            let target = self.targets.get(&node).copied().ok_or_else(|| {
                                CompileError::emit(format!(
                                    "{} {} has no branch target",
                                    self.graph.op(node),
                                    node
                                ))
                            })?;
                            line.push_str(&self.label(target));
                        }
                        'A' => line.push_str(&self.address(node)?),
                        'C' => line.push_str(&self.immediate(node)?),
                        'M' => line.push_str(self.suffix(node)?),
                        'd' => match args.next() {
                            Some(FmtArg::Int(v)) => {
                                let _ = write!(line, "{}", v);
                            }
                            _ => return Err(bad_arg('d')),
                        },
                        'u' => match args.next() {
                            Some(FmtArg::Uint(v)) => {
                                let _ = write!(line, "{}", v);
                            }
                            _ => return Err(bad_arg('u')),
                        },
                        's' => match args.next() {
                            Some(FmtArg::Str(s)) => line.push_str(s),
                            _ => return Err(bad_arg('s')),
                        },
                        other => {
                            return Err(CompileError::emit(format!(
                                "unknown format conversion '%{}' in '{}'",
                                other, fmt
                            )))
                        }
                    }
                }
                c => line.push(c),
            }
        }
        self.finish_line(node, &mut line);
        Ok(())
    }

    fn finish_line(&mut self, node: NodeId, line: &mut String) {
        if self.verbose {
            let _ = write!(line, "\t/* {} */", node);
        }
        self.out.push_str(line);
        self.out.push('\n');
        self.lines += 1;
        line.clear();
    }

    fn raw_line(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// Node that holds the register of `value`: results of address-mode tuples are named
    /// by the operation itself.
    fn canonical(&self, value: NodeId) -> NodeId {
        if self.graph.is_proj(value) {
            let tuple = self.graph.operand(value, 0);
            if self.graph.x64_op(tuple).is_some_and(|op| op.is_binop() || op.is_unop()) {
                return tuple;
            }
        }
        value
    }

    /// Value node of output `n` of `node`.
    fn dest(&self, node: NodeId, n: u32) -> CompileResult<NodeId> {
        let proj = match self.graph.x64_op(node) {
            Some(op) if op.is_load() && n == 0 => {
                return Ok(self.graph.find_proj(node, pn::RES).unwrap_or(node))
            }
            Some(X64Op::Mul1) => {
                self.graph.find_proj(node, if n == 0 { pn::MUL_LO } else { pn::MUL_HI })
            }
            Some(X64Op::Div | X64Op::IDiv) => {
                self.graph.find_proj(node, if n == 0 { pn::RES } else { pn::REM })
            }
            _ if n == 0 => return Ok(node),
            _ => None,
        };
        proj.ok_or_else(|| {
            CompileError::emit(format!("{} {} has no output {}", self.graph.op(node), node, n))
        })
    }

    fn value_bits(&self, value: NodeId) -> u32 {
        let mode = self.graph.mode(value);
        if mode.bits() >= 8 {
            return mode_reg_bits(mode);
        }
        self.graph
            .mach(value)
            .and_then(|attr| attr.ls_mode)
            .map(mode_reg_bits)
            .unwrap_or(64)
    }

    fn register_of(&self, value: NodeId) -> CompileResult<Option<AsmReg>> {
        let value = self.canonical(value);
        match self.regs {
            None => Ok(None),
            Some(regs) => regs
                .get(value)
                .map(Some)
                .ok_or_else(|| CompileError::emit(format!("no register assigned to {}", value))),
        }
    }

    fn reg_name(&self, value: NodeId, bits: u32) -> CompileResult<String> {
        if value == self.graph.no_reg() {
            return Err(CompileError::emit("NoReg has no register"));
        }
        Ok(match self.register_of(value)? {
            Some(reg) => format!("%{}", reg.name(bits)),
            None => format!("%v{}", self.canonical(value).0),
        })
    }

    fn value_name(&self, value: NodeId) -> CompileResult<String> {
        self.reg_name(value, self.value_bits(self.canonical(value)))
    }

    /// AT&T memory operand `symbol+offset(base,index,scale)` of `node`.
    fn address(&self, node: NodeId) -> CompileResult<String> {
        let am = &self.attr(node)?.am;
        let no_reg = self.graph.no_reg();
        let (base, index) = (self.graph.operand(node, 0), self.graph.operand(node, 1));
        let mut offset = am.offset;
        let base_name = match am.frame {
            Some(entity) => {
                offset += i64::from(self.layout.offset(entity));
                Some("%rbp".to_string())
            }
            None if base != no_reg => Some(self.reg_name(base, 64)?),
            None => None,
        };
        let index_name = if index != no_reg {
            Some(self.reg_name(index, 64)?)
        } else {
            None
        };

        let mut text = String::new();
        match &am.symbol {
            Some(sym) => {
                if sym.negated {
                    text.push('-');
                }
                text.push_str(&sym.name);
                if offset != 0 {
                    let _ = write!(text, "{:+}", offset);
                }
            }
            None if offset != 0 || (base_name.is_none() && index_name.is_none()) => {
                let _ = write!(text, "{}", offset);
            }
            None => {}
        }
        match (base_name, index_name) {
            (None, None) => {
                if am.symbol.as_ref().is_some_and(|s| !s.negated) {
                    text.push_str("(%rip)");
                }
            }
            (Some(base), None) => {
                let _ = write!(text, "({})", base);
            }
            (base, Some(index)) => {
                let base = base.unwrap_or_default();
                let _ = write!(text, "({},{},{})", base, index, 1u32 << am.scale);
            }
        }
        Ok(text)
    }

    fn immediate(&self, node: NodeId) -> CompileResult<String> {
        let imm = self
            .attr(node)?
            .imm
            .as_ref()
            .ok_or_else(|| {
                CompileError::emit(format!("{} {} has no immediate", self.graph.op(node), node))
            })?;
        Ok(match &imm.symbol {
            Some(sym) if imm.value != 0 => format!("${}{:+}", sym, imm.value),
            Some(sym) => format!("${}", sym),
            None => format!("${}", imm.value),
        })
    }

    fn suffix(&self, node: NodeId) -> CompileResult<&'static str> {
        let bits = self
            .graph
            .mach(node)
            .and_then(|attr| attr.ls_mode)
            .map(|mode| mode.bits())
            .unwrap_or_else(|| self.graph.mode(node).bits());
        int_suffix(bits).ok_or_else(|| {
            CompileError::emit(format!("{} {} has no access width", self.graph.op(node), node))
        })
    }

    /// Condition code of a flags consumer, read through the producer's operand swap.
    fn cond_code(&self, node: NodeId) -> CompileResult<&'static str> {
        let attr = self.attr(node)?;
        let mut relation = attr
            .relation
            .ok_or_else(|| {
                CompileError::emit(format!("{} {} has no relation", self.graph.op(node), node))
            })?;
        let flags = self.graph.skip_proj(self.graph.operand(node, 0));
        if self.graph.mach(flags).is_some_and(|f| f.ins_permuted) {
            relation = relation.inversed();
        }
        Ok(condition_code(relation, attr.unsigned))
    }

    fn same_register(&self, a: NodeId, b: NodeId) -> bool {
        match (self.register_of(a), self.register_of(b)) {
            (Ok(Some(ra)), Ok(Some(rb))) => ra == rb,
            _ => false,
        }
    }

    /// Copies operand `pos` into the result of a two-address operation.
    fn copy_to_dest(&mut self, node: NodeId, pos: usize, mov: &str) -> CompileResult<()> {
        let operand = self.graph.operand(node, pos);
        if self.same_register(operand, node) {
            return Ok(());
        }
        self.emitf(node, "%s %S*, %D0", &[FmtArg::Str(mov), FmtArg::Pos(pos)])
    }

    // ---------------------------------------------------------------------
    // Instructions
    // ---------------------------------------------------------------------

    fn second_source(&self, attr: &MachAttr) -> Src {
        if attr.op_type == OpType::AmSource {
            Src::Mem
        } else if attr.imm.is_some() {
            Src::Imm
        } else {
            Src::Reg(3)
        }
    }

    fn emit_int_binop(&mut self, node: NodeId, op: X64Op) -> CompileResult<()> {
        let attr = self.attr(node)?;
        let mnemonic = int_mnemonic(op)
            .ok_or_else(|| CompileError::emit(format!("no mnemonic for {}", op)))?;
        let src = self.second_source(attr);

        if op == X64Op::Cmp {
            let tmpl = format!("{}%M {}, %S2", mnemonic, src.template());
            return self.emitf(node, &tmpl, &[]);
        }
        if op.is_shift() && src == Src::Reg(3) {
            // variable counts live in %cl
            self.emitf(node, "mov %S3, %R", &[FmtArg::Reg(AsmReg::RCX, 64)])?;
            if attr.op_type == OpType::AmDest {
                let args = [FmtArg::Str(mnemonic), FmtArg::Reg(AsmReg::RCX, 8)];
                return self.emitf(node, "%s%M %R, %A", &args);
            }
            self.copy_to_dest(node, 2, "mov")?;
            let args = [FmtArg::Str(mnemonic), FmtArg::Reg(AsmReg::RCX, 8)];
            return self.emitf(node, "%s%M %R, %D0", &args);
        }
        if attr.op_type == OpType::AmDest {
            let tmpl = format!("{}%M {}, %A", mnemonic, src.template());
            return self.emitf(node, &tmpl, &[]);
        }
        self.copy_to_dest(node, 2, "mov")?;
        let tmpl = format!("{}%M {}, %D0", mnemonic, src.template());
        self.emitf(node, &tmpl, &[])
    }

    fn emit_int_unop(&mut self, node: NodeId, op: X64Op) -> CompileResult<()> {
        let attr = self.attr(node)?;
        let mnemonic = int_mnemonic(op)
            .ok_or_else(|| CompileError::emit(format!("no mnemonic for {}", op)))?;
        if attr.op_type == OpType::AmDest {
            return self.emitf(node, "%s%M %A", &[FmtArg::Str(mnemonic)]);
        }
        self.copy_to_dest(node, 2, "mov")?;
        self.emitf(node, "%s%M %D0", &[FmtArg::Str(mnemonic)])
    }

    fn emit_conv(&mut self, node: NodeId) -> CompileResult<()> {
        let attr = self.attr(node)?;
        let src = attr.src_mode.unwrap_or(Mode::I64);
        let mnemonic = extend_mnemonic(src, self.value_bits(node));
        if attr.op_type == OpType::AmSource {
            return self.emitf(node, "%s %A, %D0", &[FmtArg::Str(mnemonic)]);
        }
        self.emitf(node, "%s %S2, %D0", &[FmtArg::Str(mnemonic)])
    }

    fn emit_sse(&mut self, node: NodeId, op: X64Op) -> CompileResult<()> {
        let attr = self.attr(node)?;
        let mode = attr.ls_mode.unwrap_or(Mode::F64);
        let s = sse_suffix(mode);
        let src = if attr.op_type == OpType::AmSource { Src::Mem } else { Src::Reg(3) };
        let tmpl = match op {
            X64Op::XCmp => format!("ucomis{} {}, %S2", s, src.template()),
            X64Op::XAdd | X64Op::XSub | X64Op::XMul | X64Op::XDiv => {
                let name = match op {
                    X64Op::XAdd => "add",
                    X64Op::XSub => "sub",
                    X64Op::XMul => "mul",
                    _ => "div",
                };
                self.copy_to_dest(node, 2, if s == "s" { "movss" } else { "movsd" })?;
                format!("{}s{} {}, %D0", name, s, src.template())
            }
            X64Op::XXor | X64Op::XAnd => {
                let name = if op == X64Op::XXor { "xor" } else { "and" };
                self.copy_to_dest(node, 2, if s == "s" { "movaps" } else { "movapd" })?;
                format!("{}p{} {}, %D0", name, s, src.template())
            }
            X64Op::XLoad => format!("movs{} %A, %D0", s),
            X64Op::XStore => format!("movs{} %S2, %A", s),
            X64Op::Cvtsi2s => {
                let from = attr.src_mode.map(|m| m.bits()).unwrap_or(64);
                let width = if from == 64 { "q" } else { "l" };
                let dst = sse_suffix(self.graph.mode(node));
                let src = if attr.op_type == OpType::AmSource { Src::Mem } else { Src::Reg(2) };
                format!("cvtsi2s{}{} {}, %D0", dst, width, src.template())
            }
            X64Op::Cvtts2si => {
                let from = sse_suffix(attr.src_mode.unwrap_or(Mode::F64));
                let width = int_suffix(self.value_bits(node)).unwrap_or("q");
                let src = if attr.op_type == OpType::AmSource { Src::Mem } else { Src::Reg(2) };
                format!("cvtts{}2si{} {}, %D0", from, width, src.template())
            }
            X64Op::XConv => {
                let from = sse_suffix(attr.src_mode.unwrap_or(Mode::F64));
                let to = sse_suffix(self.graph.mode(node));
                let src = if attr.op_type == OpType::AmSource { Src::Mem } else { Src::Reg(2) };
                format!("cvts{}2s{} {}, %D0", from, to, src.template())
            }
            _ => return Err(CompileError::emit(format!("{} is not an SSE operation", op))),
        };
        self.emitf(node, &tmpl, &[])
    }

    /// x87 values are printed as the slots the stack is spilled to; every operation loads
    /// its inputs onto the stack and pops its result into the destination.
    fn emit_x87(&mut self, node: NodeId, op: X64Op) -> CompileResult<()> {
        let width = |mode: Option<Mode>| if mode.map(|m| m.bits()) == Some(32) { "s" } else { "l" };
        match op {
            X64Op::FAdd | X64Op::FSub | X64Op::FMul | X64Op::FDiv => {
                let name = match op {
                    X64Op::FAdd => "fadd",
                    X64Op::FSub => "fsub",
                    X64Op::FMul => "fmul",
                    _ => "fdiv",
                };
                self.emitf(node, "fld %S2\n%s %S3\nfstp %D0", &[FmtArg::Str(name)])
            }
            X64Op::FCmp => {
                self.emitf(node, "fld %S3\nfld %S2\nfucomip %%st(1), %%st\nfstp %%st(0)", &[])
            }
            X64Op::FChs => self.emitf(node, "fld %S0\nfchs\nfstp %D0", &[]),
            X64Op::FAbs => self.emitf(node, "fld %S0\nfabs\nfstp %D0", &[]),
            X64Op::FLd => {
                let w = width(self.attr(node)?.ls_mode);
                self.emitf(node, "fld%s %A\nfstp %D0", &[FmtArg::Str(w)])
            }
            X64Op::FSt => {
                let w = width(self.attr(node)?.ls_mode);
                self.emitf(node, "fld %S2\nfstp%s %A", &[FmtArg::Str(w)])
            }
            X64Op::Fild => self.emitf(node, "fildll %A\nfstp %D0", &[]),
            X64Op::Fist => self.emitf(node, "fld %S2\nfisttpll %A", &[]),
            X64Op::Fldz => self.emitf(node, "fldz\nfstp %D0", &[]),
            X64Op::Fld1 => self.emitf(node, "fld1\nfstp %D0", &[]),
            _ => Err(CompileError::emit(format!("{} is not an x87 operation", op))),
        }
    }

    fn emit_jcc(&mut self, node: NodeId) -> CompileResult<()> {
        let missing = |what: &str| {
            CompileError::emit(format!("conditional jump {} has no {} projection", node, what))
        };
        let mut proj_true =
            self.graph.find_proj(node, pn::COND_TRUE).ok_or_else(|| missing("true"))?;
        let mut proj_false =
            self.graph.find_proj(node, pn::COND_FALSE).ok_or_else(|| missing("false"))?;
        let attr = self.attr(node)?;
        let mut relation = attr.relation.unwrap_or(Relation::Ne);
        let flags = self.graph.skip_proj(self.graph.operand(node, 0));
        if self.graph.mach(flags).is_some_and(|f| f.ins_permuted) {
            relation = relation.inversed();
        }
        let block = self.graph.block_of(node);
        let next = block.and_then(|b| self.next_block.get(&b).copied());
        if next.is_some() && self.targets.get(&proj_true).copied() == next {
            // the false edge keeps the jump, the true one falls through
            std::mem::swap(&mut proj_true, &mut proj_false);
            relation = relation.negated();
        }
        let cc = condition_code(relation, attr.unsigned);
        self.emitf(proj_true, "j%s %L", &[FmtArg::Str(cc)])?;
        self.emit_jump(proj_false)
    }

    fn emit_jump(&mut self, cf: NodeId) -> CompileResult<()> {
        let target = self.targets.get(&cf).copied();
        let next = self.graph.block_of(cf).and_then(|b| self.next_block.get(&b).copied());
        if target.is_some() && target == next {
            if self.verbose {
                self.emitf(cf, "/* fallthrough to %L */", &[])?;
            }
            return Ok(());
        }
        self.emitf(cf, "jmp %L", &[])
    }

    fn emit_switch(&mut self, node: NodeId) -> CompileResult<()> {
        let table = self
            .attr(node)?
            .switch
            .clone()
            .ok_or_else(|| CompileError::emit(format!("switch {} has no table", node)))?;
        let default = self
            .graph
            .find_proj(node, table.default_pn)
            .ok_or_else(|| {
                CompileError::emit(format!("switch {} has no default projection", node))
            })?;
        let Some(max) = table.max_value() else {
            return self.emitf(default, "jmp %L", &[]);
        };
        let mut entries = Vec::new();
        for value in 0..=max {
            let proj = self.graph.find_proj(node, table.lookup(value)).unwrap_or(default);
            let target = self
                .targets
                .get(&proj)
                .copied()
                .ok_or_else(|| {
                    CompileError::emit(format!("switch projection {} has no target", proj))
                })?;
            entries.push(self.label(target));
        }
        let label = format!(".L{}_table{}", self.graph.name(), node.0);
        let selector = self.graph.operand(node, 0);
        let index = self.reg_name(selector, 64)?;
        let suffix = int_suffix(self.value_bits(selector)).unwrap_or("q");
        self.emitf(node, "cmp%s $%d, %S0", &[FmtArg::Str(suffix), FmtArg::Int(max)])?;
        self.emitf(default, "ja %L", &[])?;
        self.emitf(node, "jmp *%s(,%s,8)", &[FmtArg::Str(&label), FmtArg::Str(&index)])?;
        self.tables.push((label, entries));
        Ok(())
    }

    fn emit_node(&mut self, node: NodeId) -> CompileResult<()> {
        let Some(op) = self.graph.x64_op(node) else {
            return match self.graph.ir_op(node) {
                Some(op) if op.is_pass_through() => Ok(()),
                _ => Err(CompileError::emit(format!(
                    "cannot emit {} {}",
                    self.graph.op(node),
                    node
                ))),
            };
        };
        match op {
            X64Op::Add
            | X64Op::Sub
            | X64Op::IMul
            | X64Op::And
            | X64Op::Or
            | X64Op::Xor
            | X64Op::Shl
            | X64Op::Shr
            | X64Op::Sar
            | X64Op::Rol
            | X64Op::Cmp => self.emit_int_binop(node, op),
            X64Op::Inc | X64Op::Dec | X64Op::Neg | X64Op::Not => self.emit_int_unop(node, op),
            X64Op::Conv => self.emit_conv(node),
            X64Op::Lea => self.emitf(node, "leaq %A, %D0", &[]),
            X64Op::Load => {
                let mode = self.attr(node)?.ls_mode.unwrap_or(Mode::I64);
                let dst_bits = self.value_bits(self.dest(node, 0)?);
                if mode.bits() >= dst_bits {
                    let suffix = int_suffix(dst_bits).unwrap_or("q");
                    self.emitf(node, "mov%s %A, %D0", &[FmtArg::Str(suffix)])
                } else {
                    let mnemonic = extend_mnemonic(mode, dst_bits);
                    self.emitf(node, "%s %A, %D0", &[FmtArg::Str(mnemonic)])
                }
            }
            X64Op::Store => {
                if self.attr(node)?.imm.is_some() {
                    self.emitf(node, "mov%M %C, %A", &[])
                } else {
                    self.emitf(node, "mov%M %S2, %A", &[])
                }
            }
            X64Op::Const => {
                let value = self.attr(node)?.imm.as_ref().map(|i| i.value).unwrap_or(0);
                if i32::try_from(value).is_ok() {
                    self.emitf(node, "mov%M %C, %D0", &[])
                } else {
                    self.emitf(node, "movabsq %C, %D0", &[])
                }
            }
            X64Op::SymConst => {
                let name = self
                    .attr(node)?
                    .imm
                    .as_ref()
                    .and_then(|i| i.symbol.clone())
                    .ok_or_else(|| {
                        CompileError::emit(format!("symbol constant {} has no symbol", node))
                    })?;
                self.emitf(node, "leaq %E(%%rip), %D0", &[FmtArg::Entity(&name)])
            }
            X64Op::Cltd => {
                let bits = self.value_bits(node);
                let extend = match bits {
                    64 => "cqto",
                    32 => "cltd",
                    16 => "cwtd",
                    _ => "cbtw",
                };
                self.emitf(
                    node,
                    "mov %S0, %R\n%s\nmov %R, %D0",
                    &[
                        FmtArg::Reg(AsmReg::RAX, bits),
                        FmtArg::Str(extend),
                        FmtArg::Reg(AsmReg::RDX, bits),
                    ],
                )
            }
            X64Op::Div | X64Op::IDiv | X64Op::Mul1 => {
                let bits = self.attr(node)?.ls_mode.map(mode_reg_bits).unwrap_or(64);
                let mnemonic = match op {
                    X64Op::Div => "div",
                    X64Op::IDiv => "idiv",
                    _ if self.attr(node)?.unsigned => "mul",
                    _ => "imul",
                };
                self.emitf(node, "mov %S0, %R", &[FmtArg::Reg(AsmReg::RAX, bits)])?;
                if op != X64Op::Mul1 {
                    self.emitf(node, "mov %S2, %R", &[FmtArg::Reg(AsmReg::RDX, bits)])?;
                }
                self.emitf(node, "%s%M %S1", &[FmtArg::Str(mnemonic)])?;
                if self.dest(node, 0).is_ok() {
                    self.emitf(node, "mov %R, %D0", &[FmtArg::Reg(AsmReg::RAX, bits)])?;
                }
                if self.dest(node, 1).is_ok() {
                    self.emitf(node, "mov %R, %D1", &[FmtArg::Reg(AsmReg::RDX, bits)])?;
                }
                Ok(())
            }
            X64Op::Setcc => {
                let cc = self.cond_code(node)?;
                match self.register_of(node)? {
                    Some(reg) => {
                        self.emitf(node, "set%s %R", &[FmtArg::Str(cc), FmtArg::Reg(reg, 8)])?
                    }
                    None => self.emitf(node, "set%s %D0", &[FmtArg::Str(cc)])?,
                }
                let bits = self.value_bits(node);
                if let Some(suffix) = int_suffix(bits).filter(|_| bits > 8) {
                    match self.register_of(node)? {
                        Some(reg) => {
                            let args = [FmtArg::Str(suffix), FmtArg::Reg(reg, 8)];
                            self.emitf(node, "movzb%s %R, %D0", &args)?
                        }
                        None => self.emitf(node, "movzb%s %D0, %D0", &[FmtArg::Str(suffix)])?,
                    }
                }
                Ok(())
            }
            X64Op::CMov => {
                let cc = self.cond_code(node)?;
                self.copy_to_dest(node, 1, "mov")?;
                self.emitf(node, "cmov%s %S2, %D0", &[FmtArg::Str(cc)])
            }
            X64Op::Jmp => self.emit_jump(node),
            X64Op::Jcc => self.emit_jcc(node),
            X64Op::SwitchJmp => self.emit_switch(node),
            X64Op::Ret => {
                if self.layout.size() > 0 {
                    self.emitf(node, "leave", &[])?;
                }
                self.emitf(node, "ret", &[])
            }
            X64Op::Call => {
                let callee = self
                    .attr(node)?
                    .callee
                    .clone()
                    .ok_or_else(|| CompileError::emit(format!("call {} has no target", node)))?;
                self.emitf(node, "call %E", &[FmtArg::Entity(&callee)])
            }
            X64Op::Keep | X64Op::Undef => {
                if self.verbose {
                    self.emitf(node, "/* %s */", &[FmtArg::Str(op.name())])?;
                }
                Ok(())
            }
            X64Op::XAdd
            | X64Op::XSub
            | X64Op::XMul
            | X64Op::XDiv
            | X64Op::XXor
            | X64Op::XAnd
            | X64Op::XCmp
            | X64Op::XLoad
            | X64Op::XStore
            | X64Op::Cvtsi2s
            | X64Op::Cvtts2si
            | X64Op::XConv => self.emit_sse(node, op),
            X64Op::FAdd
            | X64Op::FSub
            | X64Op::FMul
            | X64Op::FDiv
            | X64Op::FCmp
            | X64Op::FChs
            | X64Op::FAbs
            | X64Op::FLd
            | X64Op::FSt
            | X64Op::Fild
            | X64Op::Fist
            | X64Op::Fldz
            | X64Op::Fld1 => self.emit_x87(node, op),
        }
    }

    fn emit_prologue(&mut self) -> CompileResult<()> {
        let size = self.layout.size();
        if size == 0 {
            return Ok(());
        }
        let start = self.graph.start();
        self.emitf(start, "push %R", &[FmtArg::Reg(AsmReg::RBP, 64)])?;
        self.emitf(
            start,
            "mov %R, %R",
            &[FmtArg::Reg(AsmReg::RSP, 64), FmtArg::Reg(AsmReg::RBP, 64)],
        )?;
        let args = [FmtArg::Uint(u64::from(size)), FmtArg::Reg(AsmReg::RSP, 64)];
        self.emitf(start, "sub $%u, %R", &args)
    }

    /// Emits the whole function and returns its text.
    pub fn emit_function(mut self) -> CompileResult<String> {
        let name = self.graph.name().to_string();
        log::debug!("emitting {} ({} blocks)", name, self.order.len());
        self.raw_line("\t.text");
        self.raw_line(&format!("\t.globl\t{}", name));
        self.raw_line(&format!("\t.type\t{}, @function", name));
        self.raw_line(&format!("{}:", name));
        self.emit_prologue()?;

        let order = self.order.clone();
        for (i, &block) in order.iter().enumerate() {
            if i > 0 {
                let mut label = format!("{}:", self.label(block));
                if self.verbose {
                    let _ = write!(label, "\t/* {} */", self.graph.block(block).name());
                }
                self.raw_line(&label);
            }
            for node in self.schedule.iter(block) {
                self.emit_node(node)?;
            }
        }
        self.raw_line(&format!("\t.size\t{}, .-{}", name, name));

        let tables = std::mem::take(&mut self.tables);
        if !tables.is_empty() {
            self.raw_line("\t.section\t.rodata");
            for (label, entries) in tables {
                self.raw_line("\t.p2align\t3");
                self.raw_line(&format!("{}:", label));
                for entry in entries {
                    self.raw_line(&format!("\t.quad\t{}", entry));
                }
            }
            self.raw_line("\t.text");
        }
        log::trace!("{}: {} instruction lines", name, self.lines);
        Ok(self.out)
    }
}

/// Read-only data section for the constants created during compilation.
pub fn emit_constants(constants: &[ConstEntity<'_>]) -> String {
    let mut out = String::new();
    if constants.is_empty() {
        return out;
    }
    out.push_str("\t.section\t.rodata\n");
    for entity in constants {
        let _ = writeln!(out, "\t.p2align\t4");
        let _ = writeln!(out, "{}:", entity.name);
        let directive = if entity.size == 4 { ".long" } else { ".quad" };
        for _ in 0..entity.count.max(1) {
            let _ = writeln!(out, "\t{}\t{:#x}", directive, entity.bits);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, IrOp, NodeAttr, Opcode};
    use crate::sched::{list_schedule, GenericTarget, TrivialHeuristic};
    use crate::x64::{AddrMode, AmFlavour, SymOffset};

    fn single_node_graph(attr: MachAttr) -> (Graph, NodeId) {
        let mut graph = Graph::new("f");
        let block = graph.start_block();
        let no_reg = graph.no_reg();
        let no_mem = graph.no_mem();
        let base = graph.add_node(
            Opcode::X64(X64Op::Undef),
            Mode::Ptr,
            Some(block),
            Vec::new(),
            NodeAttr::Machine(Box::default()),
        );
        let load = graph.add_node(
            Opcode::X64(X64Op::Load),
            Mode::Tuple,
            Some(block),
            vec![base, no_reg, no_mem],
            NodeAttr::Machine(Box::new(attr)),
        );
        (graph, load)
    }

    #[test]
    fn test_unknown_conversion_is_an_error() {
        let (graph, load) = single_node_graph(MachAttr::with_ls_mode(Mode::I32));
        let schedule = Schedule::new(&graph);
        let mut emitter = AsmEmitter::new(&graph, &schedule);
        let err = emitter.emitf(load, "mov %Q", &[]).unwrap_err();
        assert!(err.to_string().contains("unknown format conversion '%Q'"));
        let err = emitter.emitf(load, "mov %d", &[FmtArg::Str("x")]).unwrap_err();
        assert!(matches!(err, CompileError::Emit { .. }));
    }

    #[test]
    fn test_address_operand_forms() {
        let attr = MachAttr {
            am: AddrMode {
                offset: -8,
                symbol: Some(SymOffset {
                    name: "table".into(),
                    negated: false,
                }),
                flavour: AmFlavour::BASE | AmFlavour::OFFSET,
                ..AddrMode::default()
            },
            ls_mode: Some(Mode::I8),
            ..MachAttr::default()
        };
        let (graph, load) = single_node_graph(attr);
        let base = graph.operand(load, 0);
        let schedule = Schedule::new(&graph);
        let mut emitter = AsmEmitter::new(&graph, &schedule);
        emitter.emit_node(load).unwrap();
        assert_eq!(emitter.output(), format!("\tmovb table-8(%v{}), %v{}\n", base.0, load.0));
    }

    #[test]
    fn test_registers_from_map() {
        let (graph, load) = single_node_graph(MachAttr::with_ls_mode(Mode::U32));
        let base = graph.operand(load, 0);
        let mut regs = RegisterMap::new();
        regs.assign(base, AsmReg::gp(7));
        regs.assign(load, AsmReg::RAX);
        let schedule = Schedule::new(&graph);
        let mut emitter = AsmEmitter::new(&graph, &schedule).with_registers(&regs);
        let args = [FmtArg::Str("x"), FmtArg::Reg(AsmReg::RDX, 32)];
        emitter.emitf(load, "%%%s %A, %D0 %S0 %R", &args).unwrap();
        assert_eq!(emitter.output(), "\t%x (%rdi), %eax %rdi %edx\n");
    }

    #[test]
    fn test_branch_to_next_block_is_elided() {
        let mut b = GraphBuilder::new("f", &[Mode::I32, Mode::I32]);
        let x = b.arg(0);
        let y = b.arg(1);
        let cmp = b.cmp(Relation::Lt, x, y);
        let then_block = b.new_block("then");
        let else_block = b.new_block("else");
        b.cond(cmp, then_block, else_block);
        for block in [then_block, else_block] {
            b.switch_to(block);
            let mem = b.initial_mem();
            b.ret(mem, &[x]);
        }
        let mut graph = b.finish();

        let arena = bumpalo::Bump::new();
        let session = crate::core::session::CompilationSession::new(&arena);
        crate::x64::select_graph(&mut graph, &session, &Default::default()).unwrap();
        let schedule = list_schedule(&graph, &GenericTarget, &mut TrivialHeuristic).unwrap();
        let text = AsmEmitter::new(&graph, &schedule).emit_function().unwrap();

        // the true target is laid out next, so the negated condition jumps to the false one
        let first_succ = reverse_postorder(&graph)[1];
        if first_succ == then_block {
            assert!(text.contains("\tjge .Lf_b"), "{}", text);
        } else {
            assert!(text.contains("\tjl .Lf_b"), "{}", text);
        }
        assert!(!text.contains("jmp"), "{}", text);
        assert_eq!(text.matches("\tret").count(), 2);
        assert!(graph.live_nodes().all(|n| graph.ir_op(n) != Some(IrOp::Cond)));
    }

    #[test]
    fn test_constants_section() {
        let entity = ConstEntity {
            name: ".Lsign0",
            bits: 0x8000_0000,
            size: 4,
            count: 4,
        };
        let text = emit_constants(&[entity]);
        assert!(text.starts_with("\t.section\t.rodata\n"));
        assert_eq!(text.matches(".long\t0x80000000").count(), 4);
    }
}
