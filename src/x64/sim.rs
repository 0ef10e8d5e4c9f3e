// Differential simulator for selected and scheduled x86-64 graphs. It executes the machine
// nodes of each block in schedule order on a sparse byte-addressed memory, following control
// flow through the branch targets of the graph and binding phis on block entry from the
// predecessor edge taken. Values are 64-bit integers wrapped to their mode, floats (kept in
// double precision, rounded on 32-bit results), condition flags and memory tokens; tuple
// results are read back through their projections. Addresses combine base, scaled index,
// displacement, link-time symbols and frame slots, so folded and unfolded versions of the
// same function can be run side by side and compared. Division faults, reads of values that
// were never computed and runaway loops (a step limit) are reported as simulation errors.

use std::cmp::Ordering;

use hashbrown::HashMap;

use crate::core::error::{CompileError, CompileResult};
use crate::core::session::ConstEntity;
use crate::ir::{pn, BlockId, FrameEntity, FrameLayout, Graph, IrOp, Mode, NodeId, Relation};
use crate::sched::Schedule;

use super::ops::{MachAttr, OpType, X64Op};

/// Address of the frame pointer during simulation.
const FRAME_BASE: u64 = 0x7fff_0000;
/// First address handed out to symbols without an explicit address.
const SYMBOL_BASE: u64 = 0x1000_0000;
const DEFAULT_STEP_LIMIT: u64 = 100_000;

/// Condition flags of a compare, one ordering per signedness. `None` is unordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    signed: Option<Ordering>,
    unsigned: Option<Ordering>,
}

impl Flags {
    fn holds(self, relation: Relation, unsigned: bool) -> bool {
        let ord = if unsigned { self.unsigned } else { self.signed };
        match ord {
            Some(ord) => relation.holds(ord),
            None => relation == Relation::Ne,
        }
    }
}

/// A simulated value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimValue {
    Int(i64),
    Float(f64),
    Flags(Flags),
    Mem,
    Tuple,
}

enum Exit {
    Jump(NodeId),
    Return(Vec<SimValue>),
}

fn zext(value: i64, bits: u32) -> u64 {
    if bits >= 64 {
        value as u64
    } else {
        (value as u64) & ((1u64 << bits) - 1)
    }
}

fn sext(value: i64, bits: u32) -> i64 {
    if bits >= 64 || bits == 0 {
        value
    } else {
        let shift = 64 - bits;
        (value << shift) >> shift
    }
}

fn round_to(mode: Mode, value: f64) -> f64 {
    if mode == Mode::F32 {
        f64::from(value as f32)
    } else {
        value
    }
}

/// Truncation toward zero with the x86 "integer indefinite" result when out of range.
fn truncate_float(value: f64, bits: u32) -> i64 {
    let limit = 2f64.powi(bits as i32 - 1);
    let t = value.trunc();
    if value.is_nan() || t < -limit || t >= limit {
        sext(1i64 << (bits - 1), bits)
    } else {
        t as i64
    }
}

fn int_binop(op: X64Op, mode: Mode, left: i64, right: i64) -> CompileResult<i64> {
    let bits = mode.bits().max(8);
    let count = (right & if bits == 64 { 63 } else { 31 }) as u32;
    let value = match op {
        X64Op::Add => left.wrapping_add(right),
        X64Op::Sub => left.wrapping_sub(right),
        X64Op::IMul => left.wrapping_mul(right),
        X64Op::And => left & right,
        X64Op::Or => left | right,
        X64Op::Xor => left ^ right,
        X64Op::Shl => left.wrapping_shl(count),
        X64Op::Shr => (zext(left, bits) >> count) as i64,
        X64Op::Sar => sext(left, bits) >> count,
        X64Op::Rol => {
            let value = zext(left, bits);
            let c = count % bits;
            if c == 0 {
                value as i64
            } else {
                ((value << c) | (value >> (bits - c))) as i64
            }
        }
        _ => return Err(CompileError::simulation(format!("{} is not an integer binop", op))),
    };
    Ok(mode.wrap(value))
}

fn float_binop(op: X64Op, mode: Mode, left: f64, right: f64) -> CompileResult<f64> {
    let value = match op {
        X64Op::XAdd | X64Op::FAdd => left + right,
        X64Op::XSub | X64Op::FSub => left - right,
        X64Op::XMul | X64Op::FMul => left * right,
        X64Op::XDiv | X64Op::FDiv => left / right,
        _ => return Err(CompileError::simulation(format!("{} is not a float binop", op))),
    };
    Ok(round_to(mode, value))
}

fn int_flags(mode: Mode, left: i64, right: i64) -> Flags {
    let bits = mode.bits().max(8);
    Flags {
        signed: Some(sext(left, bits).cmp(&sext(right, bits))),
        unsigned: Some(zext(left, bits).cmp(&zext(right, bits))),
    }
}

fn float_flags(left: f64, right: f64) -> Flags {
    let ord = left.partial_cmp(&right);
    Flags {
        signed: ord,
        unsigned: ord,
    }
}

/// Executes a scheduled machine graph.
pub struct Simulator<'a> {
    graph: &'a Graph,
    schedule: &'a Schedule,
    layout: FrameLayout,
    targets: std::collections::HashMap<NodeId, BlockId>,
    phis: HashMap<BlockId, Vec<NodeId>>,
    memory: HashMap<u64, u8>,
    symbols: HashMap<String, u64>,
    next_symbol: u64,
    args: Vec<SimValue>,
    values: HashMap<NodeId, SimValue>,
    results: HashMap<(NodeId, u32), SimValue>,
    steps: u64,
    step_limit: u64,
}

impl<'a> Simulator<'a> {
    pub fn new(graph: &'a Graph, schedule: &'a Schedule) -> Self {
        let mut phis: HashMap<BlockId, Vec<NodeId>> = HashMap::new();
        for node in graph.live_nodes().filter(|&n| graph.is_phi(n)) {
            if let Some(block) = graph.block_of(node) {
                phis.entry(block).or_default().push(node);
            }
        }
        Self {
            graph,
            schedule,
            layout: graph.frame().layout(),
            targets: graph.cf_targets(),
            phis,
            memory: HashMap::new(),
            symbols: HashMap::new(),
            next_symbol: SYMBOL_BASE,
            args: Vec::new(),
            values: HashMap::new(),
            results: HashMap::new(),
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Maximum number of executed nodes before a run is aborted.
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn define_symbol(&mut self, name: impl Into<String>, address: u64) {
        self.symbols.insert(name.into(), address);
    }

    /// Address of `name`, allocating a fresh 64-byte region on first use.
    pub fn symbol_address(&mut self, name: &str) -> u64 {
        if let Some(&address) = self.symbols.get(name) {
            return address;
        }
        let address = self.next_symbol;
        self.next_symbol += 64;
        self.symbols.insert(name.to_string(), address);
        address
    }

    /// Places session constants (float literals and masks) in memory.
    pub fn load_constants(&mut self, constants: &[ConstEntity<'_>]) {
        for entity in constants {
            let address = self.symbol_address(entity.name);
            for i in 0..u64::from(entity.count.max(1)) {
                let at = address + i * u64::from(entity.size);
                self.write_int(at, entity.bits as i64, entity.size);
            }
        }
    }

    pub fn frame_address(&self, entity: FrameEntity) -> u64 {
        FRAME_BASE.wrapping_add_signed(i64::from(self.layout.offset(entity)))
    }

    pub fn write_int(&mut self, address: u64, value: i64, bytes: u32) {
        for (i, byte) in value.to_le_bytes().iter().take(bytes as usize).enumerate() {
            self.memory.insert(address.wrapping_add(i as u64), *byte);
        }
    }

    /// Reads `bytes` little-endian bytes; unwritten memory reads as zero.
    pub fn read_bytes(&self, address: u64, bytes: u32) -> u64 {
        let mut raw = [0u8; 8];
        for (i, byte) in raw.iter_mut().take(bytes as usize).enumerate() {
            *byte = self.memory.get(&address.wrapping_add(i as u64)).copied().unwrap_or(0);
        }
        u64::from_le_bytes(raw)
    }

    /// Written memory as sorted address/byte pairs.
    pub fn memory_snapshot(&self) -> Vec<(u64, u8)> {
        let mut bytes: Vec<(u64, u8)> = self.memory.iter().map(|(&a, &b)| (a, b)).collect();
        bytes.sort_unstable();
        bytes
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn read_int(&self, address: u64, mode: Mode) -> i64 {
        let bits = mode.bits().max(8);
        mode.wrap(self.read_bytes(address, bits / 8) as i64)
    }

    fn read_float(&self, address: u64, mode: Mode) -> f64 {
        if mode == Mode::F32 {
            f64::from(f32::from_bits(self.read_bytes(address, 4) as u32))
        } else {
            f64::from_bits(self.read_bytes(address, 8))
        }
    }

    fn write_float(&mut self, address: u64, value: f64, mode: Mode) {
        if mode == Mode::F32 {
            self.write_int(address, i64::from((value as f32).to_bits()), 4);
        } else {
            self.write_int(address, value.to_bits() as i64, 8);
        }
    }

    // ---------------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------------

    fn value(&self, node: NodeId) -> CompileResult<SimValue> {
        if let Some(&value) = self.values.get(&node) {
            return Ok(value);
        }
        if self.graph.mode(node) == Mode::Mem {
            return Ok(SimValue::Mem);
        }
        if self.graph.is_proj(node) {
            return self.proj_value(node);
        }
        Err(CompileError::simulation(format!(
            "{} {} used before it was computed",
            self.graph.op(node),
            node
        )))
    }

    fn proj_value(&self, proj: NodeId) -> CompileResult<SimValue> {
        let tuple = self.graph.operand(proj, 0);
        let num = self.graph.proj_num(proj).unwrap_or(0);
        if self.graph.is_ir(tuple, IrOp::Start) {
            if num == pn::START_M {
                return Ok(SimValue::Mem);
            }
            let index = (num - pn::START_ARG0) as usize;
            return self
                .args
                .get(index)
                .copied()
                .ok_or_else(|| CompileError::simulation(format!("missing argument {}", index)));
        }
        if let Some(&value) = self.results.get(&(tuple, num)) {
            return Ok(value);
        }
        if self.graph.mode(proj) == Mode::Mem {
            return Ok(SimValue::Mem);
        }
        Err(CompileError::simulation(format!(
            "projection {} of {} {} has no value",
            num,
            self.graph.op(tuple),
            tuple
        )))
    }

    fn int(&self, node: NodeId) -> CompileResult<i64> {
        match self.value(node)? {
            SimValue::Int(v) => Ok(v),
            other => Err(CompileError::simulation(format!(
                "{} is {:?}, expected an integer",
                node, other
            ))),
        }
    }

    fn float(&self, node: NodeId) -> CompileResult<f64> {
        match self.value(node)? {
            SimValue::Float(v) => Ok(v),
            other => Err(CompileError::simulation(format!(
                "{} is {:?}, expected a float",
                node, other
            ))),
        }
    }

    fn flags(&self, node: NodeId) -> CompileResult<Flags> {
        match self.value(node)? {
            SimValue::Flags(f) => Ok(f),
            other => Err(CompileError::simulation(format!(
                "{} is {:?}, expected flags",
                node, other
            ))),
        }
    }

    fn attr(&self, node: NodeId) -> CompileResult<&'a MachAttr> {
        self.graph
            .mach(node)
            .ok_or_else(|| CompileError::simulation(format!("{} has no machine attributes", node)))
    }

    fn address(&mut self, node: NodeId) -> CompileResult<u64> {
        let am = &self.attr(node)?.am;
        let no_reg = self.graph.no_reg();
        let (base, index) = (self.graph.operand(node, 0), self.graph.operand(node, 1));
        let mut address = am.offset as u64;
        if base != no_reg {
            address = address.wrapping_add(self.int(base)? as u64);
        }
        if index != no_reg {
            address = address.wrapping_add((self.int(index)? as u64) << am.scale);
        }
        if let Some(sym) = &am.symbol {
            let at = self.symbol_address(&sym.name);
            address = if sym.negated {
                address.wrapping_sub(at)
            } else {
                address.wrapping_add(at)
            };
        }
        if let Some(entity) = am.frame {
            address = address.wrapping_add(self.frame_address(entity));
        }
        Ok(address)
    }

    /// Immediate of `node`, or the value of operand `pos`.
    fn imm_or(&mut self, node: NodeId, pos: usize) -> CompileResult<i64> {
        match &self.attr(node)?.imm {
            Some(imm) => {
                let base = match &imm.symbol {
                    Some(sym) => self.symbol_address(sym) as i64,
                    None => 0,
                };
                Ok(base.wrapping_add(imm.value))
            }
            None => self.int(self.graph.operand(node, pos)),
        }
    }

    /// Relation of a flags consumer, read through the producer's operand swap.
    fn condition(&self, node: NodeId) -> CompileResult<bool> {
        let attr = self.attr(node)?;
        let flags_node = self.graph.operand(node, 0);
        let mut relation = attr.relation.unwrap_or(Relation::Ne);
        // a compare that absorbed a load exposes its flags through a projection
        let producer = self.graph.skip_proj(flags_node);
        if self.graph.mach(producer).is_some_and(|f| f.ins_permuted) {
            relation = relation.inversed();
        }
        Ok(self.flags(flags_node)?.holds(relation, attr.unsigned))
    }

    fn set_result(&mut self, node: NodeId, value: SimValue) {
        if self.graph.mode(node) == Mode::Tuple {
            self.results.insert((node, pn::RES), value);
            self.results.insert((node, pn::MEM), SimValue::Mem);
            self.values.insert(node, SimValue::Tuple);
        } else {
            self.values.insert(node, value);
        }
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    fn execute(&mut self, node: NodeId) -> CompileResult<Option<Exit>> {
        let Some(op) = self.graph.x64_op(node) else {
            return self.execute_pass_through(node);
        };
        let mode = self.graph.mode(node);
        let attr = self.attr(node)?;
        let ls_mode = attr.ls_mode.unwrap_or(mode);
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
            | X64Op::Cmp => {
                let (left, right) = match attr.op_type {
                    OpType::AmDest => {
                        let address = self.address(node)?;
                        (self.read_int(address, ls_mode), self.imm_or(node, 3)?)
                    }
                    OpType::AmSource => {
                        let address = self.address(node)?;
                        (self.int(self.graph.operand(node, 2))?, self.read_int(address, ls_mode))
                    }
                    OpType::Normal => {
                        (self.int(self.graph.operand(node, 2))?, self.imm_or(node, 3)?)
                    }
                };
                if op == X64Op::Cmp {
                    self.set_result(node, SimValue::Flags(int_flags(ls_mode, left, right)));
                    return Ok(None);
                }
                let result = int_binop(op, ls_mode, left, right)?;
                self.finish_int(node, attr.op_type, ls_mode, result)?;
            }
            X64Op::Inc | X64Op::Dec | X64Op::Neg | X64Op::Not => {
                let value = if attr.op_type == OpType::AmDest {
                    let address = self.address(node)?;
                    self.read_int(address, ls_mode)
                } else {
                    self.int(self.graph.operand(node, 2))?
                };
                let result = ls_mode.wrap(match op {
                    X64Op::Inc => value.wrapping_add(1),
                    X64Op::Dec => value.wrapping_sub(1),
                    X64Op::Neg => value.wrapping_neg(),
                    _ => !value,
                });
                self.finish_int(node, attr.op_type, ls_mode, result)?;
            }
            X64Op::Conv => {
                let src = attr.src_mode.unwrap_or(ls_mode);
                let value = if attr.op_type == OpType::AmSource {
                    let address = self.address(node)?;
                    self.read_int(address, src)
                } else {
                    src.wrap(self.int(self.graph.operand(node, 2))?)
                };
                let dst = if self.graph.mode(node) == Mode::Tuple {
                    Mode::I64
                } else {
                    mode
                };
                self.set_result(node, SimValue::Int(dst.wrap(value)));
            }
            X64Op::Lea => {
                let address = self.address(node)?;
                self.values.insert(node, SimValue::Int(mode.wrap(address as i64)));
            }
            X64Op::Load => {
                let address = self.address(node)?;
                let value = self.read_int(address, ls_mode);
                self.set_result(node, SimValue::Int(value));
            }
            X64Op::Store => {
                let address = self.address(node)?;
                let value = self.imm_or(node, 2)?;
                self.write_int(address, value, ls_mode.bits().max(8) / 8);
                self.values.insert(node, SimValue::Mem);
            }
            X64Op::Const => {
                let value = self.imm_or(node, 0)?;
                self.values.insert(node, SimValue::Int(mode.wrap(value)));
            }
            X64Op::SymConst => {
                let value = self.imm_or(node, 0)?;
                self.values.insert(node, SimValue::Int(value));
            }
            X64Op::Cltd => {
                let value = sext(self.int(self.graph.operand(node, 0))?, ls_mode.bits());
                let high = if value < 0 { -1 } else { 0 };
                self.values.insert(node, SimValue::Int(mode.wrap(high)));
            }
            X64Op::Div | X64Op::IDiv => {
                let bits = ls_mode.bits();
                let dividend = self.int(self.graph.operand(node, 0))?;
                let divisor = self.int(self.graph.operand(node, 1))?;
                let (quot, rem) = if op == X64Op::IDiv {
                    let (a, b) = (sext(dividend, bits), sext(divisor, bits));
                    if b == 0 {
                        let msg = format!("division by zero at {}", node);
                        return Err(CompileError::simulation(msg));
                    }
                    match (a.checked_div(b), a.checked_rem(b)) {
                        (Some(q), Some(r)) if ls_mode.wrap(q) == q => (q, r),
                        _ => {
                            return Err(CompileError::simulation(format!(
                                "division overflow at {}",
                                node
                            )))
                        }
                    }
                } else {
                    let (a, b) = (zext(dividend, bits), zext(divisor, bits));
                    if b == 0 {
                        let msg = format!("division by zero at {}", node);
                        return Err(CompileError::simulation(msg));
                    }
                    ((a / b) as i64, (a % b) as i64)
                };
                self.results.insert((node, pn::RES), SimValue::Int(ls_mode.wrap(quot)));
                self.results.insert((node, pn::REM), SimValue::Int(ls_mode.wrap(rem)));
                self.results.insert((node, pn::MEM), SimValue::Mem);
                self.values.insert(node, SimValue::Tuple);
            }
            X64Op::Mul1 => {
                let bits = ls_mode.bits();
                let left = self.int(self.graph.operand(node, 0))?;
                let right = self.int(self.graph.operand(node, 1))?;
                let product = if attr.unsigned {
                    (u128::from(zext(left, bits)) * u128::from(zext(right, bits))) as i128
                } else {
                    i128::from(sext(left, bits)) * i128::from(sext(right, bits))
                };
                self.results
                    .insert((node, pn::MUL_LO), SimValue::Int(ls_mode.wrap(product as i64)));
                let high = ls_mode.wrap((product >> bits) as i64);
                self.results.insert((node, pn::MUL_HI), SimValue::Int(high));
                self.values.insert(node, SimValue::Tuple);
            }
            X64Op::Setcc => {
                let holds = self.condition(node)?;
                self.values.insert(node, SimValue::Int(i64::from(holds)));
            }
            X64Op::CMov => {
                let pos = if self.condition(node)? { 2 } else { 1 };
                let value = self.value(self.graph.operand(node, pos))?;
                self.values.insert(node, value);
            }
            X64Op::Jmp => return Ok(Some(Exit::Jump(node))),
            X64Op::Jcc => {
                let num = if self.condition(node)? {
                    pn::COND_TRUE
                } else {
                    pn::COND_FALSE
                };
                let proj = self
                    .graph
                    .find_proj(node, num)
                    .ok_or_else(|| {
                        CompileError::simulation(format!(
                            "branch {} has no projection {}",
                            node, num
                        ))
                    })?;
                return Ok(Some(Exit::Jump(proj)));
            }
            X64Op::SwitchJmp => {
                let table = attr
                    .switch
                    .as_ref()
                    .ok_or_else(|| {
                        CompileError::simulation(format!("switch {} has no table", node))
                    })?;
                let index = self.int(self.graph.operand(node, 0))?;
                let num = match table.max_value() {
                    Some(max) if (0..=max).contains(&index) => table.lookup(index),
                    _ => table.default_pn,
                };
                let proj = self
                    .graph
                    .find_proj(node, num)
                    .or_else(|| self.graph.find_proj(node, table.default_pn))
                    .ok_or_else(|| {
                        CompileError::simulation(format!(
                            "switch {} has no projection {}",
                            node, num
                        ))
                    })?;
                return Ok(Some(Exit::Jump(proj)));
            }
            X64Op::Ret => {
                let values = self.graph.operands(node)[1..]
                    .iter()
                    .map(|&v| self.value(v))
                    .collect::<CompileResult<Vec<_>>>()?;
                return Ok(Some(Exit::Return(values)));
            }
            X64Op::Call => {
                let callee = attr.callee.as_deref().unwrap_or("?");
                return Err(CompileError::simulation(format!("cannot simulate call to {}", callee)));
            }
            X64Op::Keep => {}
            X64Op::Undef => {
                let value = if mode.is_float() {
                    SimValue::Float(0.0)
                } else {
                    SimValue::Int(0)
                };
                self.values.insert(node, value);
            }
            X64Op::XAdd
            | X64Op::XSub
            | X64Op::XMul
            | X64Op::XDiv
            | X64Op::FAdd
            | X64Op::FSub
            | X64Op::FMul
            | X64Op::FDiv => {
                let left = self.float(self.graph.operand(node, 2))?;
                let right = if attr.op_type == OpType::AmSource {
                    let address = self.address(node)?;
                    self.read_float(address, ls_mode)
                } else {
                    self.float(self.graph.operand(node, 3))?
                };
                let result = float_binop(op, ls_mode, left, right)?;
                self.set_result(node, SimValue::Float(result));
            }
            X64Op::XXor | X64Op::XAnd => {
                let value = self.float(self.graph.operand(node, 2))?;
                let address = self.address(node)?;
                let result = if ls_mode == Mode::F32 {
                    let mask = self.read_bytes(address, 4) as u32;
                    let bits = (value as f32).to_bits();
                    let bits = if op == X64Op::XXor { bits ^ mask } else { bits & mask };
                    f64::from(f32::from_bits(bits))
                } else {
                    let mask = self.read_bytes(address, 8);
                    let bits = value.to_bits();
                    f64::from_bits(if op == X64Op::XXor { bits ^ mask } else { bits & mask })
                };
                self.set_result(node, SimValue::Float(result));
            }
            X64Op::XCmp | X64Op::FCmp => {
                let left = self.float(self.graph.operand(node, 2))?;
                let right = if attr.op_type == OpType::AmSource {
                    let address = self.address(node)?;
                    self.read_float(address, ls_mode)
                } else {
                    self.float(self.graph.operand(node, 3))?
                };
                self.set_result(node, SimValue::Flags(float_flags(left, right)));
            }
            X64Op::XLoad | X64Op::FLd => {
                let value = match attr.float {
                    Some(value) => round_to(ls_mode, value),
                    None => {
                        let address = self.address(node)?;
                        self.read_float(address, ls_mode)
                    }
                };
                self.set_result(node, SimValue::Float(value));
            }
            X64Op::XStore | X64Op::FSt => {
                let value = self.float(self.graph.operand(node, 2))?;
                let address = self.address(node)?;
                self.write_float(address, value, ls_mode);
                self.values.insert(node, SimValue::Mem);
            }
            X64Op::Cvtsi2s => {
                let src = attr.src_mode.unwrap_or(Mode::I64);
                let value = if attr.op_type == OpType::AmSource {
                    let address = self.address(node)?;
                    self.read_int(address, src)
                } else {
                    src.wrap(self.int(self.graph.operand(node, 2))?)
                };
                let result = if mode == Mode::F32 {
                    f64::from(value as f32)
                } else {
                    value as f64
                };
                self.set_result(node, SimValue::Float(result));
            }
            X64Op::Cvtts2si => {
                let src = attr.src_mode.unwrap_or(Mode::F64);
                let value = if attr.op_type == OpType::AmSource {
                    let address = self.address(node)?;
                    self.read_float(address, src)
                } else {
                    self.float(self.graph.operand(node, 2))?
                };
                let bits = if mode.bits() == 64 { 64 } else { 32 };
                self.set_result(node, SimValue::Int(mode.wrap(truncate_float(value, bits))));
            }
            X64Op::XConv => {
                let src = attr.src_mode.unwrap_or(Mode::F64);
                let value = if attr.op_type == OpType::AmSource {
                    let address = self.address(node)?;
                    self.read_float(address, src)
                } else {
                    self.float(self.graph.operand(node, 2))?
                };
                self.set_result(node, SimValue::Float(round_to(mode, value)));
            }
            X64Op::FChs | X64Op::FAbs => {
                let value = self.float(self.graph.operand(node, 0))?;
                let result = if op == X64Op::FChs { -value } else { value.abs() };
                self.values.insert(node, SimValue::Float(result));
            }
            X64Op::Fild => {
                let address = self.address(node)?;
                let value = self.read_int(address, Mode::I64);
                self.set_result(node, SimValue::Float(value as f64));
            }
            X64Op::Fist => {
                let value = self.float(self.graph.operand(node, 2))?;
                let address = self.address(node)?;
                self.write_int(address, truncate_float(value, 64), 8);
                self.values.insert(node, SimValue::Mem);
            }
            X64Op::Fldz => {
                self.values.insert(node, SimValue::Float(0.0));
            }
            X64Op::Fld1 => {
                self.values.insert(node, SimValue::Float(1.0));
            }
        }
        Ok(None)
    }

    /// Stores an integer result: written back for destination address modes, otherwise
    /// bound to the node (or its value projection).
    fn finish_int(
        &mut self,
        node: NodeId,
        op_type: OpType,
        mode: Mode,
        result: i64,
    ) -> CompileResult<()> {
        if op_type == OpType::AmDest {
            let address = self.address(node)?;
            self.write_int(address, result, mode.bits().max(8) / 8);
            self.values.insert(node, SimValue::Mem);
        } else {
            self.set_result(node, SimValue::Int(result));
        }
        Ok(())
    }

    fn execute_pass_through(&mut self, node: NodeId) -> CompileResult<Option<Exit>> {
        match self.graph.ir_op(node) {
            Some(IrOp::Start) => {
                self.values.insert(node, SimValue::Tuple);
            }
            Some(IrOp::Proj) => {
                if !matches!(self.graph.mode(node), Mode::Ctrl) {
                    let value = self.proj_value(node)?;
                    self.values.insert(node, value);
                }
            }
            // bound on block entry
            Some(IrOp::Phi) => {}
            Some(op) if op.is_pass_through() => {}
            _ => {
                return Err(CompileError::simulation(format!(
                    "cannot simulate {} {}",
                    self.graph.op(node),
                    node
                )))
            }
        }
        Ok(None)
    }

    /// Binds the phis of `target` to their operands on the edge of `cf`.
    fn enter_block(&mut self, target: BlockId, cf: NodeId) -> CompileResult<()> {
        let Some(phis) = self.phis.get(&target).cloned() else {
            return Ok(());
        };
        let pos = self
            .graph
            .block_preds(target)
            .iter()
            .position(|&p| p == cf)
            .ok_or_else(|| {
                CompileError::simulation(format!("{} is not a predecessor of {}", cf, target))
            })?;
        let incoming = phis
            .iter()
            .map(|&phi| self.value(self.graph.operand(phi, pos)))
            .collect::<CompileResult<Vec<_>>>()?;
        for (phi, value) in phis.into_iter().zip(incoming) {
            self.values.insert(phi, value);
        }
        Ok(())
    }

    /// Runs the function on `args` and returns the values of the executed return.
    pub fn run(&mut self, args: &[SimValue]) -> CompileResult<Vec<SimValue>> {
        self.args = args.to_vec();
        self.values.clear();
        self.results.clear();
        self.steps = 0;
        let schedule = self.schedule;
        let mut block = self.graph.start_block();
        loop {
            let mut exit = None;
            for node in schedule.iter(block) {
                self.steps += 1;
                if self.steps > self.step_limit {
                    return Err(CompileError::simulation(format!(
                        "step limit of {} exceeded in {}",
                        self.step_limit, block
                    )));
                }
                if let Some(e) = self.execute(node)? {
                    exit = Some(e);
                }
            }
            match exit {
                Some(Exit::Return(values)) => {
                    log::trace!("{} returned after {} steps", self.graph.name(), self.steps);
                    return Ok(values);
                }
                Some(Exit::Jump(cf)) => {
                    let target = self
                        .targets
                        .get(&cf)
                        .copied()
                        .ok_or_else(|| {
                            CompileError::simulation(format!("jump {} has no target", cf))
                        })?;
                    self.enter_block(target, cf)?;
                    block = target;
                }
                None => {
                    return Err(CompileError::simulation(format!("block {} has no exit", block)))
                }
            }
        }
    }

    /// [`Simulator::run`] with integer arguments and results.
    pub fn run_ints(&mut self, args: &[i64]) -> CompileResult<Vec<i64>> {
        let args: Vec<SimValue> = args.iter().map(|&a| SimValue::Int(a)).collect();
        self.run(&args)?
            .into_iter()
            .map(|v| match v {
                SimValue::Int(i) => Ok(i),
                other => Err(CompileError::simulation(format!(
                    "returned {:?}, expected an integer",
                    other
                ))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CodegenOptions;
    use crate::core::session::CompilationSession;
    use crate::ir::GraphBuilder;
    use crate::sched::{list_schedule, GenericTarget, TrivialHeuristic};
    use crate::x64::select_graph;
    use bumpalo::Bump;

    fn compile(mut graph: Graph) -> (Graph, Schedule) {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        select_graph(&mut graph, &session, &CodegenOptions::default()).unwrap();
        let schedule = list_schedule(&graph, &GenericTarget, &mut TrivialHeuristic).unwrap();
        (graph, schedule)
    }

    #[test]
    fn test_arithmetic() {
        let mut b = GraphBuilder::new("f", &[Mode::I32, Mode::I32]);
        let (x, y) = (b.arg(0), b.arg(1));
        let sum = b.add(x, y);
        let three = b.konst(Mode::I32, 3);
        let product = b.mul(sum, three);
        let mem = b.initial_mem();
        b.ret(mem, &[product]);
        let (graph, schedule) = compile(b.finish());

        let mut sim = Simulator::new(&graph, &schedule);
        assert_eq!(sim.run_ints(&[2, 5]).unwrap(), vec![21]);
        let wrapped = i64::from(i32::MAX.wrapping_mul(3));
        assert_eq!(sim.run_ints(&[i64::from(i32::MAX), 0]).unwrap(), vec![wrapped]);
    }

    #[test]
    fn test_frame_slot_round_trip() {
        let mut b = GraphBuilder::new("f", &[Mode::I64]);
        let slot = b.alloc_slot("tmp", 8, 8);
        let ptr = b.frame_addr(slot);
        let mem = b.initial_mem();
        let mem = b.store(mem, ptr, b.arg(0));
        let (value, mem) = b.load(mem, ptr, Mode::I64);
        b.ret(mem, &[value]);
        let (graph, schedule) = compile(b.finish());

        let mut sim = Simulator::new(&graph, &schedule);
        assert_eq!(sim.run_ints(&[-9]).unwrap(), vec![-9]);
        let at = sim.frame_address(slot);
        assert_eq!(sim.read_bytes(at, 8) as i64, -9);
    }

    #[test]
    fn test_division_by_zero_is_reported() {
        let mut b = GraphBuilder::new("f", &[Mode::I32, Mode::I32]);
        let mem = b.initial_mem();
        let (quot, mem) = b.div(mem, b.arg(0), b.arg(1));
        b.ret(mem, &[quot]);
        let (graph, schedule) = compile(b.finish());

        let mut sim = Simulator::new(&graph, &schedule);
        assert_eq!(sim.run_ints(&[-7, 2]).unwrap(), vec![-3]);
        let err = sim.run_ints(&[1, 0]).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_step_limit_stops_long_loops() {
        let mut b = GraphBuilder::new("count", &[Mode::I64]);
        let head = b.new_block("head");
        let exit = b.new_block("exit");
        let zero = b.konst(Mode::I64, 0);
        b.jmp(head);

        b.switch_to(head);
        let i = b.phi_placeholder(Mode::I64);
        let one = b.konst(Mode::I64, 1);
        let next = b.add(i, one);
        let cmp = b.cmp(Relation::Lt, next, b.arg(0));
        b.cond(cmp, head, exit);
        b.set_phi_operands(i, &[zero, next]);

        b.switch_to(exit);
        let mem = b.initial_mem();
        b.ret(mem, &[next]);
        let (graph, schedule) = compile(b.finish());

        let mut sim = Simulator::new(&graph, &schedule);
        assert_eq!(sim.run_ints(&[10]).unwrap(), vec![10]);
        let mut sim = Simulator::new(&graph, &schedule).with_step_limit(500);
        let err = sim.run_ints(&[1_000_000]).unwrap_err();
        assert!(err.to_string().contains("step limit"));
    }

    #[test]
    fn test_truncation_saturates_to_indefinite() {
        assert_eq!(truncate_float(-2.9, 64), -2);
        assert_eq!(truncate_float(f64::NAN, 32), i64::from(i32::MIN));
        assert_eq!(truncate_float(1e30, 64), i64::MIN);
    }
}
