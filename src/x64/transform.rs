// This module implements instruction selection for x86-64. The selector walks the
// target-independent graph from its roots with operands first and rewrites every node
// through a closed match over its opcode: arithmetic, memory, conversion and control-flow
// nodes become machine nodes; structural nodes (Start, End, Proj, Phi, Sync and the pseudo
// values) pass through and only get their operands re-pointed once the walk is done, which
// also completes Phis whose operands are defined later in a loop. Results are memoized per
// node. After the walk, block predecessors are redirected to the selected control flow,
// every replaced node is recorded in the graph's redirection table and the old nodes are
// swept. Float operations follow the configured floating point unit; constants that need
// memory (float literals, sign and abs masks) come from the compilation session's caches.

use hashbrown::HashMap;

use crate::core::config::{CodegenOptions, FpUnit};
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::{CompilationSession, KnownConst};
use crate::ir::{pn, BlockId, FrameEntity, Graph, IrOp, Mode, NodeAttr, NodeId, Opcode, Relation};

use super::ops::{AddrMode, AmFlavour, Immediate, MachAttr, OpType, SymOffset, X64Op};

/// Largest case span a switch may cover with a single jump table.
const MAX_JUMP_TABLE_ENTRIES: i128 = 4096;

/// Selects x86-64 instructions for `graph` in place.
pub fn select_graph(
    graph: &mut Graph,
    session: &CompilationSession<'_>,
    options: &CodegenOptions,
) -> CompileResult<()> {
    log::debug!("selecting instructions for {}", graph.name());
    let order = graph.walk_postorder();
    let mut selector = Selector::new(graph, session, options);
    for node in order {
        selector.transform(node)?;
    }
    selector.finish()
}

struct Selector<'g, 's, 'arena> {
    graph: &'g mut Graph,
    session: &'s CompilationSession<'arena>,
    options: &'s CodegenOptions,
    memo: HashMap<NodeId, NodeId>,
    /// Structural nodes kept in place whose operands still point to old nodes.
    pass_through: Vec<NodeId>,
    /// Stack slot of float/int conversions that go through memory.
    scratch: Option<FrameEntity>,
    /// Last memory state of scratch slot traffic per block.
    spill_chain: HashMap<BlockId, NodeId>,
}

/// Fits a sign-extended 32-bit immediate field.
fn fits_imm32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

impl<'g, 's, 'arena> Selector<'g, 's, 'arena> {
    fn new(
        graph: &'g mut Graph,
        session: &'s CompilationSession<'arena>,
        options: &'s CodegenOptions,
    ) -> Self {
        Self {
            graph,
            session,
            options,
            memo: HashMap::new(),
            pass_through: Vec::new(),
            scratch: None,
            spill_chain: HashMap::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn func(&self) -> String {
        self.graph.name().to_string()
    }

    fn unsupported(&self, node: NodeId, reason: &'static str) -> CompileError {
        CompileError::UnsupportedNode {
            func: self.func(),
            node,
            opcode: self.graph.op(node).name(),
            mode: self.graph.mode(node),
            reason,
        }
    }

    fn no_reg(&self) -> NodeId {
        self.graph.no_reg()
    }

    fn no_mem(&self) -> NodeId {
        self.graph.no_mem()
    }

    fn mach(
        &mut self,
        op: X64Op,
        mode: Mode,
        block: Option<BlockId>,
        operands: Vec<NodeId>,
        attr: MachAttr,
    ) -> NodeId {
        let id = self.graph.add_node(
            Opcode::X64(op),
            mode,
            block,
            operands,
            NodeAttr::Machine(Box::new(attr)),
        );
        self.session.record_node_selected(op.name());
        id
    }

    fn proj(&mut self, tuple: NodeId, mode: Mode, num: u32) -> NodeId {
        let block = self.graph.block_of(tuple);
        let proj = self
            .graph
            .add_node(Opcode::Ir(IrOp::Proj), mode, block, vec![tuple], NodeAttr::Proj(num));
        self.memo.insert(proj, proj);
        proj
    }

    /// Keeps `value` alive through a Keep node in `block`.
    fn keep(&mut self, value: NodeId, block: Option<BlockId>) -> NodeId {
        let keep = self.mach(X64Op::Keep, Mode::Any, block, vec![value], MachAttr::default());
        self.graph.keep_alive(keep);
        self.session.record_keep_inserted();
        keep
    }

    fn binop_operands(&self, left: NodeId, right: NodeId) -> Vec<NodeId> {
        vec![self.no_reg(), self.no_reg(), left, right, self.no_mem()]
    }

    fn unop_operands(&self, value: NodeId) -> Vec<NodeId> {
        vec![self.no_reg(), self.no_reg(), value, self.no_mem()]
    }

    /// Immediate for the target-independent `node`, if it is a constant that fits.
    fn immediate(&self, node: NodeId) -> Option<Immediate> {
        if !self.options.immediates {
            return None;
        }
        match (self.graph.ir_op(node)?, self.graph.attr(node)) {
            (IrOp::Const, NodeAttr::Int(value)) => {
                let mode = self.graph.mode(node);
                let value = if mode.bits() <= 32 { mode.to_signed().wrap(*value) } else { *value };
                fits_imm32(value).then(|| Immediate::int(value))
            }
            (IrOp::SymConst, NodeAttr::Symbol(name)) => Some(Immediate::symbol(name.clone())),
            _ => None,
        }
    }

    fn int_immediate(&self, node: NodeId) -> Option<i64> {
        self.immediate(node).filter(|imm| imm.symbol.is_none()).map(|imm| imm.value)
    }

    /// Splits a binary operation into register operands and an immediate. Only the right
    /// side may become the immediate unless the operation commutes. Returns whether the
    /// operands were swapped.
    fn match_operands(
        &mut self,
        left: NodeId,
        right: NodeId,
        commutative: bool,
    ) -> CompileResult<(NodeId, NodeId, Option<Immediate>, bool)> {
        if let Some(imm) = self.immediate(right) {
            let l = self.transform(left)?;
            return Ok((l, self.no_reg(), Some(imm), false));
        }
        if commutative {
            if let Some(imm) = self.immediate(left) {
                let r = self.transform(right)?;
                return Ok((r, self.no_reg(), Some(imm), true));
            }
        }
        let l = self.transform(left)?;
        let r = self.transform(right)?;
        Ok((l, r, None, false))
    }

    /// Address of a load or store from the target-independent pointer `ptr`.
    fn address(&mut self, ptr: NodeId) -> CompileResult<(NodeId, AddrMode)> {
        match (self.graph.ir_op(ptr), self.graph.attr(ptr).clone()) {
            (Some(IrOp::SymConst), NodeAttr::Symbol(name)) => Ok((
                self.no_reg(),
                AddrMode {
                    symbol: Some(SymOffset { name, negated: false }),
                    flavour: AmFlavour::OFFSET,
                    ..AddrMode::default()
                },
            )),
            (Some(IrOp::FrameAddr), NodeAttr::Frame(entity)) => Ok((
                self.no_reg(),
                AddrMode {
                    frame: Some(entity),
                    flavour: AmFlavour::OFFSET,
                    ..AddrMode::default()
                },
            )),
            _ => {
                let base = self.transform(ptr)?;
                Ok((
                    base,
                    AddrMode {
                        flavour: AmFlavour::BASE,
                        ..AddrMode::default()
                    },
                ))
            }
        }
    }

    fn scratch_slot(&mut self) -> FrameEntity {
        match self.scratch {
            Some(entity) => entity,
            None => {
                let entity = self.graph.frame_mut().alloc("conv_scratch", 8, 8);
                self.scratch = Some(entity);
                entity
            }
        }
    }

    fn frame_am(entity: FrameEntity) -> AddrMode {
        AddrMode {
            frame: Some(entity),
            flavour: AmFlavour::OFFSET,
            ..AddrMode::default()
        }
    }

    fn fp_unit(&self) -> FpUnit {
        self.options.fp_unit
    }

    /// Rejects float values on a target without floating point unit.
    fn check_fp(&self, node: NodeId) -> CompileResult<()> {
        if self.fp_unit() != FpUnit::None {
            return Ok(());
        }
        let float_access =
            matches!(self.graph.attr(node), NodeAttr::Mem { mode, .. } if mode.is_float());
        let float_operand = self
            .graph
            .operands(node)
            .iter()
            .any(|&o| self.graph.mode(o).is_float());
        if self.graph.mode(node).is_float() || float_access || float_operand {
            return Err(self.unsupported(node, "no floating point unit"));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Walk
    // ---------------------------------------------------------------------

    fn transform(&mut self, node: NodeId) -> CompileResult<NodeId> {
        if let Some(&done) = self.memo.get(&node) {
            return Ok(done);
        }
        if self.graph.op(node).is_target() {
            return Ok(node);
        }
        self.check_fp(node)?;
        let new = self.select(node)?;
        self.memo.insert(node, new);
        if new != node {
            log::trace!("{} {} -> {} {}", self.graph.op(node), node, self.graph.op(new), new);
        }
        Ok(new)
    }

    fn select(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let Some(op) = self.graph.ir_op(node) else {
            return Ok(node);
        };
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        match op {
            IrOp::Start | IrOp::End | IrOp::Proj | IrOp::Sync | IrOp::NoMem | IrOp::NoReg => {
                self.pass_through.push(node);
                Ok(node)
            }
            IrOp::Phi => {
                if mode == Mode::Bool {
                    return Err(self.unsupported(node, "boolean phi must be lowered"));
                }
                self.pass_through.push(node);
                Ok(node)
            }
            IrOp::Unknown => {
                Ok(self.mach(X64Op::Undef, mode, block, Vec::new(), MachAttr::default()))
            }
            IrOp::Const => self.gen_const(node),
            IrOp::SymConst => {
                let NodeAttr::Symbol(name) = self.graph.attr(node).clone() else {
                    return Err(self.unsupported(node, "symbol constant without symbol"));
                };
                let attr = MachAttr {
                    imm: Some(Immediate::symbol(name)),
                    ..MachAttr::default()
                };
                Ok(self.mach(X64Op::SymConst, Mode::Ptr, block, Vec::new(), attr))
            }
            IrOp::FrameAddr => {
                let NodeAttr::Frame(entity) = *self.graph.attr(node) else {
                    return Err(self.unsupported(node, "frame address without entity"));
                };
                let attr = MachAttr {
                    am: Self::frame_am(entity),
                    ..MachAttr::default()
                };
                let operands = vec![self.no_reg(), self.no_reg()];
                Ok(self.mach(X64Op::Lea, Mode::Ptr, block, operands, attr))
            }
            IrOp::Add => self.gen_add(node),
            IrOp::Sub => self.gen_sub(node),
            IrOp::Mul => {
                if mode.is_float() {
                    self.gen_float_binop(node, X64Op::XMul, X64Op::FMul)
                } else {
                    self.gen_binop(node, X64Op::IMul, true)
                }
            }
            IrOp::Quot => {
                if !mode.is_float() {
                    return Err(self.unsupported(node, "integer division uses Div"));
                }
                self.gen_float_binop(node, X64Op::XDiv, X64Op::FDiv)
            }
            IrOp::Mulh => self.gen_mulh(node),
            IrOp::Div => self.gen_divmod(node, false),
            IrOp::Mod => self.gen_divmod(node, true),
            IrOp::Minus => self.gen_minus(node),
            IrOp::Abs => self.gen_abs(node),
            IrOp::Not => {
                if !mode.is_int_like() {
                    return Err(self.unsupported(node, "Not needs an integer operand"));
                }
                self.gen_unop(node, X64Op::Not)
            }
            IrOp::And | IrOp::Or | IrOp::Eor => {
                if mode.is_float() {
                    return Err(self.unsupported(node, "bitwise operation on float values"));
                }
                let op = match op {
                    IrOp::And => X64Op::And,
                    IrOp::Or => X64Op::Or,
                    _ => X64Op::Xor,
                };
                self.gen_binop(node, op, true)
            }
            IrOp::Shl | IrOp::Shr | IrOp::Shrs | IrOp::Rotl => {
                if mode.is_float() {
                    return Err(self.unsupported(node, "shift of float values"));
                }
                let op = match op {
                    IrOp::Shl => X64Op::Shl,
                    IrOp::Shr => X64Op::Shr,
                    IrOp::Shrs => X64Op::Sar,
                    _ => X64Op::Rol,
                };
                self.gen_binop(node, op, false)
            }
            IrOp::Cmp => self.gen_cmp(node),
            IrOp::Mux => self.gen_mux(node),
            IrOp::Conv => self.gen_conv(node),
            IrOp::Load => self.gen_load(node),
            IrOp::Store => self.gen_store(node),
            IrOp::Cond => {
                let sel = self.graph.operand(node, 0);
                let (flags, relation, unsigned) = self.flags_of(node, sel)?;
                let attr = MachAttr {
                    relation: Some(relation),
                    unsigned,
                    ..MachAttr::default()
                };
                Ok(self.mach(X64Op::Jcc, Mode::Tuple, block, vec![flags], attr))
            }
            IrOp::Switch => self.gen_switch(node),
            IrOp::Jmp => {
                Ok(self.mach(X64Op::Jmp, Mode::Ctrl, block, Vec::new(), MachAttr::default()))
            }
            IrOp::Return => {
                let operands = self.transform_all(node)?;
                Ok(self.mach(X64Op::Ret, Mode::Ctrl, block, operands, MachAttr::default()))
            }
            IrOp::Call => {
                let NodeAttr::Call(callee) = self.graph.attr(node).clone() else {
                    return Err(self.unsupported(node, "call without target"));
                };
                let operands = self.transform_all(node)?;
                let attr = MachAttr {
                    callee: Some(callee),
                    ..MachAttr::default()
                };
                Ok(self.mach(X64Op::Call, Mode::Tuple, block, operands, attr))
            }
            IrOp::Alloc => Err(CompileError::NotImplemented {
                func: self.func(),
                node,
                opcode: op.name(),
            }),
            IrOp::Sel | IrOp::Tuple | IrOp::Bad => Err(CompileError::MustBeLowered {
                func: self.func(),
                node,
                opcode: op.name(),
            }),
        }
    }

    fn transform_all(&mut self, node: NodeId) -> CompileResult<Vec<NodeId>> {
        let operands = self.graph.operands(node).to_vec();
        operands.into_iter().map(|o| self.transform(o)).collect()
    }

    // ---------------------------------------------------------------------
    // Rules
    // ---------------------------------------------------------------------

    fn gen_const(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        match *self.graph.attr(node) {
            NodeAttr::Float(value) => self.gen_float_const(node, value),
            NodeAttr::Int(value) => {
                Ok(self.mach(X64Op::Const, mode, block, Vec::new(), MachAttr::with_imm(value)))
            }
            _ => Err(self.unsupported(node, "constant without value")),
        }
    }

    fn gen_float_const(&mut self, node: NodeId, value: f64) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let x87 = self.fp_unit() == FpUnit::X87;
        if x87 && value.to_bits() == 0.0f64.to_bits() {
            return Ok(self.mach(X64Op::Fldz, mode, block, Vec::new(), MachAttr::default()));
        }
        if x87 && value == 1.0 {
            return Ok(self.mach(X64Op::Fld1, mode, block, Vec::new(), MachAttr::default()));
        }
        let name = self.session.float_const(value, mode.bits());
        let attr = MachAttr {
            am: AddrMode {
                symbol: Some(SymOffset {
                    name: name.to_string(),
                    negated: false,
                }),
                flavour: AmFlavour::OFFSET,
                ..AddrMode::default()
            },
            ls_mode: Some(mode),
            float: Some(value),
            ..MachAttr::default()
        };
        let op = if x87 { X64Op::FLd } else { X64Op::XLoad };
        let operands = vec![self.no_reg(), self.no_reg(), self.no_mem()];
        let load = self.mach(op, Mode::Tuple, block, operands, attr);
        Ok(self.proj(load, mode, pn::RES))
    }

    fn gen_binop(&mut self, node: NodeId, op: X64Op, commutative: bool) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let (l, r) = (self.graph.operand(node, 0), self.graph.operand(node, 1));
        let (left, right, imm, _) = self.match_operands(l, r, commutative)?;
        let attr = MachAttr {
            imm,
            ls_mode: Some(mode),
            ..MachAttr::default()
        };
        let operands = self.binop_operands(left, right);
        Ok(self.mach(op, mode, block, operands, attr))
    }

    fn gen_unop(&mut self, node: NodeId, op: X64Op) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let value = self.transform(self.graph.operand(node, 0))?;
        let operands = self.unop_operands(value);
        Ok(self.mach(op, mode, block, operands, MachAttr::with_ls_mode(mode)))
    }

    fn gen_float_binop(&mut self, node: NodeId, sse: X64Op, x87: X64Op) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let left = self.transform(self.graph.operand(node, 0))?;
        let right = self.transform(self.graph.operand(node, 1))?;
        let op = if self.fp_unit() == FpUnit::X87 { x87 } else { sse };
        let operands = self.binop_operands(left, right);
        Ok(self.mach(op, mode, block, operands, MachAttr::with_ls_mode(mode)))
    }

    /// Inc or Dec for `value` plus `delta`, when enabled and `delta` is one.
    fn gen_inc_dec(
        &mut self,
        node: NodeId,
        value: NodeId,
        delta: i64,
    ) -> CompileResult<Option<NodeId>> {
        if !self.options.inc_dec {
            return Ok(None);
        }
        let op = match delta {
            1 => X64Op::Inc,
            -1 => X64Op::Dec,
            _ => return Ok(None),
        };
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let value = self.transform(value)?;
        let operands = self.unop_operands(value);
        Ok(Some(self.mach(op, mode, block, operands, MachAttr::with_ls_mode(mode))))
    }

    fn gen_add(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        if mode.is_float() {
            return self.gen_float_binop(node, X64Op::XAdd, X64Op::FAdd);
        }
        let (l, r) = (self.graph.operand(node, 0), self.graph.operand(node, 1));
        if let Some(delta) = self.int_immediate(r) {
            if let Some(n) = self.gen_inc_dec(node, l, delta)? {
                return Ok(n);
            }
        } else if let Some(delta) = self.int_immediate(l) {
            if let Some(n) = self.gen_inc_dec(node, r, delta)? {
                return Ok(n);
            }
        }
        self.gen_binop(node, X64Op::Add, true)
    }

    fn gen_sub(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        if mode.is_float() {
            return self.gen_float_binop(node, X64Op::XSub, X64Op::FSub);
        }
        let block = self.graph.block_of(node);
        let (l, r) = (self.graph.operand(node, 0), self.graph.operand(node, 1));

        // symbol - constant is a link-time address
        if let (Some(IrOp::SymConst), NodeAttr::Symbol(name)) =
            (self.graph.ir_op(l), self.graph.attr(l).clone())
        {
            if let Some(offset) = self.int_immediate(r) {
                let attr = MachAttr {
                    am: AddrMode {
                        offset: offset.wrapping_neg(),
                        symbol: Some(SymOffset { name, negated: false }),
                        flavour: AmFlavour::OFFSET,
                        ..AddrMode::default()
                    },
                    ..MachAttr::default()
                };
                let operands = vec![self.no_reg(), self.no_reg()];
                self.session.record_lea_created();
                return Ok(self.mach(X64Op::Lea, mode, block, operands, attr));
            }
        }

        if let Some(delta) = self.int_immediate(r) {
            if let Some(n) = self.gen_inc_dec(node, l, delta.wrapping_neg())? {
                return Ok(n);
            }
        }
        self.gen_binop(node, X64Op::Sub, false)
    }

    fn gen_mulh(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        if !mode.is_int() {
            return Err(self.unsupported(node, "high multiply needs integer operands"));
        }
        let block = self.graph.block_of(node);
        let left = self.transform(self.graph.operand(node, 0))?;
        let right = self.transform(self.graph.operand(node, 1))?;
        let attr = MachAttr {
            ls_mode: Some(mode),
            unsigned: !mode.is_signed(),
            ..MachAttr::default()
        };
        let mul = self.mach(X64Op::Mul1, Mode::Tuple, block, vec![left, right], attr);
        let hi = self.proj(mul, mode, pn::MUL_HI);
        let lo = self.proj(mul, mode, pn::MUL_LO);
        self.keep(lo, block);
        Ok(hi)
    }

    fn gen_divmod(&mut self, node: NodeId, is_mod: bool) -> CompileResult<NodeId> {
        let block = self.graph.block_of(node);
        let left_old = self.graph.operand(node, 1);
        let mode = match self.graph.attr(node) {
            NodeAttr::Mem { mode, .. } => *mode,
            _ => self.graph.mode(left_old),
        };
        if !mode.is_int() {
            return Err(self.unsupported(node, "division needs integer operands"));
        }
        let mem = self.transform(self.graph.operand(node, 0))?;
        let left = self.transform(left_old)?;
        let right = self.transform(self.graph.operand(node, 2))?;

        let signed = mode.is_signed();
        let (op, high) = if signed {
            let cltd =
                self.mach(X64Op::Cltd, mode, block, vec![left], MachAttr::with_ls_mode(mode));
            (X64Op::IDiv, cltd)
        } else {
            let zero = self.mach(X64Op::Const, mode, block, Vec::new(), MachAttr::with_imm(0));
            (X64Op::Div, zero)
        };
        let attr = MachAttr {
            ls_mode: Some(mode),
            unsigned: !signed,
            ..MachAttr::default()
        };
        let div = self.mach(op, Mode::Tuple, block, vec![left, right, high, mem], attr);

        // the unused half must stay allocated
        let other = if is_mod { pn::RES } else { pn::REM };
        let unused = self.proj(div, mode, other);
        self.keep(unused, block);
        Ok(div)
    }

    fn gen_mask_op(&mut self, node: NodeId, op: X64Op, kind: KnownConst) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let value = self.transform(self.graph.operand(node, 0))?;
        let mask = self.session.known_const(kind, mode.bits());
        let attr = MachAttr {
            am: AddrMode {
                symbol: Some(SymOffset {
                    name: mask.to_string(),
                    negated: false,
                }),
                flavour: AmFlavour::OFFSET,
                ..AddrMode::default()
            },
            op_type: OpType::AmSource,
            ls_mode: Some(mode),
            ..MachAttr::default()
        };
        let operands = self.binop_operands(value, self.no_reg());
        Ok(self.mach(op, mode, block, operands, attr))
    }

    fn gen_x87_unop(&mut self, node: NodeId, op: X64Op) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let value = self.transform(self.graph.operand(node, 0))?;
        Ok(self.mach(op, mode, block, vec![value], MachAttr::with_ls_mode(mode)))
    }

    fn gen_minus(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        if !mode.is_float() {
            return self.gen_unop(node, X64Op::Neg);
        }
        match self.fp_unit() {
            FpUnit::X87 => self.gen_x87_unop(node, X64Op::FChs),
            _ => self.gen_mask_op(node, X64Op::XXor, KnownConst::SignMask),
        }
    }

    fn gen_abs(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        if mode.is_float() {
            return match self.fp_unit() {
                FpUnit::X87 => self.gen_x87_unop(node, X64Op::FAbs),
                _ => self.gen_mask_op(node, X64Op::XAnd, KnownConst::AbsMask),
            };
        }
        // sign = x >> (bits - 1); |x| = (x ^ sign) - sign
        let block = self.graph.block_of(node);
        let value = self.transform(self.graph.operand(node, 0))?;
        let no_reg = self.no_reg();
        let shift = MachAttr {
            imm: Some(Immediate::int(i64::from(mode.bits()) - 1)),
            ls_mode: Some(mode),
            ..MachAttr::default()
        };
        let sign = self.mach(X64Op::Sar, mode, block, self.binop_operands(value, no_reg), shift);
        let attr = MachAttr::with_ls_mode(mode);
        let operands = self.binop_operands(value, sign);
        let flipped = self.mach(X64Op::Xor, mode, block, operands, attr.clone());
        Ok(self.mach(X64Op::Sub, mode, block, self.binop_operands(flipped, sign), attr))
    }

    fn gen_cmp(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let block = self.graph.block_of(node);
        let (l, r) = (self.graph.operand(node, 0), self.graph.operand(node, 1));
        let cmp_mode = self.graph.mode(l);
        let NodeAttr::Relation(relation) = *self.graph.attr(node) else {
            return Err(self.unsupported(node, "compare without relation"));
        };
        if cmp_mode.is_float() {
            let left = self.transform(l)?;
            let right = self.transform(r)?;
            let op = if self.fp_unit() == FpUnit::X87 { X64Op::FCmp } else { X64Op::XCmp };
            let attr = MachAttr {
                relation: Some(relation),
                unsigned: true,
                ls_mode: Some(cmp_mode),
                ..MachAttr::default()
            };
            let operands = self.binop_operands(left, right);
            return Ok(self.mach(op, Mode::Bool, block, operands, attr));
        }
        let (left, right, imm, swapped) = self.match_operands(l, r, true)?;
        let attr = MachAttr {
            imm,
            relation: Some(relation),
            ins_permuted: swapped,
            unsigned: !cmp_mode.is_signed(),
            ls_mode: Some(cmp_mode),
            ..MachAttr::default()
        };
        let operands = self.binop_operands(left, right);
        Ok(self.mach(X64Op::Cmp, Mode::Bool, block, operands, attr))
    }

    /// Flags producer for the condition `sel` of `user`, with its relation and signedness.
    fn flags_of(&mut self, user: NodeId, sel: NodeId) -> CompileResult<(NodeId, Relation, bool)> {
        if !self.graph.is_ir(sel, IrOp::Cmp) {
            return Err(self.unsupported(user, "condition must be a comparison"));
        }
        let flags = self.transform(sel)?;
        let Some(attr) = self.graph.mach(flags) else {
            return Err(self.unsupported(user, "condition must be a comparison"));
        };
        let relation = attr.relation.unwrap_or(Relation::Ne);
        Ok((flags, relation, attr.unsigned))
    }

    fn gen_mux(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let mode = self.graph.mode(node);
        if !mode.is_int_like() {
            return Err(self.unsupported(node, "Mux of non-integer values"));
        }
        let block = self.graph.block_of(node);
        let sel = self.graph.operand(node, 0);
        let (flags, relation, unsigned) = self.flags_of(node, sel)?;
        let if_false = self.transform(self.graph.operand(node, 1))?;
        let if_true = self.transform(self.graph.operand(node, 2))?;
        let attr = MachAttr {
            relation: Some(relation),
            unsigned,
            ls_mode: Some(mode),
            ..MachAttr::default()
        };
        Ok(self.mach(X64Op::CMov, mode, block, vec![flags, if_false, if_true], attr))
    }

    /// Integer width change of an already selected value.
    fn int_conv(&mut self, value: NodeId, from: Mode, to: Mode, block: Option<BlockId>) -> NodeId {
        let smaller = if from.bits() < to.bits() { from } else { to };
        let attr = MachAttr {
            src_mode: Some(smaller),
            ls_mode: Some(smaller),
            ..MachAttr::default()
        };
        let operands = self.unop_operands(value);
        self.mach(X64Op::Conv, to, block, operands, attr)
    }

    fn gen_conv(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let dst = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let src_old = self.graph.operand(node, 0);
        let src = self.graph.mode(src_old);

        if src == Mode::Bool {
            if !dst.is_int_like() {
                return Err(self.unsupported(node, "boolean conversion to non-integer"));
            }
            let (flags, relation, unsigned) = self.flags_of(node, src_old)?;
            let attr = MachAttr {
                relation: Some(relation),
                unsigned,
                ls_mode: Some(dst),
                ..MachAttr::default()
            };
            return Ok(self.mach(X64Op::Setcc, dst, block, vec![flags], attr));
        }

        match (src.is_float(), dst.is_float()) {
            (false, false) => {
                let value = self.transform(src_old)?;
                if src.bits() == dst.bits() {
                    return Ok(value);
                }
                let src = if src.is_reference() { Mode::U64 } else { src };
                let dst_int = if dst.is_reference() { Mode::U64 } else { dst };
                let conv = self.int_conv(value, src, dst_int, block);
                self.graph.set_mode(conv, dst);
                Ok(conv)
            }
            (false, true) => self.gen_int_to_float(node, src_old, src, dst),
            (true, false) => self.gen_float_to_int(node, src_old, src, dst),
            (true, true) => {
                let value = self.transform(src_old)?;
                if self.fp_unit() == FpUnit::X87 || src.bits() == dst.bits() {
                    return Ok(value);
                }
                let attr = MachAttr {
                    src_mode: Some(src),
                    ls_mode: Some(src),
                    ..MachAttr::default()
                };
                let operands = self.unop_operands(value);
                Ok(self.mach(X64Op::XConv, dst, block, operands, attr))
            }
        }
    }

    fn spill_mem(&self, block: Option<BlockId>) -> NodeId {
        block
            .and_then(|b| self.spill_chain.get(&b).copied())
            .unwrap_or_else(|| self.no_mem())
    }

    fn gen_int_to_float(
        &mut self,
        node: NodeId,
        src_old: NodeId,
        src: Mode,
        dst: Mode,
    ) -> CompileResult<NodeId> {
        if src.bits() == 64 && !src.is_signed() {
            return Err(
                self.unsupported(node, "unsigned 64-bit to float conversion must be lowered")
            );
        }
        let block = self.graph.block_of(node);
        let mut value = self.transform(src_old)?;

        if self.fp_unit() == FpUnit::Sse2 {
            // signed sources convert directly, narrow unsigned ones after zero extension
            let cvt_mode = if src.is_signed() && src.bits() >= 32 {
                src
            } else if src.is_signed() {
                value = self.int_conv(value, src, Mode::I32, block);
                Mode::I32
            } else {
                value = self.int_conv(value, src, Mode::I64, block);
                Mode::I64
            };
            let attr = MachAttr {
                src_mode: Some(cvt_mode),
                ls_mode: Some(cvt_mode),
                ..MachAttr::default()
            };
            let operands = self.unop_operands(value);
            return Ok(self.mach(X64Op::Cvtsi2s, dst, block, operands, attr));
        }

        // x87: store the 64-bit integer and load it into the stack unit
        if src.bits() < 64 {
            value = self.int_conv(value, src, Mode::I64, block);
        }
        let slot = self.scratch_slot();
        let mem = self.spill_mem(block);
        let store_attr = MachAttr {
            am: Self::frame_am(slot),
            ls_mode: Some(Mode::I64),
            ..MachAttr::default()
        };
        let no_reg = self.no_reg();
        let operands = vec![no_reg, no_reg, value, mem];
        let store = self.mach(X64Op::Store, Mode::Mem, block, operands, store_attr);
        let load_attr = MachAttr {
            am: Self::frame_am(slot),
            ls_mode: Some(Mode::I64),
            ..MachAttr::default()
        };
        let fild =
            self.mach(X64Op::Fild, Mode::Tuple, block, vec![no_reg, no_reg, store], load_attr);
        let result = self.proj(fild, dst, pn::RES);
        let mem = self.proj(fild, Mode::Mem, pn::MEM);
        if let Some(b) = block {
            self.spill_chain.insert(b, mem);
        }
        Ok(result)
    }

    fn gen_float_to_int(
        &mut self,
        node: NodeId,
        src_old: NodeId,
        src: Mode,
        dst: Mode,
    ) -> CompileResult<NodeId> {
        if !dst.is_int() {
            return Err(self.unsupported(node, "float conversion to non-integer"));
        }
        let block = self.graph.block_of(node);
        let value = self.transform(src_old)?;

        if self.fp_unit() == FpUnit::Sse2 {
            if dst.bits() == 64 && !dst.is_signed() {
                return Err(
                    self.unsupported(node, "float to unsigned 64-bit conversion must be lowered")
                );
            }
            // narrow unsigned targets are converted through the next wider signed mode
            let cvt_mode = if dst.bits() < 32 || (dst.bits() == 32 && dst.is_signed()) {
                Mode::I32
            } else {
                Mode::I64
            };
            let attr = MachAttr {
                src_mode: Some(src),
                ls_mode: Some(src),
                ..MachAttr::default()
            };
            let operands = self.unop_operands(value);
            let cvt = self.mach(X64Op::Cvtts2si, cvt_mode, block, operands, attr);
            if cvt_mode.bits() == dst.bits() {
                self.graph.set_mode(cvt, dst);
                return Ok(cvt);
            }
            return Ok(self.int_conv(cvt, cvt_mode, dst, block));
        }

        // x87: truncating store of the 64-bit integer, then read the low part back
        let slot = self.scratch_slot();
        let mem = self.spill_mem(block);
        let no_reg = self.no_reg();
        let fist_attr = MachAttr {
            am: Self::frame_am(slot),
            ls_mode: Some(Mode::I64),
            ..MachAttr::default()
        };
        let operands = vec![no_reg, no_reg, value, mem];
        let fist = self.mach(X64Op::Fist, Mode::Mem, block, operands, fist_attr);
        let load_attr = MachAttr {
            am: Self::frame_am(slot),
            ls_mode: Some(dst),
            ..MachAttr::default()
        };
        let load =
            self.mach(X64Op::Load, Mode::Tuple, block, vec![no_reg, no_reg, fist], load_attr);
        let result = self.proj(load, dst, pn::RES);
        let mem = self.proj(load, Mode::Mem, pn::MEM);
        if let Some(b) = block {
            self.spill_chain.insert(b, mem);
        }
        Ok(result)
    }

    fn gen_load(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let block = self.graph.block_of(node);
        let NodeAttr::Mem { mode, pinned } = *self.graph.attr(node) else {
            return Err(self.unsupported(node, "load without access mode"));
        };
        let op = if mode.is_float() {
            if self.fp_unit() == FpUnit::X87 {
                X64Op::FLd
            } else {
                X64Op::XLoad
            }
        } else if mode.is_int_like() {
            X64Op::Load
        } else {
            return Err(self.unsupported(node, "load of non-data mode"));
        };
        let mem = self.transform(self.graph.operand(node, 0))?;
        let (base, am) = self.address(self.graph.operand(node, 1))?;
        let attr = MachAttr {
            am,
            ls_mode: Some(mode),
            pinned,
            ..MachAttr::default()
        };
        let no_reg = self.no_reg();
        Ok(self.mach(op, Mode::Tuple, block, vec![base, no_reg, mem], attr))
    }

    fn gen_store(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let block = self.graph.block_of(node);
        let pinned = matches!(self.graph.attr(node), NodeAttr::Mem { pinned: true, .. });
        let value_old = self.graph.operand(node, 2);
        let mode = self.graph.mode(value_old);
        let mem = self.transform(self.graph.operand(node, 0))?;
        let (base, am) = self.address(self.graph.operand(node, 1))?;

        let (op, value, imm) = if mode.is_float() {
            let op = if self.fp_unit() == FpUnit::X87 {
                X64Op::FSt
            } else {
                X64Op::XStore
            };
            (op, self.transform(value_old)?, None)
        } else if let Some(imm) = self.immediate(value_old) {
            (X64Op::Store, self.no_reg(), Some(imm))
        } else {
            (X64Op::Store, self.transform(value_old)?, None)
        };
        let attr = MachAttr {
            am,
            imm,
            ls_mode: Some(mode),
            pinned,
            ..MachAttr::default()
        };
        let no_reg = self.no_reg();
        Ok(self.mach(op, Mode::Mem, block, vec![base, no_reg, value, mem], attr))
    }

    fn gen_switch(&mut self, node: NodeId) -> CompileResult<NodeId> {
        let block = self.graph.block_of(node);
        let NodeAttr::Switch(mut table) = self.graph.attr(node).clone() else {
            return Err(self.unsupported(node, "switch without table"));
        };
        let min = table.min_value().unwrap_or(0);
        let max = table.max_value().unwrap_or(0);
        // sparse or far-off cases need a compare tree built before selection
        let span = i128::from(max) - i128::from(min);
        if span >= MAX_JUMP_TABLE_ENTRIES || i32::try_from(min).is_err() {
            return Err(CompileError::MustBeLowered {
                func: self.func(),
                node,
                opcode: self.graph.op(node).name(),
            });
        }

        let sel_old = self.graph.operand(node, 0);
        let mode = self.graph.mode(sel_old);
        let mut index = self.transform(sel_old)?;
        // the table is indexed with a full register
        let wide = if mode.is_signed() { Mode::I64 } else { Mode::U64 };
        if mode.bits() < 64 {
            index = self.int_conv(index, mode, wide, block);
        }
        if min != 0 {
            // rebase the jump table to start at zero
            let attr = MachAttr {
                am: AddrMode {
                    offset: min.wrapping_neg(),
                    flavour: AmFlavour::BASE | AmFlavour::OFFSET,
                    ..AddrMode::default()
                },
                ..MachAttr::default()
            };
            let no_reg = self.no_reg();
            index = self.mach(X64Op::Lea, wide, block, vec![index, no_reg], attr);
            for entry in &mut table.entries {
                entry.value = entry.value.wrapping_sub(min);
            }
        }
        let attr = MachAttr {
            switch: Some(table),
            ls_mode: Some(wide),
            ..MachAttr::default()
        };
        Ok(self.mach(X64Op::SwitchJmp, Mode::Tuple, block, vec![index], attr))
    }

    // ---------------------------------------------------------------------
    // Finish
    // ---------------------------------------------------------------------

    /// Points a kept projection at the selected tuple, renumbering remainder results.
    fn fix_proj(&mut self, proj: NodeId) -> CompileResult<()> {
        let tuple_old = self.graph.operand(proj, 0);
        let Some(num) = self.graph.proj_num(proj) else {
            return Ok(());
        };
        let num = if self.graph.is_ir(tuple_old, IrOp::Mod) && num == pn::RES {
            pn::REM
        } else {
            num
        };
        let tuple = self.transform(tuple_old)?;
        self.graph.set_operand(proj, 0, tuple);
        *self.graph.attr_mut(proj) = NodeAttr::Proj(num);
        Ok(())
    }

    fn finish(mut self) -> CompileResult<()> {
        while !self.pass_through.is_empty() {
            let pending = std::mem::take(&mut self.pass_through);
            for node in pending {
                if self.graph.is_proj(node) {
                    self.fix_proj(node)?;
                    continue;
                }
                let operands = self.graph.operands(node).to_vec();
                for (pos, operand) in operands.into_iter().enumerate() {
                    let new = self.transform(operand)?;
                    self.graph.set_operand(node, pos, new);
                }
            }
        }

        let blocks: Vec<BlockId> = self.graph.blocks().collect();
        for block in blocks {
            let preds = self.graph.block_preds(block).to_vec();
            for (pos, cf) in preds.into_iter().enumerate() {
                let new = self.transform(cf)?;
                self.graph.set_block_pred(block, pos, new);
            }
        }

        let mut replaced: Vec<(NodeId, NodeId)> = self
            .memo
            .iter()
            .filter(|(old, new)| old != new)
            .map(|(&old, &new)| (old, new))
            .collect();
        replaced.sort();
        for (old, new) in replaced {
            self.graph.record_replacement(old, new);
        }
        let removed = self.graph.remove_unreachable();
        log::debug!(
            "selected {}: {} nodes replaced, {} removed",
            self.graph.name(),
            self.memo.len(),
            removed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;
    use bumpalo::Bump;

    fn select(graph: &mut Graph, options: &CodegenOptions) -> CompileResult<()> {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        select_graph(graph, &session, options)
    }

    #[test]
    fn test_add_of_constant_becomes_immediate() {
        let mut b = GraphBuilder::new("f", &[Mode::I32]);
        let x = b.arg(0);
        let c = b.konst(Mode::I32, 42);
        let sum = b.add(c, x);
        let mem = b.initial_mem();
        let ret = b.ret(mem, &[sum]);
        let mut graph = b.finish();

        select(&mut graph, &CodegenOptions::default()).unwrap();
        let ret = graph.resolve(ret);
        let add = graph.operand(ret, 1);
        assert!(graph.is_x64(add, X64Op::Add));
        assert_eq!(graph.operand(add, 2), x);
        assert_eq!(graph.operand(add, 3), graph.no_reg());
        assert_eq!(graph.mach(add).unwrap().imm, Some(Immediate::int(42)));
    }

    #[test]
    fn test_inc_dec_follow_option() {
        let build = || {
            let mut b = GraphBuilder::new("f", &[Mode::I64]);
            let x = b.arg(0);
            let one = b.konst(Mode::I64, 1);
            let dec = b.sub(x, one);
            let mem = b.initial_mem();
            let ret = b.ret(mem, &[dec]);
            (b.finish(), ret)
        };

        let (mut graph, ret) = build();
        select(&mut graph, &CodegenOptions::default()).unwrap();
        let value = graph.operand(graph.resolve(ret), 1);
        assert!(graph.is_x64(value, X64Op::Dec));

        let (mut graph, ret) = build();
        let options = CodegenOptions {
            inc_dec: false,
            ..CodegenOptions::default()
        };
        select(&mut graph, &options).unwrap();
        let value = graph.operand(graph.resolve(ret), 1);
        assert!(graph.is_x64(value, X64Op::Sub));
    }

    #[test]
    fn test_compare_with_left_constant_is_permuted() {
        let mut b = GraphBuilder::new("f", &[Mode::U32]);
        let x = b.arg(0);
        let c = b.konst(Mode::U32, 7);
        let lt = b.cmp(Relation::Lt, c, x);
        let zero = b.konst(Mode::U32, 0);
        let one = b.konst(Mode::U32, 1);
        let sel = b.mux(lt, zero, one);
        let mem = b.initial_mem();
        let ret = b.ret(mem, &[sel]);
        let mut graph = b.finish();

        select(&mut graph, &CodegenOptions::default()).unwrap();
        let cmov = graph.operand(graph.resolve(ret), 1);
        assert!(graph.is_x64(cmov, X64Op::CMov));
        let cmp = graph.operand(cmov, 0);
        let attr = graph.mach(cmp).unwrap();
        assert!(attr.ins_permuted);
        assert!(attr.unsigned);
        assert_eq!(attr.relation, Some(Relation::Lt));
    }

    #[test]
    fn test_float_ops_rejected_without_fpu() {
        let mut b = GraphBuilder::new("f", &[Mode::F64, Mode::F64]);
        let x = b.arg(0);
        let y = b.arg(1);
        let sum = b.add(x, y);
        let mem = b.initial_mem();
        b.ret(mem, &[sum]);
        let mut graph = b.finish();

        let options = CodegenOptions {
            fp_unit: FpUnit::None,
            ..CodegenOptions::default()
        };
        let err = select(&mut graph, &options).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedNode { mode: Mode::F64, .. }));
    }

    #[test]
    fn test_float_minus_uses_sign_mask() {
        let mut b = GraphBuilder::new("f", &[Mode::F32]);
        let x = b.arg(0);
        let neg = b.unop(IrOp::Minus, x);
        let mem = b.initial_mem();
        let ret = b.ret(mem, &[neg]);
        let mut graph = b.finish();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        select_graph(&mut graph, &session, &CodegenOptions::default()).unwrap();
        let xor = graph.operand(graph.resolve(ret), 1);
        assert!(graph.is_x64(xor, X64Op::XXor));
        let attr = graph.mach(xor).unwrap();
        assert_eq!(attr.op_type, OpType::AmSource);
        let constants = session.constants();
        assert_eq!(constants.len(), 1);
        assert_eq!(attr.am.symbol.as_ref().map(|s| s.name.as_str()), Some(constants[0].name));
    }

    #[test]
    fn test_switch_with_offset_range_is_rebased() {
        let mut b = GraphBuilder::new("f", &[Mode::I32]);
        let x = b.arg(0);
        let default = b.new_block("default");
        let ten = b.new_block("ten");
        let eleven = b.new_block("eleven");
        let switch = b.switch(x, default, &[(10, ten), (11, eleven)]);
        for block in [default, ten, eleven] {
            b.switch_to(block);
            let mem = b.initial_mem();
            b.ret(mem, &[x]);
        }
        let mut graph = b.finish();

        select(&mut graph, &CodegenOptions::default()).unwrap();
        let jmp = graph.resolve(switch);
        assert!(graph.is_x64(jmp, X64Op::SwitchJmp));
        let lea = graph.operand(jmp, 0);
        assert!(graph.is_x64(lea, X64Op::Lea));
        assert_eq!(graph.mach(lea).unwrap().am.offset, -10);
        let table = graph.mach(jmp).unwrap().switch.clone().unwrap();
        assert_eq!(table.lookup(1), 2);
    }

    fn switch_graph(mode: Mode, cases: &[i64]) -> (Graph, NodeId) {
        let mut b = GraphBuilder::new("f", &[mode]);
        let x = b.arg(0);
        let default = b.new_block("default");
        let targets: Vec<(i64, BlockId)> =
            cases.iter().map(|&v| (v, b.new_block("case"))).collect();
        let switch = b.switch(x, default, &targets);
        for block in std::iter::once(default).chain(targets.iter().map(|&(_, t)| t)) {
            b.switch_to(block);
            let mem = b.initial_mem();
            b.ret(mem, &[]);
        }
        (b.finish(), switch)
    }

    #[test]
    fn test_sparse_switch_must_be_lowered() {
        let (mut graph, _) = switch_graph(Mode::I64, &[0, 4_000_000_000]);
        let err = select(&mut graph, &CodegenOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::MustBeLowered { .. }), "{}", err);

        let (mut graph, _) = switch_graph(Mode::I64, &[-(1 << 40), -(1 << 40) + 1]);
        let err = select(&mut graph, &CodegenOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::MustBeLowered { .. }), "{}", err);
    }

    #[test]
    fn test_narrow_switch_selector_is_widened() {
        let (mut graph, switch) = switch_graph(Mode::U8, &[0, 1, 2]);
        select(&mut graph, &CodegenOptions::default()).unwrap();
        let jmp = graph.resolve(switch);
        let index = graph.operand(jmp, 0);
        assert!(graph.is_x64(index, X64Op::Conv));
        assert_eq!(graph.mode(index), Mode::U64);
        assert_eq!(graph.mach(index).unwrap().src_mode, Some(Mode::U8));
        assert_eq!(graph.mach(jmp).unwrap().ls_mode, Some(Mode::U64));
    }
}
