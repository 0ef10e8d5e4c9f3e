// This module provides GraphBuilder, the programmatic way to construct function graphs for
// the backend. It owns a Graph while it is being built and keeps a current block into which
// new nodes are placed. Multi-result operations (loads, divisions, calls) are created as
// tuples together with their projections. Control flow is expressed by connecting jumps and
// branch projections to the predecessor lists of their target blocks; Phis can be created
// as placeholders and completed once all predecessors exist, which is how loops are built.

use super::graph::Graph;
use super::mode::Mode;
use super::node::{
    BlockId, FrameEntity, IrOp, NodeAttr, NodeId, Opcode, Relation, SwitchEntry, SwitchTable,
};
use super::pn;

/// Incremental builder for a [`Graph`].
pub struct GraphBuilder {
    graph: Graph,
    current: BlockId,
    args: Vec<NodeId>,
    initial_mem: NodeId,
}

impl GraphBuilder {
    /// Starts a function with the given argument modes. Code is placed into the start
    /// block until [`switch_to`](Self::switch_to) selects another block.
    pub fn new(name: impl Into<String>, arg_modes: &[Mode]) -> Self {
        let mut graph = Graph::new(name);
        let start = graph.start();
        let start_block = graph.start_block();
        let initial_mem = graph.add_node(
            Opcode::Ir(IrOp::Proj),
            Mode::Mem,
            Some(start_block),
            vec![start],
            NodeAttr::Proj(pn::START_M),
        );
        let args = arg_modes
            .iter()
            .enumerate()
            .map(|(i, &mode)| {
                graph.add_node(
                    Opcode::Ir(IrOp::Proj),
                    mode,
                    Some(start_block),
                    vec![start],
                    NodeAttr::Proj(pn::START_ARG0 + i as u32),
                )
            })
            .collect();
        Self {
            graph,
            current: start_block,
            args,
            initial_mem,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn finish(self) -> Graph {
        self.graph
    }

    pub fn start_block(&self) -> BlockId {
        self.graph.start_block()
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn new_block(&mut self, name: impl Into<String>) -> BlockId {
        self.graph.add_block(name)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn arg(&self, index: usize) -> NodeId {
        self.args[index]
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn initial_mem(&self) -> NodeId {
        self.initial_mem
    }

    /// Adds an arbitrary target-independent node to the current block.
    pub fn raw(&mut self, op: IrOp, mode: Mode, operands: Vec<NodeId>, attr: NodeAttr) -> NodeId {
        let block = self.current;
        self.graph
            .add_node(Opcode::Ir(op), mode, Some(block), operands, attr)
    }

    pub fn proj(&mut self, tuple: NodeId, mode: Mode, num: u32) -> NodeId {
        let block = self.graph.block_of(tuple);
        self.graph.add_node(
            Opcode::Ir(IrOp::Proj),
            mode,
            block,
            vec![tuple],
            NodeAttr::Proj(num),
        )
    }

    // ---------------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------------

    pub fn konst(&mut self, mode: Mode, value: i64) -> NodeId {
        self.raw(IrOp::Const, mode, Vec::new(), NodeAttr::Int(mode.wrap(value)))
    }

    pub fn fconst(&mut self, mode: Mode, value: f64) -> NodeId {
        self.raw(IrOp::Const, mode, Vec::new(), NodeAttr::Float(value))
    }

    pub fn symconst(&mut self, name: impl Into<String>) -> NodeId {
        self.raw(IrOp::SymConst, Mode::Ptr, Vec::new(), NodeAttr::Symbol(name.into()))
    }

    pub fn alloc_slot(&mut self, name: impl Into<String>, size: u32, align: u32) -> FrameEntity {
        self.graph.frame_mut().alloc(name, size, align)
    }

    pub fn frame_addr(&mut self, entity: FrameEntity) -> NodeId {
        self.raw(IrOp::FrameAddr, Mode::Ptr, Vec::new(), NodeAttr::Frame(entity))
    }

    pub fn unknown(&mut self, mode: Mode) -> NodeId {
        self.raw(IrOp::Unknown, mode, Vec::new(), NodeAttr::None)
    }

    /// Binary operation whose result has the mode of `left`.
    pub fn binop(&mut self, op: IrOp, left: NodeId, right: NodeId) -> NodeId {
        let mode = self.graph.mode(left);
        self.raw(op, mode, vec![left, right], NodeAttr::None)
    }

    pub fn add(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binop(IrOp::Add, left, right)
    }

    pub fn sub(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binop(IrOp::Sub, left, right)
    }

    pub fn mul(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binop(IrOp::Mul, left, right)
    }

    pub fn shl(&mut self, value: NodeId, count: NodeId) -> NodeId {
        self.binop(IrOp::Shl, value, count)
    }

    pub fn unop(&mut self, op: IrOp, value: NodeId) -> NodeId {
        let mode = self.graph.mode(value);
        self.raw(op, mode, vec![value], NodeAttr::None)
    }

    pub fn conv(&mut self, value: NodeId, mode: Mode) -> NodeId {
        self.raw(IrOp::Conv, mode, vec![value], NodeAttr::None)
    }

    pub fn cmp(&mut self, relation: Relation, left: NodeId, right: NodeId) -> NodeId {
        self.raw(
            IrOp::Cmp,
            Mode::Bool,
            vec![left, right],
            NodeAttr::Relation(relation),
        )
    }

    pub fn mux(&mut self, sel: NodeId, if_false: NodeId, if_true: NodeId) -> NodeId {
        let mode = self.graph.mode(if_true);
        self.raw(IrOp::Mux, mode, vec![sel, if_false, if_true], NodeAttr::None)
    }

    pub fn mulh(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binop(IrOp::Mulh, left, right)
    }

    /// Float division.
    pub fn quot(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.binop(IrOp::Quot, left, right)
    }

    // ---------------------------------------------------------------------
    // Memory
    // ---------------------------------------------------------------------

    /// Returns `(value, memory)`.
    pub fn load(&mut self, mem: NodeId, ptr: NodeId, mode: Mode) -> (NodeId, NodeId) {
        self.load_with(mem, ptr, mode, false)
    }

    pub fn load_with(
        &mut self,
        mem: NodeId,
        ptr: NodeId,
        mode: Mode,
        pinned: bool,
    ) -> (NodeId, NodeId) {
        let load = self.raw(
            IrOp::Load,
            Mode::Tuple,
            vec![mem, ptr],
            NodeAttr::Mem { mode, pinned },
        );
        let value = self.proj(load, mode, pn::RES);
        let mem = self.proj(load, Mode::Mem, pn::MEM);
        (value, mem)
    }

    /// Returns the memory state after the store.
    pub fn store(&mut self, mem: NodeId, ptr: NodeId, value: NodeId) -> NodeId {
        self.store_with(mem, ptr, value, false)
    }

    pub fn store_with(&mut self, mem: NodeId, ptr: NodeId, value: NodeId, pinned: bool) -> NodeId {
        let mode = self.graph.mode(value);
        self.raw(
            IrOp::Store,
            Mode::Mem,
            vec![mem, ptr, value],
            NodeAttr::Mem { mode, pinned },
        )
    }

    fn divlike(&mut self, op: IrOp, mem: NodeId, left: NodeId, right: NodeId) -> (NodeId, NodeId) {
        let mode = self.graph.mode(left);
        let node = self.raw(
            op,
            Mode::Tuple,
            vec![mem, left, right],
            NodeAttr::Mem {
                mode,
                pinned: false,
            },
        );
        let value = self.proj(node, mode, pn::RES);
        let mem = self.proj(node, Mode::Mem, pn::MEM);
        (value, mem)
    }

    /// Integer division, returns `(quotient, memory)`.
    pub fn div(&mut self, mem: NodeId, left: NodeId, right: NodeId) -> (NodeId, NodeId) {
        self.divlike(IrOp::Div, mem, left, right)
    }

    /// Integer remainder, returns `(remainder, memory)`.
    pub fn modulo(&mut self, mem: NodeId, left: NodeId, right: NodeId) -> (NodeId, NodeId) {
        self.divlike(IrOp::Mod, mem, left, right)
    }

    pub fn sync(&mut self, mems: &[NodeId]) -> NodeId {
        self.raw(IrOp::Sync, Mode::Mem, mems.to_vec(), NodeAttr::None)
    }

    /// Calls `callee`, returns `(results, memory)`.
    pub fn call(
        &mut self,
        mem: NodeId,
        callee: impl Into<String>,
        args: &[NodeId],
        result_modes: &[Mode],
    ) -> (Vec<NodeId>, NodeId) {
        let mut operands = vec![mem];
        operands.extend_from_slice(args);
        let call = self.raw(IrOp::Call, Mode::Tuple, operands, NodeAttr::Call(callee.into()));
        let mem = self.proj(call, Mode::Mem, pn::MEM);
        let results = result_modes
            .iter()
            .enumerate()
            .map(|(i, &mode)| self.proj(call, mode, pn::RES + i as u32))
            .collect();
        (results, mem)
    }

    // ---------------------------------------------------------------------
    // Control flow
    // ---------------------------------------------------------------------

    pub fn jmp(&mut self, target: BlockId) -> NodeId {
        let jmp = self.raw(IrOp::Jmp, Mode::Ctrl, Vec::new(), NodeAttr::None);
        self.graph.add_block_pred(target, jmp);
        jmp
    }

    /// Two-way branch on a boolean; returns the `(true, false)` projections.
    pub fn cond(&mut self, sel: NodeId, if_true: BlockId, if_false: BlockId) -> (NodeId, NodeId) {
        let cond = self.raw(IrOp::Cond, Mode::Tuple, vec![sel], NodeAttr::None);
        let t = self.proj(cond, Mode::Ctrl, pn::COND_TRUE);
        let f = self.proj(cond, Mode::Ctrl, pn::COND_FALSE);
        self.graph.add_block_pred(if_true, t);
        self.graph.add_block_pred(if_false, f);
        (t, f)
    }

    /// Multi-way branch. Case `i` gets projection number `i + 1`, the default `0`.
    pub fn switch(&mut self, sel: NodeId, default: BlockId, cases: &[(i64, BlockId)]) -> NodeId {
        let table = SwitchTable {
            default_pn: 0,
            entries: cases
                .iter()
                .enumerate()
                .map(|(i, &(value, _))| SwitchEntry {
                    value,
                    pn: i as u32 + 1,
                })
                .collect(),
        };
        let switch = self.raw(IrOp::Switch, Mode::Tuple, vec![sel], NodeAttr::Switch(table));
        let default_proj = self.proj(switch, Mode::Ctrl, 0);
        self.graph.add_block_pred(default, default_proj);
        for (i, &(_, target)) in cases.iter().enumerate() {
            let proj = self.proj(switch, Mode::Ctrl, i as u32 + 1);
            self.graph.add_block_pred(target, proj);
        }
        switch
    }

    /// Phi over the current block's predecessors, in predecessor order.
    pub fn phi(&mut self, mode: Mode, operands: &[NodeId]) -> NodeId {
        self.raw(IrOp::Phi, mode, operands.to_vec(), NodeAttr::None)
    }

    /// Phi whose operands are supplied later through [`set_phi_operands`](Self::set_phi_operands).
    pub fn phi_placeholder(&mut self, mode: Mode) -> NodeId {
        self.raw(IrOp::Phi, mode, Vec::new(), NodeAttr::None)
    }

    pub fn set_phi_operands(&mut self, phi: NodeId, operands: &[NodeId]) {
        self.graph.set_operands(phi, operands.to_vec());
    }

    pub fn ret(&mut self, mem: NodeId, values: &[NodeId]) -> NodeId {
        let mut operands = vec![mem];
        operands.extend_from_slice(values);
        let ret = self.raw(IrOp::Return, Mode::Ctrl, operands, NodeAttr::None);
        let end_block = self.graph.end_block();
        self.graph.add_block_pred(end_block, ret);
        ret
    }

    pub fn keep_alive(&mut self, node: NodeId) {
        self.graph.keep_alive(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_with_phi_placeholder() {
        let mut b = GraphBuilder::new("count", &[Mode::I32]);
        let head = b.new_block("head");
        let exit = b.new_block("exit");
        let zero = b.konst(Mode::I32, 0);
        b.jmp(head);

        b.switch_to(head);
        let i = b.phi_placeholder(Mode::I32);
        let one = b.konst(Mode::I32, 1);
        let next = b.add(i, one);
        let n = b.arg(0);
        let cmp = b.cmp(Relation::Lt, next, n);
        b.cond(cmp, head, exit);
        b.set_phi_operands(i, &[zero, next]);

        b.switch_to(exit);
        let mem = b.initial_mem();
        b.ret(mem, &[next]);
        let graph = b.finish();

        assert_eq!(graph.block_preds(head).len(), 2);
        assert_eq!(graph.operands(i), &[zero, next]);
        assert_eq!(graph.pred_block(head, 1), Some(head));
        assert_eq!(graph.block_preds(graph.end_block()).len(), 1);
    }

    #[test]
    fn test_load_creates_projections() {
        let mut b = GraphBuilder::new("ld", &[Mode::Ptr]);
        let mem = b.initial_mem();
        let p = b.arg(0);
        let (value, mem2) = b.load(mem, p, Mode::I64);
        let graph = b.graph();
        let load = graph.skip_proj(value);
        assert_eq!(graph.skip_proj(mem2), load);
        assert_eq!(graph.find_proj(load, pn::RES), Some(value));
        assert_eq!(graph.mode(value), Mode::I64);
        assert_eq!(graph.num_users(load), 2);
    }
}
