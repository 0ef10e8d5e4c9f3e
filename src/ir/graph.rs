// This module implements the graph arena that every pass of the backend operates on. Nodes
// live in a single vector addressed by NodeId and are never moved; out-edges (users) are
// maintained incrementally whenever an operand is set so that rewriting passes can iterate
// consumers without recomputation. Exchanging a node redirects all of its users and control
// flow references to the replacement, kills the old node and records the replacement in a
// redirection table that resolve() follows, so ids cached by a pass stay meaningful after
// graph surgery. Blocks are stored beside the nodes with their ordered control-flow
// predecessors, and the function frame tracks stack slots. Walks use generation-counted
// visited marks that live in interior-mutable storage so read-only passes can walk too.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use super::mode::Mode;
use super::node::{BlockId, FrameEntity, IrOp, Node, NodeAttr, NodeId, Opcode};
use crate::x64::{MachAttr, X64Op};

/// A single out-edge: `user` consumes the value at operand position `pos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub user: NodeId,
    pub pos: u32,
}

/// Basic block with its ordered control-flow predecessors.
#[derive(Debug, Clone)]
pub struct Block {
    name: String,
    preds: Vec<NodeId>,
}

impl Block {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn preds(&self) -> &[NodeId] {
        &self.preds
    }
}

/// Stack slot description.
#[derive(Debug, Clone)]
pub struct FrameSlot {
    pub name: String,
    pub size: u32,
    pub align: u32,
}

/// Stack frame of a function.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    slots: Vec<FrameSlot>,
}

/// Frame-pointer relative offsets assigned to the slots of a [`Frame`].
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    offsets: Vec<i32>,
    size: u32,
}

impl FrameLayout {
    pub fn offset(&self, entity: FrameEntity) -> i32 {
        self.offsets.get(entity.0 as usize).copied().unwrap_or(0)
    }

    /// Total frame size, 16-byte aligned.
    pub fn size(&self) -> u32 {
        self.size
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    let align = align.max(1);
    value.div_ceil(align) * align
}

impl Frame {
    pub fn alloc(&mut self, name: impl Into<String>, size: u32, align: u32) -> FrameEntity {
        let entity = FrameEntity(self.slots.len() as u32);
        self.slots.push(FrameSlot {
            name: name.into(),
            size,
            align,
        });
        entity
    }

    pub fn slot(&self, entity: FrameEntity) -> Option<&FrameSlot> {
        self.slots.get(entity.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Assigns slots downwards from the frame pointer in allocation order.
    pub fn layout(&self) -> FrameLayout {
        let mut offsets = Vec::with_capacity(self.slots.len());
        let mut top = 0u32;
        for slot in &self.slots {
            top = align_up(top + slot.size, slot.align);
            offsets.push(-(top as i32));
        }
        FrameLayout {
            offsets,
            size: align_up(top, 16),
        }
    }
}

/// Function graph: node arena, blocks and frame.
#[derive(Debug)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    users: Vec<Vec<Use>>,
    replaced: Vec<Option<NodeId>>,
    blocks: Vec<Block>,
    start_block: BlockId,
    end_block: BlockId,
    start: NodeId,
    end: NodeId,
    no_mem: NodeId,
    no_reg: NodeId,
    frame: Frame,
    visited: RefCell<Vec<u32>>,
    visit_generation: Cell<u32>,
}

impl Graph {
    /// Creates an empty function with start/end blocks and the anchored pseudo values.
    pub fn new(name: impl Into<String>) -> Self {
        let mut graph = Self {
            name: name.into(),
            nodes: Vec::new(),
            users: Vec::new(),
            replaced: Vec::new(),
            blocks: Vec::new(),
            start_block: BlockId(0),
            end_block: BlockId(0),
            start: NodeId(0),
            end: NodeId(0),
            no_mem: NodeId(0),
            no_reg: NodeId(0),
            frame: Frame::default(),
            visited: RefCell::new(Vec::new()),
            visit_generation: Cell::new(0),
        };
        graph.start_block = graph.add_block("start");
        graph.end_block = graph.add_block("end");
        let start_block = graph.start_block;
        let end_block = graph.end_block;
        graph.start = graph.add_node(
            Opcode::Ir(IrOp::Start),
            Mode::Tuple,
            Some(start_block),
            Vec::new(),
            NodeAttr::None,
        );
        graph.end = graph.add_node(
            Opcode::Ir(IrOp::End),
            Mode::Ctrl,
            Some(end_block),
            Vec::new(),
            NodeAttr::None,
        );
        graph.no_mem =
            graph.add_node(Opcode::Ir(IrOp::NoMem), Mode::Mem, None, Vec::new(), NodeAttr::None);
        graph.no_reg =
            graph.add_node(Opcode::Ir(IrOp::NoReg), Mode::Ptr, None, Vec::new(), NodeAttr::None);
        graph
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_block(&self) -> BlockId {
        self.start_block
    }

    pub fn end_block(&self) -> BlockId {
        self.end_block
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn end(&self) -> NodeId {
        self.end
    }

    pub fn no_mem(&self) -> NodeId {
        self.no_mem
    }

    pub fn no_reg(&self) -> NodeId {
        self.no_reg
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    pub fn add_node(
        &mut self,
        op: Opcode,
        mode: Mode,
        block: Option<BlockId>,
        operands: Vec<NodeId>,
        attr: NodeAttr,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.users.push(Vec::new());
        self.replaced.push(None);
        for (pos, operand) in operands.iter().enumerate() {
            self.users[operand.index()].push(Use {
                user: id,
                pos: pos as u32,
            });
        }
        self.nodes.push(Node {
            op,
            mode,
            block,
            operands,
            attr,
            dead: false,
        });
        id
    }

    /// Number of arena slots, including dead nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn op(&self, id: NodeId) -> Opcode {
        self.nodes[id.index()].op
    }

    pub fn ir_op(&self, id: NodeId) -> Option<IrOp> {
        self.nodes[id.index()].ir_op()
    }

    pub fn x64_op(&self, id: NodeId) -> Option<X64Op> {
        self.nodes[id.index()].x64_op()
    }

    pub fn is_ir(&self, id: NodeId, op: IrOp) -> bool {
        self.nodes[id.index()].op == Opcode::Ir(op)
    }

    pub fn is_x64(&self, id: NodeId, op: X64Op) -> bool {
        self.nodes[id.index()].op == Opcode::X64(op)
    }

    pub fn mode(&self, id: NodeId) -> Mode {
        self.nodes[id.index()].mode
    }

    pub fn set_mode(&mut self, id: NodeId, mode: Mode) {
        self.nodes[id.index()].mode = mode;
    }

    pub fn block_of(&self, id: NodeId) -> Option<BlockId> {
        self.nodes[id.index()].block
    }

    pub fn operands(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].operands
    }

    pub fn operand(&self, id: NodeId, pos: usize) -> NodeId {
        self.nodes[id.index()].operands[pos]
    }

    pub fn arity(&self, id: NodeId) -> usize {
        self.nodes[id.index()].operands.len()
    }

    pub fn attr(&self, id: NodeId) -> &NodeAttr {
        &self.nodes[id.index()].attr
    }

    pub fn attr_mut(&mut self, id: NodeId) -> &mut NodeAttr {
        &mut self.nodes[id.index()].attr
    }

    pub fn mach(&self, id: NodeId) -> Option<&MachAttr> {
        self.nodes[id.index()].mach()
    }

    pub fn mach_mut(&mut self, id: NodeId) -> Option<&mut MachAttr> {
        match &mut self.nodes[id.index()].attr {
            NodeAttr::Machine(attr) => Some(attr),
            _ => None,
        }
    }

    pub fn is_proj(&self, id: NodeId) -> bool {
        self.is_ir(id, IrOp::Proj)
    }

    pub fn is_phi(&self, id: NodeId) -> bool {
        self.is_ir(id, IrOp::Phi)
    }

    pub fn proj_num(&self, id: NodeId) -> Option<u32> {
        if self.is_proj(id) {
            self.nodes[id.index()].proj_num()
        } else {
            None
        }
    }

    /// The tuple a projection selects from, or the node itself.
    pub fn skip_proj(&self, id: NodeId) -> NodeId {
        if self.is_proj(id) {
            self.operand(id, 0)
        } else {
            id
        }
    }

    /// Live projection of `tuple` with number `pn`.
    pub fn find_proj(&self, tuple: NodeId, pn: u32) -> Option<NodeId> {
        self.users(tuple)
            .iter()
            .map(|u| u.user)
            .find(|&user| self.proj_num(user) == Some(pn) && !self.node(user).is_dead())
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        !self.nodes[id.index()].dead
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.dead)
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Live nodes owned by `block`, in creation order.
    pub fn nodes_in_block(&self, block: BlockId) -> Vec<NodeId> {
        self.live_nodes()
            .filter(|&id| self.nodes[id.index()].block == Some(block))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Edges
    // ---------------------------------------------------------------------

    pub fn users(&self, id: NodeId) -> &[Use] {
        &self.users[id.index()]
    }

    pub fn num_users(&self, id: NodeId) -> usize {
        self.users[id.index()].len()
    }

    fn remove_use(&mut self, of: NodeId, user: NodeId, pos: u32) {
        let uses = &mut self.users[of.index()];
        if let Some(idx) = uses.iter().position(|u| u.user == user && u.pos == pos) {
            uses.remove(idx);
        }
    }

    pub fn set_operand(&mut self, id: NodeId, pos: usize, new: NodeId) {
        let old = self.nodes[id.index()].operands[pos];
        if old == new {
            return;
        }
        self.remove_use(old, id, pos as u32);
        self.nodes[id.index()].operands[pos] = new;
        self.users[new.index()].push(Use {
            user: id,
            pos: pos as u32,
        });
    }

    pub fn add_operand(&mut self, id: NodeId, new: NodeId) -> usize {
        let pos = self.nodes[id.index()].operands.len();
        self.nodes[id.index()].operands.push(new);
        self.users[new.index()].push(Use {
            user: id,
            pos: pos as u32,
        });
        pos
    }

    pub fn set_operands(&mut self, id: NodeId, operands: Vec<NodeId>) {
        let old = std::mem::take(&mut self.nodes[id.index()].operands);
        for (pos, operand) in old.into_iter().enumerate() {
            self.remove_use(operand, id, pos as u32);
        }
        for operand in operands {
            self.add_operand(id, operand);
        }
    }

    /// Adds `node` to the keep-alive operands of End.
    pub fn keep_alive(&mut self, node: NodeId) {
        let end = self.end;
        self.add_operand(end, node);
    }

    /// Redirects every user of `old` (operand edges and block predecessor entries) to
    /// `new`, kills `old` and records the replacement.
    pub fn exchange(&mut self, old: NodeId, new: NodeId) {
        if old == new {
            return;
        }
        let uses = std::mem::take(&mut self.users[old.index()]);
        for u in uses {
            self.nodes[u.user.index()].operands[u.pos as usize] = new;
            self.users[new.index()].push(u);
        }
        if self.mode(old) == Mode::Ctrl {
            for block in &mut self.blocks {
                for pred in &mut block.preds {
                    if *pred == old {
                        *pred = new;
                    }
                }
            }
        }
        self.kill(old);
        self.record_replacement(old, new);
    }

    /// Detaches `id` from its operands and marks it dead.
    pub fn kill(&mut self, id: NodeId) {
        let operands = std::mem::take(&mut self.nodes[id.index()].operands);
        for (pos, operand) in operands.into_iter().enumerate() {
            self.remove_use(operand, id, pos as u32);
        }
        self.nodes[id.index()].dead = true;
    }

    /// Records that `old` was replaced by `new` without touching edges.
    pub fn record_replacement(&mut self, old: NodeId, new: NodeId) {
        let target = self.resolve(new);
        if target != old {
            self.replaced[old.index()] = Some(target);
        }
    }

    /// Follows the replaced-by chain of `id`.
    pub fn resolve(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(next) = self.replaced[current.index()] {
            current = next;
        }
        current
    }

    // ---------------------------------------------------------------------
    // Blocks
    // ---------------------------------------------------------------------

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            name: name.into(),
            preds: Vec::new(),
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn block_preds(&self, id: BlockId) -> &[NodeId] {
        &self.blocks[id.index()].preds
    }

    pub fn add_block_pred(&mut self, id: BlockId, cf: NodeId) -> usize {
        let preds = &mut self.blocks[id.index()].preds;
        preds.push(cf);
        preds.len() - 1
    }

    pub fn set_block_pred(&mut self, id: BlockId, pos: usize, cf: NodeId) {
        self.blocks[id.index()].preds[pos] = cf;
    }

    /// Block that control predecessor `pos` of `id` leaves from.
    pub fn pred_block(&self, id: BlockId, pos: usize) -> Option<BlockId> {
        self.blocks[id.index()]
            .preds
            .get(pos)
            .and_then(|&cf| self.block_of(cf))
    }

    /// Control-flow successors of every block, indexed by block.
    pub fn successors(&self) -> Vec<Vec<BlockId>> {
        let mut succs = vec![Vec::new(); self.blocks.len()];
        for target in self.blocks() {
            for &cf in self.block_preds(target) {
                if let Some(src) = self.block_of(cf) {
                    if !succs[src.index()].contains(&target) {
                        succs[src.index()].push(target);
                    }
                }
            }
        }
        succs
    }

    /// Maps every control-flow node to the block it transfers control to.
    pub fn cf_targets(&self) -> HashMap<NodeId, BlockId> {
        let mut targets = HashMap::new();
        for block in self.blocks() {
            for &cf in self.block_preds(block) {
                targets.insert(cf, block);
            }
        }
        targets
    }

    // ---------------------------------------------------------------------
    // Walking
    // ---------------------------------------------------------------------

    /// Starts a new visited generation, invalidating all marks.
    pub fn inc_visited(&self) {
        let mut visited = self.visited.borrow_mut();
        if visited.len() < self.nodes.len() {
            visited.resize(self.nodes.len(), 0);
        }
        self.visit_generation.set(self.visit_generation.get() + 1);
    }

    /// Marks `id` visited, returning false if it already was.
    pub fn mark_visited(&self, id: NodeId) -> bool {
        let generation = self.visit_generation.get();
        let mut visited = self.visited.borrow_mut();
        if visited.len() <= id.index() {
            visited.resize(self.nodes.len(), 0);
        }
        if visited[id.index()] == generation {
            false
        } else {
            visited[id.index()] = generation;
            true
        }
    }

    pub fn is_visited(&self, id: NodeId) -> bool {
        self.visited
            .borrow()
            .get(id.index())
            .is_some_and(|&g| g == self.visit_generation.get())
    }

    /// Roots of the graph: End, Start and every control-flow predecessor.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots = vec![self.end, self.start];
        for block in &self.blocks {
            roots.extend(block.preds.iter().copied());
        }
        roots
    }

    /// All nodes reachable from the roots, operands before their users.
    pub fn walk_postorder(&self) -> Vec<NodeId> {
        self.inc_visited();
        let mut order = Vec::new();
        let mut stack: Vec<(NodeId, usize)> = Vec::new();
        for root in self.roots() {
            if self.node(root).dead || !self.mark_visited(root) {
                continue;
            }
            stack.push((root, 0));
            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                if let Some(&operand) = self.nodes[node.index()].operands.get(next) {
                    top.1 += 1;
                    if self.mark_visited(operand) {
                        stack.push((operand, 0));
                    }
                } else {
                    order.push(node);
                    stack.pop();
                }
            }
        }
        order
    }

    /// Kills every node not reachable from the roots. Returns the number removed.
    pub fn remove_unreachable(&mut self) -> usize {
        self.walk_postorder();
        let anchors = [self.start, self.end, self.no_mem, self.no_reg];
        let dead: Vec<NodeId> = self
            .live_nodes()
            .filter(|&id| !self.is_visited(id) && !anchors.contains(&id))
            .collect();
        for &id in &dead {
            self.kill(id);
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn konst(graph: &mut Graph, block: BlockId, value: i64) -> NodeId {
        graph.add_node(
            Opcode::Ir(IrOp::Const),
            Mode::I32,
            Some(block),
            Vec::new(),
            NodeAttr::Int(value),
        )
    }

    #[test]
    fn test_users_follow_set_operand() {
        let mut graph = Graph::new("f");
        let block = graph.add_block("entry");
        let a = konst(&mut graph, block, 1);
        let b = konst(&mut graph, block, 2);
        let add = graph.add_node(
            Opcode::Ir(IrOp::Add),
            Mode::I32,
            Some(block),
            vec![a, a],
            NodeAttr::None,
        );
        assert_eq!(graph.num_users(a), 2);

        graph.set_operand(add, 1, b);
        assert_eq!(graph.num_users(a), 1);
        assert_eq!(graph.users(b), &[Use { user: add, pos: 1 }]);
    }

    #[test]
    fn test_exchange_redirects_and_records() {
        let mut graph = Graph::new("f");
        let block = graph.add_block("entry");
        let a = konst(&mut graph, block, 1);
        let b = konst(&mut graph, block, 2);
        let c = konst(&mut graph, block, 3);
        let add = graph.add_node(
            Opcode::Ir(IrOp::Add),
            Mode::I32,
            Some(block),
            vec![a, b],
            NodeAttr::None,
        );

        graph.exchange(a, b);
        graph.exchange(b, c);
        assert_eq!(graph.operands(add), &[c, c]);
        assert!(!graph.is_live(a));
        assert_eq!(graph.resolve(a), c);
        assert_eq!(graph.num_users(c), 2);
    }

    #[test]
    fn test_remove_unreachable_keeps_rooted_nodes() {
        let mut graph = Graph::new("f");
        let block = graph.add_block("entry");
        let a = konst(&mut graph, block, 1);
        let orphan = konst(&mut graph, block, 9);
        graph.keep_alive(a);

        assert_eq!(graph.remove_unreachable(), 1);
        assert!(graph.is_live(a));
        assert!(!graph.is_live(orphan));
    }

    #[test]
    fn test_frame_layout_aligns_slots() {
        let mut frame = Frame::default();
        let a = frame.alloc("a", 4, 4);
        let b = frame.alloc("b", 8, 8);
        let layout = frame.layout();
        assert_eq!(layout.offset(a), -4);
        assert_eq!(layout.offset(b), -16);
        assert_eq!(layout.size(), 16);
    }
}
