// This module implements Schedule, the per-block linear instruction order produced by the
// list scheduler and consumed by the emitter and the query layer. The order is kept in a
// side structure rather than in the nodes: every block has first/last links, every scheduled
// node has prev/next links and a time step. Time steps are gap-numbered so that insertions
// between two neighbours usually find a free number; when they collide the whole block is
// renumbered. The module also defines which nodes take part in scheduling at all (memory
// merges, End and graph-anchored pseudo values do not) and the in-block dependency relation
// shared by the scheduler and the schedule verifier.

use crate::ir::{BlockId, Graph, IrOp, NodeId};

/// Distance between consecutive time steps after numbering.
const STEP_GAP: u32 = 1 << 10;

#[derive(Debug, Clone, Copy)]
struct Link {
    block: BlockId,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    step: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockEnds {
    first: Option<NodeId>,
    last: Option<NodeId>,
    len: usize,
}

/// Linear order of the nodes of every block.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    blocks: Vec<BlockEnds>,
    links: Vec<Option<Link>>,
}

impl Schedule {
    pub fn new(graph: &Graph) -> Self {
        Self {
            blocks: vec![BlockEnds::default(); graph.block_count()],
            links: vec![None; graph.node_count()],
        }
    }

    fn ends(&self, block: BlockId) -> BlockEnds {
        self.blocks.get(block.index()).copied().unwrap_or_default()
    }

    fn ends_mut(&mut self, block: BlockId) -> &mut BlockEnds {
        if self.blocks.len() <= block.index() {
            self.blocks.resize(block.index() + 1, BlockEnds::default());
        }
        &mut self.blocks[block.index()]
    }

    fn link(&self, node: NodeId) -> Option<Link> {
        self.links.get(node.index()).copied().flatten()
    }

    fn link_mut(&mut self, node: NodeId) -> Option<&mut Link> {
        self.links.get_mut(node.index()).and_then(|l| l.as_mut())
    }

    fn set_link(&mut self, node: NodeId, link: Link) {
        if self.links.len() <= node.index() {
            self.links.resize(node.index() + 1, None);
        }
        self.links[node.index()] = Some(link);
    }

    pub fn first(&self, block: BlockId) -> Option<NodeId> {
        self.ends(block).first
    }

    pub fn last(&self, block: BlockId) -> Option<NodeId> {
        self.ends(block).last
    }

    pub fn next(&self, node: NodeId) -> Option<NodeId> {
        self.link(node).and_then(|l| l.next)
    }

    pub fn prev(&self, node: NodeId) -> Option<NodeId> {
        self.link(node).and_then(|l| l.prev)
    }

    /// Position of `node` in its block, increasing along the schedule.
    pub fn time_step(&self, node: NodeId) -> Option<u32> {
        self.link(node).map(|l| l.step)
    }

    pub fn is_scheduled(&self, node: NodeId) -> bool {
        self.link(node).is_some()
    }

    /// Block `node` was scheduled in.
    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        self.link(node).map(|l| l.block)
    }

    /// Number of nodes scheduled in `block`.
    pub fn len(&self, block: BlockId) -> usize {
        self.ends(block).len
    }

    pub fn is_empty(&self, block: BlockId) -> bool {
        self.len(block) == 0
    }

    pub fn push_back(&mut self, block: BlockId, node: NodeId) {
        if self.is_scheduled(node) {
            self.remove(node);
        }
        let last = self.last(block);
        let step = match last.and_then(|l| self.time_step(l)) {
            Some(s) => s.saturating_add(STEP_GAP),
            None => STEP_GAP,
        };
        self.set_link(
            node,
            Link {
                block,
                prev: last,
                next: None,
                step,
            },
        );
        match last.and_then(|l| self.link_mut(l)) {
            Some(link) => link.next = Some(node),
            None => self.ends_mut(block).first = Some(node),
        }
        let ends = self.ends_mut(block);
        ends.last = Some(node);
        ends.len += 1;
        if step == u32::MAX {
            self.renumber(block);
        }
    }

    /// Inserts `node` right before the scheduled node `pos`.
    pub fn insert_before(&mut self, pos: NodeId, node: NodeId) {
        if pos == node {
            return;
        }
        let Some(link) = self.link(pos) else {
            return;
        };
        match link.prev {
            Some(prev) => self.insert_after(prev, node),
            None => {
                if self.is_scheduled(node) {
                    self.remove(node);
                }
                let block = link.block;
                // `remove` may have changed the neighbourhood of `pos`
                let first = self.first(block);
                let step = self.time_step(pos).unwrap_or(STEP_GAP) / 2;
                self.set_link(
                    node,
                    Link {
                        block,
                        prev: None,
                        next: first,
                        step,
                    },
                );
                if let Some(f) = first.and_then(|f| self.link_mut(f)) {
                    f.prev = Some(node);
                }
                let ends = self.ends_mut(block);
                ends.first = Some(node);
                if ends.last.is_none() {
                    ends.last = Some(node);
                }
                ends.len += 1;
                if Some(step) >= first.and_then(|f| self.time_step(f)) {
                    self.renumber(block);
                }
            }
        }
    }

    /// Inserts `node` right after the scheduled node `pos`.
    pub fn insert_after(&mut self, pos: NodeId, node: NodeId) {
        if pos == node {
            return;
        }
        if self.is_scheduled(node) {
            self.remove(node);
        }
        let Some(link) = self.link(pos) else {
            return;
        };
        let block = link.block;
        let next = link.next;
        let lo = link.step;
        let step = match next.and_then(|n| self.time_step(n)) {
            Some(hi) => lo + (hi.saturating_sub(lo)) / 2,
            None => lo.saturating_add(STEP_GAP),
        };
        self.set_link(
            node,
            Link {
                block,
                prev: Some(pos),
                next,
                step,
            },
        );
        if let Some(l) = self.link_mut(pos) {
            l.next = Some(node);
        }
        match next.and_then(|n| self.link_mut(n)) {
            Some(l) => l.prev = Some(node),
            None => self.ends_mut(block).last = Some(node),
        }
        self.ends_mut(block).len += 1;
        let collides = step == lo || next.and_then(|n| self.time_step(n)) == Some(step);
        if collides || step == u32::MAX {
            self.renumber(block);
        }
    }

    /// Unlinks `node` from its block.
    pub fn remove(&mut self, node: NodeId) {
        let Some(link) = self.link(node) else {
            return;
        };
        match link.prev.and_then(|p| self.link_mut(p)) {
            Some(p) => p.next = link.next,
            None => self.ends_mut(link.block).first = link.next,
        }
        match link.next.and_then(|n| self.link_mut(n)) {
            Some(n) => n.prev = link.prev,
            None => self.ends_mut(link.block).last = link.prev,
        }
        let ends = self.ends_mut(link.block);
        ends.len = ends.len.saturating_sub(1);
        self.links[node.index()] = None;
    }

    fn renumber(&mut self, block: BlockId) {
        log::trace!("renumbering time steps of {}", block);
        let mut step = STEP_GAP;
        let mut current = self.first(block);
        while let Some(node) = current {
            let Some(link) = self.link_mut(node) else {
                break;
            };
            link.step = step;
            current = link.next;
            step = step.saturating_add(STEP_GAP);
        }
    }

    /// Scheduled nodes of `block` in order.
    pub fn iter(&self, block: BlockId) -> ScheduleIter<'_> {
        ScheduleIter {
            schedule: self,
            current: self.first(block),
        }
    }

    pub fn nodes(&self, block: BlockId) -> Vec<NodeId> {
        self.iter(block).collect()
    }
}

pub struct ScheduleIter<'a> {
    schedule: &'a Schedule,
    current: Option<NodeId>,
}

impl Iterator for ScheduleIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let node = self.current?;
        self.current = self.schedule.next(node);
        Some(node)
    }
}

/// Whether `node` takes part in scheduling.
pub fn is_schedulable(graph: &Graph, node: NodeId) -> bool {
    if !graph.is_live(node) || graph.block_of(node).is_none() {
        return false;
    }
    !matches!(graph.ir_op(node), Some(IrOp::Sync | IrOp::End | IrOp::NoMem | IrOp::NoReg))
}

/// Schedulable operands of `node` within its own block. Memory merges are looked through,
/// so a node depending on a Sync depends on every in-block operand the Sync merges. Phi
/// operands flow along control edges and never count.
pub fn block_operands(graph: &Graph, node: NodeId) -> Vec<NodeId> {
    let mut deps = Vec::new();
    let Some(block) = graph.block_of(node) else {
        return deps;
    };
    if graph.is_phi(node) {
        return deps;
    }
    let mut stack: Vec<NodeId> = graph.operands(node).to_vec();
    let mut seen_syncs = Vec::new();
    while let Some(operand) = stack.pop() {
        if graph.is_ir(operand, IrOp::Sync) {
            if !seen_syncs.contains(&operand) {
                seen_syncs.push(operand);
                stack.extend_from_slice(graph.operands(operand));
            }
            continue;
        }
        if graph.block_of(operand) == Some(block)
            && is_schedulable(graph, operand)
            && !deps.contains(&operand)
        {
            deps.push(operand);
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u32) -> Vec<NodeId> {
        (0..n).map(NodeId).collect()
    }

    #[test]
    fn test_push_and_iterate() {
        let graph = Graph::new("f");
        let block = graph.start_block();
        let mut sched = Schedule::new(&graph);
        let n = ids(3);
        for &id in &n {
            sched.push_back(block, id);
        }
        assert_eq!(sched.nodes(block), n);
        assert_eq!(sched.first(block), Some(n[0]));
        assert_eq!(sched.last(block), Some(n[2]));
        assert_eq!(sched.prev(n[1]), Some(n[0]));
        assert!(sched.time_step(n[0]) < sched.time_step(n[1]));
        assert_eq!(sched.len(block), 3);
    }

    #[test]
    fn test_insertion_keeps_steps_increasing() {
        let graph = Graph::new("f");
        let block = graph.start_block();
        let mut sched = Schedule::new(&graph);
        sched.push_back(block, NodeId(0));
        sched.push_back(block, NodeId(1));
        // enough insertions between the same neighbours to exhaust the gap
        for i in 2..20 {
            sched.insert_after(NodeId(0), NodeId(i));
        }
        sched.insert_before(NodeId(0), NodeId(20));

        let order = sched.nodes(block);
        assert_eq!(order.first(), Some(&NodeId(20)));
        assert_eq!(order.last(), Some(&NodeId(1)));
        let steps: Vec<u32> = order.iter().filter_map(|&n| sched.time_step(n)).collect();
        assert!(steps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_remove_relinks_neighbours() {
        let graph = Graph::new("f");
        let block = graph.start_block();
        let mut sched = Schedule::new(&graph);
        for id in ids(3) {
            sched.push_back(block, id);
        }
        sched.remove(NodeId(1));
        assert_eq!(sched.nodes(block), vec![NodeId(0), NodeId(2)]);
        assert!(!sched.is_scheduled(NodeId(1)));
        sched.remove(NodeId(2));
        assert_eq!(sched.last(block), Some(NodeId(0)));
    }
}
