// This module implements the control-flow analyses the backend consumes from its IR layer:
// reverse post-order block ordering, the dominator tree and SSA liveness. The block order is
// computed by a depth-first walk over successors starting at the start block; dominators use
// the iterative intersection algorithm of Cooper, Harvey and Kennedy over that order, and
// liveness is the usual backward dataflow where a Phi operand counts as a use at the end of
// the corresponding predecessor block. Only value-carrying nodes (data and condition flags)
// take part in liveness; memory and control tokens are never register candidates.

use std::collections::HashSet;

use super::graph::Graph;
use super::node::{BlockId, NodeId};

/// Blocks reachable from the start block in reverse post-order.
pub fn reverse_postorder(graph: &Graph) -> Vec<BlockId> {
    let succs = graph.successors();
    let mut visited = vec![false; graph.block_count()];
    let mut postorder = Vec::with_capacity(graph.block_count());
    let mut stack: Vec<(BlockId, usize)> = vec![(graph.start_block(), 0)];
    visited[graph.start_block().index()] = true;

    while let Some(top) = stack.last_mut() {
        let (block, next) = *top;
        if let Some(&succ) = succs[block.index()].get(next) {
            top.1 += 1;
            if !visited[succ.index()] {
                visited[succ.index()] = true;
                stack.push((succ, 0));
            }
        } else {
            postorder.push(block);
            stack.pop();
        }
    }

    postorder.reverse();
    postorder
}

/// Dominator tree over the reachable blocks.
#[derive(Debug, Clone)]
pub struct DomTree {
    order: Vec<BlockId>,
    rpo_index: Vec<Option<usize>>,
    idom: Vec<Option<BlockId>>,
}

impl DomTree {
    pub fn compute(graph: &Graph) -> Self {
        let order = reverse_postorder(graph);
        let mut rpo_index = vec![None; graph.block_count()];
        for (i, &block) in order.iter().enumerate() {
            rpo_index[block.index()] = Some(i);
        }

        let preds: Vec<Vec<BlockId>> = graph
            .blocks()
            .map(|b| {
                graph
                    .block_preds(b)
                    .iter()
                    .filter_map(|&cf| graph.block_of(cf))
                    .filter(|p| rpo_index[p.index()].is_some())
                    .collect()
            })
            .collect();

        let mut idom: Vec<Option<BlockId>> = vec![None; graph.block_count()];
        let start = graph.start_block();
        idom[start.index()] = Some(start);

        let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| -> BlockId {
            let index = |x: BlockId| rpo_index[x.index()].unwrap_or(usize::MAX);
            while a != b {
                while index(a) > index(b) {
                    match idom[a.index()] {
                        Some(up) => a = up,
                        None => return b,
                    }
                }
                while index(b) > index(a) {
                    match idom[b.index()] {
                        Some(up) => b = up,
                        None => return a,
                    }
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in order.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in &preds[block.index()] {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, pred, current),
                    });
                }
                if new_idom.is_some() && idom[block.index()] != new_idom {
                    idom[block.index()] = new_idom;
                    changed = true;
                }
            }
        }

        Self {
            order,
            rpo_index,
            idom,
        }
    }

    /// Reachable blocks in reverse post-order.
    pub fn rpo(&self) -> &[BlockId] {
        &self.order
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_index.get(block.index()).is_some_and(|i| i.is_some())
    }

    /// Immediate dominator, `None` for the start block and unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        match self.idom.get(block.index()).copied().flatten() {
            Some(up) if up != block => Some(up),
            _ => None,
        }
    }

    /// Reflexive block dominance.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom(current) {
                Some(up) => current = up,
                None => return false,
            }
        }
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }
}

/// Per-block live-in and live-out value sets.
#[derive(Debug, Clone)]
pub struct Liveness {
    live_in: Vec<HashSet<NodeId>>,
    live_out: Vec<HashSet<NodeId>>,
}

impl Liveness {
    pub fn compute(graph: &Graph) -> Self {
        let count = graph.block_count();
        let mut uses: Vec<HashSet<NodeId>> = vec![HashSet::new(); count];
        let mut phi_uses: Vec<HashSet<NodeId>> = vec![HashSet::new(); count];
        let mut defs: Vec<HashSet<NodeId>> = vec![HashSet::new(); count];

        for node in graph.live_nodes() {
            let Some(block) = graph.block_of(node) else {
                continue;
            };
            defs[block.index()].insert(node);
            if graph.is_phi(node) {
                for (pos, &operand) in graph.operands(node).iter().enumerate() {
                    if !is_tracked(graph, operand) {
                        continue;
                    }
                    if let Some(pred) = graph.pred_block(block, pos) {
                        phi_uses[pred.index()].insert(operand);
                    }
                }
                continue;
            }
            for &operand in graph.operands(node) {
                if is_tracked(graph, operand) && graph.block_of(operand) != Some(block) {
                    uses[block.index()].insert(operand);
                }
            }
        }

        let succs = graph.successors();
        let mut order = reverse_postorder(graph);
        order.reverse();

        let mut live_in: Vec<HashSet<NodeId>> = vec![HashSet::new(); count];
        let mut live_out: Vec<HashSet<NodeId>> = vec![HashSet::new(); count];
        let mut changed = true;
        while changed {
            changed = false;
            for &block in &order {
                let b = block.index();
                let mut out = phi_uses[b].clone();
                for succ in &succs[b] {
                    out.extend(live_in[succ.index()].iter().copied());
                }
                let mut inn = uses[b].clone();
                inn.extend(out.iter().filter(|v| !defs[b].contains(v)).copied());
                if out != live_out[b] || inn != live_in[b] {
                    live_out[b] = out;
                    live_in[b] = inn;
                    changed = true;
                }
            }
        }

        Self { live_in, live_out }
    }

    pub fn is_live_in(&self, block: BlockId, value: NodeId) -> bool {
        self.live_in
            .get(block.index())
            .is_some_and(|set| set.contains(&value))
    }

    /// Whether `value` is live at the end of `block`.
    pub fn is_live_end(&self, block: BlockId, value: NodeId) -> bool {
        self.live_out
            .get(block.index())
            .is_some_and(|set| set.contains(&value))
    }
}

fn is_tracked(graph: &Graph, node: NodeId) -> bool {
    graph.block_of(node).is_some() && graph.mode(node).is_datab()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, Mode, Relation};

    /// entry -> (then | else) -> join, with a value defined in entry used in join.
    fn diamond() -> (Graph, [BlockId; 4], NodeId) {
        let mut b = GraphBuilder::new("diamond", &[Mode::I32]);
        let entry = b.start_block();
        let then = b.new_block("then");
        let other = b.new_block("else");
        let join = b.new_block("join");

        let x = b.arg(0);
        let zero = b.konst(Mode::I32, 0);
        let cmp = b.cmp(Relation::Lt, x, zero);
        b.cond(cmp, then, other);

        b.switch_to(then);
        b.jmp(join);
        b.switch_to(other);
        b.jmp(join);

        b.switch_to(join);
        let mem = b.initial_mem();
        b.ret(mem, &[x]);
        (b.finish(), [entry, then, other, join], x)
    }

    #[test]
    fn test_dominators_of_diamond() {
        let (graph, [entry, then, other, join], _) = diamond();
        let dom = DomTree::compute(&graph);
        assert_eq!(dom.idom(join), Some(entry));
        assert_eq!(dom.idom(then), Some(entry));
        assert!(dom.dominates(entry, join));
        assert!(!dom.dominates(then, join));
        assert!(dom.dominates(join, join));
        assert!(!dom.strictly_dominates(join, join));
        assert!(dom.dominates(graph.start_block(), other));
        assert!(dom.dominates(join, graph.end_block()));
    }

    #[test]
    fn test_liveness_crosses_branches() {
        let (graph, [entry, then, _, join], x) = diamond();
        let live = Liveness::compute(&graph);
        assert!(live.is_live_end(entry, x));
        assert!(live.is_live_in(then, x));
        assert!(live.is_live_in(join, x));
        assert!(!live.is_live_end(join, x));
    }
}
