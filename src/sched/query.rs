// This module is the dominance and scheduling query layer. It answers whether the
// definition of one value occurs before another (across blocks through the dominator tree,
// within a block through schedule time steps), whether the live ranges of two values
// overlap, and, through the Heights oracle, whether one node is reachable from another
// along operand edges inside a block. Heights are the length of the longest in-block
// operand chain below a node; a node can only reach nodes of smaller height, which prunes
// most reachability walks. The address-mode optimizer relies on that oracle to avoid
// folding a load into an operation that (transitively) feeds the load itself.

use crate::ir::{BlockId, DomTree, Graph, Liveness, NodeId};

use super::schedule::Schedule;

/// Whether the definition of `a` dominates the definition of `b`. Reflexive.
///
/// Graph-anchored values dominate everything. Within one block the schedule decides.
pub fn value_dominates(
    graph: &Graph,
    schedule: &Schedule,
    dom: &DomTree,
    a: NodeId,
    b: NodeId,
) -> bool {
    if a == b {
        return true;
    }
    let (Some(block_a), Some(block_b)) = (graph.block_of(a), graph.block_of(b)) else {
        return graph.block_of(a).is_none();
    };
    if block_a != block_b {
        return dom.dominates(block_a, block_b);
    }
    match (schedule.time_step(a), schedule.time_step(b)) {
        (Some(sa), Some(sb)) => sa <= sb,
        _ => false,
    }
}

pub fn value_strictly_dominates(
    graph: &Graph,
    schedule: &Schedule,
    dom: &DomTree,
    a: NodeId,
    b: NodeId,
) -> bool {
    a != b && value_dominates(graph, schedule, dom, a, b)
}

/// Whether the live ranges of `a` and `b` overlap.
///
/// SSA live ranges can only intersect if one definition dominates the other. The later
/// value `b` then interferes with `a` when `a` is live out of `b`'s block, or when a
/// non-Phi user of `a` in that block comes after `b`.
pub fn values_interfere(
    graph: &Graph,
    schedule: &Schedule,
    dom: &DomTree,
    liveness: &Liveness,
    a: NodeId,
    b: NodeId,
) -> bool {
    if a == b {
        return true;
    }
    let (a, b) = if value_dominates(graph, schedule, dom, a, b) {
        (a, b)
    } else if value_dominates(graph, schedule, dom, b, a) {
        (b, a)
    } else {
        return false;
    };
    let Some(block_b) = graph.block_of(b) else {
        return false;
    };
    if liveness.is_live_end(block_b, a) {
        return true;
    }
    graph.users(a).iter().any(|u| {
        let user = u.user;
        graph.is_live(user)
            && !graph.is_phi(user)
            && graph.block_of(user) == Some(block_b)
            && value_strictly_dominates(graph, schedule, dom, b, user)
    })
}

/// In-block operand heights of every node.
#[derive(Debug, Clone, Default)]
pub struct Heights {
    heights: Vec<u32>,
}

impl Heights {
    pub fn compute(graph: &Graph) -> Self {
        let mut heights = Self {
            heights: vec![0; graph.node_count()],
        };
        for block in graph.blocks() {
            heights.recompute_block(graph, block);
        }
        heights
    }

    /// Height of `node`: 1 plus the largest height of its in-block operands. Phis start
    /// new chains.
    pub fn height(&self, node: NodeId) -> u32 {
        self.heights.get(node.index()).copied().unwrap_or(0)
    }

    /// Recomputes the heights of `block` after it was rewritten.
    pub fn recompute_block(&mut self, graph: &Graph, block: BlockId) {
        if self.heights.len() < graph.node_count() {
            self.heights.resize(graph.node_count(), 0);
        }
        let nodes = graph.nodes_in_block(block);
        for &node in &nodes {
            self.heights[node.index()] = 0;
        }
        // 0 = unvisited, 1 = in progress, 2 = done
        let mut state: hashbrown::HashMap<NodeId, u8> =
            hashbrown::HashMap::with_capacity(nodes.len());
        for &root in &nodes {
            if state.contains_key(&root) {
                continue;
            }
            let mut stack = vec![(root, 0usize)];
            state.insert(root, 1);
            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                let operands = if graph.is_phi(node) { &[][..] } else { graph.operands(node) };
                if let Some(&operand) = operands.get(next) {
                    top.1 += 1;
                    if graph.block_of(operand) == Some(block) && !state.contains_key(&operand) {
                        state.insert(operand, 1);
                        stack.push((operand, 0));
                    }
                    continue;
                }
                let height = 1 + operands
                    .iter()
                    .filter(|&&o| graph.block_of(o) == Some(block) && state.get(&o) == Some(&2))
                    .map(|&o| self.heights[o.index()])
                    .max()
                    .unwrap_or(0);
                self.heights[node.index()] = height;
                state.insert(node, 2);
                stack.pop();
            }
        }
    }

    /// Whether `target` is reachable from `from` along operand edges inside their block.
    /// Reflexive.
    pub fn reachable_in_block(&self, graph: &Graph, from: NodeId, target: NodeId) -> bool {
        if from == target {
            return true;
        }
        let block = graph.block_of(from);
        if block.is_none() || graph.block_of(target) != block {
            return false;
        }
        let target_height = self.height(target);
        if target_height >= self.height(from) {
            return false;
        }
        let mut visited = hashbrown::HashSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if graph.is_phi(node) {
                continue;
            }
            for &operand in graph.operands(node) {
                if operand == target {
                    return true;
                }
                if graph.block_of(operand) == block
                    && self.height(operand) > target_height
                    && visited.insert(operand)
                {
                    stack.push(operand);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, Mode};

    #[test]
    fn test_heights_and_reachability() {
        let mut b = GraphBuilder::new("f", &[Mode::I32, Mode::I32]);
        let x = b.arg(0);
        let y = b.arg(1);
        let sum = b.add(x, y);
        let twice = b.add(sum, sum);
        let other = b.sub(x, y);
        let mem = b.initial_mem();
        b.ret(mem, &[twice, other]);
        let graph = b.finish();

        let heights = Heights::compute(&graph);
        assert!(heights.height(twice) > heights.height(sum));
        assert!(heights.height(sum) > heights.height(x));
        assert!(heights.reachable_in_block(&graph, twice, x));
        assert!(!heights.reachable_in_block(&graph, sum, twice));
        assert!(!heights.reachable_in_block(&graph, other, sum));
    }

    #[test]
    fn test_value_dominance_within_block_follows_schedule() {
        let mut b = GraphBuilder::new("f", &[Mode::I32]);
        let x = b.arg(0);
        let one = b.konst(Mode::I32, 1);
        let inc = b.add(x, one);
        let mem = b.initial_mem();
        b.ret(mem, &[inc]);
        let graph = b.finish();
        let dom = DomTree::compute(&graph);
        let live = Liveness::compute(&graph);

        let block = graph.start_block();
        let mut schedule = Schedule::new(&graph);
        for node in [graph.start(), x, one, inc] {
            schedule.push_back(block, node);
        }
        assert!(value_dominates(&graph, &schedule, &dom, x, inc));
        assert!(!value_dominates(&graph, &schedule, &dom, inc, x));
        assert!(value_dominates(&graph, &schedule, &dom, graph.no_mem(), inc));
        assert!(!value_strictly_dominates(&graph, &schedule, &dom, inc, inc));

        // x is still needed by the add when `one` is defined
        assert!(values_interfere(&graph, &schedule, &dom, &live, x, one));
        // the add consumes x, after that x is dead
        assert!(!values_interfere(&graph, &schedule, &dom, &live, x, inc));
    }
}
