// This module implements the list scheduler. Each block is scheduled on its own: the roots
// of the block's dependency DAG (nodes without an in-block, non-Phi consumer) seed a
// depth-first descent that yields the block's nodes users-before-operands, over which the
// delay of every node is computed as the longest latency-weighted path to the block's end.
// The ready set starts with Phis (scheduled at once), Start with its projections, and all
// nodes whose operands live outside the block. The selection loop narrows the ready set to
// candidates of maximum delay and, among those, the ones whose earliest start time has
// passed, forcing keep-alives and letting a pluggable heuristic break ties. Tuples pull
// their projections into the schedule right behind them. Target timing comes from the
// SchedTarget trait; per-node state lives in a bumpalo arena that is reset per block.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::HashMap;

use crate::core::error::{CompileError, CompileResult};
use crate::ir::{BlockId, Graph, IrOp, Mode, NodeId};
use crate::x64::X64Op;

use super::schedule::{block_operands, is_schedulable, Schedule};

/// Scheduling class of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// Ends the block, scheduled last.
    Branch,
    /// Materializes a constant without inputs.
    Const,
    /// Keep-alive, scheduled as soon as it is ready.
    Keep,
    Normal,
}

/// Classification shared by target-independent and machine nodes.
pub fn default_class(graph: &Graph, node: NodeId) -> NodeClass {
    if let Some(op) = graph.x64_op(node) {
        return match op {
            X64Op::Keep => NodeClass::Keep,
            op if op.is_branch() => NodeClass::Branch,
            op if op.is_const() => NodeClass::Const,
            _ => NodeClass::Normal,
        };
    }
    match graph.ir_op(node) {
        Some(IrOp::Jmp | IrOp::Cond | IrOp::Switch | IrOp::Return) => NodeClass::Branch,
        Some(IrOp::Const | IrOp::SymConst) => NodeClass::Const,
        _ => NodeClass::Normal,
    }
}

/// Target timing callbacks of the scheduler.
pub trait SchedTarget {
    fn classify(&self, graph: &Graph, node: NodeId) -> NodeClass {
        default_class(graph, node)
    }

    /// Cycles `node` occupies.
    fn exectime(&self, _graph: &Graph, _node: NodeId) -> u32 {
        1
    }

    /// Cycles between `pred` starting and its result being available to `succ`.
    fn latency(&self, _graph: &Graph, _pred: NodeId, _succ: NodeId) -> u32 {
        1
    }
}

/// Unit timing for every node.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericTarget;

impl SchedTarget for GenericTarget {}

/// Per-node scheduling state of the current block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedInfo {
    pub delay: u32,
    /// Earliest time the node can start without stalling.
    pub etime: u32,
    pub scheduled: bool,
    pub root: bool,
    pub ready: bool,
    /// Unscheduled in-block dependencies.
    pending: u32,
}

/// Read-only view of the block being scheduled, handed to heuristics.
pub struct SelectContext<'a> {
    pub graph: &'a Graph,
    pub target: &'a dyn SchedTarget,
    pub block: BlockId,
    index: &'a HashMap<NodeId, usize>,
    infos: &'a [SchedInfo],
}

impl SelectContext<'_> {
    pub fn in_block(&self, node: NodeId) -> bool {
        self.index.contains_key(&node)
    }

    /// Nodes outside the block count as scheduled.
    pub fn is_scheduled(&self, node: NodeId) -> bool {
        match self.index.get(&node) {
            Some(&i) => self.infos[i].scheduled,
            None => true,
        }
    }

    pub fn info(&self, node: NodeId) -> Option<&SchedInfo> {
        self.index.get(&node).map(|&i| &self.infos[i])
    }

    pub fn class(&self, node: NodeId) -> NodeClass {
        self.target.classify(self.graph, node)
    }

    pub fn is_branch(&self, node: NodeId) -> bool {
        self.class(node) == NodeClass::Branch
    }
}

/// Tie-breaking policy among scheduling candidates.
pub trait SchedHeuristic {
    /// Picks one of `cands`, which is never empty.
    fn select(&mut self, ctx: &SelectContext<'_>, cands: &[NodeId]) -> NodeId;
}

/// Takes the first candidate that is neither a branch nor a constant, then the first
/// non-branch, and finally a branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialHeuristic;

impl SchedHeuristic for TrivialHeuristic {
    fn select(&mut self, ctx: &SelectContext<'_>, cands: &[NodeId]) -> NodeId {
        cands
            .iter()
            .copied()
            .find(|&n| !matches!(ctx.class(n), NodeClass::Branch | NodeClass::Const))
            .or_else(|| cands.iter().copied().find(|&n| !ctx.is_branch(n)))
            .unwrap_or(cands[0])
    }
}

/// Prefers the non-branch candidate whose operands and results are closest to the
/// already scheduled region, keeping live ranges short.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegPressureHeuristic;

impl RegPressureHeuristic {
    /// Longest walk from a user of `value` up its unscheduled in-block operands until the
    /// scheduled region is reached.
    fn max_hops(ctx: &SelectContext<'_>, value: NodeId) -> u32 {
        let mut res = 0;
        for u in ctx.graph.users(value) {
            let mut visited = hashbrown::HashSet::new();
            res = res.max(Self::hops_walker(ctx, u.user, 0, &mut visited));
        }
        res
    }

    fn hops_walker(
        ctx: &SelectContext<'_>,
        node: NodeId,
        depth: u32,
        visited: &mut hashbrown::HashSet<NodeId>,
    ) -> u32 {
        if !ctx.in_block(node) {
            return 0;
        }
        if ctx.is_scheduled(node) {
            return depth;
        }
        let mut res = 0;
        for &operand in ctx.graph.operands(node) {
            if visited.insert(operand) {
                res = res.max(Self::hops_walker(ctx, operand, depth + 1, visited));
            }
        }
        res
    }

    fn result_hops(ctx: &SelectContext<'_>, node: NodeId) -> u32 {
        match ctx.graph.mode(node) {
            Mode::Tuple => ctx
                .graph
                .users(node)
                .iter()
                .filter(|u| ctx.graph.is_proj(u.user))
                .map(|u| Self::result_hops(ctx, u.user))
                .sum(),
            mode if mode.is_data() => Self::max_hops(ctx, node),
            _ => 0,
        }
    }

    fn costs(ctx: &SelectContext<'_>, node: NodeId) -> u32 {
        let operand_hops: u32 = ctx
            .graph
            .operands(node)
            .iter()
            .filter(|&&op| is_schedulable(ctx.graph, op))
            .map(|&op| Self::max_hops(ctx, op))
            .sum();
        operand_hops + Self::result_hops(ctx, node)
    }
}

impl SchedHeuristic for RegPressureHeuristic {
    fn select(&mut self, ctx: &SelectContext<'_>, cands: &[NodeId]) -> NodeId {
        let mut best: Option<(u32, NodeId)> = None;
        for &cand in cands {
            if ctx.is_branch(cand) {
                continue;
            }
            let cost = Self::costs(ctx, cand);
            log::trace!("reg pressure cost of {} is {}", cand, cost);
            if best.map_or(true, |(c, _)| cost < c) {
                best = Some((cost, cand));
            }
        }
        best.map(|(_, n)| n).unwrap_or(cands[0])
    }
}

struct BlockScheduler<'a, 'bump> {
    graph: &'a Graph,
    target: &'a dyn SchedTarget,
    block: BlockId,
    index: HashMap<NodeId, usize>,
    nodes: BumpVec<'bump, NodeId>,
    infos: BumpVec<'bump, SchedInfo>,
    /// In-block dependencies and users by local index.
    deps: BumpVec<'bump, BumpVec<'bump, usize>>,
    users: BumpVec<'bump, BumpVec<'bump, usize>>,
    ready: Vec<usize>,
    curr_time: u32,
    scheduled: usize,
}

impl<'a, 'bump> BlockScheduler<'a, 'bump> {
    fn new(
        graph: &'a Graph,
        target: &'a dyn SchedTarget,
        block: BlockId,
        bump: &'bump Bump,
    ) -> Self {
        let mut nodes = BumpVec::new_in(bump);
        nodes.extend(
            graph
                .nodes_in_block(block)
                .into_iter()
                .filter(|&n| is_schedulable(graph, n)),
        );
        let index: HashMap<NodeId, usize> =
            nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        let mut deps = BumpVec::with_capacity_in(nodes.len(), bump);
        let mut users = BumpVec::with_capacity_in(nodes.len(), bump);
        for _ in 0..nodes.len() {
            deps.push(BumpVec::new_in(bump));
            users.push(BumpVec::new_in(bump));
        }
        for (i, &node) in nodes.iter().enumerate() {
            for dep in block_operands(graph, node) {
                if let Some(&d) = index.get(&dep) {
                    deps[i].push(d);
                    users[d].push(i);
                }
            }
        }

        let mut infos = BumpVec::with_capacity_in(nodes.len(), bump);
        for i in 0..nodes.len() {
            infos.push(SchedInfo {
                pending: deps[i].len() as u32,
                ..SchedInfo::default()
            });
        }

        Self {
            graph,
            target,
            block,
            index,
            nodes,
            infos,
            deps,
            users,
            ready: Vec::new(),
            curr_time: 0,
            scheduled: 0,
        }
    }

    fn class(&self, i: usize) -> NodeClass {
        self.target.classify(self.graph, self.nodes[i])
    }

    fn is_keep(&self, i: usize) -> bool {
        self.class(i) == NodeClass::Keep
    }

    fn exectime(&self, i: usize) -> u32 {
        let node = self.nodes[i];
        if self.graph.is_proj(node) || self.is_keep(i) {
            return 0;
        }
        self.target.exectime(self.graph, node)
    }

    fn latency(&self, pred: usize, succ: usize) -> u32 {
        if self.is_keep(succ) {
            return self.exectime(pred);
        }
        let succ_node = self.nodes[succ];
        if self.graph.is_proj(succ_node) {
            return 0;
        }
        let pred_node = self.graph.skip_proj(self.nodes[pred]);
        self.target.latency(self.graph, pred_node, succ_node)
    }

    /// Non-Phi users inside the block; Phis take their operands along control edges.
    fn block_users(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.users[i]
            .iter()
            .copied()
            .filter(move |&u| !self.graph.is_phi(self.nodes[u]))
    }

    fn compute_delays(&mut self) {
        for i in 0..self.nodes.len() {
            let root = self.block_users(i).next().is_none();
            self.infos[i].root = root;
        }

        // users before operands
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut seen = vec![false; self.nodes.len()];
        for root in (0..self.nodes.len()).filter(|&i| self.infos[i].root) {
            seen[root] = true;
            let mut stack = vec![(root, 0usize)];
            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                if let Some(&dep) = self.deps[node].get(next) {
                    top.1 += 1;
                    if !seen[dep] {
                        seen[dep] = true;
                        stack.push((dep, 0));
                    }
                } else {
                    order.push(node);
                    stack.pop();
                }
            }
        }

        for &i in order.iter().rev() {
            let delay = if self.class(i) == NodeClass::Branch {
                0
            } else if self.infos[i].root {
                self.exectime(i)
            } else {
                self.block_users(i)
                    .map(|u| self.latency(i, u) + self.infos[u].delay)
                    .max()
                    .unwrap_or(0)
            };
            self.infos[i].delay = delay;
            log::trace!("{} delay {}", self.nodes[i], delay);
        }
    }

    fn make_ready(&mut self, i: usize) {
        let info = &mut self.infos[i];
        if info.ready || info.scheduled {
            return;
        }
        info.ready = true;
        self.ready.push(i);
    }

    fn add_to_sched(&mut self, i: usize, schedule: &mut Schedule) {
        schedule.push_back(self.block, self.nodes[i]);
        self.infos[i].scheduled = true;
        self.infos[i].ready = false;
        self.scheduled += 1;
        self.ready.retain(|&r| r != i);
    }

    fn make_users_ready(&mut self, i: usize) {
        let users: Vec<usize> = self.block_users(i).collect();
        for u in users {
            let etime = self.curr_time + self.latency(i, u);
            let info = &mut self.infos[u];
            info.etime = info.etime.max(etime);
            info.pending = info.pending.saturating_sub(1);
            if info.pending == 0 {
                self.make_ready(u);
            }
        }
    }

    /// Schedules the projections of tuple `i` right behind it, in projection order.
    fn add_tuple_projs(&mut self, i: usize, schedule: &mut Schedule) {
        let mut projs: Vec<usize> = self.users[i]
            .iter()
            .copied()
            .filter(|&u| self.graph.is_proj(self.nodes[u]) && !self.infos[u].scheduled)
            .collect();
        projs.sort_by_key(|&u| self.graph.proj_num(self.nodes[u]));
        projs.dedup();
        for p in projs {
            self.add_to_sched(p, schedule);
            if self.graph.mode(self.nodes[p]) == Mode::Tuple {
                self.add_tuple_projs(p, schedule);
            } else {
                self.make_users_ready(p);
            }
        }
    }

    fn schedule_node(&mut self, i: usize, schedule: &mut Schedule) {
        self.curr_time += self.exectime(i);
        self.add_to_sched(i, schedule);
        // users waiting on the tuple itself become ready through its projections
        self.make_users_ready(i);
        if self.graph.mode(self.nodes[i]) == Mode::Tuple {
            self.add_tuple_projs(i, schedule);
        }
    }

    fn seed(&mut self, schedule: &mut Schedule) {
        let start = self.graph.start();
        for i in 0..self.nodes.len() {
            let node = self.nodes[i];
            if self.infos[i].scheduled {
                continue;
            }
            if self.graph.is_phi(node) {
                self.add_to_sched(i, schedule);
                self.make_users_ready(i);
            } else if node == start {
                self.add_to_sched(i, schedule);
                self.make_users_ready(i);
                self.add_tuple_projs(i, schedule);
            }
        }
        for i in 0..self.nodes.len() {
            if !self.infos[i].scheduled && self.deps[i].is_empty() {
                self.make_ready(i);
            }
        }
    }

    fn select(&self, heuristic: &mut dyn SchedHeuristic) -> usize {
        if let Some(&keep) = self.ready.iter().find(|&&i| self.is_keep(i)) {
            return keep;
        }

        // branches only go once nothing else is ready
        let non_branch: Vec<usize> = self
            .ready
            .iter()
            .copied()
            .filter(|&i| self.class(i) != NodeClass::Branch)
            .collect();
        let pool = if non_branch.is_empty() { self.ready.clone() } else { non_branch };

        let max_delay = pool.iter().map(|&i| self.infos[i].delay).max().unwrap_or(0);
        let mcands: Vec<usize> = pool
            .iter()
            .copied()
            .filter(|&i| self.infos[i].delay == max_delay)
            .collect();
        let ecands: Vec<usize> = mcands
            .iter()
            .copied()
            .filter(|&i| self.infos[i].etime <= self.curr_time)
            .collect();

        if mcands.len() == 1 {
            return mcands[0];
        }
        if ecands.len() == 1 && self.class(ecands[0]) != NodeClass::Branch {
            return ecands[0];
        }
        let cands = if ecands.len() > 1 { &ecands } else { &mcands };
        let cand_nodes: Vec<NodeId> = cands.iter().map(|&i| self.nodes[i]).collect();
        let ctx = SelectContext {
            graph: self.graph,
            target: self.target,
            block: self.block,
            index: &self.index,
            infos: &self.infos[..],
        };
        let picked = heuristic.select(&ctx, &cand_nodes);
        self.index.get(&picked).copied().unwrap_or(cands[0])
    }

    fn run(
        &mut self,
        schedule: &mut Schedule,
        heuristic: &mut dyn SchedHeuristic,
    ) -> CompileResult<()> {
        self.compute_delays();
        self.seed(schedule);

        while !self.ready.is_empty() {
            let i = self.select(heuristic);
            log::trace!(
                "picked {} (delay {}, time {})",
                self.nodes[i],
                self.infos[i].delay,
                self.curr_time
            );
            self.schedule_node(i, schedule);
        }

        let remaining = self.nodes.len() - self.scheduled;
        if remaining > 0 {
            return Err(CompileError::MalformedSchedule {
                func: self.graph.name().to_string(),
                block: self.block,
                remaining,
            });
        }
        Ok(())
    }
}

/// Schedules every block of `graph`.
pub fn list_schedule(
    graph: &Graph,
    target: &dyn SchedTarget,
    heuristic: &mut dyn SchedHeuristic,
) -> CompileResult<Schedule> {
    log::debug!("list scheduling {}", graph.name());
    let mut schedule = Schedule::new(graph);
    let mut bump = Bump::new();
    for block in graph.blocks() {
        {
            let mut scheduler = BlockScheduler::new(graph, target, block, &bump);
            scheduler.run(&mut schedule, heuristic)?;
        }
        bump.reset();
    }
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, Relation};

    #[test]
    fn test_branch_is_last() {
        let mut b = GraphBuilder::new("f", &[Mode::I32]);
        let x = b.arg(0);
        let one = b.konst(Mode::I32, 1);
        let sum = b.add(x, one);
        let mem = b.initial_mem();
        let ret = b.ret(mem, &[sum]);
        let graph = b.finish();

        let schedule = list_schedule(&graph, &GenericTarget, &mut TrivialHeuristic).unwrap();
        let order = schedule.nodes(graph.start_block());
        assert_eq!(order.first(), Some(&graph.start()));
        assert_eq!(order.last(), Some(&ret));
        let pos = |n| order.iter().position(|&o| o == n).unwrap();
        assert!(pos(one) < pos(sum));
    }

    #[test]
    fn test_tuple_projections_follow_their_tuple() {
        let mut b = GraphBuilder::new("f", &[Mode::Ptr, Mode::I32]);
        let ptr = b.arg(0);
        let x = b.arg(1);
        let mem = b.initial_mem();
        let (val, mem) = b.load(mem, ptr, Mode::I32);
        let sum = b.add(val, x);
        let t = b.cmp(Relation::Lt, sum, x);
        let then_block = b.new_block("then");
        let else_block = b.new_block("else");
        b.cond(t, then_block, else_block);
        b.switch_to(then_block);
        b.ret(mem, &[sum]);
        b.switch_to(else_block);
        b.ret(mem, &[x]);
        let graph = b.finish();

        let mut heuristic = RegPressureHeuristic;
        let schedule = list_schedule(&graph, &GenericTarget, &mut heuristic).unwrap();
        let order = schedule.nodes(graph.start_block());
        let load = graph.skip_proj(val);
        let at = order.iter().position(|&n| n == load).unwrap();
        assert!(graph.is_proj(order[at + 1]) && graph.is_proj(order[at + 2]));
        assert_eq!(graph.skip_proj(order[at + 1]), load);
    }
}
