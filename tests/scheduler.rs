//! List scheduler and scheduling query tests.

use mcbe::ir::{DomTree, Graph, GraphBuilder, Liveness, Mode, NodeId, Relation};
use mcbe::sched::{
    list_schedule, value_dominates, values_interfere, verify_schedule, GenericTarget,
    RegPressureHeuristic, SchedTarget, TrivialHeuristic,
};
use mcbe::test_ir::parse_module;
use mcbe::CompileError;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Gives one node a long execution time; results are available once a node finishes.
struct SlowNode(NodeId);

impl SchedTarget for SlowNode {
    fn exectime(&self, _graph: &Graph, node: NodeId) -> u32 {
        if node == self.0 {
            3
        } else {
            1
        }
    }

    fn latency(&self, graph: &Graph, pred: NodeId, _succ: NodeId) -> u32 {
        self.exectime(graph, pred)
    }
}

#[test]
fn test_dependent_chain_then_branch() {
    init();
    let mut b = GraphBuilder::new("chain", &[Mode::I64, Mode::I64]);
    let (x, y) = (b.arg(0), b.arg(1));
    let a = b.mul(x, y);
    let dep = b.unop(mcbe::ir::IrOp::Minus, a);
    let mem = b.initial_mem();
    let branch = b.ret(mem, &[dep]);
    let graph = b.finish();

    let schedule = list_schedule(&graph, &SlowNode(a), &mut TrivialHeuristic).unwrap();
    let order: Vec<NodeId> = schedule
        .nodes(graph.start_block())
        .into_iter()
        .filter(|&n| n == a || n == dep || n == branch)
        .collect();
    assert_eq!(order, vec![a, dep, branch]);
    assert_eq!(schedule.last(graph.start_block()), Some(branch));
    verify_schedule(&graph, &schedule).unwrap();
}

#[test]
fn test_branch_waits_for_independent_work() {
    init();
    let mut b = GraphBuilder::new("f", &[Mode::I64]);
    let x = b.arg(0);
    let one = b.konst(Mode::I64, 1);
    let unused = b.add(x, one);
    b.keep_alive(unused);
    let mem = b.initial_mem();
    let ret = b.ret(mem, &[x]);
    let graph = b.finish();

    let trivial = list_schedule(&graph, &GenericTarget, &mut TrivialHeuristic).unwrap();
    let pressure = list_schedule(&graph, &GenericTarget, &mut RegPressureHeuristic).unwrap();
    for schedule in [trivial, pressure] {
        assert!(schedule.is_scheduled(unused));
        assert_eq!(schedule.last(graph.start_block()), Some(ret));
        verify_schedule(&graph, &schedule).unwrap();
    }
}

#[test]
fn test_cycle_without_phi_is_malformed() {
    init();
    let mut b = GraphBuilder::new("cyclic", &[Mode::I32, Mode::I32]);
    let (x, y) = (b.arg(0), b.arg(1));
    let a = b.add(x, y);
    let neg = b.unop(mcbe::ir::IrOp::Minus, a);
    let mem = b.initial_mem();
    b.ret(mem, &[neg]);
    let mut graph = b.finish();
    graph.set_operand(a, 1, neg);

    let err = list_schedule(&graph, &GenericTarget, &mut TrivialHeuristic).unwrap_err();
    match err {
        CompileError::MalformedSchedule { remaining, .. } => assert!(remaining >= 3),
        other => panic!("unexpected error {}", other),
    }
}

#[test]
fn test_loop_schedules_and_verifies() {
    init();
    let graphs = parse_module(
        "func sum_to(%n: i64) {\n\
         entry:\n\
         \t%zero = const i64 0\n\
         \tjmp ^loop\n\
         loop:\n\
         \t%i = phi i64 [%zero, ^entry], [%next, ^loop]\n\
         \t%acc = phi i64 [%zero, ^entry], [%sum, ^loop]\n\
         \t%one = const i64 1\n\
         \t%next = add %i, %one\n\
         \t%sum = add %acc, %next\n\
         \t%done = cmp ge %next, %n\n\
         \tbr %done, ^exit, ^loop\n\
         exit:\n\
         \tret %mem, %sum\n\
         }\n",
    )
    .unwrap();
    let graph = &graphs[0];
    let schedule = list_schedule(graph, &GenericTarget, &mut RegPressureHeuristic).unwrap();
    verify_schedule(graph, &schedule).unwrap();

    // phis come first in their block
    for block in graph.blocks() {
        let nodes = schedule.nodes(block);
        let first_non_phi = nodes.iter().position(|&n| !graph.is_phi(n)).unwrap_or(nodes.len());
        assert!(nodes[first_non_phi..].iter().all(|&n| !graph.is_phi(n)));
    }
}

#[test]
fn test_dominance_and_interference() {
    init();
    let mut b = GraphBuilder::new("diamond", &[Mode::I64, Mode::I64]);
    let (x, y) = (b.arg(0), b.arg(1));
    let then_block = b.new_block("then");
    let join = b.new_block("join");
    let early = b.add(x, y);
    let t = b.cmp(Relation::Lt, x, y);
    b.cond(t, then_block, join);

    b.switch_to(then_block);
    let late = b.mul(x, y);
    let both = b.add(late, early);
    b.jmp(join);

    b.switch_to(join);
    let merged = b.phi_placeholder(Mode::I64);
    b.set_phi_operands(merged, &[early, both]);
    let mem = b.initial_mem();
    b.ret(mem, &[merged]);
    let graph = b.finish();

    let schedule = list_schedule(&graph, &GenericTarget, &mut TrivialHeuristic).unwrap();
    let dom = DomTree::compute(&graph);
    let liveness = Liveness::compute(&graph);

    assert!(value_dominates(&graph, &schedule, &dom, early, late));
    assert!(!value_dominates(&graph, &schedule, &dom, late, early));
    assert!(value_dominates(&graph, &schedule, &dom, early, early));
    // early is read by `both`, which comes after `late`
    assert!(values_interfere(&graph, &schedule, &dom, &liveness, early, late));
    assert!(!values_interfere(&graph, &schedule, &dom, &liveness, late, merged));
}
