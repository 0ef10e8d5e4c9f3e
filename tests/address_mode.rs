//! Address-mode optimizer tests: LEA folding and load/store folding.
//!
//! Most checks are differential: a function is lowered with and without the
//! folding passes and both versions are simulated on the same inputs.

use bumpalo::Bump;
use mcbe::ir::{Graph, Mode};
use mcbe::sched::{list_schedule, verify_schedule, TrivialHeuristic};
use mcbe::test_ir::parse_module;
use mcbe::x64::sim::SimValue;
use mcbe::x64::{fold_address_modes, fold_leas, AsmEmitter, OpType, Simulator, X64Op, X64Timing};
use mcbe::{CodegenOptions, CodegenPipeline, CompilationSession, Schedule, SessionStats};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn parse_one(text: &str) -> Graph {
    let mut graphs = parse_module(text).unwrap();
    assert_eq!(graphs.len(), 1);
    graphs.remove(0)
}

fn lower(text: &str, options: CodegenOptions) -> (Graph, Schedule, SessionStats) {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let pipeline = CodegenPipeline::new(&session, options);
    let mut graph = parse_one(text);
    let schedule = pipeline.schedule(&mut graph).unwrap();
    (graph, schedule, session.stats())
}

fn live_x64(graph: &Graph, op: X64Op) -> Vec<mcbe::ir::NodeId> {
    graph.live_nodes().filter(|&n| graph.is_x64(n, op)).collect()
}

/// Results and final memory of one simulated run.
fn simulate(
    text: &str,
    options: CodegenOptions,
    memory: &[(u64, i64, u32)],
    args: &[i64],
) -> (Vec<i64>, Vec<(u64, u8)>) {
    let (graph, schedule, _) = lower(text, options);
    let mut sim = Simulator::new(&graph, &schedule);
    for &(address, value, bytes) in memory {
        sim.write_int(address, value, bytes);
    }
    let results = sim.run_ints(args).unwrap();
    (results, sim.memory_snapshot())
}

fn assert_folding_preserves_behavior(text: &str, memory: &[(u64, i64, u32)], args: &[i64]) {
    let folded = simulate(text, CodegenOptions::default(), memory, args);
    let plain = simulate(text, CodegenOptions::default().without_folding(), memory, args);
    assert_eq!(folded, plain, "folding changed the behavior of\n{}", text);
}

const BUMP: &str = "func bump(%p: ptr) {\n\
                    entry:\n\
                    \t%v, %m1 = load i32 %mem, %p\n\
                    \t%four = const i32 4\n\
                    \t%s = add %v, %four\n\
                    \t%m2 = store %m1, %p, %s\n\
                    \tret %m2\n\
                    }\n";

#[test]
fn test_load_add_store_becomes_memory_add() {
    init();
    let (graph, _, stats) = lower(BUMP, CodegenOptions::default());

    assert!(live_x64(&graph, X64Op::Load).is_empty());
    assert!(live_x64(&graph, X64Op::Store).is_empty());
    let adds = live_x64(&graph, X64Op::Add);
    assert_eq!(adds.len(), 1);
    let attr = graph.mach(adds[0]).unwrap();
    assert_eq!(attr.op_type, OpType::AmDest);
    assert_eq!(attr.ls_mode, Some(Mode::I32));
    assert_eq!(graph.mode(adds[0]), Mode::Mem);
    assert_eq!(stats.dest_am_folds, 1);

    let ret = live_x64(&graph, X64Op::Ret)[0];
    assert_eq!(graph.operand(ret, 0), adds[0]);
}

#[test]
fn test_memory_add_updates_memory_in_place() {
    init();
    let (graph, schedule, _) = lower(BUMP, CodegenOptions::default());
    let mut sim = Simulator::new(&graph, &schedule);
    sim.write_int(0x4000, 0xffff_fffe, 4);
    sim.write_int(0x4004, 0x55, 1);
    sim.run_ints(&[0x4000]).unwrap();
    assert_eq!(sim.read_bytes(0x4000, 4), 2);
    assert_eq!(sim.read_bytes(0x4004, 1), 0x55);
}

#[test]
fn test_store_to_other_address_keeps_load() {
    init();
    let text = "func copy_bump(%p: ptr, %q: ptr) {\n\
                entry:\n\
                \t%v, %m1 = load i32 %mem, %p\n\
                \t%four = const i32 4\n\
                \t%s = add %v, %four\n\
                \t%m2 = store %m1, %q, %s\n\
                \tret %m2\n\
                }\n";
    let (graph, _, stats) = lower(text, CodegenOptions::default());
    assert_eq!(stats.dest_am_folds, 0);
    assert_eq!(live_x64(&graph, X64Op::Load).len(), 1);
    assert_eq!(live_x64(&graph, X64Op::Store).len(), 1);
    assert_folding_preserves_behavior(text, &[(0x4000, 41, 4)], &[0x4000, 0x5000]);
}

#[test]
fn test_folding_is_idempotent() {
    init();
    let text = "func walk(%p: ptr, %i: i64, %x: i64) {\n\
                entry:\n\
                \t%ip = conv ptr %i\n\
                \t%three = const ptr 3\n\
                \t%off = shl %ip, %three\n\
                \t%a = add %p, %off\n\
                \t%v, %m1 = load i64 %mem, %a\n\
                \t%s = sub %x, %v\n\
                \tret %m1, %s\n\
                }\n";
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let pipeline = CodegenPipeline::new(&session, CodegenOptions::default());
    let mut graph = parse_one(text);
    pipeline.lower(&mut graph).unwrap();

    let emit = |graph: &Graph| {
        let schedule = list_schedule(graph, &X64Timing, &mut TrivialHeuristic).unwrap();
        verify_schedule(graph, &schedule).unwrap();
        AsmEmitter::new(graph, &schedule).emit_function().unwrap()
    };
    let first = emit(&graph);
    fold_leas(&mut graph, &session);
    fold_address_modes(&mut graph, &session);
    graph.remove_unreachable();
    assert_eq!(emit(&graph), first);
}

#[test]
fn test_scaled_index_and_source_operand() {
    init();
    let text = "func walk(%p: ptr, %i: i64, %x: i64) {\n\
                entry:\n\
                \t%ip = conv ptr %i\n\
                \t%three = const ptr 3\n\
                \t%off = shl %ip, %three\n\
                \t%a = add %p, %off\n\
                \t%v, %m1 = load i64 %mem, %a\n\
                \t%eight = const ptr 8\n\
                \t%a2 = add %a, %eight\n\
                \t%w, %m2 = load i64 %m1, %a2\n\
                \t%s = add %v, %w\n\
                \t%d = sub %x, %s\n\
                \t%m3 = store %m2, %a, %d\n\
                \tret %m3, %d\n\
                }\n";
    let memory = [(0x8000 + 16, 100, 8), (0x8000 + 24, -7, 8)];
    assert_folding_preserves_behavior(text, &memory, &[0x8000, 2, 1000]);
    let (results, _) = simulate(text, CodegenOptions::default(), &memory, &[0x8000, 2, 1000]);
    assert_eq!(results, vec![907]);

    let (_, _, stats) = lower(text, CodegenOptions::default());
    assert!(stats.leas_merged >= 1);
}

#[test]
fn test_frame_slot_offsets() {
    init();
    let text = "func spill(%x: i64) {\n\
                entry:\n\
                \t%f = frame 16, 8\n\
                \t%eight = const ptr 8\n\
                \t%f8 = add %f, %eight\n\
                \t%m1 = store %mem, %f8, %x\n\
                \t%v, %m2 = load i64 %m1, %f8\n\
                \t%r = add %v, %v\n\
                \tret %m2, %r\n\
                }\n";
    assert_folding_preserves_behavior(text, &[], &[21]);
    let (results, _) = simulate(text, CodegenOptions::default(), &[], &[21]);
    assert_eq!(results, vec![42]);
}

#[test]
fn test_compare_and_negate_through_memory() {
    init();
    let compare = "func below(%p: ptr, %x: i32) {\n\
                   entry:\n\
                   \t%v, %m1 = load i32 %mem, %p\n\
                   \t%c = cmp lt %x, %v\n\
                   \t%zero = const i32 0\n\
                   \t%one = const i32 1\n\
                   \t%r = mux %c, %zero, %one\n\
                   \tret %m1, %r\n\
                   }\n";
    for x in [-5, 9, 10, 11] {
        assert_folding_preserves_behavior(compare, &[(0x6000, 10, 4)], &[0x6000, x]);
    }
    let memory = [(0x6000, 10, 4)];
    let (results, _) = simulate(compare, CodegenOptions::default(), &memory, &[0x6000, 9]);
    assert_eq!(results, vec![1]);

    let negate = "func negate(%p: ptr) {\n\
                  entry:\n\
                  \t%v, %m1 = load i64 %mem, %p\n\
                  \t%n = minus %v\n\
                  \t%m2 = store %m1, %p, %n\n\
                  \tret %m2\n\
                  }\n";
    assert_folding_preserves_behavior(negate, &[(0x7000, 12345, 8)], &[0x7000]);
    let (graph, _, stats) = lower(negate, CodegenOptions::default());
    assert_eq!(stats.dest_am_folds, 1);
    assert!(live_x64(&graph, X64Op::Load).is_empty());
}

#[test]
fn test_byte_loads_are_not_folded() {
    init();
    let text = "func bytes(%p: ptr, %x: i8) {\n\
                entry:\n\
                \t%v, %m1 = load i8 %mem, %p\n\
                \t%s = add %x, %v\n\
                \tret %m1, %s\n\
                }\n";
    let (graph, _, stats) = lower(text, CodegenOptions::default());
    assert_eq!(stats.source_am_folds, 0);
    assert_eq!(live_x64(&graph, X64Op::Load).len(), 1);
    assert_folding_preserves_behavior(text, &[(0x3000, 0x7f, 1)], &[0x3000, 1]);
}

#[test]
fn test_permuted_compare_with_live_memory_result() {
    init();
    // the load is the left operand and its memory result is returned, so the folded
    // compare becomes a tuple whose flags are read through a projection
    let text = "func above(%p: ptr, %x: i32) {\n\
                entry:\n\
                \t%v, %m1 = load i32 %mem, %p\n\
                \t%c = cmp lt %v, %x\n\
                \t%zero = const i32 0\n\
                \t%one = const i32 1\n\
                \t%r = mux %c, %zero, %one\n\
                \tret %m1, %r\n\
                }\n";
    for x in [5, 10, 11, -3] {
        assert_folding_preserves_behavior(text, &[(0x6000, 10, 4)], &[0x6000, x]);
    }
    let (results, _) = simulate(text, CodegenOptions::default(), &[(0x6000, 10, 4)], &[0x6000, 5]);
    assert_eq!(results, vec![0]);

    let (graph, schedule, stats) = lower(text, CodegenOptions::default());
    assert_eq!(stats.source_am_folds, 1);
    let cmov = live_x64(&graph, X64Op::CMov)[0];
    let flags = graph.operand(cmov, 0);
    assert!(graph.is_proj(flags));
    let cmp = graph.skip_proj(flags);
    assert!(graph.is_x64(cmp, X64Op::Cmp));
    assert!(graph.mach(cmp).unwrap().ins_permuted);

    // x - [p] is compared, so `v < x` becomes "x greater than v"
    let asm = AsmEmitter::new(&graph, &schedule).emit_function().unwrap();
    assert!(asm.contains("\tcmovg "), "{}", asm);
    assert!(!asm.contains("\tcmovl "), "{}", asm);
}

#[test]
fn test_permuted_float_compare_with_live_memory_result() {
    init();
    let text = "func above(%p: ptr, %x: f64) {\n\
                entry:\n\
                \t%v, %m1 = load f64 %mem, %p\n\
                \t%c = cmp lt %v, %x\n\
                \t%zero = const i32 0\n\
                \t%one = const i32 1\n\
                \t%r = mux %c, %zero, %one\n\
                \tret %m1, %r\n\
                }\n";
    let run = |options: CodegenOptions, x: f64| {
        let (graph, schedule, _) = lower(text, options);
        let mut sim = Simulator::new(&graph, &schedule);
        sim.write_int(0x6000, 10.0f64.to_bits() as i64, 8);
        sim.run(&[SimValue::Int(0x6000), SimValue::Float(x)]).unwrap()
    };
    for x in [5.0, 10.0, 10.5, -3.0] {
        let folded = run(CodegenOptions::default(), x);
        let plain = run(CodegenOptions::default().without_folding(), x);
        assert_eq!(folded, plain, "x = {}", x);
        let expected = if 10.0 < x { 1 } else { 0 };
        assert_eq!(folded, vec![SimValue::Int(expected)], "x = {}", x);
    }

    let (graph, _, stats) = lower(text, CodegenOptions::default());
    assert_eq!(stats.source_am_folds, 1);
    let cmov = live_x64(&graph, X64Op::CMov)[0];
    let cmp = graph.skip_proj(graph.operand(cmov, 0));
    assert!(graph.is_x64(cmp, X64Op::XCmp));
    assert!(graph.mach(cmp).unwrap().ins_permuted);
}
