//! Instruction selection tests, checked structurally and by simulating the
//! selected graphs.

use bumpalo::Bump;
use mcbe::ir::{pn, Graph, GraphBuilder, Mode, NodeId};
use mcbe::sched::{list_schedule, TrivialHeuristic};
use mcbe::test_ir::parse_module;
use mcbe::x64::sim::SimValue;
use mcbe::x64::{select_graph, verify_selected, Simulator, X64Op, X64Timing};
use mcbe::{CodegenOptions, CompilationSession, CompileError, FpUnit, Schedule};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options(fp_unit: FpUnit) -> CodegenOptions {
    CodegenOptions {
        fp_unit,
        ..CodegenOptions::default()
    }
}

fn select_text(text: &str, options: &CodegenOptions) -> Result<Graph, CompileError> {
    let mut graph = parse_module(text).unwrap().remove(0);
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    select_graph(&mut graph, &session, options)?;
    verify_selected(&graph)?;
    Ok(graph)
}

fn scheduled(text: &str, options: &CodegenOptions) -> (Graph, Schedule) {
    let graph = select_text(text, options).unwrap();
    let schedule = list_schedule(&graph, &X64Timing, &mut TrivialHeuristic).unwrap();
    (graph, schedule)
}

fn live_x64(graph: &Graph, op: X64Op) -> Vec<NodeId> {
    graph.live_nodes().filter(|&n| graph.is_x64(n, op)).collect()
}

fn kept_projection(graph: &Graph, tuple: NodeId) -> Option<u32> {
    live_x64(graph, X64Op::Keep)
        .into_iter()
        .map(|keep| graph.operand(keep, 0))
        .find(|&value| graph.is_proj(value) && graph.operand(value, 0) == tuple)
        .and_then(|proj| graph.proj_num(proj))
}

const DIVMOD: &str = "func divmod(%a: i32, %b: i32) {\n\
                      entry:\n\
                      \t%q, %m1 = div %mem, %a, %b\n\
                      \t%r, %m2 = mod %m1, %a, %b\n\
                      \tret %m2, %q, %r\n\
                      }\n";

#[test]
fn test_division_keeps_the_unused_half() {
    init();
    let graph = select_text(DIVMOD, &CodegenOptions::default()).unwrap();
    let divs = live_x64(&graph, X64Op::IDiv);
    assert_eq!(divs.len(), 2);
    let mut kept: Vec<u32> = divs.iter().filter_map(|&d| kept_projection(&graph, d)).collect();
    kept.sort_unstable();
    assert_eq!(kept, vec![pn::RES, pn::REM]);

    // keeps are anchored at End so they survive dead-node sweeps
    let end_operands = graph.operands(graph.end());
    for keep in live_x64(&graph, X64Op::Keep) {
        assert!(end_operands.contains(&keep));
    }
    for div in divs {
        assert!(graph.is_x64(graph.operand(div, 2), X64Op::Cltd));
    }
}

#[test]
fn test_division_results_simulate() {
    init();
    let (graph, schedule) = scheduled(DIVMOD, &CodegenOptions::default());
    let mut sim = Simulator::new(&graph, &schedule);
    assert_eq!(sim.run_ints(&[17, 5]).unwrap(), vec![3, 2]);
    assert_eq!(sim.run_ints(&[-17, 5]).unwrap(), vec![-3, -2]);

    let unsigned = DIVMOD.replace("i32", "u32");
    let graph = select_text(&unsigned, &CodegenOptions::default()).unwrap();
    let divs = live_x64(&graph, X64Op::Div);
    assert_eq!(divs.len(), 2);
    for div in &divs {
        let high = graph.operand(*div, 2);
        assert!(graph.is_x64(high, X64Op::Const));
        assert_eq!(graph.mach(high).unwrap().imm.as_ref().map(|i| i.value), Some(0));
    }
    let schedule = list_schedule(&graph, &X64Timing, &mut TrivialHeuristic).unwrap();
    let mut sim = Simulator::new(&graph, &schedule);
    // 0xffff_ffef is 4294967279 as u32
    assert_eq!(sim.run_ints(&[0xffff_ffef, 5]).unwrap(), vec![858_993_455, 4]);
}

#[test]
fn test_high_multiply_keeps_low_half() {
    init();
    let text = "func mulhi(%a: i64, %b: i64) {\n\
                entry:\n\
                \t%h = mulh %a, %b\n\
                \tret %mem, %h\n\
                }\n";
    let (graph, schedule) = scheduled(text, &CodegenOptions::default());
    let mul = live_x64(&graph, X64Op::Mul1)[0];
    assert_eq!(kept_projection(&graph, mul), Some(pn::MUL_LO));

    let mut sim = Simulator::new(&graph, &schedule);
    assert_eq!(sim.run_ints(&[1 << 40, 1 << 40]).unwrap(), vec![1 << 16]);
    assert_eq!(sim.run_ints(&[-1, 5]).unwrap(), vec![-1]);
}

#[test]
fn test_float_constants_follow_the_fpu() {
    init();
    let text = "func affine(%x: f64) {\n\
                entry:\n\
                \t%zero = const f64 0.0\n\
                \t%one = const f64 1.0\n\
                \t%half = const f64 0.5\n\
                \t%p = mul %x, %half\n\
                \t%q = add %p, %one\n\
                \t%r = sub %q, %zero\n\
                \tret %mem, %r\n\
                }\n";

    let x87 = select_text(text, &options(FpUnit::X87)).unwrap();
    assert_eq!(live_x64(&x87, X64Op::Fldz).len(), 1);
    assert_eq!(live_x64(&x87, X64Op::Fld1).len(), 1);
    assert_eq!(live_x64(&x87, X64Op::FLd).len(), 1);
    assert!(live_x64(&x87, X64Op::XLoad).is_empty());

    let sse = select_text(text, &options(FpUnit::Sse2)).unwrap();
    assert_eq!(live_x64(&sse, X64Op::XLoad).len(), 3);
    for load in live_x64(&sse, X64Op::XLoad) {
        assert!(sse.mach(load).unwrap().am.symbol.is_some());
    }

    for fp_unit in [FpUnit::Sse2, FpUnit::X87] {
        let (graph, schedule) = scheduled(text, &options(fp_unit));
        let mut sim = Simulator::new(&graph, &schedule);
        let result = sim.run(&[SimValue::Float(3.0)]).unwrap();
        assert_eq!(result, vec![SimValue::Float(2.5)], "{:?}", fp_unit);
    }
}

#[test]
fn test_int_float_round_trip_on_both_units() {
    init();
    let text = "func round_trip(%i: i32) {\n\
                entry:\n\
                \t%f = conv f64 %i\n\
                \t%three = const f64 3.75\n\
                \t%g = mul %f, %three\n\
                \t%r = conv i32 %g\n\
                \tret %mem, %r\n\
                }\n";
    let x87 = select_text(text, &options(FpUnit::X87)).unwrap();
    assert_eq!(live_x64(&x87, X64Op::Fild).len(), 1);
    assert_eq!(live_x64(&x87, X64Op::Fist).len(), 1);
    assert!(x87.frame().layout().size() >= 8);

    for fp_unit in [FpUnit::Sse2, FpUnit::X87] {
        let (graph, schedule) = scheduled(text, &options(fp_unit));
        let mut sim = Simulator::new(&graph, &schedule);
        assert_eq!(sim.run_ints(&[4]).unwrap(), vec![15], "{:?}", fp_unit);
        assert_eq!(sim.run_ints(&[-3]).unwrap(), vec![-11], "{:?}", fp_unit);
    }
}

#[test]
fn test_switch_jumps_through_rebased_table() {
    init();
    let text = "func classify(%x: i32) {\n\
                entry:\n\
                \tswitch %x, ^other [10: ^ten, 11: ^eleven, 13: ^thirteen]\n\
                ten:\n\
                \t%a = const i32 100\n\
                \tret %mem, %a\n\
                eleven:\n\
                \t%b = const i32 110\n\
                \tret %mem, %b\n\
                thirteen:\n\
                \t%c = const i32 130\n\
                \tret %mem, %c\n\
                other:\n\
                \t%d = const i32 -1\n\
                \tret %mem, %d\n\
                }\n";
    let (graph, schedule) = scheduled(text, &CodegenOptions::default());
    let mut sim = Simulator::new(&graph, &schedule);
    let cases = [(10, 100), (11, 110), (12, -1), (13, 130), (9, -1), (14, -1), (-100, -1)];
    for (x, expected) in cases {
        assert_eq!(sim.run_ints(&[x]).unwrap(), vec![expected], "switch on {}", x);
    }
}

#[test]
fn test_narrow_switch_indexes_with_full_register() {
    init();
    let text = "func byte_switch(%x: i8) {\n\
                entry:\n\
                \tswitch %x, ^other [-2: ^minus_two, 0: ^zero, 1: ^one]\n\
                minus_two:\n\
                \t%a = const i32 20\n\
                \tret %mem, %a\n\
                zero:\n\
                \t%b = const i32 30\n\
                \tret %mem, %b\n\
                one:\n\
                \t%c = const i32 40\n\
                \tret %mem, %c\n\
                other:\n\
                \t%d = const i32 -1\n\
                \tret %mem, %d\n\
                }\n";
    let (graph, schedule) = scheduled(text, &CodegenOptions::default());
    let switch = live_x64(&graph, X64Op::SwitchJmp)[0];
    assert_eq!(graph.mach(switch).unwrap().ls_mode, Some(Mode::I64));

    let mut sim = Simulator::new(&graph, &schedule);
    for (x, expected) in [(-2, 20), (-1, -1), (0, 30), (1, 40), (2, -1), (-128, -1), (127, -1)] {
        assert_eq!(sim.run_ints(&[x]).unwrap(), vec![expected], "switch on {}", x);
    }
}

#[test]
fn test_unsupported_inputs_are_fatal() {
    init();
    let bool_phi = "func f(%a: i32, %b: i32) {\n\
                    entry:\n\
                    \t%c = cmp lt %a, %b\n\
                    \tbr %c, ^left, ^join\n\
                    left:\n\
                    \t%d = cmp gt %a, %b\n\
                    \tjmp ^join\n\
                    join:\n\
                    \t%p = phi b [%c, ^entry], [%d, ^left]\n\
                    \t%one = const i32 1\n\
                    \t%zero = const i32 0\n\
                    \t%r = mux %p, %zero, %one\n\
                    \tret %mem, %r\n\
                    }\n";
    let err = select_text(bool_phi, &CodegenOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedNode { .. }), "{}", err);

    let unsigned_to_float = "func g(%a: u64) {\n\
                             entry:\n\
                             \t%f = conv f64 %a\n\
                             \tret %mem, %f\n\
                             }\n";
    let err = select_text(unsigned_to_float, &CodegenOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedNode { .. }), "{}", err);

    let floats_without_fpu = "func h(%a: f32) {\n\
                              entry:\n\
                              \t%n = minus %a\n\
                              \tret %mem, %n\n\
                              }\n";
    let err = select_text(floats_without_fpu, &options(FpUnit::None)).unwrap_err();
    assert!(err.to_string().contains("no floating point unit"), "{}", err);
}

#[test]
fn test_selected_nodes_are_counted() {
    init();
    let mut b = GraphBuilder::new("count", &[Mode::I64, Mode::I64]);
    let (x, y) = (b.arg(0), b.arg(1));
    let sum = b.add(x, y);
    let product = b.mul(sum, y);
    let mem = b.initial_mem();
    b.ret(mem, &[product]);
    let mut graph = b.finish();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    select_graph(&mut graph, &session, &CodegenOptions::default()).unwrap();
    let stats = session.stats();
    assert_eq!(stats.instruction_counts.get("x64_Add"), Some(&1));
    assert_eq!(stats.instruction_counts.get("x64_IMul"), Some(&1));
    assert!(stats.nodes_selected >= 3);
}
