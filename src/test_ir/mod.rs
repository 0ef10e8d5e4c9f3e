//! Textual IR for writing backend tests and feeding the driver binary.
//!
//! The format is small enough to write by hand while covering every
//! operation the instruction selector accepts.
//!
//! # Format
//!
//! ```text
//! ; Comments start with a semicolon
//! func sum_to(%n: i64) {
//! entry:
//!     %zero = const i64 0
//!     jmp ^loop
//! loop:
//!     %i = phi i64 [%zero, ^entry], [%next, ^loop]
//!     %one = const i64 1
//!     %next = add %i, %one
//!     %done = cmp ge %next, %n
//!     br %done, ^exit, ^loop
//! exit:
//!     ret %mem, %next
//! }
//! ```
//!
//! `%mem` names the initial memory state. Memory operations thread it
//! explicitly: `%v, %m1 = load i32 %mem, %p` and `%m2 = store %m1, %p, %v`.
//! The first label of a function is its entry block. Phi operands may name
//! values defined later; every other operand must already be defined.

pub mod parser;

pub use parser::parse_module;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrOp, Mode, NodeAttr, Opcode};

    fn count_ops(graph: &crate::ir::Graph, op: IrOp) -> usize {
        graph
            .live_nodes()
            .into_iter()
            .filter(|&n| graph.op(n) == Opcode::Ir(op))
            .count()
    }

    #[test]
    fn test_parse_straight_line() {
        let graphs = parse_module(
            "func f(%a: i32, %b: i32) {\n\
             entry:\n\
             \t%s = add %a, %b   ; sum\n\
             \t%n = minus %s\n\
             \tret %mem, %n\n\
             }\n",
        )
        .unwrap();
        assert_eq!(graphs.len(), 1);
        let graph = &graphs[0];
        assert_eq!(graph.name(), "f");
        assert_eq!(count_ops(graph, IrOp::Add), 1);
        assert_eq!(count_ops(graph, IrOp::Minus), 1);
        assert_eq!(count_ops(graph, IrOp::Return), 1);
    }

    #[test]
    fn test_phi_operands_follow_predecessor_order() {
        let graphs = parse_module(
            "func pick(%c: i64) {\n\
             entry:\n\
             \t%zero = const i64 0\n\
             \t%t = cmp eq %c, %zero\n\
             \tbr %t, ^left, ^right\n\
             left:\n\
             \t%one = const i64 1\n\
             \tjmp ^join\n\
             right:\n\
             \t%two = const i64 2\n\
             \tjmp ^join\n\
             join:\n\
             \t%r = phi i64 [%two, ^right], [%one, ^left]\n\
             \tret %mem, %r\n\
             }\n",
        )
        .unwrap();
        let graph = &graphs[0];
        let phi = graph
            .live_nodes()
            .into_iter()
            .find(|&n| graph.is_phi(n))
            .unwrap();
        let join = graph.block_of(phi).unwrap();
        for (pos, &operand) in graph.operands(phi).iter().enumerate() {
            let pred = graph.pred_block(join, pos).unwrap();
            let expected = if graph.block(pred).name() == "left" { 1 } else { 2 };
            assert!(matches!(graph.attr(operand), NodeAttr::Int(v) if *v == expected));
        }
    }

    #[test]
    fn test_memory_operations_thread_state() {
        let graphs = parse_module(
            "func copy(%src: ptr, %dst: ptr) {\n\
             entry:\n\
             \t%v, %m1 = load i32 %mem, %src\n\
             \t%m2 = store %m1, %dst, %v\n\
             \tret %m2\n\
             }\n",
        )
        .unwrap();
        let graph = &graphs[0];
        assert_eq!(count_ops(graph, IrOp::Load), 1);
        assert_eq!(count_ops(graph, IrOp::Store), 1);
        let load = graph
            .live_nodes()
            .into_iter()
            .find(|&n| graph.op(n) == Opcode::Ir(IrOp::Load))
            .unwrap();
        assert!(matches!(graph.attr(load), NodeAttr::Mem { mode: Mode::I32, .. }));
    }

    #[test]
    fn test_undefined_value_reports_position() {
        let err = parse_module("func f() {\nentry:\n  ret %mem, %nope\n}\n").unwrap_err();
        assert!(err.starts_with("line 3:"), "{}", err);
        assert!(err.contains("Undefined value %nope"), "{}", err);
    }

    #[test]
    fn test_missing_phi_input_is_rejected() {
        let err = parse_module(
            "func f(%a: i64) {\n\
             entry:\n\
             \tjmp ^next\n\
             next:\n\
             \t%p = phi i64 [%a, ^other]\n\
             \tret %mem, %p\n\
             }\n",
        )
        .unwrap_err();
        assert!(err.contains("no incoming value"), "{}", err);
    }

    #[test]
    fn test_undefined_block_is_rejected() {
        let err = parse_module("func f() {\nentry:\n  jmp ^nowhere\n}\n").unwrap_err();
        assert!(err.contains("^nowhere"), "{}", err);
    }
}
