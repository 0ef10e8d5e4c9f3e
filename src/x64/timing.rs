// Scheduling timing of the x86-64 target. Execution times are rough per-opcode cycle
// counts; memory operands add the cost of the load. The latency between two nodes is the
// execution time of the producer, so long operations pull their consumers further down the
// schedule.

use crate::ir::{Graph, NodeId};
use crate::sched::SchedTarget;

use super::ops::{OpType, X64Op};

const LOAD_CYCLES: u32 = 3;

/// Cycle estimates for x86-64 machine nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct X64Timing;

impl X64Timing {
    fn op_cycles(op: X64Op) -> u32 {
        match op {
            X64Op::Const | X64Op::SymConst | X64Op::Undef | X64Op::Keep => 1,
            X64Op::IMul | X64Op::Mul1 => 3,
            X64Op::Div | X64Op::IDiv => 25,
            X64Op::Load | X64Op::XLoad | X64Op::FLd | X64Op::Fild => LOAD_CYCLES,
            X64Op::XAdd | X64Op::XSub | X64Op::XMul | X64Op::XCmp => 4,
            X64Op::XDiv => 14,
            X64Op::Cvtsi2s | X64Op::Cvtts2si | X64Op::XConv => 4,
            X64Op::FAdd | X64Op::FSub | X64Op::FMul | X64Op::FCmp => 4,
            X64Op::FDiv => 16,
            X64Op::Fist | X64Op::FSt | X64Op::XStore => 2,
            _ => 1,
        }
    }
}

impl SchedTarget for X64Timing {
    fn exectime(&self, graph: &Graph, node: NodeId) -> u32 {
        let Some(op) = graph.x64_op(node) else {
            return 1;
        };
        let base = Self::op_cycles(op);
        match graph.mach(node).map(|attr| attr.op_type) {
            Some(OpType::AmSource) | Some(OpType::AmDest) => base + LOAD_CYCLES,
            _ => base,
        }
    }

    fn latency(&self, graph: &Graph, pred: NodeId, _succ: NodeId) -> u32 {
        self.exectime(graph, pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Mode, NodeAttr, Opcode};
    use crate::x64::MachAttr;

    #[test]
    fn test_memory_operand_adds_load_time() {
        let mut graph = Graph::new("f");
        let block = graph.start_block();
        let no_reg = graph.no_reg();
        let no_mem = graph.no_mem();
        let plain = graph.add_node(
            Opcode::X64(X64Op::Add),
            Mode::I32,
            Some(block),
            vec![no_reg, no_reg, no_reg, no_reg, no_mem],
            NodeAttr::Machine(Box::default()),
        );
        let folded = graph.add_node(
            Opcode::X64(X64Op::Add),
            Mode::I32,
            Some(block),
            vec![no_reg, no_reg, no_reg, no_reg, no_mem],
            NodeAttr::Machine(Box::new(MachAttr {
                op_type: OpType::AmSource,
                ..MachAttr::default()
            })),
        );
        assert_eq!(X64Timing.exectime(&graph, plain), 1);
        assert_eq!(X64Timing.exectime(&graph, folded), 1 + LOAD_CYCLES);
        assert_eq!(X64Timing.latency(&graph, folded, plain), 4);
    }
}
