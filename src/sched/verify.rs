// Consistency checks for a computed schedule: every schedulable node appears exactly once
// in its own block, in-block operands come strictly earlier than their users, and the
// projections of a tuple follow the tuple without anything in between.

use crate::core::error::{CompileError, CompileResult};
use crate::ir::Graph;

use super::schedule::{block_operands, is_schedulable, Schedule};

pub fn verify_schedule(graph: &Graph, schedule: &Schedule) -> CompileResult<()> {
    let func = graph.name();
    for node in graph.live_nodes() {
        if !is_schedulable(graph, node) {
            if schedule.is_scheduled(node) {
                return Err(CompileError::invalid_graph(
                    func,
                    format!("{} {} must not be scheduled", graph.op(node), node),
                ));
            }
            continue;
        }
        if schedule.block_of(node) != graph.block_of(node) {
            return Err(CompileError::invalid_graph(
                func,
                format!("{} {} is not scheduled in its block", graph.op(node), node),
            ));
        }
    }

    for block in graph.blocks() {
        let mut count = 0;
        for node in schedule.iter(block) {
            count += 1;
            if count > graph.node_count() {
                return Err(CompileError::invalid_graph(
                    func,
                    format!("schedule of {} is cyclic", block),
                ));
            }
            let step = schedule.time_step(node);
            for dep in block_operands(graph, node) {
                if schedule.time_step(dep) >= step {
                    return Err(CompileError::invalid_graph(
                        func,
                        format!(
                            "{} {} is scheduled before its operand {}",
                            graph.op(node),
                            node,
                            dep
                        ),
                    ));
                }
            }
            if graph.is_proj(node) {
                let tuple = graph.skip_proj(node);
                let prev = schedule.prev(node);
                let adjacent = prev == Some(tuple)
                    || prev.is_some_and(|p| graph.is_proj(p) && graph.skip_proj(p) == tuple);
                if !adjacent {
                    return Err(CompileError::invalid_graph(
                        func,
                        format!("projection {} is separated from its tuple {}", node, tuple),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, Mode};
    use crate::sched::{list_schedule, GenericTarget, TrivialHeuristic};

    #[test]
    fn test_list_schedule_verifies() {
        let mut b = GraphBuilder::new("f", &[Mode::Ptr]);
        let p = b.arg(0);
        let mem = b.initial_mem();
        let (v, mem) = b.load(mem, p, Mode::I64);
        let mem = b.store(mem, p, v);
        b.ret(mem, &[]);
        let graph = b.finish();

        let schedule = list_schedule(&graph, &GenericTarget, &mut TrivialHeuristic).unwrap();
        verify_schedule(&graph, &schedule).unwrap();
    }

    #[test]
    fn test_reversed_order_is_rejected() {
        let mut b = GraphBuilder::new("f", &[Mode::I32]);
        let x = b.arg(0);
        let neg = b.unop(crate::ir::IrOp::Minus, x);
        let mem = b.initial_mem();
        let ret = b.ret(mem, &[neg]);
        let graph = b.finish();

        let block = graph.start_block();
        let mut schedule = Schedule::new(&graph);
        for node in [graph.start(), mem, x, ret, neg] {
            schedule.push_back(block, node);
        }
        let err = verify_schedule(&graph, &schedule).unwrap_err();
        assert!(err.to_string().contains("before its operand"));
    }
}
