// Post-selection verifier. After instruction selection every reachable node must be an
// x86-64 node or one of the structural kinds that pass through selection, and the operand
// modes of machine nodes must agree with the register class each operand slot requires.
// Phis are checked against their own mode so that a phi never merges values of different
// register classes.

use crate::core::error::{CompileError, CompileResult};
use crate::ir::{Graph, IrOp, Mode, NodeId};

use super::ops::RegClass;

/// Coarse register class of a value mode.
fn value_class(mode: Mode) -> Option<RegClass> {
    if mode.is_float() {
        Some(RegClass::Xmm)
    } else if mode.is_int_like() {
        Some(RegClass::Gp)
    } else if mode == Mode::Mem {
        Some(RegClass::Mem)
    } else if mode == Mode::Bool {
        Some(RegClass::Flags)
    } else {
        None
    }
}

fn accepts(class: RegClass, mode: Mode) -> bool {
    match class {
        RegClass::Gp | RegClass::Rcx => mode.is_int_like(),
        RegClass::Xmm | RegClass::X87 => mode.is_float(),
        RegClass::Flags => mode == Mode::Bool,
        RegClass::Mem => mode == Mode::Mem,
        RegClass::Any => true,
    }
}

fn check_machine_node(graph: &Graph, node: NodeId) -> Result<(), String> {
    let Some(op) = graph.x64_op(node) else {
        return Ok(());
    };
    for (pos, &operand) in graph.operands(node).iter().enumerate() {
        let Some(class) = op.operand_class(pos) else {
            continue;
        };
        if !graph.is_live(operand) {
            return Err(format!("{} {} uses dead node {} at {}", op, node, operand, pos));
        }
        if operand == graph.no_reg() && class != RegClass::Mem {
            continue;
        }
        let mode = graph.mode(operand);
        if !accepts(class, mode) {
            return Err(format!(
                "{} {} operand {} is {} in mode {}, expected class {}",
                op,
                node,
                pos,
                operand,
                mode,
                class.name()
            ));
        }
    }
    Ok(())
}

fn check_phi(graph: &Graph, phi: NodeId) -> Result<(), String> {
    let class = value_class(graph.mode(phi));
    for &operand in graph.operands(phi) {
        if value_class(graph.mode(operand)) != class {
            return Err(format!(
                "phi {} in mode {} merges {} in mode {}",
                phi,
                graph.mode(phi),
                operand,
                graph.mode(operand)
            ));
        }
    }
    Ok(())
}

/// Checks that `graph` only contains selected or pass-through nodes with legal operands.
pub fn verify_selected(graph: &Graph) -> CompileResult<()> {
    let func = graph.name();
    for node in graph.walk_postorder() {
        let result = match graph.ir_op(node) {
            None => check_machine_node(graph, node),
            Some(IrOp::Phi) => check_phi(graph, node),
            Some(op) if op.is_pass_through() => Ok(()),
            Some(op) => Err(format!("{} {} survived instruction selection", op.name(), node)),
        };
        result.map_err(|reason| CompileError::invalid_graph(func, reason))?;
    }
    log::debug!("verified selection of {}", func);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CodegenOptions;
    use crate::core::session::CompilationSession;
    use crate::ir::{GraphBuilder, NodeAttr, Opcode, Relation};
    use crate::x64::{select_graph, MachAttr, X64Op};
    use bumpalo::Bump;

    #[test]
    fn test_selected_loop_verifies() {
        let mut b = GraphBuilder::new("sum", &[Mode::I64]);
        let head = b.new_block("head");
        let exit = b.new_block("exit");
        let zero = b.konst(Mode::I64, 0);
        b.jmp(head);

        b.switch_to(head);
        let acc = b.phi_placeholder(Mode::I64);
        let i = b.phi_placeholder(Mode::I64);
        let next_acc = b.add(acc, i);
        let one = b.konst(Mode::I64, 1);
        let next_i = b.add(i, one);
        let n = b.arg(0);
        let cmp = b.cmp(Relation::Lt, next_i, n);
        b.cond(cmp, head, exit);
        b.set_phi_operands(acc, &[zero, next_acc]);
        b.set_phi_operands(i, &[zero, next_i]);

        b.switch_to(exit);
        let mem = b.initial_mem();
        b.ret(mem, &[next_acc]);
        let mut graph = b.finish();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        select_graph(&mut graph, &session, &CodegenOptions::default()).unwrap();
        verify_selected(&graph).unwrap();
    }

    #[test]
    fn test_unselected_node_is_reported() {
        let mut b = GraphBuilder::new("f", &[Mode::I32]);
        let x = b.arg(0);
        let neg = b.unop(IrOp::Minus, x);
        let mem = b.initial_mem();
        b.ret(mem, &[neg]);
        let graph = b.finish();

        let err = verify_selected(&graph).unwrap_err();
        assert!(err.to_string().contains("survived instruction selection"));
    }

    #[test]
    fn test_wrong_register_class_is_reported() {
        let mut graph = crate::ir::Graph::new("f");
        let block = graph.start_block();
        let value = graph.add_node(
            Opcode::X64(X64Op::Undef),
            Mode::F64,
            Some(block),
            Vec::new(),
            NodeAttr::Machine(Box::default()),
        );
        let no_reg = graph.no_reg();
        let no_mem = graph.no_mem();
        let add = graph.add_node(
            Opcode::X64(X64Op::Add),
            Mode::I64,
            Some(block),
            vec![no_reg, no_reg, value, value, no_mem],
            NodeAttr::Machine(Box::new(MachAttr::with_ls_mode(Mode::I64))),
        );
        graph.keep_alive(add);

        let err = verify_selected(&graph).unwrap_err();
        assert!(err.to_string().contains("expected class gp"), "{}", err);
    }
}
