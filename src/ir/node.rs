// This module defines the node model of the program graph. A node is identified by a stable
// NodeId into the graph arena and carries an opcode, a result mode, an optional owning block,
// an ordered operand list and an attribute payload. Opcodes are a tagged variant over the
// target-independent operations (IrOp) and the x86-64 machine operations (X64Op); every pass
// dispatches over them with a closed match. Attributes hold constants, projection numbers,
// comparison relations, load/store modes with their pinned flag, switch tables, call targets,
// frame entity references and, for machine nodes, the boxed machine attribute with the
// addressing-mode descriptor.

use std::cmp::Ordering;
use std::fmt;

use super::mode::Mode;
use crate::x64::{MachAttr, X64Op};

/// Stable index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Index of a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Stack slot owned by a function frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameEntity(pub u32);

impl fmt::Display for FrameEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fe{}", self.0)
    }
}

/// Target-independent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrOp {
    Start,
    End,
    Proj,
    Phi,
    Sync,
    NoMem,
    NoReg,
    Unknown,
    Const,
    SymConst,
    FrameAddr,
    Add,
    Sub,
    Mul,
    Mulh,
    Quot,
    Div,
    Mod,
    Minus,
    Abs,
    Not,
    And,
    Or,
    Eor,
    Shl,
    Shr,
    Shrs,
    Rotl,
    Cmp,
    Mux,
    Conv,
    Load,
    Store,
    Cond,
    Switch,
    Jmp,
    Return,
    Call,
    Alloc,
    Sel,
    Tuple,
    Bad,
}

impl IrOp {
    pub fn name(self) -> &'static str {
        match self {
            IrOp::Start => "Start",
            IrOp::End => "End",
            IrOp::Proj => "Proj",
            IrOp::Phi => "Phi",
            IrOp::Sync => "Sync",
            IrOp::NoMem => "NoMem",
            IrOp::NoReg => "NoReg",
            IrOp::Unknown => "Unknown",
            IrOp::Const => "Const",
            IrOp::SymConst => "SymConst",
            IrOp::FrameAddr => "FrameAddr",
            IrOp::Add => "Add",
            IrOp::Sub => "Sub",
            IrOp::Mul => "Mul",
            IrOp::Mulh => "Mulh",
            IrOp::Quot => "Quot",
            IrOp::Div => "Div",
            IrOp::Mod => "Mod",
            IrOp::Minus => "Minus",
            IrOp::Abs => "Abs",
            IrOp::Not => "Not",
            IrOp::And => "And",
            IrOp::Or => "Or",
            IrOp::Eor => "Eor",
            IrOp::Shl => "Shl",
            IrOp::Shr => "Shr",
            IrOp::Shrs => "Shrs",
            IrOp::Rotl => "Rotl",
            IrOp::Cmp => "Cmp",
            IrOp::Mux => "Mux",
            IrOp::Conv => "Conv",
            IrOp::Load => "Load",
            IrOp::Store => "Store",
            IrOp::Cond => "Cond",
            IrOp::Switch => "Switch",
            IrOp::Jmp => "Jmp",
            IrOp::Return => "Return",
            IrOp::Call => "Call",
            IrOp::Alloc => "Alloc",
            IrOp::Sel => "Sel",
            IrOp::Tuple => "Tuple",
            IrOp::Bad => "Bad",
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            IrOp::Add | IrOp::Mul | IrOp::Mulh | IrOp::And | IrOp::Or | IrOp::Eor
        )
    }

    /// Kinds that survive instruction selection unchanged.
    pub fn is_pass_through(self) -> bool {
        matches!(
            self,
            IrOp::Start
                | IrOp::End
                | IrOp::Proj
                | IrOp::Phi
                | IrOp::Sync
                | IrOp::NoMem
                | IrOp::NoReg
        )
    }
}

/// Operation kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ir(IrOp),
    X64(X64Op),
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Ir(op) => op.name(),
            Opcode::X64(op) => op.name(),
        }
    }

    pub fn is_target(self) -> bool {
        matches!(self, Opcode::X64(_))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison relation of a Cmp and of the flag consumers selected from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Relation {
    /// Relation that holds after swapping the compared operands.
    pub fn inversed(self) -> Relation {
        match self {
            Relation::Lt => Relation::Gt,
            Relation::Le => Relation::Ge,
            Relation::Gt => Relation::Lt,
            Relation::Ge => Relation::Le,
            other => other,
        }
    }

    /// Logical negation.
    pub fn negated(self) -> Relation {
        match self {
            Relation::Eq => Relation::Ne,
            Relation::Ne => Relation::Eq,
            Relation::Lt => Relation::Ge,
            Relation::Le => Relation::Gt,
            Relation::Gt => Relation::Le,
            Relation::Ge => Relation::Lt,
        }
    }

    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            Relation::Eq => ord == Ordering::Equal,
            Relation::Ne => ord != Ordering::Equal,
            Relation::Lt => ord == Ordering::Less,
            Relation::Le => ord != Ordering::Greater,
            Relation::Gt => ord == Ordering::Greater,
            Relation::Ge => ord != Ordering::Less,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Relation::Eq => "eq",
            Relation::Ne => "ne",
            Relation::Lt => "lt",
            Relation::Le => "le",
            Relation::Gt => "gt",
            Relation::Ge => "ge",
        }
    }

    pub fn parse(s: &str) -> Option<Relation> {
        Some(match s {
            "eq" => Relation::Eq,
            "ne" => Relation::Ne,
            "lt" => Relation::Lt,
            "le" => Relation::Le,
            "gt" => Relation::Gt,
            "ge" => Relation::Ge,
            _ => return None,
        })
    }
}

/// One case of a switch: control projection `pn` is taken when the selector equals `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchEntry {
    pub value: i64,
    pub pn: u32,
}

/// Case table shared by the Switch node and the selected jump-table branch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SwitchTable {
    pub default_pn: u32,
    pub entries: Vec<SwitchEntry>,
}

impl SwitchTable {
    pub fn min_value(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.value).min()
    }

    pub fn max_value(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.value).max()
    }

    /// Projection taken for `value`.
    pub fn lookup(&self, value: i64) -> u32 {
        self.entries
            .iter()
            .find(|e| e.value == value)
            .map(|e| e.pn)
            .unwrap_or(self.default_pn)
    }
}

/// Opcode-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAttr {
    None,
    Int(i64),
    Float(f64),
    Symbol(String),
    Proj(u32),
    Relation(Relation),
    Mem { mode: Mode, pinned: bool },
    Switch(SwitchTable),
    Call(String),
    Frame(FrameEntity),
    Machine(Box<MachAttr>),
}

/// A node of the program graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) op: Opcode,
    pub(crate) mode: Mode,
    pub(crate) block: Option<BlockId>,
    pub(crate) operands: Vec<NodeId>,
    pub(crate) attr: NodeAttr,
    pub(crate) dead: bool,
}

impl Node {
    pub fn op(&self) -> Opcode {
        self.op
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Owning block, `None` for graph-anchored pseudo values.
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    pub fn operands(&self) -> &[NodeId] {
        &self.operands
    }

    pub fn attr(&self) -> &NodeAttr {
        &self.attr
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn ir_op(&self) -> Option<IrOp> {
        match self.op {
            Opcode::Ir(op) => Some(op),
            Opcode::X64(_) => None,
        }
    }

    pub fn x64_op(&self) -> Option<X64Op> {
        match self.op {
            Opcode::X64(op) => Some(op),
            Opcode::Ir(_) => None,
        }
    }

    pub fn mach(&self) -> Option<&MachAttr> {
        match &self.attr {
            NodeAttr::Machine(attr) => Some(attr),
            _ => None,
        }
    }

    pub fn int_value(&self) -> Option<i64> {
        match self.attr {
            NodeAttr::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn proj_num(&self) -> Option<u32> {
        match self.attr {
            NodeAttr::Proj(pn) => Some(pn),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_inverse_and_negation() {
        assert_eq!(Relation::Lt.inversed(), Relation::Gt);
        assert_eq!(Relation::Eq.inversed(), Relation::Eq);
        assert_eq!(Relation::Le.negated(), Relation::Gt);
        let all = [
            Relation::Eq,
            Relation::Ne,
            Relation::Lt,
            Relation::Le,
            Relation::Gt,
            Relation::Ge,
        ];
        for rel in all {
            assert_eq!(rel.negated().negated(), rel);
            for ord in [Ordering::Less, Ordering::Equal, Ordering::Greater] {
                assert_ne!(rel.holds(ord), rel.negated().holds(ord));
                assert_eq!(rel.holds(ord), rel.inversed().holds(ord.reverse()));
            }
        }
    }

    #[test]
    fn test_switch_lookup_falls_back_to_default() {
        let table = SwitchTable {
            default_pn: 0,
            entries: vec![SwitchEntry { value: 3, pn: 1 }, SwitchEntry { value: 7, pn: 2 }],
        };
        assert_eq!(table.lookup(7), 2);
        assert_eq!(table.lookup(4), 0);
        assert_eq!(table.min_value(), Some(3));
        assert_eq!(table.max_value(), Some(7));
    }
}
