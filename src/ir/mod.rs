//! SSA program graph consumed by the backend.
//!
//! - [`Graph`] - node arena with out-edges, blocks, frame and replacement table
//! - [`GraphBuilder`] - programmatic construction
//! - [`analysis`] - block order, dominance and liveness

pub mod analysis;
pub mod builder;
pub mod graph;
pub mod mode;
pub mod node;

pub use analysis::{reverse_postorder, DomTree, Liveness};
pub use builder::GraphBuilder;
pub use graph::{Block, Frame, FrameLayout, FrameSlot, Graph, Use};
pub use mode::Mode;
pub use node::{
    BlockId, FrameEntity, IrOp, Node, NodeAttr, NodeId, Opcode, Relation, SwitchEntry,
    SwitchTable,
};

/// Projection numbers shared by target-independent and machine tuples.
pub mod pn {
    /// Initial memory of Start.
    pub const START_M: u32 = 0;
    /// First argument of Start.
    pub const START_ARG0: u32 = 1;
    /// Memory result of loads, divisions, calls and address-mode tuples.
    pub const MEM: u32 = 0;
    /// Value result of loads, divisions and address-mode tuples; first call result.
    pub const RES: u32 = 1;
    /// Remainder result of a machine division.
    pub const REM: u32 = 2;
    pub const COND_FALSE: u32 = 0;
    pub const COND_TRUE: u32 = 1;
    /// Low half of a widening multiply.
    pub const MUL_LO: u32 = 0;
    /// High half of a widening multiply.
    pub const MUL_HI: u32 = 1;
}
