// This module gathers the x86-64 target of the backend. Instruction selection (transform)
// rewrites the target-independent graph into the machine operations defined in ops; the
// address-mode optimizer folds pointer arithmetic and load/op/store triples into complex
// addressing; timing provides the scheduling callbacks for the list scheduler; verify checks
// the selected graph; the emitter prints AT&T assembly from a schedule; sim executes a
// scheduled machine graph so that folding decisions can be checked differentially.

//! x86-64 target: selection, address modes, timing, verification, emission.

pub mod address_mode;
pub mod emitter;
pub mod ops;
pub mod regs;
pub mod sim;
pub mod timing;
pub mod transform;
pub mod verify;

pub use address_mode::{fold_address_modes, fold_leas};
pub use emitter::AsmEmitter;
pub use ops::{
    AddrMode, AmFlavour, AmSupport, Immediate, MachAttr, OpType, RegClass, SymOffset, X64Op,
};
pub use regs::{AsmReg, RegisterMap};
pub use sim::Simulator;
pub use timing::X64Timing;
pub use transform::select_graph;
pub use verify::verify_selected;
