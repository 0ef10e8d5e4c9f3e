//! Instruction scheduling.
//!
//! - [`Schedule`] - per-block linear order with gap-numbered time steps
//! - [`list_schedule`] - latency-driven list scheduler with pluggable heuristics
//! - [`query`] - dominance, interference and in-block reachability queries
//! - [`verify_schedule`] - topological and tuple adjacency checks

pub mod list;
pub mod query;
pub mod schedule;
pub mod verify;

pub use list::{
    default_class, list_schedule, GenericTarget, NodeClass, RegPressureHeuristic, SchedHeuristic,
    SchedInfo, SchedTarget, SelectContext, TrivialHeuristic,
};
pub use query::{value_dominates, value_strictly_dominates, values_interfere, Heights};
pub use schedule::{block_operands, is_schedulable, Schedule};
pub use verify::verify_schedule;
