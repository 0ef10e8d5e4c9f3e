// This module defines the error type of the backend using the thiserror crate. Every fatal
// condition a pass can detect maps to one CompileError variant: nodes the instruction
// selector has no rule for (with the function, node, opcode and mode that triggered it),
// nodes that must be lowered before selection, operations that are not implemented yet,
// malformed scheduling input where the ready set runs dry with nodes left over, verifier
// failures, emitter template errors and differential simulator failures. Optimization
// passes never produce errors; a folding candidate that does not apply simply leaves the
// graph unchanged. CompileResult<T> is the alias used throughout the crate.

//! Error types for the backend.

use thiserror::Error;

use crate::ir::{BlockId, Mode, NodeId};

/// Fatal backend error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("{func}: unsupported {opcode} node {node} in mode {mode}: {reason}")]
    UnsupportedNode {
        func: String,
        node: NodeId,
        opcode: &'static str,
        mode: Mode,
        reason: &'static str,
    },

    #[error("{func}: {opcode} node {node} must be lowered before instruction selection")]
    MustBeLowered {
        func: String,
        node: NodeId,
        opcode: &'static str,
    },

    #[error("{func}: {opcode} node {node} is not implemented")]
    NotImplemented {
        func: String,
        node: NodeId,
        opcode: &'static str,
    },

    #[error(
        "{func}: malformed schedule input in block {block}, {remaining} node(s) never became ready"
    )]
    MalformedSchedule {
        func: String,
        block: BlockId,
        remaining: usize,
    },

    #[error("{func}: invalid graph: {reason}")]
    InvalidGraph { func: String, reason: String },

    #[error("Emission failed: {reason}")]
    Emit { reason: String },

    #[error("Simulation failed: {reason}")]
    Simulation { reason: String },
}

impl CompileError {
    pub fn invalid_graph(func: &str, reason: impl Into<String>) -> Self {
        CompileError::InvalidGraph {
            func: func.to_string(),
            reason: reason.into(),
        }
    }

    pub fn emit(reason: impl Into<String>) -> Self {
        CompileError::Emit {
            reason: reason.into(),
        }
    }

    pub fn simulation(reason: impl Into<String>) -> Self {
        CompileError::Simulation {
            reason: reason.into(),
        }
    }
}

/// Result type alias for backend operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_node() {
        let err = CompileError::UnsupportedNode {
            func: "f".into(),
            node: NodeId(7),
            opcode: "Add",
            mode: Mode::F64,
            reason: "no floating point unit",
        };
        assert_eq!(
            err.to_string(),
            "f: unsupported Add node n7 in mode f64: no floating point unit"
        );

        let err = CompileError::MalformedSchedule {
            func: "g".into(),
            block: BlockId(2),
            remaining: 3,
        };
        assert!(err.to_string().contains("block b2"));
    }
}
