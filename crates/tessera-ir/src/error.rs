//! Error types for graph construction and shape handling

use crate::graph::OperandId;

/// Result type for IR operations
pub type Result<T> = std::result::Result<T, IrError>;

/// Errors raised while building, validating or encoding a graph
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// Operand id not present in the graph
    #[error("unknown operand: {0}")]
    UnknownOperand(OperandId),

    /// Two operations write the same operand
    #[error("operand {0} has more than one producer")]
    DuplicateProducer(OperandId),

    /// An operation writes a graph input or a constant
    #[error("operand {0} is an input or constant and cannot be produced by an operation")]
    ProducedInput(OperandId),

    /// The operation dependency graph is not acyclic
    #[error("operation graph contains a cycle ({remaining} operations could not be ordered)")]
    Cycle { remaining: usize },

    /// A dynamic shape descriptor is malformed
    #[error("invalid shape range: {0}")]
    InvalidShapeRange(String),

    /// A dimension is negative where a concrete shape is required
    #[error("dimensions {0:?} are not concrete")]
    UnresolvedDimensions(Vec<i32>),

    /// Unrecognised operation type name
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    /// Constant payload does not match its declared type
    #[error("constant {id} holds {actual} bytes, type requires {expected}")]
    ConstantSizeMismatch { id: OperandId, expected: usize, actual: usize },

    /// Graph blob could not be encoded or decoded
    #[error("graph serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

impl IrError {
    /// Create an invalid shape range error
    pub fn shape_range(msg: impl Into<String>) -> Self {
        Self::InvalidShapeRange(msg.into())
    }
}
