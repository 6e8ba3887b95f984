use thiserror::Error;

use crate::node::{NodeId, OperationKind};
use crate::tensor::Shape;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Shape mismatch in {op}: left operand {left}, right operand {right}")]
    ShapeMismatch {
        op: OperationKind,
        left: Shape,
        right: Shape,
    },

    #[error("Missing upstream gradient at node {node} ({op}): {message}")]
    MissingUpstreamGradient {
        node: NodeId,
        op: OperationKind,
        message: String,
    },

    #[error("Stale output access at node {node} ({op}): {message}")]
    StaleOutputAccess {
        node: NodeId,
        op: OperationKind,
        message: String,
    },

    #[error("Invalid label: {message}")]
    InvalidLabel { message: String },

    #[error("Gradient for parameter {parameter} has {got} elements, expected {expected}")]
    ParameterGradientSizeMismatch {
        parameter: usize,
        expected: usize,
        got: usize,
    },

    #[error("Graph is {found}, operation requires {expected}")]
    InvalidGraphState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("The last node of the graph must be a cross-entropy loss, found {found}")]
    MissingLossNode { found: String },

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Unknown parameter {0}")]
    UnknownParameter(usize),

    #[error("Invalid tensor: {message}")]
    InvalidTensor { message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    pub fn shape_mismatch(op: OperationKind, left: Shape, right: Shape) -> Self {
        GraphError::ShapeMismatch { op, left, right }
    }

    pub fn missing_upstream(node: NodeId, op: OperationKind, message: impl Into<String>) -> Self {
        GraphError::MissingUpstreamGradient {
            node,
            op,
            message: message.into(),
        }
    }

    pub fn stale_output(node: NodeId, op: OperationKind, message: impl Into<String>) -> Self {
        GraphError::StaleOutputAccess {
            node,
            op,
            message: message.into(),
        }
    }

    pub fn invalid_label(message: impl Into<String>) -> Self {
        GraphError::InvalidLabel {
            message: message.into(),
        }
    }

    pub fn invalid_tensor(message: impl Into<String>) -> Self {
        GraphError::InvalidTensor {
            message: message.into(),
        }
    }

    /// True for errors raised while appending nodes; a training loop may skip
    /// the sample instead of aborting.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            GraphError::ShapeMismatch { .. } | GraphError::InvalidLabel { .. }
        )
    }
}
