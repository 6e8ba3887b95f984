use log::{debug, trace};

use crate::error::{GraphError, Result};
use crate::model::{GradientSink, ParameterId, ParameterStore};
use crate::node::{Backward, Node, NodeId, Operation, OperationKind};
use crate::ops::{elementwise, loss, product};
use crate::tensor::{Shape, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Empty,
    Building,
    Forwarded,
    BackwardComplete,
    /// A pass stopped on an error; only `renew` leaves this state.
    Failed,
}

impl GraphState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphState::Empty => "empty",
            GraphState::Building => "building",
            GraphState::Forwarded => "forwarded",
            GraphState::BackwardComplete => "backward-complete",
            GraphState::Failed => "failed",
        }
    }
}

/// Per-sample computation graph.
///
/// Nodes live in an arena in insertion order, so a node's inputs always sit at
/// smaller indices. The forward pass walks the arena front to back; the
/// backward pass walks it back to front, which visits every node after all of
/// its consumers have contributed to its gradient.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    state: GraphState,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            state: GraphState::Empty,
        }
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.index()).ok_or(GraphError::UnknownNode(id))
    }

    fn shape_of(&self, id: NodeId) -> Result<Shape> {
        self.node(id).map(Node::output_shape)
    }

    /// Appends a node after validating its inputs and shapes.
    pub fn add_node(&mut self, operation: Operation) -> Result<NodeId> {
        if !matches!(self.state, GraphState::Empty | GraphState::Building) {
            return Err(GraphError::InvalidGraphState {
                expected: GraphState::Building.as_str(),
                found: self.state.as_str(),
            });
        }

        let operation = self.resolve_loss_logits(operation)?;
        let shape = match &operation {
            Operation::Input(value) => value.shape(),
            Operation::Parameter { shape, .. } => *shape,
            Operation::Summation { left, right } => {
                elementwise::summation_shape(self.shape_of(*left)?, self.shape_of(*right)?)?
            }
            Operation::Product { weights, activations } => {
                product::output_shape(self.shape_of(*weights)?, self.shape_of(*activations)?)?.0
            }
            Operation::ReLU(x) | Operation::TanH(x) => self.shape_of(*x)?,
            Operation::SoftMax(x) => {
                let shape = self.shape_of(*x)?;
                if !shape.is_vector() {
                    return Err(GraphError::shape_mismatch(OperationKind::SoftMax, shape, Shape::vector(shape.numel())));
                }
                shape
            }
            Operation::CrossEntropyLoss { input, logits, label, target } => {
                if input != logits && self.node(*input)?.operation() != &Operation::SoftMax(*logits) {
                    return Err(GraphError::shape_mismatch(
                        OperationKind::CrossEntropyLoss,
                        self.shape_of(*input)?,
                        self.shape_of(*logits)?,
                    ));
                }
                let logits_shape = self.shape_of(*logits)?;
                if self.shape_of(*input)?.numel() != logits_shape.numel() {
                    return Err(GraphError::shape_mismatch(
                        OperationKind::CrossEntropyLoss,
                        self.shape_of(*input)?,
                        logits_shape,
                    ));
                }
                if loss::validate(logits_shape, label)? != *target {
                    return Err(GraphError::invalid_label(format!(
                        "target {} does not match the hot index of the label",
                        target
                    )));
                }
                Shape::scalar()
            }
        };

        let id = NodeId::new(self.nodes.len());
        trace!("add {} {} {}", id, operation.kind(), shape);
        self.nodes.push(Node::new(id, operation, shape));
        self.state = GraphState::Building;
        Ok(id)
    }

    /// A loss whose logits are a softmax output reads the softmax's input
    /// instead, so the loss is always computed from pre-softmax values.
    fn resolve_loss_logits(&self, operation: Operation) -> Result<Operation> {
        match operation {
            Operation::CrossEntropyLoss { input, logits, label, target } if input == logits => {
                let logits = match self.node(logits)?.operation() {
                    Operation::SoftMax(x) => *x,
                    _ => logits,
                };
                Ok(Operation::CrossEntropyLoss { input, logits, label, target })
            }
            other => Ok(other),
        }
    }

    pub fn add_input(&mut self, value: Tensor) -> Result<NodeId> {
        self.add_node(Operation::Input(value))
    }

    pub fn add_parameter(&mut self, store: &dyn ParameterStore, id: ParameterId) -> Result<NodeId> {
        let shape = store.parameter_shape(id)?;
        self.add_node(Operation::Parameter { id, shape })
    }

    pub fn add_summation(&mut self, left: NodeId, right: NodeId) -> Result<NodeId> {
        self.add_node(Operation::Summation { left, right })
    }

    pub fn add_product(&mut self, weights: NodeId, activations: NodeId) -> Result<NodeId> {
        self.add_node(Operation::Product { weights, activations })
    }

    pub fn add_relu(&mut self, input: NodeId) -> Result<NodeId> {
        self.add_node(Operation::ReLU(input))
    }

    pub fn add_tanh(&mut self, input: NodeId) -> Result<NodeId> {
        self.add_node(Operation::TanH(input))
    }

    pub fn add_softmax(&mut self, input: NodeId) -> Result<NodeId> {
        self.add_node(Operation::SoftMax(input))
    }

    /// Appends the terminal loss. When `input` is a softmax node the loss is
    /// computed from the softmax's logits and its gradient skips the softmax.
    pub fn add_cross_entropy(&mut self, input: NodeId, label: Tensor) -> Result<NodeId> {
        let input_node = self.node(input)?;
        let logits = match input_node.operation() {
            Operation::SoftMax(x) => *x,
            _ => input,
        };
        let target = loss::validate(input_node.output_shape(), &label)?;
        self.add_node(Operation::CrossEntropyLoss {
            input,
            logits,
            label,
            target,
        })
    }

    /// Runs every node's forward step in insertion order.
    ///
    /// Returns the predicted label and the loss. The prediction is the argmax
    /// of the last softmax output encountered, or of the loss's logits when
    /// the graph has no softmax.
    pub fn forward_pass(&mut self, store: &dyn ParameterStore) -> Result<(usize, f32)> {
        if self.state == GraphState::Failed {
            return Err(GraphError::InvalidGraphState {
                expected: GraphState::Building.as_str(),
                found: self.state.as_str(),
            });
        }
        let last = self.nodes.last().ok_or(GraphError::InvalidGraphState {
            expected: GraphState::Building.as_str(),
            found: GraphState::Empty.as_str(),
        })?;
        let logits = match last.operation() {
            Operation::CrossEntropyLoss { logits, .. } => *logits,
            other => {
                return Err(GraphError::MissingLossNode {
                    found: other.kind().to_string(),
                })
            }
        };

        let (predicted, loss) = match self.run_forward(store, logits) {
            Ok(result) => result,
            Err(err) => {
                self.state = GraphState::Failed;
                return Err(err);
            }
        };

        self.state = GraphState::Forwarded;
        debug!("forward pass over {} nodes: loss {:.6}, predicted {}", self.nodes.len(), loss, predicted);
        Ok((predicted, loss))
    }

    fn run_forward(&mut self, store: &dyn ParameterStore, logits: NodeId) -> Result<(usize, f32)> {
        let mut prediction_source = logits;
        for i in 0..self.nodes.len() {
            let (earlier, rest) = self.nodes.split_at_mut(i);
            let node = &mut rest[0];
            node.forward(earlier, store)?;
            if node.kind() == OperationKind::SoftMax {
                prediction_source = node.id();
            }
        }

        let predicted = self
            .node(prediction_source)?
            .output()?
            .argmax()
            .ok_or_else(|| GraphError::invalid_tensor("cannot predict from an empty output"))?;
        Ok((predicted, self.loss()?))
    }

    /// Seeds the loss node and propagates gradients to every node reachable
    /// from it. Parameter gradients are written to `sink`.
    pub fn backward_pass(&mut self, sink: &mut dyn GradientSink) -> Result<()> {
        if self.state != GraphState::Forwarded {
            return Err(GraphError::InvalidGraphState {
                expected: GraphState::Forwarded.as_str(),
                found: self.state.as_str(),
            });
        }

        // Gradients accumulate, so a half-finished pass cannot be retried.
        if let Err(err) = self.run_backward(sink) {
            self.state = GraphState::Failed;
            return Err(err);
        }

        self.state = GraphState::BackwardComplete;
        debug!("backward pass over {} nodes complete", self.nodes.len());
        Ok(())
    }

    fn run_backward(&mut self, sink: &mut dyn GradientSink) -> Result<()> {
        let loss = self.nodes.last_mut().ok_or(GraphError::InvalidGraphState {
            expected: GraphState::Forwarded.as_str(),
            found: GraphState::Empty.as_str(),
        })?;
        loss.accumulate(Backward::Seed)?;

        for i in (0..self.nodes.len()).rev() {
            let (earlier, rest) = self.nodes.split_at_mut(i);
            let node = &mut rest[0];
            if node.local_gradient().is_none() {
                continue;
            }
            for (input, gradient) in node.backward(earlier, sink)? {
                earlier
                    .get_mut(input.index())
                    .ok_or(GraphError::UnknownNode(input))?
                    .accumulate(Backward::Propagate(gradient))?;
            }
        }
        Ok(())
    }

    /// Loss value of a forwarded graph.
    pub fn loss(&self) -> Result<f32> {
        let last = self.nodes.last().ok_or(GraphError::InvalidGraphState {
            expected: GraphState::Forwarded.as_str(),
            found: GraphState::Empty.as_str(),
        })?;
        last.output()?
            .data()
            .first()
            .copied()
            .ok_or_else(|| GraphError::invalid_tensor("loss output is empty"))
    }

    /// Gradient of the loss with respect to a node's output, if the backward
    /// pass reached it.
    pub fn gradient(&self, id: NodeId) -> Result<Option<&Tensor>> {
        Ok(self.node(id)?.local_gradient())
    }

    /// Drops every node so the graph can be rebuilt for the next sample.
    pub fn renew(&mut self) {
        self.nodes.clear();
        self.state = GraphState::Empty;
    }

    pub fn print_structure(&self) {
        debug!("=== Graph ({}) ===", self.state.as_str());
        for node in &self.nodes {
            debug!(
                "{} {}: inputs {:?}, shape {}, gradient {}",
                node.id(),
                node.kind(),
                node.operation().inputs().iter().map(|id| id.index()).collect::<Vec<_>>(),
                node.output_shape(),
                if node.local_gradient().is_some() { "set" } else { "none" }
            );
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
