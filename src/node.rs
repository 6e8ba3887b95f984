//! Graph vertices.
//!
//! A [`Node`] is one of a closed set of [`Operation`]s. Every node follows the
//! same contract:
//!
//! - `forward` reads the outputs of its inputs and publishes its own output
//!   exactly once.
//! - `accumulate` adds an upstream gradient (gradient of the loss with respect
//!   to this node's output) into `local_gradient`.
//! - `backward` turns the fully accumulated `local_gradient` into one
//!   contribution per input, which the graph then accumulates into those
//!   inputs.

use std::fmt;

use log::trace;

use crate::error::{GraphError, Result};
use crate::model::{GradientSink, ParameterId, ParameterStore};
use crate::ops::{elementwise, loss, product, softmax};
use crate::tensor::{Shape, Tensor};

/// Index of a node inside its graph's arena. Inputs always have a smaller
/// index than the nodes that consume them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(id: usize) -> Self {
        NodeId(id)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Input,
    Parameter,
    Summation,
    Product,
    ReLU,
    TanH,
    SoftMax,
    CrossEntropyLoss,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Input => "Input",
            OperationKind::Parameter => "Parameter",
            OperationKind::Summation => "Summation",
            OperationKind::Product => "Product",
            OperationKind::ReLU => "ReLU",
            OperationKind::TanH => "TanH",
            OperationKind::SoftMax => "SoftMax",
            OperationKind::CrossEntropyLoss => "CrossEntropyLoss",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signal handed to [`Node::accumulate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Backward {
    /// Starts the backward pass at the terminal loss node (`dL/dL = 1`).
    Seed,
    /// Gradient of the loss with respect to the receiving node's output.
    Propagate(Tensor),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Constant tensor fed from outside; receives gradients but passes none on.
    Input(Tensor),
    /// Reads a model-owned parameter.
    Parameter { id: ParameterId, shape: Shape },
    Summation { left: NodeId, right: NodeId },
    /// `weights · activations`, see [`crate::ops::product`].
    Product { weights: NodeId, activations: NodeId },
    ReLU(NodeId),
    TanH(NodeId),
    SoftMax(NodeId),
    /// Terminal loss node. `logits` is the node whose output is treated as
    /// pre-softmax scores: the softmax's own input when `input` is a softmax
    /// node, `input` itself otherwise.
    CrossEntropyLoss {
        input: NodeId,
        logits: NodeId,
        label: Tensor,
        target: usize,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Input(_) => OperationKind::Input,
            Operation::Parameter { .. } => OperationKind::Parameter,
            Operation::Summation { .. } => OperationKind::Summation,
            Operation::Product { .. } => OperationKind::Product,
            Operation::ReLU(_) => OperationKind::ReLU,
            Operation::TanH(_) => OperationKind::TanH,
            Operation::SoftMax(_) => OperationKind::SoftMax,
            Operation::CrossEntropyLoss { .. } => OperationKind::CrossEntropyLoss,
        }
    }

    /// Nodes this operation reads during the forward pass.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Operation::Input(_) | Operation::Parameter { .. } => Vec::new(),
            Operation::Summation { left, right } => vec![*left, *right],
            Operation::Product { weights, activations } => vec![*weights, *activations],
            Operation::ReLU(x) | Operation::TanH(x) | Operation::SoftMax(x) => vec![*x],
            Operation::CrossEntropyLoss { input, logits, .. } => {
                if input == logits {
                    vec![*input]
                } else {
                    vec![*input, *logits]
                }
            }
        }
    }

    /// True when the loss consumes a softmax and sends its gradient past it.
    pub fn is_fused_softmax(&self) -> bool {
        matches!(self, Operation::CrossEntropyLoss { input, logits, .. } if input != logits)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    operation: Operation,
    shape: Shape,
    output: Option<Tensor>,
    local_gradient: Option<Tensor>,
    /// ReLU/TanH: Jacobian diagonal, filled by `backward`. CrossEntropyLoss:
    /// `p - y`, the Jacobian of the loss with respect to its logits, filled by
    /// `forward`. Lives as long as the node, so it stays inspectable through
    /// `cached_jacobian()` until the graph is renewed.
    cached_jacobian: Option<Vec<f32>>,
}

fn output_of<'a>(earlier: &'a [Node], id: NodeId, reader: &Node) -> Result<&'a Tensor> {
    let node = earlier.get(id.index()).ok_or(GraphError::UnknownNode(id))?;
    node.output.as_ref().ok_or_else(|| {
        GraphError::stale_output(
            node.id,
            node.kind(),
            format!("output read by {} before forward ran", reader.id),
        )
    })
}

impl Node {
    /// Creates a node whose shape has already been validated by the graph.
    pub fn new(id: NodeId, operation: Operation, shape: Shape) -> Self {
        Node {
            id,
            operation,
            shape,
            output: None,
            local_gradient: None,
            cached_jacobian: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn output_shape(&self) -> Shape {
        self.shape
    }

    /// The published forward output.
    pub fn output(&self) -> Result<&Tensor> {
        self.output
            .as_ref()
            .ok_or_else(|| GraphError::stale_output(self.id, self.kind(), "output read before forward ran"))
    }

    pub fn local_gradient(&self) -> Option<&Tensor> {
        self.local_gradient.as_ref()
    }

    pub fn cached_jacobian(&self) -> Option<&[f32]> {
        self.cached_jacobian.as_deref()
    }

    /// Computes and publishes this node's output. `earlier` holds every node
    /// with a smaller id.
    pub fn forward(&mut self, earlier: &[Node], store: &dyn ParameterStore) -> Result<()> {
        if self.output.is_some() {
            return Err(GraphError::stale_output(self.id, self.kind(), "forward invoked twice"));
        }

        let output = match &self.operation {
            Operation::Input(value) => value.clone(),
            Operation::Parameter { id, shape } => {
                let value = store.parameter_value(*id)?;
                if value.shape() != *shape {
                    return Err(GraphError::invalid_tensor(format!(
                        "parameter {} has shape {}, graph expects {}",
                        id,
                        value.shape(),
                        shape
                    )));
                }
                value.clone()
            }
            Operation::Summation { left, right } => {
                elementwise::add(output_of(earlier, *left, self)?, output_of(earlier, *right, self)?)?
            }
            Operation::Product { weights, activations } => product::forward(
                output_of(earlier, *weights, self)?,
                output_of(earlier, *activations, self)?,
            ),
            Operation::ReLU(x) => elementwise::relu(output_of(earlier, *x, self)?),
            Operation::TanH(x) => elementwise::tanh(output_of(earlier, *x, self)?),
            Operation::SoftMax(x) => Tensor::vector(softmax::forward(output_of(earlier, *x, self)?.data())),
            Operation::CrossEntropyLoss { logits, target, .. } => {
                let ce = loss::forward(output_of(earlier, *logits, self)?.data(), *target);
                self.cached_jacobian = Some(loss::logits_gradient(&ce.probabilities, *target));
                Tensor::scalar(ce.loss)
            }
        };

        trace!("forward {} {} -> {}", self.id, self.name(), output.shape());
        self.output = Some(output);
        Ok(())
    }

    /// Adds an upstream gradient into `local_gradient`.
    pub fn accumulate(&mut self, upstream: Backward) -> Result<()> {
        if self.output.is_none() {
            return Err(GraphError::stale_output(self.id, self.kind(), "backward invoked before forward"));
        }

        let is_loss = self.kind() == OperationKind::CrossEntropyLoss;
        let gradient = match upstream {
            Backward::Seed if is_loss => Tensor::scalar(1.0),
            Backward::Seed => {
                return Err(GraphError::missing_upstream(
                    self.id,
                    self.kind(),
                    "only the terminal loss node can be seeded",
                ))
            }
            Backward::Propagate(_) if is_loss => {
                return Err(GraphError::missing_upstream(
                    self.id,
                    self.kind(),
                    "terminal loss node received an external upstream gradient",
                ))
            }
            Backward::Propagate(gradient) => gradient,
        };

        if gradient.len() != self.shape.numel() {
            return Err(GraphError::invalid_tensor(format!(
                "gradient for {} has {} elements, output has {}",
                self.id,
                gradient.len(),
                self.shape.numel()
            )));
        }

        match &mut self.local_gradient {
            Some(acc) => acc.add_assign(&gradient)?,
            None => self.local_gradient = Some(gradient),
        }
        Ok(())
    }

    /// Turns the accumulated gradient into per-input contributions.
    /// Parameter nodes write theirs to `sink` instead.
    pub fn backward(&mut self, earlier: &[Node], sink: &mut dyn GradientSink) -> Result<Vec<(NodeId, Tensor)>> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| GraphError::stale_output(self.id, self.kind(), "backward invoked before forward"))?;
        let upstream = self.local_gradient.as_ref().ok_or_else(|| {
            GraphError::missing_upstream(self.id, self.kind(), "backward invoked with no accumulated gradient")
        })?;

        let contributions = match &self.operation {
            Operation::Input(_) => Vec::new(),
            Operation::Parameter { id, .. } => {
                sink.write_gradient(*id, upstream)?;
                Vec::new()
            }
            Operation::Summation { left, right } => {
                vec![(*left, upstream.clone()), (*right, upstream.clone())]
            }
            Operation::Product { weights, activations } => {
                let (grad_w, grad_x) = product::backward(
                    output_of(earlier, *weights, self)?,
                    output_of(earlier, *activations, self)?,
                    upstream,
                )?;
                vec![(*weights, grad_w), (*activations, grad_x)]
            }
            Operation::ReLU(x) | Operation::TanH(x) => {
                let relu = self.kind() == OperationKind::ReLU;
                let diagonal = self.cached_jacobian.get_or_insert_with(|| {
                    if relu {
                        elementwise::relu_derivative(output)
                    } else {
                        elementwise::tanh_derivative(output)
                    }
                });
                vec![(*x, elementwise::apply_diagonal(upstream, diagonal)?)]
            }
            Operation::SoftMax(x) => {
                let grad = softmax::vjp(output.data(), upstream.data());
                vec![(*x, Tensor::new(grad, self.shape)?)]
            }
            Operation::CrossEntropyLoss { logits, .. } => {
                let jacobian = self.cached_jacobian.as_ref().ok_or_else(|| {
                    GraphError::stale_output(self.id, self.kind(), "loss jacobian missing after forward")
                })?;
                let scale = upstream
                    .data()
                    .first()
                    .copied()
                    .ok_or_else(|| GraphError::invalid_tensor("loss gradient is empty"))?;
                let grad = jacobian.iter().map(|g| g * scale).collect();
                let shape = earlier
                    .get(logits.index())
                    .ok_or(GraphError::UnknownNode(*logits))?
                    .output_shape();
                vec![(*logits, Tensor::new(grad, shape)?)]
            }
        };

        trace!("backward {} {} -> {} contributions", self.id, self.name(), contributions.len());
        Ok(contributions)
    }
}
