use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::Sample;
use crate::error::{GraphError, Result};
use crate::graph::Graph;
use crate::model::{Model, ParameterId, ParameterStore};
use crate::node::NodeId;

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    ReLU,
    TanH,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::ReLU => write!(f, "relu"),
            Activation::TanH => write!(f, "tanh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    pub weights: ParameterId,
    pub bias: ParameterId,
}

/// Fully connected classifier whose parameters live in a [`Model`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForward {
    layers: Vec<Layer>,
    sizes: Vec<usize>,
    activation: Activation,
}

impl FeedForward {
    /// Registers a weight `(out, in)` and a bias `(1, out)` per layer.
    pub fn register(
        model: &mut Model,
        input_dim: usize,
        hidden: &[usize],
        classes: usize,
        activation: Activation,
    ) -> Result<Self> {
        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(input_dim);
        sizes.extend_from_slice(hidden);
        sizes.push(classes);
        if sizes.iter().any(|&s| s == 0) {
            return Err(GraphError::Config(format!("layer sizes must be positive, got {:?}", sizes)));
        }

        let layers = sizes
            .windows(2)
            .map(|w| Layer {
                weights: model.add_parameter((w[1], w[0])),
                bias: model.add_parameter((1, w[1])),
            })
            .collect();

        Ok(FeedForward {
            layers,
            sizes,
            activation,
        })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn input_dim(&self) -> usize {
        self.sizes[0]
    }

    pub fn classes(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Appends `input → [W·a + b → act]* → W·a + b → SoftMax → CrossEntropy`
    /// for one sample and returns the loss node.
    pub fn build(&self, graph: &mut Graph, store: &dyn ParameterStore, sample: &Sample) -> Result<NodeId> {
        let mut activations = graph.add_input(sample.input.clone())?;
        let last = self.layers.len() - 1;

        for (i, layer) in self.layers.iter().enumerate() {
            let weights = graph.add_parameter(store, layer.weights)?;
            let bias = graph.add_parameter(store, layer.bias)?;
            let product = graph.add_product(weights, activations)?;
            let affine = graph.add_summation(product, bias)?;
            activations = if i == last {
                affine
            } else {
                match self.activation {
                    Activation::ReLU => graph.add_relu(affine)?,
                    Activation::TanH => graph.add_tanh(affine)?,
                }
            };
        }

        let probabilities = graph.add_softmax(activations)?;
        graph.add_cross_entropy(probabilities, sample.label.clone())
    }
}

impl fmt::Display for FeedForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes: Vec<String> = self.sizes.iter().map(|s| s.to_string()).collect();
        write!(f, "{} ({})", sizes.join(" -> "), self.activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::one_hot_encode;
    use crate::node::OperationKind;
    use crate::tensor::{Shape, Tensor};

    #[test]
    fn test_register_shapes() {
        let mut model = Model::new(3);
        let net = FeedForward::register(&mut model, 4, &[5, 3], 2, Activation::TanH).unwrap();
        assert_eq!(net.layers().len(), 3);
        assert_eq!(model.len(), 6);
        let first = net.layers()[0];
        assert_eq!(model.parameter(first.weights).unwrap().shape(), Shape::new(5, 4));
        assert_eq!(model.parameter(first.bias).unwrap().shape(), Shape::new(1, 5));
        assert_eq!(model.parameter_count(), 5 * 4 + 5 + 3 * 5 + 3 + 2 * 3 + 2);
        assert_eq!(net.to_string(), "4 -> 5 -> 3 -> 2 (tanh)");
    }

    #[test]
    fn test_register_rejects_empty_layer() {
        let mut model = Model::new(3);
        assert!(FeedForward::register(&mut model, 4, &[0], 2, Activation::ReLU).is_err());
    }

    #[test]
    fn test_build_graph_layout() {
        let mut model = Model::new(3);
        let net = FeedForward::register(&mut model, 3, &[4], 2, Activation::ReLU).unwrap();
        let sample = Sample::new(Tensor::vector(vec![0.1, 0.2, 0.3]), one_hot_encode(1, 2).unwrap()).unwrap();

        let mut graph = Graph::new();
        let loss = net.build(&mut graph, &model, &sample).unwrap();
        let kinds: Vec<OperationKind> = graph.nodes().iter().map(|n| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                OperationKind::Input,
                OperationKind::Parameter,
                OperationKind::Parameter,
                OperationKind::Product,
                OperationKind::Summation,
                OperationKind::ReLU,
                OperationKind::Parameter,
                OperationKind::Parameter,
                OperationKind::Product,
                OperationKind::Summation,
                OperationKind::SoftMax,
                OperationKind::CrossEntropyLoss,
            ]
        );
        assert_eq!(loss.index(), graph.len() - 1);
    }

    #[test]
    fn test_build_rejects_wrong_input_width() {
        let mut model = Model::new(3);
        let net = FeedForward::register(&mut model, 3, &[], 2, Activation::ReLU).unwrap();
        let sample = Sample::new(Tensor::vector(vec![0.1, 0.2]), one_hot_encode(0, 2).unwrap()).unwrap();
        let err = net.build(&mut Graph::new(), &model, &sample).unwrap_err();
        assert!(err.is_construction_error());
    }
}
