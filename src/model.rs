//! Trainable parameter storage.
//!
//! The [`Model`] owns every parameter tensor and its gradient buffer. Graphs
//! never own parameters: a parameter node reads values through
//! [`ParameterStore`] during the forward pass and writes its gradient through
//! [`GradientSink`] during the backward pass.

use std::fmt;
use std::fs;
use std::path::Path;

use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::tensor::{Shape, Tensor};

pub const DEFAULT_INIT_MEAN: f32 = 0.0;
pub const DEFAULT_INIT_STD: f32 = 1.0;

/// Stable handle to a parameter inside a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterId(usize);

impl ParameterId {
    pub fn new(index: usize) -> Self {
        ParameterId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read access to parameter values, used by the forward pass.
pub trait ParameterStore {
    fn parameter_value(&self, id: ParameterId) -> Result<&Tensor>;

    fn parameter_shape(&self, id: ParameterId) -> Result<Shape> {
        self.parameter_value(id).map(Tensor::shape)
    }
}

/// Destination of parameter gradients, used by the backward pass.
///
/// Writes overwrite: the caller guarantees the buffer was zeroed (or freshly
/// created) before the graph's backward pass.
pub trait GradientSink {
    fn write_gradient(&mut self, id: ParameterId, gradient: &Tensor) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    value: Tensor,
    gradient: Tensor,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        let gradient = value.zeros_like();
        Parameter { value, gradient }
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    pub fn gradient(&self) -> &Tensor {
        &self.gradient
    }

    pub fn shape(&self) -> Shape {
        self.value.shape()
    }

    /// Mutable value alongside the gradient, for update rules.
    pub fn value_and_gradient(&mut self) -> (&mut Tensor, &Tensor) {
        (&mut self.value, &self.gradient)
    }

    pub fn parameter_count(&self) -> usize {
        self.value.len()
    }

    pub fn zero_gradient(&mut self) {
        self.gradient.fill(0.0);
    }

    fn set_gradient(&mut self, index: usize, gradient: &Tensor) -> Result<()> {
        if gradient.len() != self.gradient.len() {
            return Err(GraphError::ParameterGradientSizeMismatch {
                parameter: index,
                expected: self.gradient.len(),
                got: gradient.len(),
            });
        }
        self.gradient.data_mut().copy_from_slice(gradient.data());
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    parameters: Vec<Tensor>,
}

pub struct Model {
    parameters: Vec<Parameter>,
    rng: StdRng,
    init_mean: f32,
    init_std: f32,
}

impl Model {
    pub fn new(seed: u64) -> Self {
        Model {
            parameters: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            init_mean: DEFAULT_INIT_MEAN,
            init_std: DEFAULT_INIT_STD,
        }
    }

    /// Model whose new parameters are drawn from `N(mean, std_dev²)`.
    pub fn with_init(seed: u64, mean: f32, std_dev: f32) -> Result<Self> {
        if !mean.is_finite() || !std_dev.is_finite() || std_dev < 0.0 {
            return Err(GraphError::Config(format!(
                "invalid init distribution: mean {}, std {}",
                mean, std_dev
            )));
        }
        Ok(Model {
            init_mean: mean,
            init_std: std_dev,
            ..Model::new(seed)
        })
    }

    /// Adds a parameter of the given shape, initialized from the model's
    /// normal distribution.
    pub fn add_parameter(&mut self, shape: impl Into<Shape>) -> ParameterId {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.numel())
            .map(|_| {
                let z: f32 = StandardNormal.sample(&mut self.rng);
                self.init_mean + self.init_std * z
            })
            .collect();
        let value = Tensor::new(data, shape).unwrap_or_else(|_| Tensor::zeros(shape));
        self.add_parameter_with(value)
    }

    pub fn add_parameter_with(&mut self, value: Tensor) -> ParameterId {
        let id = ParameterId::new(self.parameters.len());
        debug!("model: parameter {} with shape {}", id, value.shape());
        self.parameters.push(Parameter::new(value));
        id
    }

    pub fn parameter(&self, id: ParameterId) -> Result<&Parameter> {
        self.parameters.get(id.index()).ok_or(GraphError::UnknownParameter(id.index()))
    }

    pub fn parameter_mut(&mut self, id: ParameterId) -> Result<&mut Parameter> {
        self.parameters.get_mut(id.index()).ok_or(GraphError::UnknownParameter(id.index()))
    }

    pub fn parameters(&self) -> impl Iterator<Item = (ParameterId, &Parameter)> {
        self.parameters.iter().enumerate().map(|(i, p)| (ParameterId::new(i), p))
    }

    pub fn parameters_mut(&mut self) -> impl Iterator<Item = (ParameterId, &mut Parameter)> {
        self.parameters.iter_mut().enumerate().map(|(i, p)| (ParameterId::new(i), p))
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Total number of trainable scalars across all parameters.
    pub fn parameter_count(&self) -> usize {
        self.parameters.iter().map(Parameter::parameter_count).sum()
    }

    pub fn zero_gradients(&mut self) {
        for p in &mut self.parameters {
            p.zero_gradient();
        }
    }

    /// Replaces every gradient buffer with the merged per-worker buffers.
    pub fn load_gradients(&mut self, buffers: &GradientBuffers) -> Result<()> {
        if buffers.gradients.len() != self.parameters.len() {
            return Err(GraphError::Config(format!(
                "gradient buffers cover {} parameters, model has {}",
                buffers.gradients.len(),
                self.parameters.len()
            )));
        }
        for (index, (param, grad)) in self.parameters.iter_mut().zip(buffers.gradients.iter()).enumerate() {
            param.set_gradient(index, grad)?;
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint {
            parameters: self.parameters.iter().map(|p| p.value.clone()).collect(),
        };
        let json = serde_json::to_string(&checkpoint)?;
        fs::write(path.as_ref(), json)?;
        debug!("model: saved {} parameters to {}", self.parameters.len(), path.as_ref().display());
        Ok(())
    }

    /// Loads parameter values from a checkpoint; gradients start zeroed.
    pub fn load(path: impl AsRef<Path>, seed: u64) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let checkpoint: Checkpoint = serde_json::from_str(&json)?;
        let mut model = Model::new(seed);
        for value in checkpoint.parameters {
            let shape = value.shape();
            model.add_parameter_with(Tensor::new(value.into_data(), shape)?);
        }
        Ok(model)
    }
}

impl ParameterStore for Model {
    fn parameter_value(&self, id: ParameterId) -> Result<&Tensor> {
        self.parameter(id).map(Parameter::value)
    }
}

impl GradientSink for Model {
    fn write_gradient(&mut self, id: ParameterId, gradient: &Tensor) -> Result<()> {
        let index = id.index();
        self.parameter_mut(id)?.set_gradient(index, gradient)
    }
}

/// Private gradient buffers for one worker, shaped like a model's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientBuffers {
    gradients: Vec<Tensor>,
}

impl GradientBuffers {
    pub fn for_model(model: &Model) -> Self {
        GradientBuffers {
            gradients: model.parameters.iter().map(|p| p.value.zeros_like()).collect(),
        }
    }

    pub fn gradient(&self, id: ParameterId) -> Result<&Tensor> {
        self.gradients.get(id.index()).ok_or(GraphError::UnknownParameter(id.index()))
    }

    /// Sums `other` into `self`.
    pub fn merge(mut self, other: &GradientBuffers) -> Result<Self> {
        if self.gradients.len() != other.gradients.len() {
            return Err(GraphError::Config("cannot merge gradient buffers of different models".to_string()));
        }
        for (a, b) in self.gradients.iter_mut().zip(other.gradients.iter()) {
            a.add_assign(b)?;
        }
        Ok(self)
    }

    pub fn scale(&mut self, factor: f32) {
        for g in &mut self.gradients {
            g.scale(factor);
        }
    }
}

impl GradientSink for GradientBuffers {
    fn write_gradient(&mut self, id: ParameterId, gradient: &Tensor) -> Result<()> {
        let index = id.index();
        let slot = self.gradients.get_mut(index).ok_or(GraphError::UnknownParameter(index))?;
        if slot.len() != gradient.len() {
            return Err(GraphError::ParameterGradientSizeMismatch {
                parameter: index,
                expected: slot.len(),
                got: gradient.len(),
            });
        }
        slot.data_mut().copy_from_slice(gradient.data());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_parameter_is_seeded() {
        let mut a = Model::new(7);
        let mut b = Model::new(7);
        let pa = a.add_parameter((3, 4));
        let pb = b.add_parameter((3, 4));
        assert_eq!(a.parameter(pa).unwrap().value(), b.parameter(pb).unwrap().value());
        assert_eq!(a.parameter_count(), 12);
        assert!(a.parameter(pa).unwrap().gradient().data().iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_write_gradient_checks_size() {
        let mut model = Model::new(0);
        let id = model.add_parameter_with(Tensor::vector(vec![1.0, 2.0]));
        model.write_gradient(id, &Tensor::vector(vec![0.5, -0.5])).unwrap();
        assert_eq!(model.parameter(id).unwrap().gradient().data(), &[0.5, -0.5]);

        let err = model.write_gradient(id, &Tensor::vector(vec![1.0])).unwrap_err();
        assert!(matches!(err, GraphError::ParameterGradientSizeMismatch { expected: 2, got: 1, .. }));
    }

    #[test]
    fn test_unknown_parameter() {
        let model = Model::new(0);
        assert!(matches!(model.parameter(ParameterId::new(3)), Err(GraphError::UnknownParameter(3))));
    }

    #[test]
    fn test_gradient_buffers_merge_and_load() {
        let mut model = Model::new(0);
        let id = model.add_parameter_with(Tensor::vector(vec![0.0, 0.0]));

        let mut a = GradientBuffers::for_model(&model);
        let mut b = GradientBuffers::for_model(&model);
        a.write_gradient(id, &Tensor::vector(vec![1.0, 2.0])).unwrap();
        b.write_gradient(id, &Tensor::vector(vec![3.0, 4.0])).unwrap();
        let mut merged = a.merge(&b).unwrap();
        merged.scale(0.5);
        assert_eq!(merged.gradient(id).unwrap().data(), &[2.0, 3.0]);

        model.load_gradients(&merged).unwrap();
        assert_eq!(model.parameter(id).unwrap().gradient().data(), &[2.0, 3.0]);
    }

    #[test]
    fn test_save_and_load_checkpoint() {
        let mut model = Model::new(11);
        let w = model.add_parameter((2, 3));
        let b = model.add_parameter((1, 2));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model.save(&path).unwrap();

        let loaded = Model::load(&path, 0).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.parameter(w).unwrap().value(), model.parameter(w).unwrap().value());
        assert_eq!(loaded.parameter(b).unwrap().shape(), Shape::new(1, 2));
    }
}
