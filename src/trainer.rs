use std::collections::HashMap;

use log::debug;

use crate::config::{OptimizerConfig, OptimizerType};
use crate::error::{GraphError, Result};
use crate::model::{Model, ParameterId};

/// Applies an update rule to a model from its accumulated gradients.
pub trait Trainer {
    fn apply_update(&mut self, model: &mut Model) -> Result<()>;

    fn zero_gradients(&mut self, model: &mut Model) {
        model.zero_gradients();
    }
}

/// State for adaptive optimizers (Adam, RMSprop)
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    /// First moment estimates, Adam only
    pub m: HashMap<ParameterId, Vec<f32>>,
    /// Second moment estimates
    pub v: HashMap<ParameterId, Vec<f32>>,
    /// Step counter for Adam's bias correction
    pub t: usize,
}

impl OptimizerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.m.clear();
        self.v.clear();
        self.t = 0;
    }
}

#[derive(Debug, Clone)]
pub struct GradientDescentTrainer {
    config: OptimizerConfig,
    state: OptimizerState,
}

impl GradientDescentTrainer {
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(GradientDescentTrainer {
            config,
            state: OptimizerState::new(),
        })
    }

    pub fn sgd(learning_rate: f32) -> Result<Self> {
        Self::new(OptimizerConfig::sgd(learning_rate))
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }
}

fn check_lengths(id: ParameterId, value: usize, gradient: usize) -> Result<()> {
    if value != gradient {
        return Err(GraphError::ParameterGradientSizeMismatch {
            parameter: id.index(),
            expected: value,
            got: gradient,
        });
    }
    Ok(())
}

impl Trainer for GradientDescentTrainer {
    fn apply_update(&mut self, model: &mut Model) -> Result<()> {
        let lr = self.config.learning_rate;
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let epsilon = self.config.epsilon;

        if self.config.optimizer_type == OptimizerType::Adam {
            self.state.t += 1;
        }
        let bias_correction1 = 1.0 - beta1.powi(self.state.t as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.state.t as i32);

        for (id, parameter) in model.parameters_mut() {
            let (value, gradient) = parameter.value_and_gradient();
            check_lengths(id, value.len(), gradient.len())?;
            let g = gradient.data();
            let p = value.data_mut();

            match self.config.optimizer_type {
                OptimizerType::SGD => {
                    for (p_i, g_i) in p.iter_mut().zip(g) {
                        *p_i -= lr * g_i;
                    }
                }
                OptimizerType::Adam => {
                    let m = self.state.m.entry(id).or_insert_with(|| vec![0.0; g.len()]);
                    let v = self.state.v.entry(id).or_insert_with(|| vec![0.0; g.len()]);
                    check_lengths(id, m.len(), g.len())?;
                    for i in 0..g.len() {
                        m[i] = beta1 * m[i] + (1.0 - beta1) * g[i];
                        v[i] = beta2 * v[i] + (1.0 - beta2) * g[i] * g[i];
                        let m_hat = m[i] / bias_correction1;
                        let v_hat = v[i] / bias_correction2;
                        p[i] -= lr * m_hat / (v_hat.sqrt() + epsilon);
                    }
                }
                OptimizerType::RMSprop => {
                    let v = self.state.v.entry(id).or_insert_with(|| vec![0.0; g.len()]);
                    check_lengths(id, v.len(), g.len())?;
                    for i in 0..g.len() {
                        v[i] = beta2 * v[i] + (1.0 - beta2) * g[i] * g[i];
                        p[i] -= lr * g[i] / (v[i].sqrt() + epsilon);
                    }
                }
            }
        }

        debug!(
            "trainer: {:?} step over {} parameters (lr {})",
            self.config.optimizer_type,
            model.len(),
            lr
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GradientSink;
    use crate::tensor::Tensor;

    fn model_with_gradient(value: Vec<f32>, gradient: Vec<f32>) -> (Model, ParameterId) {
        let mut model = Model::new(0);
        let id = model.add_parameter_with(Tensor::vector(value));
        model.write_gradient(id, &Tensor::vector(gradient)).unwrap();
        (model, id)
    }

    #[test]
    fn test_sgd_step() {
        let (mut model, id) = model_with_gradient(vec![1.0, -1.0], vec![0.5, -2.0]);
        let mut trainer = GradientDescentTrainer::sgd(0.1).unwrap();
        trainer.apply_update(&mut model).unwrap();
        let value = model.parameter(id).unwrap().value().data().to_vec();
        assert!((value[0] - 0.95).abs() < 1e-6);
        assert!((value[1] + 0.8).abs() < 1e-6);

        trainer.zero_gradients(&mut model);
        assert!(model.parameter(id).unwrap().gradient().data().iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let (mut model, id) = model_with_gradient(vec![1.0, 1.0], vec![0.3, -4.0]);
        let mut trainer = GradientDescentTrainer::new(OptimizerConfig::adam(0.01, 0.9, 0.999, 1e-8)).unwrap();
        trainer.apply_update(&mut model).unwrap();
        let value = model.parameter(id).unwrap().value().data().to_vec();
        // With bias correction the first step is lr * sign(g).
        assert!((value[0] - 0.99).abs() < 1e-4);
        assert!((value[1] - 1.01).abs() < 1e-4);
        assert_eq!(trainer.state().t, 1);
    }

    #[test]
    fn test_rmsprop_step() {
        let (mut model, id) = model_with_gradient(vec![0.0], vec![2.0]);
        let mut trainer = GradientDescentTrainer::new(OptimizerConfig::rmsprop(0.01, 0.9, 1e-8)).unwrap();
        trainer.apply_update(&mut model).unwrap();
        // v = 0.1 * 4 = 0.4; step = 0.01 * 2 / sqrt(0.4)
        let expected = -0.01 * 2.0 / 0.4f32.sqrt();
        assert!((model.parameter(id).unwrap().value().data()[0] - expected).abs() < 1e-6);
        assert!(trainer.state().m.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(GradientDescentTrainer::sgd(0.0).is_err());
    }
}
