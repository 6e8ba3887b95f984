use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::model::DEFAULT_INIT_STD;
use crate::network::Activation;

/// Optimizer type for training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    #[default]
    SGD,
    Adam,
    RMSprop,
}

/// Optimizer configuration with hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub optimizer_type: OptimizerType,
    pub learning_rate: f32,
    pub beta1: f32,   // Adam: momentum decay
    pub beta2: f32,   // Adam/RMSprop: squared gradient decay
    pub epsilon: f32, // keeps the adaptive denominators away from zero
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            optimizer_type: OptimizerType::SGD,
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn sgd(learning_rate: f32) -> Self {
        OptimizerConfig {
            optimizer_type: OptimizerType::SGD,
            learning_rate,
            ..Default::default()
        }
    }

    pub fn adam(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        OptimizerConfig {
            optimizer_type: OptimizerType::Adam,
            learning_rate,
            beta1,
            beta2,
            epsilon,
        }
    }

    pub fn rmsprop(learning_rate: f32, beta2: f32, epsilon: f32) -> Self {
        OptimizerConfig {
            optimizer_type: OptimizerType::RMSprop,
            learning_rate,
            beta1: 0.0, // unused
            beta2,
            epsilon,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(GraphError::Config(format!("learning rate must be positive, got {}", self.learning_rate)));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(GraphError::Config(format!("{} must be in [0, 1), got {}", name, beta)));
            }
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(GraphError::Config(format!("epsilon must be positive, got {}", self.epsilon)));
        }
        Ok(())
    }
}

/// Everything a training run needs besides the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub seed: u64,
    pub hidden: Vec<usize>,
    pub activation: Activation,
    pub init_std: f32,
    pub optimizer: OptimizerConfig,
    pub epochs: usize,
    /// 1 trains sample by sample; larger values average gradients over a
    /// mini-batch computed in parallel.
    pub batch_size: usize,
    /// 0 lets rayon pick.
    pub workers: usize,
    pub log_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            seed: 42,
            hidden: vec![16],
            activation: Activation::ReLU,
            init_std: DEFAULT_INIT_STD,
            optimizer: OptimizerConfig::default(),
            epochs: 5,
            batch_size: 1,
            workers: 0,
            log_interval: 1000,
        }
    }
}

impl TrainingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let config: TrainingConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        if self.epochs == 0 {
            return Err(GraphError::Config("epochs must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(GraphError::Config("batch size must be at least 1".to_string()));
        }
        if self.hidden.iter().any(|&h| h == 0) {
            return Err(GraphError::Config("hidden layers must have at least one unit".to_string()));
        }
        if !(self.init_std.is_finite() && self.init_std >= 0.0) {
            return Err(GraphError::Config(format!("init std must be non-negative, got {}", self.init_std)));
        }
        Ok(())
    }
}
