// gradgraph library
// Reverse-mode automatic differentiation over per-sample computation graphs

pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod model;
pub mod network;
pub mod node;
pub mod ops;
pub mod session;
pub mod tensor;
pub mod trainer;

pub use config::{OptimizerConfig, OptimizerType, TrainingConfig};
pub use data::{gaussian_blobs, one_hot_encode, two_point_dataset, DataSource, IdxDataSource, InMemoryDataSource, Sample};
pub use error::{GraphError, Result};
pub use graph::{Graph, GraphState};
pub use model::{GradientBuffers, GradientSink, Model, Parameter, ParameterId, ParameterStore};
pub use network::{Activation, FeedForward};
pub use node::{Backward, Node, NodeId, Operation, OperationKind};
pub use session::{EpochStats, Session};
pub use tensor::{Shape, Tensor};
pub use trainer::{GradientDescentTrainer, OptimizerState, Trainer};
