//! # Training
//!
//! [`Trainer`] runs the domain-adversarial training loop: each iteration
//! pairs a source batch with a target batch, reconstructs both and asks the
//! domain classifier, behind the gradient reversal layer, which domain every
//! sample came from.
//!
//! Graphs are compiled once per `(mode, input shape)` by [`StepCache`] and
//! reused for every batch of that shape.

pub mod step;
pub mod trainer;

pub use step::{BatchUpdate, CompiledStep, StepCache, StepOutput, DOMAIN_LABELS, INPUT};
pub use trainer::{domain_batch, loader, Reconstruction, Trainer, BEST_CHECKPOINT_DIR, CHECKPOINT_DIR};

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::asg::AsgError;
use crate::autograd::AutogradError;
use crate::config::ConfigError;
use crate::data::DataError;
use crate::metrics::{MetricLogger, WriterError};
use crate::optimizers::OptimizerError;
use crate::runtime::backend::RuntimeError;
use crate::serialization::CheckpointError;
use crate::state::StateError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Autograd error: {0}")]
    Autograd(#[from] AutogradError),

    #[error("Graph error: {0}")]
    Graph(#[from] AsgError),

    #[error("Shape inference error: {0}")]
    Shape(#[from] ShapeInferenceError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Summary writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source or target loader yields no batches")]
    EmptyLoader,

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Parameter '{0}' is not part of the compiled graph")]
    MissingParameterNode(String),
}

pub type TrainResult<T> = Result<T, TrainError>;

/// Average losses of one pass over the data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochLosses {
    pub loss: f32,
    pub loss_rec: f32,
    pub loss_dom: f32,
    pub iterations: usize,
}

/// Outcome of [`Trainer::train_net`].
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Completed epochs, including those of a resumed run.
    pub epochs_completed: usize,
    pub global_step: usize,
    pub final_train_loss: Option<f32>,
    pub best_test_loss: Option<f32>,
    /// `train/loss` and `test/loss` per epoch.
    pub history: MetricLogger,
}
