//! Error types for the trellis-training crate.

use thiserror::Error;
use trellis_optimizer::OptimizerError;
use trellis_tensor::TensorError;

use crate::hooks::HookError;

/// Errors that can occur while training or evaluating a model.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// A required model method was not provided.
    #[error("Not implemented: the model must provide `{method}`")]
    NotImplemented {
        /// Name of the missing method.
        method: &'static str,
    },

    /// Batch access or gradient recording failed.
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),

    /// The optimizer failed to apply gradients.
    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    /// A tensor operation inside a loss function failed.
    #[error("Runtime error: {0}")]
    Candle(#[from] candle_core::Error),

    /// A training hook failed.
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    /// A metric accumulator rejected its inputs.
    #[error("Metric '{name}' error: {message}")]
    Metric {
        /// Name of the metric.
        name: String,
        /// What went wrong.
        message: String,
    },

    /// Invalid trainer configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A batch source yielded no batches.
    #[error("No input: {0}")]
    EmptyInput(String),
}

/// Result type alias for training operations.
pub type TrainingResult<T> = Result<T, TrainingError>;
