//! Optimizers for Trellis models.
//!
//! This crate defines the narrow interface a training step uses to update
//! parameters: an [`Optimizer`] consumes the `(gradient, parameter)` pairs of
//! one backward pass and mutates the parameters in place. The update rules
//! themselves come from `candle-nn`; [`CandleOptimizer`] adapts them.
//!
//! # Available Optimizers
//!
//! - [`Sgd`] - Stochastic Gradient Descent
//! - [`AdamW`] - Adam with decoupled weight decay (also serves plain Adam)
//!
//! # Example
//!
//! ```
//! use candle_core::{Device, Var};
//! use trellis_optimizer::{create_optimizer, Optimizer, OptimizerConfig};
//! use trellis_tensor::GradientTape;
//!
//! let w = Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
//! let mut optimizer = create_optimizer(OptimizerConfig::Sgd { learning_rate: 0.1 }).unwrap();
//!
//! let mut tape = GradientTape::new();
//! let loss = tape.record(|| w.as_tensor().sum_all()).unwrap();
//! let grads = tape.gradient(&loss, &[w.clone()]).unwrap();
//! optimizer.apply_gradients(&grads).unwrap();
//!
//! let updated = w.to_vec1::<f32>().unwrap();
//! assert!((updated[0] - 0.9).abs() < 1e-6);
//! assert!((updated[1] - 1.9).abs() < 1e-6);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use trellis_tensor::Gradients;

mod adapter;

pub use adapter::{AdamW, CandleOptimizer, CandleRule, Sgd};

/// Errors that can occur when working with optimizers.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Configuration type does not match the optimizer type.
    #[error("Config mismatch: expected {expected}, got {got}")]
    ConfigMismatch { expected: String, got: String },

    /// Invalid configuration parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The optimizer was bound to one set of variables and later handed another.
    #[error("Variable set changed: optimizer tracks {expected} variables, got {got}")]
    VariableSetChanged { expected: usize, got: usize },

    /// The update rule failed inside the runtime.
    #[error("Runtime error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for optimizer operations.
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Configuration for the supported optimizer types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerConfig {
    /// Stochastic Gradient Descent configuration.
    Sgd {
        /// Learning rate for gradient updates.
        learning_rate: f64,
    },

    /// Adam configuration.
    Adam {
        /// Learning rate for gradient updates.
        learning_rate: f64,
        /// Exponential decay rate for first moment estimates.
        beta1: f64,
        /// Exponential decay rate for second moment estimates.
        beta2: f64,
        /// Small constant for numerical stability.
        epsilon: f64,
    },

    /// AdamW configuration.
    AdamW {
        /// Learning rate for gradient updates.
        learning_rate: f64,
        /// Exponential decay rate for first moment estimates.
        beta1: f64,
        /// Exponential decay rate for second moment estimates.
        beta2: f64,
        /// Small constant for numerical stability.
        epsilon: f64,
        /// Decoupled weight decay coefficient.
        weight_decay: f64,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Sgd { learning_rate: 0.1 }
    }
}

impl OptimizerConfig {
    /// Adam with the usual defaults and the given learning rate.
    pub fn adam(learning_rate: f64) -> Self {
        OptimizerConfig::Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    /// Returns the name of the optimizer type.
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Sgd { .. } => "Sgd",
            OptimizerConfig::Adam { .. } => "Adam",
            OptimizerConfig::AdamW { .. } => "AdamW",
        }
    }

    /// Returns the learning rate for the optimizer.
    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerConfig::Sgd { learning_rate } => *learning_rate,
            OptimizerConfig::Adam { learning_rate, .. } => *learning_rate,
            OptimizerConfig::AdamW { learning_rate, .. } => *learning_rate,
        }
    }

    /// Checks that every parameter is in range.
    ///
    /// A learning rate of zero is accepted and freezes the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::InvalidParameter`] naming the first bad field.
    pub fn validate(&self) -> OptimizerResult<()> {
        let lr = self.learning_rate();
        if !lr.is_finite() || lr < 0.0 {
            return Err(OptimizerError::InvalidParameter(format!(
                "learning_rate must be finite and non-negative, got {lr}"
            )));
        }
        match self {
            OptimizerConfig::Sgd { .. } => Ok(()),
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
                ..
            } => validate_moments(*beta1, *beta2, *epsilon),
            OptimizerConfig::AdamW {
                beta1,
                beta2,
                epsilon,
                weight_decay,
                ..
            } => {
                validate_moments(*beta1, *beta2, *epsilon)?;
                if !weight_decay.is_finite() || *weight_decay < 0.0 {
                    return Err(OptimizerError::InvalidParameter(format!(
                        "weight_decay must be finite and non-negative, got {weight_decay}"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn validate_moments(beta1: f64, beta2: f64, epsilon: f64) -> OptimizerResult<()> {
    for (name, beta) in [("beta1", beta1), ("beta2", beta2)] {
        if !(0.0..1.0).contains(&beta) {
            return Err(OptimizerError::InvalidParameter(format!(
                "{name} must be in [0, 1), got {beta}"
            )));
        }
    }
    if epsilon.is_nan() || epsilon <= 0.0 {
        return Err(OptimizerError::InvalidParameter(format!(
            "epsilon must be positive, got {epsilon}"
        )));
    }
    Ok(())
}

/// Trait for parameter optimizers.
///
/// An optimizer receives the gradients of one backward pass and applies its
/// update rule to every `(gradient, parameter)` pair, mutating the
/// parameters in place. Parameters without a gradient are left untouched.
pub trait Optimizer {
    /// Applies one update for every source variable in `gradients`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update rule fails; parameters may then be
    /// partially updated.
    fn apply_gradients(&mut self, gradients: &Gradients) -> OptimizerResult<()>;

    /// Returns the current learning rate.
    fn learning_rate(&self) -> f64;

    /// Returns the name of the optimizer for logging purposes.
    fn name(&self) -> &str;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn apply_gradients(&mut self, gradients: &Gradients) -> OptimizerResult<()> {
        (**self).apply_gradients(gradients)
    }

    fn learning_rate(&self) -> f64 {
        (**self).learning_rate()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Creates an optimizer from the given configuration.
///
/// # Example
///
/// ```
/// use trellis_optimizer::{create_optimizer, Optimizer, OptimizerConfig};
///
/// let optimizer = create_optimizer(OptimizerConfig::adam(0.001)).unwrap();
/// assert_eq!(optimizer.name(), "Adam");
/// ```
///
/// # Errors
///
/// Returns [`OptimizerError::InvalidParameter`] if the configuration does not
/// validate.
pub fn create_optimizer(config: OptimizerConfig) -> OptimizerResult<Box<dyn Optimizer>> {
    config.validate()?;
    Ok(match &config {
        OptimizerConfig::Sgd { .. } => Box::new(Sgd::new(config)?),
        OptimizerConfig::Adam { .. } | OptimizerConfig::AdamW { .. } => {
            Box::new(AdamW::new(config)?)
        }
    })
}
