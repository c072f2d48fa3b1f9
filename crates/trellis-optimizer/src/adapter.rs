//! Adapter from `candle-nn` update rules to [`Optimizer`].
//!
//! `candle-nn` optimizers are constructed with the variables they update. A
//! training step only learns the trainable set when it differentiates the
//! first loss, so [`CandleOptimizer`] binds its rule lazily on the first
//! [`apply_gradients`](Optimizer::apply_gradients) call and keeps the rule's
//! state (moments, step count) across later calls.

use candle_core::TensorId;
use tracing::debug;
use trellis_tensor::Gradients;

use crate::{Optimizer, OptimizerConfig, OptimizerError, OptimizerResult};

/// A `candle-nn` update rule that can be configured from [`OptimizerConfig`].
pub trait CandleRule: candle_nn::Optimizer {
    /// Translates `config` into the rule's own parameters.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::ConfigMismatch`] for configs this rule does
    /// not implement.
    fn rule_config(config: &OptimizerConfig) -> OptimizerResult<Self::Config>;
}

impl CandleRule for candle_nn::SGD {
    fn rule_config(config: &OptimizerConfig) -> OptimizerResult<f64> {
        match config {
            OptimizerConfig::Sgd { learning_rate } => Ok(*learning_rate),
            other => Err(OptimizerError::ConfigMismatch {
                expected: "Sgd".to_string(),
                got: other.name().to_string(),
            }),
        }
    }
}

impl CandleRule for candle_nn::AdamW {
    fn rule_config(config: &OptimizerConfig) -> OptimizerResult<candle_nn::ParamsAdamW> {
        match config {
            OptimizerConfig::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Ok(candle_nn::ParamsAdamW {
                lr: *learning_rate,
                beta1: *beta1,
                beta2: *beta2,
                eps: *epsilon,
                weight_decay: 0.0,
            }),
            OptimizerConfig::AdamW {
                learning_rate,
                beta1,
                beta2,
                epsilon,
                weight_decay,
            } => Ok(candle_nn::ParamsAdamW {
                lr: *learning_rate,
                beta1: *beta1,
                beta2: *beta2,
                eps: *epsilon,
                weight_decay: *weight_decay,
            }),
            other => Err(OptimizerError::ConfigMismatch {
                expected: "Adam or AdamW".to_string(),
                got: other.name().to_string(),
            }),
        }
    }
}

struct Bound<O> {
    rule: O,
    ids: Vec<TensorId>,
}

/// An [`Optimizer`] backed by a `candle-nn` update rule.
///
/// The variable set is fixed by the first call to `apply_gradients`. Later
/// calls must pass gradients for the same variables in the same order.
pub struct CandleOptimizer<O: CandleRule> {
    config: OptimizerConfig,
    bound: Option<Bound<O>>,
}

/// Stochastic Gradient Descent.
pub type Sgd = CandleOptimizer<candle_nn::SGD>;

/// Adam with decoupled weight decay. Plain Adam is AdamW with zero decay.
pub type AdamW = CandleOptimizer<candle_nn::AdamW>;

impl<O: CandleRule> CandleOptimizer<O> {
    /// Creates an unbound optimizer.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::ConfigMismatch`] if `config` names a
    /// different rule, or [`OptimizerError::InvalidParameter`] if it does not
    /// validate.
    pub fn new(config: OptimizerConfig) -> OptimizerResult<Self> {
        config.validate()?;
        O::rule_config(&config)?;
        Ok(Self {
            config,
            bound: None,
        })
    }

    /// Returns the configuration this optimizer was created with.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Returns whether the rule has been bound to a variable set yet.
    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    fn bind(&self, gradients: &Gradients, ids: Vec<TensorId>) -> OptimizerResult<Bound<O>> {
        let rule = O::new(gradients.sources().to_vec(), O::rule_config(&self.config)?)?;
        debug!(
            optimizer = self.config.name(),
            variables = ids.len(),
            "Bound optimizer to trainable variables"
        );
        Ok(Bound { rule, ids })
    }
}

impl<O: CandleRule> Optimizer for CandleOptimizer<O> {
    fn apply_gradients(&mut self, gradients: &Gradients) -> OptimizerResult<()> {
        let ids: Vec<TensorId> = gradients.sources().iter().map(|v| v.id()).collect();

        let mut bound = match self.bound.take() {
            Some(bound) => bound,
            None => self.bind(gradients, ids.clone())?,
        };
        if bound.ids != ids {
            let expected = bound.ids.len();
            self.bound = Some(bound);
            return Err(OptimizerError::VariableSetChanged {
                expected,
                got: ids.len(),
            });
        }

        let result = bound.rule.step(gradients.store());
        self.bound = Some(bound);
        result?;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        match &self.bound {
            Some(bound) => bound.rule.learning_rate(),
            None => self.config.learning_rate(),
        }
    }

    fn name(&self) -> &str {
        self.config.name()
    }
}
