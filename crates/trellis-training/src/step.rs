//! Training and evaluation steps.

use candle_core::Tensor;
use tracing::debug;
use trellis_optimizer::Optimizer;
use trellis_tensor::{normalize_inputs, scalar_value, GradientTape, Nested};

use crate::error::TrainingResult;
use crate::metrics::MetricsSnapshot;
use crate::model::Model;

/// Snapshot key holding the loss computed by the step.
pub const LOSS_KEY: &str = "loss";

/// Snapshot key holding the regularization term, when the model has one.
pub const REGULARIZATION_LOSS_KEY: &str = "regularization_loss";

/// Snapshot key holding `loss + regularization_loss`, when the model has a
/// regularization term.
pub const TOTAL_LOSS_KEY: &str = "total_loss";

/// A model paired with the optimizer that updates it.
///
/// # Examples
///
/// ```
/// use candle_core::{Device, Tensor, Var};
/// use trellis_optimizer::{create_optimizer, OptimizerConfig};
/// use trellis_tensor::Nested;
/// use trellis_training::{CompiledModel, Model, Trackable, TrainingResult};
///
/// struct Bias {
///     b: Var,
/// }
///
/// impl Trackable for Bias {
///     fn trainable_variables(&self) -> Vec<Var> {
///         vec![self.b.clone()]
///     }
/// }
///
/// impl Model for Bias {
///     fn train_loss(&mut self, inputs: &Nested, _training: bool) -> TrainingResult<Tensor> {
///         let y = inputs.as_tensor()?;
///         Ok(y.broadcast_sub(self.b.as_tensor())?.sqr()?.mean_all()?)
///     }
/// }
///
/// let model = Bias { b: Var::new(&[0.0f32], &Device::Cpu).unwrap() };
/// let optimizer = create_optimizer(OptimizerConfig::Sgd { learning_rate: 0.1 }).unwrap();
/// let mut compiled = CompiledModel::new(model, optimizer);
///
/// let batch = Nested::Seq(vec![Tensor::new(&[1.0f32, 3.0], &Device::Cpu).unwrap().into()]);
/// let logs = compiled.train_step(batch).unwrap();
/// assert_eq!(logs.get("loss"), Some(5.0));
/// ```
pub struct CompiledModel<M, O = Box<dyn Optimizer>> {
    model: M,
    optimizer: O,
}

impl<M, O> CompiledModel<M, O> {
    /// Pairs `model` with `optimizer`.
    pub fn new(model: M, optimizer: O) -> Self {
        Self { model, optimizer }
    }

    /// Returns the model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Returns the model mutably.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Returns the optimizer.
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Splits into model and optimizer.
    pub fn into_parts(self) -> (M, O) {
        (self.model, self.optimizer)
    }
}

impl<M: Model, O: Optimizer> CompiledModel<M, O> {
    /// Runs one optimization step on `inputs`.
    ///
    /// A batch given as a one-element sequence is unwrapped first. The
    /// training loss is differentiated with respect to every trainable
    /// variable and the optimizer is applied; variables that did not take
    /// part in the loss get no gradient and are left unchanged.
    ///
    /// The returned snapshot holds the current value of every metric
    /// accumulator plus `"loss"`, which always carries the loss computed in
    /// this call.
    ///
    /// # Errors
    ///
    /// Any failure in the loss, the backward pass or the optimizer is
    /// returned as-is. Metric state is left as the loss function left it.
    pub fn train_step(&mut self, inputs: Nested) -> TrainingResult<MetricsSnapshot> {
        let inputs = normalize_inputs(inputs);
        let variables = self.model.trainable_variables();

        let mut tape = GradientTape::new();
        let model = &mut self.model;
        let (loss, regularization) = tape.record(|| -> TrainingResult<(Tensor, Option<Tensor>)> {
            let loss = model.train_loss(&inputs, true)?;
            let regularization = model.regularization_loss()?;
            Ok((loss, regularization))
        })?;

        let loss_value = scalar_value(&loss)?;
        let mut extra = Vec::new();
        let target = match regularization {
            Some(reg) => {
                let reg_value = scalar_value(&reg)?;
                let total = (loss.sum_all()? + reg.sum_all()?)?;
                extra.push((REGULARIZATION_LOSS_KEY, reg_value));
                extra.push((TOTAL_LOSS_KEY, scalar_value(&total)?));
                total
            }
            None => loss,
        };

        let gradients = tape.gradient(&target, &variables)?;
        self.optimizer.apply_gradients(&gradients)?;

        let mut snapshot = MetricsSnapshot::collect(&self.model.metrics());
        for (key, value) in extra {
            snapshot.insert(key, value);
        }
        snapshot.insert(LOSS_KEY, loss_value);

        debug!(
            loss = loss_value,
            variables = variables.len(),
            absent_gradients = gradients.num_absent(),
            "Train step"
        );
        Ok(snapshot)
    }

    /// Runs one evaluation step on `inputs`.
    ///
    /// Same normalization as [`train_step`](Self::train_step), but the
    /// evaluation loss is computed without recording gradients and no
    /// parameter is modified.
    ///
    /// # Errors
    ///
    /// Any failure in the loss is returned as-is.
    pub fn test_step(&mut self, inputs: Nested) -> TrainingResult<MetricsSnapshot> {
        let inputs = normalize_inputs(inputs);
        let loss = self.model.test_loss(&inputs)?;
        let loss_value = scalar_value(&loss)?;

        let mut snapshot = MetricsSnapshot::collect(&self.model.metrics());
        snapshot.insert(LOSS_KEY, loss_value);

        debug!(loss = loss_value, "Test step");
        Ok(snapshot)
    }

    /// Runs the model's inference path on `inputs`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::NotImplemented`](crate::TrainingError::NotImplemented)
    /// if the model has no inference path.
    pub fn predict(&self, inputs: Nested) -> TrainingResult<Tensor> {
        self.model.call(&normalize_inputs(inputs))
    }
}
