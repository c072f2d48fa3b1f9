//! The trainable model base.
//!
//! A concrete model implements [`Trackable`] to expose its parameters and
//! metric accumulators, and [`Model`] to supply its loss. Everything else
//! (gradient recording, the optimizer update, metric collection) is driven by
//! [`CompiledModel`](crate::step::CompiledModel).
//!
//! Models that are easier to express as closures over some state can be put
//! together with [`ModelBuilder`].

use candle_core::{Tensor, Var};
use trellis_tensor::Nested;

use crate::error::{TrainingError, TrainingResult};
use crate::metrics::Metric;

/// Exposes the parameters and metric accumulators a model owns.
pub trait Trackable {
    /// Returns every trainable parameter, in a stable order.
    ///
    /// The order must not change between steps; optimizers key their state
    /// on it.
    fn trainable_variables(&self) -> Vec<Var>;

    /// Returns the model's metric accumulators.
    fn metrics(&self) -> Vec<&dyn Metric> {
        Vec::new()
    }

    /// Returns the model's metric accumulators for mutation.
    fn metrics_mut(&mut self) -> Vec<&mut dyn Metric> {
        Vec::new()
    }
}

/// A model trained by minimizing a loss it computes itself.
///
/// Only [`train_loss`](Self::train_loss) is required. When a model has no
/// separate evaluation loss, [`test_loss`](Self::test_loss) reuses the
/// training loss unchanged.
///
/// # Examples
///
/// ```
/// use candle_core::{Device, Tensor, Var};
/// use trellis_tensor::Nested;
/// use trellis_training::{Model, Trackable, TrainingResult};
///
/// struct Scale {
///     w: Var,
/// }
///
/// impl Trackable for Scale {
///     fn trainable_variables(&self) -> Vec<Var> {
///         vec![self.w.clone()]
///     }
/// }
///
/// impl Model for Scale {
///     fn train_loss(&mut self, inputs: &Nested, _training: bool) -> TrainingResult<Tensor> {
///         let x = inputs.tensor("x")?;
///         let y = inputs.tensor("y")?;
///         Ok(x.broadcast_mul(self.w.as_tensor())?.sub(y)?.sqr()?.mean_all()?)
///     }
/// }
///
/// let mut model = Scale { w: Var::new(&[2.0f32], &Device::Cpu).unwrap() };
/// let batch = Nested::map_of([
///     ("x", Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap()),
///     ("y", Tensor::new(&[2.0f32, 4.0], &Device::Cpu).unwrap()),
/// ]);
/// let loss = model.test_loss(&batch).unwrap();
/// assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
/// ```
pub trait Model: Trackable {
    /// Computes the loss for one batch.
    ///
    /// Implementations update their own metric accumulators here.
    /// `training` is `true` for training steps and for the default
    /// evaluation path.
    ///
    /// # Errors
    ///
    /// Any error is propagated to the caller of the step unchanged.
    fn train_loss(&mut self, inputs: &Nested, training: bool) -> TrainingResult<Tensor>;

    /// Computes the evaluation loss for one batch.
    ///
    /// Defaults to `train_loss(inputs, true)`.
    fn test_loss(&mut self, inputs: &Nested) -> TrainingResult<Tensor> {
        self.train_loss(inputs, true)
    }

    /// Runs inference on a batch.
    ///
    /// # Errors
    ///
    /// The default returns [`TrainingError::NotImplemented`].
    fn call(&self, _inputs: &Nested) -> TrainingResult<Tensor> {
        Err(TrainingError::NotImplemented { method: "call" })
    }

    /// Returns an extra term added to the loss during training steps.
    fn regularization_loss(&self) -> TrainingResult<Option<Tensor>> {
        Ok(None)
    }

    /// Clears every metric accumulator.
    fn reset_metrics(&mut self) {
        for metric in self.metrics_mut() {
            metric.reset_state();
        }
    }
}

type TrainLossFn<S> = Box<dyn FnMut(&mut S, &Nested, bool) -> TrainingResult<Tensor>>;
type TestLossFn<S> = Box<dyn FnMut(&mut S, &Nested) -> TrainingResult<Tensor>>;
type CallFn<S> = Box<dyn Fn(&S, &Nested) -> TrainingResult<Tensor>>;

/// Assembles a [`FnModel`] from a state value and loss closures.
///
/// # Examples
///
/// ```
/// use candle_core::{Device, Var};
/// use trellis_tensor::Nested;
/// use trellis_training::{Model, ModelBuilder, Trackable, TrainingError};
///
/// struct Params(Var);
///
/// impl Trackable for Params {
///     fn trainable_variables(&self) -> Vec<Var> {
///         vec![self.0.clone()]
///     }
/// }
///
/// let params = Params(Var::new(&[1.0f32], &Device::Cpu).unwrap());
/// let err = ModelBuilder::new(params).build().err().unwrap();
/// assert!(matches!(err, TrainingError::NotImplemented { method: "train_loss" }));
/// ```
pub struct ModelBuilder<S> {
    state: S,
    train_loss: Option<TrainLossFn<S>>,
    test_loss: Option<TestLossFn<S>>,
    call: Option<CallFn<S>>,
}

impl<S: Trackable> ModelBuilder<S> {
    /// Starts a builder around `state`.
    pub fn new(state: S) -> Self {
        Self {
            state,
            train_loss: None,
            test_loss: None,
            call: None,
        }
    }

    /// Sets the training loss.
    pub fn train_loss<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut S, &Nested, bool) -> TrainingResult<Tensor> + 'static,
    {
        self.train_loss = Some(Box::new(f));
        self
    }

    /// Sets a separate evaluation loss.
    pub fn test_loss<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut S, &Nested) -> TrainingResult<Tensor> + 'static,
    {
        self.test_loss = Some(Box::new(f));
        self
    }

    /// Sets the inference function.
    pub fn call<F>(mut self, f: F) -> Self
    where
        F: Fn(&S, &Nested) -> TrainingResult<Tensor> + 'static,
    {
        self.call = Some(Box::new(f));
        self
    }

    /// Finishes the model.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::NotImplemented`] for `"train_loss"` if no
    /// training loss was set.
    pub fn build(self) -> TrainingResult<FnModel<S>> {
        let train_loss = self.train_loss.ok_or(TrainingError::NotImplemented {
            method: "train_loss",
        })?;
        Ok(FnModel {
            state: self.state,
            train_loss,
            test_loss: self.test_loss,
            call: self.call,
        })
    }
}

/// A model whose losses are closures over a state value.
pub struct FnModel<S> {
    state: S,
    train_loss: TrainLossFn<S>,
    test_loss: Option<TestLossFn<S>>,
    call: Option<CallFn<S>>,
}

impl<S> FnModel<S> {
    /// Returns the state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Returns the state mutably.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Consumes the model and returns the state.
    pub fn into_state(self) -> S {
        self.state
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for FnModel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnModel")
            .field("state", &self.state)
            .field("test_loss", &self.test_loss.is_some())
            .field("call", &self.call.is_some())
            .finish()
    }
}

impl<S: Trackable> Trackable for FnModel<S> {
    fn trainable_variables(&self) -> Vec<Var> {
        self.state.trainable_variables()
    }

    fn metrics(&self) -> Vec<&dyn Metric> {
        self.state.metrics()
    }

    fn metrics_mut(&mut self) -> Vec<&mut dyn Metric> {
        self.state.metrics_mut()
    }
}

impl<S: Trackable> Model for FnModel<S> {
    fn train_loss(&mut self, inputs: &Nested, training: bool) -> TrainingResult<Tensor> {
        (self.train_loss)(&mut self.state, inputs, training)
    }

    fn test_loss(&mut self, inputs: &Nested) -> TrainingResult<Tensor> {
        match &mut self.test_loss {
            Some(f) => f(&mut self.state, inputs),
            None => (self.train_loss)(&mut self.state, inputs, true),
        }
    }

    fn call(&self, inputs: &Nested) -> TrainingResult<Tensor> {
        match &self.call {
            Some(f) => f(&self.state, inputs),
            None => Err(TrainingError::NotImplemented { method: "call" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Mean;
    use candle_core::Device;

    struct State {
        w: Var,
        calls: Mean,
        seen_training: Vec<bool>,
    }

    impl State {
        fn new() -> Self {
            Self {
                w: Var::new(&[3.0f32], &Device::Cpu).unwrap(),
                calls: Mean::new("calls"),
                seen_training: Vec::new(),
            }
        }
    }

    impl Trackable for State {
        fn trainable_variables(&self) -> Vec<Var> {
            vec![self.w.clone()]
        }

        fn metrics(&self) -> Vec<&dyn Metric> {
            vec![&self.calls]
        }

        fn metrics_mut(&mut self) -> Vec<&mut dyn Metric> {
            vec![&mut self.calls]
        }
    }

    fn sum_loss(s: &mut State, _inputs: &Nested, training: bool) -> TrainingResult<Tensor> {
        s.seen_training.push(training);
        s.calls.update_scalar(1.0, 1.0);
        Ok(s.w.as_tensor().sum_all()?)
    }

    #[test]
    fn test_test_loss_falls_back_to_train_loss() {
        let mut model = ModelBuilder::new(State::new())
            .train_loss(sum_loss)
            .build()
            .unwrap();

        let loss = model.test_loss(&Nested::Null).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 3.0);
        assert_eq!(model.state().seen_training, vec![true]);
    }

    #[test]
    fn test_separate_test_loss_is_used() {
        let mut model = ModelBuilder::new(State::new())
            .train_loss(sum_loss)
            .test_loss(|s: &mut State, _inputs: &Nested| Ok(s.w.as_tensor().sqr()?.sum_all()?))
            .build()
            .unwrap();

        let loss = model.test_loss(&Nested::Null).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 9.0);
        assert!(model.state().seen_training.is_empty());
    }

    #[test]
    fn test_call_not_implemented_by_default() {
        let model = ModelBuilder::new(State::new())
            .train_loss(sum_loss)
            .build()
            .unwrap();
        assert!(matches!(
            model.call(&Nested::Null),
            Err(TrainingError::NotImplemented { method: "call" })
        ));
    }

    #[test]
    fn test_call_slot() {
        let model = ModelBuilder::new(State::new())
            .train_loss(sum_loss)
            .call(|s: &State, _inputs: &Nested| Ok(s.w.as_tensor().clone()))
            .build()
            .unwrap();
        let out = model.call(&Nested::Null).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_build_without_train_loss_fails() {
        let result = ModelBuilder::new(State::new()).build();
        assert!(matches!(
            result,
            Err(TrainingError::NotImplemented {
                method: "train_loss"
            })
        ));
    }

    #[test]
    fn test_reset_metrics() {
        let mut model = ModelBuilder::new(State::new())
            .train_loss(sum_loss)
            .build()
            .unwrap();
        model.train_loss(&Nested::Null, true).unwrap();
        assert_eq!(model.metrics()[0].result(), 1.0);

        model.reset_metrics();
        assert_eq!(model.metrics()[0].result(), 0.0);
    }
}
