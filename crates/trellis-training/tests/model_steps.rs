//! Step-level behaviour of the trainable model base.

use candle_core::{DType, Device, Tensor, Var};
use trellis_optimizer::{create_optimizer, OptimizerConfig, Sgd};
use trellis_tensor::Nested;
use trellis_training::{
    CompiledModel, Mean, Metric, Model, ModelBuilder, RootMeanSquaredError, Trackable,
    TrainingError, TrainingResult, LOSS_KEY,
};

/// y = x * w + b, squared error.
struct LinearRegression {
    w: Var,
    b: Var,
    rmse: RootMeanSquaredError,
    mode_log: Vec<bool>,
}

impl LinearRegression {
    fn new() -> Self {
        let device = Device::Cpu;
        Self {
            w: Var::new(&[[0.5f32], [-0.25]], &device).unwrap(),
            b: Var::new(&[0.1f32], &device).unwrap(),
            rmse: RootMeanSquaredError::default(),
            mode_log: Vec::new(),
        }
    }

    fn predict(&self, inputs: &Nested) -> TrainingResult<Tensor> {
        let x = inputs.tensor("features")?;
        Ok(x.matmul(self.w.as_tensor())?
            .squeeze(1)?
            .broadcast_add(self.b.as_tensor())?)
    }
}

impl Trackable for LinearRegression {
    fn trainable_variables(&self) -> Vec<Var> {
        vec![self.w.clone(), self.b.clone()]
    }

    fn metrics(&self) -> Vec<&dyn Metric> {
        vec![&self.rmse]
    }

    fn metrics_mut(&mut self) -> Vec<&mut dyn Metric> {
        vec![&mut self.rmse]
    }
}

impl Model for LinearRegression {
    fn train_loss(&mut self, inputs: &Nested, training: bool) -> TrainingResult<Tensor> {
        self.mode_log.push(training);
        let y = inputs.tensor("label")?;
        let pred = self.predict(inputs)?;
        self.rmse.update_state(y, &pred, None)?;
        Ok(pred.sub(y)?.sqr()?.mean_all()?)
    }
}

fn regression_batch() -> Nested {
    let device = Device::Cpu;
    Nested::map_of([
        (
            "features",
            Tensor::new(&[[1.0f32, 2.0], [3.0, -1.0], [0.5, 0.5]], &device).unwrap(),
        ),
        ("label", Tensor::new(&[1.0f32, 2.0, 0.0], &device).unwrap()),
    ])
}

fn sgd(lr: f64) -> Sgd {
    Sgd::new(OptimizerConfig::Sgd { learning_rate: lr }).unwrap()
}

fn values(var: &Var) -> Vec<f32> {
    var.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn test_test_step_matches_train_step_loss_with_fixed_parameters() {
    let mut compiled = CompiledModel::new(LinearRegression::new(), sgd(0.0));

    let eval = compiled.test_step(regression_batch()).unwrap();
    let train = compiled.train_step(regression_batch()).unwrap();

    assert_eq!(eval.get(LOSS_KEY), train.get(LOSS_KEY));
    // Default test loss calls the training loss with training = true.
    assert_eq!(compiled.model().mode_log, vec![true, true]);
}

#[test]
fn test_single_element_sequence_is_unwrapped() {
    let mut plain = CompiledModel::new(LinearRegression::new(), sgd(0.05));
    let mut wrapped = CompiledModel::new(LinearRegression::new(), sgd(0.05));

    let a = plain.train_step(regression_batch()).unwrap();
    let b = wrapped
        .train_step(Nested::Seq(vec![regression_batch()]))
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(values(&plain.model().w), values(&wrapped.model().w));
    assert_eq!(values(&plain.model().b), values(&wrapped.model().b));

    let c = wrapped
        .test_step(Nested::Seq(vec![regression_batch()]))
        .unwrap();
    let d = plain.test_step(regression_batch()).unwrap();
    assert_eq!(c.get(LOSS_KEY), d.get(LOSS_KEY));
}

#[test]
fn test_train_step_moves_parameters_and_reduces_loss() {
    let mut compiled = CompiledModel::new(LinearRegression::new(), sgd(0.05));
    let w_before = values(&compiled.model().w);
    let b_before = values(&compiled.model().b);

    let first = compiled.train_step(regression_batch()).unwrap();
    assert_ne!(values(&compiled.model().w), w_before);
    assert_ne!(values(&compiled.model().b), b_before);

    for _ in 0..50 {
        compiled.train_step(regression_batch()).unwrap();
    }
    let after = compiled.test_step(regression_batch()).unwrap();
    assert!(after.loss().unwrap() < first.loss().unwrap());
}

#[test]
fn test_test_step_never_mutates_parameters() {
    let mut compiled = CompiledModel::new(
        LinearRegression::new(),
        create_optimizer(OptimizerConfig::adam(0.1)).unwrap(),
    );
    let w_before = values(&compiled.model().w);
    let b_before = values(&compiled.model().b);

    for _ in 0..3 {
        compiled.test_step(regression_batch()).unwrap();
    }

    let w_after = values(&compiled.model().w);
    let b_after = values(&compiled.model().b);
    assert!(w_before
        .iter()
        .zip(&w_after)
        .all(|(x, y)| x.to_bits() == y.to_bits()));
    assert!(b_before
        .iter()
        .zip(&b_after)
        .all(|(x, y)| x.to_bits() == y.to_bits()));
}

#[test]
fn test_snapshot_reports_accumulators_and_loss() {
    let mut compiled = CompiledModel::new(LinearRegression::new(), sgd(0.0));
    let logs = compiled.test_step(regression_batch()).unwrap();

    let loss = logs.loss().unwrap();
    let rmse = logs.get("root_mean_squared_error").unwrap();
    // Single batch: RMSE is the square root of the MSE loss.
    assert!((rmse - loss.sqrt()).abs() < 1e-5);
}

#[test]
fn test_step_does_not_reset_metrics() {
    let mut compiled = CompiledModel::new(LinearRegression::new(), sgd(0.0));
    compiled.test_step(regression_batch()).unwrap();
    compiled.test_step(regression_batch()).unwrap();

    // Three identical batches accumulated: RMSE still matches one batch.
    let logs = compiled.test_step(regression_batch()).unwrap();
    let rmse = logs.get("root_mean_squared_error").unwrap();
    assert!((rmse - logs.loss().unwrap().sqrt()).abs() < 1e-5);

    compiled.model_mut().reset_metrics();
    assert_eq!(compiled.model().metrics()[0].result(), 0.0);
}

struct ShadowedLoss {
    w: Var,
    shadow: Mean,
}

impl Trackable for ShadowedLoss {
    fn trainable_variables(&self) -> Vec<Var> {
        vec![self.w.clone()]
    }

    fn metrics(&self) -> Vec<&dyn Metric> {
        vec![&self.shadow]
    }
}

impl Model for ShadowedLoss {
    fn train_loss(&mut self, _inputs: &Nested, _training: bool) -> TrainingResult<Tensor> {
        self.shadow.update_scalar(123.0, 1.0);
        Ok(self.w.as_tensor().sqr()?.sum_all()?)
    }
}

#[test]
fn test_loss_entry_overwrites_accumulator_named_loss() {
    let model = ShadowedLoss {
        w: Var::new(&[2.0f32], &Device::Cpu).unwrap(),
        shadow: Mean::new("loss"),
    };
    let mut compiled = CompiledModel::new(model, sgd(0.1));

    let train = compiled.train_step(Nested::Null).unwrap();
    assert_eq!(train.get(LOSS_KEY), Some(4.0));
    assert_eq!(train.len(), 1);

    // w = 2 - 0.1 * 4 = 1.6
    let eval = compiled.test_step(Nested::Null).unwrap();
    assert!((eval.get(LOSS_KEY).unwrap() - 2.56).abs() < 1e-5);
}

/// Tiny matrix factorization: rating = <user_emb[u], item_emb[i]>.
struct Factorization {
    users: Var,
    items: Var,
    unused_bias: Var,
}

impl Factorization {
    fn new() -> Self {
        let device = Device::Cpu;
        Self {
            users: Var::new(&[[0.1f32, 0.2], [0.3, -0.1], [0.0, 0.4]], &device).unwrap(),
            items: Var::new(&[[0.2f32, 0.1], [-0.3, 0.5]], &device).unwrap(),
            unused_bias: Var::new(&[1.0f32], &device).unwrap(),
        }
    }
}

impl Trackable for Factorization {
    fn trainable_variables(&self) -> Vec<Var> {
        vec![
            self.users.clone(),
            self.items.clone(),
            self.unused_bias.clone(),
        ]
    }
}

impl Model for Factorization {
    fn train_loss(&mut self, inputs: &Nested, _training: bool) -> TrainingResult<Tensor> {
        let user_emb = self.users.as_tensor().index_select(inputs.tensor("user_id")?, 0)?;
        let item_emb = self.items.as_tensor().index_select(inputs.tensor("item_id")?, 0)?;
        let pred = user_emb.mul(&item_emb)?.sum(1)?;
        let rating = inputs.tensor("rating")?;
        Ok(pred.sub(rating)?.sqr()?.mean_all()?)
    }
}

fn ratings_batch() -> Nested {
    let device = Device::Cpu;
    Nested::map_of([
        ("user_id", Tensor::new(&[0u32, 1], &device).unwrap()),
        ("item_id", Tensor::new(&[1u32, 0], &device).unwrap()),
        ("rating", Tensor::new(&[1.0f32, 0.5], &device).unwrap()),
    ])
}

#[test]
fn test_uninvolved_parameters_are_untouched() {
    let mut compiled = CompiledModel::new(Factorization::new(), sgd(0.5));
    let users_before = values(&compiled.model().users);

    compiled.train_step(ratings_batch()).unwrap();

    assert_eq!(values(&compiled.model().unused_bias), vec![1.0]);
    let users_after = values(&compiled.model().users);
    // User 2 is not in the batch; its row gets a zero gradient.
    assert_eq!(&users_after[4..], &users_before[4..]);
    assert_ne!(&users_after[..4], &users_before[..4]);
}

#[test]
fn test_loss_errors_propagate_without_snapshot() {
    let mut compiled = CompiledModel::new(Factorization::new(), sgd(0.5));
    let items_before = values(&compiled.model().items);

    let missing_rating = Nested::map_of([
        ("user_id", Tensor::new(&[0u32], &Device::Cpu).unwrap()),
        ("item_id", Tensor::new(&[0u32], &Device::Cpu).unwrap()),
    ]);
    let err = compiled.train_step(missing_rating).unwrap_err();
    assert!(err.to_string().contains("rating"));
    assert_eq!(values(&compiled.model().items), items_before);
}

#[test]
fn test_non_scalar_loss_is_rejected() {
    let model = ModelBuilder::new(Factorization::new())
        .train_loss(|m: &mut Factorization, _inputs: &Nested, _training: bool| {
            Ok(m.items.as_tensor().sqr()?)
        })
        .build()
        .unwrap();
    let mut compiled = CompiledModel::new(model, sgd(0.1));

    let err = compiled.train_step(Nested::Null).unwrap_err();
    assert!(matches!(err, TrainingError::Tensor(_)));
    assert!(err.to_string().contains("scalar"));
}

#[test]
fn test_closure_model_with_separate_test_loss() {
    let model = ModelBuilder::new(Factorization::new())
        .train_loss(|m: &mut Factorization, inputs: &Nested, training: bool| {
            assert!(training);
            m.train_loss(inputs, training)
        })
        .test_loss(|_m: &mut Factorization, _inputs: &Nested| {
            Ok(Tensor::zeros((), DType::F32, &Device::Cpu)?)
        })
        .build()
        .unwrap();
    let mut compiled = CompiledModel::new(model, sgd(0.1));

    assert!(compiled.train_step(ratings_batch()).unwrap().loss().unwrap() > 0.0);
    assert_eq!(compiled.test_step(ratings_batch()).unwrap().loss(), Some(0.0));
}

#[test]
fn test_missing_train_loss_and_call_are_not_implemented() {
    let err = ModelBuilder::new(Factorization::new()).build().err().unwrap();
    assert!(matches!(
        err,
        TrainingError::NotImplemented {
            method: "train_loss"
        }
    ));

    let compiled = CompiledModel::new(Factorization::new(), sgd(0.1));
    assert!(matches!(
        compiled.predict(ratings_batch()),
        Err(TrainingError::NotImplemented { method: "call" })
    ));
}
