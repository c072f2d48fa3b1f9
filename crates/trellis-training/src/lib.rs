//! A trainable model base for recommender models.
//!
//! Recommender models often do not fit a single supervised or unsupervised
//! paradigm: a retrieval model scores a query tower against a candidate tower,
//! a ranking model may combine several targets. This crate lets a model
//! supply only its loss and drives everything else:
//!
//! - **Model base**: [`Trackable`] and [`Model`], with [`ModelBuilder`] for
//!   closure-composed models
//! - **Steps**: [`CompiledModel::train_step`] and [`CompiledModel::test_step`]
//! - **Metrics**: [`Metric`] accumulators and the [`MetricsSnapshot`] each
//!   step returns
//! - **Driver**: [`Trainer`] for epochs, hooks and validation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Trainer                        │
//! │  ┌───────────────┐  ┌─────────┐  ┌────────────────┐  │
//! │  │ CompiledModel │  │  Hooks  │  │ MetricsRecorder│  │
//! │  └───────────────┘  └─────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//!                 │                     │
//!                 ▼                     ▼
//!           train_step()           test_step()
//!      tape → gradients → opt      loss only
//! ```
//!
//! # Example
//!
//! ```rust
//! use candle_core::{Device, Tensor, Var};
//! use trellis_optimizer::{create_optimizer, OptimizerConfig};
//! use trellis_tensor::Nested;
//! use trellis_training::{
//!     CompiledModel, Metric, Model, RootMeanSquaredError, Trackable, Trainer,
//!     TrainerConfig, TrainingResult,
//! };
//!
//! struct Linear {
//!     w: Var,
//!     rmse: RootMeanSquaredError,
//! }
//!
//! impl Trackable for Linear {
//!     fn trainable_variables(&self) -> Vec<Var> {
//!         vec![self.w.clone()]
//!     }
//!     fn metrics(&self) -> Vec<&dyn Metric> {
//!         vec![&self.rmse]
//!     }
//!     fn metrics_mut(&mut self) -> Vec<&mut dyn Metric> {
//!         vec![&mut self.rmse]
//!     }
//! }
//!
//! impl Model for Linear {
//!     fn train_loss(&mut self, inputs: &Nested, _training: bool) -> TrainingResult<Tensor> {
//!         let x = inputs.tensor("x")?;
//!         let y = inputs.tensor("y")?;
//!         let pred = x.broadcast_mul(self.w.as_tensor())?;
//!         self.rmse.update_state(y, &pred, None)?;
//!         Ok(pred.sub(y)?.sqr()?.mean_all()?)
//!     }
//! }
//!
//! let device = Device::Cpu;
//! let model = Linear {
//!     w: Var::new(&[0.0f32], &device).unwrap(),
//!     rmse: RootMeanSquaredError::default(),
//! };
//! let optimizer = create_optimizer(OptimizerConfig::Sgd { learning_rate: 0.1 }).unwrap();
//! let batch = Nested::map_of([
//!     ("x", Tensor::new(&[1.0f32, 2.0], &device).unwrap()),
//!     ("y", Tensor::new(&[2.0f32, 4.0], &device).unwrap()),
//! ]);
//!
//! let mut trainer =
//!     Trainer::new(CompiledModel::new(model, optimizer), TrainerConfig::new(20)).unwrap();
//! let batches = vec![batch];
//! let history = trainer.fit(&batches, Some(&batches[..])).unwrap();
//! assert!(history.last().unwrap().mean_loss < 0.1);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod model;
pub mod step;
pub mod trainer;

pub use config::TrainerConfig;
pub use error::{TrainingError, TrainingResult};
pub use hooks::{
    EarlyStoppingHook, Hook, HookAction, HookError, HookList, HookResult, LoggingHook,
    MonitorMode,
};
pub use metrics::{
    BinaryAccuracy, Mean, Metric, MetricsRecorder, MetricsSnapshot, RootMeanSquaredError,
};
pub use model::{FnModel, Model, ModelBuilder, Trackable};
pub use step::{CompiledModel, LOSS_KEY, REGULARIZATION_LOSS_KEY, TOTAL_LOSS_KEY};
pub use trainer::{EpochLogs, EvalResult, FitHistory, Trainer};
