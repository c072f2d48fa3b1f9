//! Epoch-based fit and evaluate loops over a [`CompiledModel`].
//!
//! The step operations are usable on their own; [`Trainer`] adds the outer
//! loop: per-epoch metric resets, hooks, periodic validation and early
//! stopping.

use serde::{Deserialize, Serialize};
use tracing::info;
use trellis_optimizer::Optimizer;
use trellis_tensor::Nested;

use crate::config::TrainerConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::hooks::{Hook, HookAction, HookList, LoggingHook};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::model::Model;
use crate::step::CompiledModel;

/// Result of evaluating a model over a set of batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    /// Snapshot returned by the last evaluation step.
    pub metrics: MetricsSnapshot,
    /// Mean of the per-batch losses.
    pub mean_loss: f64,
    /// Number of batches evaluated.
    pub steps: usize,
}

/// What happened in one epoch of [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    /// 0-indexed epoch number.
    pub epoch: usize,
    /// Training steps run in this epoch.
    pub steps: usize,
    /// Snapshot returned by the last training step of the epoch.
    pub metrics: MetricsSnapshot,
    /// Mean of the per-step training losses.
    pub mean_loss: f64,
    /// Validation result, if validation ran after this epoch.
    pub validation: Option<EvalResult>,
}

impl EpochLogs {
    /// Training metrics merged with `val_`-prefixed validation metrics.
    pub fn combined(&self) -> MetricsSnapshot {
        let mut logs = self.metrics.clone();
        if let Some(validation) = &self.validation {
            logs.extend(&validation.metrics.prefixed("val_"));
        }
        logs
    }
}

/// Result of [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitHistory {
    /// One entry per completed epoch.
    pub epochs: Vec<EpochLogs>,
    /// Global step after the last training step.
    pub global_step: u64,
    /// Whether a hook asked training to stop.
    pub stopped_early: bool,
}

impl FitHistory {
    /// Returns the logs of the last epoch.
    pub fn last(&self) -> Option<&EpochLogs> {
        self.epochs.last()
    }
}

/// Drives a [`CompiledModel`] through epochs of training and evaluation.
pub struct Trainer<M, O = Box<dyn Optimizer>> {
    compiled: CompiledModel<M, O>,
    config: TrainerConfig,
    hooks: HookList,
    global_step: u64,
}

impl<M: Model, O: Optimizer> Trainer<M, O> {
    /// Creates a trainer.
    ///
    /// A [`LoggingHook`] is installed when `config.log_every_n_steps` is
    /// non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Config`] if the configuration is invalid.
    pub fn new(compiled: CompiledModel<M, O>, config: TrainerConfig) -> TrainingResult<Self> {
        config.validate()?;
        let mut hooks = HookList::new();
        if config.log_every_n_steps > 0 {
            hooks.add(LoggingHook::new(config.log_every_n_steps));
        }
        Ok(Self {
            compiled,
            config,
            hooks,
            global_step: 0,
        })
    }

    /// Adds a hook.
    pub fn add_hook<H: Hook + 'static>(&mut self, hook: H) {
        self.hooks.add(hook);
    }

    /// Adds a hook, builder-style.
    pub fn with_hook<H: Hook + 'static>(mut self, hook: H) -> Self {
        self.add_hook(hook);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Returns the number of training steps run so far.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Returns the compiled model.
    pub fn compiled(&self) -> &CompiledModel<M, O> {
        &self.compiled
    }

    /// Returns the compiled model mutably.
    pub fn compiled_mut(&mut self) -> &mut CompiledModel<M, O> {
        &mut self.compiled
    }

    /// Consumes the trainer and returns the compiled model.
    pub fn into_compiled(self) -> CompiledModel<M, O> {
        self.compiled
    }

    /// Trains for the configured number of epochs.
    ///
    /// Every epoch resets the model's metrics, then runs a training step per
    /// batch (up to `steps_per_epoch`). When `validation` is given, it is
    /// evaluated every `validation_freq` epochs. A hook returning
    /// [`HookAction::Stop`] ends training after the current step or epoch.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::EmptyInput`] if `train` has no batches, and
    /// propagates any step or hook failure.
    pub fn fit(
        &mut self,
        train: &[Nested],
        validation: Option<&[Nested]>,
    ) -> TrainingResult<FitHistory> {
        if train.is_empty() {
            return Err(TrainingError::EmptyInput("training batches".to_string()));
        }
        let steps_per_epoch = self.config.steps_per_epoch.unwrap_or(train.len());
        info!(
            "Starting training for {} epochs ({} steps per epoch)",
            self.config.epochs,
            steps_per_epoch.min(train.len())
        );

        let mut history = FitHistory {
            epochs: Vec::with_capacity(self.config.epochs),
            global_step: self.global_step,
            stopped_early: false,
        };

        for epoch in 0..self.config.epochs {
            self.compiled.model_mut().reset_metrics();
            let mut recorder = MetricsRecorder::new();
            let mut last = MetricsSnapshot::new();
            let mut stop = false;

            for batch in train.iter().take(steps_per_epoch) {
                self.hooks.before_step(self.global_step)?;
                let snapshot = self.compiled.train_step(batch.clone())?;
                recorder.record(&snapshot);

                if self.hooks.after_step(self.global_step, &snapshot)? == HookAction::Stop {
                    info!("Training stopped by hook at step {}", self.global_step);
                    stop = true;
                }
                self.global_step += 1;
                last = snapshot;
                if stop {
                    break;
                }
            }

            let validation = match validation {
                Some(batches) if (epoch + 1) % self.config.validation_freq == 0 => {
                    Some(self.evaluate(batches.iter().cloned())?)
                }
                _ => None,
            };

            let logs = EpochLogs {
                epoch,
                steps: recorder.count() as usize,
                metrics: last,
                mean_loss: recorder.average_loss(),
                validation,
            };
            if self.hooks.after_epoch(epoch, &logs.combined())? == HookAction::Stop {
                info!("Training stopped by hook after epoch {}", epoch + 1);
                stop = true;
            }
            history.epochs.push(logs);

            if stop {
                history.stopped_early = true;
                break;
            }
        }

        history.global_step = self.global_step;
        let final_logs = history.last().map(EpochLogs::combined);
        self.hooks.end(self.global_step, final_logs.as_ref())?;
        info!("Training complete at step {}", self.global_step);
        Ok(history)
    }

    /// Evaluates the model over `batches`.
    ///
    /// Metrics are reset first, so the returned snapshot reflects only these
    /// batches.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::EmptyInput`] if `batches` is empty, and
    /// propagates any step failure.
    pub fn evaluate<I>(&mut self, batches: I) -> TrainingResult<EvalResult>
    where
        I: IntoIterator<Item = Nested>,
    {
        self.compiled.model_mut().reset_metrics();
        let mut recorder = MetricsRecorder::new();
        let mut last = None;

        for batch in batches {
            let snapshot = self.compiled.test_step(batch)?;
            recorder.record(&snapshot);
            last = Some(snapshot);
        }

        let metrics =
            last.ok_or_else(|| TrainingError::EmptyInput("evaluation batches".to_string()))?;
        let result = EvalResult {
            metrics,
            mean_loss: recorder.average_loss(),
            steps: recorder.count() as usize,
        };
        info!(
            "Evaluation complete over {} batches: mean loss = {:.6}",
            result.steps, result.mean_loss
        );
        Ok(result)
    }
}
