//! Training hooks for customizing the fit loop.
//!
//! Hooks are called by [`Trainer`](crate::trainer::Trainer) around every
//! training step and at the end of every epoch, and can ask the loop to stop.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics::MetricsSnapshot;

/// Errors that can occur during hook execution.
#[derive(Debug, Error)]
pub enum HookError {
    /// A custom hook error.
    #[error("Hook error: {0}")]
    Custom(String),
}

/// Result type for hook operations.
pub type HookResult<T> = Result<T, HookError>;

/// Action to take after a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Continue training normally.
    Continue,
    /// Stop training early.
    Stop,
}

/// Trait for training hooks.
///
/// # Examples
///
/// ```
/// use trellis_training::hooks::{Hook, HookAction, HookResult};
/// use trellis_training::metrics::MetricsSnapshot;
///
/// struct PrintLoss;
///
/// impl Hook for PrintLoss {
///     fn name(&self) -> &str {
///         "print_loss"
///     }
///
///     fn after_step(&mut self, step: u64, logs: &MetricsSnapshot) -> HookResult<HookAction> {
///         println!("step {step}: {logs}");
///         Ok(HookAction::Continue)
///     }
/// }
/// ```
pub trait Hook {
    /// Returns the name of this hook for logging purposes.
    fn name(&self) -> &str;

    /// Called before each training step.
    ///
    /// # Arguments
    ///
    /// * `step` - The current global step (0-indexed).
    fn before_step(&mut self, _step: u64) -> HookResult<()> {
        Ok(())
    }

    /// Called after each training step with the step's snapshot.
    ///
    /// # Returns
    ///
    /// A `HookAction` indicating whether to continue or stop training.
    fn after_step(&mut self, _step: u64, _logs: &MetricsSnapshot) -> HookResult<HookAction> {
        Ok(HookAction::Continue)
    }

    /// Called after each epoch.
    ///
    /// `logs` holds the last training snapshot of the epoch and, when
    /// validation ran, the validation snapshot with keys prefixed `val_`.
    fn after_epoch(&mut self, _epoch: usize, _logs: &MetricsSnapshot) -> HookResult<HookAction> {
        Ok(HookAction::Continue)
    }

    /// Called at the end of training.
    fn end(&mut self, _step: u64, _logs: Option<&MetricsSnapshot>) -> HookResult<()> {
        Ok(())
    }
}

/// A hook that logs step snapshots at regular intervals.
#[derive(Debug)]
pub struct LoggingHook {
    every_n_steps: u64,
    log_first_step: bool,
}

impl LoggingHook {
    /// Creates a new logging hook that logs every N steps.
    pub fn new(every_n_steps: u64) -> Self {
        Self {
            every_n_steps: every_n_steps.max(1),
            log_first_step: true,
        }
    }

    /// Sets whether to log on the first step.
    pub fn with_log_first_step(mut self, log_first: bool) -> Self {
        self.log_first_step = log_first;
        self
    }

    fn should_log(&self, step: u64) -> bool {
        if step == 0 {
            self.log_first_step
        } else {
            step % self.every_n_steps == 0
        }
    }
}

impl Hook for LoggingHook {
    fn name(&self) -> &str {
        "logging_hook"
    }

    fn after_step(&mut self, step: u64, logs: &MetricsSnapshot) -> HookResult<HookAction> {
        if self.should_log(step) {
            info!("Step {}: {}", step, logs);
        }
        Ok(HookAction::Continue)
    }

    fn after_epoch(&mut self, epoch: usize, logs: &MetricsSnapshot) -> HookResult<HookAction> {
        info!("Epoch {}: {}", epoch + 1, logs);
        Ok(HookAction::Continue)
    }

    fn end(&mut self, step: u64, logs: Option<&MetricsSnapshot>) -> HookResult<()> {
        match logs.and_then(MetricsSnapshot::loss) {
            Some(loss) => info!("Training finished at step {}: final loss = {:.6}", step, loss),
            None => info!("Training finished at step {}", step),
        }
        Ok(())
    }
}

/// When [`EarlyStoppingHook`] checks its metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// After every training step.
    Step,
    /// After every epoch, so validation keys (`val_*`) can be monitored.
    Epoch,
}

/// A hook that stops training when a metric stops improving.
///
/// # Examples
///
/// ```
/// use trellis_training::hooks::{EarlyStoppingHook, MonitorMode};
///
/// // Stop if validation loss doesn't improve for 3 epochs
/// let hook = EarlyStoppingHook::new("val_loss", 3, 0.001).with_mode(MonitorMode::Epoch);
/// ```
#[derive(Debug)]
pub struct EarlyStoppingHook {
    metric_name: String,
    patience: u64,
    min_delta: f64,
    lower_is_better: bool,
    mode: MonitorMode,
    best_value: Option<f64>,
    best_at: u64,
    checks_without_improvement: u64,
}

impl EarlyStoppingHook {
    /// Creates a new early stopping hook checking after every step.
    ///
    /// # Arguments
    ///
    /// * `metric_name` - The snapshot key to monitor.
    /// * `patience` - Number of checks to wait for improvement before stopping.
    /// * `min_delta` - Minimum change to qualify as an improvement.
    ///
    /// Lower is better for keys ending in `loss` or `error`; higher is better
    /// otherwise.
    pub fn new(metric_name: impl Into<String>, patience: u64, min_delta: f64) -> Self {
        let metric_name = metric_name.into();
        let lower_is_better = metric_name.ends_with("loss") || metric_name.ends_with("error");

        Self {
            metric_name,
            patience,
            min_delta,
            lower_is_better,
            mode: MonitorMode::Step,
            best_value: None,
            best_at: 0,
            checks_without_improvement: 0,
        }
    }

    /// Sets whether lower values are better for this metric.
    pub fn with_lower_is_better(mut self, lower_is_better: bool) -> Self {
        self.lower_is_better = lower_is_better;
        self
    }

    /// Sets when the metric is checked.
    pub fn with_mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the best value seen so far.
    pub fn best_value(&self) -> Option<f64> {
        self.best_value
    }

    fn is_improvement(&self, current: f64) -> bool {
        match self.best_value {
            None => true,
            Some(best) => {
                if self.lower_is_better {
                    current < best - self.min_delta
                } else {
                    current > best + self.min_delta
                }
            }
        }
    }

    fn check(&mut self, at: u64, logs: &MetricsSnapshot) -> HookAction {
        let current = match logs.get(&self.metric_name) {
            Some(v) => v,
            None => {
                warn!(
                    "EarlyStoppingHook: metric '{}' not found in logs",
                    self.metric_name
                );
                return HookAction::Continue;
            }
        };

        if self.is_improvement(current) {
            debug!(
                "EarlyStoppingHook: {} improved from {:?} to {} at {}",
                self.metric_name, self.best_value, current, at
            );
            self.best_value = Some(current);
            self.best_at = at;
            self.checks_without_improvement = 0;
            return HookAction::Continue;
        }

        self.checks_without_improvement += 1;
        if self.checks_without_improvement >= self.patience {
            info!(
                "EarlyStoppingHook: stopping at {} (no improvement in '{}' since {})",
                at, self.metric_name, self.best_at
            );
            return HookAction::Stop;
        }
        HookAction::Continue
    }
}

impl Hook for EarlyStoppingHook {
    fn name(&self) -> &str {
        "early_stopping_hook"
    }

    fn after_step(&mut self, step: u64, logs: &MetricsSnapshot) -> HookResult<HookAction> {
        match self.mode {
            MonitorMode::Step => Ok(self.check(step, logs)),
            MonitorMode::Epoch => Ok(HookAction::Continue),
        }
    }

    fn after_epoch(&mut self, epoch: usize, logs: &MetricsSnapshot) -> HookResult<HookAction> {
        match self.mode {
            MonitorMode::Step => Ok(HookAction::Continue),
            MonitorMode::Epoch => Ok(self.check(epoch as u64, logs)),
        }
    }
}

/// A collection of hooks that are run together.
#[derive(Default)]
pub struct HookList {
    hooks: Vec<Box<dyn Hook>>,
}

impl HookList {
    /// Creates a new empty hook list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hook to the list.
    pub fn add<H: Hook + 'static>(&mut self, hook: H) {
        self.hooks.push(Box::new(hook));
    }

    /// Number of hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs `before_step` on all hooks.
    pub fn before_step(&mut self, step: u64) -> HookResult<()> {
        for hook in &mut self.hooks {
            hook.before_step(step)?;
        }
        Ok(())
    }

    /// Runs `after_step` on all hooks.
    ///
    /// Every hook runs; returns `HookAction::Stop` if any hook requested it.
    pub fn after_step(&mut self, step: u64, logs: &MetricsSnapshot) -> HookResult<HookAction> {
        let mut action = HookAction::Continue;
        for hook in &mut self.hooks {
            if hook.after_step(step, logs)? == HookAction::Stop {
                debug!(hook = hook.name(), step, "Hook requested stop");
                action = HookAction::Stop;
            }
        }
        Ok(action)
    }

    /// Runs `after_epoch` on all hooks.
    pub fn after_epoch(&mut self, epoch: usize, logs: &MetricsSnapshot) -> HookResult<HookAction> {
        let mut action = HookAction::Continue;
        for hook in &mut self.hooks {
            if hook.after_epoch(epoch, logs)? == HookAction::Stop {
                debug!(hook = hook.name(), epoch, "Hook requested stop");
                action = HookAction::Stop;
            }
        }
        Ok(action)
    }

    /// Runs `end` on all hooks.
    pub fn end(&mut self, step: u64, logs: Option<&MetricsSnapshot>) -> HookResult<()> {
        for hook in &mut self.hooks {
            hook.end(step, logs)?;
        }
        Ok(())
    }
}
