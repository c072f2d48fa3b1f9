//! Metric accumulators and per-step snapshots.
//!
//! Models own their accumulators and update them while computing a loss. The
//! step operations read every accumulator's current value into a
//! [`MetricsSnapshot`]; [`MetricsRecorder`] averages snapshots across steps.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{TrainingError, TrainingResult};

/// A stateful accumulator exposing a current value.
pub trait Metric {
    /// Returns the key this metric is reported under.
    fn name(&self) -> &str;

    /// Returns the current value.
    fn result(&self) -> f64;

    /// Clears the accumulated state.
    fn reset_state(&mut self);
}

fn values_f64(t: &Tensor) -> TrainingResult<Vec<f64>> {
    Ok(t.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?)
}

fn shape_mismatch(name: &str, what: &str, left: &Tensor, right: &Tensor) -> TrainingError {
    TrainingError::Metric {
        name: name.to_string(),
        message: format!(
            "{what} shape {:?} does not match {:?}",
            right.dims(),
            left.dims()
        ),
    }
}

fn weights_for(
    name: &str,
    values: &Tensor,
    sample_weight: Option<&Tensor>,
) -> TrainingResult<Vec<f64>> {
    match sample_weight {
        Some(w) if w.elem_count() == values.elem_count() => values_f64(w),
        Some(w) => Err(shape_mismatch(name, "sample_weight", values, w)),
        None => Ok(vec![1.0; values.elem_count()]),
    }
}

/// Weighted running mean.
///
/// # Examples
///
/// ```
/// use trellis_training::metrics::{Mean, Metric};
///
/// let mut mean = Mean::new("batch_size");
/// mean.update_scalar(2.0, 1.0);
/// mean.update_scalar(4.0, 1.0);
/// assert_eq!(mean.result(), 3.0);
/// ```
#[derive(Debug, Clone)]
pub struct Mean {
    name: String,
    total: f64,
    count: f64,
}

impl Mean {
    /// Creates an empty mean.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total: 0.0,
            count: 0.0,
        }
    }

    /// Adds every element of `values`, optionally weighted elementwise.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Metric`] if `sample_weight` has a different
    /// number of elements than `values`.
    pub fn update_state(
        &mut self,
        values: &Tensor,
        sample_weight: Option<&Tensor>,
    ) -> TrainingResult<()> {
        let weights = weights_for(&self.name, values, sample_weight)?;
        for (v, w) in values_f64(values)?.into_iter().zip(weights) {
            self.total += v * w;
            self.count += w;
        }
        Ok(())
    }

    /// Adds a single weighted value.
    pub fn update_scalar(&mut self, value: f64, weight: f64) {
        self.total += value * weight;
        self.count += weight;
    }
}

impl Metric for Mean {
    fn name(&self) -> &str {
        &self.name
    }

    fn result(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.total / self.count
        }
    }

    fn reset_state(&mut self) {
        self.total = 0.0;
        self.count = 0.0;
    }
}

/// Root mean squared error between labels and predictions.
#[derive(Debug, Clone)]
pub struct RootMeanSquaredError {
    name: String,
    sum_squared: f64,
    count: f64,
}

impl Default for RootMeanSquaredError {
    fn default() -> Self {
        Self::new("root_mean_squared_error")
    }
}

impl RootMeanSquaredError {
    /// Creates an empty accumulator reported under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sum_squared: 0.0,
            count: 0.0,
        }
    }

    /// Accumulates squared errors between `y_true` and `y_pred`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Metric`] if the inputs have different element
    /// counts.
    pub fn update_state(
        &mut self,
        y_true: &Tensor,
        y_pred: &Tensor,
        sample_weight: Option<&Tensor>,
    ) -> TrainingResult<()> {
        if y_true.elem_count() != y_pred.elem_count() {
            return Err(shape_mismatch(&self.name, "y_pred", y_true, y_pred));
        }
        let weights = weights_for(&self.name, y_true, sample_weight)?;
        let truth = values_f64(y_true)?;
        let pred = values_f64(y_pred)?;
        for ((t, p), w) in truth.into_iter().zip(pred).zip(weights) {
            self.sum_squared += (t - p) * (t - p) * w;
            self.count += w;
        }
        Ok(())
    }
}

impl Metric for RootMeanSquaredError {
    fn name(&self) -> &str {
        &self.name
    }

    fn result(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            (self.sum_squared / self.count).sqrt()
        }
    }

    fn reset_state(&mut self) {
        self.sum_squared = 0.0;
        self.count = 0.0;
    }
}

/// Fraction of predictions on the same side of `threshold` as their label.
///
/// Labels are positive when greater than 0.5.
#[derive(Debug, Clone)]
pub struct BinaryAccuracy {
    name: String,
    threshold: f64,
    correct: f64,
    count: f64,
}

impl Default for BinaryAccuracy {
    fn default() -> Self {
        Self::new("binary_accuracy")
    }
}

impl BinaryAccuracy {
    /// Creates an accumulator with a 0.5 threshold.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threshold: 0.5,
            correct: 0.0,
            count: 0.0,
        }
    }

    /// Sets the decision threshold applied to predictions.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Accumulates matches between `y_true` and thresholded `y_pred`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Metric`] if the inputs have different element
    /// counts.
    pub fn update_state(&mut self, y_true: &Tensor, y_pred: &Tensor) -> TrainingResult<()> {
        if y_true.elem_count() != y_pred.elem_count() {
            return Err(shape_mismatch(&self.name, "y_pred", y_true, y_pred));
        }
        let truth = values_f64(y_true)?;
        let pred = values_f64(y_pred)?;
        for (t, p) in truth.into_iter().zip(pred) {
            if (t > 0.5) == (p > self.threshold) {
                self.correct += 1.0;
            }
            self.count += 1.0;
        }
        Ok(())
    }
}

impl Metric for BinaryAccuracy {
    fn name(&self) -> &str {
        &self.name
    }

    fn result(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.correct / self.count
        }
    }

    fn reset_state(&mut self) {
        self.correct = 0.0;
        self.count = 0.0;
    }
}

/// Metric name to value, as returned by one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsSnapshot {
    values: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the current value of every accumulator, keyed by its name.
    ///
    /// When two accumulators share a name the later one wins.
    pub fn collect(metrics: &[&dyn Metric]) -> Self {
        let mut snapshot = Self::new();
        for metric in metrics {
            if snapshot
                .insert(metric.name(), metric.result())
                .is_some()
            {
                warn!(metric = metric.name(), "Duplicate metric name; later value wins");
            }
        }
        snapshot
    }

    /// Sets `name` to `value`, returning the previous value if any.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) -> Option<f64> {
        self.values.insert(name.into(), value)
    }

    /// Returns the value for `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Returns whether `name` is present.
    pub fn contains_key(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Returns the `"loss"` entry.
    pub fn loss(&self) -> Option<f64> {
        self.get(crate::step::LOSS_KEY)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns whether the snapshot has no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Returns a copy with every key prefixed, e.g. `"val_"`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        self.values
            .iter()
            .map(|(k, v)| (format!("{prefix}{k}"), *v))
            .collect()
    }

    /// Copies every entry of `other` into this snapshot, overwriting.
    pub fn extend(&mut self, other: &MetricsSnapshot) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }
}

impl FromIterator<(String, f64)> for MetricsSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name} = {value:.6}")?;
            first = false;
        }
        Ok(())
    }
}

/// Accumulates snapshots over multiple steps.
///
/// Useful for computing running averages of metrics during training.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder {
    sums: HashMap<String, f64>,
    counts: HashMap<String, u64>,
    count: u64,
}

impl MetricsRecorder {
    /// Creates a new empty `MetricsRecorder`.
    ///
    /// # Examples
    ///
    /// ```
    /// use trellis_training::metrics::MetricsRecorder;
    ///
    /// let recorder = MetricsRecorder::new();
    /// assert_eq!(recorder.count(), 0);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a snapshot.
    ///
    /// # Examples
    ///
    /// ```
    /// use trellis_training::metrics::{MetricsRecorder, MetricsSnapshot};
    ///
    /// let mut recorder = MetricsRecorder::new();
    /// let mut snapshot = MetricsSnapshot::new();
    /// snapshot.insert("loss", 0.5);
    /// recorder.record(&snapshot);
    /// snapshot.insert("loss", 0.3);
    /// recorder.record(&snapshot);
    /// assert!((recorder.average_loss() - 0.4).abs() < 1e-10);
    /// ```
    pub fn record(&mut self, snapshot: &MetricsSnapshot) {
        self.count += 1;
        for (name, value) in snapshot.iter() {
            *self.sums.entry(name.to_string()).or_insert(0.0) += value;
            *self.counts.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    /// Returns the number of snapshots recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the average of `name` over the snapshots that carried it.
    pub fn average(&self, name: &str) -> Option<f64> {
        match (self.sums.get(name), self.counts.get(name)) {
            (Some(&sum), Some(&count)) if count > 0 => Some(sum / count as f64),
            _ => None,
        }
    }

    /// Returns the average loss.
    ///
    /// Returns 0.0 if no loss has been recorded.
    pub fn average_loss(&self) -> f64 {
        self.average(crate::step::LOSS_KEY).unwrap_or(0.0)
    }

    /// Averages every recorded key into one snapshot.
    pub fn aggregate(&self) -> MetricsSnapshot {
        self.sums
            .keys()
            .filter_map(|name| self.average(name).map(|avg| (name.clone(), avg)))
            .collect()
    }

    /// Clears all recorded values.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_mean_tensor_update() {
        let mut mean = Mean::new("score");
        mean.update_state(&t(&[1.0, 2.0, 3.0]), None).unwrap();
        assert!((mean.result() - 2.0).abs() < 1e-9);

        mean.update_state(&t(&[10.0]), Some(&t(&[0.0]))).unwrap();
        assert!((mean.result() - 2.0).abs() < 1e-9);

        mean.reset_state();
        assert_eq!(mean.result(), 0.0);
    }

    #[test]
    fn test_mean_weight_shape_mismatch() {
        let mut mean = Mean::new("score");
        let err = mean
            .update_state(&t(&[1.0, 2.0]), Some(&t(&[1.0])))
            .unwrap_err();
        assert!(matches!(err, TrainingError::Metric { ref name, .. } if name == "score"));
    }

    #[test]
    fn test_rmse() {
        let mut rmse = RootMeanSquaredError::default();
        assert_eq!(rmse.name(), "root_mean_squared_error");
        rmse.update_state(&t(&[1.0, 2.0]), &t(&[3.0, 2.0]), None)
            .unwrap();
        // sqrt((4 + 0) / 2)
        assert!((rmse.result() - 2f64.sqrt()).abs() < 1e-6);

        assert!(rmse
            .update_state(&t(&[1.0]), &t(&[1.0, 2.0]), None)
            .is_err());
    }

    #[test]
    fn test_binary_accuracy() {
        let mut acc = BinaryAccuracy::default();
        acc.update_state(&t(&[1.0, 0.0, 1.0, 0.0]), &t(&[0.9, 0.2, 0.4, 0.7]))
            .unwrap();
        assert!((acc.result() - 0.5).abs() < 1e-9);

        let mut strict = BinaryAccuracy::new("acc").with_threshold(0.8);
        strict.update_state(&t(&[1.0]), &t(&[0.7])).unwrap();
        assert_eq!(strict.result(), 0.0);
    }

    #[test]
    fn test_snapshot_collect_duplicate_later_wins() {
        let mut a = Mean::new("m");
        a.update_scalar(1.0, 1.0);
        let mut b = Mean::new("m");
        b.update_scalar(5.0, 1.0);
        let rmse = RootMeanSquaredError::default();

        let snapshot = MetricsSnapshot::collect(&[&a, &rmse, &b]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("m"), Some(5.0));
    }

    #[test]
    fn test_snapshot_prefixed_and_display() {
        let mut snapshot = MetricsSnapshot::new();
        snapshot.insert("loss", 0.25);
        let val = snapshot.prefixed("val_");
        assert_eq!(val.get("val_loss"), Some(0.25));
        assert_eq!(val.to_string(), "val_loss = 0.250000");

        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"loss":0.25}"#);
    }

    #[test]
    fn test_recorder_aggregate() {
        let mut recorder = MetricsRecorder::new();
        let mut first = MetricsSnapshot::new();
        first.insert("loss", 1.0);
        first.insert("rmse", 2.0);
        let mut second = MetricsSnapshot::new();
        second.insert("loss", 3.0);

        recorder.record(&first);
        recorder.record(&second);

        let avg = recorder.aggregate();
        assert_eq!(avg.get("loss"), Some(2.0));
        assert_eq!(avg.get("rmse"), Some(2.0));
        assert_eq!(recorder.count(), 2);

        recorder.reset();
        assert_eq!(recorder.count(), 0);
        assert_eq!(recorder.average_loss(), 0.0);
    }
}
