//! Trainer configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{TrainingError, TrainingResult};

/// Configuration for [`Trainer`](crate::trainer::Trainer).
///
/// # Examples
///
/// ```
/// use trellis_training::TrainerConfig;
///
/// let config = TrainerConfig::new(5)
///     .with_steps_per_epoch(100)
///     .with_validation_freq(2);
/// assert_eq!(config.epochs, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Number of passes over the training batches.
    pub epochs: usize,
    /// Cap on steps per epoch. `None` uses every batch.
    pub steps_per_epoch: Option<usize>,
    /// Run validation every N epochs.
    pub validation_freq: usize,
    /// Log a step snapshot every N steps. 0 disables step logging.
    pub log_every_n_steps: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            steps_per_epoch: None,
            validation_freq: 1,
            log_every_n_steps: 100,
        }
    }
}

impl TrainerConfig {
    /// Creates a configuration running `epochs` epochs.
    pub fn new(epochs: usize) -> Self {
        Self {
            epochs,
            ..Self::default()
        }
    }

    /// Sets the step cap per epoch.
    pub fn with_steps_per_epoch(mut self, steps: usize) -> Self {
        self.steps_per_epoch = Some(steps);
        self
    }

    /// Sets the validation frequency in epochs.
    pub fn with_validation_freq(mut self, freq: usize) -> Self {
        self.validation_freq = freq;
        self
    }

    /// Sets the step logging interval.
    pub fn with_log_every_n_steps(mut self, n: u64) -> Self {
        self.log_every_n_steps = n;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Config`] if `validation_freq` or
    /// `steps_per_epoch` is zero.
    pub fn validate(&self) -> TrainingResult<()> {
        if self.validation_freq == 0 {
            return Err(TrainingError::Config(
                "validation_freq must be at least 1".to_string(),
            ));
        }
        if self.steps_per_epoch == Some(0) {
            return Err(TrainingError::Config(
                "steps_per_epoch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a configuration from JSON.
    ///
    /// Missing fields take their default values.
    pub fn from_json_str(json: &str) -> TrainingResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> TrainingResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TrainerConfig::default();
        assert_eq!(config.epochs, 1);
        assert_eq!(config.steps_per_epoch, None);
        assert_eq!(config.validation_freq, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let config = TrainerConfig::new(3).with_validation_freq(0);
        assert!(matches!(config.validate(), Err(TrainingError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TrainerConfig::from_json_str(r#"{"epochs": 4}"#).unwrap();
        assert_eq!(config, TrainerConfig::new(4));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"epochs": 2, "steps_per_epoch": 10, "log_every_n_steps": 0}}"#
        )
        .unwrap();

        let config = TrainerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.epochs, 2);
        assert_eq!(config.steps_per_epoch, Some(10));
        assert_eq!(config.log_every_n_steps, 0);
    }

    #[test]
    fn test_from_json_file_errors() {
        assert!(matches!(
            TrainerConfig::from_json_file("/nonexistent/trainer.json"),
            Err(TrainingError::Io(_))
        ));
        assert!(matches!(
            TrainerConfig::from_json_str("{not json"),
            Err(TrainingError::Json(_))
        ));
    }
}
