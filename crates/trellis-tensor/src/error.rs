//! Error types for the trellis-tensor crate.

use thiserror::Error;

/// Error type for batch access and gradient recording.
#[derive(Debug, Error)]
pub enum TensorError {
    /// An error raised by the differentiable runtime.
    #[error("Runtime error: {0}")]
    Candle(#[from] candle_core::Error),

    /// A tensor expected to hold a single value held more (or none).
    #[error("Expected a scalar tensor, got shape {shape:?}")]
    NonScalar {
        /// The shape of the offending tensor.
        shape: Vec<usize>,
    },

    /// A keyed lookup into a batch found nothing.
    #[error("Missing key in batch: {key}")]
    MissingKey {
        /// The key that was requested.
        key: String,
    },

    /// A batch node had a different variant than the caller expected.
    #[error("Unexpected batch structure: expected {expected}, found {found}")]
    UnexpectedStructure {
        /// The variant the caller asked for.
        expected: &'static str,
        /// The variant that was actually present.
        found: &'static str,
    },

    /// `GradientTape::gradient` was called before anything was recorded.
    #[error("Gradient requested from a tape that recorded nothing")]
    TapeNotRecorded,
}

/// Result type alias for tensor-side operations.
pub type TensorResult<T> = Result<T, TensorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TensorError::NonScalar { shape: vec![2, 3] };
        assert_eq!(err.to_string(), "Expected a scalar tensor, got shape [2, 3]");

        let err = TensorError::MissingKey {
            key: "user_id".to_string(),
        };
        assert_eq!(err.to_string(), "Missing key in batch: user_id");

        let err = TensorError::UnexpectedStructure {
            expected: "Map",
            found: "Tensor",
        };
        assert!(err.to_string().contains("expected Map, found Tensor"));

        assert!(TensorError::TapeNotRecorded
            .to_string()
            .contains("recorded nothing"));
    }
}
