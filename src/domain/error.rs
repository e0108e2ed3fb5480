// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// Every failure the forecasting core can raise. Variants are
// local and typed: no component recovers silently by padding
// or zero-filling, the caller decides what to do.

use thiserror::Error;

/// Result alias used throughout the core.
pub type TwinResult<T> = Result<T, TwinError>;

#[derive(Debug, Error)]
pub enum TwinError {
    /// An embedding or fused feature vector had the wrong length.
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// A named scalar required by the fusion encoder is absent.
    #[error("missing scalar feature '{name}' for patient {patient_id}")]
    MissingScalar { patient_id: String, name: String },

    #[error("empty sequence: at least one historical timepoint is required")]
    EmptySequence,

    /// Requested horizons do not match what the forecast head was trained for.
    #[error("horizon mismatch: model produces {trained:?}, requested {requested:?}")]
    HorizonMismatch {
        trained: Vec<u32>,
        requested: Vec<u32>,
    },

    #[error("insufficient samples for uncertainty estimation: need at least 2, got {0}")]
    InsufficientSamples(usize),

    /// A training or validation batch was internally inconsistent.
    /// Aborts the whole training run.
    #[error("batch {batch} shape error: {detail}")]
    BatchShapeError { batch: usize, detail: String },

    #[error("unknown patient '{0}'")]
    UnknownPatient(String),

    #[error("invalid scenario delta: {0}")]
    InvalidDelta(String),

    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("embedding unavailable for patient {patient_id} at {timestamp_months} months: {reason}")]
    EmbeddingUnavailable {
        patient_id: String,
        timestamp_months: f32,
        reason: String,
    },

    #[error("invalid timeline for patient {patient_id}: {reason}")]
    InvalidTimeline { patient_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl TwinError {
    pub fn shape(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// Re-tag a per-sample failure as a batch failure during training.
    /// Errors unrelated to tensor shapes pass through unchanged.
    pub fn into_batch_error(self, batch: usize) -> Self {
        match self {
            e @ (Self::ShapeMismatch { .. } | Self::MissingScalar { .. } | Self::EmptySequence) => {
                Self::BatchShapeError {
                    batch,
                    detail: e.to_string(),
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_errors_become_batch_errors() {
        let e = TwinError::shape("audio embedding", 128, 64).into_batch_error(3);
        match e {
            TwinError::BatchShapeError { batch, detail } => {
                assert_eq!(batch, 3);
                assert!(detail.contains("expected 128, got 64"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unrelated_errors_pass_through() {
        let e = TwinError::UnknownPatient("P9".into()).into_batch_error(0);
        assert!(matches!(e, TwinError::UnknownPatient(_)));
    }
}
