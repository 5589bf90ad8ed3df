//! Error types for rust_lfcshrink

use thiserror::Error;

/// Main error type for shrinkage operations
#[derive(Error, Debug)]
pub enum ShrinkError {
    #[error("Invalid coefficient: {reason}")]
    InvalidCoefficient { reason: String },

    #[error("Conflicting arguments: {reason}")]
    ConflictingSpec { reason: String },

    #[error("Missing argument: {reason}")]
    MissingSpec { reason: String },

    #[error("Unsupported contrast: {reason}")]
    UnsupportedContrast { reason: String },

    #[error("Invalid contrast: {reason}")]
    InvalidContrast { reason: String },

    #[error("Incompatible model state: {reason}")]
    IncompatibleModelState { reason: String },

    #[error("Degenerate model: {reason}")]
    DegenerateModel { reason: String },

    #[error("Backend unavailable: {backend} ({reason})")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Row mismatch between model and results: {reason}")]
    RowMismatch { reason: String },

    #[error("Partition {partition} failed: {source}")]
    PartitionFailed {
        partition: usize,
        #[source]
        source: Box<ShrinkError>,
    },

    #[error("Invalid count matrix: {reason}")]
    InvalidCountMatrix { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Invalid design matrix: {reason}")]
    InvalidDesignMatrix { reason: String },

    #[error("Numerical instability in {operation}: {details}")]
    NumericalInstability { operation: String, details: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl ShrinkError {
    /// True for errors caused by how the engine was wired, as opposed to the data.
    pub fn is_configuration_error(&self) -> bool {
        match self {
            ShrinkError::BackendUnavailable { .. } => true,
            ShrinkError::PartitionFailed { source, .. } => source.is_configuration_error(),
            _ => false,
        }
    }

    /// True for errors in the caller's coefficient/contrast/options input.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ShrinkError::InvalidCoefficient { .. }
                | ShrinkError::ConflictingSpec { .. }
                | ShrinkError::MissingSpec { .. }
                | ShrinkError::UnsupportedContrast { .. }
                | ShrinkError::InvalidContrast { .. }
                | ShrinkError::InvalidInput { .. }
        )
    }
}

/// Result type alias for shrinkage operations
pub type Result<T> = std::result::Result<T, ShrinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ShrinkError::BackendUnavailable {
            backend: "apeglm".to_string(),
            reason: "not registered".to_string(),
        };
        assert!(err.is_configuration_error());
        assert!(!err.is_input_error());

        let err = ShrinkError::MissingSpec {
            reason: "no coefficient".to_string(),
        };
        assert!(err.is_input_error());
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_partition_failure_keeps_source() {
        let err = ShrinkError::PartitionFailed {
            partition: 3,
            source: Box::new(ShrinkError::BackendUnavailable {
                backend: "ashr".to_string(),
                reason: "missing".to_string(),
            }),
        };
        assert!(err.is_configuration_error());
        assert!(format!("{}", err).contains("Partition 3"));
    }
}
