use std::fmt;

use thiserror::Error;

/// Which external model operation a sigma point was running when it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelOperation {
    Propagate,
    Observe,
}

impl fmt::Display for ModelOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelOperation::Propagate => write!(f, "propagate"),
            ModelOperation::Observe => write!(f, "observe"),
        }
    }
}

/// ROUKF error types
#[derive(Error, Debug)]
pub enum RoukfError {
    #[error("Parameter {index} = {value} violates {distribution} constraint: {reason}")]
    ConstraintViolation {
        index: usize,
        value: f64,
        distribution: &'static str,
        reason: String,
    },

    #[error("Numerical degeneracy in {operation}: {detail}")]
    NumericalDegeneracy {
        operation: &'static str,
        detail: String,
    },

    #[error("Model {operation} failed for sigma point {sigma_point}: {source}")]
    ModelFailure {
        sigma_point: usize,
        operation: ModelOperation,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    #[error("Forecast worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

impl RoukfError {
    /// True for the error kinds that abort a step without touching the filter state.
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            RoukfError::NumericalDegeneracy { .. }
                | RoukfError::ModelFailure { .. }
                | RoukfError::WorkerPanicked { .. }
        )
    }

    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        RoukfError::ConfigurationMismatch(message.into())
    }

    pub(crate) fn degenerate(operation: &'static str, detail: impl Into<String>) -> Self {
        RoukfError::NumericalDegeneracy {
            operation,
            detail: detail.into(),
        }
    }
}

/// Result type for filter operations
pub type Result<T> = std::result::Result<T, RoukfError>;
