//! Linear algebra type system for the filter
//!
//! Runtime-sized aliases over nalgebra so the state, parameter and
//! observation dimensions can come from configuration.

use nalgebra::{DMatrix, DVector};

// ===== Vectors =====
pub type StateVec = DVector<f64>;
pub type ParamVec = DVector<f64>;
pub type ObsVec = DVector<f64>;

/// Joint (state, parameter) vector in estimation coordinates
pub type JointVec = DVector<f64>;

// ===== Matrices =====

/// Square-root covariance factor, `n × r`
pub type SqrtFactor = DMatrix<f64>;

/// Reduced information matrix, `r × r`
pub type ReducedMat = DMatrix<f64>;

/// One sigma point (or forecast) per column
pub type Ensemble = DMatrix<f64>;

/// Weights for sigma points
pub type SigmaWeights = DVector<f64>;

pub(crate) fn all_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().all(|v| v.is_finite())
}

/// Per-row Euclidean norm, i.e. the marginal standard deviation of a square-root factor.
pub(crate) fn row_norms(factor: &SqrtFactor) -> DVector<f64> {
    DVector::from_iterator(
        factor.nrows(),
        factor.row_iter().map(|row| row.iter().map(|v| v * v).sum::<f64>().sqrt()),
    )
}
