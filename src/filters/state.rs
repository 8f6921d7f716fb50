use nalgebra::{DMatrix, DVector};

use crate::config::FilterType;
use crate::types::{JointVec, ObsVec, ParamVec, ReducedMat, SqrtFactor, StateVec};

/// Joint estimate owned by the engine.
///
/// `theta` and `theta_unconstrained` always satisfy
/// `theta[i] == mapper[i].to_physical(theta_unconstrained[i])`.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterState {
    pub states: StateVec,

    /// Physical parameters
    pub theta: ParamVec,

    /// Parameters in estimation (unconstrained) space
    pub theta_unconstrained: ParamVec,

    /// Joint square-root covariance in estimation coordinates, `n × r`
    pub factor: SqrtFactor,

    /// Forecast sensitivity of the last step, before the analysis deflation
    pub forecast_factor: SqrtFactor,

    /// Reduced analysis information of the last step, `r × r`
    pub analysis_information: ReducedMat,

    /// Last observation vector
    pub observations: ObsVec,

    /// Weighted mean of the predicted observations of the last step
    pub predicted_observations: ObsVec,

    /// Innovation of the last step
    pub error: ObsVec,

    pub iteration: u64,
    pub current_error: f64,
    pub previous_error: f64,
}

impl FilterState {
    pub fn new(
        states: StateVec,
        theta: ParamVec,
        theta_unconstrained: ParamVec,
        factor: SqrtFactor,
        n_observations: usize,
    ) -> Self {
        let n = factor.nrows();
        Self {
            states,
            theta,
            theta_unconstrained,
            factor,
            forecast_factor: DMatrix::zeros(n, 0),
            analysis_information: DMatrix::zeros(0, 0),
            observations: DVector::zeros(n_observations),
            predicted_observations: DVector::zeros(n_observations),
            error: DVector::zeros(n_observations),
            iteration: 0,
            current_error: 0.0,
            previous_error: 0.0,
        }
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn n_parameters(&self) -> usize {
        self.theta.len()
    }

    pub fn rank(&self) -> usize {
        self.factor.ncols()
    }

    /// Joint mean `[states; parameters]` in estimation coordinates.
    pub fn joint_mean(&self, filter_type: FilterType) -> JointVec {
        let estimated = filter_type.estimated(self.theta.as_slice(), self.theta_unconstrained.as_slice());
        let mut mean = DVector::zeros(self.n_states() + self.n_parameters());
        mean.rows_mut(0, self.n_states()).copy_from(&self.states);
        mean.rows_mut(self.n_states(), self.n_parameters())
            .copy_from_slice(estimated);
        mean
    }

    /// Joint covariance `factor · factorᵀ`
    pub fn covariance(&self) -> DMatrix<f64> {
        &self.factor * self.factor.transpose()
    }
}
