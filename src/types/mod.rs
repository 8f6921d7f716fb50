pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterSummary {
    /// Completed analysis steps since construction or the last reset
    pub iteration: u64,

    /// State mean
    pub states: Vec<f64>,

    /// Parameter mean in physical space
    pub parameters: Vec<f64>,

    /// Marginal parameter standard deviation in physical space
    pub parameters_std: Vec<f64>,

    /// L2 norm of the last innovation
    pub error_norm: f64,

    /// Rank of the covariance factor
    pub rank: usize,
}

/// Outcome of an iterate-until-converged run
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub steps: u64,
    pub converged: bool,
    pub final_error: f64,
}
