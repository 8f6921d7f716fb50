//! Reduced-order unscented Kalman filter (ROUKF) for joint state and
//! parameter estimation.
//!
//! A [`Roukf`] is built from a [`RoukfConfig`] and stepped against an
//! external [`DynamicalModel`]. Parameters are estimated either directly or in
//! an unconstrained space through per-parameter mappers.

pub mod config;
pub mod error;
pub mod filters;
pub mod mapping;
pub mod model;
pub mod types;

pub use config::{FilterType, RoukfConfig};
pub use error::{ModelOperation, Result, RoukfError};
pub use filters::{FilterState, Roukf, SigmaDistribution, SigmaPointSet};
pub use mapping::{MapperType, OutOfBounds, ParameterDistribution, ParameterGroup, ParameterMapper};
pub use model::{DynamicalModel, FnModel};
pub use types::{FilterSummary, RunSummary};
