/// Reduced-order unscented Kalman filter
///
/// Sigma-point generation, the joint filter state and the engine that runs
/// the forecast/analysis cycle.

pub mod roukf;
pub mod sigma_points;
pub mod state;

pub use roukf::Roukf;
pub use sigma_points::{SigmaDistribution, SigmaPointSet};
pub use state::FilterState;
