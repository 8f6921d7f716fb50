use nalgebra::DVector;

/// External dynamical model driven by the filter.
///
/// Both operations must be deterministic and free of shared mutable state;
/// the parallel step calls them from several threads at once.
pub trait DynamicalModel {
    /// Advance a state by one step under the given physical parameters.
    fn propagate(&self, states: &DVector<f64>, parameters: &DVector<f64>) -> anyhow::Result<DVector<f64>>;

    /// Predict the observation vector of a state.
    fn observe(&self, states: &DVector<f64>) -> anyhow::Result<DVector<f64>>;
}

/// Model built from a pair of closures.
pub struct FnModel<P, O> {
    propagate: P,
    observe: O,
}

impl<P, O> FnModel<P, O>
where
    P: Fn(&DVector<f64>, &DVector<f64>) -> anyhow::Result<DVector<f64>>,
    O: Fn(&DVector<f64>) -> anyhow::Result<DVector<f64>>,
{
    pub fn new(propagate: P, observe: O) -> Self {
        Self { propagate, observe }
    }
}

impl<P, O> DynamicalModel for FnModel<P, O>
where
    P: Fn(&DVector<f64>, &DVector<f64>) -> anyhow::Result<DVector<f64>>,
    O: Fn(&DVector<f64>) -> anyhow::Result<DVector<f64>>,
{
    fn propagate(&self, states: &DVector<f64>, parameters: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        (self.propagate)(states, parameters)
    }

    fn observe(&self, states: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
        (self.observe)(states)
    }
}
