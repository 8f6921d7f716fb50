use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use nalgebra::{DMatrix, DVector, DVectorView};

use super::sigma_points::SigmaPointSet;
use super::state::FilterState;
use crate::config::{FilterType, RoukfConfig};
use crate::error::{ModelOperation, Result, RoukfError};
use crate::mapping::{ParameterDistribution, ParameterMapper};
use crate::model::DynamicalModel;
use crate::types::{
    all_finite, row_norms, FilterSummary, JointVec, ObsVec, ParamVec, ReducedMat, RunSummary,
    SqrtFactor, StateVec,
};

/// Forecast of one sigma point: the propagated joint vector (parameters
/// carried through unchanged) and its predicted observation.
struct Forecast {
    joint: JointVec,
    observation: ObsVec,
}

/// Everything an analysis produces, held until the step commits.
struct Analysis {
    states: StateVec,
    theta: ParamVec,
    theta_unconstrained: ParamVec,
    factor: SqrtFactor,
    forecast_factor: SqrtFactor,
    information: ReducedMat,
    predicted_observations: ObsVec,
    error: ObsVec,
    error_norm: f64,
}

/// Reduced-order unscented Kalman filter.
///
/// The joint vector `[states; parameters]` is tracked with a low-rank
/// square-root covariance. Each step samples sigma points from that factor,
/// pushes them through the model and corrects the mean and the factor in the
/// reduced information form.
pub struct Roukf {
    config: RoukfConfig,
    distributions: Vec<ParameterDistribution>,
    mappers: Vec<ParameterMapper>,

    /// Diagonal of `W`, the inverse observation variances
    obs_weights: DVector<f64>,

    /// Worker threads for the parallel forecast
    workers: usize,

    initial: FilterState,
    state: FilterState,
}

impl Roukf {
    pub fn new(config: RoukfConfig) -> Result<Self> {
        config.validate()?;
        let distributions = config.resolve_distributions()?;
        let mappers: Vec<ParameterMapper> = distributions.iter().map(|d| d.mapper()).collect();

        let n_states = config.n_states;
        let n = n_states + config.n_parameters;

        let states = DVector::from_vec(config.initial_states_or_default());
        let initial_parameters = config.initial_parameters_or_default(&distributions);
        let (theta, theta_unconstrained) = inject_parameters(&initial_parameters, &distributions)?;

        // One column per uncertain component
        let variances: Vec<f64> = config
            .state_variance_or_default()
            .into_iter()
            .chain(config.parameter_variance_or_default())
            .collect();
        let support: Vec<(usize, f64)> = variances
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0.0)
            .map(|(i, v)| (i, v.sqrt()))
            .collect();
        let mut factor = DMatrix::zeros(n, support.len());
        for (col, (row, std)) in support.iter().enumerate() {
            factor[(*row, col)] = *std;
        }

        // Keep the leading `reduced_order` variances
        let factor = compress_factor(factor, config.rank_tolerance, config.reduced_order)?;

        let obs_weights = DVector::from_iterator(
            config.n_observations,
            config.observation_variance_or_default().into_iter().map(|v| 1.0 / v),
        );

        let workers = config.workers.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

        let initial = FilterState::new(states, theta, theta_unconstrained, factor, config.n_observations);

        log::info!(
            "ROUKF initialized: {} states, {} parameters, {} observations, rank {}, {} / {:?}",
            n_states,
            config.n_parameters,
            config.n_observations,
            initial.rank(),
            config.filter_type.name(),
            config.sigma_distribution,
        );

        Ok(Self {
            state: initial.clone(),
            initial,
            config,
            distributions,
            mappers,
            obs_weights,
            workers,
        })
    }

    // ─── Filter step ─────────────────────────────────────────────────────────

    /// Run one forecast and analysis cycle, one sigma point at a time.
    ///
    /// Returns the L2 norm of the innovation. On error the filter state is
    /// left exactly as it was. A panicking model is reported as
    /// `WorkerPanicked { worker: 0 }`.
    pub fn execute_step<M>(&mut self, model: &M, observations: &ObsVec) -> Result<f64>
    where
        M: DynamicalModel + ?Sized,
    {
        self.check_observations(observations)?;

        let sigma = self.sigma_points();
        let points = sigma.sample(&self.state.joint_mean(self.config.filter_type), &self.state.factor);

        // The calling thread is the only worker
        let forecasts = panic::catch_unwind(AssertUnwindSafe(|| {
            points
                .column_iter()
                .enumerate()
                .map(|(index, point)| self.forecast_point(model, index, point))
                .collect::<Result<Vec<_>>>()
        }))
        .map_err(|_| RoukfError::WorkerPanicked { worker: 0 })??;

        self.analyse(&sigma, &forecasts, observations)
    }

    /// Same as [`Roukf::execute_step`], with the sigma-point forecasts spread
    /// over scoped worker threads.
    ///
    /// Each worker owns a contiguous block of result slots. The analysis
    /// starts once every worker has joined and sums in sigma-point order, so
    /// the result matches the sequential step. A panicking model is reported
    /// as `WorkerPanicked` with the lowest panicking worker index.
    pub fn execute_step_parallel<M>(&mut self, model: &M, observations: &ObsVec) -> Result<f64>
    where
        M: DynamicalModel + Sync + ?Sized,
    {
        self.check_observations(observations)?;

        let sigma = self.sigma_points();
        let points = sigma.sample(&self.state.joint_mean(self.config.filter_type), &self.state.factor);

        let count = points.ncols();
        let workers = self.workers.clamp(1, count);
        let chunk = (count + workers - 1) / workers;

        let mut slots: Vec<Option<Result<Forecast>>> = (0..count).map(|_| None).collect();
        let engine = &*self;
        let points = &points;

        let panicked = crossbeam::thread::scope(|s| {
            let handles: Vec<_> = slots
                .chunks_mut(chunk)
                .enumerate()
                .map(|(worker, block)| {
                    s.spawn(move |_| {
                        let start = worker * chunk;
                        for (offset, slot) in block.iter_mut().enumerate() {
                            let index = start + offset;
                            *slot = Some(engine.forecast_point(model, index, points.column(index)));
                        }
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .filter_map(|(worker, handle)| handle.join().err().map(|_| worker))
                .min()
        })
        .map_err(|_| RoukfError::WorkerPanicked { worker: 0 })?;

        if let Some(worker) = panicked {
            return Err(RoukfError::WorkerPanicked { worker });
        }

        let forecasts = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(RoukfError::WorkerPanicked {
                        worker: index / chunk,
                    })
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.analyse(&sigma, &forecasts, observations)
    }

    /// Step against a fixed observation vector until the innovation norm
    /// settles or `max_iterations` steps have run.
    pub fn run<M>(&mut self, model: &M, observations: &ObsVec, relative: bool) -> Result<RunSummary>
    where
        M: DynamicalModel + ?Sized,
    {
        let mut steps = 0;
        while steps < self.config.max_iterations {
            let error = self.execute_step(model, observations)?;
            steps += 1;
            if self.has_converged(relative) {
                log::info!("ROUKF converged after {} steps, error {:.6e}", steps, error);
                return Ok(RunSummary {
                    steps,
                    converged: true,
                    final_error: error,
                });
            }
        }

        log::warn!(
            "ROUKF stopped at max_iterations = {} without converging",
            self.config.max_iterations
        );
        Ok(RunSummary {
            steps,
            converged: false,
            final_error: self.state.current_error,
        })
    }

    /// Whether the last two innovation norms differ by less than `tolerance`,
    /// absolutely or relative to the older one. Needs two completed steps.
    pub fn has_converged(&self, relative: bool) -> bool {
        if self.state.iteration > 1 {
            let mut diff = (self.state.current_error - self.state.previous_error).abs();
            if relative {
                diff /= self.state.previous_error;
            }
            return diff < self.config.tolerance;
        }
        false
    }

    fn sigma_points(&self) -> SigmaPointSet {
        SigmaPointSet::generate(self.state.rank(), self.config.sigma_distribution)
    }

    fn check_observations(&self, observations: &ObsVec) -> Result<()> {
        if observations.len() != self.config.n_observations {
            return Err(RoukfError::mismatch(format!(
                "{} observations given, filter expects {}",
                observations.len(),
                self.config.n_observations
            )));
        }
        if let Some(i) = observations.iter().position(|v| !v.is_finite()) {
            return Err(RoukfError::mismatch(format!("observation {} is not finite", i)));
        }
        Ok(())
    }

    fn forecast_point<M>(&self, model: &M, index: usize, point: DVectorView<'_, f64>) -> Result<Forecast>
    where
        M: DynamicalModel + ?Sized,
    {
        let n_states = self.config.n_states;
        let n_parameters = self.config.n_parameters;

        let states = point.rows(0, n_states).into_owned();
        let estimated = point.rows(n_states, n_parameters);
        let parameters = DVector::from_vec(
            self.config
                .filter_type
                .physical_parameters(estimated.iter(), &self.mappers),
        );

        let propagated = model
            .propagate(&states, &parameters)
            .map_err(|source| RoukfError::ModelFailure {
                sigma_point: index,
                operation: ModelOperation::Propagate,
                source,
            })?;
        check_model_output(index, ModelOperation::Propagate, &propagated, n_states)?;

        let observation = model
            .observe(&propagated)
            .map_err(|source| RoukfError::ModelFailure {
                sigma_point: index,
                operation: ModelOperation::Observe,
                source,
            })?;
        check_model_output(
            index,
            ModelOperation::Observe,
            &observation,
            self.config.n_observations,
        )?;

        let mut joint = DVector::zeros(n_states + n_parameters);
        joint.rows_mut(0, n_states).copy_from(&propagated);
        joint.rows_mut(n_states, n_parameters).copy_from(&estimated);

        Ok(Forecast { joint, observation })
    }

    // ─── Analysis ────────────────────────────────────────────────────────────

    fn analyse(&mut self, sigma: &SigmaPointSet, forecasts: &[Forecast], observations: &ObsVec) -> Result<f64> {
        let analysis = self.compute_analysis(sigma, forecasts, observations)?;
        let error_norm = analysis.error_norm;
        let rank_before = self.state.rank();
        self.commit(analysis, observations);

        log::debug!(
            "ROUKF step {}: |e| = {:.6e}, rank {} -> {}, {} sigma points",
            self.state.iteration,
            error_norm,
            rank_before,
            self.state.rank(),
            sigma.len()
        );
        Ok(error_norm)
    }

    fn compute_analysis(
        &self,
        sigma: &SigmaPointSet,
        forecasts: &[Forecast],
        observations: &ObsVec,
    ) -> Result<Analysis> {
        let n_states = self.config.n_states;
        let n_parameters = self.config.n_parameters;
        let n = n_states + n_parameters;
        let count = forecasts.len();

        let mut ensemble = DMatrix::zeros(n, count);
        let mut predicted = DMatrix::zeros(self.config.n_observations, count);
        for (i, forecast) in forecasts.iter().enumerate() {
            ensemble.set_column(i, &forecast.joint);
            predicted.set_column(i, &forecast.observation);
        }

        let forecast_mean = sigma.weighted_mean(&ensemble);
        let predicted_mean = sigma.weighted_mean(&predicted);
        let error = observations - &predicted_mean;
        let error_norm = error.norm();

        let (mean, factor, forecast_factor, information) = if sigma.rank() == 0 {
            // No uncertainty, nothing to correct
            (
                forecast_mean,
                DMatrix::zeros(n, 0),
                DMatrix::zeros(n, 0),
                DMatrix::zeros(0, 0),
            )
        } else {
            let weighted = sigma.weighted_directions();

            for mut column in ensemble.column_iter_mut() {
                column -= &forecast_mean;
            }
            for mut column in predicted.column_iter_mut() {
                column -= &predicted_mean;
            }

            // Forecast sensitivities L and HL
            let sensitivity = &ensemble * &weighted;
            let obs_sensitivity = &predicted * &weighted;

            let mut weighted_obs = obs_sensitivity.clone();
            for (mut row, w) in weighted_obs.row_iter_mut().zip(self.obs_weights.iter()) {
                row *= *w;
            }

            let information = sigma.second_moment() + obs_sensitivity.transpose() * &weighted_obs;
            if !all_finite(information.iter()) {
                return Err(RoukfError::degenerate(
                    "analysis information",
                    "Pa = I + HLᵀ W HL has non-finite entries",
                ));
            }

            let cholesky = information.clone().cholesky().ok_or_else(|| {
                RoukfError::degenerate(
                    "cholesky of analysis information",
                    format!("{}x{} matrix is not positive definite", information.nrows(), information.ncols()),
                )
            })?;

            let correction = &sensitivity * cholesky.solve(&(weighted_obs.transpose() * &error));
            let mean = &forecast_mean + correction;

            let lower = cholesky.l();
            let factor = lower
                .solve_lower_triangular(&sensitivity.transpose())
                .ok_or_else(|| {
                    RoukfError::degenerate("triangular solve for covariance factor", "zero pivot in Cholesky factor")
                })?
                .transpose();

            if !all_finite(mean.iter()) || !all_finite(factor.iter()) {
                return Err(RoukfError::degenerate(
                    "gain update",
                    "corrected mean or covariance factor has non-finite entries",
                ));
            }

            let factor = compress_factor(factor, self.config.rank_tolerance, self.config.reduced_order)?;
            (mean, factor, sensitivity, information)
        };

        let (theta, theta_unconstrained) = self
            .config
            .filter_type
            .resolve_parameters(mean.rows(n_states, n_parameters).iter(), &self.distributions)?;

        Ok(Analysis {
            states: mean.rows(0, n_states).into_owned(),
            theta: DVector::from_vec(theta),
            theta_unconstrained: DVector::from_vec(theta_unconstrained),
            factor,
            forecast_factor,
            information,
            predicted_observations: predicted_mean,
            error,
            error_norm,
        })
    }

    fn commit(&mut self, analysis: Analysis, observations: &ObsVec) {
        let state = &mut self.state;
        state.states = analysis.states;
        state.factor = analysis.factor;
        state.forecast_factor = analysis.forecast_factor;
        state.analysis_information = analysis.information;
        state.observations = observations.clone();
        state.predicted_observations = analysis.predicted_observations;
        state.error = analysis.error;
        state.previous_error = state.current_error;
        state.current_error = analysis.error_norm;
        state.iteration += 1;

        // Parameters last so both vectors come from the same analysis
        state.theta = analysis.theta;
        state.theta_unconstrained = analysis.theta_unconstrained;

        for (index, (value, distribution)) in state.theta.iter().zip(&self.distributions).enumerate() {
            if !distribution.contains(*value) {
                log::warn!(
                    "Parameter {} = {} left its {} range",
                    index,
                    value,
                    distribution.name()
                );
            }
        }
    }

    // ─── Mutators ────────────────────────────────────────────────────────────

    /// Overwrite the physical parameters. The covariance factor is kept.
    pub fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.config.n_parameters {
            return Err(RoukfError::mismatch(format!(
                "{} parameter values given, filter has {}",
                values.len(),
                self.config.n_parameters
            )));
        }
        let (theta, theta_unconstrained) = inject_parameters(values, &self.distributions)?;
        self.state.theta = theta;
        self.state.theta_unconstrained = theta_unconstrained;
        Ok(())
    }

    /// Overwrite the state mean. The covariance factor is kept.
    pub fn set_states(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.config.n_states {
            return Err(RoukfError::mismatch(format!(
                "{} state values given, filter has {}",
                values.len(),
                self.config.n_states
            )));
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(RoukfError::mismatch(format!("state {} is not finite", i)));
        }
        self.state.states = DVector::from_column_slice(values);
        Ok(())
    }

    /// Back to the construction-time mean, factor and counters.
    pub fn reset(&mut self) {
        self.state = self.initial.clone();
        log::info!("ROUKF reset to initial estimate (rank {})", self.state.rank());
    }

    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.config.tolerance = tolerance;
    }

    pub fn set_max_iterations(&mut self, max_iterations: u64) {
        self.config.max_iterations = max_iterations;
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn config(&self) -> &RoukfConfig {
        &self.config
    }

    pub fn filter_type(&self) -> FilterType {
        self.config.filter_type
    }

    pub fn distributions(&self) -> &[ParameterDistribution] {
        &self.distributions
    }

    pub fn n_states(&self) -> usize {
        self.config.n_states
    }

    pub fn n_parameters(&self) -> usize {
        self.config.n_parameters
    }

    pub fn n_observations(&self) -> usize {
        self.config.n_observations
    }

    pub fn tolerance(&self) -> f64 {
        self.config.tolerance
    }

    pub fn max_iterations(&self) -> u64 {
        self.config.max_iterations
    }

    pub fn states(&self) -> &StateVec {
        &self.state.states
    }

    /// Parameters in physical space
    pub fn parameters(&self) -> &ParamVec {
        &self.state.theta
    }

    pub fn parameters_unconstrained(&self) -> &ParamVec {
        &self.state.theta_unconstrained
    }

    /// Marginal standard deviation of each parameter in physical space.
    pub fn parameters_std(&self) -> Vec<f64> {
        let norms = row_norms(&self.state.factor);
        let n_states = self.config.n_states;
        (0..self.config.n_parameters)
            .map(|j| {
                self.config.filter_type.physical_std(
                    norms[n_states + j],
                    &self.mappers[j],
                    self.state.theta_unconstrained[j],
                )
            })
            .collect()
    }

    pub fn states_std(&self) -> Vec<f64> {
        let norms = row_norms(&self.state.factor);
        norms.rows(0, self.config.n_states).iter().copied().collect()
    }

    /// Observation vector of the last step
    pub fn observations(&self) -> &ObsVec {
        &self.state.observations
    }

    pub fn predicted_observations(&self) -> &ObsVec {
        &self.state.predicted_observations
    }

    /// Innovation of the last step
    pub fn error(&self) -> &ObsVec {
        &self.state.error
    }

    pub fn obs_error(&self, index: usize) -> Option<f64> {
        self.state.error.get(index).copied()
    }

    pub fn current_error(&self) -> f64 {
        self.state.current_error
    }

    pub fn previous_error(&self) -> f64 {
        self.state.previous_error
    }

    pub fn iteration(&self) -> u64 {
        self.state.iteration
    }

    pub fn rank(&self) -> usize {
        self.state.rank()
    }

    /// Number of sigma points the next step will use
    pub fn sigma_point_count(&self) -> usize {
        self.config.sigma_distribution.point_count(self.state.rank())
    }

    pub fn factor(&self) -> &SqrtFactor {
        &self.state.factor
    }

    pub fn forecast_factor(&self) -> &SqrtFactor {
        &self.state.forecast_factor
    }

    pub fn analysis_information(&self) -> &ReducedMat {
        &self.state.analysis_information
    }

    /// Joint covariance in estimation coordinates
    pub fn covariance(&self) -> DMatrix<f64> {
        self.state.covariance()
    }

    pub fn filter_state(&self) -> &FilterState {
        &self.state
    }

    pub fn summary(&self) -> FilterSummary {
        FilterSummary {
            iteration: self.state.iteration,
            states: self.state.states.iter().copied().collect(),
            parameters: self.state.theta.iter().copied().collect(),
            parameters_std: self.parameters_std(),
            error_norm: self.state.current_error,
            rank: self.state.rank(),
        }
    }
}

impl fmt::Display for Roukf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ROUKF [{}, {:?}] iteration {}, rank {}, |e| = {:.6e}",
            self.config.filter_type.name(),
            self.config.sigma_distribution,
            self.state.iteration,
            self.state.rank(),
            self.state.current_error
        )?;
        writeln!(f, "X: {:?}", self.state.states.as_slice())?;
        writeln!(f, "Theta: {:?}", self.state.theta.as_slice())?;
        writeln!(f, "LTheta: {:?}", self.state.theta_unconstrained.as_slice())?;
        writeln!(f, "Theta std: {:?}", self.parameters_std())?;
        writeln!(f, "U:{}", self.state.factor)?;
        writeln!(f, "U2:{}", self.state.forecast_factor)?;
        writeln!(f, "Pa:{}", self.state.analysis_information)?;
        write!(f, "error: {:?}", self.state.error.as_slice())
    }
}

/// Check injected physical values and derive both parameter vectors.
fn inject_parameters(values: &[f64], distributions: &[ParameterDistribution]) -> Result<(ParamVec, ParamVec)> {
    let mut theta = Vec::with_capacity(values.len());
    let mut unconstrained = Vec::with_capacity(values.len());
    for (index, (value, distribution)) in values.iter().zip(distributions).enumerate() {
        let x = distribution.to_unconstrained(index, *value)?;
        theta.push(distribution.mapper().to_physical(x));
        unconstrained.push(x);
    }
    Ok((DVector::from_vec(theta), DVector::from_vec(unconstrained)))
}

/// Drop directions the factor no longer spans and cap the rank at
/// `reduced_order`, keeping the leading `Uₖ Σₖ` of its SVD.
fn compress_factor(
    factor: SqrtFactor,
    rank_tolerance: f64,
    reduced_order: Option<usize>,
) -> Result<SqrtFactor> {
    let rank = factor.ncols();
    if rank == 0 {
        return Ok(factor);
    }

    let n = factor.nrows();
    let svd = factor.clone().svd(true, false);
    let values = &svd.singular_values;
    let sigma_max = values.max();
    if !sigma_max.is_finite() {
        return Err(RoukfError::degenerate(
            "svd of covariance factor",
            "non-finite singular values",
        ));
    }

    let cutoff = rank_tolerance * sigma_max;
    let mut keep: Vec<usize> = (0..values.len())
        .filter(|&i| values[i] > cutoff && values[i] > 0.0)
        .collect();
    keep.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    if let Some(order) = reduced_order {
        keep.truncate(order);
    }
    if keep.len() == rank {
        return Ok(factor);
    }

    let u = svd.u.as_ref().ok_or_else(|| {
        RoukfError::degenerate("svd of covariance factor", "left singular vectors unavailable")
    })?;
    let mut reduced = DMatrix::zeros(n, keep.len());
    for (col, &i) in keep.iter().enumerate() {
        reduced.set_column(col, &(u.column(i) * values[i]));
    }

    log::warn!("Covariance factor rank reduced from {} to {}", rank, keep.len());
    Ok(reduced)
}

fn check_model_output(index: usize, operation: ModelOperation, output: &DVector<f64>, expected: usize) -> Result<()> {
    if output.len() != expected {
        return Err(RoukfError::ModelFailure {
            sigma_point: index,
            operation,
            source: anyhow::anyhow!("returned {} values, expected {}", output.len(), expected),
        });
    }
    if !all_finite(output.iter()) {
        return Err(RoukfError::ModelFailure {
            sigma_point: index,
            operation,
            source: anyhow::anyhow!("returned non-finite values"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::SigmaDistribution;
    use crate::model::FnModel;
    use approx::assert_abs_diff_eq;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn obs(values: &[f64]) -> ObsVec {
        DVector::from_column_slice(values)
    }

    /// x' = x, z = x
    fn identity_model() -> impl DynamicalModel + Sync {
        FnModel::new(
            |x: &DVector<f64>, _: &DVector<f64>| Ok(x.clone()),
            |x: &DVector<f64>| Ok(x.clone()),
        )
    }

    /// x' = theta, z = x
    fn coupled_model() -> impl DynamicalModel + Sync {
        FnModel::new(
            |_: &DVector<f64>, p: &DVector<f64>| Ok(DVector::from_element(1, p[0])),
            |x: &DVector<f64>| Ok(x.clone()),
        )
    }

    /// Two states, two parameters, a nonlinear observation of both states
    fn nonlinear_model() -> impl DynamicalModel + Sync {
        FnModel::new(
            |x: &DVector<f64>, p: &DVector<f64>| {
                Ok(DVector::from_vec(vec![
                    p[0] * x[0] + 0.1 * x[1],
                    x[1] + 0.05 * p[1] * x[0].sin(),
                ]))
            },
            |x: &DVector<f64>| Ok(DVector::from_vec(vec![x[0], x[0] * x[1], x[1].powi(2)])),
        )
    }

    fn positive_config() -> RoukfConfig {
        let mut config = RoukfConfig::new(1, 1, 1);
        config.distributions = vec![ParameterDistribution::Positive];
        config.initial_states = vec![0.0];
        config.initial_parameters = vec![1.0];
        config.state_variance = vec![1.0];
        config.parameter_variance = vec![1.0];
        config.observation_variance = vec![0.1];
        config
    }

    fn nonlinear_config(distribution: SigmaDistribution) -> RoukfConfig {
        let mut config = RoukfConfig::new(2, 2, 3);
        config.filter_type = FilterType::ModelMappedRoukf;
        config.distributions = vec![
            ParameterDistribution::RangedNormalDist { low: 0.0, high: 2.0 },
            ParameterDistribution::Positive,
        ];
        config.initial_states = vec![1.0, 0.5];
        config.initial_parameters = vec![0.8, 1.5];
        config.state_variance = vec![0.2, 0.1];
        config.parameter_variance = vec![0.5, 0.3];
        config.observation_variance = vec![0.01, 0.02, 0.05];
        config.sigma_distribution = distribution;
        config.workers = Some(3);
        config
    }

    fn assert_theta_synchronized(filter: &Roukf) {
        for (i, distribution) in filter.distributions().iter().enumerate() {
            let expected = distribution
                .mapper()
                .to_physical(filter.parameters_unconstrained()[i]);
            assert_eq!(filter.parameters()[i], expected, "parameter {}", i);
        }
    }

    #[test]
    fn test_positive_scenario_converges_to_observation() {
        init_logger();
        let mut filter = Roukf::new(positive_config()).unwrap();
        let model = identity_model();
        let y = obs(&[2.0]);

        let mut previous_gap = f64::INFINITY;
        let mut previous_std = filter.parameters_std()[0];
        for _ in 0..10 {
            filter.execute_step(&model, &y).unwrap();
            let gap = (filter.states()[0] - 2.0).abs();
            assert!(gap < previous_gap);
            previous_gap = gap;

            // The parameter is decoupled from the observation here, so its std stays put
            let std = filter.parameters_std()[0];
            assert!(std <= previous_std + 1e-12);
            previous_std = std;
        }
        assert!(previous_gap < 0.05);
        assert_eq!(filter.iteration(), 10);
        assert_abs_diff_eq!(filter.parameters()[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coupled_parameter_is_learned() {
        init_logger();
        let mut config = RoukfConfig::new(1, 1, 1);
        config.state_variance = vec![1.0];
        config.observation_variance = vec![0.1];
        let mut filter = Roukf::new(config).unwrap();
        let model = coupled_model();
        let y = obs(&[3.0]);

        let mut previous_std = filter.parameters_std()[0];
        for _ in 0..10 {
            filter.execute_step(&model, &y).unwrap();
            let std = filter.parameters_std()[0];
            assert!(std < previous_std);
            previous_std = std;
        }
        // State and parameter collapse onto one direction
        assert_eq!(filter.rank(), 1);
        assert_eq!(filter.sigma_point_count(), 2);
        assert_abs_diff_eq!(filter.parameters()[0], 3.0, epsilon = 0.05);
        assert_abs_diff_eq!(filter.states()[0], 3.0, epsilon = 0.05);
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        init_logger();
        let model = nonlinear_model();
        let y = obs(&[1.1, 0.6, 0.3]);

        for distribution in [
            SigmaDistribution::Simplex,
            SigmaDistribution::Canonic,
            SigmaDistribution::Star,
            SigmaDistribution::SimplexStar,
        ] {
            let mut sequential = Roukf::new(nonlinear_config(distribution)).unwrap();
            let mut parallel = Roukf::new(nonlinear_config(distribution)).unwrap();

            for _ in 0..4 {
                let e1 = sequential.execute_step(&model, &y).unwrap();
                let e2 = parallel.execute_step_parallel(&model, &y).unwrap();
                assert_abs_diff_eq!(e1, e2, epsilon = 1e-12);
            }

            assert_abs_diff_eq!((sequential.states() - parallel.states()).norm(), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(
                (sequential.parameters() - parallel.parameters()).norm(),
                0.0,
                epsilon = 1e-12
            );
            assert_abs_diff_eq!(
                (sequential.covariance() - parallel.covariance()).norm(),
                0.0,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_parallel_with_more_workers_than_points() {
        let mut config = positive_config();
        config.workers = Some(64);
        let mut filter = Roukf::new(config).unwrap();
        filter.execute_step_parallel(&identity_model(), &obs(&[2.0])).unwrap();
        assert_eq!(filter.iteration(), 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut filter = Roukf::new(nonlinear_config(SigmaDistribution::Canonic)).unwrap();
        let initial = filter.filter_state().clone();

        let model = nonlinear_model();
        for _ in 0..3 {
            filter.execute_step(&model, &obs(&[1.0, 0.4, 0.2])).unwrap();
        }
        assert_ne!(filter.filter_state(), &initial);

        filter.reset();
        let once = filter.filter_state().clone();
        filter.reset();
        assert_eq!(filter.filter_state(), &once);
        assert_eq!(once, initial);
        assert_eq!(filter.iteration(), 0);
    }

    #[test]
    fn test_theta_synchronized_after_every_mutator() {
        let mut filter = Roukf::new(nonlinear_config(SigmaDistribution::Star)).unwrap();
        assert_theta_synchronized(&filter);

        let model = nonlinear_model();
        filter.execute_step(&model, &obs(&[1.0, 0.4, 0.2])).unwrap();
        assert_theta_synchronized(&filter);

        filter.execute_step_parallel(&model, &obs(&[1.0, 0.4, 0.2])).unwrap();
        assert_theta_synchronized(&filter);

        filter.set_parameters(&[1.2, 0.3]).unwrap();
        assert_theta_synchronized(&filter);

        filter.reset();
        assert_theta_synchronized(&filter);

        // Physical coordinates go through the inverse map at commit
        let mut config = nonlinear_config(SigmaDistribution::Star);
        config.filter_type = FilterType::ModelRoukf;
        config.parameter_variance = vec![0.01, 0.01];
        let mut filter = Roukf::new(config).unwrap();
        assert_theta_synchronized(&filter);
        for _ in 0..5 {
            filter.execute_step(&model, &obs(&[1.0, 0.4, 0.2])).unwrap();
            assert_theta_synchronized(&filter);
        }
        filter.execute_step_parallel(&model, &obs(&[1.0, 0.4, 0.2])).unwrap();
        assert_theta_synchronized(&filter);
    }

    #[test]
    fn test_rank_zero_leaves_mean_unchanged() {
        let mut config = RoukfConfig::new(2, 1, 2);
        config.initial_states = vec![1.5, -0.5];
        config.initial_parameters = vec![0.25];
        config.parameter_variance = vec![0.0];
        let mut filter = Roukf::new(config).unwrap();
        assert_eq!(filter.rank(), 0);
        assert_eq!(filter.sigma_point_count(), 1);

        let error = filter.execute_step(&identity_model(), &obs(&[4.0, 4.0])).unwrap();
        assert_eq!(filter.states().as_slice(), &[1.5, -0.5]);
        assert_eq!(filter.parameters()[0], 0.25);
        assert_eq!(filter.rank(), 0);
        assert_abs_diff_eq!(error, (2.5f64.powi(2) + 4.5f64.powi(2)).sqrt(), epsilon = 1e-12);
        assert_eq!(filter.parameters_std(), vec![0.0]);
    }

    #[test]
    fn test_set_parameters_rejects_out_of_range() {
        let mut config = RoukfConfig::new(1, 1, 1);
        config.distributions = vec![ParameterDistribution::RangedNormalDist { low: 0.0, high: 10.0 }];
        let mut filter = Roukf::new(config).unwrap();
        let before = filter.filter_state().clone();

        match filter.set_parameters(&[15.0]) {
            Err(RoukfError::ConstraintViolation { index, value, .. }) => {
                assert_eq!(index, 0);
                assert_eq!(value, 15.0);
            }
            other => panic!("expected constraint violation, got {:?}", other),
        }
        assert_eq!(filter.filter_state(), &before);

        assert!(matches!(
            filter.set_parameters(&[1.0, 2.0]),
            Err(RoukfError::ConfigurationMismatch(_))
        ));
    }

    #[test]
    fn test_initial_parameter_outside_bounds_fails_construction() {
        let mut config = RoukfConfig::new(1, 1, 1);
        config.distributions = vec![ParameterDistribution::RangedLogDist { low: 1.0, high: 10.0 }];
        config.initial_parameters = vec![20.0];
        assert!(matches!(
            Roukf::new(config),
            Err(RoukfError::ConstraintViolation { index: 0, .. })
        ));
    }

    #[test]
    fn test_model_failure_leaves_state_untouched() {
        let mut filter = Roukf::new(positive_config()).unwrap();
        filter.execute_step(&identity_model(), &obs(&[2.0])).unwrap();
        let before = filter.filter_state().clone();

        let failing = FnModel::new(
            |x: &DVector<f64>, _: &DVector<f64>| {
                if x[0] > 0.5 {
                    Err(anyhow::anyhow!("solver diverged"))
                } else {
                    Ok(x.clone())
                }
            },
            |x: &DVector<f64>| Ok(x.clone()),
        );
        match filter.execute_step(&failing, &obs(&[2.0])) {
            Err(RoukfError::ModelFailure { operation, .. }) => {
                assert_eq!(operation, ModelOperation::Propagate)
            }
            other => panic!("expected model failure, got {:?}", other),
        }
        assert_eq!(filter.filter_state(), &before);

        let non_finite = FnModel::new(
            |x: &DVector<f64>, _: &DVector<f64>| Ok(x.clone()),
            |_: &DVector<f64>| Ok(DVector::from_element(1, f64::NAN)),
        );
        let err = filter.execute_step_parallel(&non_finite, &obs(&[2.0])).unwrap_err();
        assert!(matches!(
            err,
            RoukfError::ModelFailure {
                sigma_point: 0,
                operation: ModelOperation::Observe,
                ..
            }
        ));
        assert_eq!(filter.filter_state(), &before);

        let wrong_length = FnModel::new(
            |_: &DVector<f64>, _: &DVector<f64>| Ok(DVector::zeros(3)),
            |x: &DVector<f64>| Ok(x.clone()),
        );
        let err = filter.execute_step(&wrong_length, &obs(&[2.0])).unwrap_err();
        assert!(err.to_string().contains("expected 1"));
        assert_eq!(filter.filter_state(), &before);
    }

    #[test]
    fn test_panicking_model_reported_by_both_paths() {
        let mut config = positive_config();
        config.workers = Some(2);
        let mut filter = Roukf::new(config).unwrap();
        let before = filter.filter_state().clone();

        let panicking = FnModel::new(
            |_: &DVector<f64>, _: &DVector<f64>| -> anyhow::Result<DVector<f64>> {
                panic!("model blew up")
            },
            |x: &DVector<f64>| Ok(x.clone()),
        );

        let err = filter.execute_step(&panicking, &obs(&[2.0])).unwrap_err();
        assert!(matches!(err, RoukfError::WorkerPanicked { worker: 0 }));
        assert!(err.is_step_failure());
        assert_eq!(filter.filter_state(), &before);

        let err = filter.execute_step_parallel(&panicking, &obs(&[2.0])).unwrap_err();
        assert!(matches!(err, RoukfError::WorkerPanicked { worker: 0 }));
        assert_eq!(filter.filter_state(), &before);

        // Still usable afterwards
        filter.execute_step(&identity_model(), &obs(&[2.0])).unwrap();
        assert_eq!(filter.iteration(), 1);
    }

    #[test]
    fn test_numerical_degeneracy_leaves_state_untouched() {
        let mut filter = Roukf::new(positive_config()).unwrap();
        let before = filter.filter_state().clone();

        let exploding = FnModel::new(
            |x: &DVector<f64>, _: &DVector<f64>| Ok(x.clone()),
            |x: &DVector<f64>| Ok(x * 1e300),
        );
        let err = filter.execute_step(&exploding, &obs(&[2.0])).unwrap_err();
        assert!(matches!(err, RoukfError::NumericalDegeneracy { .. }));
        assert!(err.is_step_failure());
        assert_eq!(filter.filter_state(), &before);
    }

    #[test]
    fn test_observation_length_is_checked() {
        let mut filter = Roukf::new(positive_config()).unwrap();
        let err = filter.execute_step(&identity_model(), &obs(&[1.0, 2.0])).unwrap_err();
        assert!(matches!(err, RoukfError::ConfigurationMismatch(_)));
        assert_eq!(filter.iteration(), 0);
    }

    #[test]
    fn test_reduced_order_truncates_initial_factor() {
        init_logger();
        let mut config = RoukfConfig::new(3, 1, 3);
        config.state_variance = vec![1.0, 0.5, 0.1];
        config.reduced_order = Some(2);
        let mut filter = Roukf::new(config).unwrap();

        // Four uncertain components, the two largest variances survive
        assert_eq!(filter.rank(), 2);
        assert_eq!(filter.sigma_point_count(), 3);
        assert_abs_diff_eq!(filter.covariance().trace(), 2.0, epsilon = 1e-12);

        filter
            .execute_step(&identity_model(), &obs(&[0.5, 0.5, 0.5]))
            .unwrap();
        assert!(filter.rank() <= 2);
        assert_eq!(filter.iteration(), 1);

        filter.reset();
        assert_eq!(filter.rank(), 2);
    }

    #[test]
    fn test_ar1_parameter_recovery() {
        init_logger();
        let mut config = RoukfConfig::new(1, 1, 1);
        config.initial_states = vec![1.0];
        config.initial_parameters = vec![0.0];
        config.parameter_variance = vec![1.0];
        config.observation_variance = vec![1e-4];
        config.sigma_distribution = SigmaDistribution::Canonic;
        let mut filter = Roukf::new(config).unwrap();

        let model = FnModel::new(
            |x: &DVector<f64>, p: &DVector<f64>| Ok(x * p[0]),
            |x: &DVector<f64>| Ok(x.clone()),
        );
        let mut truth = 1.0;
        for _ in 0..30 {
            truth *= 0.9;
            filter.execute_step(&model, &obs(&[truth])).unwrap();
        }
        assert_abs_diff_eq!(filter.parameters()[0], 0.9, epsilon = 1e-2);
        assert!(filter.parameters_std()[0] < 0.1);
    }

    #[test]
    fn test_mapped_parameter_std_uses_mapper_derivative() {
        let mut config = RoukfConfig::new(1, 1, 1);
        config.filter_type = FilterType::ModelMappedRoukf;
        config.distributions = vec![ParameterDistribution::Positive];
        config.initial_parameters = vec![2.0];
        config.parameter_variance = vec![0.04];
        let filter = Roukf::new(config).unwrap();
        // d/dx exp(x) at ln 2 is 2, unconstrained std 0.2
        assert_abs_diff_eq!(filter.parameters_std()[0], 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_run_until_converged() {
        let mut filter = Roukf::new(positive_config()).unwrap();
        filter.set_tolerance(1e-3);
        let summary = filter.run(&identity_model(), &obs(&[2.0]), false).unwrap();
        assert!(summary.converged);
        assert!(summary.steps > 1);
        assert!(filter.has_converged(false));

        filter.reset();
        assert!(!filter.has_converged(false));
        filter.set_max_iterations(2);
        filter.set_tolerance(1e-300);
        let summary = filter.run(&identity_model(), &obs(&[2.0]), true).unwrap();
        assert!(!summary.converged);
        assert_eq!(summary.steps, 2);
    }

    #[test]
    fn test_set_states_and_accessors() {
        let mut filter = Roukf::new(positive_config()).unwrap();
        filter.set_states(&[1.25]).unwrap();
        assert_eq!(filter.states()[0], 1.25);
        assert!(filter.set_states(&[f64::NAN]).is_err());
        assert!(filter.set_states(&[1.0, 2.0]).is_err());

        filter.execute_step(&identity_model(), &obs(&[2.0])).unwrap();
        assert_eq!(filter.observations()[0], 2.0);
        assert_abs_diff_eq!(filter.obs_error(0).unwrap(), 0.75, epsilon = 1e-12);
        assert!(filter.obs_error(1).is_none());
        assert_eq!(filter.analysis_information().nrows(), filter.forecast_factor().ncols());
        assert_eq!(filter.states_std().len(), 1);

        let summary = filter.summary();
        assert_eq!(summary.iteration, 1);
        assert_eq!(summary.rank, 2);

        let dump = filter.to_string();
        assert!(dump.contains("MODEL_ROUKF"));
        assert!(dump.contains("Theta"));
    }
}
