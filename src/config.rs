use serde::{Deserialize, Serialize};

use crate::error::{Result, RoukfError};
use crate::filters::SigmaDistribution;
use crate::mapping::{ParameterDistribution, ParameterGroup, ParameterMapper};

// ─── Filter variant ──────────────────────────────────────────────────────────

/// Space in which the parameter part of the joint mean is estimated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterType {
    /// Estimation coordinates are the physical parameters
    #[default]
    ModelRoukf,
    /// Estimation coordinates are the unconstrained parameters
    ModelMappedRoukf,
}

impl FilterType {
    pub fn name(&self) -> &'static str {
        match self {
            FilterType::ModelRoukf => "MODEL_ROUKF",
            FilterType::ModelMappedRoukf => "MODEL_MAPPED_ROUKF",
        }
    }

    /// Physical parameters handed to the model for a sigma point. Never fails:
    /// in physical mode a sigma point may sit outside the mapper's domain.
    pub fn physical_parameters<'a>(
        &self,
        estimated: impl IntoIterator<Item = &'a f64>,
        mappers: &[ParameterMapper],
    ) -> Vec<f64> {
        match self {
            FilterType::ModelRoukf => estimated.into_iter().copied().collect(),
            FilterType::ModelMappedRoukf => estimated
                .into_iter()
                .zip(mappers)
                .map(|(x, mapper)| mapper.to_physical(*x))
                .collect(),
        }
    }

    /// Resolve estimated coordinates into `(theta, theta_unconstrained)`.
    pub fn resolve_parameters<'a>(
        &self,
        estimated: impl IntoIterator<Item = &'a f64>,
        distributions: &[ParameterDistribution],
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut theta = Vec::with_capacity(distributions.len());
        let mut unconstrained = Vec::with_capacity(distributions.len());
        for (index, (value, distribution)) in estimated.into_iter().zip(distributions).enumerate() {
            let mapper = distribution.mapper();
            match self {
                FilterType::ModelRoukf => {
                    let x = mapper.to_unconstrained(*value).map_err(|e| {
                        RoukfError::ConstraintViolation {
                            index,
                            value: *value,
                            distribution: distribution.name(),
                            reason: format!("estimate left {}", e.domain),
                        }
                    })?;
                    // Round trip so the synchronization invariant holds bit for bit
                    theta.push(mapper.to_physical(x));
                    unconstrained.push(x);
                }
                FilterType::ModelMappedRoukf => {
                    theta.push(mapper.to_physical(*value));
                    unconstrained.push(*value);
                }
            }
        }
        Ok((theta, unconstrained))
    }

    /// Physical standard deviation from the estimation-space one. Delta
    /// method through the mapper in mapped mode.
    pub fn physical_std(&self, estimated_std: f64, mapper: &ParameterMapper, unconstrained: f64) -> f64 {
        match self {
            FilterType::ModelRoukf => estimated_std,
            FilterType::ModelMappedRoukf => mapper.derivative(unconstrained).abs() * estimated_std,
        }
    }

    /// Estimation coordinates of a parameter pair
    pub fn estimated<'a>(&self, theta: &'a [f64], unconstrained: &'a [f64]) -> &'a [f64] {
        match self {
            FilterType::ModelRoukf => theta,
            FilterType::ModelMappedRoukf => unconstrained,
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Resolved filter configuration, passed by value into [`crate::Roukf::new`].
///
/// Empty vectors fall back to defaults: zero initial states, the
/// distribution's default value for parameters, zero state variance, unit
/// parameter and observation variance. Parameter variances are expressed in
/// estimation coordinates, so they are physical variances under
/// `MODEL_ROUKF` and unconstrained variances under `MODEL_MAPPED_ROUKF`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoukfConfig {
    pub filter_type: FilterType,

    // ── Dimensions ──
    pub n_states: usize,
    pub n_parameters: usize,
    pub n_observations: usize,

    // ── Initial mean ──
    pub initial_states: Vec<f64>,
    pub initial_parameters: Vec<f64>,

    // ── Initial uncertainty ──
    pub state_variance: Vec<f64>,
    pub parameter_variance: Vec<f64>,
    pub observation_variance: Vec<f64>,

    // ── Parameter constraints ──
    pub distributions: Vec<ParameterDistribution>,
    pub parameter_groups: Vec<ParameterGroup>,

    // ── Sigma points ──
    pub sigma_distribution: SigmaDistribution,
    pub reduced_order: Option<usize>,
    pub rank_tolerance: f64,

    // ── Convergence ──
    pub tolerance: f64,
    pub max_iterations: u64,

    // ── Parallel forecast ──
    pub workers: Option<usize>,
}

impl Default for RoukfConfig {
    fn default() -> Self {
        Self {
            filter_type: FilterType::ModelRoukf,
            n_states: 0,
            n_parameters: 0,
            n_observations: 0,
            initial_states: Vec::new(),
            initial_parameters: Vec::new(),
            state_variance: Vec::new(),
            parameter_variance: Vec::new(),
            observation_variance: Vec::new(),
            distributions: Vec::new(),
            parameter_groups: Vec::new(),
            sigma_distribution: SigmaDistribution::Simplex,
            reduced_order: None,
            rank_tolerance: 1e-10,
            tolerance: 1e-5,
            max_iterations: 1000,
            workers: None,
        }
    }
}

impl RoukfConfig {
    pub fn new(n_states: usize, n_parameters: usize, n_observations: usize) -> Self {
        Self {
            n_states,
            n_parameters,
            n_observations,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RoukfError::mismatch(format!("invalid configuration JSON: {}", e)))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RoukfError::mismatch(format!("cannot serialize configuration: {}", e)))
    }

    /// One distribution per parameter, from the explicit list, the mapper
    /// groups, or DEFAULT for everything.
    pub fn resolve_distributions(&self) -> Result<Vec<ParameterDistribution>> {
        let distributions = match (self.distributions.is_empty(), self.parameter_groups.is_empty()) {
            (false, false) => {
                return Err(RoukfError::mismatch(
                    "give either distributions or parameter_groups, not both",
                ))
            }
            (false, true) => self.distributions.clone(),
            (true, false) => ParameterDistribution::expand_groups(&self.parameter_groups)?,
            (true, true) => vec![ParameterDistribution::Default; self.n_parameters],
        };

        if distributions.len() != self.n_parameters {
            return Err(RoukfError::mismatch(format!(
                "{} parameter distributions for {} parameters",
                distributions.len(),
                self.n_parameters
            )));
        }
        for (index, distribution) in distributions.iter().enumerate() {
            distribution.check_bounds(index)?;
        }
        Ok(distributions)
    }

    /// Check dimensions, variances and tuning values. Parameter values are
    /// checked against their distributions when the filter is built.
    pub fn validate(&self) -> Result<()> {
        if self.n_states + self.n_parameters == 0 {
            return Err(RoukfError::mismatch("filter needs at least one state or parameter"));
        }

        check_length("initial_states", &self.initial_states, self.n_states)?;
        check_length("initial_parameters", &self.initial_parameters, self.n_parameters)?;
        check_length("state_variance", &self.state_variance, self.n_states)?;
        check_length("parameter_variance", &self.parameter_variance, self.n_parameters)?;
        check_length("observation_variance", &self.observation_variance, self.n_observations)?;

        if let Some(i) = self.initial_states.iter().position(|v| !v.is_finite()) {
            return Err(RoukfError::mismatch(format!("initial state {} is not finite", i)));
        }
        for (name, values) in [
            ("state_variance", &self.state_variance),
            ("parameter_variance", &self.parameter_variance),
        ] {
            if let Some(i) = values.iter().position(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(RoukfError::mismatch(format!(
                    "{}[{}] = {} must be finite and non-negative",
                    name, i, values[i]
                )));
            }
        }
        if let Some(i) = self
            .observation_variance
            .iter()
            .position(|v| !(v.is_finite() && *v > 0.0))
        {
            return Err(RoukfError::mismatch(format!(
                "observation_variance[{}] = {} must be finite and positive",
                i, self.observation_variance[i]
            )));
        }

        if !(self.rank_tolerance.is_finite() && self.rank_tolerance >= 0.0) {
            return Err(RoukfError::mismatch("rank_tolerance must be finite and non-negative"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(RoukfError::mismatch("tolerance must be finite and positive"));
        }
        if self.max_iterations == 0 {
            return Err(RoukfError::mismatch("max_iterations must be positive"));
        }
        if self.workers == Some(0) {
            return Err(RoukfError::mismatch("workers must be positive"));
        }

        self.resolve_distributions()?;
        Ok(())
    }

    pub fn initial_states_or_default(&self) -> Vec<f64> {
        or_default(&self.initial_states, self.n_states, 0.0)
    }

    pub fn initial_parameters_or_default(&self, distributions: &[ParameterDistribution]) -> Vec<f64> {
        if self.initial_parameters.is_empty() {
            distributions.iter().map(|d| d.default_value()).collect()
        } else {
            self.initial_parameters.clone()
        }
    }

    pub fn state_variance_or_default(&self) -> Vec<f64> {
        or_default(&self.state_variance, self.n_states, 0.0)
    }

    pub fn parameter_variance_or_default(&self) -> Vec<f64> {
        or_default(&self.parameter_variance, self.n_parameters, 1.0)
    }

    pub fn observation_variance_or_default(&self) -> Vec<f64> {
        or_default(&self.observation_variance, self.n_observations, 1.0)
    }
}

fn check_length(name: &str, values: &[f64], expected: usize) -> Result<()> {
    if !values.is_empty() && values.len() != expected {
        return Err(RoukfError::mismatch(format!(
            "{} has {} entries, expected {}",
            name,
            values.len(),
            expected
        )));
    }
    Ok(())
}

fn or_default(values: &[f64], len: usize, fill: f64) -> Vec<f64> {
    if values.is_empty() {
        vec![fill; len]
    } else {
        values.to_vec()
    }
}
