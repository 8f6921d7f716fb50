use serde::{Deserialize, Serialize};

use super::mapper::ParameterMapper;
use crate::error::{Result, RoukfError};

/// Per-parameter constraint descriptor.
///
/// Picks the mapper for the parameter and the bounds a physical value must
/// respect when it is injected through the configuration or `set_parameters`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterDistribution {
    /// Unconstrained, identity map
    Default,
    /// `y > 0`, exponential map
    Positive,
    /// `low <= y <= high` with `0 < low`, exponential map
    RangedLogDist { low: f64, high: f64 },
    /// `low < y < high`, sigmoidal map
    RangedNormalDist { low: f64, high: f64 },
}

impl Default for ParameterDistribution {
    fn default() -> Self {
        ParameterDistribution::Default
    }
}

/// Mapper selector as written in configuration files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapperType {
    Identity,
    Exponential,
    Sigmoidal,
}

/// One mapper applied to `count` consecutive parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterGroup {
    pub mapper: MapperType,
    pub count: usize,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ParameterDistribution {
    pub fn name(&self) -> &'static str {
        match self {
            ParameterDistribution::Default => "DEFAULT",
            ParameterDistribution::Positive => "POSITIVE",
            ParameterDistribution::RangedLogDist { .. } => "RANGED_LOG_DIST",
            ParameterDistribution::RangedNormalDist { .. } => "RANGED_NORMAL_DIST",
        }
    }

    pub fn mapper(&self) -> ParameterMapper {
        match *self {
            ParameterDistribution::Default => ParameterMapper::Identity,
            ParameterDistribution::Positive | ParameterDistribution::RangedLogDist { .. } => {
                ParameterMapper::Exponential
            }
            ParameterDistribution::RangedNormalDist { low, high } => {
                ParameterMapper::Sigmoidal { low, high }
            }
        }
    }

    /// Resolve a configuration mapper selector. SIGMOIDAL needs both bounds.
    pub fn from_mapper_type(mapper: MapperType, min: Option<f64>, max: Option<f64>) -> Result<Self> {
        match mapper {
            MapperType::Identity => Ok(ParameterDistribution::Default),
            MapperType::Exponential => Ok(ParameterDistribution::Positive),
            MapperType::Sigmoidal => match (min, max) {
                (Some(low), Some(high)) => Ok(ParameterDistribution::RangedNormalDist { low, high }),
                _ => Err(RoukfError::mismatch(
                    "SIGMOIDAL mapper requires both min and max",
                )),
            },
        }
    }

    /// Expand mapper groups into one distribution per parameter.
    pub fn expand_groups(groups: &[ParameterGroup]) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        for group in groups {
            let distribution = Self::from_mapper_type(group.mapper, group.min, group.max)?;
            out.extend(std::iter::repeat(distribution).take(group.count));
        }
        Ok(out)
    }

    /// Reject bounds that cannot describe a distribution.
    pub fn check_bounds(&self, index: usize) -> Result<()> {
        match *self {
            ParameterDistribution::Default | ParameterDistribution::Positive => Ok(()),
            ParameterDistribution::RangedLogDist { low, high } => {
                if !(low.is_finite() && high.is_finite() && low > 0.0 && low < high) {
                    return Err(RoukfError::mismatch(format!(
                        "parameter {}: RANGED_LOG_DIST needs 0 < low < high, got [{}, {}]",
                        index, low, high
                    )));
                }
                Ok(())
            }
            ParameterDistribution::RangedNormalDist { low, high } => {
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return Err(RoukfError::mismatch(format!(
                        "parameter {}: RANGED_NORMAL_DIST needs low < high, got [{}, {}]",
                        index, low, high
                    )));
                }
                Ok(())
            }
        }
    }

    /// Check a physical value against the declared bounds and map it into
    /// estimation space.
    pub fn to_unconstrained(&self, index: usize, value: f64) -> Result<f64> {
        if let ParameterDistribution::RangedLogDist { low, high } = *self {
            if !(value >= low && value <= high) {
                return Err(RoukfError::ConstraintViolation {
                    index,
                    value,
                    distribution: self.name(),
                    reason: format!("outside [{}, {}]", low, high),
                });
            }
        }
        self.mapper()
            .to_unconstrained(value)
            .map_err(|e| RoukfError::ConstraintViolation {
                index,
                value,
                distribution: self.name(),
                reason: format!("outside {}", e.domain),
            })
    }

    /// Physical starting value used when the configuration gives none.
    pub fn default_value(&self) -> f64 {
        match *self {
            ParameterDistribution::Default => 0.0,
            ParameterDistribution::Positive => 1.0,
            ParameterDistribution::RangedLogDist { low, high } => (low * high).sqrt(),
            ParameterDistribution::RangedNormalDist { low, high } => 0.5 * (low + high),
        }
    }

    /// Whether an estimate produced by the filter still lies in the declared range.
    pub fn contains(&self, value: f64) -> bool {
        match *self {
            ParameterDistribution::Default => value.is_finite(),
            ParameterDistribution::Positive => value > 0.0,
            ParameterDistribution::RangedLogDist { low, high } => value >= low && value <= high,
            ParameterDistribution::RangedNormalDist { low, high } => value > low && value < high,
        }
    }
}
