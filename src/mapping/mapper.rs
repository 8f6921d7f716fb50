use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A physical value that has no preimage under a mapper.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{value} is outside {domain}")]
pub struct OutOfBounds {
    pub value: f64,
    pub domain: String,
}

/// Map between the unconstrained estimation variable `x` and the physical
/// parameter `y`.
///
/// Stored per parameter as plain data; dispatch is a `match`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterMapper {
    /// `y = x`
    Identity,
    /// `y = exp(x)`, physical values on the positive half-line
    Exponential,
    /// `y = low + (high - low) / (1 + exp(-x))`, physical values in `(low, high)`
    Sigmoidal { low: f64, high: f64 },
}

impl Default for ParameterMapper {
    fn default() -> Self {
        ParameterMapper::Identity
    }
}

impl ParameterMapper {
    pub fn name(&self) -> &'static str {
        match self {
            ParameterMapper::Identity => "IDENTITY",
            ParameterMapper::Exponential => "EXPONENTIAL",
            ParameterMapper::Sigmoidal { .. } => "SIGMOIDAL",
        }
    }

    pub fn to_physical(&self, x: f64) -> f64 {
        match *self {
            ParameterMapper::Identity => x,
            ParameterMapper::Exponential => x.exp(),
            ParameterMapper::Sigmoidal { low, high } => low + (high - low) * logistic(x),
        }
    }

    pub fn to_unconstrained(&self, y: f64) -> Result<f64, OutOfBounds> {
        if !y.is_finite() {
            return Err(OutOfBounds {
                value: y,
                domain: "the finite reals".to_string(),
            });
        }
        match *self {
            ParameterMapper::Identity => Ok(y),
            ParameterMapper::Exponential => {
                if y <= 0.0 {
                    return Err(OutOfBounds {
                        value: y,
                        domain: "(0, inf)".to_string(),
                    });
                }
                Ok(y.ln())
            }
            ParameterMapper::Sigmoidal { low, high } => {
                if y <= low || y >= high {
                    return Err(OutOfBounds {
                        value: y,
                        domain: format!("({}, {})", low, high),
                    });
                }
                let t = (y - low) / (high - low);
                Ok((t / (1.0 - t)).ln())
            }
        }
    }

    /// `dy/dx` at `x`, used to carry variances from estimation space to physical space
    pub fn derivative(&self, x: f64) -> f64 {
        match *self {
            ParameterMapper::Identity => 1.0,
            ParameterMapper::Exponential => x.exp(),
            ParameterMapper::Sigmoidal { low, high } => {
                let s = logistic(x);
                (high - low) * s * (1.0 - s)
            }
        }
    }
}

// Split on sign so exp never overflows
fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_round_trip() {
        let mapper = ParameterMapper::Identity;
        for y in [-1e6, -3.5, 0.0, 2.0, 7.25e4] {
            let x = mapper.to_unconstrained(y).unwrap();
            assert_eq!(mapper.to_physical(x), y);
            assert_eq!(mapper.derivative(x), 1.0);
        }
    }

    #[test]
    fn test_exponential_round_trip() {
        let mapper = ParameterMapper::Exponential;
        for y in [1e-8, 0.5, 1.0, 2.0, 2.5e5] {
            let x = mapper.to_unconstrained(y).unwrap();
            assert_relative_eq!(mapper.to_physical(x), y, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_exponential_rejects_non_positive() {
        let mapper = ParameterMapper::Exponential;
        assert!(mapper.to_unconstrained(0.0).is_err());
        assert!(mapper.to_unconstrained(-1.0).is_err());
        assert!(mapper.to_unconstrained(f64::NAN).is_err());
    }

    #[test]
    fn test_sigmoidal_round_trip() {
        let mapper = ParameterMapper::Sigmoidal {
            low: 0.0,
            high: 10.0,
        };
        for y in [1e-6, 0.1, 5.0, 9.0, 9.999] {
            let x = mapper.to_unconstrained(y).unwrap();
            assert_relative_eq!(mapper.to_physical(x), y, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_sigmoidal_rejects_outside_open_interval() {
        let mapper = ParameterMapper::Sigmoidal {
            low: 0.0,
            high: 10.0,
        };
        assert!(mapper.to_unconstrained(0.0).is_err());
        assert!(mapper.to_unconstrained(10.0).is_err());
        let err = mapper.to_unconstrained(15.0).unwrap_err();
        assert_eq!(err.value, 15.0);
        assert_eq!(err.domain, "(0, 10)");
    }

    #[test]
    fn test_sigmoidal_centre_and_tails() {
        let mapper = ParameterMapper::Sigmoidal {
            low: -2.0,
            high: 4.0,
        };
        assert_relative_eq!(mapper.to_physical(0.0), 1.0, epsilon = 1e-15);
        assert_relative_eq!(mapper.derivative(0.0), 1.5, epsilon = 1e-15);
        // Saturates instead of overflowing
        assert!(mapper.to_physical(-800.0) >= -2.0);
        assert!(mapper.to_physical(800.0) <= 4.0);
        assert!(mapper.derivative(800.0).is_finite());
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let mappers = [
            ParameterMapper::Identity,
            ParameterMapper::Exponential,
            ParameterMapper::Sigmoidal {
                low: 1.0,
                high: 3.0,
            },
        ];
        let h = 1e-6;
        for mapper in mappers {
            for x in [-1.5, 0.0, 0.7] {
                let fd = (mapper.to_physical(x + h) - mapper.to_physical(x - h)) / (2.0 * h);
                assert_relative_eq!(mapper.derivative(x), fd, max_relative = 1e-6);
            }
        }
    }
}
