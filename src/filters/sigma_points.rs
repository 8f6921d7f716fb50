use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::types::{Ensemble, JointVec, ReducedMat, SigmaWeights, SqrtFactor};

/// Layout of the normalized sigma directions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SigmaDistribution {
    /// `r + 1` points on a regular simplex
    #[default]
    Simplex,
    /// `2r` points, a symmetric pair per axis
    Canonic,
    /// `2r + 1` points, the canonic pairs plus the centre
    Star,
    /// `r + 2` points, the simplex plus the centre
    SimplexStar,
}

impl SigmaDistribution {
    /// Number of sigma points for a factor of rank `rank`
    pub fn point_count(&self, rank: usize) -> usize {
        if rank == 0 {
            return 1;
        }
        match self {
            SigmaDistribution::Simplex => rank + 1,
            SigmaDistribution::Canonic => 2 * rank,
            SigmaDistribution::Star => 2 * rank + 1,
            SigmaDistribution::SimplexStar => rank + 2,
        }
    }
}

/// Deterministic sample directions and weights for one filter step.
///
/// Directions are normalized: `Σ wᵢ sᵢ = 0` and `Σ wᵢ sᵢ sᵢᵀ = I`, so a
/// point `mean + factor · sᵢ` reproduces the mean and the covariance
/// `factor · factorᵀ`. Weights are uniform, `alpha = 1 / m`.
#[derive(Clone, Debug)]
pub struct SigmaPointSet {
    distribution: SigmaDistribution,

    /// One direction per column, `r × m`
    directions: DMatrix<f64>,

    weights: SigmaWeights,

    /// Weight of each sigma point
    alpha: f64,
}

impl SigmaPointSet {
    pub fn generate(rank: usize, distribution: SigmaDistribution) -> Self {
        let directions = if rank == 0 {
            // Fully certain: the mean is the only point
            DMatrix::zeros(0, 1)
        } else {
            match distribution {
                SigmaDistribution::Simplex => simplex_directions(rank),
                SigmaDistribution::Canonic => canonic_directions(rank),
                SigmaDistribution::Star => star_directions(rank),
                SigmaDistribution::SimplexStar => simplex_star_directions(rank),
            }
        };

        let count = directions.ncols();
        let alpha = 1.0 / count as f64;
        let weights = DVector::from_element(count, alpha);

        Self {
            distribution,
            directions,
            weights,
            alpha,
        }
    }

    pub fn distribution(&self) -> SigmaDistribution {
        self.distribution
    }

    pub fn rank(&self) -> usize {
        self.directions.nrows()
    }

    /// Number of sigma points
    pub fn len(&self) -> usize {
        self.directions.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.directions.ncols() == 0
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn directions(&self) -> &DMatrix<f64> {
        &self.directions
    }

    pub fn weights(&self) -> &SigmaWeights {
        &self.weights
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// `diag(w) · directionsᵀ`, `m × r`. Right-multiplying an ensemble by it
    /// gives the weighted sensitivity `Σ wᵢ xᵢ sᵢᵀ`.
    pub fn weighted_directions(&self) -> DMatrix<f64> {
        let mut out = self.directions.transpose();
        for (mut row, w) in out.row_iter_mut().zip(self.weights.iter()) {
            row *= *w;
        }
        out
    }

    /// Prior reduced information `Σ wᵢ sᵢ sᵢᵀ`, `r × r`
    pub fn second_moment(&self) -> ReducedMat {
        &self.directions * self.weighted_directions()
    }

    /// Weighted mean of the ensemble columns, summed in point order.
    pub fn weighted_mean(&self, ensemble: &Ensemble) -> JointVec {
        let mut mean = DVector::zeros(ensemble.nrows());
        for (column, w) in ensemble.column_iter().zip(self.weights.iter()) {
            mean.axpy(*w, &column, 1.0);
        }
        mean
    }

    /// Sample points `mean + factor · sᵢ`, one per column.
    pub fn sample(&self, mean: &JointVec, factor: &SqrtFactor) -> Ensemble {
        let mut points = if self.rank() == 0 {
            DMatrix::zeros(mean.len(), self.len())
        } else {
            factor * &self.directions
        };
        for mut column in points.column_iter_mut() {
            column += mean;
        }
        points
    }
}

/// Regular simplex with weight `1 / (r + 1)`, built one row at a time:
/// row `k - 1` holds `-c` in its first `k` columns and `k c` in column `k`.
fn simplex_directions(rank: usize) -> DMatrix<f64> {
    let weight = 1.0 / (rank + 1) as f64;
    let mut sigma = DMatrix::zeros(rank, rank + 1);
    for k in 1..=rank {
        let c = 1.0 / (((k * (k + 1)) as f64) * weight).sqrt();
        for col in 0..k {
            sigma[(k - 1, col)] = -c;
        }
        sigma[(k - 1, k)] = k as f64 * c;
    }
    sigma
}

fn canonic_directions(rank: usize) -> DMatrix<f64> {
    symmetric_pairs(rank, (rank as f64).sqrt(), 2 * rank)
}

fn star_directions(rank: usize) -> DMatrix<f64> {
    // Last column stays at the centre
    symmetric_pairs(rank, ((2 * rank + 1) as f64 / 2.0).sqrt(), 2 * rank + 1)
}

fn simplex_star_directions(rank: usize) -> DMatrix<f64> {
    let scale = ((rank + 2) as f64 / (rank + 1) as f64).sqrt();
    let mut sigma = DMatrix::zeros(rank, rank + 2);
    sigma
        .columns_mut(0, rank + 1)
        .copy_from(&(simplex_directions(rank) * scale));
    sigma
}

/// `+scale eⱼ` in the first `rank` columns, their negatives in reverse order after.
fn symmetric_pairs(rank: usize, scale: f64, columns: usize) -> DMatrix<f64> {
    let mut sigma = DMatrix::zeros(rank, columns);
    for j in 0..rank {
        sigma[(j, j)] = scale;
        sigma[(rank - 1 - j, rank + j)] = -scale;
    }
    sigma
}
