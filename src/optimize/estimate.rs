//! Annualized expected returns and covariance from a return matrix.

use crate::error::OptimizationError;

/// Bars per year for 5-minute bars (252 trading days × 24 h × 12).
///
/// The same factor scales both the mean and the covariance; mixing
/// frequencies between the two skews every Sharpe ratio downstream.
pub const BARS_PER_YEAR: f64 = (252 * 24 * 12) as f64;

/// Relative pivot tolerance for the positive-definiteness check.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Annualized first and second moments of a set of return series.
#[derive(Clone, Debug, PartialEq)]
pub struct Moments {
    /// Annualized mean return per asset.
    pub expected_returns: Vec<f64>,
    /// Annualized sample covariance, `n × n`, symmetric.
    pub covariance: Vec<Vec<f64>>,
}

impl Moments {
    pub fn len(&self) -> usize {
        self.expected_returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expected_returns.is_empty()
    }
}

/// Estimate annualized moments from `returns` (rows = periods, cols = assets).
///
/// Fails with [`OptimizationError::SingularCovariance`] when the covariance
/// is not positive definite (constant prices, perfectly collinear assets,
/// or fewer than two return rows).
pub fn estimate_moments(
    returns: &[Vec<f64>],
    bars_per_year: f64,
) -> Result<Moments, OptimizationError> {
    let (rows, cols) = matrix_shape(returns)?;
    if rows < 2 {
        return Err(OptimizationError::SingularCovariance);
    }

    let expected_returns = column_means(returns)
        .into_iter()
        .map(|m| m * bars_per_year)
        .collect();

    let mut covariance = covariance_matrix(returns);
    for row in &mut covariance {
        for v in row.iter_mut() {
            *v *= bars_per_year;
        }
    }

    if cholesky(&covariance).is_none() {
        return Err(OptimizationError::SingularCovariance);
    }
    debug_assert_eq!(covariance.len(), cols);

    Ok(Moments {
        expected_returns,
        covariance,
    })
}

fn matrix_shape(matrix: &[Vec<f64>]) -> Result<(usize, usize), OptimizationError> {
    let rows = matrix.len();
    let cols = matrix.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return Err(OptimizationError::InvalidInput("empty return matrix".into()));
    }

    for row in matrix {
        if row.len() != cols {
            return Err(OptimizationError::InvalidInput("ragged return matrix".into()));
        }
        if row.iter().any(|x| !x.is_finite()) {
            return Err(OptimizationError::InvalidInput("non-finite return".into()));
        }
    }

    Ok((rows, cols))
}

fn column_means(matrix: &[Vec<f64>]) -> Vec<f64> {
    let rows = matrix.len();
    let cols = matrix[0].len();

    let mut sums = vec![0.0; cols];
    for row in matrix {
        for (j, v) in row.iter().enumerate() {
            sums[j] += *v;
        }
    }

    sums.into_iter().map(|s| s / rows as f64).collect()
}

/// Sample covariance (denominator `rows - 1`).
fn covariance_matrix(matrix: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let rows = matrix.len();
    let cols = matrix[0].len();
    let means = column_means(matrix);

    let mut cov = vec![vec![0.0; cols]; cols];

    for row in matrix {
        for i in 0..cols {
            let di = row[i] - means[i];
            for j in i..cols {
                let dj = row[j] - means[j];
                cov[i][j] += di * dj;
            }
        }
    }

    let denom = (rows as f64 - 1.0).max(1.0);
    for i in 0..cols {
        for j in i..cols {
            let v = cov[i][j] / denom;
            cov[i][j] = v;
            cov[j][i] = v;
        }
    }

    cov
}

/// Lower-triangular Cholesky factor, or `None` if `a` is not positive definite.
pub fn cholesky(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let scale = (0..n).map(|i| a[i][i].abs()).fold(0.0_f64, f64::max);
    if n == 0 || !(scale > 0.0) {
        return None;
    }

    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let s: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = a[i][i] - s;
                if !(d > PIVOT_TOLERANCE * scale) {
                    return None;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (a[i][j] - s) / l[j][j];
            }
        }
    }
    Some(l)
}
