//! Constrained efficient-frontier solvers.
//!
//! [`Solver`] is the seam between moment estimation and the numerical
//! engine. The bundled [`ProjectedGradientSolver`] is deterministic and
//! safety-first:
//! - every iterate is feasible (projected onto the bounded simplex),
//! - there is no randomness or seeding anywhere,
//! - outputs are finite, within bounds, and sum to 1.

use std::fmt;

use crate::error::OptimizationError;

/// What the solver optimizes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Objective {
    /// Maximize `(wᵀμ − r_f) / √(wᵀΣw)`.
    MaxSharpe,
    /// Minimize `√(wᵀΣw)` subject to Sharpe ≥ `target_sharpe`.
    MinVolatility { target_sharpe: f64 },
}

/// The objective a solution actually satisfies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ObjectiveKind {
    MaxSharpe,
    MinVolatility,
    /// Max-Sharpe fallback when no asset beats the risk-free rate.
    MinVariance,
}

impl ObjectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveKind::MaxSharpe => "max_sharpe",
            ObjectiveKind::MinVolatility => "min_volatility",
            ObjectiveKind::MinVariance => "min_variance",
        }
    }
}

impl fmt::Display for ObjectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constraints shared by every objective.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Constraints {
    pub risk_free_rate: f64,
    pub objective: Objective,
    /// Lower bound per weight (0.0 = long-only).
    pub min_weight: f64,
    /// Upper bound per weight.
    pub max_weight: f64,
}

impl Constraints {
    /// Long-only max-Sharpe with no per-asset caps.
    pub fn max_sharpe(risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            objective: Objective::MaxSharpe,
            min_weight: 0.0,
            max_weight: 1.0,
        }
    }

    /// Long-only minimum volatility achieving at least `target_sharpe`.
    pub fn min_volatility(risk_free_rate: f64, target_sharpe: f64) -> Self {
        Self {
            objective: Objective::MinVolatility { target_sharpe },
            ..Self::max_sharpe(risk_free_rate)
        }
    }

    pub fn with_bounds(mut self, min_weight: f64, max_weight: f64) -> Self {
        self.min_weight = min_weight;
        self.max_weight = max_weight;
        self
    }

    /// Whether a portfolio of `n` assets can satisfy the weight bounds.
    pub fn bounds_feasible(&self, n: usize) -> bool {
        let n = n as f64;
        self.min_weight >= 0.0
            && self.min_weight < self.max_weight
            && self.min_weight * n <= 1.0 + 1e-12
            && self.max_weight * n >= 1.0 - 1e-12
    }
}

/// Weights plus the objective they satisfy.
#[derive(Clone, Debug, PartialEq)]
pub struct Solution {
    pub weights: Vec<f64>,
    pub objective: ObjectiveKind,
}

/// A constrained portfolio solver.
pub trait Solver: Send + Sync {
    fn solve(
        &self,
        expected_returns: &[f64],
        covariance: &[Vec<f64>],
        constraints: &Constraints,
    ) -> Result<Solution, OptimizationError>;
}

/// Projected gradient ascent with Armijo backtracking.
///
/// Max-Sharpe ascends the Sharpe ratio directly. Target-Sharpe walks the
/// mean-variance frontier `argmax wᵀ(μ − r_f) − γ/2 · wᵀΣw` from the
/// minimum-variance end towards the tangency portfolio and returns the first
/// frontier point whose Sharpe reaches the target.
#[derive(Clone, Debug)]
pub struct ProjectedGradientSolver {
    pub max_iterations: usize,
    /// Stop once an accepted step moves no weight by more than this.
    pub tolerance: f64,
}

impl Default for ProjectedGradientSolver {
    fn default() -> Self {
        Self {
            max_iterations: 20_000,
            tolerance: 1e-13,
        }
    }
}

const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-20;
const MAX_STEP: f64 = 1e6;
const FRONTIER_GRID: usize = 90;
const FRONTIER_BISECTIONS: usize = 60;

#[derive(Clone, Copy)]
struct Bounds {
    lo: f64,
    hi: f64,
}

impl Solver for ProjectedGradientSolver {
    fn solve(
        &self,
        expected_returns: &[f64],
        covariance: &[Vec<f64>],
        constraints: &Constraints,
    ) -> Result<Solution, OptimizationError> {
        let n = expected_returns.len();
        if n == 0 {
            return Err(OptimizationError::InvalidInput("no assets".into()));
        }
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return Err(OptimizationError::InvalidInput(format!(
                "covariance is not {n}x{n}"
            )));
        }
        if expected_returns.iter().any(|x| !x.is_finite())
            || covariance.iter().flatten().any(|x| !x.is_finite())
        {
            return Err(OptimizationError::InvalidInput("non-finite moments".into()));
        }
        if !constraints.bounds_feasible(n) {
            return Err(OptimizationError::InvalidInput(format!(
                "weight bounds [{}, {}] infeasible for {n} assets",
                constraints.min_weight, constraints.max_weight
            )));
        }

        let bounds = Bounds {
            lo: constraints.min_weight,
            hi: constraints.max_weight,
        };
        let excess: Vec<f64> = expected_returns
            .iter()
            .map(|m| m - constraints.risk_free_rate)
            .collect();

        match constraints.objective {
            Objective::MaxSharpe => {
                if excess.iter().all(|x| *x <= 0.0) {
                    return Ok(Solution {
                        weights: self.min_variance(covariance, bounds),
                        objective: ObjectiveKind::MinVariance,
                    });
                }
                Ok(Solution {
                    weights: self.max_sharpe(&excess, covariance, bounds),
                    objective: ObjectiveKind::MaxSharpe,
                })
            }
            Objective::MinVolatility { target_sharpe } => {
                let weights = self.target_sharpe(&excess, covariance, bounds, target_sharpe)?;
                Ok(Solution {
                    weights,
                    objective: ObjectiveKind::MinVolatility,
                })
            }
        }
    }
}

impl ProjectedGradientSolver {
    fn min_variance(&self, cov: &[Vec<f64>], bounds: Bounds) -> Vec<f64> {
        let start = equal_weights(cov.len());
        self.ascend(
            start,
            bounds,
            |w| -dot(w, &mat_vec_mul(cov, w)),
            |w| mat_vec_mul(cov, w).iter().map(|g| -2.0 * g).collect(),
        )
    }

    fn max_sharpe(&self, excess: &[f64], cov: &[Vec<f64>], bounds: Bounds) -> Vec<f64> {
        let start = equal_weights(excess.len());
        self.ascend(
            start,
            bounds,
            |w| sharpe(w, excess, cov),
            |w| {
                let sigma_w = mat_vec_mul(cov, w);
                let var = dot(w, &sigma_w).max(1e-300);
                let vol = var.sqrt();
                let num = dot(w, excess);
                excess
                    .iter()
                    .zip(&sigma_w)
                    .map(|(a, sw)| a / vol - num * sw / (var * vol))
                    .collect()
            },
        )
    }

    /// Mean-variance utility optimum for risk aversion `gamma`, warm-started at `start`.
    fn utility(
        &self,
        excess: &[f64],
        cov: &[Vec<f64>],
        bounds: Bounds,
        gamma: f64,
        start: Vec<f64>,
    ) -> Vec<f64> {
        self.ascend(
            start,
            bounds,
            |w| dot(w, excess) - 0.5 * gamma * dot(w, &mat_vec_mul(cov, w)),
            |w| {
                mat_vec_mul(cov, w)
                    .iter()
                    .zip(excess)
                    .map(|(sw, e)| e - gamma * sw)
                    .collect()
            },
        )
    }

    fn target_sharpe(
        &self,
        excess: &[f64],
        cov: &[Vec<f64>],
        bounds: Bounds,
        target: f64,
    ) -> Result<Vec<f64>, OptimizationError> {
        let min_var = self.min_variance(cov, bounds);
        if sharpe(&min_var, excess, cov) >= target {
            return Ok(min_var);
        }

        let tangency = self.max_sharpe(excess, cov, bounds);
        let best = sharpe(&tangency, excess, cov);
        if best < target {
            return Err(OptimizationError::Infeasible { target, best });
        }

        // Risk aversion large enough that the return term is negligible.
        let avg_var = (0..cov.len()).map(|i| cov[i][i]).sum::<f64>() / cov.len() as f64;
        let max_excess = excess.iter().fold(0.0_f64, |a, x| a.max(x.abs()));
        let mut gamma_hi = 1e6 * (max_excess + 1e-12) / avg_var;

        // Walk down the frontier until the Sharpe target is first met.
        let mut w_hi = self.utility(excess, cov, bounds, gamma_hi, min_var);
        let mut found = None;
        for _ in 0..FRONTIER_GRID {
            let gamma = gamma_hi * 0.5;
            let w = self.utility(excess, cov, bounds, gamma, w_hi.clone());
            if sharpe(&w, excess, cov) >= target {
                found = Some((gamma, w));
                break;
            }
            gamma_hi = gamma;
            w_hi = w;
        }

        let Some((mut gamma_lo, mut w_lo)) = found else {
            // Target only met in a narrow band around the tangency portfolio.
            return Ok(tangency);
        };

        // Bisect (in log space) for the largest risk aversion that still meets it.
        for _ in 0..FRONTIER_BISECTIONS {
            let gamma = (gamma_hi * gamma_lo).sqrt();
            let w = self.utility(excess, cov, bounds, gamma, w_hi.clone());
            if sharpe(&w, excess, cov) >= target {
                gamma_lo = gamma;
                w_lo = w;
            } else {
                gamma_hi = gamma;
                w_hi = w;
            }
        }

        Ok(w_lo)
    }

    /// Maximize `f` over the bounded simplex from `start`.
    fn ascend<F, G>(&self, start: Vec<f64>, bounds: Bounds, f: F, grad: G) -> Vec<f64>
    where
        F: Fn(&[f64]) -> f64,
        G: Fn(&[f64]) -> Vec<f64>,
    {
        let mut w = project_bounded_simplex(&start, bounds);
        let mut fw = f(&w);
        let mut step = 1.0_f64;

        for _ in 0..self.max_iterations {
            let g = grad(&w);
            if g.iter().any(|x| !x.is_finite()) {
                break;
            }

            let mut t = step;
            let mut accepted = None;
            while t >= MIN_STEP {
                let moved: Vec<f64> = w.iter().zip(&g).map(|(wi, gi)| wi + t * gi).collect();
                let candidate = project_bounded_simplex(&moved, bounds);
                let gain: f64 = g
                    .iter()
                    .zip(candidate.iter().zip(&w))
                    .map(|(gi, (ci, wi))| gi * (ci - wi))
                    .sum();
                let fc = f(&candidate);
                if fc.is_finite() && fc >= fw + ARMIJO * gain {
                    accepted = Some((candidate, fc));
                    break;
                }
                t *= 0.5;
            }

            let Some((candidate, fc)) = accepted else {
                break;
            };
            let delta = max_abs_diff(&candidate, &w);
            w = candidate;
            fw = fc;
            step = (t * 2.0).min(MAX_STEP);
            if delta < self.tolerance {
                break;
            }
        }

        w
    }
}

/// Sharpe ratio of `w` given excess returns.
pub fn sharpe(w: &[f64], excess: &[f64], cov: &[Vec<f64>]) -> f64 {
    let var = dot(w, &mat_vec_mul(cov, w));
    if var <= 0.0 {
        return f64::NEG_INFINITY;
    }
    dot(w, excess) / var.sqrt()
}

pub(crate) fn mat_vec_mul(matrix: &[Vec<f64>], vec: &[f64]) -> Vec<f64> {
    matrix
        .iter()
        .map(|row| row.iter().zip(vec).map(|(a, b)| a * b).sum::<f64>())
        .collect()
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

fn equal_weights(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}

/// Euclidean projection onto `{w : Σw = 1, lo ≤ wᵢ ≤ hi}`.
///
/// Bisects on the shift `θ` in `wᵢ = clamp(vᵢ − θ, lo, hi)`; the sum is
/// monotone in `θ`, so this is exact up to floating-point resolution.
fn project_bounded_simplex(v: &[f64], bounds: Bounds) -> Vec<f64> {
    let n = v.len();
    if n == 0 {
        return Vec::new();
    }
    if v.iter().any(|x| !x.is_finite()) {
        return equal_weights(n);
    }

    let Bounds { lo, hi } = bounds;
    let total = |theta: f64| v.iter().map(|x| (x - theta).clamp(lo, hi)).sum::<f64>();

    let mut a = v.iter().copied().fold(f64::INFINITY, f64::min) - hi;
    let mut b = v.iter().copied().fold(f64::NEG_INFINITY, f64::max) - lo;
    for _ in 0..200 {
        let mid = 0.5 * (a + b);
        if mid <= a || mid >= b {
            break;
        }
        if total(mid) > 1.0 {
            a = mid;
        } else {
            b = mid;
        }
    }
    let theta = 0.5 * (a + b);
    let mut w: Vec<f64> = v.iter().map(|x| (x - theta).clamp(lo, hi)).collect();

    // Spread the floating-point residual over the coordinates not at a bound.
    let residual = 1.0 - w.iter().sum::<f64>();
    let free: Vec<usize> = (0..n).filter(|&i| w[i] > lo && w[i] < hi).collect();
    if !free.is_empty() {
        let share = residual / free.len() as f64;
        for i in free {
            w[i] += share;
        }
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid_weights(w: &[f64], n: usize, lo: f64, hi: f64) {
        assert_eq!(w.len(), n);
        assert!(w.iter().all(|x| x.is_finite()));
        assert!(w.iter().all(|x| *x >= lo - 1e-12 && *x <= hi + 1e-12), "{w:?}");
        let s: f64 = w.iter().sum();
        assert!((s - 1.0).abs() < 1e-9, "sum={s}");
    }

    fn three_asset_moments() -> (Vec<f64>, Vec<Vec<f64>>) {
        let mu = vec![0.12, 0.10, 0.07];
        let cov = vec![
            vec![0.040, 0.006, 0.002],
            vec![0.006, 0.025, 0.004],
            vec![0.002, 0.004, 0.010],
        ];
        (mu, cov)
    }

    /// Unconstrained tangency portfolio for a 2x2 covariance.
    fn analytic_tangency(mu: &[f64], cov: &[Vec<f64>], rf: f64) -> Vec<f64> {
        let det = cov[0][0] * cov[1][1] - cov[0][1] * cov[1][0];
        let e0 = mu[0] - rf;
        let e1 = mu[1] - rf;
        let y0 = (cov[1][1] * e0 - cov[0][1] * e1) / det;
        let y1 = (cov[0][0] * e1 - cov[1][0] * e0) / det;
        vec![y0 / (y0 + y1), y1 / (y0 + y1)]
    }

    #[test]
    fn projection_lands_on_simplex() {
        let b = Bounds { lo: 0.0, hi: 1.0 };
        let w = project_bounded_simplex(&[0.9, 0.8, -3.0], b);
        assert_valid_weights(&w, 3, 0.0, 1.0);
        assert!((w[0] - 0.55).abs() < 1e-12);
        assert!((w[1] - 0.45).abs() < 1e-12);
        assert_eq!(w[2], 0.0);
    }

    #[test]
    fn projection_respects_caps() {
        let b = Bounds { lo: 0.1, hi: 0.5 };
        let w = project_bounded_simplex(&[5.0, 0.0, 0.0, 0.0], b);
        assert_valid_weights(&w, 4, 0.1, 0.5);
        assert!((w[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn projection_of_feasible_point_is_identity() {
        let b = Bounds { lo: 0.0, hi: 1.0 };
        let v = [0.2, 0.3, 0.5];
        let w = project_bounded_simplex(&v, b);
        for (a, e) in w.iter().zip(v) {
            assert!((a - e).abs() < 1e-12);
        }
    }

    #[test]
    fn max_sharpe_matches_analytic_tangency() {
        let mu = vec![0.15, 0.09];
        let cov = vec![vec![0.09, 0.012], vec![0.012, 0.04]];
        let rf = 0.02;
        let sol = ProjectedGradientSolver::default()
            .solve(&mu, &cov, &Constraints::max_sharpe(rf))
            .unwrap();
        assert_eq!(sol.objective, ObjectiveKind::MaxSharpe);

        let expected = analytic_tangency(&mu, &cov, rf);
        for (got, want) in sol.weights.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-6, "got={got} want={want}");
        }
    }

    #[test]
    fn max_sharpe_weights_are_valid() {
        let (mu, cov) = three_asset_moments();
        let sol = ProjectedGradientSolver::default()
            .solve(&mu, &cov, &Constraints::max_sharpe(0.02))
            .unwrap();
        assert_valid_weights(&sol.weights, 3, 0.0, 1.0);
    }

    #[test]
    fn max_sharpe_respects_bounds() {
        let (mu, cov) = three_asset_moments();
        let c = Constraints::max_sharpe(0.02).with_bounds(0.1, 0.4);
        let sol = ProjectedGradientSolver::default().solve(&mu, &cov, &c).unwrap();
        assert_valid_weights(&sol.weights, 3, 0.1, 0.4);
    }

    #[test]
    fn negative_excess_falls_back_to_min_variance() {
        let (mu, cov) = three_asset_moments();
        let sol = ProjectedGradientSolver::default()
            .solve(&mu, &cov, &Constraints::max_sharpe(0.5))
            .unwrap();
        assert_eq!(sol.objective, ObjectiveKind::MinVariance);
        assert_valid_weights(&sol.weights, 3, 0.0, 1.0);
        // The lowest-variance asset dominates.
        assert!(sol.weights[2] > sol.weights[0]);
    }

    #[test]
    fn target_sharpe_trades_volatility_for_sharpe() {
        let (mu, cov) = three_asset_moments();
        let rf = 0.02;
        let solver = ProjectedGradientSolver::default();
        let excess: Vec<f64> = mu.iter().map(|m| m - rf).collect();

        let tangency = solver.solve(&mu, &cov, &Constraints::max_sharpe(rf)).unwrap();
        let best = sharpe(&tangency.weights, &excess, &cov);

        let target = best * 0.97;
        let sol = solver
            .solve(&mu, &cov, &Constraints::min_volatility(rf, target))
            .unwrap();
        assert_eq!(sol.objective, ObjectiveKind::MinVolatility);
        assert_valid_weights(&sol.weights, 3, 0.0, 1.0);
        assert!(sharpe(&sol.weights, &excess, &cov) >= target - 1e-9);

        let vol = |w: &[f64]| dot(w, &mat_vec_mul(&cov, w)).sqrt();
        assert!(vol(&sol.weights) <= vol(&tangency.weights) + 1e-12);
    }

    #[test]
    fn low_target_returns_min_variance_portfolio() {
        let (mu, cov) = three_asset_moments();
        let solver = ProjectedGradientSolver::default();
        let sol = solver
            .solve(&mu, &cov, &Constraints::min_volatility(0.02, 0.0))
            .unwrap();
        let mv = solver.min_variance(&cov, Bounds { lo: 0.0, hi: 1.0 });
        assert_eq!(sol.weights, mv);
    }

    #[test]
    fn unreachable_target_is_infeasible() {
        let (mu, cov) = three_asset_moments();
        let err = ProjectedGradientSolver::default()
            .solve(&mu, &cov, &Constraints::min_volatility(0.02, 9.0))
            .unwrap_err();
        assert!(matches!(err, OptimizationError::Infeasible { target, .. } if target == 9.0));
    }

    #[test]
    fn single_asset_gets_full_weight() {
        let sol = ProjectedGradientSolver::default()
            .solve(&[0.1], &[vec![0.04]], &Constraints::max_sharpe(0.0))
            .unwrap();
        assert_eq!(sol.weights, vec![1.0]);
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let err = ProjectedGradientSolver::default()
            .solve(&[0.1, 0.2], &[vec![0.04]], &Constraints::max_sharpe(0.0))
            .unwrap_err();
        assert!(matches!(err, OptimizationError::InvalidInput(_)));
    }

    #[test]
    fn rejects_infeasible_bounds() {
        let (mu, cov) = three_asset_moments();
        let c = Constraints::max_sharpe(0.0).with_bounds(0.0, 0.2);
        assert!(ProjectedGradientSolver::default().solve(&mu, &cov, &c).is_err());
    }

    #[test]
    fn solve_is_deterministic() {
        let (mu, cov) = three_asset_moments();
        let solver = ProjectedGradientSolver::default();
        let a = solver.solve(&mu, &cov, &Constraints::max_sharpe(0.02)).unwrap();
        let b = solver.solve(&mu, &cov, &Constraints::max_sharpe(0.02)).unwrap();
        assert_eq!(a.weights, b.weights);
    }
}
