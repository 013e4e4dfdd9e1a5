//! Portfolio optimizer: rolling moments, memoized, fed into a [`Solver`].
//!
//! ```
//! use folio::{Optimizer, OptimizationRequest, PriceWindow, Symbol};
//!
//! let assets = vec![Symbol::new("BTC"), Symbol::new("ETH")];
//! let rows: Vec<Vec<f64>> = (0..12)
//!     .map(|t| {
//!         let t = t as f64;
//!         vec![100.0 + t + (t * 1.3).sin(), 50.0 + 0.4 * t + (t * 0.7).cos()]
//!     })
//!     .collect();
//! let window = PriceWindow::from_rows(assets, (0..12).collect(), rows).unwrap();
//!
//! let mut optimizer = Optimizer::new();
//! let allocation = optimizer
//!     .optimize(&window, &OptimizationRequest::max_sharpe(0.02))
//!     .unwrap();
//! let total: f64 = allocation.weights.iter().map(|(_, w)| w).sum();
//! assert!((total - 1.0).abs() < 1e-9);
//! ```

pub mod cache;
pub mod estimate;
pub mod solver;

use std::sync::Arc;

use log::debug;

use crate::error::OptimizationError;
use crate::fingerprint::Fingerprint;
use crate::history::PriceWindow;
use crate::types::Symbol;

pub use cache::{CacheKey, CacheStats, CovarianceCache, DEFAULT_CACHE_CAPACITY};
pub use estimate::{BARS_PER_YEAR, Moments, estimate_moments};
pub use solver::{
    Constraints, Objective, ObjectiveKind, ProjectedGradientSolver, Solution, Solver,
};

/// Tolerance on `Σw = 1` for solver output.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Per-call optimization parameters (taken from the active config snapshot).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizationRequest {
    pub risk_free_rate: f64,
    pub target_sharpe: Option<f64>,
    pub min_weight: f64,
    pub max_weight: f64,
}

impl OptimizationRequest {
    pub fn max_sharpe(risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            target_sharpe: None,
            min_weight: 0.0,
            max_weight: 1.0,
        }
    }

    pub fn with_target_sharpe(mut self, target: Option<f64>) -> Self {
        self.target_sharpe = target;
        self
    }

    pub fn with_bounds(mut self, min_weight: f64, max_weight: f64) -> Self {
        self.min_weight = min_weight;
        self.max_weight = max_weight;
        self
    }

    fn constraints(&self) -> Constraints {
        let base = match self.target_sharpe {
            Some(target) => Constraints::min_volatility(self.risk_free_rate, target),
            None => Constraints::max_sharpe(self.risk_free_rate),
        };
        base.with_bounds(self.min_weight, self.max_weight)
    }
}

/// Result of one optimization.
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    /// Target weight per asset, in window asset order.
    pub weights: Vec<(Symbol, f64)>,
    /// Annualized `wᵀμ`.
    pub expected_return: f64,
    /// Annualized `√(wᵀΣw)`.
    pub expected_volatility: f64,
    pub sharpe_ratio: f64,
    pub objective: ObjectiveKind,
    /// Fingerprint of the price window the weights were computed from.
    pub fingerprint: Fingerprint,
    /// Whether the moments came from the cache.
    pub cache_hit: bool,
}

/// Rolling-window optimizer with a memoized moment cache.
pub struct Optimizer {
    solver: Box<dyn Solver>,
    cache: CovarianceCache,
    bars_per_year: f64,
}

impl Optimizer {
    /// Projected-gradient solver, default cache capacity, 5-minute bars.
    pub fn new() -> Self {
        Self::with_solver(Box::new(ProjectedGradientSolver::default()))
    }

    pub fn with_solver(solver: Box<dyn Solver>) -> Self {
        Self {
            solver,
            cache: CovarianceCache::default(),
            bars_per_year: BARS_PER_YEAR,
        }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = CovarianceCache::new(capacity);
        self
    }

    /// Override the annualization factor (applied to mean and covariance alike).
    pub fn with_bars_per_year(mut self, bars_per_year: f64) -> Self {
        self.bars_per_year = bars_per_year;
        self.cache.clear();
        self
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Compute target weights for `window`.
    pub fn optimize(
        &mut self,
        window: &PriceWindow,
        request: &OptimizationRequest,
    ) -> Result<Allocation, OptimizationError> {
        let key = CacheKey {
            window: window.periods(),
            fingerprint: window.fingerprint(),
        };

        let (moments, cache_hit) = match self.cache.get(&key) {
            Some(m) => {
                debug!("moment cache hit for window {} ({:?})", key.window, key.fingerprint);
                (m, true)
            }
            None => {
                let m = estimate_moments(&window.returns(), self.bars_per_year)?;
                (self.cache.insert(key, m), false)
            }
        };

        let solution = self
            .solver
            .solve(&moments.expected_returns, &moments.covariance, &request.constraints())?;
        check_weights(&solution.weights, moments.len())?;

        Ok(build_allocation(
            window,
            &moments,
            solution,
            request.risk_free_rate,
            key.fingerprint,
            cache_hit,
        ))
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

fn check_weights(weights: &[f64], n: usize) -> Result<(), OptimizationError> {
    if weights.len() != n {
        return Err(OptimizationError::InvalidInput(format!(
            "solver returned {} weights for {n} assets",
            weights.len()
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < -1e-12) {
        return Err(OptimizationError::InvalidInput(
            "solver returned negative or non-finite weights".into(),
        ));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(OptimizationError::InvalidInput(format!(
            "solver weights sum to {sum}"
        )));
    }
    Ok(())
}

fn build_allocation(
    window: &PriceWindow,
    moments: &Arc<Moments>,
    solution: Solution,
    risk_free_rate: f64,
    fingerprint: Fingerprint,
    cache_hit: bool,
) -> Allocation {
    let w = &solution.weights;
    let expected_return = solver::dot(w, &moments.expected_returns);
    let variance = solver::dot(w, &solver::mat_vec_mul(&moments.covariance, w));
    let expected_volatility = variance.max(0.0).sqrt();
    let sharpe_ratio = if expected_volatility > 0.0 {
        (expected_return - risk_free_rate) / expected_volatility
    } else {
        0.0
    };

    Allocation {
        weights: window
            .assets()
            .iter()
            .copied()
            .zip(solution.weights.iter().map(|w| w.max(0.0)))
            .collect(),
        expected_return,
        expected_volatility,
        sharpe_ratio,
        objective: solution.objective,
        fingerprint,
        cache_hit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> PriceWindow {
        let assets = vec![Symbol::new("BTC"), Symbol::new("ETH"), Symbol::new("SOL")];
        let rows = (0..20)
            .map(|t| {
                let t = t as f64;
                vec![
                    100.0 * (1.0 + 0.002 * t + 0.01 * (t * 1.1).sin()),
                    50.0 * (1.0 + 0.001 * t + 0.008 * (t * 0.7).cos()),
                    20.0 * (1.0 + 0.0015 * t + 0.012 * (t * 1.9).sin()),
                ]
            })
            .collect();
        PriceWindow::from_rows(assets, (0..20).collect(), rows).unwrap()
    }

    struct Broken;

    impl Solver for Broken {
        fn solve(
            &self,
            expected_returns: &[f64],
            _: &[Vec<f64>],
            _: &Constraints,
        ) -> Result<Solution, OptimizationError> {
            Ok(Solution {
                weights: vec![0.9; expected_returns.len()],
                objective: ObjectiveKind::MaxSharpe,
            })
        }
    }

    #[test]
    fn second_call_is_served_from_cache() {
        let mut opt = Optimizer::new();
        let req = OptimizationRequest::max_sharpe(0.02);

        let first = opt.optimize(&window(), &req).unwrap();
        let second = opt.optimize(&window(), &req).unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.weights, second.weights);
        assert_eq!(opt.cache_stats().hits, 1);
        assert_eq!(opt.cache_stats().misses, 1);
    }

    #[test]
    fn metrics_are_consistent() {
        let mut opt = Optimizer::new();
        let a = opt
            .optimize(&window(), &OptimizationRequest::max_sharpe(0.02))
            .unwrap();
        assert!(a.expected_volatility > 0.0);
        let sharpe = (a.expected_return - 0.02) / a.expected_volatility;
        assert!((sharpe - a.sharpe_ratio).abs() < 1e-12);
        assert_eq!(a.weights.len(), 3);
        assert_eq!(a.weights[0].0, Symbol::new("BTC"));
    }

    #[test]
    fn solver_output_is_checked() {
        let mut opt = Optimizer::with_solver(Box::new(Broken));
        let err = opt
            .optimize(&window(), &OptimizationRequest::max_sharpe(0.0))
            .unwrap_err();
        assert!(matches!(err, OptimizationError::InvalidInput(_)));
    }

    #[test]
    fn singular_window_fails() {
        let assets = vec![Symbol::new("BTC"), Symbol::new("USDC")];
        let rows = (0..12)
            .map(|t| vec![100.0 + (t as f64).sin(), 1.0])
            .collect();
        let w = PriceWindow::from_rows(assets, (0..12).collect(), rows).unwrap();
        let err = Optimizer::new()
            .optimize(&w, &OptimizationRequest::max_sharpe(0.0))
            .unwrap_err();
        assert_eq!(err, OptimizationError::SingularCovariance);
    }
}
