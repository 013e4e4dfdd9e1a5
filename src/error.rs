//! Optimization errors.

/// Errors returned by the estimation and solve steps of the optimizer.
///
/// None of these are fatal to the service: a failed optimization skips the
/// cycle and scheduling continues.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum OptimizationError {
    /// Fewer aligned observations than the rolling window requires.
    #[error("insufficient data: {available} aligned observations, {required} required")]
    InsufficientData { available: usize, required: usize },

    /// The covariance matrix is not positive definite.
    #[error("covariance matrix is singular")]
    SingularCovariance,

    /// No portfolio reaches the requested Sharpe ratio.
    #[error("target Sharpe {target} is infeasible (best achievable {best:.4})")]
    Infeasible { target: f64, best: f64 },

    /// Inputs with mismatched dimensions or non-finite values.
    #[error("invalid optimizer input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = OptimizationError::InsufficientData {
            available: 4,
            required: 10,
        };
        assert_eq!(
            err.to_string(),
            "insufficient data: 4 aligned observations, 10 required"
        );
        let err = OptimizationError::Infeasible {
            target: 3.0,
            best: 1.23456,
        };
        assert_eq!(
            err.to_string(),
            "target Sharpe 3 is infeasible (best achievable 1.2346)"
        );
    }

    #[test]
    fn is_error() {
        let err: Box<dyn std::error::Error> = Box::new(OptimizationError::SingularCovariance);
        assert!(err.to_string().contains("singular"));
    }
}
