//! # folio
//!
//! Numerical core of a periodic portfolio rebalancer: a bounded rolling
//! price history, deterministic data fingerprints, annualized moment
//! estimation, and a constrained max-Sharpe / target-Sharpe solver with a
//! memoized moment cache.
//!
//! ## Features
//!
//! - **Bounded history**: per-symbol FIFO series, stale points ignored
//! - **Aligned windows**: optimizer input is an owned copy, never a live view
//! - **Deterministic solves**: no randomness, bit-reproducible weights
//! - **Memoized moments**: `(window, fingerprint)` LRU arena cache
//!
//! ## Quick Start
//!
//! ```
//! use folio::{OptimizationRequest, Optimizer, PriceHistory, PricePoint, Symbol};
//!
//! let btc = Symbol::new("BTC");
//! let eth = Symbol::new("ETH");
//!
//! let mut history = PriceHistory::new(100);
//! for t in 0..30_i64 {
//!     let x = t as f64;
//!     history.append(PricePoint::new(t, btc, 100.0 + x + (x * 1.3).sin()).unwrap());
//!     history.append(PricePoint::new(t, eth, 50.0 + 0.3 * x + (x * 0.4).cos()).unwrap());
//! }
//!
//! // Most recent 10 aligned observations for both assets.
//! let window = history.window(&[btc, eth], 10).unwrap();
//!
//! let mut optimizer = Optimizer::new();
//! let allocation = optimizer
//!     .optimize(&window, &OptimizationRequest::max_sharpe(0.02))
//!     .unwrap();
//!
//! assert_eq!(allocation.weights.len(), 2);
//! assert!(allocation.weights.iter().all(|(_, w)| *w >= 0.0));
//! ```
//!
//! ## Capacity
//!
//! Appending beyond capacity evicts the oldest point of that symbol:
//!
//! ```
//! use folio::{PriceHistory, PricePoint, Symbol};
//!
//! let btc = Symbol::new("BTC");
//! let mut history = PriceHistory::new(2);
//! for t in 0..3 {
//!     history.append(PricePoint::new(t, btc, 1.0).unwrap());
//! }
//! assert_eq!(history.len(&btc), 2);
//! assert_eq!(history.series(&btc).next().unwrap().timestamp(), 1);
//! ```

mod error;
pub mod fingerprint;
pub mod history;
pub mod optimize;
mod types;

// Re-export public API
pub use error::OptimizationError;
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use history::{DEFAULT_HISTORY_LIMIT, PriceHistory, PricePoint, PriceWindow};
pub use optimize::{
    Allocation, BARS_PER_YEAR, CacheStats, Constraints, ObjectiveKind, OptimizationRequest,
    Optimizer, ProjectedGradientSolver, Solution, Solver,
};
pub use types::{MAX_SYMBOL_LEN, Symbol, Timestamp};
