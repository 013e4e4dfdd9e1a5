//! folio-rebalancer: periodic portfolio rebalancing service.
//!
//! Every interval the service pulls positions and prices from the market
//! API, extends a bounded rolling price history, solves for max-Sharpe (or
//! minimum-volatility at a target Sharpe) weights and appends the decision
//! to a SHA-256 hash-chained audit log. Config changes on disk are picked
//! up between cycles without a restart.

pub mod audit;
pub mod config;
pub mod error;
pub mod service;
pub mod status;
pub mod watcher;

pub use audit::{AuditLogger, ChainReport, GENESIS_HASH, RebalanceRecord, verify_chain};
pub use config::Config;
pub use error::{AuditError, ConfigError, Error, Result};
pub use service::{CycleOutcome, RebalanceService, ServiceHandle};
pub use status::{Health, ServiceState, StatusHandle, StatusSnapshot};
