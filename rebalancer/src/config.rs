//! TOML configuration loading, environment overrides and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use folio::{DEFAULT_HISTORY_LIMIT, OptimizationRequest, Symbol};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// Tunable service parameters. Replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_assets")]
    pub assets: Vec<Symbol>,
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
    #[serde(default = "default_interval")]
    pub rebalance_interval_secs: u64,
    #[serde(default = "default_window")]
    pub rolling_window_periods: usize,
    #[serde(default)]
    pub target_sharpe: Option<f64>,
    #[serde(default = "default_price_endpoint")]
    pub price_endpoint: String,
    #[serde(default = "default_position_endpoint")]
    pub position_endpoint: String,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,
    #[serde(default)]
    pub min_weight_per_asset: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight_per_asset: f64,
    #[serde(default = "default_history_limit")]
    pub price_history_limit: usize,
    #[serde(default)]
    pub status_path: Option<String>,
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_assets() -> Vec<Symbol> {
    ["BTC", "ETH", "ADA", "SOL"].into_iter().map(Symbol::new).collect()
}
fn default_risk_free_rate() -> f64 {
    0.02
}
fn default_interval() -> u64 {
    300
}
fn default_window() -> usize {
    60
}
fn default_price_endpoint() -> String {
    "/prices".into()
}
fn default_position_endpoint() -> String {
    "/positions".into()
}
fn default_audit_log_path() -> String {
    "logs/audit.jsonl".into()
}
fn default_max_weight() -> f64 {
    1.0
}
fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
fn default_grace() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assets: default_assets(),
            risk_free_rate: default_risk_free_rate(),
            rebalance_interval_secs: default_interval(),
            rolling_window_periods: default_window(),
            target_sharpe: None,
            price_endpoint: default_price_endpoint(),
            position_endpoint: default_position_endpoint(),
            audit_log_path: default_audit_log_path(),
            min_weight_per_asset: 0.0,
            max_weight_per_asset: default_max_weight(),
            price_history_limit: default_history_limit(),
            status_path: None,
            shutdown_grace_secs: default_grace(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, applying `PORTFOLIO_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`] with an explicit variable lookup.
    pub fn load_with_env<F>(path: &Path, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("PORTFOLIO_ASSETS") {
            self.assets = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Symbol::try_new(s)
                        .ok_or_else(|| ConfigError::invalid("assets", format!("bad symbol {s:?}")))
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = env("PORTFOLIO_RISK_FREE_RATE") {
            self.risk_free_rate = parse_env("risk_free_rate", &v)?;
        }
        if let Some(v) = env("PORTFOLIO_REBALANCE_INTERVAL") {
            self.rebalance_interval_secs = parse_env("rebalance_interval_secs", &v)?;
        }
        if let Some(v) = env("PORTFOLIO_ROLLING_WINDOW") {
            self.rolling_window_periods = parse_env("rolling_window_periods", &v)?;
        }
        if let Some(v) = env("PORTFOLIO_TARGET_SHARPE") {
            self.target_sharpe = match v.trim() {
                "" | "none" => None,
                s => Some(parse_env("target_sharpe", s)?),
            };
        }
        if let Some(v) = env("PORTFOLIO_AUDIT_LOG_PATH") {
            self.audit_log_path = v;
        }
        Ok(())
    }

    /// Check ranges and cross-field relationships.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.assets.is_empty() {
            return Err(ConfigError::invalid("assets", "assets list cannot be empty"));
        }
        let mut seen = FxHashSet::default();
        let dups: Vec<&str> = self
            .assets
            .iter()
            .filter(|s| !seen.insert(**s))
            .map(Symbol::as_str)
            .collect();
        if !dups.is_empty() {
            return Err(ConfigError::invalid(
                "assets",
                format!("duplicate asset symbols found: {}", dups.join(", ")),
            ));
        }

        if !(0.0..=1.0).contains(&self.risk_free_rate) {
            return Err(ConfigError::invalid(
                "risk_free_rate",
                "risk_free_rate must be between 0 and 1",
            ));
        }
        if self.rebalance_interval_secs < 60 {
            return Err(ConfigError::invalid(
                "rebalance_interval_secs",
                "must be at least 60",
            ));
        }
        if self.rolling_window_periods < 10 {
            return Err(ConfigError::invalid(
                "rolling_window_periods",
                "must be at least 10",
            ));
        }
        if let Some(target) = self.target_sharpe {
            if !(0.0..=10.0).contains(&target) {
                return Err(ConfigError::invalid("target_sharpe", "must be in [0, 10]"));
            }
            if self.risk_free_rate >= 1.0 {
                return Err(ConfigError::invalid(
                    "target_sharpe",
                    "requires risk_free_rate below 1",
                ));
            }
        }

        let (lo, hi) = (self.min_weight_per_asset, self.max_weight_per_asset);
        if !(0.0..=1.0).contains(&lo) {
            return Err(ConfigError::invalid("min_weight_per_asset", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&hi) {
            return Err(ConfigError::invalid("max_weight_per_asset", "must be in [0, 1]"));
        }
        if lo >= hi {
            return Err(ConfigError::invalid(
                "min_weight_per_asset",
                "min_weight_per_asset must be less than max_weight_per_asset",
            ));
        }
        let n = self.assets.len() as f64;
        if n * lo > 1.0 {
            return Err(ConfigError::invalid(
                "min_weight_per_asset",
                format!("{} assets at {lo} exceed a fully invested portfolio", self.assets.len()),
            ));
        }
        if n * hi < 1.0 {
            return Err(ConfigError::invalid(
                "max_weight_per_asset",
                format!("{} assets at {hi} cannot reach a fully invested portfolio", self.assets.len()),
            ));
        }

        if self.price_history_limit < self.rolling_window_periods {
            return Err(ConfigError::invalid(
                "price_history_limit",
                "must be at least rolling_window_periods",
            ));
        }
        for (field, endpoint) in [
            ("price_endpoint", &self.price_endpoint),
            ("position_endpoint", &self.position_endpoint),
        ] {
            if !endpoint.starts_with('/') {
                return Err(ConfigError::invalid(field, "must be a path starting with '/'"));
            }
        }
        if self.audit_log_path.trim().is_empty() {
            return Err(ConfigError::invalid("audit_log_path", "must not be empty"));
        }
        Ok(())
    }

    /// SHA-256 hex of the canonical JSON form (field order is fixed by the struct).
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).expect("config serializes to JSON");
        hex::encode(Sha256::digest(json))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn audit_path(&self) -> PathBuf {
        PathBuf::from(&self.audit_log_path)
    }

    pub fn optimization_request(&self) -> OptimizationRequest {
        OptimizationRequest::max_sharpe(self.risk_free_rate)
            .with_target_sharpe(self.target_sharpe)
            .with_bounds(self.min_weight_per_asset, self.max_weight_per_asset)
    }
}

fn parse_env<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("cannot parse {value:?}")))
}
