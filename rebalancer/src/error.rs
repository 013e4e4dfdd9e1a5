//! Error types for the rebalancer.

use std::path::PathBuf;

use folio::OptimizationError;
use folio_broker::TransportError;

/// Config loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Audit log failures.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit chain broken at {path}:{line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl AuditError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// All errors that can occur during rebalancer operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    #[error("audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error("fatal service error: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the service must stop rather than skip a cycle.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Fatal(_) => true,
            Error::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Short category tag for failed-cycle reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Transport(_) => "transport",
            Error::Optimization(_) => "optimization",
            Error::Audit(_) => "audit",
            Error::Fatal(_) => "fatal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
