//! Service status surface: lifecycle state, health and cycle history.
//!
//! Readable from any thread through [`StatusHandle`]; optionally mirrored
//! to a JSON file (written to a temp file, then renamed) for the gateway.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use folio::Symbol;
use folio_broker::Position;
use log::warn;
use serde::Serialize;

use crate::audit::RebalanceRecord;

/// Failed-cycle events kept in memory.
pub const FAILURE_HISTORY: usize = 32;

/// Lifecycle state of the rebalancing service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Initializing,
    Running,
    ReloadingConfig,
    ShuttingDown,
    Errored,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::ReloadingConfig => "reloading_config",
            Self::ShuttingDown => "shutting_down",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// The last cycle failed; the service will retry on schedule.
    Degraded,
    NeedsOperator,
}

/// One cycle that did not produce a committed decision.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailedCycle {
    pub at: DateTime<Utc>,
    /// `transport`, `optimization`, `audit`, ...
    pub kind: String,
    pub message: String,
}

/// Summary of the most recent committed decision.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LatestDecision {
    pub timestamp: DateTime<Utc>,
    pub weights: BTreeMap<Symbol, f64>,
    pub expected_return: f64,
    pub expected_volatility: f64,
    pub sharpe_ratio: f64,
}

/// Point-in-time copy of the service status.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: ServiceState,
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub last_rebalance: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub health: Health,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub recent_failures: Vec<FailedCycle>,
    pub latest: Option<LatestDecision>,
    /// Holdings seen by the last successful cycle; in-memory only.
    #[serde(skip)]
    pub positions: Vec<Position>,
}

#[derive(Debug)]
struct ServiceStatus {
    state: ServiceState,
    started_at: Option<DateTime<Utc>>,
    last_rebalance: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_cycle_failed: bool,
    cycles_completed: u64,
    cycles_failed: u64,
    recent_failures: VecDeque<FailedCycle>,
    latest: Option<LatestDecision>,
    positions: Vec<Position>,
    path: Option<PathBuf>,
}

impl ServiceStatus {
    fn health(&self) -> Health {
        match self.state {
            ServiceState::Stopped | ServiceState::Errored => Health::NeedsOperator,
            _ if self.last_cycle_failed => Health::Degraded,
            _ => Health::Healthy,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let uptime_secs = self
            .started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        StatusSnapshot {
            state: self.state,
            pid: std::process::id(),
            started_at: self.started_at,
            uptime_secs,
            last_rebalance: self.last_rebalance,
            last_error: self.last_error.clone(),
            health: self.health(),
            cycles_completed: self.cycles_completed,
            cycles_failed: self.cycles_failed,
            recent_failures: self.recent_failures.iter().cloned().collect(),
            latest: self.latest.clone(),
            positions: self.positions.clone(),
        }
    }
}

/// Shared, cloneable access to the service status.
#[derive(Clone, Debug)]
pub struct StatusHandle {
    inner: Arc<RwLock<ServiceStatus>>,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServiceStatus {
                state: ServiceState::Stopped,
                started_at: None,
                last_rebalance: None,
                last_error: None,
                last_cycle_failed: false,
                cycles_completed: 0,
                cycles_failed: 0,
                recent_failures: VecDeque::with_capacity(FAILURE_HISTORY),
                latest: None,
                positions: Vec::new(),
                path: None,
            })),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn state(&self) -> ServiceState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Apply `f` under the write lock, then mirror to the status file.
    fn update<F: FnOnce(&mut ServiceStatus)>(&self, f: F) {
        let (snapshot, path) = {
            let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut status);
            (status.snapshot(), status.path.clone())
        };
        if let Some(path) = path {
            if let Err(e) = write_status_file(&path, &snapshot) {
                warn!("failed to write status file {}: {e}", path.display());
            }
        }
    }

    pub fn set_path(&self, path: Option<PathBuf>) {
        self.update(|s| s.path = path);
    }

    pub fn set_state(&self, state: ServiceState) {
        self.update(|s| {
            if state == ServiceState::Initializing {
                s.started_at = Some(Utc::now());
            }
            s.state = state;
        });
    }

    /// A cycle committed `record`.
    pub fn record_success(&self, record: &RebalanceRecord, positions: Vec<Position>) {
        self.update(|s| {
            s.cycles_completed += 1;
            s.last_rebalance = Some(record.timestamp);
            s.last_cycle_failed = false;
            s.latest = Some(LatestDecision {
                timestamp: record.timestamp,
                weights: record.weights.clone(),
                expected_return: record.expected_return,
                expected_volatility: record.expected_volatility,
                sharpe_ratio: record.sharpe_ratio,
            });
            s.positions = positions;
        });
    }

    /// A cycle ended without a committed decision.
    pub fn record_failure(&self, kind: &str, message: String) {
        self.update(|s| {
            s.cycles_failed += 1;
            s.last_cycle_failed = true;
            s.last_error = Some(message.clone());
            if s.recent_failures.len() == FAILURE_HISTORY {
                s.recent_failures.pop_front();
            }
            s.recent_failures.push_back(FailedCycle {
                at: Utc::now(),
                kind: kind.to_string(),
                message,
            });
        });
    }

    /// An error outside any cycle (e.g. a rejected reload).
    pub fn report_error(&self, message: String) {
        self.update(|s| s.last_error = Some(message));
    }
}

/// Write `snapshot` as JSON to `path` via a sibling temp file and rename.
pub fn write_status_file(path: &Path, snapshot: &StatusSnapshot) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio::ObjectiveKind;

    fn record() -> RebalanceRecord {
        RebalanceRecord {
            timestamp: Utc::now(),
            weights: [(Symbol::new("BTC"), 1.0)].into_iter().collect(),
            expected_return: 0.1,
            expected_volatility: 0.2,
            sharpe_ratio: 0.4,
            objective: ObjectiveKind::MaxSharpe,
            target_sharpe: None,
            execution_time_ms: 1.0,
            input_data_hash: String::new(),
            config_hash: String::new(),
            previous_record_hash: String::new(),
        }
    }

    #[test]
    fn health_follows_state_and_last_cycle() {
        let status = StatusHandle::new();
        assert_eq!(status.snapshot().health, Health::NeedsOperator);

        status.set_state(ServiceState::Running);
        assert_eq!(status.snapshot().health, Health::Healthy);

        status.record_failure("transport", "timeout".into());
        let snap = status.snapshot();
        assert_eq!(snap.health, Health::Degraded);
        assert_eq!(snap.last_error.as_deref(), Some("timeout"));

        status.record_success(&record(), Vec::new());
        assert_eq!(status.snapshot().health, Health::Healthy);

        status.set_state(ServiceState::Errored);
        assert_eq!(status.snapshot().health, Health::NeedsOperator);
    }

    #[test]
    fn failure_history_is_bounded() {
        let status = StatusHandle::new();
        for i in 0..(FAILURE_HISTORY + 5) {
            status.record_failure("optimization", format!("failure {i}"));
        }
        let snap = status.snapshot();
        assert_eq!(snap.cycles_failed, (FAILURE_HISTORY + 5) as u64);
        assert_eq!(snap.recent_failures.len(), FAILURE_HISTORY);
        assert_eq!(snap.recent_failures[0].message, "failure 5");
    }

    #[test]
    fn success_updates_latest() {
        let status = StatusHandle::new();
        let rec = record();
        status.record_success(&rec, Vec::new());
        let snap = status.snapshot();
        assert_eq!(snap.cycles_completed, 1);
        assert_eq!(snap.last_rebalance, Some(rec.timestamp));
        assert_eq!(snap.latest.unwrap().weights, rec.weights);
    }

    #[test]
    fn status_file_mirrors_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("status.json");
        let status = StatusHandle::new();
        status.set_path(Some(path.clone()));
        status.set_state(ServiceState::Initializing);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["state"], "initializing");
        assert_eq!(json["pid"], std::process::id());
        assert!(json.get("positions").is_none());
        assert!(!dir.path().join("run").join("status.json.tmp").exists());
    }
}
