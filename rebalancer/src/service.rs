//! Rebalance scheduler: runs one cycle per interval and owns the service
//! lifecycle.
//!
//! A cycle fetches positions and prices concurrently, appends the prices
//! to the rolling history, optimizes on a blocking worker and commits the
//! decision to the audit log. Control messages (stop, reload) arrive on a
//! channel; reloads are applied between cycles, never during one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use folio::{OptimizationError, Optimizer, PriceHistory};
use folio_broker::{MarketApi, Position, RetryPolicy, with_retry};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::audit::{AuditLogger, RebalanceRecord};
use crate::config::Config;
use crate::error::{ConfigError, Error, Result};
use crate::status::{FailedCycle, ServiceState, StatusHandle, StatusSnapshot};
use crate::watcher::{ConfigWatcher, DEFAULT_DEBOUNCE};

#[derive(Debug)]
enum Command {
    Reload(Box<std::result::Result<Config, ConfigError>>),
    ReloadFromDisk,
    Stop,
}

/// Cloneable control surface for a running service.
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<Command>,
    status: StatusHandle,
}

impl ServiceHandle {
    /// Request a graceful shutdown.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Re-read the config file. Applied after any in-flight cycle.
    pub fn trigger_reload(&self) {
        self.send(Command::ReloadFromDisk);
    }

    /// Replace the config with `config` after any in-flight cycle.
    pub fn submit_reload(&self, config: Config) -> std::result::Result<(), ConfigError> {
        config.validate()?;
        self.send(Command::Reload(Box::new(Ok(config))));
        Ok(())
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            debug!("service already stopped; command dropped");
        }
    }
}

/// Result of one cycle that did not hit a fatal error.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Committed {
        record: RebalanceRecord,
        hash: String,
    },
    Failed(FailedCycle),
}

struct Committed {
    record: RebalanceRecord,
    hash: String,
    positions: Vec<Position>,
}

enum PendingReload {
    Ready(std::result::Result<Config, ConfigError>),
    FromDisk,
}

/// Cycle state owned by the scheduler task.
struct Engine<A> {
    config: Arc<Config>,
    config_hash: String,
    api: Arc<A>,
    history: PriceHistory,
    optimizer: Option<Optimizer>,
    audit: Option<AuditLogger>,
    status: StatusHandle,
    retry: RetryPolicy,
}

impl<A: MarketApi> Engine<A> {
    async fn prime_history(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);
        let api = &*self.api;
        match with_retry(&self.retry, "price priming", || {
            api.fetch_price_data(&config.price_endpoint, &config.assets)
        })
        .await
        {
            Ok(data) => {
                let added: usize = data
                    .into_values()
                    .map(|series| self.history.extend(series))
                    .sum();
                info!("primed price history with {added} points");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("price history priming failed: {e}");
                Ok(())
            }
        }
    }

    async fn cycle(&mut self) -> Result<Committed> {
        let started = Instant::now();
        let config = Arc::clone(&self.config);
        let config_hash = self.config_hash.clone();
        let api = &*self.api;

        let (positions, prices) = tokio::join!(
            with_retry(&self.retry, "position fetch", || {
                api.fetch_positions(&config.position_endpoint)
            }),
            with_retry(&self.retry, "price fetch", || {
                api.fetch_price_data(&config.price_endpoint, &config.assets)
            }),
        );
        let (positions, prices) = match (positions, prices) {
            (Ok(p), Ok(d)) => (p, d),
            (Err(a), Err(b)) => return Err(if b.is_fatal() { b } else { a }.into()),
            (Err(e), _) | (_, Err(e)) => return Err(e.into()),
        };

        for series in prices.into_values() {
            self.history.extend(series);
        }
        let window = self
            .history
            .window(&config.assets, config.rolling_window_periods)?;
        let request = config.optimization_request();

        let mut optimizer = self.optimizer.take().unwrap_or_default();
        let (optimizer, allocation) = tokio::task::spawn_blocking(move || {
            let allocation = optimizer.optimize(&window, &request);
            (optimizer, allocation)
        })
        .await
        .map_err(|e| OptimizationError::InvalidInput(format!("optimizer task failed: {e}")))?;
        self.optimizer = Some(optimizer);
        let allocation = allocation?;

        let mut record = RebalanceRecord {
            timestamp: Utc::now(),
            weights: allocation.weights.iter().copied().collect(),
            expected_return: allocation.expected_return,
            expected_volatility: allocation.expected_volatility,
            sharpe_ratio: allocation.sharpe_ratio,
            objective: allocation.objective,
            target_sharpe: config.target_sharpe,
            execution_time_ms: started.elapsed().as_secs_f64() * 1e3,
            input_data_hash: allocation.fingerprint.to_hex(),
            config_hash,
            previous_record_hash: String::new(),
        };

        let audit = match self.audit.as_mut() {
            Some(a) => a,
            None => return Err(Error::Fatal("audit logger not open".into())),
        };
        let hash = audit.log_rebalance_decision(&mut record)?;

        Ok(Committed {
            record,
            hash,
            positions,
        })
    }

    /// Report a finished cycle. Fatal errors are passed back up.
    fn record_outcome(&self, result: Result<Committed>) -> Result<CycleOutcome> {
        match result {
            Ok(c) => {
                info!(
                    "rebalance committed: sharpe {:.3}, return {:.4}, volatility {:.4}, {} ({:.1} ms)",
                    c.record.sharpe_ratio,
                    c.record.expected_return,
                    c.record.expected_volatility,
                    &c.hash[..12],
                    c.record.execution_time_ms
                );
                self.status.record_success(&c.record, c.positions);
                Ok(CycleOutcome::Committed {
                    record: c.record,
                    hash: c.hash,
                })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("rebalance cycle failed ({}): {e}", e.kind());
                self.status.record_failure(e.kind(), e.to_string());
                Ok(CycleOutcome::Failed(FailedCycle {
                    at: Utc::now(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }))
            }
        }
    }

    /// Swap in `new`, reopening the audit log if its path changed.
    fn swap_config(&mut self, new: Config) -> Result<()> {
        new.validate()?;
        if self.audit.is_some() && new.audit_log_path != self.config.audit_log_path {
            let logger = AuditLogger::open(&new.audit_path())?;
            if let Some(mut old) = self.audit.replace(logger) {
                if let Err(e) = old.close() {
                    warn!("closing previous audit log: {e}");
                }
            }
        }
        self.history.set_capacity(new.price_history_limit);
        self.history.retain_symbols(&new.assets);
        self.status.set_path(new.status_path.as_ref().map(PathBuf::from));

        let hash = new.fingerprint();
        info!(
            "config reloaded: {} -> {}",
            &self.config_hash[..12],
            &hash[..12]
        );
        self.config_hash = hash;
        self.config = Arc::new(new);
        Ok(())
    }

    fn close(&mut self) {
        self.api.close();
        if let Some(mut audit) = self.audit.take() {
            if let Err(e) = audit.close() {
                warn!("closing audit log: {e}");
            }
        }
    }
}

/// Periodic rebalancing service over a [`MarketApi`].
pub struct RebalanceService<A> {
    engine: Engine<A>,
    commands: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    config_path: Option<PathBuf>,
    watch: bool,
    initialized: bool,
}

impl<A: MarketApi> RebalanceService<A> {
    pub fn new(config: Config, api: Arc<A>) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let config_hash = config.fingerprint();
        let history = PriceHistory::new(config.price_history_limit);
        Self {
            engine: Engine {
                config: Arc::new(config),
                config_hash,
                api,
                history,
                optimizer: Some(Optimizer::new()),
                audit: None,
                status: StatusHandle::new(),
                retry: RetryPolicy::default(),
            },
            commands,
            tx,
            config_path: None,
            watch: false,
            initialized: false,
        }
    }

    /// File that [`ServiceHandle::trigger_reload`] and the watcher read.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Watch the config file while running (off by default and in test mode).
    pub fn with_watcher(mut self, enabled: bool) -> Self {
        self.watch = enabled;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.engine.retry = policy;
        self
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            tx: self.tx.clone(),
            status: self.engine.status.clone(),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.engine.status.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.engine.config)
    }

    async fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let status = self.engine.status.clone();
        status.set_path(self.engine.config.status_path.as_ref().map(PathBuf::from));
        status.set_state(ServiceState::Initializing);
        info!(
            "initializing: {} assets, window {}, interval {}s",
            self.engine.config.assets.len(),
            self.engine.config.rolling_window_periods,
            self.engine.config.rebalance_interval_secs
        );

        let result: Result<()> = async {
            self.engine.audit = Some(AuditLogger::open(&self.engine.config.audit_path())?);
            self.engine.prime_history().await
        }
        .await;
        if let Err(e) = result {
            self.fail(&e);
            return Err(e);
        }

        self.initialized = true;
        status.set_state(ServiceState::Running);
        Ok(())
    }

    fn fail(&mut self, e: &Error) {
        error!("fatal service error: {e}");
        self.engine.close();
        self.engine.status.report_error(e.to_string());
        self.engine.status.set_state(ServiceState::Errored);
    }

    /// Run exactly one cycle (initializing first if needed).
    pub async fn run_once(&mut self) -> Result<CycleOutcome> {
        self.initialize().await?;
        let result = self.engine.cycle().await;
        match self.engine.record_outcome(result) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Release the API client and audit log and enter `Stopped`.
    pub fn close(&mut self) {
        let status = self.engine.status.clone();
        if status.state() != ServiceState::Errored {
            status.set_state(ServiceState::ShuttingDown);
        }
        self.engine.close();
        if status.state() != ServiceState::Errored {
            status.set_state(ServiceState::Stopped);
            info!("service stopped");
        }
    }

    /// Run cycles until stopped or a fatal error occurs.
    pub async fn run(mut self) -> Result<()> {
        self.initialize().await?;
        let _watcher = self.start_watcher();

        match self.run_loop().await {
            Ok(()) => {
                self.close();
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn start_watcher(&self) -> Option<ConfigWatcher> {
        let path = self.config_path.as_ref().filter(|_| self.watch)?;
        let tx = self.tx.clone();
        match ConfigWatcher::spawn(path, DEFAULT_DEBOUNCE, move |res| {
            let _ = tx.send(Command::Reload(Box::new(res)));
        }) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("config watcher unavailable, hot reload disabled: {e}");
                None
            }
        }
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let status = self.engine.status.clone();
            let grace = self.engine.config.shutdown_grace();
            let mut pending = None;

            let (result, stopping) = {
                let cycle = self.engine.cycle();
                tokio::pin!(cycle);

                let interrupted = loop {
                    tokio::select! {
                        res = &mut cycle => break Ok(res),
                        cmd = self.commands.recv() => match cmd {
                            Some(Command::Reload(r)) => pending = Some(PendingReload::Ready(*r)),
                            Some(Command::ReloadFromDisk) => pending = Some(PendingReload::FromDisk),
                            Some(Command::Stop) | None => break Err(()),
                        },
                    }
                };

                match interrupted {
                    Ok(res) => (Some(res), false),
                    Err(()) => {
                        status.set_state(ServiceState::ShuttingDown);
                        info!("stop requested; allowing {grace:?} for the in-flight cycle");
                        match tokio::time::timeout(grace, &mut cycle).await {
                            Ok(res) => (Some(res), true),
                            Err(_) => {
                                warn!("in-flight cycle aborted after {grace:?}");
                                (None, true)
                            }
                        }
                    }
                }
            };

            if let Some(res) = result {
                self.engine.record_outcome(res)?;
            }
            if stopping {
                return Ok(());
            }
            if let Some(reload) = pending {
                debug!("applying reload held during cycle");
                if self.apply_reload(reload) {
                    continue;
                }
            }

            // Only an applied reload cuts the sleep short.
            let sleep = tokio::time::sleep(self.engine.config.interval());
            tokio::pin!(sleep);
            loop {
                let reloaded = tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.commands.recv() => match cmd {
                        Some(Command::Reload(r)) => self.apply_reload(PendingReload::Ready(*r)),
                        Some(Command::ReloadFromDisk) => self.apply_reload(PendingReload::FromDisk),
                        Some(Command::Stop) | None => {
                            self.engine.status.set_state(ServiceState::ShuttingDown);
                            return Ok(());
                        }
                    },
                };
                if reloaded {
                    break;
                }
            }
        }
    }

    /// Returns whether the new config is now active.
    fn apply_reload(&mut self, reload: PendingReload) -> bool {
        let loaded = match reload {
            PendingReload::Ready(r) => r,
            PendingReload::FromDisk => load_from(self.config_path.as_deref()),
        };
        let status = self.engine.status.clone();
        let result = loaded
            .map_err(Error::from)
            .and_then(|config| {
                status.set_state(ServiceState::ReloadingConfig);
                let swapped = self.engine.swap_config(config);
                status.set_state(ServiceState::Running);
                swapped
            });
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("config reload rejected, keeping previous config: {e}");
                status.report_error(format!("config reload rejected: {e}"));
                false
            }
        }
    }
}

fn load_from(path: Option<&Path>) -> std::result::Result<Config, ConfigError> {
    match path {
        Some(p) => Config::load(p),
        None => Err(ConfigError::invalid(
            "config_path",
            "service was started without a config file",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_broker::{MockApi, TransportError};

    fn config(dir: &tempfile::TempDir) -> Config {
        Config {
            assets: vec![folio::Symbol::new("BTC"), folio::Symbol::new("ETH")],
            rolling_window_periods: 10,
            audit_log_path: dir.path().join("audit.jsonl").display().to_string(),
            ..Config::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_commits_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = RebalanceService::new(config(&dir), Arc::new(MockApi::synthetic(1)));

        let outcome = service.run_once().await.unwrap();
        let CycleOutcome::Committed { record, hash } = outcome else {
            panic!("expected a committed cycle, got {outcome:?}");
        };
        let total: f64 = record.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(record.previous_record_hash, crate::audit::GENESIS_HASH);
        assert_eq!(hash.len(), 64);

        let snap = service.status().snapshot();
        assert_eq!(snap.state, ServiceState::Running);
        assert_eq!(snap.cycles_completed, 1);

        service.close();
        assert_eq!(service.status().state(), ServiceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_history_is_a_failed_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockApi::builder().build();
        let mut service = RebalanceService::new(config(&dir), Arc::new(api));

        let outcome = service.run_once().await.unwrap();
        match outcome {
            CycleOutcome::Failed(f) => assert_eq!(f.kind, "optimization"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(service.status().snapshot().cycles_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_priming_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockApi::builder()
            .synthetic(1)
            .fail_prices(1, TransportError::Unauthorized(401))
            .build();
        let mut service = RebalanceService::new(config(&dir), Arc::new(api));

        let err = service.run_once().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(service.status().state(), ServiceState::Errored);
    }

    #[test]
    fn submit_reload_validates_first() {
        let dir = tempfile::tempdir().unwrap();
        let service = RebalanceService::new(config(&dir), Arc::new(MockApi::synthetic(1)));
        let mut bad = config(&dir);
        bad.assets.clear();
        assert!(service.handle().submit_reload(bad).is_err());
    }
}
