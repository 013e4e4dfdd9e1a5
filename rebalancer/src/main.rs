//! CLI entry point for the folio rebalancing service.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};

use folio_broker::{ApiSettings, MarketApi, MockApi, SecureApiClient};
use folio_rebalancer::audit::verify_chain;
use folio_rebalancer::config::Config;
use folio_rebalancer::error::Error;
use folio_rebalancer::service::{CycleOutcome, RebalanceService};

/// Seed for the offline synthetic market.
const SYNTHETIC_SEED: u64 = 7;

#[derive(Parser)]
#[command(name = "folio-rebalancer")]
#[command(about = "Periodic max-Sharpe portfolio rebalancer with a hash-chained audit log")]
#[command(version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Use synthetic market data instead of the trading API; disables hot reload
    #[arg(long, global = true)]
    test_mode: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebalance every interval until Ctrl-C
    Run,

    /// Run a single cycle and print the committed record
    Once,

    /// Walk the audit chain and report the first broken link
    VerifyAudit {
        /// Audit base path (defaults to `audit_log_path` from the config)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Load and validate the config, then print its fingerprint
    CheckConfig,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let test_mode = cli.test_mode || env_flag("PORTFOLIO_TEST_MODE");

    let result = match cli.command {
        Command::Run => with_runtime(|| run(&cli.config, test_mode)),
        Command::Once => with_runtime(|| once(&cli.config, test_mode)),
        Command::VerifyAudit { path } => verify_audit(&cli.config, path, test_mode),
        Command::CheckConfig => check_config(&cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        let fatal = e.downcast_ref::<Error>().is_some_and(Error::is_fatal);
        process::exit(if fatal { 2 } else { 1 });
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
}

fn with_runtime<F, Fut>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(f())
}

fn load_config(path: &Path, test_mode: bool) -> anyhow::Result<Config> {
    if test_mode && !path.exists() {
        warn!("{} not found; using built-in defaults", path.display());
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

fn connect() -> anyhow::Result<Arc<SecureApiClient>> {
    let settings = ApiSettings::from_env().context("reading API settings")?;
    let client = SecureApiClient::connect(&settings).context("building API client")?;
    info!("trading API client ready for {}", settings.base_url);
    Ok(Arc::new(client))
}

async fn run(config_path: &Path, test_mode: bool) -> anyhow::Result<()> {
    let config = load_config(config_path, test_mode)?;
    if test_mode {
        info!("test mode: synthetic market data, config watcher disabled");
        let api = Arc::new(MockApi::synthetic(SYNTHETIC_SEED));
        serve(RebalanceService::new(config, api).with_config_path(config_path)).await
    } else {
        let service = RebalanceService::new(config, connect()?)
            .with_config_path(config_path)
            .with_watcher(true);
        serve(service).await
    }
}

async fn serve<A: MarketApi>(service: RebalanceService<A>) -> anyhow::Result<()> {
    let handle = service.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.stop();
        }
    });
    service.run().await?;
    Ok(())
}

async fn once(config_path: &Path, test_mode: bool) -> anyhow::Result<()> {
    let config = load_config(config_path, test_mode)?;
    if test_mode {
        let api = Arc::new(MockApi::synthetic(SYNTHETIC_SEED));
        single_cycle(RebalanceService::new(config, api)).await
    } else {
        single_cycle(RebalanceService::new(config, connect()?)).await
    }
}

async fn single_cycle<A: MarketApi>(mut service: RebalanceService<A>) -> anyhow::Result<()> {
    let outcome = service.run_once().await?;
    service.close();
    match outcome {
        CycleOutcome::Committed { record, hash } => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            println!("hash: {hash}");
            Ok(())
        }
        CycleOutcome::Failed(f) => bail!("cycle failed ({}): {}", f.kind, f.message),
    }
}

fn verify_audit(config_path: &Path, path: Option<PathBuf>, test_mode: bool) -> anyhow::Result<()> {
    let base = match path {
        Some(p) => p,
        None => load_config(config_path, test_mode)?.audit_path(),
    };
    let report = verify_chain(&base)
        .with_context(|| format!("verifying audit chain at {}", base.display()))?;
    println!(
        "audit chain OK: {} records in {} files, head {}",
        report.records, report.files, report.head
    );
    Ok(())
}

fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    println!("config OK: {}", config_path.display());
    let assets: Vec<&str> = config.assets.iter().map(|s| s.as_str()).collect();
    println!("  assets:      {}", assets.join(", "));
    println!("  interval:    {}s", config.rebalance_interval_secs);
    println!("  window:      {} periods", config.rolling_window_periods);
    println!("  fingerprint: {}", config.fingerprint());
    Ok(())
}
