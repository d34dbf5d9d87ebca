//! hashrent-ledgerd - runs the accrual sweep against a snapshot-backed ledger
//!
//! Loads configuration, the tier catalog and the last store snapshot, then
//! sweeps active contracts on the configured interval until Ctrl-C. The
//! snapshot is written after every sweep and once more on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use hashrent_ledger::catalog::Catalog;
use hashrent_ledger::clock::{SystemClock, TimeSource};
use hashrent_ledger::oracle::{CachedPriceOracle, HttpPriceOracle};
use hashrent_ledger::{AccrualWorker, LedgerBuilder, LedgerConfig, Store};

#[derive(Parser)]
#[command(name = "hashrent-ledgerd")]
#[command(about = "Balance ledger and reward accrual daemon")]
struct Cli {
    /// TOML config file. Without it, defaults plus HASHRENT_* env overrides
    #[arg(long, env = "HASHRENT_CONFIG")]
    config: Option<PathBuf>,

    /// Tier catalog (TOML or JSON), overrides `catalog_path`
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Store snapshot file, overrides `snapshot_path`
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

#[cfg(feature = "trace")]
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("HASHRENT_LOG_JSON")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

#[cfg(not(feature = "trace"))]
fn init_tracing() {}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LedgerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LedgerConfig::from_env().context("reading config from environment")?,
    };
    if cli.catalog.is_some() {
        config.catalog_path = cli.catalog;
    }
    if cli.snapshot.is_some() {
        config.snapshot_path = cli.snapshot;
    }

    let clock: Arc<dyn TimeSource> = Arc::new(SystemClock);

    let catalog = match &config.catalog_path {
        Some(path) => Catalog::load(path)
            .with_context(|| format!("loading catalog {}", path.display()))?,
        None => {
            tracing::warn!("No catalog configured, deposit matching will find no tiers");
            Catalog::default()
        }
    };

    let store = match &config.snapshot_path {
        Some(path) if path.exists() => Store::load_snapshot(path, clock.clone())
            .with_context(|| format!("loading snapshot {}", path.display()))?,
        Some(path) => {
            tracing::info!(path = %path.display(), "No snapshot yet, starting empty");
            Store::new(clock.clone())
        }
        None => Store::new(clock.clone()),
    };

    let http = HttpPriceOracle::new(&config.oracle).context("building price oracle")?;
    let oracle = CachedPriceOracle::new(http, config.oracle.cache_ttl(), clock.clone());

    let interval = config.accrual.interval();
    let snapshot_path = config.snapshot_path.clone();
    let ledger = Arc::new(
        LedgerBuilder::new(config, Arc::new(oracle))
            .store(store)
            .catalog(catalog)
            .build()
            .context("building ledger")?,
    );

    let mut worker = AccrualWorker::new(ledger.clone(), interval);
    if let Some(path) = &snapshot_path {
        worker = worker.with_snapshot(path.clone());
    }

    if cli.once {
        worker.tick().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");
    // A closed channel means the worker already exited.
    let _ = shutdown_tx.send(true);
    handle.await.context("accrual worker panicked")?;

    if let Some(path) = &snapshot_path {
        ledger
            .save_snapshot(path)
            .with_context(|| format!("saving snapshot {}", path.display()))?;
        tracing::info!(path = %path.display(), "Snapshot saved");
    }
    Ok(())
}
