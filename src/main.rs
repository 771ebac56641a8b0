use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use portal_sync::config;
use portal_sync::db;
use portal_sync::gate::ConcurrencyGate;
use portal_sync::portal::PortalSession;
use portal_sync::sync::Orchestrator;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Reconcile the local client registry with the partner portal"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Process at most this many remote entities (limited test run)
    #[arg(long)]
    limit: Option<usize>,

    /// Write the run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/registry.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let portal = Arc::new(PortalSession::new(&cfg.portal)?);
    let gate = ConcurrencyGate::new(
        cfg.sync.max_concurrent,
        Duration::from_millis(cfg.sync.request_delay_ms),
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight entities");
            interrupt.cancel();
        }
    });

    let orchestrator = Orchestrator::new(portal, pool, gate, cancel, args.limit);
    let report = orchestrator.run().await?;

    if let Some(path) = &args.report {
        tokio::fs::write(path, serde_json::to_vec_pretty(&report)?).await?;
        info!(path = %path.display(), "run report written");
    }

    Ok(())
}
