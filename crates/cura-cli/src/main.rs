//! `cura-notifyd`: runs the delivery scheduler and the cascade worker
//! against a sqlite-backed message store until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use cura_core::config::{CuraConfig, GatewayMode};
use cura_delivery::{
    start_delivery_scheduler, DeliveryScheduler, DryRunGateway, HttpSmsGateway, SmsGateway,
};
use cura_notify::{start_cascade_worker, ConsolidationPlanner, RescheduleCascade, TemplateCatalog};
use cura_store::SqliteStore;

#[derive(Debug, Parser)]
#[command(
    name = "cura-notifyd",
    about = "Clinic reminder consolidation and delivery daemon",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "CURA_CONFIG",
        default_value = "cura.toml",
        help = "Path to the TOML configuration file"
    )]
    config: PathBuf,

    #[arg(
        long,
        help = "Force the gateway into dry-run mode regardless of configuration"
    )]
    dry_run: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = CuraConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    if cli.dry_run {
        config.gateway.mode = GatewayMode::DryRun;
    }
    let policy = config.policy.build()?;

    let store = Arc::new(
        SqliteStore::open(&config.store.path)
            .with_context(|| format!("failed to open store at {}", config.store.path.display()))?,
    );
    let gateway: Arc<dyn SmsGateway> = match config.gateway.mode {
        GatewayMode::DryRun => Arc::new(DryRunGateway::new()),
        GatewayMode::Provider => Arc::new(HttpSmsGateway::new(&config.gateway)?),
    };

    let planner = ConsolidationPlanner::new(
        store.clone(),
        store.clone(),
        policy,
        TemplateCatalog::new(),
    );
    let cascade = RescheduleCascade::new(
        planner.clone(),
        gateway.clone(),
        config.notify.dedupe_window(),
    );
    let (_queue, mut worker) = start_cascade_worker(planner, cascade)?;

    let scheduler = DeliveryScheduler::new(
        store.clone(),
        store.clone(),
        gateway,
        config.delivery.clone(),
    );
    let mut scheduler_handle = start_delivery_scheduler(scheduler)?;

    info!(
        store = %config.store.path.display(),
        gateway_mode = config.gateway.mode.as_str(),
        poll_interval_secs = config.delivery.poll_interval_secs,
        "cura-notifyd started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutdown signal received");

    scheduler_handle.shutdown().await;
    worker.shutdown().await;
    info!("cura-notifyd stopped");
    Ok(())
}
