mod bootstrap;
mod health;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cadence_core::config::{AppConfig, LoadOptions};
use cadence_core::schedule::SystemClock;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use cadence_core::config::LogFormat::*;

    // RUST_LOG wins over the configured level when set.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::HealthState::new(app.db_pool.clone(), app.agent.stores.clone(), Arc::new(SystemClock)),
    )
    .await?;

    // No mailbox fetcher is wired here; replies arrive through `cadence inbox ingest`.
    let scheduler = Arc::new(app.agent.scheduler(None));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        concurrency = app.config.worker.concurrency,
        tick_secs = app.config.agent.tick_secs,
        "cadence-server started"
    );
    wait_for_shutdown().await?;

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        in_flight = app.agent.pool.in_flight(),
        grace_secs = grace.as_secs(),
        "cadence-server stopping"
    );

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(grace, scheduler_task).await.is_err() {
        tracing::warn!(event_name = "system.server.scheduler_timeout", correlation_id = "shutdown");
    }
    app.agent.pool.shutdown();
    if !app.agent.pool.wait_idle(grace).await {
        tracing::warn!(
            event_name = "system.server.workers_abandoned",
            correlation_id = "shutdown",
            in_flight = app.agent.pool.in_flight(),
            "unfinished sends will be recovered on next start"
        );
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
