mod bootstrap;
mod clients;
mod health;
mod memory;
#[cfg(test)]
mod testing;
mod webhook;

use std::time::Duration;

use anyhow::Result;
use concierge_core::config::{AppConfig, LoadOptions};
use tracing_subscriber::EnvFilter;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

use crate::health::HealthState;
use crate::memory::MemoryState;
use crate::webhook::{InFlightTurns, WebhookState};

fn init_logging(config: &AppConfig) {
    use concierge_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging needs the config, so load it before anything else.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let in_flight = InFlightTurns::default();
    let router = webhook::router(WebhookState {
        runtime: app.runtime.clone(),
        delayed: app.delayed.clone(),
        in_flight: in_flight.clone(),
    })
    .merge(health::router(HealthState {
        db_pool: app.db_pool.clone(),
        runtime: app.runtime.clone(),
        delayed: app.delayed.clone(),
    }))
    .merge(memory::router(MemoryState { structured: app.structured.clone() }));

    let retention = app.retention_sweeper().map(|sweeper| {
        tracing::info!(
            event_name = "memory.retention.scheduled",
            correlation_id = "bootstrap",
            keep_days = sweeper.keep_for().num_days(),
            "memory retention sweep scheduled hourly"
        );
        sweeper.spawn(RETENTION_SWEEP_INTERVAL)
    });

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "concierge-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        turns_in_flight = in_flight.count(),
        queued_writes = app.runtime.deferred().queue_depth(),
        "draining turns and deferred writes"
    );
    if let Some(retention) = retention {
        retention.abort();
    }
    let turns_drained = in_flight.drain(grace).await;
    let writes_drained = app.runtime.shutdown(grace).await;
    if !(turns_drained && writes_drained) {
        tracing::warn!(
            event_name = "system.server.drain_incomplete",
            correlation_id = "shutdown",
            turns_drained,
            writes_drained,
            "shutdown grace period elapsed with work outstanding"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            error = %error,
            "failed to listen for shutdown signal"
        );
    }
}
