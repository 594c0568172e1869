mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use peerwire_mailbox::MailboxStore;
use peerwire_road::{build_router, RoadConfig, RoadState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Default to WARN when RUST_LOG is not set.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Debug { url, command }) => cli::run_debug_client(url, command).await,
        Some(Commands::Serve { port }) => run_server(port).await,
        None => run_server(None).await,
    }
}

async fn run_server(port_override: Option<u16>) -> Result<()> {
    let mut config = RoadConfig::from_env();
    if let Some(port) = port_override {
        config.port = port;
    }
    info!(
        port = config.port,
        retention_secs = config.mailbox.retention.as_secs(),
        peer_timeout_secs = config.mailbox.peer_timeout.as_secs(),
        room_timeout_secs = config.mailbox.room_timeout.as_secs(),
        sweep_secs = config.mailbox.sweep_interval.as_secs(),
        "starting peerwire signaling relay"
    );

    let store = MailboxStore::new(config.mailbox.clone());
    let mut sweeper = store.spawn_sweeper();
    let app = build_router(RoadState::new(store));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("peerwire-road listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {err}");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("relay server failed")?;

    sweeper.stop();
    info!("peerwire-road stopped");
    Ok(())
}
