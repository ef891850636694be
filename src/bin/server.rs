//! Relay Server Application
//!
//! Accepts clients, mixes their PCM every frame period and broadcasts the mix.
//! Usage: `pcm-relay-server [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcm_relay::{config::RelayConfig, network::RelayServer, shutdown::Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PCM relay server");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = RelayConfig::load(config_path.as_deref()).context("load configuration")?;

    tracing::info!(
        "Format: {} Hz, {} ch, 16-bit, {} ms frames ({} bytes)",
        config.audio.sample_rate,
        config.audio.channels,
        config.audio.frame_ms,
        config.audio.frame_bytes()
    );

    // Startup faults are fatal: anyhow turns them into a nonzero exit.
    let server = RelayServer::bind(&config)
        .await
        .context("bind relay listener")?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            shutdown.trigger();
        });
    }

    let summary = server.run(shutdown).await?;
    tracing::info!(
        "Served {} connections over {} mix ticks",
        summary.connections_accepted,
        summary.mixer.ticks
    );
    Ok(())
}
