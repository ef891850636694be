//! Relay Client Application
//!
//! Streams the microphone to the relay and plays back the mix.
//! Usage: `pcm-relay-client [server_addr] [test]`
//!
//! `test` mode sends silence and discards playback, so many clients can run
//! on one machine. Press Enter to quit.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcm_relay::{
    audio::{CaptureSource, NullSink, PlaybackSink, SilentSource},
    config::{ClientMode, RelayConfig},
    network::client::run_client,
    shutdown::Shutdown,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RelayConfig::load(None).context("load configuration")?;
    for arg in std::env::args().skip(1) {
        if arg == "test" {
            config.client.mode = ClientMode::Test;
        } else {
            config.client.server_address = arg;
        }
    }

    tracing::info!(
        "Starting PCM relay client ({:?} mode) -> {}",
        config.client.mode,
        config.client.server_address
    );

    let (source, sink) = build_devices(&config)?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("stdin-quit".to_string())
            .spawn(move || {
                let mut line = String::new();
                let _ = std::io::stdin().read_line(&mut line);
                shutdown.trigger();
            })
            .context("spawn stdin watcher")?;
    }
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.trigger();
            }
        });
    }

    println!("Client running. Press Enter to quit.");
    let summary = run_client(&config, source, sink, shutdown)
        .await
        .context("relay session")?;
    tracing::info!(
        "Sent {} frames, received {}, played {}",
        summary.frames_sent,
        summary.frames_received,
        summary.frames_played
    );
    Ok(())
}

type Devices = (Box<dyn CaptureSource>, Box<dyn PlaybackSink>);

#[cfg(feature = "devices")]
fn build_devices(config: &RelayConfig) -> Result<Devices> {
    use pcm_relay::audio::{DeviceCapture, DevicePlayback};

    if config.client.mode == ClientMode::Test {
        tracing::info!("Test mode: silent capture, playback discarded");
        return Ok((Box::new(SilentSource::new(config.audio)), Box::new(NullSink::new())));
    }

    for device in pcm_relay::audio::list_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        tracing::debug!("Audio device: {}{}", device.name, default_marker);
    }

    let playback = DevicePlayback::start(None, config.audio, 8).context("open playback device")?;
    Ok((
        Box::new(DeviceCapture::new(None, config.audio)),
        Box::new(playback),
    ))
}

#[cfg(not(feature = "devices"))]
fn build_devices(config: &RelayConfig) -> Result<Devices> {
    if config.client.mode == ClientMode::Normal {
        tracing::warn!("Built without the `devices` feature; falling back to test mode");
    }
    Ok((Box::new(SilentSource::new(config.audio)), Box::new(NullSink::new())))
}
