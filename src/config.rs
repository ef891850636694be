//! Relay configuration
//!
//! Defaults come from [`crate::constants`]; a TOML file can override any
//! field, and a handful of environment variables override the file.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "relay.toml";

/// Top-level configuration shared by server and client binaries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub audio: AudioFormat,
    pub client: ClientConfig,
}

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener to
    pub bind_address: String,
    /// Listening port
    pub port: u16,
    /// Disable Nagle on accepted sockets
    pub tcp_nodelay: bool,
    /// Outbound queue capacity per connection
    pub max_queue_frames: usize,
    /// Capacity of the inbound mix buffer
    pub max_inbound_frames: usize,
    /// Largest frame accepted from a client
    pub max_frame_bytes: usize,
    /// Seconds between statistics log lines
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tcp_nodelay: true,
            max_queue_frames: MAX_QUEUE_FRAMES,
            max_inbound_frames: MAX_INBOUND_FRAMES,
            max_frame_bytes: MAX_FRAME_LEN,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
        }
    }
}

impl ServerConfig {
    /// Resolve the listening socket address
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                field: "server.bind_address",
                reason: e.to_string(),
            })
    }

    /// Frame cap actually enforced by the codec
    pub fn effective_max_frame_bytes(&self) -> usize {
        self.max_frame_bytes.min(MAX_FRAME_LEN)
    }
}

/// PCM format agreed out-of-band between clients and server.
/// Samples are always signed 16-bit little endian, interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_ms: FRAME_DURATION_MS,
        }
    }
}

impl AudioFormat {
    /// Sample frames (per channel) in one frame period
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms as u64 / 1000) as usize
    }

    /// Bytes in one frame period
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Mix tick / capture period
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

/// Client operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// Real capture and playback devices
    #[default]
    Normal,
    /// Silent sender, discarded playback; lets many clients run on one host
    Test,
}

/// Reference client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub mode: ClientMode,
    pub tcp_nodelay: bool,
    pub send_queue_frames: usize,
    pub playback_queue_frames: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: format!("127.0.0.1:{}", DEFAULT_PORT),
            mode: ClientMode::Normal,
            tcp_nodelay: true,
            send_queue_frames: MAX_QUEUE_FRAMES,
            playback_queue_frames: MAX_QUEUE_FRAMES,
        }
    }
}

impl RelayConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load configuration: explicit path, then the per-user config file,
    /// then defaults. Environment overrides and validation are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => {
                    tracing::info!("Loading config from {}", path.display());
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PCM_RELAY_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("PCM_RELAY_BIND") {
            let addr: SocketAddr = bind.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::Invalid {
                    field: "PCM_RELAY_BIND",
                    reason: e.to_string(),
                }
            })?;
            self.server.bind_address = addr.ip().to_string();
            self.server.port = addr.port();
        }
        if let Some(server) = lookup("PCM_RELAY_SERVER") {
            self.client.server_address = server;
        }
        if let Some(frames) = lookup("PCM_RELAY_MAX_QUEUE_FRAMES") {
            self.server.max_queue_frames =
                frames.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                    field: "PCM_RELAY_MAX_QUEUE_FRAMES",
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.audio.sample_rate == 0 {
            return invalid("audio.sample_rate", "must be positive");
        }
        if self.audio.channels == 0 {
            return invalid("audio.channels", "must be positive");
        }
        if self.audio.frame_ms == 0 {
            return invalid("audio.frame_ms", "must be positive");
        }
        if self.audio.frame_bytes() == 0 {
            return invalid("audio.frame_ms", "frame holds no samples");
        }
        if self.server.max_queue_frames == 0 {
            return invalid("server.max_queue_frames", "must be positive");
        }
        if self.server.max_inbound_frames == 0 {
            return invalid("server.max_inbound_frames", "must be positive");
        }
        if self.client.send_queue_frames == 0 || self.client.playback_queue_frames == 0 {
            return invalid("client", "queue capacities must be positive");
        }
        if self.audio.frame_bytes() > self.server.effective_max_frame_bytes() {
            return invalid("server.max_frame_bytes", "smaller than one audio frame");
        }
        self.server.bind_addr()?;
        Ok(())
    }
}

/// `<config dir>/pcm-relay/relay.toml`, when the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "pcm-relay")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
