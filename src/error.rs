//! Error types for the audio relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device collaborator errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Capture already running")]
    AlreadyRunning,
}

/// Framing errors. Every variant ends the connection it was raised on.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("Zero-length frame")]
    EmptyFrame,

    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer went away rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Closed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
