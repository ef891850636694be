//! # PCM Relay
//!
//! Low-latency audio relay: every client streams microphone PCM to the
//! server, the server mixes all streams once per frame period and sends the
//! mix back to every participant.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────┐  ┌──────────┐  ┌──────────┐
//! │ Client A │  │ Client B │  │ Client C │        [u32 BE length][PCM bytes]
//! └────┬─────┘  └────┬─────┘  └────┬─────┘
//!      │ TCP         │             │
//! ┌────┼─────────────┼─────────────┼──────────────────────────────────────┐
//! │    ▼             ▼             ▼                        RELAY SERVER  │
//! │ ┌────────┐    ┌────────┐    ┌────────┐                                │
//! │ │  recv  │    │  recv  │    │  recv  │  network::connection           │
//! │ └───┬────┘    └───┬────┘    └───┬────┘                                │
//! │     └─────────────┼─────────────┘                                     │
//! │                   ▼                                                   │
//! │        ┌─────────────────────┐                                        │
//! │        │ inbound FrameQueue  │  audio::buffer (swap on every tick)    │
//! │        └──────────┬──────────┘                                        │
//! │                   ▼                                                   │
//! │        ┌─────────────────────┐                                        │
//! │        │   Mixing Engine     │  audio::mixer, 20 ms tick,             │
//! │        │ saturating i16 sum  │  silence in -> silence out             │
//! │        └──────────┬──────────┘                                        │
//! │                   ▼  fan-out via network::registry                    │
//! │ ┌────────┐    ┌────────┐    ┌────────┐                                │
//! │ │ queue  │    │ queue  │    │ queue  │  bounded 50, drop-oldest       │
//! │ ├────────┤    ├────────┤    ├────────┤                                │
//! │ │  send  │    │  send  │    │  send  │                                │
//! │ └───┬────┘    └───┬────┘    └───┬────┘                                │
//! └─────┼─────────────┼─────────────┼─────────────────────────────────────┘
//!       ▼             ▼             ▼
//!   Client A      Client B      Client C
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod shutdown;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Bytes per sample (signed 16-bit little endian)
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Frame duration in milliseconds, also the mix tick period
    pub const FRAME_DURATION_MS: u32 = 20;

    /// Bytes in one 20 ms frame at the default format
    pub const FRAME_BYTES: usize = 3840;

    /// Default TCP port of the relay
    pub const DEFAULT_PORT: u16 = 9797;

    /// Outbound queue capacity per connection (~1 s of audio)
    pub const MAX_QUEUE_FRAMES: usize = 50;

    /// Capacity of the shared inbound buffer drained by the mixer
    pub const MAX_INBOUND_FRAMES: usize = 1024;

    /// Largest payload a frame may declare (2^24 - 1)
    pub const MAX_FRAME_LEN: usize = (1 << 24) - 1;

    /// Size of the big-endian length prefix
    pub const LENGTH_PREFIX_BYTES: usize = 4;

    /// Interval between relay statistics log lines
    pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;
}
