//! Network subsystem: per-client connections, the live registry, the relay
//! server and the reference client

pub mod client;
pub mod connection;
pub mod registry;
pub mod server;

pub use client::RelayClient;
pub use connection::{Connection, ConnectionContext, ConnectionId, ConnectionState};
pub use registry::Registry;
pub use server::{RelayServer, RelaySummary};
