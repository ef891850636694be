//! Relay server: accept loop, mixing engine and shutdown orchestration

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::audio::buffer::{create_shared_queue, SharedFrameQueue};
use crate::audio::mixer::{MixerStats, MixerStatsSnapshot, MixingEngine};
use crate::config::{AudioFormat, RelayConfig, ServerConfig};
use crate::error::{NetworkError, Result};
use crate::network::connection::ConnectionContext;
use crate::network::registry::Registry;
use crate::network::Connection;
use crate::shutdown::Shutdown;

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// What the server did over its lifetime
#[derive(Debug, Clone, Copy)]
pub struct RelaySummary {
    pub connections_accepted: u64,
    pub mixer: MixerStatsSnapshot,
}

pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    format: AudioFormat,
    registry: Registry,
    inbound: SharedFrameQueue,
}

/// Listening socket with SO_REUSEADDR so a restarted server can rebind at once
fn bind_listener(addr: SocketAddr) -> std::result::Result<std::net::TcpListener, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    Ok(socket.into())
}

impl RelayServer {
    /// Bind the listening endpoint. Must be called inside a tokio runtime.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let addr = config.server.bind_addr()?;
        let std_listener = bind_listener(addr)?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Relay listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            config: config.server.clone(),
            format: config.audio,
            registry: Registry::new(),
            inbound: create_shared_queue(config.server.max_inbound_frames),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Serve until `shutdown` fires, then drain every connection and join
    /// every task before returning.
    pub async fn run(self, shutdown: Shutdown) -> Result<RelaySummary> {
        let engine = MixingEngine::new(
            self.inbound.clone(),
            self.registry.clone(),
            self.format.frame_bytes(),
            self.format.tick_interval(),
        );
        let mixer_stats = engine.stats();
        let mixer = tokio::spawn(engine.run(shutdown.clone()));

        let ctx = ConnectionContext {
            registry: self.registry.clone(),
            inbound: self.inbound.clone(),
            queue_capacity: self.config.max_queue_frames,
            max_frame_bytes: self.config.effective_max_frame_bytes(),
        };

        let mut supervisors = JoinSet::new();
        let mut accepted = 0u64;
        let stats_period = Duration::from_secs(self.config.stats_interval_secs.max(1));
        let mut stats_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + stats_period, stats_period);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accept = self.listener.accept() => match accept {
                    Ok((stream, peer)) => {
                        accepted += 1;
                        self.admit(stream, peer, &ctx, &mut supervisors);
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(result) = supervisors.join_next(), if !supervisors.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!("Connection supervisor failed: {}", e);
                    }
                }
                _ = stats_timer.tick() => self.log_stats(&mixer_stats),
            }
        }

        tracing::info!(clients = self.registry.len(), "Shutting down relay");
        drop(self.listener);

        self.registry.drain_all();
        while let Some(result) = supervisors.join_next().await {
            if let Err(e) = result {
                tracing::error!("Connection supervisor failed: {}", e);
            }
        }
        if let Err(e) = mixer.await {
            tracing::error!("Mixing engine task failed: {}", e);
        }

        let summary = RelaySummary {
            connections_accepted: accepted,
            mixer: mixer_stats.snapshot(),
        };
        tracing::info!(
            accepted = summary.connections_accepted,
            ticks = summary.mixer.ticks,
            "Relay stopped"
        );
        Ok(summary)
    }

    fn admit(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: &ConnectionContext,
        supervisors: &mut JoinSet<()>,
    ) {
        if let Err(e) = stream.set_nodelay(self.config.tcp_nodelay) {
            tracing::debug!(peer = %peer, "set_nodelay failed: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let conn = Connection::spawn(reader, writer, peer.to_string(), ctx);
        tracing::info!(
            connection = %conn.id(),
            peer = %peer,
            clients = self.registry.len(),
            "Client connected"
        );

        supervisors.spawn(supervise(conn));
    }

    fn log_stats(&self, mixer: &MixerStats) {
        let stats = mixer.snapshot();
        tracing::info!(
            clients = self.registry.len(),
            ticks = stats.ticks,
            frames_mixed = stats.frames_mixed,
            frames_rejected = stats.frames_rejected,
            outbound_dropped = self.registry.total_dropped(),
            inbound_dropped = self.inbound.dropped_count(),
            inbound_fill = self.inbound.fill_level(),
            "Relay stats"
        );
    }
}

/// Await both worker tasks of a connection and report the session
async fn supervise(conn: Arc<Connection>) {
    conn.join().await;

    let stats = conn.stats();
    let duration = Utc::now() - conn.connected_at();
    tracing::info!(
        connection = %conn.id(),
        peer = %conn.peer(),
        duration_ms = duration.num_milliseconds(),
        frames_in = stats.frames_received.load(Ordering::Relaxed),
        frames_out = stats.frames_sent.load(Ordering::Relaxed),
        dropped = conn.queue().dropped_count(),
        "Client disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let server = RelayServer::bind(&loopback_config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let first = RelayServer::bind(&loopback_config()).await.unwrap();
        let mut config = loopback_config();
        config.server.port = first.local_addr().port();

        let err = RelayServer::bind(&config).await.err().unwrap();
        assert!(matches!(err, crate::Error::Network(NetworkError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let server = RelayServer::bind(&loopback_config()).await.unwrap();
        let addr = server.local_addr();
        let registry = server.registry();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        shutdown.trigger();
        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.connections_accepted, 1);
        assert!(registry.is_empty());
    }
}
