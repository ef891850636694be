//! Server-side state for one client
//!
//! Each connection runs two tasks: a receive loop that decodes frames into
//! the shared inbound buffer, and a send loop that drains the connection's
//! own bounded queue onto the transport. Either loop failing drains the
//! connection exactly once.
//!
//! ```text
//! Connecting ──► Active ──► Draining ──► Removed
//!                  │  recv/send failure     ▲
//!                  │  or shutdown           │ both tasks joined
//!                  └────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::buffer::{FrameQueue, SharedFrameQueue};
use crate::network::registry::Registry;
use crate::protocol::{read_frame, write_frame, Frame};

/// Unique connection identifier
pub type ConnectionId = Uuid;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    Draining = 2,
    Removed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Removed,
        }
    }
}

/// Per-connection traffic counters
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

/// Shared state every connection needs from the server
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Registry,
    pub inbound: SharedFrameQueue,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
}

struct Workers {
    recv: JoinHandle<()>,
    send: JoinHandle<()>,
}

pub struct Connection {
    id: ConnectionId,
    peer: String,
    connected_at: DateTime<Utc>,
    queue: FrameQueue,
    state: AtomicU8,
    close_tx: watch::Sender<bool>,
    joined_tx: watch::Sender<bool>,
    stats: ConnectionStats,
    workers: Mutex<Option<Workers>>,
}

impl Connection {
    fn new(peer: String, queue_capacity: usize) -> Self {
        let (close_tx, _) = watch::channel(false);
        let (joined_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            queue: FrameQueue::new(queue_capacity),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_tx,
            joined_tx,
            stats: ConnectionStats::default(),
            workers: Mutex::new(None),
        }
    }

    /// Register a connection and start its receive and send tasks.
    ///
    /// The connection is in the registry before either task runs, so a task
    /// that fails immediately still finds it there to remove.
    pub fn spawn<R, W>(reader: R, writer: W, peer: String, ctx: &ConnectionContext) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let conn = Arc::new(Self::new(peer, ctx.queue_capacity));
        conn.state
            .store(ConnectionState::Active as u8, Ordering::SeqCst);
        ctx.registry.add(conn.clone());

        let recv = tokio::spawn(receive_loop(
            conn.clone(),
            reader,
            ctx.registry.clone(),
            ctx.inbound.clone(),
            ctx.max_frame_bytes,
        ));
        let send = tokio::spawn(send_loop(conn.clone(), writer, ctx.registry.clone()));
        *conn.workers.lock() = Some(Workers { recv, send });

        tracing::debug!(connection = %conn.id, peer = %conn.peer, "Connection active");
        conn
    }

    /// Active connection without a transport, for exercising fan-out
    #[cfg(test)]
    pub(crate) fn detached(queue_capacity: usize) -> Arc<Self> {
        let conn = Self::new("detached".to_string(), queue_capacity);
        conn.state
            .store(ConnectionState::Active as u8, Ordering::SeqCst);
        Arc::new(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Queue a frame for this client. Never blocks; ignored once draining.
    pub fn enqueue(&self, frame: Frame) -> bool {
        if !self.is_active() {
            return false;
        }
        self.queue.push(frame);
        true
    }

    /// Move to `Draining`. Only the first caller wins; it closes and empties
    /// the outbound queue and signals both loops to release the transport.
    pub(crate) fn begin_drain(&self) -> bool {
        let won = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match ConnectionState::from_u8(current) {
                    ConnectionState::Connecting | ConnectionState::Active => {
                        Some(ConnectionState::Draining as u8)
                    }
                    _ => None,
                }
            })
            .is_ok();

        if won {
            self.close_tx.send_replace(true);
            self.queue.close();
            self.queue.clear();
            tracing::debug!(connection = %self.id, peer = %self.peer, "Connection draining");
        }
        won
    }

    /// Resolves once the connection has started draining
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Wait for both worker tasks, then mark the connection `Removed`.
    /// Concurrent and later callers wait for the first join to finish.
    pub async fn join(&self) {
        let workers = self.workers.lock().take();
        match workers {
            Some(Workers { recv, send }) => {
                let (recv, send) = tokio::join!(recv, send);
                for result in [recv, send] {
                    if let Err(e) = result {
                        tracing::error!(connection = %self.id, "Connection task failed: {}", e);
                    }
                }
                self.state
                    .store(ConnectionState::Removed as u8, Ordering::SeqCst);
                self.joined_tx.send_replace(true);
            }
            None => {
                let mut rx = self.joined_tx.subscribe();
                let _ = rx.wait_for(|joined| *joined).await;
            }
        }
    }
}

async fn receive_loop<R>(
    conn: Arc<Connection>,
    mut reader: R,
    registry: Registry,
    inbound: SharedFrameQueue,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let result = tokio::select! {
            biased;
            _ = conn.closed() => break,
            result = read_frame(&mut reader, max_frame_bytes) => result,
        };

        match result {
            Ok(frame) => {
                conn.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                conn.stats
                    .bytes_received
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                inbound.push(frame);
            }
            Err(e) if e.is_disconnect() => {
                tracing::debug!(connection = %conn.id, "Peer closed: {}", e);
                break;
            }
            Err(e) => {
                tracing::warn!(connection = %conn.id, peer = %conn.peer, "Dropping client: {}", e);
                break;
            }
        }
    }

    registry.remove(&conn);
}

async fn send_loop<W>(conn: Arc<Connection>, mut writer: W, registry: Registry)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = conn.queue.pop().await {
        // A stalled peer must not pin the task once draining starts.
        let result = tokio::select! {
            biased;
            _ = conn.closed() => break,
            result = write_frame(&mut writer, &frame) => result,
        };

        match result {
            Ok(()) => {
                conn.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                conn.stats
                    .bytes_sent
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!(connection = %conn.id, "Send failed: {}", e);
                break;
            }
        }
    }

    registry.remove(&conn);
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(connection = %conn.id, "Transport shutdown: {}", e);
    }
}
