//! Reference relay client
//!
//! Mirrors the server's per-connection layout from the other side:
//!
//! ```text
//! capture ─► send queue (drop-oldest) ─► send task ─► server
//! server ─► recv task ─► playback queue (drop-oldest) ─► pump ─► sink
//! ```
//!
//! Any task failing clears the client's running flag and everything winds
//! down together.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::audio::buffer::{create_shared_queue, SharedFrameQueue};
use crate::audio::capture::CaptureSource;
use crate::audio::playback::PlaybackSink;
use crate::config::RelayConfig;
use crate::error::{NetworkError, Result};
use crate::protocol::{read_frame, write_frame};
use crate::shutdown::Shutdown;

const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

type SharedCapture = Arc<Mutex<Box<dyn CaptureSource>>>;

/// Frame counts for one client session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientSummary {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_played: u64,
}

pub struct RelayClient {
    stream: TcpStream,
    server: SocketAddr,
    max_frame_bytes: usize,
}

impl RelayClient {
    pub async fn connect(addr: &str, nodelay: bool) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(nodelay)?;
        let server = stream.peer_addr()?;

        tracing::info!("Connected to relay at {}", server);
        Ok(Self {
            stream,
            server,
            max_frame_bytes: crate::constants::MAX_FRAME_LEN,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Stream `outgoing` to the server and push everything received into
    /// `incoming` until `shutdown` fires or the connection fails.
    pub async fn run(
        self,
        outgoing: SharedFrameQueue,
        incoming: SharedFrameQueue,
        shutdown: Shutdown,
    ) -> ClientSummary {
        let (mut reader, mut writer) = self.stream.into_split();
        let max_frame_bytes = self.max_frame_bytes;

        let send = {
            let outgoing = outgoing.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut sent = 0u64;
                loop {
                    let frame = tokio::select! {
                        biased;
                        _ = shutdown.wait() => break,
                        frame = outgoing.pop() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    let result = tokio::select! {
                        biased;
                        _ = shutdown.wait() => break,
                        result = write_frame(&mut writer, &frame) => result,
                    };
                    if let Err(e) = result {
                        tracing::warn!("Send to relay failed: {}", e);
                        shutdown.trigger();
                        break;
                    }
                    sent += 1;
                }
                let _ = writer.shutdown().await;
                sent
            })
        };

        let recv = {
            let incoming = incoming.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut received = 0u64;
                loop {
                    let result = tokio::select! {
                        biased;
                        _ = shutdown.wait() => break,
                        result = read_frame(&mut reader, max_frame_bytes) => result,
                    };
                    match result {
                        Ok(frame) => {
                            received += 1;
                            incoming.push(frame);
                        }
                        Err(e) => {
                            tracing::warn!("Relay connection lost: {}", e);
                            shutdown.trigger();
                            break;
                        }
                    }
                }
                received
            })
        };

        let (sent, received) = tokio::join!(send, recv);

        outgoing.close();
        incoming.close();
        outgoing.clear();
        incoming.clear();

        ClientSummary {
            frames_sent: sent.unwrap_or_else(|e| {
                tracing::error!("Send task failed: {}", e);
                0
            }),
            frames_received: received.unwrap_or_else(|e| {
                tracing::error!("Receive task failed: {}", e);
                0
            }),
            frames_played: 0,
        }
    }
}

/// Hand the freshest received frame to `sink` until the queue closes or
/// `shutdown` fires. Returns the number of frames played.
pub async fn pump_playback<S>(incoming: SharedFrameQueue, mut sink: S, shutdown: Shutdown) -> u64
where
    S: PlaybackSink,
{
    let mut played = 0u64;
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            frame = incoming.pop_latest() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match sink.play(frame) {
            Ok(()) => played += 1,
            Err(e) => tracing::warn!("Playback failed: {}", e),
        }
    }
    played
}

/// Stop the session when the capture source reports a stream failure
async fn watch_capture(source: SharedCapture, shutdown: Shutdown) {
    let mut poll = tokio::time::interval(CAPTURE_POLL_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = poll.tick() => {
                let failure = source.lock().take_error();
                if let Some(e) = failure {
                    tracing::error!("Capture failed: {}", e);
                    shutdown.trigger();
                    break;
                }
            }
        }
    }
}

/// Connect, start capture and playback, and run until `shutdown` fires,
/// capture fails or the relay connection fails. Every task is joined
/// before returning.
pub async fn run_client(
    config: &RelayConfig,
    mut source: Box<dyn CaptureSource>,
    sink: Box<dyn PlaybackSink>,
    shutdown: Shutdown,
) -> Result<ClientSummary> {
    let client = RelayClient::connect(&config.client.server_address, config.client.tcp_nodelay).await?;
    let server = client.server_addr();

    let outgoing = create_shared_queue(config.client.send_queue_frames);
    let incoming = create_shared_queue(config.client.playback_queue_frames);

    source.start(outgoing.clone())?;
    let source: SharedCapture = Arc::new(Mutex::new(source));
    let watchdog = tokio::spawn(watch_capture(source.clone(), shutdown.clone()));
    let pump = tokio::spawn(pump_playback(incoming.clone(), sink, shutdown.clone()));

    let mut summary = client.run(outgoing, incoming, shutdown.clone()).await;
    shutdown.trigger();

    summary.frames_played = pump.await.unwrap_or_else(|e| {
        tracing::error!("Playback task failed: {}", e);
        0
    });
    if let Err(e) = watchdog.await {
        tracing::error!("Capture watchdog failed: {}", e);
    }
    // Joining the capture thread blocks.
    if let Err(e) = tokio::task::spawn_blocking(move || source.lock().stop()).await {
        tracing::error!("Capture shutdown failed: {}", e);
    }

    tracing::info!(
        server = %server,
        sent = summary.frames_sent,
        received = summary.frames_received,
        played = summary.frames_played,
        "Client stopped"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::NullSink;
    use crate::error::AudioError;
    use crate::protocol::encode_frame;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_client_exchanges_frames_and_stops_on_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut wire = vec![0u8; 4 + 3];
            socket.read_exact(&mut wire).await.unwrap();
            socket.write_all(&encode_frame(b"mix").unwrap()).await.unwrap();
            wire
        });

        let client = RelayClient::connect(&addr, true).await.unwrap();
        let outgoing = create_shared_queue(4);
        let incoming = create_shared_queue(4);
        outgoing.push(Bytes::from_static(b"mic"));

        let summary = tokio::time::timeout(
            Duration::from_secs(2),
            client.run(outgoing.clone(), incoming.clone(), Shutdown::new()),
        )
        .await
        .unwrap();

        let wire = server.await.unwrap();
        assert_eq!(&wire[..], &encode_frame(b"mic").unwrap()[..]);
        assert_eq!(summary.frames_sent, 1);
        assert_eq!(summary.frames_received, 1);
        assert!(outgoing.is_closed() && incoming.is_closed());
    }

    #[tokio::test]
    async fn test_pump_plays_latest_frame() {
        let incoming = create_shared_queue(8);
        for tag in 0..3u8 {
            incoming.push(Bytes::from(vec![tag]));
        }
        incoming.close();

        let sink = NullSink::new();
        let played = pump_playback(incoming, sink.clone(), Shutdown::new()).await;
        assert_eq!(played, 1);
        assert_eq!(sink.frames_played(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RelayClient::connect(&addr, true).await.err().unwrap();
        assert!(matches!(err, crate::Error::Network(NetworkError::ConnectionFailed(_))));
    }

    /// Source that starts cleanly and then reports a device failure
    struct FailingSource {
        started: bool,
    }

    impl CaptureSource for FailingSource {
        fn start(&mut self, _output: SharedFrameQueue) -> std::result::Result<(), AudioError> {
            self.started = true;
            Ok(())
        }

        fn stop(&mut self) {}

        fn take_error(&mut self) -> Option<AudioError> {
            self.started
                .then(|| AudioError::StreamError("device unplugged".to_string()))
        }
    }

    #[tokio::test]
    async fn test_capture_failure_stops_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = RelayConfig::default();
        config.client.server_address = listener.local_addr().unwrap().to_string();

        // Relay side accepts and then stays silent.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            while socket.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
        });

        let shutdown = Shutdown::new();
        let summary = tokio::time::timeout(
            Duration::from_secs(2),
            run_client(
                &config,
                Box::new(FailingSource { started: false }),
                Box::new(NullSink::new()),
                shutdown.clone(),
            ),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(shutdown.is_triggered());
        assert_eq!(summary.frames_sent, 0);
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap();
    }
}
