//! End-to-end relay behavior over loopback TCP

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use pcm_relay::config::RelayConfig;
use pcm_relay::constants::{FRAME_BYTES, MAX_FRAME_LEN};
use pcm_relay::network::{Registry, RelayServer, RelaySummary};
use pcm_relay::protocol::{read_frame, write_frame, Frame};
use pcm_relay::shutdown::Shutdown;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

struct Harness {
    addr: SocketAddr,
    registry: Registry,
    shutdown: Shutdown,
    task: JoinHandle<pcm_relay::Result<RelaySummary>>,
}

fn loopback_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config
}

async fn start_relay() -> Harness {
    start_relay_with(loopback_config()).await
}

async fn start_relay_with(config: RelayConfig) -> Harness {
    let server = RelayServer::bind(&config).await.unwrap();
    let addr = server.local_addr();
    let registry = server.registry();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(server.run(shutdown.clone()));

    Harness {
        addr,
        registry,
        shutdown,
        task,
    }
}

async fn wait_for_clients(registry: &Registry, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.len() != count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("registry never reached the expected size");
}

fn constant_frame(value: i16) -> Frame {
    let mut buf = BytesMut::with_capacity(FRAME_BYTES);
    for _ in 0..FRAME_BYTES / 2 {
        buf.put_i16_le(value);
    }
    buf.freeze()
}

fn samples(frame: &[u8]) -> impl Iterator<Item = i16> + '_ {
    frame
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
}

/// Read mixed frames until one has every sample equal to `value`
async fn expect_constant_mix(stream: &mut TcpStream, value: i16) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let frame = read_frame(stream, MAX_FRAME_LEN).await.unwrap();
            assert_eq!(frame.len(), FRAME_BYTES);
            if samples(&frame).all(|s| s == value) {
                return;
            }
        }
    })
    .await
    .expect("mix never arrived");
}

#[tokio::test]
async fn test_three_clients_hear_the_mix() {
    let relay = start_relay().await;

    let mut a = TcpStream::connect(relay.addr).await.unwrap();
    let mut b = TcpStream::connect(relay.addr).await.unwrap();
    let mut c = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 3).await;

    write_frame(&mut a, &constant_frame(0)).await.unwrap();
    write_frame(&mut b, &constant_frame(1000)).await.unwrap();

    // The listener hears B, and so do the senders themselves.
    expect_constant_mix(&mut c, 1000).await;
    expect_constant_mix(&mut a, 1000).await;

    relay.shutdown.trigger();
    let summary = tokio::time::timeout(Duration::from_secs(2), relay.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.connections_accepted, 3);
    assert!(summary.mixer.frames_mixed >= 1);
    assert!(relay.registry.is_empty());
}

#[tokio::test]
async fn test_idle_relay_broadcasts_silence() {
    let relay = start_relay().await;

    let mut listener = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 1).await;

    let frame = tokio::time::timeout(
        Duration::from_secs(1),
        read_frame(&mut listener, MAX_FRAME_LEN),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(frame.len(), FRAME_BYTES);
    assert!(frame.iter().all(|&b| b == 0));

    relay.shutdown.trigger();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_protocol_violation_only_drops_offender() {
    let relay = start_relay().await;

    let mut offender = TcpStream::connect(relay.addr).await.unwrap();
    let mut bystander = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    // A zero length prefix is never valid.
    offender.write_all(&0u32.to_be_bytes()).await.unwrap();
    wait_for_clients(&relay.registry, 1).await;

    // The offender sees end of stream once whatever was queued is flushed.
    tokio::time::timeout(Duration::from_secs(2), async {
        while read_frame(&mut offender, MAX_FRAME_LEN).await.is_ok() {}
    })
    .await
    .expect("offender was never disconnected");

    write_frame(&mut bystander, &constant_frame(-250)).await.unwrap();
    expect_constant_mix(&mut bystander, -250).await;

    relay.shutdown.trigger();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_oversized_length_prefix_disconnects() {
    let relay = start_relay().await;

    let mut offender = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 1).await;

    offender
        .write_all(&(1u32 << 24).to_be_bytes())
        .await
        .unwrap();
    wait_for_clients(&relay.registry, 0).await;

    relay.shutdown.trigger();
    let summary = relay.task.await.unwrap().unwrap();
    assert_eq!(summary.connections_accepted, 1);
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let relay = start_relay().await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 1).await;

    relay.shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), relay.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while read_frame(&mut client, MAX_FRAME_LEN).await.is_ok() {}
    })
    .await
    .expect("client still connected after shutdown");
}

/// Client with a tiny receive window that never reads
fn stalled_client(addr: SocketAddr) -> TcpStream {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    socket.connect(&addr.into()).unwrap();
    socket.set_nonblocking(true).unwrap();
    TcpStream::from_std(socket.into()).unwrap()
}

#[tokio::test]
async fn test_stalled_reader_does_not_delay_healthy_client() {
    // Large frames fill the stalled peer's socket buffers within a few ticks.
    let mut config = loopback_config();
    config.audio.channels = 8;
    let frame_bytes = config.audio.frame_bytes();
    let relay = start_relay_with(config).await;

    let _stalled = stalled_client(relay.addr);
    let mut healthy = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    let window = Duration::from_millis(1500);
    let started = Instant::now();
    let mut last = Instant::now();
    let mut max_gap = Duration::ZERO;
    let mut received = 0usize;
    while started.elapsed() < window {
        let frame = tokio::time::timeout(
            Duration::from_secs(1),
            read_frame(&mut healthy, MAX_FRAME_LEN),
        )
        .await
        .expect("healthy client starved")
        .unwrap();
        assert_eq!(frame.len(), frame_bytes);
        max_gap = max_gap.max(last.elapsed());
        last = Instant::now();
        received += 1;
    }

    // 20 ms ticks: roughly 75 frames in the window.
    assert!(received >= 40, "only {} frames delivered", received);
    assert!(max_gap < Duration::from_millis(200), "gap of {:?}", max_gap);
    // The stalled peer fell behind but stayed connected.
    assert_eq!(relay.registry.len(), 2);
    let stalled_sent = relay
        .registry
        .snapshot()
        .iter()
        .map(|conn| conn.stats().frames_sent.load(Ordering::Relaxed))
        .min()
        .unwrap();
    assert!(
        (stalled_sent as usize) < received / 2,
        "stalled peer accepted {} frames",
        stalled_sent
    );

    relay.shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), relay.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
