//! End-to-end session tests over replayed frames

use sniwatch_capture::{compile, CaptureSession, ReplayBackend, SessionState};
use sniwatch_core::{CaptureConfig, Error, RawFrame};
use sniwatch_packet::{ClientHelloBuilder, MacAddress, PacketBuilder};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

const CLIENT_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
const SERVER_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x02]);

fn segment(client: SocketAddr, server: SocketAddr, seq: u32, payload: &[u8]) -> RawFrame {
    PacketBuilder::new()
        .ethernet(CLIENT_MAC, SERVER_MAC)
        .tcp_flow(client, server, seq)
        .payload(payload.to_vec())
        .build_frame()
        .unwrap()
}

fn client(port: u16) -> SocketAddr {
    format!("192.0.2.10:{}", port).parse().unwrap()
}

fn server() -> SocketAddr {
    "93.184.216.34:443".parse().unwrap()
}

fn config() -> CaptureConfig {
    CaptureConfig::new("replay0")
        .with_filter("tcp and port 443")
        .with_read_timeout(Duration::from_millis(100))
}

#[tokio::test]
async fn test_split_client_hello_yields_one_record() {
    let hello = ClientHelloBuilder::new("example.com").to_bytes();
    let (first, second) = hello.split_at(hello.len() / 2);
    let frames = vec![
        segment(client(50000), server(), 1000, first),
        segment(client(50000), server(), 1000 + first.len() as u32, second),
        // retransmission after completion must not publish again
        segment(client(50000), server(), 1000, &hello),
    ];

    let mut session =
        CaptureSession::with_backend(config(), Box::new(ReplayBackend::new(frames))).unwrap();
    let mut handle = session.start().unwrap();

    let record = handle
        .wait_for_identity(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(record.hostname, "example.com");
    assert_eq!(record.source, client(50000));
    assert_eq!(record.destination, server());

    assert!(matches!(
        handle.wait_for_identity(Duration::from_secs(2)).await,
        Err(Error::SessionClosed)
    ));
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(handle.stats().records_published, 1);
}

#[tokio::test]
async fn test_filter_excludes_other_ports() {
    let hello = ClientHelloBuilder::new("example.com").to_bytes();
    let other: SocketAddr = "93.184.216.34:8443".parse().unwrap();
    let frames = vec![
        segment(client(50001), other, 1, &hello),
        segment(client(50002), server(), 1, &hello),
    ];

    let mut session =
        CaptureSession::with_backend(config(), Box::new(ReplayBackend::new(frames))).unwrap();
    let mut handle = session.start().unwrap();

    let record = handle
        .wait_for_identity(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(record.source, client(50002));

    handle.shutdown().await;
    let stats = session.stats();
    assert_eq!(stats.backend.frames_filtered, 1);
    assert_eq!(stats.records_published, 1);
}

#[tokio::test]
async fn test_budget_overflow_publishes_nothing() {
    let hello = ClientHelloBuilder::new("example.com")
        .with_padding(4000)
        .to_bytes();
    let frames: Vec<RawFrame> = hello
        .chunks(500)
        .scan(1u32, |seq, chunk| {
            let frame = segment(client(50003), server(), *seq, chunk);
            *seq += chunk.len() as u32;
            Some(frame)
        })
        .collect();

    let config = config().with_flow_byte_budget(1024);
    let mut session =
        CaptureSession::with_backend(config, Box::new(ReplayBackend::new(frames))).unwrap();
    let mut handle = session.start().unwrap();

    assert!(matches!(
        handle.wait_for_identity(Duration::from_secs(2)).await,
        Err(Error::SessionClosed)
    ));
    let stats = handle.stats();
    assert_eq!(stats.records_published, 0);
    assert_eq!(stats.flows_overflowed, 1);
}

#[tokio::test]
async fn test_flow_table_stays_bounded() {
    let hello = ClientHelloBuilder::new("example.com").to_bytes();
    let partial = &hello[..hello.len() / 2];

    let mut frames: Vec<RawFrame> = (0..200u16)
        .map(|i| segment(client(40000 + i), server(), 1, partial))
        .collect();
    frames.push(segment(client(60000), server(), 1, &hello));

    let config = config().with_max_flows(8);
    let mut session =
        CaptureSession::with_backend(config, Box::new(ReplayBackend::new(frames))).unwrap();
    let mut handle = session.start().unwrap();

    let record = handle
        .wait_for_identity(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(record.source, client(60000));

    handle.shutdown().await;
    assert_eq!(handle.stats().flows_evicted, 201 - 8);
}

#[tokio::test]
async fn test_slow_consumer_loses_no_records() {
    let frames: Vec<RawFrame> = (0..10u16)
        .map(|i| {
            let hello = ClientHelloBuilder::new(&format!("host{}.example", i)).to_bytes();
            segment(client(45000 + i), server(), 1, &hello)
        })
        .collect();

    let config = config().with_channel_capacity(2);
    let mut session =
        CaptureSession::with_backend(config, Box::new(ReplayBackend::new(frames))).unwrap();
    let mut handle = session.start().unwrap();

    // Let the pump run far ahead of the two-slot queue
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..10u16 {
        let record = handle
            .wait_for_identity(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(record.hostname, format!("host{}.example", i));
        assert_eq!(record.source, client(45000 + i));
    }
    assert!(matches!(
        handle.wait_for_identity(Duration::from_secs(2)).await,
        Err(Error::SessionClosed)
    ));

    let stats = handle.stats();
    assert_eq!(stats.records_published, 10);
    assert_eq!(stats.records_dropped, 0);
}

#[tokio::test]
async fn test_matching_skips_unrelated_flows() {
    let (backend, sender) = ReplayBackend::channel();
    let mut session = CaptureSession::with_backend(config(), Box::new(backend)).unwrap();
    let mut handle = session.start().unwrap();

    let hello_a = ClientHelloBuilder::new("unrelated.example").to_bytes();
    let hello_b = ClientHelloBuilder::new("example.com").to_bytes();
    sender.send(segment(client(50010), server(), 1, &hello_a)).unwrap();
    sender.send(segment(client(50011), server(), 1, &hello_b)).unwrap();

    let wanted = client(50011);
    let record = handle
        .wait_for_identity_matching(|r| r.flow_key().contains(&wanted), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(record.hostname, "example.com");

    handle.shutdown().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_wait_times_out_while_running() {
    let (backend, _sender) = ReplayBackend::channel();
    let mut session = CaptureSession::with_backend(config(), Box::new(backend)).unwrap();
    let mut handle = session.start().unwrap();

    let started = Instant::now();
    let result = handle.wait_for_identity(Duration::from_millis(150)).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(handle.state(), SessionState::Running);

    handle.shutdown().await;
}

#[test]
fn test_stop_is_bounded_and_closes_once() {
    let (backend, _sender) = ReplayBackend::channel();
    let backend = backend.with_read_timeout(Duration::from_millis(100));
    let closes = backend.close_counter();

    let mut session = CaptureSession::with_backend(config(), Box::new(backend)).unwrap();
    let handle = session.start().unwrap();
    std::thread::sleep(Duration::from_millis(30));

    let started = Instant::now();
    session.stop();
    assert!(started.elapsed() < Duration::from_millis(600));

    handle.stop();
    session.stop();
    drop(handle);
    drop(session);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sessions_are_independent() {
    let (first_backend, _first_sender) = ReplayBackend::channel();
    let (second_backend, _second_sender) = ReplayBackend::channel();

    let mut first = CaptureSession::with_backend(config(), Box::new(first_backend)).unwrap();
    let mut second = CaptureSession::with_backend(
        config().with_filter("tcp and port 8443"),
        Box::new(second_backend),
    )
    .unwrap();
    let _first_handle = first.start().unwrap();
    let _second_handle = second.start().unwrap();

    first.stop();
    assert_eq!(first.state(), SessionState::Closed);
    assert_eq!(second.state(), SessionState::Running);
    second.stop();
    assert_eq!(second.state(), SessionState::Closed);
}

#[test]
fn test_compiled_filter_is_deterministic() {
    let expression = "tcp and (port 443 or portrange 8000-8100) and not host 10.0.0.1";
    let first = compile(expression, 2000).unwrap();
    let second = compile(expression, 2000).unwrap();
    assert_eq!(first, second);

    let session = CaptureSession::with_backend(
        config().with_filter(expression),
        Box::new(ReplayBackend::new(Vec::new())),
    )
    .unwrap();
    assert_eq!(session.program(), Some(&first));
}
