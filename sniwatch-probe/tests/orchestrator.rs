//! Verification runs against replayed captures and scripted probes

use async_trait::async_trait;
use parking_lot::Mutex;
use sniwatch_capture::{CaptureBackend, ReplayBackend};
use sniwatch_core::{CaptureConfig, Error, RawFrame, Result};
use sniwatch_packet::{ClientHelloBuilder, MacAddress, PacketBuilder};
use sniwatch_probe::{ActiveProbe, ProbeConfig, ProbeOrchestrator, ProbeOutcome, ProbeTarget, Verdict};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn hello_frame(client: SocketAddr, server: SocketAddr, hostname: &str) -> RawFrame {
    PacketBuilder::new()
        .ethernet(MacAddress([2, 0, 0, 0, 0, 1]), MacAddress([2, 0, 0, 0, 0, 2]))
        .tcp_flow(client, server, 7000)
        .payload(ClientHelloBuilder::new(hostname).to_bytes())
        .build_frame()
        .unwrap()
}

/// Probe that writes its handshake straight into a replay capture
struct ScriptedProbe {
    wire: Mutex<Sender<RawFrame>>,
    local: SocketAddr,
    peer: SocketAddr,
    /// Hostname placed in the probe's own ClientHello; none sends nothing
    wire_hostname: Option<String>,
    /// Other clients' ClientHellos, seen first
    noise: Vec<(SocketAddr, String)>,
    /// Time spent after the handshake before returning
    linger: Duration,
}

impl ScriptedProbe {
    fn new(wire: Sender<RawFrame>, wire_hostname: Option<&str>) -> Self {
        Self {
            wire: Mutex::new(wire),
            local: addr("192.0.2.10:50000"),
            peer: addr("93.184.216.34:443"),
            wire_hostname: wire_hostname.map(str::to_string),
            noise: Vec::new(),
            linger: Duration::ZERO,
        }
    }

    fn with_noise(mut self, hostname: &str) -> Self {
        self.noise.push((addr("192.0.2.99:41000"), hostname.to_string()));
        self
    }

    /// `count` unrelated clients, each on its own source port
    fn with_background_clients(mut self, count: u16) -> Self {
        for i in 0..count {
            let client = SocketAddr::new(addr("192.0.2.99:0").ip(), 42000 + i);
            self.noise.push((client, format!("background{}.example", i)));
        }
        self
    }

    fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

#[async_trait]
impl ActiveProbe for ScriptedProbe {
    async fn probe(&self, _target: &ProbeTarget) -> Result<ProbeOutcome> {
        {
            let wire = self.wire.lock();
            for (client, hostname) in &self.noise {
                let _ = wire.send(hello_frame(*client, self.peer, hostname));
            }
            if let Some(hostname) = &self.wire_hostname {
                let _ = wire.send(hello_frame(self.local, self.peer, hostname));
            }
        }
        if !self.linger.is_zero() {
            tokio::time::sleep(self.linger).await;
        }
        Ok(ProbeOutcome {
            resolved: vec![self.peer],
            peer: Some(self.peer),
            local: Some(self.local),
            tls: None,
            handshake_error: Some("certificate not trusted".to_string()),
        })
    }
}

struct FailingProbe;

#[async_trait]
impl ActiveProbe for FailingProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<ProbeOutcome> {
        Err(Error::Connect(format!("{}: connection refused", target)))
    }
}

fn capture_config() -> CaptureConfig {
    CaptureConfig::new("replay0")
        .with_filter("tcp and port 443")
        .with_read_timeout(Duration::from_millis(50))
}

/// Orchestrator whose capture is `backend`, handed out once
fn orchestrator(config: ProbeConfig, backend: ReplayBackend) -> ProbeOrchestrator {
    let slot = Mutex::new(Some(backend));
    ProbeOrchestrator::new(config).with_backend_factory(move |_| {
        slot.lock()
            .take()
            .map(|backend| Box::new(backend) as Box<dyn CaptureBackend>)
            .ok_or(Error::SessionClosed)
    })
}

fn probe_config(host: &str) -> ProbeConfig {
    ProbeConfig::new(host, 443, capture_config())
        .with_correlation_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_matching_hostname() {
    let (backend, wire) = ReplayBackend::channel();
    let closes = backend.close_counter();
    let probe = ScriptedProbe::new(wire, Some("example.com")).with_noise("unrelated.example");

    let report = orchestrator(probe_config("example.com"), backend)
        .run(&probe)
        .await;

    assert!(matches!(report.verdict, Verdict::Match), "{}", report);
    assert_eq!(report.exit_code(), 0);
    let observed = report.observed.as_ref().unwrap();
    assert_eq!(observed.hostname, "example.com");
    assert!(observed.flow_key().contains(&probe.local));
    assert_eq!(report.capture_stats.as_ref().unwrap().records_published, 2);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_own_hello_survives_background_burst() {
    let (backend, wire) = ReplayBackend::channel();
    let probe = ScriptedProbe::new(wire, Some("example.com"))
        .with_background_clients(20)
        .with_linger(Duration::from_millis(300));

    let config = ProbeConfig::new("example.com", 443, capture_config().with_channel_capacity(16))
        .with_correlation_timeout(Duration::from_secs(2));
    let report = orchestrator(config, backend).run(&probe).await;

    assert!(matches!(report.verdict, Verdict::Match), "{}", report);
    let observed = report.observed.as_ref().unwrap();
    assert!(observed.flow_key().contains(&probe.local));

    let stats = report.capture_stats.as_ref().unwrap();
    assert_eq!(stats.records_published, 21);
    assert_eq!(stats.records_dropped, 0);
}

#[tokio::test]
async fn test_hostname_comparison_ignores_case_and_trailing_dot() {
    let (backend, wire) = ReplayBackend::channel();
    let probe = ScriptedProbe::new(wire, Some("EXAMPLE.com"));

    let report = orchestrator(probe_config("example.com."), backend)
        .run(&probe)
        .await;
    assert!(matches!(report.verdict, Verdict::Match), "{}", report);
}

#[tokio::test]
async fn test_mismatching_hostname() {
    let (backend, wire) = ReplayBackend::channel();
    let probe = ScriptedProbe::new(wire, Some("evil.example"));

    let report = orchestrator(probe_config("example.com"), backend)
        .run(&probe)
        .await;

    match &report.verdict {
        Verdict::Mismatch { expected, observed } => {
            assert_eq!(expected, "example.com");
            assert_eq!(observed, "evil.example");
        }
        other => panic!("Expected mismatch, got {other}"),
    }
    assert_eq!(report.exit_code(), 1);
    assert!(report.to_string().contains("MISMATCH"));
}

#[tokio::test]
async fn test_explicit_expected_hostname() {
    let (backend, wire) = ReplayBackend::channel();
    let probe = ScriptedProbe::new(wire, Some("www.example.com"));

    let config = probe_config("93.184.216.34").with_expected_hostname("www.example.com");
    let report = orchestrator(config, backend).run(&probe).await;
    assert!(matches!(report.verdict, Verdict::Match), "{}", report);
}

#[tokio::test]
async fn test_unrelated_traffic_only_times_out() {
    let (backend, wire) = ReplayBackend::channel();
    let closes = backend.close_counter();
    let probe = ScriptedProbe::new(wire, None).with_noise("example.com");

    let config = probe_config("example.com").with_correlation_timeout(Duration::from_millis(300));
    let report = orchestrator(config, backend).run(&probe).await;

    assert!(matches!(report.verdict, Verdict::CorrelationTimeout), "{}", report);
    assert!(report.observed.is_none());
    assert_eq!(report.exit_code(), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_probe_failure_stops_capture() {
    let (backend, _wire) = ReplayBackend::channel();
    let closes = backend.close_counter();

    let report = orchestrator(probe_config("example.com"), backend)
        .run(&FailingProbe)
        .await;

    assert!(matches!(report.verdict, Verdict::ProbeFailed(Error::Connect(_))));
    assert!(report.capture_stats.is_some());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_capture_failure_skips_probe() {
    struct Recording(Arc<AtomicBool>);

    #[async_trait]
    impl ActiveProbe for Recording {
        async fn probe(&self, _target: &ProbeTarget) -> Result<ProbeOutcome> {
            self.0.store(true, Ordering::SeqCst);
            Ok(ProbeOutcome::default())
        }
    }

    let probed = Arc::new(AtomicBool::new(false));
    let report = ProbeOrchestrator::new(probe_config("example.com"))
        .with_backend_factory(|config| {
            Err(Error::PermissionDenied(format!(
                "capturing on '{}' requires elevated privileges",
                config.interface
            )))
        })
        .run(&Recording(Arc::clone(&probed)))
        .await;

    match &report.verdict {
        Verdict::CaptureFailed(e) => assert!(e.is_capture_side()),
        other => panic!("Expected capture failure, got {other}"),
    }
    assert!(!probed.load(Ordering::SeqCst));
    assert!(report.outcome.is_none());
}

#[tokio::test]
async fn test_filter_install_failure_fails_closed() {
    let (backend, wire) = ReplayBackend::channel();
    let closes = backend.close_counter();
    let probe = ScriptedProbe::new(wire, Some("example.com"));

    let report = orchestrator(probe_config("example.com"), backend.rejecting_filters())
        .run(&probe)
        .await;

    assert!(matches!(
        report.verdict,
        Verdict::CaptureFailed(Error::FilterInstallFailed(_))
    ));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
