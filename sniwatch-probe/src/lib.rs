//! sniwatch probe library
//!
//! Connects to a TLS service while a capture session watches the wire,
//! then checks that the server name carried by the probe's own
//! ClientHello is the one it meant to send.
//!
//! # Example
//!
//! ```no_run
//! use sniwatch_core::CaptureConfig;
//! use sniwatch_probe::{ProbeConfig, ProbeOrchestrator};
//!
//! # async fn run() {
//! let capture = CaptureConfig::new("eth0").with_filter("tcp and port 443");
//! let report = ProbeOrchestrator::new(ProbeConfig::new("example.com", 443, capture))
//!     .run_tls()
//!     .await;
//! println!("{}", report);
//! std::process::exit(report.exit_code());
//! # }
//! ```

pub mod orchestrator;
pub mod probe;
pub mod report;

pub use orchestrator::{BackendFactory, ProbeConfig, ProbeOrchestrator};
pub use probe::{ActiveProbe, ProbeOutcome, ProbeTarget, TlsProbe, TlsSummary};
pub use report::{ProbeReport, Verdict};
