//! Passive capture for sniwatch
//!
//! This crate watches an interface for the TLS ClientHello an active probe
//! sends and reports the hostname that actually went over the wire.
//!
//! ## Features
//!
//! - **Filter compiler**: pcap-filter expressions compiled by libpcap to classic BPF
//! - **Backends**: libpcap live capture, a Linux AF_PACKET receive ring and
//!   an in-memory replay source
//! - **Reassembly**: per-flow buffering of ClientHellos split across segments
//! - **Sessions**: a pump thread publishing identity records to an async handle
//!
//! ## Example
//!
//! ```no_run
//! use sniwatch_capture::{filters, CaptureSession};
//! use sniwatch_core::CaptureConfig;
//! use std::time::Duration;
//!
//! # async fn run() -> sniwatch_core::Result<()> {
//! let config = CaptureConfig::new("eth0").with_filter(filters::tls_filter(443));
//! let mut session = CaptureSession::open(config)?;
//! let mut handle = session.start()?;
//!
//! let record = handle.wait_for_identity(Duration::from_secs(5)).await?;
//! println!("{} -> {}: {}", record.source, record.destination, record.hostname);
//!
//! session.stop();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bpf;
pub mod compiler;
pub mod filters;
pub mod flow;
pub mod session;
pub mod stats;

pub use backend::{
    open_backend, CaptureBackend, FrameRead, LiveBackend, ReplayBackend, RingBackend,
};
pub use bpf::{FilterInstruction, FilterProgram};
pub use compiler::{compile, FilterCompiler};
pub use flow::{FlowLimits, FlowTable, SniffOutcome};
pub use session::{CaptureSession, CorrelationHandle, SessionState};
pub use stats::{CaptureStats, SessionStats, StatsAccumulator};
