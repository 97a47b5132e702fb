//! Correlates an active probe with the identity seen on the wire
//!
//! The capture is always running before the probe connects, so the
//! probe's handshake-initiation message cannot slip past unobserved.

use crate::probe::{ActiveProbe, ProbeTarget, TlsProbe};
use crate::report::{ProbeReport, Verdict};
use sniwatch_capture::{CaptureBackend, CaptureSession, CorrelationHandle};
use sniwatch_core::{hostnames_equal, CaptureConfig, Error, IdentityRecord, Result};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Default wait for the identity record after the probe finishes
pub const DEFAULT_CORRELATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on TCP connect and TLS handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Records kept from the capture while the probe is still running
const PROBE_BUFFER_LIMIT: usize = 4096;

/// Opens a capture backend for a configuration
pub type BackendFactory =
    Arc<dyn Fn(&CaptureConfig) -> Result<Box<dyn CaptureBackend>> + Send + Sync>;

/// One verification run
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub host: String,
    pub port: u16,
    pub correlation_timeout: Duration,
    pub connect_timeout: Duration,
    pub capture: CaptureConfig,
    /// Hostname to send and expect; the target host when unset
    pub expected_hostname: Option<String>,
}

impl ProbeConfig {
    pub fn new<S: Into<String>>(host: S, port: u16, capture: CaptureConfig) -> Self {
        Self {
            host: host.into(),
            port,
            correlation_timeout: DEFAULT_CORRELATION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            capture,
            expected_hostname: None,
        }
    }

    pub fn with_correlation_timeout(mut self, timeout: Duration) -> Self {
        self.correlation_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_expected_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.expected_hostname = Some(hostname.into());
        self
    }

    pub fn expected_hostname(&self) -> String {
        self.expected_hostname
            .as_deref()
            .unwrap_or(&self.host)
            .trim_end_matches('.')
            .to_string()
    }

    pub fn target(&self) -> ProbeTarget {
        ProbeTarget::new(self.host.clone(), self.port).with_server_name(self.expected_hostname())
    }
}

/// Runs the capture and the active probe together
pub struct ProbeOrchestrator {
    config: ProbeConfig,
    backend_factory: Option<BackendFactory>,
}

impl ProbeOrchestrator {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            backend_factory: None,
        }
    }

    /// Open capture backends through `factory` instead of the configured backend
    pub fn with_backend_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&CaptureConfig) -> Result<Box<dyn CaptureBackend>> + Send + Sync + 'static,
    {
        self.backend_factory = Some(Arc::new(factory));
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Run with a [`TlsProbe`] bounded by the configured connect timeout
    pub async fn run_tls(&self) -> ProbeReport {
        let probe = TlsProbe::new()
            .with_connect_timeout(self.config.connect_timeout)
            .with_handshake_timeout(self.config.connect_timeout);
        self.run(&probe).await
    }

    /// Capture, probe, correlate, and always stop the capture
    pub async fn run<P: ActiveProbe + ?Sized>(&self, probe: &P) -> ProbeReport {
        let target = self.config.target();
        let expected = self.config.expected_hostname();
        let mut report = ProbeReport {
            target: target.clone(),
            expected: expected.clone(),
            outcome: None,
            observed: None,
            verdict: Verdict::CorrelationTimeout,
            capture_stats: None,
        };

        if expected.parse::<IpAddr>().is_ok() {
            warn!(
                hostname = %expected,
                "IP literal targets carry no server name; pass an explicit hostname"
            );
        }

        let mut session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Capture could not be started");
                report.verdict = Verdict::CaptureFailed(e);
                return report;
            }
        };
        let mut handle = match session.start() {
            Ok(handle) => handle,
            Err(e) => {
                report.verdict = Verdict::CaptureFailed(e);
                report.capture_stats = Some(session.stats());
                return report;
            }
        };

        info!(target = %target, expected = %expected, "Probing");

        // Records are taken while the probe runs and searched afterwards
        let mut seen = VecDeque::new();
        let mut capture_open = true;
        let probing = probe.probe(&target);
        tokio::pin!(probing);
        let probed = loop {
            tokio::select! {
                result = &mut probing => break result,
                next = handle.next_identity(), if capture_open => match next {
                    Ok(record) => {
                        trace!(
                            hostname = %record.hostname,
                            flow = %record.flow_key(),
                            "Identity seen during probe"
                        );
                        if seen.len() == PROBE_BUFFER_LIMIT {
                            seen.pop_front();
                        }
                        seen.push_back(record);
                    }
                    Err(_) => capture_open = false,
                },
            }
        };

        let outcome = match probed {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(target = %target, error = %e, "Probe failed");
                handle.shutdown().await;
                report.verdict = Verdict::ProbeFailed(e);
                report.capture_stats = Some(handle.stats());
                return report;
            }
        };

        let waited = self.correlate(&mut handle, seen, outcome.local).await;
        handle.shutdown().await;
        report.capture_stats = Some(handle.stats());
        report.outcome = Some(outcome);

        report.verdict = match waited {
            Ok(record) => {
                let verdict = if hostnames_equal(&record.hostname, &expected) {
                    Verdict::Match
                } else {
                    Verdict::Mismatch {
                        expected: expected.clone(),
                        observed: record.hostname.clone(),
                    }
                };
                report.observed = Some(record);
                verdict
            }
            Err(Error::Timeout(reason)) => {
                debug!(reason = %reason, "Correlation timed out");
                Verdict::CorrelationTimeout
            }
            Err(e) => Verdict::CaptureFailed(e),
        };
        info!(verdict = %report.verdict, "Verification finished");
        report
    }

    /// Find the record on the probe's own flow, or the first record when
    /// the local address is unknown
    ///
    /// Records taken while the probe ran are searched before waiting.
    async fn correlate(
        &self,
        handle: &mut CorrelationHandle,
        seen: VecDeque<IdentityRecord>,
        local: Option<SocketAddr>,
    ) -> Result<IdentityRecord> {
        let wanted = move |record: &IdentityRecord| {
            local.map_or(true, |local| record.flow_key().contains(&local))
        };

        let buffered = seen.len();
        if let Some(record) = seen.into_iter().find(|record| wanted(record)) {
            debug!(buffered, flow = %record.flow_key(), "Identity observed while probing");
            return Ok(record);
        }
        handle
            .wait_for_identity_matching(wanted, self.config.correlation_timeout)
            .await
    }

    /// Open the capture off the async runtime; opening may block on the OS
    async fn open_session(&self) -> Result<CaptureSession> {
        let capture = self.config.capture.clone();
        let factory = self.backend_factory.clone();

        let opened = tokio::task::spawn_blocking(move || match factory {
            Some(factory) => {
                capture.validate()?;
                let backend = factory(&capture)?;
                CaptureSession::with_backend(capture, backend)
            }
            None => CaptureSession::open(capture),
        })
        .await;

        match opened {
            Ok(result) => result,
            Err(e) => Err(Error::capture(format!("capture open task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_hostname() {
        let config = ProbeConfig::new("Example.com.", 443, CaptureConfig::new("eth0"));
        assert_eq!(config.expected_hostname(), "Example.com");
        assert_eq!(config.target().server_name, "Example.com");
        assert_eq!(config.target().host, "Example.com.");

        let config = config.with_expected_hostname("www.example.com");
        assert_eq!(config.target().server_name, "www.example.com");
    }

    #[tokio::test]
    async fn test_invalid_capture_short_circuits() {
        struct NeverCalled;

        #[async_trait::async_trait]
        impl ActiveProbe for NeverCalled {
            async fn probe(&self, _target: &ProbeTarget) -> Result<crate::ProbeOutcome> {
                panic!("probe ran without a capture");
            }
        }

        let capture = CaptureConfig::new("eth0").with_filter("tcp and port");
        let report = ProbeOrchestrator::new(ProbeConfig::new("example.com", 443, capture))
            .run(&NeverCalled)
            .await;
        assert!(matches!(
            report.verdict,
            Verdict::CaptureFailed(Error::InvalidFilterSyntax { .. })
        ));
        assert!(report.outcome.is_none());
        assert_eq!(report.exit_code(), 1);
    }
}
