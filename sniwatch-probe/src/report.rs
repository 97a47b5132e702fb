//! Verification report

use crate::probe::{ProbeOutcome, ProbeTarget};
use sniwatch_capture::SessionStats;
use sniwatch_core::{Error, IdentityRecord};
use std::fmt;

/// Result of comparing the intended hostname with the one on the wire
#[derive(Debug)]
pub enum Verdict {
    /// The observed hostname equals the expected one
    Match,
    /// A different hostname was observed on the probe's flow
    Mismatch { expected: String, observed: String },
    /// No identity record for the probe's flow arrived in time
    CorrelationTimeout,
    /// The wire could not be observed
    CaptureFailed(Error),
    /// The active probe did not get far enough to send a handshake
    ProbeFailed(Error),
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }

    /// Process exit code: 0 only for a match
    pub fn exit_code(&self) -> i32 {
        if self.is_match() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Match => write!(f, "MATCH"),
            Verdict::Mismatch { expected, observed } => {
                write!(f, "MISMATCH (expected {}, observed {})", expected, observed)
            }
            Verdict::CorrelationTimeout => write!(f, "NO IDENTITY OBSERVED"),
            Verdict::CaptureFailed(e) => write!(f, "CAPTURE FAILED ({})", e),
            Verdict::ProbeFailed(e) => write!(f, "PROBE FAILED ({})", e),
        }
    }
}

/// Everything learned from one verification run
#[derive(Debug)]
pub struct ProbeReport {
    pub target: ProbeTarget,
    /// Hostname the wire was expected to carry
    pub expected: String,
    /// Absent when the probe failed or never ran
    pub outcome: Option<ProbeOutcome>,
    /// Identity record correlated with the probe's flow
    pub observed: Option<IdentityRecord>,
    pub verdict: Verdict,
    /// Absent when the capture could not be started
    pub capture_stats: Option<SessionStats>,
}

impl ProbeReport {
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Target:   {}", self.target)?;

        match &self.outcome {
            Some(outcome) => {
                let resolved = outcome
                    .resolved
                    .iter()
                    .map(|addr| addr.ip().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(f, "DNS:      {}", resolved)?;

                match (outcome.peer, outcome.local) {
                    (Some(peer), Some(local)) => {
                        writeln!(f, "TCP:      {} -> {}", local, peer)?
                    }
                    (Some(peer), None) => writeln!(f, "TCP:      connected to {}", peer)?,
                    _ => writeln!(f, "TCP:      not connected")?,
                }

                match (&outcome.tls, &outcome.handshake_error) {
                    (Some(tls), _) => writeln!(
                        f,
                        "TLS:      {} {} alpn={}",
                        tls.version,
                        tls.cipher_suite,
                        tls.alpn.as_deref().unwrap_or("-")
                    )?,
                    (None, Some(error)) => writeln!(f, "TLS:      handshake failed: {}", error)?,
                    (None, None) => writeln!(f, "TLS:      not attempted")?,
                }
            }
            None => writeln!(f, "Probe:    not completed")?,
        }

        match &self.observed {
            Some(record) => writeln!(
                f,
                "Wire SNI: {} on {} (expected {})",
                record.hostname,
                record.flow_key(),
                self.expected
            )?,
            None => writeln!(f, "Wire SNI: none (expected {})", self.expected)?,
        }

        if let Some(stats) = &self.capture_stats {
            for line in stats.format().lines() {
                writeln!(f, "          {}", line)?;
            }
        }

        write!(f, "Result:   {}", self.verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::TlsSummary;
    use std::time::SystemTime;

    fn outcome() -> ProbeOutcome {
        ProbeOutcome {
            resolved: vec!["93.184.216.34:443".parse().unwrap()],
            peer: Some("93.184.216.34:443".parse().unwrap()),
            local: Some("192.0.2.10:50000".parse().unwrap()),
            tls: Some(TlsSummary {
                version: "TLSv1_3".into(),
                cipher_suite: "TLS13_AES_128_GCM_SHA256".into(),
                alpn: Some("h2".into()),
            }),
            handshake_error: None,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Verdict::Match.exit_code(), 0);
        assert_eq!(Verdict::CorrelationTimeout.exit_code(), 1);
        assert_eq!(
            Verdict::Mismatch {
                expected: "example.com".into(),
                observed: "evil.example".into()
            }
            .exit_code(),
            1
        );
        assert_eq!(
            Verdict::CaptureFailed(Error::PermissionDenied("eth0".into())).exit_code(),
            1
        );
        assert_eq!(
            Verdict::ProbeFailed(Error::Resolve("nowhere.invalid".into())).exit_code(),
            1
        );
    }

    #[test]
    fn test_report_display() {
        let observed = IdentityRecord::new(
            "example.com".into(),
            "192.0.2.10:50000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
            SystemTime::now(),
        );
        let report = ProbeReport {
            target: ProbeTarget::new("example.com", 443),
            expected: "example.com".into(),
            outcome: Some(outcome()),
            observed: Some(observed),
            verdict: Verdict::Match,
            capture_stats: None,
        };

        let text = report.to_string();
        assert!(text.contains("Target:   example.com:443"));
        assert!(text.contains("DNS:      93.184.216.34"));
        assert!(text.contains("TCP:      192.0.2.10:50000 -> 93.184.216.34:443"));
        assert!(text.contains("alpn=h2"));
        assert!(text.contains("Wire SNI: example.com"));
        assert!(text.ends_with("Result:   MATCH"));
    }

    #[test]
    fn test_report_without_probe() {
        let report = ProbeReport {
            target: ProbeTarget::new("example.com", 443),
            expected: "example.com".into(),
            outcome: None,
            observed: None,
            verdict: Verdict::CaptureFailed(Error::InterfaceNotFound("nope0".into())),
            capture_stats: None,
        };
        let text = report.to_string();
        assert!(text.contains("Probe:    not completed"));
        assert!(text.contains("Wire SNI: none"));
        assert!(text.contains("CAPTURE FAILED"));
        assert_eq!(report.exit_code(), 1);
    }
}
