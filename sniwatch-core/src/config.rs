//! Capture configuration

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default snapshot length (maximum bytes kept per frame)
pub const DEFAULT_SNAPLEN: u32 = 2000;

/// Largest snapshot length accepted by either backend
pub const MAX_SNAPLEN: u32 = 262_144;

/// Default read timeout for a single frame read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Default upper bound on tracked flows
pub const DEFAULT_MAX_FLOWS: usize = 256;

/// Default per-flow reassembly budget in bytes
pub const DEFAULT_FLOW_BYTE_BUDGET: usize = 16 * 1024;

/// Default idle time after which a partial flow is abandoned
pub const DEFAULT_FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the identity record queue
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Kernel capture mechanism used to open an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Live capture through the platform capture library (libpcap)
    GenericLive,
    /// Raw packet socket with a kernel-shared receive ring (Linux AF_PACKET)
    RawRing,
}

impl BackendKind {
    /// Name used on the command line
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::GenericLive => "pcap",
            BackendKind::RawRing => "afpacket",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pcap" | "live" | "generic" => Ok(BackendKind::GenericLive),
            "afpacket" | "af_packet" | "ring" | "raw" => Ok(BackendKind::RawRing),
            other => Err(Error::UnsupportedBackend(other.to_string())),
        }
    }
}

/// What a session does when its filter cannot be installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterFailurePolicy {
    /// Abort session open with `FilterInstallFailed`
    #[default]
    FailClosed,
    /// Log the failure and capture unfiltered traffic
    FailOpen,
}

/// Configuration for a capture session
///
/// Immutable once handed to a session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Interface to capture on
    pub interface: String,
    /// Backend used to open the interface
    pub backend: BackendKind,
    /// Optional filter expression limiting captured traffic
    pub filter: Option<String>,
    /// Maximum bytes kept per frame
    pub snaplen: u32,
    /// Upper bound on a single blocking frame read
    pub read_timeout: Duration,
    /// Behaviour when the filter cannot be installed
    pub filter_failure_policy: FilterFailurePolicy,
    /// Upper bound on concurrently tracked flows
    pub max_flows: usize,
    /// Bytes a single flow may buffer before it is abandoned
    pub flow_byte_budget: usize,
    /// Idle time after which a partial flow is abandoned
    pub flow_idle_timeout: Duration,
    /// Capacity of the identity record queue
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            backend: BackendKind::GenericLive,
            filter: None,
            snaplen: DEFAULT_SNAPLEN,
            read_timeout: DEFAULT_READ_TIMEOUT,
            filter_failure_policy: FilterFailurePolicy::default(),
            max_flows: DEFAULT_MAX_FLOWS,
            flow_byte_budget: DEFAULT_FLOW_BYTE_BUDGET,
            flow_idle_timeout: DEFAULT_FLOW_IDLE_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl CaptureConfig {
    /// Create a configuration for the given interface with defaults
    pub fn new<S: Into<String>>(interface: S) -> Self {
        Self {
            interface: interface.into(),
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_snaplen(mut self, snaplen: u32) -> Self {
        self.snaplen = snaplen;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_filter_failure_policy(mut self, policy: FilterFailurePolicy) -> Self {
        self.filter_failure_policy = policy;
        self
    }

    pub fn with_max_flows(mut self, max_flows: usize) -> Self {
        self.max_flows = max_flows;
        self
    }

    pub fn with_flow_byte_budget(mut self, budget: usize) -> Self {
        self.flow_byte_budget = budget;
        self
    }

    pub fn with_flow_idle_timeout(mut self, timeout: Duration) -> Self {
        self.flow_idle_timeout = timeout;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Filter expression, with blank expressions treated as absent
    pub fn filter_expression(&self) -> Option<&str> {
        self.filter
            .as_deref()
            .map(str::trim)
            .filter(|expr| !expr.is_empty())
    }

    /// Check the configuration before any capture resource is acquired
    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(Error::invalid_config("interface name is empty"));
        }
        if self.snaplen == 0 || self.snaplen > MAX_SNAPLEN {
            return Err(Error::invalid_config(format!(
                "snapshot length {} outside 1..={}",
                self.snaplen, MAX_SNAPLEN
            )));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::invalid_config("read timeout must be non-zero"));
        }
        if self.max_flows == 0 {
            return Err(Error::invalid_config("max_flows must be at least 1"));
        }
        if self.flow_byte_budget == 0 {
            return Err(Error::invalid_config("flow byte budget must be non-zero"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::invalid_config("channel capacity must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.snaplen, DEFAULT_SNAPLEN);
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT);
        assert_eq!(config.backend, BackendKind::GenericLive);
        assert_eq!(config.filter_failure_policy, FilterFailurePolicy::FailClosed);
        assert!(config.filter.is_none());
    }

    #[test]
    fn test_validate() {
        assert!(CaptureConfig::new("eth0").validate().is_ok());
        assert!(CaptureConfig::new("  ").validate().is_err());
        assert!(CaptureConfig::new("eth0").with_snaplen(0).validate().is_err());
        assert!(CaptureConfig::new("eth0")
            .with_snaplen(MAX_SNAPLEN + 1)
            .validate()
            .is_err());
        assert!(CaptureConfig::new("eth0")
            .with_read_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(CaptureConfig::new("eth0").with_max_flows(0).validate().is_err());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("pcap".parse::<BackendKind>().unwrap(), BackendKind::GenericLive);
        assert_eq!("AFPACKET".parse::<BackendKind>().unwrap(), BackendKind::RawRing);
        assert!(matches!(
            "netmap".parse::<BackendKind>(),
            Err(Error::UnsupportedBackend(_))
        ));
        assert_eq!(BackendKind::RawRing.to_string(), "afpacket");
    }

    #[test]
    fn test_filter_expression_blank() {
        let config = CaptureConfig::new("eth0").with_filter("   ");
        assert_eq!(config.filter_expression(), None);
        let config = CaptureConfig::new("eth0").with_filter(" tcp ");
        assert_eq!(config.filter_expression(), Some("tcp"));
    }
}
