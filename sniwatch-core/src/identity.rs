//! Flow keys and identity records observed on the wire

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

/// Direction-agnostic transport flow key
///
/// Both directions of one connection map to the same key: the endpoints
/// are stored in sorted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    low: SocketAddr,
    high: SocketAddr,
}

impl FlowKey {
    /// Build the key for a segment travelling `source -> destination`
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        if source <= destination {
            Self {
                low: source,
                high: destination,
            }
        } else {
            Self {
                low: destination,
                high: source,
            }
        }
    }

    /// The two endpoints in sorted order
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        (self.low, self.high)
    }

    /// True if `addr` is one of the flow's endpoints
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.low == *addr || self.high == *addr
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.low, self.high)
    }
}

/// Hostname carried in a handshake-initiation message, as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Hostname from the identity (server name) extension
    pub hostname: String,
    /// Sender of the handshake-initiation message (the client)
    pub source: SocketAddr,
    /// Receiver of the handshake-initiation message (the server)
    pub destination: SocketAddr,
    /// Capture timestamp of the frame that completed the message
    pub observed_at: SystemTime,
}

impl IdentityRecord {
    pub fn new(
        hostname: String,
        source: SocketAddr,
        destination: SocketAddr,
        observed_at: SystemTime,
    ) -> Self {
        Self {
            hostname,
            source,
            destination,
            observed_at,
        }
    }

    /// Flow this record was observed on
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.source, self.destination)
    }

    /// Compare against a locally intended hostname
    pub fn matches_hostname(&self, expected: &str) -> bool {
        hostnames_equal(&self.hostname, expected)
    }
}

/// Compare two DNS names: ASCII case-insensitive, trailing dot ignored
pub fn hostnames_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_flow_key_direction_agnostic() {
        let a = addr("10.0.0.1:50000");
        let b = addr("93.184.216.34:443");
        assert_eq!(FlowKey::new(a, b), FlowKey::new(b, a));
        assert!(FlowKey::new(a, b).contains(&a));
        assert!(!FlowKey::new(a, b).contains(&addr("10.0.0.1:50001")));
    }

    #[test]
    fn test_hostname_comparison() {
        assert!(hostnames_equal("example.com", "EXAMPLE.com."));
        assert!(!hostnames_equal("example.com", "evil.example"));

        let record = IdentityRecord::new(
            "Example.COM".into(),
            addr("10.0.0.1:50000"),
            addr("93.184.216.34:443"),
            SystemTime::now(),
        );
        assert!(record.matches_hostname("example.com."));
        assert_eq!(
            record.flow_key(),
            FlowKey::new(addr("93.184.216.34:443"), addr("10.0.0.1:50000"))
        );
    }
}
