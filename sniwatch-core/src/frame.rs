//! Raw captured frames

use std::time::SystemTime;

/// Link-layer framing of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// Ethernet II, optionally VLAN tagged (DLT_EN10MB)
    Ethernet,
    /// Bare IPv4/IPv6 packet with no link header (DLT_RAW)
    RawIp,
    /// Linux cooked capture v1 (DLT_LINUX_SLL)
    LinuxSll,
    /// Any other datalink type
    Other(i32),
}

impl LinkType {
    /// Convert from a libpcap datalink number
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            1 => LinkType::Ethernet,
            12 | 14 | 101 => LinkType::RawIp,
            113 => LinkType::LinuxSll,
            other => LinkType::Other(other),
        }
    }

    /// Libpcap datalink number
    pub fn to_dlt(self) -> i32 {
        match self {
            LinkType::Ethernet => 1,
            LinkType::RawIp => 101,
            LinkType::LinuxSll => 113,
            LinkType::Other(dlt) => dlt,
        }
    }
}

/// A captured frame
///
/// The bytes are owned: backends copy out of their receive buffers before
/// yielding, so a frame stays valid no matter what the backend reads next.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// When the frame was captured
    pub timestamp: SystemTime,
    /// Link-layer framing of `data`
    pub link_type: LinkType,
    /// Captured bytes (may be shorter than the frame on the wire)
    pub data: Vec<u8>,
    /// Length of the frame on the wire
    pub wire_len: usize,
}

impl RawFrame {
    /// Create a complete (untruncated) frame captured now
    pub fn new(link_type: LinkType, data: Vec<u8>) -> Self {
        let wire_len = data.len();
        Self {
            timestamp: SystemTime::now(),
            link_type,
            data,
            wire_len,
        }
    }

    /// Set the capture timestamp
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the on-the-wire length
    pub fn with_wire_len(mut self, wire_len: usize) -> Self {
        self.wire_len = wire_len;
        self
    }

    /// Get frame data as slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of captured bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if no bytes were captured
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True if the snapshot length cut the frame short
    pub fn is_truncated(&self) -> bool {
        self.data.len() < self.wire_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_type_dlt() {
        assert_eq!(LinkType::from_dlt(1), LinkType::Ethernet);
        assert_eq!(LinkType::from_dlt(101), LinkType::RawIp);
        assert_eq!(LinkType::from_dlt(113), LinkType::LinuxSll);
        assert_eq!(LinkType::from_dlt(127), LinkType::Other(127));
        assert_eq!(LinkType::Ethernet.to_dlt(), 1);
    }

    #[test]
    fn test_truncation() {
        let frame = RawFrame::new(LinkType::Ethernet, vec![0; 64]);
        assert!(!frame.is_truncated());
        assert_eq!(frame.len(), 64);

        let frame = frame.with_wire_len(1514);
        assert!(frame.is_truncated());
    }
}
