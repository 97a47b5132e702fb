//! Ethernet frame construction and parsing
//!
//! Building produces padded Ethernet II frames; parsing walks up to two
//! 802.1Q/802.1ad VLAN tags and reports where the network layer begins.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// EtherType values the decoder cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    /// IPv4 (0x0800)
    IPv4,
    /// ARP (0x0806)
    ARP,
    /// 802.1Q VLAN tag (0x8100)
    VLAN,
    /// IPv6 (0x86DD)
    IPv6,
    /// 802.1ad service tag (0x88A8)
    QinQ,
    /// Anything else
    Custom(u16),
}

impl EtherType {
    /// Convert EtherType to u16 value
    pub fn to_u16(self) -> u16 {
        match self {
            EtherType::IPv4 => 0x0800,
            EtherType::ARP => 0x0806,
            EtherType::VLAN => 0x8100,
            EtherType::IPv6 => 0x86DD,
            EtherType::QinQ => 0x88A8,
            EtherType::Custom(val) => val,
        }
    }

    /// Create EtherType from u16 value
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0800 => EtherType::IPv4,
            0x0806 => EtherType::ARP,
            0x8100 => EtherType::VLAN,
            0x86DD => EtherType::IPv6,
            0x88A8 => EtherType::QinQ,
            val => EtherType::Custom(val),
        }
    }

    /// True for tag protocol identifiers that precede another EtherType
    pub fn is_vlan_tag(self) -> bool {
        matches!(self, EtherType::VLAN | EtherType::QinQ)
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherType::IPv4 => write!(f, "IPv4"),
            EtherType::ARP => write!(f, "ARP"),
            EtherType::VLAN => write!(f, "VLAN"),
            EtherType::IPv6 => write!(f, "IPv6"),
            EtherType::QinQ => write!(f, "Q-in-Q"),
            EtherType::Custom(val) => write!(f, "0x{:04X}", val),
        }
    }
}

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Broadcast MAC address (FF:FF:FF:FF:FF:FF)
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// Zero MAC address (00:00:00:00:00:00)
    pub const ZERO: MacAddress = MacAddress([0x00; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    /// Create a MAC address from a slice
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = slice.try_into().ok()?;
        Some(MacAddress(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

/// Parsed Ethernet header, borrowed from the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub destination: MacAddress,
    pub source: MacAddress,
    /// VLAN IDs of the tags that were walked, outermost first
    pub vlan_ids: [Option<u16>; 2],
    /// EtherType after all VLAN tags
    pub ethertype: EtherType,
    /// Offset of the network layer within the frame
    pub payload_offset: usize,
}

impl EthernetHeader {
    /// Maximum number of stacked VLAN tags walked before giving up
    pub const MAX_VLAN_TAGS: usize = 2;

    /// Parse the link header; `None` if the frame is too short, carries an
    /// 802.3 length field, or stacks more tags than supported
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < EthernetFrame::HEADER_SIZE {
            return None;
        }

        let destination = MacAddress::from_slice(&data[0..6])?;
        let source = MacAddress::from_slice(&data[6..12])?;

        let mut vlan_ids = [None; Self::MAX_VLAN_TAGS];
        let mut offset = 12;
        let mut ethertype = EtherType::from_u16(read_u16(data, offset)?);
        offset += 2;

        let mut tags = 0;
        while ethertype.is_vlan_tag() {
            if tags == Self::MAX_VLAN_TAGS {
                return None;
            }
            let tci = read_u16(data, offset)?;
            vlan_ids[tags] = Some(tci & 0x0FFF);
            ethertype = EtherType::from_u16(read_u16(data, offset + 2)?);
            offset += 4;
            tags += 1;
        }

        // Values <= 1500 are 802.3 lengths, not EtherTypes
        if ethertype.to_u16() <= 1500 {
            return None;
        }

        Some(EthernetHeader {
            destination,
            source,
            vlan_ids,
            ethertype,
            payload_offset: offset,
        })
    }
}

/// Ethernet II frame under construction
#[derive(Debug, Clone)]
pub struct EthernetFrame {
    pub destination: MacAddress,
    pub source: MacAddress,
    /// 802.1Q tag control information, if tagged
    pub vlan_tci: Option<u16>,
    pub ethertype: EtherType,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// Minimum Ethernet frame size (without FCS)
    pub const MIN_FRAME_SIZE: usize = 60;

    /// Ethernet header size (dst + src + type)
    pub const HEADER_SIZE: usize = 14;

    /// Size of one 802.1Q tag
    pub const VLAN_TAG_SIZE: usize = 4;

    pub fn new(
        destination: MacAddress,
        source: MacAddress,
        ethertype: EtherType,
        payload: Vec<u8>,
    ) -> Self {
        EthernetFrame {
            destination,
            source,
            vlan_tci: None,
            ethertype,
            payload,
        }
    }

    /// Insert an 802.1Q tag carrying `vlan_id`
    pub fn with_vlan(mut self, vlan_id: u16) -> Self {
        self.vlan_tci = Some(vlan_id & 0x0FFF);
        self
    }

    /// Convert the frame to bytes, padded to the minimum frame size
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = BytesMut::with_capacity(
            Self::HEADER_SIZE + Self::VLAN_TAG_SIZE + self.payload.len(),
        );

        buffer.put_slice(self.destination.as_bytes());
        buffer.put_slice(self.source.as_bytes());

        if let Some(tci) = self.vlan_tci {
            buffer.put_u16(EtherType::VLAN.to_u16());
            buffer.put_u16(tci);
        }

        buffer.put_u16(self.ethertype.to_u16());
        buffer.put_slice(&self.payload);

        let mut result = buffer.to_vec();
        if result.len() < Self::MIN_FRAME_SIZE {
            result.resize(Self::MIN_FRAME_SIZE, 0);
        }
        result
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
