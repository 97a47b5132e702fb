//! IPv4 packet construction and parsing
//!
//! Parsing honours the IHL field so that header options are skipped
//! exactly, and exposes fragmentation state so callers can discard
//! fragments.

use crate::checksum::internet_checksum;
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    /// IPv6 hop-by-hop options (0)
    HopByHop,
    /// ICMP (1)
    ICMP,
    /// TCP (6)
    TCP,
    /// UDP (17)
    UDP,
    /// IPv6 routing header (43)
    Routing,
    /// IPv6 fragment header (44)
    Fragment,
    /// ICMPv6 (58)
    ICMPv6,
    /// IPv6 no next header (59)
    NoNext,
    /// IPv6 destination options (60)
    DestinationOptions,
    /// Custom protocol number
    Custom(u8),
}

impl IpProtocol {
    pub fn to_u8(self) -> u8 {
        match self {
            IpProtocol::HopByHop => 0,
            IpProtocol::ICMP => 1,
            IpProtocol::TCP => 6,
            IpProtocol::UDP => 17,
            IpProtocol::Routing => 43,
            IpProtocol::Fragment => 44,
            IpProtocol::ICMPv6 => 58,
            IpProtocol::NoNext => 59,
            IpProtocol::DestinationOptions => 60,
            IpProtocol::Custom(val) => val,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => IpProtocol::HopByHop,
            1 => IpProtocol::ICMP,
            6 => IpProtocol::TCP,
            17 => IpProtocol::UDP,
            43 => IpProtocol::Routing,
            44 => IpProtocol::Fragment,
            58 => IpProtocol::ICMPv6,
            59 => IpProtocol::NoNext,
            60 => IpProtocol::DestinationOptions,
            val => IpProtocol::Custom(val),
        }
    }
}

/// IP Flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpFlags {
    /// Reserved bit (must be 0)
    pub reserved: bool,
    /// Don't Fragment flag
    pub dont_fragment: bool,
    /// More Fragments flag
    pub more_fragments: bool,
}

impl IpFlags {
    /// No flags set
    pub const NONE: IpFlags = IpFlags {
        reserved: false,
        dont_fragment: false,
        more_fragments: false,
    };

    /// Don't Fragment flag set
    pub const DONT_FRAGMENT: IpFlags = IpFlags {
        reserved: false,
        dont_fragment: true,
        more_fragments: false,
    };

    /// More Fragments flag set
    pub const MORE_FRAGMENTS: IpFlags = IpFlags {
        reserved: false,
        dont_fragment: false,
        more_fragments: true,
    };

    /// Convert to 3-bit value
    pub fn to_u8(self) -> u8 {
        let mut flags = 0u8;
        if self.reserved {
            flags |= 0b100;
        }
        if self.dont_fragment {
            flags |= 0b010;
        }
        if self.more_fragments {
            flags |= 0b001;
        }
        flags
    }

    /// Parse from 3-bit value
    pub fn from_u8(value: u8) -> Self {
        IpFlags {
            reserved: (value & 0b100) != 0,
            dont_fragment: (value & 0b010) != 0,
            more_fragments: (value & 0b001) != 0,
        }
    }
}

/// Parsed IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes, options included
    pub header_len: usize,
    /// Total length (header + data) in bytes
    pub total_length: u16,
    pub identification: u16,
    pub flags: IpFlags,
    /// Fragment offset (in 8-byte blocks)
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse the header at the start of `data`
    ///
    /// Returns `None` unless the version is 4, the IHL is at least 5, the
    /// whole header (options included) was captured, and the total length
    /// covers the header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Ipv4Packet::MIN_HEADER_SIZE {
            return None;
        }

        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;
        if version != 4 || ihl < 5 {
            return None;
        }

        let header_len = (ihl as usize) * 4;
        if data.len() < header_len {
            return None;
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < header_len {
            return None;
        }

        let flags_and_offset = u16::from_be_bytes([data[6], data[7]]);

        Some(Ipv4Header {
            header_len,
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags: IpFlags::from_u8((flags_and_offset >> 13) as u8),
            fragment_offset: flags_and_offset & 0x1FFF,
            ttl: data[8],
            protocol: IpProtocol::from_u8(data[9]),
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// True for any fragment, first or later
    pub fn is_fragment(&self) -> bool {
        self.flags.more_fragments || self.fragment_offset != 0
    }
}

/// IPv4 packet under construction
#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    pub identification: u16,
    pub flags: IpFlags,
    /// Fragment offset (in 8-byte blocks)
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Options, padded to a 4-byte boundary
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Ipv4Packet {
    /// Minimum IPv4 header size (without options)
    pub const MIN_HEADER_SIZE: usize = 20;

    /// Maximum IPv4 header size (with maximum options)
    pub const MAX_HEADER_SIZE: usize = 60;

    pub fn new(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: IpProtocol,
        payload: Vec<u8>,
    ) -> Self {
        Ipv4Packet {
            identification: 0,
            flags: IpFlags::DONT_FRAGMENT,
            fragment_offset: 0,
            ttl: 64,
            protocol,
            source,
            destination,
            options: Vec::new(),
            payload,
        }
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    pub fn with_flags(mut self, flags: IpFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_fragment_offset(mut self, offset: u16) -> Self {
        self.fragment_offset = offset & 0x1FFF;
        self
    }

    /// Set IP options, padded to a 4-byte boundary and capped at 40 bytes
    pub fn with_options(mut self, mut options: Vec<u8>) -> Self {
        options.truncate(Self::MAX_HEADER_SIZE - Self::MIN_HEADER_SIZE);
        let padded_len = (options.len() + 3) & !3;
        options.resize(padded_len, 0);
        self.options = options;
        self
    }

    /// Header size in bytes
    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_SIZE + self.options.len()
    }

    /// Convert the packet to bytes with a valid header checksum
    pub fn to_bytes(&self) -> Vec<u8> {
        let header_len = self.header_len();
        let total_length = (header_len + self.payload.len()) as u16;

        let mut buffer = BytesMut::with_capacity(total_length as usize);
        buffer.put_u8((4 << 4) | (header_len / 4) as u8);
        buffer.put_u8(0);
        buffer.put_u16(total_length);
        buffer.put_u16(self.identification);
        buffer.put_u16(((self.flags.to_u8() as u16) << 13) | self.fragment_offset);
        buffer.put_u8(self.ttl);
        buffer.put_u8(self.protocol.to_u8());
        buffer.put_u16(0);
        buffer.put_slice(&self.source.octets());
        buffer.put_slice(&self.destination.octets());
        buffer.put_slice(&self.options);

        let checksum = internet_checksum(&buffer[..header_len]);
        buffer[10..12].copy_from_slice(&checksum.to_be_bytes());

        buffer.put_slice(&self.payload);
        buffer.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::validate_checksum;

    fn sample() -> Ipv4Packet {
        Ipv4Packet::new(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            IpProtocol::TCP,
            vec![0x01, 0x02, 0x03, 0x04],
        )
    }

    #[test]
    fn test_ip_protocol_conversion() {
        assert_eq!(IpProtocol::TCP.to_u8(), 6);
        assert_eq!(IpProtocol::from_u8(17), IpProtocol::UDP);
        assert_eq!(IpProtocol::from_u8(200), IpProtocol::Custom(200));
    }

    #[test]
    fn test_ip_flags() {
        assert_eq!(IpFlags::DONT_FRAGMENT.to_u8(), 0b010);
        assert!(IpFlags::from_u8(0b001).more_fragments);
    }

    #[test]
    fn test_to_bytes_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes[0], 0x45);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 24);
        assert_eq!(bytes[9], 6);
        assert_eq!(&bytes[12..16], &[192, 168, 1, 1]);
        assert_eq!(&bytes[20..], &[0x01, 0x02, 0x03, 0x04]);
        assert!(validate_checksum(&bytes[..20]));
    }

    #[test]
    fn test_parse_with_options() {
        let bytes = sample().with_options(vec![0x94, 0x04, 0x00, 0x00, 0x01]).to_bytes();
        let header = Ipv4Header::parse(&bytes).unwrap();
        assert_eq!(header.header_len, 28);
        assert_eq!(header.total_length as usize, bytes.len());
        assert_eq!(&bytes[header.header_len..], &[0x01, 0x02, 0x03, 0x04]);
        assert!(validate_checksum(&bytes[..28]));
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        let mut bytes = sample().to_bytes();
        assert!(Ipv4Header::parse(&bytes[..19]).is_none());

        bytes[0] = 0x44; // IHL 4
        assert!(Ipv4Header::parse(&bytes).is_none());

        bytes[0] = 0x4F; // IHL 15 but only 24 bytes present
        assert!(Ipv4Header::parse(&bytes).is_none());

        bytes[0] = 0x65; // version 6
        assert!(Ipv4Header::parse(&bytes).is_none());
    }

    #[test]
    fn test_fragment_detection() {
        let first = sample().with_flags(IpFlags::MORE_FRAGMENTS).to_bytes();
        assert!(Ipv4Header::parse(&first).unwrap().is_fragment());

        let later = sample().with_flags(IpFlags::NONE).with_fragment_offset(185).to_bytes();
        let header = Ipv4Header::parse(&later).unwrap();
        assert_eq!(header.fragment_offset, 185);
        assert!(header.is_fragment());

        assert!(!Ipv4Header::parse(&sample().to_bytes()).unwrap().is_fragment());
    }
}
