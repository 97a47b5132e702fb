//! Frame decoding from the link layer up to the TCP payload
//!
//! Anything outside the narrow slice of traffic the sniffer cares about is
//! skipped, never reported as an error: unknown link or network layers,
//! fragments, non-TCP transports and truncated captures.

use crate::ethernet::{EtherType, EthernetHeader};
use crate::ip::{IpProtocol, Ipv4Header};
use crate::ipv6::Ipv6Header;
use crate::tcp::{TcpFlags, TcpHeader};
use sniwatch_core::{FlowKey, LinkType, RawFrame};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

/// Why a frame was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Link type the decoder does not understand
    UnsupportedLink,
    /// Neither IPv4 nor IPv6
    UnsupportedNetwork,
    /// IPv4 or IPv6 fragment
    Fragment,
    /// Transport other than TCP
    NotStream,
    /// Captured bytes stop before the packet does
    Truncated,
    /// Header fields are inconsistent
    Malformed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::UnsupportedLink => "unsupported-link",
            SkipReason::UnsupportedNetwork => "unsupported-network",
            SkipReason::Fragment => "fragment",
            SkipReason::NotStream => "not-stream",
            SkipReason::Truncated => "truncated",
            SkipReason::Malformed => "malformed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded TCP packet; the payload borrows from the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket<'a> {
    pub timestamp: SystemTime,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub sequence: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

impl<'a> DecodedPacket<'a> {
    /// Direction-agnostic flow key
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.source, self.destination)
    }

    /// Sequence number one past the last payload byte
    pub fn end_sequence(&self) -> u32 {
        self.sequence.wrapping_add(self.payload.len() as u32)
    }
}

/// Decoder outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded<'a> {
    Packet(DecodedPacket<'a>),
    Skip(SkipReason),
}

impl<'a> Decoded<'a> {
    pub fn packet(self) -> Option<DecodedPacket<'a>> {
        match self {
            Decoded::Packet(packet) => Some(packet),
            Decoded::Skip(_) => None,
        }
    }
}

/// Stateless frame decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketDecoder;

impl PacketDecoder {
    /// Linux cooked capture header length
    pub const SLL_HEADER_SIZE: usize = 16;

    pub fn new() -> Self {
        PacketDecoder
    }

    /// Decode `frame` down to its TCP payload
    pub fn decode<'a>(&self, frame: &'a RawFrame) -> Decoded<'a> {
        let data = frame.data();
        let (ethertype, network) = match frame.link_type {
            LinkType::Ethernet => match EthernetHeader::parse(data) {
                Some(header) => (header.ethertype, &data[header.payload_offset..]),
                None => return Decoded::Skip(ethernet_skip_reason(data)),
            },
            LinkType::LinuxSll => {
                if data.len() < Self::SLL_HEADER_SIZE {
                    return Decoded::Skip(SkipReason::Truncated);
                }
                let protocol = u16::from_be_bytes([data[14], data[15]]);
                (EtherType::from_u16(protocol), &data[Self::SLL_HEADER_SIZE..])
            }
            LinkType::RawIp => match data.first().map(|b| b >> 4) {
                Some(4) => (EtherType::IPv4, data),
                Some(6) => (EtherType::IPv6, data),
                Some(_) => return Decoded::Skip(SkipReason::UnsupportedNetwork),
                None => return Decoded::Skip(SkipReason::Truncated),
            },
            LinkType::Other(_) => return Decoded::Skip(SkipReason::UnsupportedLink),
        };

        let result = match ethertype {
            EtherType::IPv4 => self.decode_ipv4(network),
            EtherType::IPv6 => self.decode_ipv6(network),
            _ => Err(SkipReason::UnsupportedNetwork),
        };

        let (source_ip, destination_ip, segment) = match result {
            Ok(parts) => parts,
            Err(reason) => return Decoded::Skip(reason),
        };

        let Some(tcp) = TcpHeader::parse(segment) else {
            let claimed = segment.get(12).map_or(usize::MAX, |b| ((b >> 4) as usize) * 4);
            let reason = if segment.len() < claimed.max(20) {
                SkipReason::Truncated
            } else {
                SkipReason::Malformed
            };
            return Decoded::Skip(reason);
        };

        Decoded::Packet(DecodedPacket {
            timestamp: frame.timestamp,
            source: SocketAddr::new(source_ip, tcp.source_port),
            destination: SocketAddr::new(destination_ip, tcp.destination_port),
            sequence: tcp.sequence_number,
            flags: tcp.flags,
            payload: &segment[tcp.header_len..],
        })
    }

    fn decode_ipv4<'a>(
        &self,
        data: &'a [u8],
    ) -> Result<(IpAddr, IpAddr, &'a [u8]), SkipReason> {
        let header = Ipv4Header::parse(data).ok_or_else(|| {
            let claimed = data.first().map_or(usize::MAX, |b| ((b & 0x0F) as usize) * 4);
            if data.len() < claimed.max(20) {
                SkipReason::Truncated
            } else {
                SkipReason::Malformed
            }
        })?;

        if header.is_fragment() {
            return Err(SkipReason::Fragment);
        }
        if header.protocol != IpProtocol::TCP {
            return Err(SkipReason::NotStream);
        }

        // Total length trims Ethernet padding; anything past the capture is truncation
        let total = header.total_length as usize;
        if total > data.len() {
            return Err(SkipReason::Truncated);
        }

        Ok((
            IpAddr::V4(header.source),
            IpAddr::V4(header.destination),
            &data[header.header_len..total],
        ))
    }

    fn decode_ipv6<'a>(
        &self,
        data: &'a [u8],
    ) -> Result<(IpAddr, IpAddr, &'a [u8]), SkipReason> {
        let header = Ipv6Header::parse(data).ok_or_else(|| {
            if data.first().map(|b| b >> 4) == Some(6) {
                SkipReason::Truncated
            } else {
                SkipReason::Malformed
            }
        })?;

        if header.fragmented {
            return Err(SkipReason::Fragment);
        }
        if header.protocol != IpProtocol::TCP {
            return Err(SkipReason::NotStream);
        }

        let total = header.total_length();
        if total > data.len() {
            return Err(SkipReason::Truncated);
        }
        if header.upper_layer_offset > total {
            return Err(SkipReason::Malformed);
        }

        Ok((
            IpAddr::V6(header.source),
            IpAddr::V6(header.destination),
            &data[header.upper_layer_offset..total],
        ))
    }
}

fn ethernet_skip_reason(data: &[u8]) -> SkipReason {
    match data.get(12..14) {
        None => SkipReason::Truncated,
        Some(ethertype) if u16::from_be_bytes([ethertype[0], ethertype[1]]) <= 1500 => {
            SkipReason::UnsupportedNetwork
        }
        // A tag announced but cut off, or more tags than we walk
        Some(_) if data.len() < 22 => SkipReason::Truncated,
        Some(_) => SkipReason::Malformed,
    }
}
