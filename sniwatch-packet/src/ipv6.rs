//! IPv6 packet construction and parsing
//!
//! The parser walks hop-by-hop, routing and destination-options extension
//! headers to find the upper-layer protocol. A fragment header ends the
//! walk and marks the packet as fragmented.

use crate::ip::IpProtocol;
use bytes::{BufMut, BytesMut};
use std::net::Ipv6Addr;

/// Parsed IPv6 header chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    /// Payload length field (extension headers included)
    pub payload_length: u16,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    /// Upper-layer protocol after all extension headers
    pub protocol: IpProtocol,
    /// Offset of the upper-layer header from the start of the packet
    pub upper_layer_offset: usize,
    /// A fragment header was present
    pub fragmented: bool,
}

impl Ipv6Header {
    /// Extension headers walked before giving up
    pub const MAX_EXTENSION_HEADERS: usize = 8;

    /// Parse the fixed header and extension chain at the start of `data`
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Ipv6Packet::HEADER_SIZE || data[0] >> 4 != 6 {
            return None;
        }

        let payload_length = u16::from_be_bytes([data[4], data[5]]);
        let source = Ipv6Addr::from(<[u8; 16]>::try_from(&data[8..24]).ok()?);
        let destination = Ipv6Addr::from(<[u8; 16]>::try_from(&data[24..40]).ok()?);

        let mut next = IpProtocol::from_u8(data[6]);
        let mut offset = Ipv6Packet::HEADER_SIZE;
        let mut fragmented = false;

        for _ in 0..=Self::MAX_EXTENSION_HEADERS {
            match next {
                IpProtocol::HopByHop | IpProtocol::Routing | IpProtocol::DestinationOptions => {
                    let ext = data.get(offset..offset + 2)?;
                    next = IpProtocol::from_u8(ext[0]);
                    offset += (ext[1] as usize + 1) * 8;
                }
                IpProtocol::Fragment => {
                    let ext = data.get(offset..offset + 8)?;
                    next = IpProtocol::from_u8(ext[0]);
                    offset += 8;
                    fragmented = true;
                    break;
                }
                _ => break,
            }
        }

        if offset > data.len() {
            return None;
        }

        Some(Ipv6Header {
            payload_length,
            hop_limit: data[7],
            source,
            destination,
            protocol: next,
            upper_layer_offset: offset,
            fragmented,
        })
    }

    /// Total packet length claimed by the header
    pub fn total_length(&self) -> usize {
        Ipv6Packet::HEADER_SIZE + self.payload_length as usize
    }
}

/// IPv6 packet under construction
#[derive(Debug, Clone)]
pub struct Ipv6Packet {
    pub hop_limit: u8,
    pub protocol: IpProtocol,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    /// Extension headers as (type, body) pairs; bodies are padded to 8n+6
    pub extensions: Vec<(IpProtocol, Vec<u8>)>,
    pub payload: Vec<u8>,
}

impl Ipv6Packet {
    /// Fixed IPv6 header size
    pub const HEADER_SIZE: usize = 40;

    pub fn new(
        source: Ipv6Addr,
        destination: Ipv6Addr,
        protocol: IpProtocol,
        payload: Vec<u8>,
    ) -> Self {
        Ipv6Packet {
            hop_limit: 64,
            protocol,
            source,
            destination,
            extensions: Vec::new(),
            payload,
        }
    }

    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    /// Append an extension header (hop-by-hop, routing, destination
    /// options or fragment)
    pub fn with_extension(mut self, kind: IpProtocol, mut body: Vec<u8>) -> Self {
        let padded = if kind == IpProtocol::Fragment {
            6
        } else {
            ((body.len() + 2 + 7) & !7) - 2
        };
        body.resize(padded, 0);
        self.extensions.push((kind, body));
        self
    }

    /// Convert the packet to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let ext_len: usize = self.extensions.iter().map(|(_, body)| body.len() + 2).sum();
        let payload_length = (ext_len + self.payload.len()) as u16;

        let first_next = self
            .extensions
            .first()
            .map(|(kind, _)| *kind)
            .unwrap_or(self.protocol);

        let mut buffer = BytesMut::with_capacity(Self::HEADER_SIZE + payload_length as usize);
        buffer.put_u32(6 << 28);
        buffer.put_u16(payload_length);
        buffer.put_u8(first_next.to_u8());
        buffer.put_u8(self.hop_limit);
        buffer.put_slice(&self.source.octets());
        buffer.put_slice(&self.destination.octets());

        for (index, (kind, body)) in self.extensions.iter().enumerate() {
            let next = self
                .extensions
                .get(index + 1)
                .map(|(kind, _)| *kind)
                .unwrap_or(self.protocol);
            buffer.put_u8(next.to_u8());
            let len_units = if *kind == IpProtocol::Fragment {
                0
            } else {
                ((body.len() + 2) / 8 - 1) as u8
            };
            buffer.put_u8(len_units);
            buffer.put_slice(body);
        }

        buffer.put_slice(&self.payload);
        buffer.to_vec()
    }
}
