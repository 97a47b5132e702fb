//! UDP datagram construction
//!
//! The decoder skips UDP; datagrams are built so that filter and decoder
//! tests can feed non-stream traffic through the pipeline.

use crate::checksum::transport_checksum;
use bytes::{BufMut, BytesMut};
use std::net::IpAddr;

/// UDP datagram under construction
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    /// UDP header size
    pub const HEADER_SIZE: usize = 8;

    pub fn new(source_port: u16, destination_port: u16, payload: Vec<u8>) -> Self {
        UdpDatagram {
            source_port,
            destination_port,
            payload,
        }
    }

    /// Header plus payload length
    pub fn len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Convert to bytes with the checksum left at zero (valid for IPv4)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = BytesMut::with_capacity(self.len());
        buffer.put_u16(self.source_port);
        buffer.put_u16(self.destination_port);
        buffer.put_u16(self.len() as u16);
        buffer.put_u16(0);
        buffer.put_slice(&self.payload);
        buffer.to_vec()
    }

    /// Convert to bytes with a pseudo-header checksum
    ///
    /// A computed value of zero is sent as 0xFFFF, since zero means
    /// "no checksum".
    pub fn to_bytes_with_checksum(&self, src_ip: IpAddr, dst_ip: IpAddr) -> Vec<u8> {
        let mut bytes = self.to_bytes();
        let checksum = match transport_checksum(src_ip, dst_ip, 17, &bytes) {
            0 => 0xFFFF,
            value => value,
        };
        bytes[6..8].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }
}
