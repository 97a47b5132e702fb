//! Internet checksum (RFC 1071) for constructed packets
//!
//! Only the builder computes checksums. The decoder never verifies them:
//! with transmit checksum offload, frames captured on the sending host
//! routinely carry a placeholder value.

use std::net::IpAddr;

/// Calculates the Internet Checksum as defined in RFC 1071.
///
/// ```
/// use sniwatch_packet::checksum::internet_checksum;
///
/// let header = [0x45, 0x00, 0x00, 0x3c];
/// let _ = internet_checksum(&header);
/// ```
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(accumulate(0, data)) as u16
}

/// Checksum of a TCP or UDP segment including the IPv4 or IPv6
/// pseudo-header
///
/// Mixed address families yield a zero checksum; the builder never mixes
/// them.
pub fn transport_checksum(src_ip: IpAddr, dst_ip: IpAddr, protocol: u8, data: &[u8]) -> u16 {
    let mut sum = match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let sum = accumulate(0, &src.octets());
            let sum = accumulate(sum, &dst.octets());
            sum + protocol as u32 + data.len() as u32
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let sum = accumulate(0, &src.octets());
            let sum = accumulate(sum, &dst.octets());
            let len = data.len() as u32;
            sum + (len >> 16) + (len & 0xFFFF) + protocol as u32
        }
        _ => return 0,
    };
    sum = accumulate(sum, data);
    !fold(sum) as u16
}

/// Validates data that already contains its checksum field
pub fn validate_checksum(data: &[u8]) -> bool {
    let result = internet_checksum(data);
    result == 0 || result == 0xFFFF
}

fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum += (byte as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u32 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum
}
