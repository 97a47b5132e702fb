//! Packet builder for constructing frames with a fluent API
//!
//! Used to synthesize captures: decoder, filter and flow-table tests build
//! their frames here instead of carrying hex dumps.

use crate::ethernet::{EtherType, EthernetFrame, MacAddress};
use crate::ip::{IpFlags, IpProtocol, Ipv4Packet};
use crate::ipv6::Ipv6Packet;
use crate::tcp::{TcpFlags, TcpSegment};
use crate::udp::UdpDatagram;
use bytes::{BufMut, BytesMut};
use sniwatch_core::{Error, LinkType, RawFrame, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Layer 2 framing
#[derive(Debug, Clone)]
enum Layer2 {
    Ethernet {
        src: MacAddress,
        dst: MacAddress,
        vlan: Option<u16>,
    },
    LinuxSll,
    RawIp,
}

/// Layer 3 packet type
#[derive(Debug, Clone)]
enum Layer3 {
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        ttl: u8,
        identification: u16,
        flags: IpFlags,
        fragment_offset: u16,
        options: Vec<u8>,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
        extensions: Vec<(IpProtocol, Vec<u8>)>,
    },
}

/// Layer 4 segment/datagram type
#[derive(Debug, Clone)]
enum Layer4 {
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Tcp {
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        options: Vec<u8>,
    },
}

/// Packet builder with fluent API
///
/// # Examples
///
/// ```
/// use sniwatch_packet::PacketBuilder;
/// use sniwatch_packet::ethernet::MacAddress;
///
/// let frame = PacketBuilder::new()
///     .ethernet(MacAddress([0x02, 0, 0, 0, 0, 1]), MacAddress([0x02, 0, 0, 0, 0, 2]))
///     .ipv4("10.0.0.1".parse().unwrap(), "93.184.216.34".parse().unwrap())
///     .tcp(40000, 443, 1, 0)
///     .payload(vec![0x16, 0x03, 0x01])
///     .build()
///     .unwrap();
/// assert_eq!(&frame[12..14], &[0x08, 0x00]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PacketBuilder {
    layer2: Option<Layer2>,
    layer3: Option<Layer3>,
    layer4: Option<Layer4>,
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ethernet II framing
    pub fn ethernet(mut self, src: MacAddress, dst: MacAddress) -> Self {
        self.layer2 = Some(Layer2::Ethernet {
            src,
            dst,
            vlan: None,
        });
        self
    }

    /// Add an 802.1Q tag; must be called after `ethernet()`
    pub fn vlan(mut self, vlan_id: u16) -> Self {
        if let Some(Layer2::Ethernet { ref mut vlan, .. }) = self.layer2 {
            *vlan = Some(vlan_id);
        }
        self
    }

    /// Linux cooked capture (SLL) framing
    pub fn linux_sll(mut self) -> Self {
        self.layer2 = Some(Layer2::LinuxSll);
        self
    }

    /// No link header; the frame starts at the IP header
    pub fn raw_ip(mut self) -> Self {
        self.layer2 = Some(Layer2::RawIp);
        self
    }

    pub fn ipv4(mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        self.layer3 = Some(Layer3::Ipv4 {
            src,
            dst,
            ttl: 64,
            identification: 0,
            flags: IpFlags::DONT_FRAGMENT,
            fragment_offset: 0,
            options: Vec::new(),
        });
        self
    }

    pub fn ipv6(mut self, src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        self.layer3 = Some(Layer3::Ipv6 {
            src,
            dst,
            hop_limit: 64,
            extensions: Vec::new(),
        });
        self
    }

    /// IPv4 or IPv6 layer by address family; mixed pairs use IPv4-mapped IPv6
    pub fn ip(self, src: IpAddr, dst: IpAddr) -> Self {
        match (src, dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => self.ipv4(src, dst),
            (IpAddr::V6(src), IpAddr::V6(dst)) => self.ipv6(src, dst),
            (IpAddr::V4(src), IpAddr::V6(dst)) => self.ipv6(src.to_ipv6_mapped(), dst),
            (IpAddr::V6(src), IpAddr::V4(dst)) => self.ipv6(src, dst.to_ipv6_mapped()),
        }
    }

    /// Set the TTL or hop limit
    pub fn ttl(mut self, new_ttl: u8) -> Self {
        match self.layer3 {
            Some(Layer3::Ipv4 { ref mut ttl, .. }) => *ttl = new_ttl,
            Some(Layer3::Ipv6 {
                ref mut hop_limit, ..
            }) => *hop_limit = new_ttl,
            None => {}
        }
        self
    }

    /// Set the IPv4 identification
    pub fn identification(mut self, id: u16) -> Self {
        if let Some(Layer3::Ipv4 {
            ref mut identification,
            ..
        }) = self.layer3
        {
            *identification = id;
        }
        self
    }

    /// Set IPv4 options
    pub fn ip_options(mut self, data: Vec<u8>) -> Self {
        if let Some(Layer3::Ipv4 {
            ref mut options, ..
        }) = self.layer3
        {
            *options = data;
        }
        self
    }

    /// Mark the IPv4 packet as a fragment at `offset` (in 8-byte blocks)
    pub fn fragment(mut self, offset: u16, more: bool) -> Self {
        if let Some(Layer3::Ipv4 {
            ref mut flags,
            ref mut fragment_offset,
            ..
        }) = self.layer3
        {
            *flags = if more {
                IpFlags::MORE_FRAGMENTS
            } else {
                IpFlags::NONE
            };
            *fragment_offset = offset;
        }
        self
    }

    /// Append an IPv6 extension header
    pub fn ipv6_extension(mut self, kind: IpProtocol, body: Vec<u8>) -> Self {
        if let Some(Layer3::Ipv6 {
            ref mut extensions,
            ..
        }) = self.layer3
        {
            extensions.push((kind, body));
        }
        self
    }

    pub fn udp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.layer4 = Some(Layer4::Udp { src_port, dst_port });
        self
    }

    /// Add a TCP layer; flags default to PSH+ACK
    pub fn tcp(mut self, src_port: u16, dst_port: u16, seq: u32, ack: u32) -> Self {
        self.layer4 = Some(Layer4::Tcp {
            src_port,
            dst_port,
            seq,
            ack,
            flags: TcpFlags::PSH_ACK,
            options: Vec::new(),
        });
        self
    }

    /// Set the TCP flags; must be called after `tcp()`
    pub fn tcp_flags(mut self, new_flags: TcpFlags) -> Self {
        if let Some(Layer4::Tcp { ref mut flags, .. }) = self.layer4 {
            *flags = new_flags;
        }
        self
    }

    /// Set TCP options; must be called after `tcp()`
    pub fn tcp_options(mut self, data: Vec<u8>) -> Self {
        if let Some(Layer4::Tcp {
            ref mut options, ..
        }) = self.layer4
        {
            *options = data;
        }
        self
    }

    /// IP layer plus TCP layer between two socket addresses
    pub fn tcp_flow(self, src: SocketAddr, dst: SocketAddr, seq: u32) -> Self {
        self.ip(src.ip(), dst.ip()).tcp(src.port(), dst.port(), seq, 0)
    }

    pub fn payload(mut self, data: Vec<u8>) -> Self {
        self.payload = data;
        self
    }

    /// Build the complete frame
    ///
    /// # Errors
    ///
    /// Returns an error if a layer is missing below a configured one, or if
    /// no link framing was chosen.
    pub fn build(&self) -> Result<Vec<u8>> {
        let layer2 = self
            .layer2
            .as_ref()
            .ok_or_else(|| Error::PacketConstruction("Layer 2 is required".into()))?;

        let network = self.build_network()?;
        let (ethertype, packet) = match network {
            Some((ethertype, packet)) => (ethertype, packet),
            None => (EtherType::Custom(0x88B5), self.payload.clone()),
        };

        let frame = match layer2 {
            Layer2::Ethernet { src, dst, vlan } => {
                let mut frame = EthernetFrame::new(*dst, *src, ethertype, packet);
                if let Some(vlan) = vlan {
                    frame = frame.with_vlan(*vlan);
                }
                frame.to_bytes()
            }
            Layer2::LinuxSll => {
                let mut buffer = BytesMut::with_capacity(16 + packet.len());
                buffer.put_u16(0); // packet type: to us
                buffer.put_u16(1); // ARPHRD_ETHER
                buffer.put_u16(6);
                buffer.put_slice(&[0x02, 0, 0, 0, 0, 1, 0, 0]);
                buffer.put_u16(ethertype.to_u16());
                buffer.put_slice(&packet);
                buffer.to_vec()
            }
            Layer2::RawIp => packet,
        };

        Ok(frame)
    }

    /// Build and wrap the bytes as a captured frame
    pub fn build_frame(&self) -> Result<RawFrame> {
        let link_type = match self.layer2 {
            Some(Layer2::Ethernet { .. }) | None => LinkType::Ethernet,
            Some(Layer2::LinuxSll) => LinkType::LinuxSll,
            Some(Layer2::RawIp) => LinkType::RawIp,
        };
        Ok(RawFrame::new(link_type, self.build()?))
    }

    fn build_network(&self) -> Result<Option<(EtherType, Vec<u8>)>> {
        let Some(layer3) = &self.layer3 else {
            if self.layer4.is_some() {
                return Err(Error::PacketConstruction("Layer 4 requires Layer 3".into()));
            }
            return Ok(None);
        };

        let (src_ip, dst_ip) = match layer3 {
            Layer3::Ipv4 { src, dst, .. } => (IpAddr::V4(*src), IpAddr::V4(*dst)),
            Layer3::Ipv6 { src, dst, .. } => (IpAddr::V6(*src), IpAddr::V6(*dst)),
        };

        let (protocol, transport) = match &self.layer4 {
            Some(Layer4::Udp { src_port, dst_port }) => (
                IpProtocol::UDP,
                UdpDatagram::new(*src_port, *dst_port, self.payload.clone())
                    .to_bytes_with_checksum(src_ip, dst_ip),
            ),
            Some(Layer4::Tcp {
                src_port,
                dst_port,
                seq,
                ack,
                flags,
                options,
            }) => (
                IpProtocol::TCP,
                TcpSegment::new(*src_port, *dst_port, self.payload.clone())
                    .with_sequence(*seq)
                    .with_acknowledgment(*ack)
                    .with_flags(*flags)
                    .with_options(options.clone())
                    .to_bytes_with_checksum(src_ip, dst_ip),
            ),
            None => (IpProtocol::NoNext, self.payload.clone()),
        };

        let packet = match layer3 {
            Layer3::Ipv4 {
                src,
                dst,
                ttl,
                identification,
                flags,
                fragment_offset,
                options,
            } => (
                EtherType::IPv4,
                Ipv4Packet::new(*src, *dst, protocol, transport)
                    .with_ttl(*ttl)
                    .with_identification(*identification)
                    .with_flags(*flags)
                    .with_fragment_offset(*fragment_offset)
                    .with_options(options.clone())
                    .to_bytes(),
            ),
            Layer3::Ipv6 {
                src,
                dst,
                hop_limit,
                extensions,
            } => {
                let mut packet =
                    Ipv6Packet::new(*src, *dst, protocol, transport).with_hop_limit(*hop_limit);
                for (kind, body) in extensions {
                    packet = packet.with_extension(*kind, body.clone());
                }
                (EtherType::IPv6, packet.to_bytes())
            }
        };

        Ok(Some(packet))
    }
}
