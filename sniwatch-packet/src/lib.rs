//! Frame decoding and packet construction for sniwatch
//!
//! This crate turns captured frames into TCP payloads and finds the TLS
//! ClientHello in them. It also builds frames, so that every layer above
//! it can be tested against synthetic traffic instead of live captures.
//!
//! - [`decoder`] - link/network/transport decoding down to the TCP payload
//! - [`tls`] - ClientHello recognition, SNI extraction and a ClientHello builder
//! - [`builder`] - fluent construction of whole frames
//! - [`ethernet`], [`ip`], [`ipv6`], [`tcp`], [`udp`] - header views and builders
//! - [`checksum`] - Internet checksum for constructed packets
//!
//! # Decoding a frame
//!
//! ```rust
//! use sniwatch_packet::tls::{scan, ClientHelloBuilder, ScanOutcome};
//! use sniwatch_packet::{PacketBuilder, PacketDecoder};
//!
//! let frame = PacketBuilder::new()
//!     .raw_ip()
//!     .tcp_flow("10.0.0.2:40000".parse().unwrap(), "10.0.0.1:443".parse().unwrap(), 1)
//!     .payload(ClientHelloBuilder::new("example.com").to_bytes())
//!     .build_frame()
//!     .unwrap();
//!
//! let packet = PacketDecoder::new().decode(&frame).packet().unwrap();
//! match scan(packet.payload) {
//!     ScanOutcome::Found(info) => assert_eq!(info.hostname, "example.com"),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

pub mod builder;
pub mod checksum;
pub mod decoder;
pub mod ethernet;
pub mod ip;
pub mod ipv6;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use builder::PacketBuilder;
pub use checksum::{internet_checksum, transport_checksum};
pub use decoder::{Decoded, DecodedPacket, PacketDecoder, SkipReason};
pub use ethernet::{EtherType, EthernetFrame, EthernetHeader, MacAddress};
pub use ip::{IpProtocol, Ipv4Header, Ipv4Packet};
pub use ipv6::{Ipv6Header, Ipv6Packet};
pub use tcp::{TcpFlags, TcpHeader, TcpSegment};
pub use tls::{scan, ClientHelloBuilder, ClientHelloInfo, ScanOutcome};
pub use udp::UdpDatagram;
