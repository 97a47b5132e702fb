//! Example: synthesizing a ClientHello frame and reading its SNI back
//!
//! Builds an Ethernet/IPv4/TCP frame carrying a TLS ClientHello, then runs
//! it through the decoder and the ClientHello scanner.

use sniwatch_packet::ethernet::MacAddress;
use sniwatch_packet::tls::{scan, ClientHelloBuilder, ScanOutcome};
use sniwatch_packet::{Decoded, PacketBuilder, PacketDecoder};

fn main() {
    let hello = ClientHelloBuilder::new("example.com")
        .with_alpn(&["h2", "http/1.1"])
        .with_supported_versions(&[0x0304, 0x0303])
        .to_bytes();

    let frame = PacketBuilder::new()
        .ethernet(
            MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]),
        )
        .tcp_flow(
            "192.168.1.100:51234".parse().expect("valid address"),
            "93.184.216.34:443".parse().expect("valid address"),
            1,
        )
        .payload(hello)
        .build_frame()
        .expect("Failed to build frame");

    println!("Frame built: {} bytes", frame.len());

    let packet = match PacketDecoder::new().decode(&frame) {
        Decoded::Packet(packet) => packet,
        Decoded::Skip(reason) => {
            println!("Frame skipped: {}", reason);
            return;
        }
    };
    println!("Flow: {}", packet.flow_key());
    println!("TCP payload: {} bytes", packet.payload.len());

    match scan(packet.payload) {
        ScanOutcome::Found(info) => {
            println!("SNI: {}", info.hostname);
            println!("ALPN: {}", info.alpn.join(", "));
            println!("Cipher suites offered: {}", info.cipher_suite_count);
            println!("Max version: 0x{:04X}", info.max_version());
        }
        other => println!("No hostname: {}", other),
    }
}
