//! Filter expression compiler
//!
//! Expressions are compiled by libpcap against a dead Ethernet handle, so
//! the full pcap-filter language is available. The resulting program is
//! copied out of libpcap into a [`FilterProgram`], which every backend can
//! use without going back to the source text.

use crate::bpf::{FilterInstruction, FilterProgram, BPF_K, BPF_RET};
use pcap::{Capture, Linktype};
use sniwatch_core::{Error, Result};
use tracing::debug;

/// Compiles filter expressions into [`FilterProgram`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterCompiler;

impl FilterCompiler {
    /// Compile `expression` for an Ethernet link layer
    ///
    /// Accepted frames are truncated to `snaplen`. An empty or blank
    /// expression accepts everything.
    pub fn compile(expression: &str, snaplen: u32) -> Result<FilterProgram> {
        if snaplen == 0 {
            return Err(Error::invalid_config("snapshot length must be non-zero"));
        }

        let expression = expression.trim();
        let dead = Capture::dead(Linktype::ETHERNET)
            .map_err(|e| Error::capture(format!("libpcap compiler unavailable: {}", e)))?;
        let compiled = dead
            .compile(expression, true)
            .map_err(|e| Error::filter_syntax(expression, e.to_string()))?;

        let instructions = compiled
            .get_instructions()
            .iter()
            .map(|insn| decode_instruction(&insn.to_string()))
            .map(|insn| insn.map(|insn| clamp_return(insn, snaplen)))
            .collect::<Result<Vec<_>>>()?;

        let program = FilterProgram::new(instructions)?.with_expression(expression);
        debug!(
            expression,
            instructions = program.len(),
            "Compiled capture filter"
        );
        Ok(program)
    }
}

/// Compile `expression`; see [`FilterCompiler::compile`]
pub fn compile(expression: &str, snaplen: u32) -> Result<FilterProgram> {
    FilterCompiler::compile(expression, snaplen)
}

/// Parse libpcap's `code jt jf k` rendering of one instruction
fn decode_instruction(text: &str) -> Result<FilterInstruction> {
    let malformed = || Error::capture(format!("unexpected BPF instruction '{}'", text));
    let mut fields = text.split_whitespace();
    let mut next = || fields.next().ok_or_else(malformed);

    let code = next()?.parse::<u16>().map_err(|_| malformed())?;
    let jt = next()?.parse::<u8>().map_err(|_| malformed())?;
    let jf = next()?.parse::<u8>().map_err(|_| malformed())?;
    let k = next()?.parse::<u32>().map_err(|_| malformed())?;
    if fields.next().is_some() {
        return Err(malformed());
    }
    Ok(FilterInstruction::new(code, jt, jf, k))
}

/// Constant accepts keep at most `snaplen` bytes
fn clamp_return(insn: FilterInstruction, snaplen: u32) -> FilterInstruction {
    if insn.code == BPF_RET | BPF_K && insn.k > snaplen {
        FilterInstruction::stmt(insn.code, snaplen)
    } else {
        insn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{BPF_ABS, BPF_H, BPF_JEQ, BPF_JMP, BPF_LD};
    use sniwatch_packet::{MacAddress, PacketBuilder};

    const SNAPLEN: u32 = 2000;

    fn frame(src: &str, dst: &str) -> PacketBuilder {
        PacketBuilder::new()
            .ethernet(MacAddress([2, 0, 0, 0, 0, 1]), MacAddress([2, 0, 0, 0, 0, 2]))
            .tcp_flow(src.parse().unwrap(), dst.parse().unwrap(), 1)
    }

    fn bytes(builder: PacketBuilder) -> Vec<u8> {
        builder.payload(vec![0x16, 0x03, 0x01]).build().unwrap()
    }

    #[test]
    fn test_decode_instruction() {
        assert_eq!(
            decode_instruction("40 0 0 12").unwrap(),
            FilterInstruction::stmt(BPF_LD | BPF_H | BPF_ABS, 12)
        );
        assert_eq!(
            decode_instruction("21 0 5 34525").unwrap(),
            FilterInstruction::jump(BPF_JMP | BPF_JEQ | BPF_K, 0x86dd, 0, 5)
        );
        for text in ["", "40 0 0", "40 0 0 12 7", "40 0 256 12", "ldh [12]"] {
            assert!(decode_instruction(text).is_err(), "{text:?}");
        }
    }

    #[test]
    fn test_clamp_return() {
        let accept = FilterInstruction::stmt(BPF_RET | BPF_K, 262144);
        assert_eq!(clamp_return(accept, SNAPLEN).k, SNAPLEN);

        let reject = FilterInstruction::stmt(BPF_RET | BPF_K, 0);
        assert_eq!(clamp_return(reject, SNAPLEN).k, 0);

        let load = FilterInstruction::stmt(BPF_LD | BPF_H | BPF_ABS, 65535);
        assert_eq!(clamp_return(load, SNAPLEN), load);
    }

    #[test]
    fn test_empty_expression_accepts_all() {
        for expression in ["", "   "] {
            let program = compile(expression, SNAPLEN).unwrap();
            assert_eq!(program.run(&[0u8; 4]), SNAPLEN);
            assert_eq!(program.expression(), Some(""));
        }
    }

    #[test]
    fn test_tcp_and_port_443() {
        let program = compile("tcp and port 443", SNAPLEN).unwrap();
        assert_eq!(program.expression(), Some("tcp and port 443"));

        let v4 = bytes(frame("10.0.0.2:50000", "93.184.216.34:443"));
        assert_eq!(program.run(&v4), SNAPLEN);

        let reverse = bytes(frame("93.184.216.34:443", "10.0.0.2:50000"));
        assert!(program.matches(&reverse));

        let v6 = bytes(frame("[2001:db8::2]:50000", "[2001:db8::1]:443"));
        assert!(program.matches(&v6));

        let other_port = bytes(frame("10.0.0.2:50000", "10.0.0.1:80"));
        assert!(!program.matches(&other_port));

        let udp = PacketBuilder::new()
            .ethernet(MacAddress([2, 0, 0, 0, 0, 1]), MacAddress([2, 0, 0, 0, 0, 2]))
            .ipv4("10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap())
            .udp(50000, 443)
            .build()
            .unwrap();
        assert!(!program.matches(&udp));
    }

    #[test]
    fn test_port_follows_ip_options() {
        let program = compile("dst port 443", SNAPLEN).unwrap();
        let with_options = frame("10.0.0.2:50000", "10.0.0.1:443").ip_options(vec![1; 8]);
        assert!(program.matches(&bytes(with_options)));
    }

    #[test]
    fn test_port_rejects_later_fragments() {
        let program = compile("port 443", SNAPLEN).unwrap();
        let fragment = frame("10.0.0.2:50000", "10.0.0.1:443").fragment(10, false);
        assert!(!program.matches(&bytes(fragment)));
    }

    #[test]
    fn test_vlan_and_net_primitives() {
        let tagged = bytes(frame("10.0.0.2:50000", "10.0.0.1:443").vlan(42));
        let untagged = bytes(frame("10.0.0.2:50000", "10.0.0.1:443"));

        let vlan = compile("vlan and tcp port 443", SNAPLEN).unwrap();
        assert!(vlan.matches(&tagged));
        assert!(!vlan.matches(&untagged));

        let net = compile("dst net 10.0.0.0/24", SNAPLEN).unwrap();
        assert!(net.matches(&untagged));
        assert!(!compile("net 192.168.0.0/16", SNAPLEN)
            .unwrap()
            .matches(&untagged));
    }

    #[test]
    fn test_direction_and_grouping() {
        let https = bytes(frame("10.0.0.2:50000", "10.0.0.1:443"));
        let ssh = bytes(frame("10.0.0.2:50000", "10.0.0.1:22"));

        assert!(compile("src port 50000", SNAPLEN).unwrap().matches(&https));
        assert!(!compile("src port 443", SNAPLEN).unwrap().matches(&https));
        assert!(compile("src host 10.0.0.2 && dst host 10.0.0.1", SNAPLEN)
            .unwrap()
            .matches(&https));

        let grouped = compile("!(dst port 22 || dst port 80) and ip", SNAPLEN).unwrap();
        assert!(grouped.matches(&https));
        assert!(!grouped.matches(&ssh));

        let range = compile("tcp dst portrange 400-500", SNAPLEN).unwrap();
        assert!(range.matches(&https));
        assert!(!range.matches(&ssh));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let expression = "tcp and (port 443 or portrange 8000-8100) and not host 10.0.0.1";
        let first = compile(expression, SNAPLEN).unwrap();
        let second = compile(expression, SNAPLEN).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_syntax_errors() {
        for expression in ["tcp and", "port", "port 70000", "tcp port 443)", "bogus 1"] {
            match compile(expression, SNAPLEN) {
                Err(Error::InvalidFilterSyntax { expression: text, reason }) => {
                    assert_eq!(text, expression);
                    assert!(!reason.is_empty());
                }
                other => panic!("Expected syntax error for {expression:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_zero_snaplen_rejected() {
        assert!(matches!(compile("tcp", 0), Err(Error::InvalidConfig(_))));
    }
}
