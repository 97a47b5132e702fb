//! CLI argument parsing

use clap::Parser;
use sniwatch_core::BackendKind;

#[derive(Parser, Debug)]
#[command(name = "sniwatch")]
#[command(
    version,
    about = "Verify the TLS server name a connection actually puts on the wire",
    long_about = None
)]
pub struct Cli {
    /// Service to probe, as HOST:PORT ([v6addr]:PORT for IPv6 literals)
    #[arg(value_name = "HOST:PORT", required_unless_present = "list_interfaces")]
    pub target: Option<String>,

    /// Network interface to capture on (default: first interface that is up)
    #[arg(short = 'I', long)]
    pub interface: Option<String>,

    /// Capture backend: pcap or afpacket
    #[arg(short = 'b', long, default_value = "pcap")]
    pub backend: BackendKind,

    /// Capture filter (default: "tcp and port <PORT>")
    #[arg(short = 'f', long, value_name = "EXPRESSION")]
    pub filter: Option<String>,

    /// Bytes captured per frame
    #[arg(long, default_value_t = 2000)]
    pub snaplen: u32,

    /// Upper bound on a single capture read, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 200)]
    pub read_timeout_ms: u64,

    /// Seconds to wait for the handshake to show up on the wire
    #[arg(short = 't', long, value_name = "SECONDS", default_value_t = 5.0)]
    pub timeout: f64,

    /// Server name to send and expect (default: HOST)
    #[arg(long, value_name = "HOSTNAME")]
    pub sni: Option<String>,

    /// Capture unfiltered if the filter cannot be installed
    #[arg(long)]
    pub fail_open: bool,

    /// Verbose output (-v, -vv, -vvv for increasing verbosity)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// List capture interfaces and exit
    #[arg(long)]
    pub list_interfaces: bool,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["sniwatch", "example.com:443"]).unwrap();
        assert_eq!(cli.target.as_deref(), Some("example.com:443"));
        assert_eq!(cli.backend, BackendKind::GenericLive);
        assert_eq!(cli.snaplen, 2000);
        assert_eq!(cli.read_timeout_ms, 200);
        assert_eq!(cli.timeout, 5.0);
        assert!(!cli.fail_open);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_all_options() {
        let cli = Cli::try_parse_from([
            "sniwatch",
            "-I",
            "eth0",
            "-b",
            "afpacket",
            "-f",
            "tcp and port 8443",
            "--snaplen",
            "4096",
            "--read-timeout-ms",
            "50",
            "-t",
            "2.5",
            "--sni",
            "www.example.com",
            "--fail-open",
            "-vv",
            "[2001:db8::1]:8443",
        ])
        .unwrap();
        assert_eq!(cli.interface.as_deref(), Some("eth0"));
        assert_eq!(cli.backend, BackendKind::RawRing);
        assert_eq!(cli.filter.as_deref(), Some("tcp and port 8443"));
        assert_eq!(cli.snaplen, 4096);
        assert_eq!(cli.read_timeout_ms, 50);
        assert_eq!(cli.timeout, 2.5);
        assert_eq!(cli.sni.as_deref(), Some("www.example.com"));
        assert!(cli.fail_open);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_target_required() {
        assert!(Cli::try_parse_from(["sniwatch"]).is_err());
        assert!(Cli::try_parse_from(["sniwatch", "--list-interfaces"]).is_ok());
        assert!(Cli::try_parse_from(["sniwatch", "-b", "netmap", "example.com:443"]).is_err());
    }
}
