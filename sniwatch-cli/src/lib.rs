//! CLI interface for sniwatch
//!
//! Argument parsing, endpoint handling and the glue that turns a parsed
//! command line into a verification run.

pub mod args;

pub use args::Cli;

use sniwatch_capture::filters::tls_filter;
use sniwatch_core::{
    default_interface, interface_for_address, list_interfaces, CaptureConfig, Error,
    FilterFailurePolicy, Result,
};
use sniwatch_probe::{ProbeConfig, ProbeOrchestrator};
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Host and port of the service to probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// DNS name (trailing dot allowed) or IP literal without brackets
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host:port`, `[v6addr]:port` or `fqdn.:port`
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                Error::invalid_config(format!("'{}': missing ']' after IPv6 address", input))
            })?;
            let port = after.strip_prefix(':').ok_or_else(|| {
                Error::invalid_config(format!("'{}': expected ':PORT' after ']'", input))
            })?;
            if host.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(Error::invalid_config(format!(
                    "'{}' is not an IPv6 address",
                    host
                )));
            }
            (host, port)
        } else {
            let (host, port) = input.rsplit_once(':').ok_or_else(|| {
                Error::invalid_config(format!("'{}': expected HOST:PORT", input))
            })?;
            if host.contains(':') {
                return Err(Error::invalid_config(format!(
                    "'{}': IPv6 addresses must be written as [ADDRESS]:PORT",
                    input
                )));
            }
            (host, port)
        };

        if host.is_empty() || host == "." {
            return Err(Error::invalid_config(format!("'{}': empty host", input)));
        }
        let port = match port.parse::<u16>() {
            Ok(0) | Err(_) => {
                return Err(Error::invalid_config(format!(
                    "'{}': port must be 1-65535",
                    input
                )))
            }
            Ok(port) => port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// The host as an address, if it is an IP literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

/// Log level used when `RUST_LOG` is not set
pub fn default_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(verbose)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Interface to capture on: explicit, the one owning a local target, or the default
fn choose_interface(cli: &Cli, endpoint: &Endpoint) -> Result<String> {
    if let Some(name) = &cli.interface {
        return Ok(name.clone());
    }
    if let Some(iface) = endpoint.ip().as_ref().and_then(interface_for_address) {
        info!(interface = %iface.name, "Target is local, capturing on its interface");
        return Ok(iface.name);
    }
    Ok(default_interface()?.name)
}

/// Build the verification run described by the command line
pub fn probe_config(cli: &Cli) -> Result<ProbeConfig> {
    let target = cli
        .target
        .as_deref()
        .ok_or_else(|| Error::invalid_config("no HOST:PORT given"))?;
    let endpoint = Endpoint::parse(target)?;

    if !cli.timeout.is_finite() || cli.timeout <= 0.0 {
        return Err(Error::invalid_config(format!(
            "timeout must be a positive number of seconds, got {}",
            cli.timeout
        )));
    }

    let filter = cli
        .filter
        .clone()
        .unwrap_or_else(|| tls_filter(endpoint.port));
    let policy = if cli.fail_open {
        FilterFailurePolicy::FailOpen
    } else {
        FilterFailurePolicy::FailClosed
    };

    let capture = CaptureConfig::new(choose_interface(cli, &endpoint)?)
        .with_backend(cli.backend)
        .with_filter(filter)
        .with_snaplen(cli.snaplen)
        .with_read_timeout(Duration::from_millis(cli.read_timeout_ms))
        .with_filter_failure_policy(policy);
    capture.validate()?;

    let timeout = Duration::from_secs_f64(cli.timeout);
    let mut config = ProbeConfig::new(endpoint.host, endpoint.port, capture)
        .with_correlation_timeout(timeout)
        .with_connect_timeout(timeout);
    if let Some(sni) = &cli.sni {
        config = config.with_expected_hostname(sni.clone());
    }
    Ok(config)
}

/// Run the command line and return the process exit code
pub async fn run(cli: Cli) -> Result<i32> {
    if cli.list_interfaces {
        for iface in list_interfaces()? {
            println!("{}", iface);
        }
        return Ok(0);
    }

    let config = probe_config(&cli)?;
    info!(
        interface = %config.capture.interface,
        backend = %config.capture.backend,
        filter = config.capture.filter_expression().unwrap_or(""),
        "Starting verification"
    );

    let report = ProbeOrchestrator::new(config).run_tls().await;
    println!("{}", report);
    Ok(report.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            Endpoint::parse("example.com:443").unwrap(),
            Endpoint {
                host: "example.com".into(),
                port: 443
            }
        );
        assert_eq!(Endpoint::parse("example.com.:8443").unwrap().host, "example.com.");

        let v6 = Endpoint::parse("[2001:db8::1]:443").unwrap();
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.ip(), Some("2001:db8::1".parse().unwrap()));

        assert_eq!(
            Endpoint::parse("192.0.2.1:443").unwrap().ip(),
            Some("192.0.2.1".parse().unwrap())
        );
        assert_eq!(Endpoint::parse("example.com:443").unwrap().ip(), None);
    }

    #[test]
    fn test_parse_endpoint_errors() {
        for input in [
            "example.com",
            "example.com:",
            "example.com:0",
            "example.com:65536",
            ":443",
            "2001:db8::1:443",
            "[2001:db8::1]443",
            "[2001:db8::1:443",
            "[example.com]:443",
        ] {
            match Endpoint::parse(input) {
                Err(Error::InvalidConfig(_)) => {}
                other => panic!("{input}: expected InvalidConfig, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_default_log_level() {
        assert_eq!(default_log_level(0), "warn");
        assert_eq!(default_log_level(1), "info");
        assert_eq!(default_log_level(2), "debug");
        assert_eq!(default_log_level(7), "trace");
    }

    #[test]
    fn test_probe_config_from_args() {
        let cli = Cli::try_parse_from([
            "sniwatch",
            "-I",
            "eth0",
            "-t",
            "2",
            "--sni",
            "www.example.com",
            "--fail-open",
            "example.com.:8443",
        ])
        .unwrap();
        let config = probe_config(&cli).unwrap();

        assert_eq!(config.host, "example.com.");
        assert_eq!(config.port, 8443);
        assert_eq!(config.expected_hostname(), "www.example.com");
        assert_eq!(config.correlation_timeout, Duration::from_secs(2));
        assert_eq!(config.capture.interface, "eth0");
        assert_eq!(config.capture.filter_expression(), Some("tcp and port 8443"));
        assert_eq!(
            config.capture.filter_failure_policy,
            FilterFailurePolicy::FailOpen
        );
    }

    #[test]
    fn test_probe_config_rejects_bad_values() {
        let cli = Cli::try_parse_from(["sniwatch", "-I", "eth0", "-t", "0", "example.com:443"])
            .unwrap();
        assert!(matches!(probe_config(&cli), Err(Error::InvalidConfig(_))));

        let cli = Cli::try_parse_from([
            "sniwatch",
            "-I",
            "eth0",
            "--snaplen",
            "0",
            "example.com:443",
        ])
        .unwrap();
        assert!(matches!(probe_config(&cli), Err(Error::InvalidConfig(_))));
    }
}
