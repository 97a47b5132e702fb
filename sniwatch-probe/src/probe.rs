//! Active DNS, TCP and TLS probe

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use sniwatch_core::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Endpoint the probe connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Host as given by the user: a DNS name or an IP literal
    pub host: String,
    pub port: u16,
    /// Name sent in the TLS server name extension
    pub server_name: String,
}

impl ProbeTarget {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        let host = host.into();
        Self {
            server_name: host.trim_end_matches('.').to_string(),
            host,
            port,
        }
    }

    pub fn with_server_name<S: Into<String>>(mut self, server_name: S) -> Self {
        self.server_name = server_name.into();
        self
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parameters negotiated by a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSummary {
    pub version: String,
    pub cipher_suite: String,
    pub alpn: Option<String>,
}

/// What the active probe achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Addresses returned by name resolution, in order
    pub resolved: Vec<SocketAddr>,
    /// Address the TCP connection was made to
    pub peer: Option<SocketAddr>,
    /// Local end of the TCP connection
    pub local: Option<SocketAddr>,
    /// Set when the handshake completed
    pub tls: Option<TlsSummary>,
    /// Set when TCP connected but the handshake did not complete
    pub handshake_error: Option<String>,
}

impl ProbeOutcome {
    pub fn handshake_completed(&self) -> bool {
        self.tls.is_some()
    }
}

/// Something that makes a connection whose handshake can be watched
#[async_trait]
pub trait ActiveProbe: Send + Sync {
    /// Resolve, connect and handshake with `target`
    ///
    /// Failing to resolve or connect is an error. A failed handshake is
    /// not: the handshake-initiation message was still sent, so it is
    /// reported in [`ProbeOutcome::handshake_error`].
    async fn probe(&self, target: &ProbeTarget) -> Result<ProbeOutcome>;
}

/// TLS client probe using the webpki trust anchors
#[derive(Debug, Clone)]
pub struct TlsProbe {
    connect_timeout: Duration,
    handshake_timeout: Duration,
    alpn: Vec<String>,
}

impl Default for TlsProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
        }
    }
}

impl TlsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on each TCP connection attempt
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Protocols offered in the ALPN extension; empty disables it
    pub fn with_alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    fn client_config(&self) -> Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Handshake(format!("TLS client setup: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(config)
    }

    async fn resolve(&self, target: &ProbeTarget) -> Result<Vec<SocketAddr>> {
        let host = target.host.trim_end_matches('.');
        let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, target.port))
            .await
            .map_err(|e| Error::Resolve(format!("{}: {}", host, e)))?
            .collect();
        if resolved.is_empty() {
            return Err(Error::Resolve(format!("{}: no addresses", host)));
        }
        debug!(host, addresses = resolved.len(), "Resolved target");
        Ok(resolved)
    }

    /// Try each address in turn until one accepts
    async fn connect(&self, addresses: &[SocketAddr]) -> Result<TcpStream> {
        let mut last_error = String::from("no addresses");
        for addr in addresses {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    debug!(peer = %addr, error = %e, "Connection attempt failed");
                    last_error = format!("{}: {}", addr, e);
                }
                Err(_) => {
                    debug!(peer = %addr, "Connection attempt timed out");
                    last_error = format!(
                        "{}: no answer within {:.1}s",
                        addr,
                        self.connect_timeout.as_secs_f64()
                    );
                }
            }
        }
        Err(Error::Connect(last_error))
    }
}

#[async_trait]
impl ActiveProbe for TlsProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<ProbeOutcome> {
        let mut outcome = ProbeOutcome {
            resolved: self.resolve(target).await?,
            ..ProbeOutcome::default()
        };

        let stream = self.connect(&outcome.resolved).await?;
        outcome.peer = stream.peer_addr().ok();
        outcome.local = stream.local_addr().ok();
        info!(
            target = %target,
            peer = ?outcome.peer,
            local = ?outcome.local,
            "TCP connected"
        );

        let server_name = ServerName::try_from(target.server_name.clone())
            .map_err(|e| Error::Handshake(format!("'{}': {}", target.server_name, e)))?;
        let connector = TlsConnector::from(Arc::new(self.client_config()?));

        match tokio::time::timeout(self.handshake_timeout, connector.connect(server_name, stream))
            .await
        {
            Ok(Ok(mut tls)) => {
                let (_, connection) = tls.get_ref();
                let summary = TlsSummary {
                    version: connection
                        .protocol_version()
                        .map(|v| format!("{:?}", v))
                        .unwrap_or_else(|| "unknown".to_string()),
                    cipher_suite: connection
                        .negotiated_cipher_suite()
                        .map(|s| format!("{:?}", s.suite()))
                        .unwrap_or_else(|| "unknown".to_string()),
                    alpn: connection
                        .alpn_protocol()
                        .map(|p| String::from_utf8_lossy(p).into_owned()),
                };
                info!(
                    version = %summary.version,
                    cipher_suite = %summary.cipher_suite,
                    alpn = summary.alpn.as_deref().unwrap_or("-"),
                    "TLS handshake completed"
                );
                outcome.tls = Some(summary);
                if let Err(e) = tls.shutdown().await {
                    debug!(error = %e, "TLS close_notify failed");
                }
            }
            Ok(Err(e)) => {
                warn!(target = %target, error = %e, "TLS handshake failed");
                outcome.handshake_error = Some(e.to_string());
            }
            Err(_) => {
                warn!(target = %target, "TLS handshake timed out");
                outcome.handshake_error = Some(format!(
                    "no handshake within {:.1}s",
                    self.handshake_timeout.as_secs_f64()
                ));
            }
        }
        Ok(outcome)
    }
}
