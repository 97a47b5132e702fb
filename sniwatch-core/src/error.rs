//! Error types for sniwatch

use thiserror::Error;

/// Result type alias for sniwatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by reports to tell a
/// failure to watch the wire apart from a failure of the probe itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad configuration (filter syntax, unknown backend); raised before capture
    Config,
    /// Capture handle could not be acquired (interface, privilege, platform)
    Acquisition,
    /// Capture failed after the handle was acquired
    Capture,
    /// Active probe failed (DNS, TCP, TLS)
    Probe,
}

/// Main error type for sniwatch
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Filter expression could not be parsed
    #[error("Invalid filter syntax in '{expression}': {reason}")]
    InvalidFilterSyntax { expression: String, reason: String },

    /// Filter compiled but cannot be expressed as a classic BPF program
    #[error("Filter too complex: {0}")]
    FilterTooComplex(String),

    /// Invalid capture configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Requested backend is not available on this platform
    #[error("Unsupported capture backend: {0}")]
    UnsupportedBackend(String),

    /// Interface not found
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    /// Insufficient privileges to open a capture handle
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Filter program could not be attached to the capture handle
    #[error("Failed to install filter: {0}")]
    FilterInstallFailed(String),

    /// Operation on a session or handle that was already closed
    #[error("Capture session closed")]
    SessionClosed,

    /// Capture error
    #[error("Packet capture error: {0}")]
    Capture(String),

    /// Packet construction error
    #[error("Packet construction error: {0}")]
    PacketConstruction(String),

    /// Name resolution failed
    #[error("DNS resolution failed: {0}")]
    Resolve(String),

    /// Transport connection failed
    #[error("TCP connection failed: {0}")]
    Connect(String),

    /// Security handshake failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Timed out waiting for an event
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Create a capture error with a custom message
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Error::Capture(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Create a filter syntax error
    pub fn filter_syntax<E: Into<String>, R: Into<String>>(expression: E, reason: R) -> Self {
        Error::InvalidFilterSyntax {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidFilterSyntax { .. }
            | Error::FilterTooComplex(_)
            | Error::InvalidConfig(_) => ErrorCategory::Config,
            Error::UnsupportedBackend(_)
            | Error::InterfaceNotFound(_)
            | Error::PermissionDenied(_)
            | Error::FilterInstallFailed(_) => ErrorCategory::Acquisition,
            Error::Io(_)
            | Error::SessionClosed
            | Error::Capture(_)
            | Error::PacketConstruction(_) => ErrorCategory::Capture,
            Error::Resolve(_) | Error::Connect(_) | Error::Handshake(_) | Error::Timeout(_) => {
                ErrorCategory::Probe
            }
        }
    }

    /// True if the error means the wire could not be observed
    pub fn is_capture_side(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Probe)
    }

    /// Map an OS error raised while acquiring a capture handle
    pub fn from_acquire_errno(err: std::io::Error, interface: &str) -> Self {
        match err.raw_os_error() {
            Some(code) if code == EPERM || code == EACCES => Error::PermissionDenied(format!(
                "capturing on '{}' requires elevated privileges ({})",
                interface, err
            )),
            Some(code) if code == ENODEV || code == ENXIO => {
                Error::InterfaceNotFound(interface.to_string())
            }
            _ => Error::Io(err),
        }
    }
}

const EPERM: i32 = 1;
const ENXIO: i32 = 6;
const EACCES: i32 = 13;
const ENODEV: i32 = 19;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::filter_syntax("tcp and", "syntax error").category(),
            ErrorCategory::Config
        );
        assert_eq!(
            Error::PermissionDenied("eth0".into()).category(),
            ErrorCategory::Acquisition
        );
        assert_eq!(Error::SessionClosed.category(), ErrorCategory::Capture);
        assert_eq!(
            Error::Handshake("alert".into()).category(),
            ErrorCategory::Probe
        );
        assert!(Error::InterfaceNotFound("x".into()).is_capture_side());
        assert!(!Error::Connect("refused".into()).is_capture_side());
    }

    #[test]
    fn test_errno_mapping() {
        let err = Error::from_acquire_errno(std::io::Error::from_raw_os_error(1), "eth0");
        assert!(matches!(err, Error::PermissionDenied(_)));

        let err = Error::from_acquire_errno(std::io::Error::from_raw_os_error(19), "eth9");
        match err {
            Error::InterfaceNotFound(name) => assert_eq!(name, "eth9"),
            other => panic!("unexpected error: {other}"),
        }

        let err = Error::from_acquire_errno(std::io::Error::from_raw_os_error(5), "eth0");
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_display() {
        let err = Error::filter_syntax("port x", "illegal port number");
        assert_eq!(
            err.to_string(),
            "Invalid filter syntax in 'port x': illegal port number"
        );
    }
}
