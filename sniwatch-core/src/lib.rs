//! sniwatch core library
//!
//! Fundamental types shared by the capture, packet and probe crates:
//! the error taxonomy, capture configuration, raw frames and the
//! identity records produced by on-the-wire verification.

pub mod config;
pub mod error;
pub mod frame;
pub mod identity;
pub mod interface;

// Re-export commonly used types
pub use config::{BackendKind, CaptureConfig, FilterFailurePolicy};
pub use error::{Error, ErrorCategory, Result};
pub use frame::{LinkType, RawFrame};
pub use identity::{hostnames_equal, FlowKey, IdentityRecord};
pub use interface::{
    default_interface, get_interface, interface_for_address, list_interfaces, InterfaceInfo,
};
