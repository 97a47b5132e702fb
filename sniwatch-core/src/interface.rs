//! Network interface enumeration and lookup

use crate::{Error, Result};
use pnet_datalink::{self, NetworkInterface};
use std::fmt;
use std::net::IpAddr;

/// Information about a network interface
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "eth0", "wlan0")
    pub name: String,
    /// Kernel interface index
    pub index: u32,
    /// MAC address if available
    pub mac: Option<String>,
    /// Addresses assigned to this interface
    pub ips: Vec<IpAddr>,
    /// Whether the interface is up
    pub is_up: bool,
    /// Whether the interface is a loopback
    pub is_loopback: bool,
}

impl From<&NetworkInterface> for InterfaceInfo {
    fn from(iface: &NetworkInterface) -> Self {
        let mac = iface.mac.map(|mac| {
            format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac.0, mac.1, mac.2, mac.3, mac.4, mac.5
            )
        });

        InterfaceInfo {
            name: iface.name.clone(),
            index: iface.index,
            mac,
            ips: iface.ips.iter().map(|network| network.ip()).collect(),
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
        }
    }
}

impl InterfaceInfo {
    /// Up and not loopback
    pub fn is_capture_capable(&self) -> bool {
        self.is_up && !self.is_loopback
    }

    /// True if `ip` is assigned to this interface
    pub fn has_address(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip)
    }
}

impl fmt::Display for InterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (index {}", self.name, self.index)?;
        if let Some(mac) = &self.mac {
            write!(f, ", {}", mac)?;
        }
        if !self.is_up {
            f.write_str(", down")?;
        }
        if self.is_loopback {
            f.write_str(", loopback")?;
        }
        f.write_str(")")?;
        for ip in &self.ips {
            write!(f, " {}", ip)?;
        }
        Ok(())
    }
}

/// List all network interfaces
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>> {
    let interfaces = pnet_datalink::interfaces();

    if interfaces.is_empty() {
        return Err(Error::capture(
            "No network interfaces found. Are you running with sufficient privileges?",
        ));
    }

    Ok(interfaces.iter().map(InterfaceInfo::from).collect())
}

/// Get information about a specific interface by name
pub fn get_interface(name: &str) -> Result<InterfaceInfo> {
    pnet_datalink::interfaces()
        .iter()
        .find(|iface| iface.name == name)
        .map(InterfaceInfo::from)
        .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
}

/// First interface that is up and not loopback
pub fn default_interface() -> Result<InterfaceInfo> {
    list_interfaces()?
        .into_iter()
        .find(InterfaceInfo::is_capture_capable)
        .ok_or_else(|| Error::capture("No suitable default interface found"))
}

/// Interface carrying `local` as one of its addresses, if any
pub fn interface_for_address(local: &IpAddr) -> Option<InterfaceInfo> {
    pnet_datalink::interfaces()
        .iter()
        .map(InterfaceInfo::from)
        .find(|iface| iface.has_address(local))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_interfaces() {
        let interfaces = list_interfaces().unwrap();
        assert!(!interfaces.is_empty());
        for iface in interfaces {
            assert!(!iface.name.is_empty());
            if iface.is_loopback {
                assert!(!iface.is_capture_capable());
            }
        }
    }

    #[test]
    fn test_get_nonexistent_interface() {
        match get_interface("nonexistent_interface_xyz") {
            Err(Error::InterfaceNotFound(name)) => assert_eq!(name, "nonexistent_interface_xyz"),
            other => panic!("Expected InterfaceNotFound error, got {other:?}"),
        }
    }

    #[test]
    fn test_display() {
        let info = InterfaceInfo {
            name: "eth0".into(),
            index: 2,
            mac: Some("00:11:22:33:44:55".into()),
            ips: vec!["192.168.1.10".parse().unwrap()],
            is_up: true,
            is_loopback: false,
        };
        assert_eq!(
            info.to_string(),
            "eth0 (index 2, 00:11:22:33:44:55) 192.168.1.10"
        );
        assert!(info.has_address(&"192.168.1.10".parse().unwrap()));
    }
}
