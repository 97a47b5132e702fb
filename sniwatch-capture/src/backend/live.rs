//! Live capture through libpcap

use super::{CaptureBackend, FrameRead};
use crate::bpf::FilterProgram;
use crate::stats::{CaptureStats, StatsAccumulator};
use pcap::{Activated, Active, Capture};
use sniwatch_core::{BackendKind, CaptureConfig, Error, LinkType, RawFrame, Result};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Generic live capture backend
///
/// The filter expression is handed to libpcap, which compiles it for the
/// handle and attaches it in the kernel where the platform allows.
pub struct LiveBackend {
    interface: String,
    capture: Option<Capture<Active>>,
    link_type: LinkType,
    stats: StatsAccumulator,
}

impl LiveBackend {
    /// Open `config.interface` in non-promiscuous immediate mode
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let timeout_ms = i32::try_from(config.read_timeout.as_millis())
            .unwrap_or(i32::MAX)
            .max(1);
        let snaplen = i32::try_from(config.snaplen).unwrap_or(i32::MAX);

        let capture = Capture::from_device(config.interface.as_str())
            .map_err(|e| map_pcap_error(&e, &config.interface))?
            .promisc(false)
            .snaplen(snaplen)
            .timeout(timeout_ms)
            .immediate_mode(true)
            .open()
            .map_err(|e| map_pcap_error(&e, &config.interface))?;

        let link_type = LinkType::from_dlt(capture.get_datalink().0);
        info!(
            interface = %config.interface,
            ?link_type,
            snaplen = config.snaplen,
            timeout_ms,
            "Live capture opened"
        );

        Ok(Self {
            interface: config.interface.clone(),
            capture: Some(capture),
            link_type,
            stats: StatsAccumulator::new(),
        })
    }

    fn refresh_kernel_stats(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            if let Ok(stat) = capture.stats() {
                self.stats
                    .set_kernel_drops(stat.dropped as u64 + stat.if_dropped as u64);
            }
        }
    }
}

impl CaptureBackend for LiveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::GenericLive
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn install_filter(&mut self, program: &FilterProgram) -> Result<()> {
        let capture = self.capture.as_mut().ok_or(Error::SessionClosed)?;
        if self.link_type != LinkType::Ethernet {
            return Err(Error::FilterInstallFailed(format!(
                "filters are compiled for Ethernet but '{}' has link type {:?}",
                self.interface, self.link_type
            )));
        }
        apply_filter(capture, &self.interface, program)
    }

    fn read_frame(&mut self) -> Result<FrameRead> {
        let capture = self.capture.as_mut().ok_or(Error::SessionClosed)?;

        match capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = UNIX_EPOCH
                    + Duration::new(
                        u64::try_from(ts.tv_sec).unwrap_or(0),
                        u32::try_from(ts.tv_usec).unwrap_or(0).saturating_mul(1000),
                    );
                let frame = RawFrame::new(self.link_type, packet.data.to_vec())
                    .with_timestamp(timestamp)
                    .with_wire_len(packet.header.len as usize);

                self.stats.record_frame(frame.len());
                Ok(FrameRead::Frame(frame))
            }
            Err(pcap::Error::TimeoutExpired) => {
                self.refresh_kernel_stats();
                Ok(FrameRead::TimedOut)
            }
            Err(pcap::Error::NoMorePackets) => Ok(FrameRead::Eof),
            Err(e) => {
                error!(interface = %self.interface, error = %e, "Live capture read failed");
                Err(Error::capture(format!("read on '{}': {}", self.interface, e)))
            }
        }
    }

    fn close(&mut self) {
        self.refresh_kernel_stats();
        if self.capture.take().is_some() {
            info!(interface = %self.interface, "Live capture closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.capture.is_none()
    }

    fn stats(&self) -> CaptureStats {
        self.stats.snapshot()
    }
}

impl Drop for LiveBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Have libpcap compile `program`'s expression for `capture` and attach it
fn apply_filter<T: Activated + ?Sized>(
    capture: &mut Capture<T>,
    interface: &str,
    program: &FilterProgram,
) -> Result<()> {
    let expression = program.expression().ok_or_else(|| {
        Error::FilterInstallFailed(format!(
            "'{}' needs a filter expression, got a bare {}-instruction program",
            interface,
            program.len()
        ))
    })?;

    capture.filter(expression, true).map_err(|e| {
        Error::FilterInstallFailed(format!(
            "libpcap rejected '{}' on '{}': {}",
            expression, interface, e
        ))
    })?;
    debug!(interface, expression, "Filter installed on pcap handle");
    Ok(())
}

/// Classify a libpcap open error
///
/// libpcap reports most failures as text, so the message decides.
fn map_pcap_error(err: &pcap::Error, interface: &str) -> Error {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("not permitted") {
        Error::PermissionDenied(format!("opening '{}': {}", interface, message))
    } else if lower.contains("no such device")
        || lower.contains("doesn't exist")
        || lower.contains("no such file")
    {
        Error::InterfaceNotFound(interface.to_string())
    } else {
        Error::capture(format!("opening '{}': {}", interface, message))
    }
}
