//! Capture backends
//!
//! A backend owns one kernel capture handle. Both variants accept the same
//! [`FilterProgram`] and hand out owned [`RawFrame`]s.

use crate::bpf::FilterProgram;
use crate::stats::CaptureStats;
use sniwatch_core::{BackendKind, CaptureConfig, Error, LinkType, RawFrame, Result};
use tracing::debug;

pub mod live;
pub mod replay;
pub mod ring;

pub use live::LiveBackend;
pub use replay::ReplayBackend;
pub use ring::RingBackend;

/// Result of a single read
#[derive(Debug)]
pub enum FrameRead {
    /// A frame accepted by the installed filter
    Frame(RawFrame),
    /// Nothing arrived within the read timeout
    TimedOut,
    /// The source has no more frames
    Eof,
}

/// A kernel capture mechanism
///
/// Reads block for at most the configured read timeout so that callers can
/// observe a stop request between reads.
pub trait CaptureBackend: Send {
    /// Which mechanism this is
    fn kind(&self) -> BackendKind;

    /// Link-layer framing of the frames returned by [`read_frame`](Self::read_frame)
    fn link_type(&self) -> LinkType;

    /// Install a filter; replaces any previous filter
    fn install_filter(&mut self, program: &FilterProgram) -> Result<()>;

    /// Read the next frame
    ///
    /// Returns `Error::SessionClosed` once the backend is closed.
    fn read_frame(&mut self) -> Result<FrameRead>;

    /// Release the capture handle; later calls do nothing
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    fn stats(&self) -> CaptureStats;
}

/// Open the backend selected by `config.backend`
///
/// The interface is looked up first so that a missing interface surfaces
/// as `InterfaceNotFound` regardless of backend.
pub fn open_backend(config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>> {
    config.validate()?;
    let interface = sniwatch_core::get_interface(&config.interface)?;
    debug!(
        interface = %interface.name,
        index = interface.index,
        backend = %config.backend,
        "Opening capture backend"
    );

    match config.backend {
        BackendKind::GenericLive => Ok(Box::new(LiveBackend::open(config)?)),
        BackendKind::RawRing => {
            if !RingBackend::is_supported() {
                return Err(Error::UnsupportedBackend(format!(
                    "{} requires Linux",
                    BackendKind::RawRing
                )));
            }
            Ok(Box::new(RingBackend::open(config, interface.index)?))
        }
    }
}
