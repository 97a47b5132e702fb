//! In-memory backend replaying frames
//!
//! Frames come from a fixed list or from a channel fed by another thread.
//! Filters run in userland exactly as in the live backend.

use super::{CaptureBackend, FrameRead};
use crate::bpf::FilterProgram;
use crate::stats::{CaptureStats, StatsAccumulator};
use sniwatch_core::{BackendKind, Error, LinkType, RawFrame, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

enum Source {
    List {
        frames: VecDeque<RawFrame>,
        eof_when_empty: bool,
    },
    Channel(Receiver<RawFrame>),
}

/// Backend that replays frames instead of reading an interface
pub struct ReplayBackend {
    source: Source,
    link_type: LinkType,
    read_timeout: Duration,
    filter: Option<FilterProgram>,
    reject_filters: bool,
    closed: bool,
    closes: Arc<AtomicUsize>,
    stats: StatsAccumulator,
}

impl ReplayBackend {
    /// Replay `frames`, then report end of capture
    pub fn new<I: IntoIterator<Item = RawFrame>>(frames: I) -> Self {
        Self::with_source(Source::List {
            frames: frames.into_iter().collect(),
            eof_when_empty: true,
        })
    }

    /// Replay frames sent through the returned sender
    ///
    /// Reads time out while the channel is empty; dropping every sender
    /// ends the capture.
    pub fn channel() -> (Self, Sender<RawFrame>) {
        let (sender, receiver) = mpsc::channel();
        (Self::with_source(Source::Channel(receiver)), sender)
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            link_type: LinkType::Ethernet,
            read_timeout: Duration::from_millis(50),
            filter: None,
            reject_filters: false,
            closed: false,
            closes: Arc::new(AtomicUsize::new(0)),
            stats: StatsAccumulator::new(),
        }
    }

    /// Keep timing out instead of ending once the list is exhausted
    pub fn idle_when_empty(mut self) -> Self {
        if let Source::List {
            ref mut eof_when_empty,
            ..
        } = self.source
        {
            *eof_when_empty = false;
        }
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_link_type(mut self, link_type: LinkType) -> Self {
        self.link_type = link_type;
        self
    }

    /// Make every `install_filter` call fail
    pub fn rejecting_filters(mut self) -> Self {
        self.reject_filters = true;
        self
    }

    /// Counter of handle releases, readable after the backend is moved away
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    fn next_frame(&mut self) -> FrameRead {
        match &mut self.source {
            Source::List {
                frames,
                eof_when_empty,
            } => match frames.pop_front() {
                Some(frame) => FrameRead::Frame(frame),
                None if *eof_when_empty => FrameRead::Eof,
                None => {
                    std::thread::sleep(self.read_timeout);
                    FrameRead::TimedOut
                }
            },
            Source::Channel(receiver) => match receiver.recv_timeout(self.read_timeout) {
                Ok(frame) => FrameRead::Frame(frame),
                Err(RecvTimeoutError::Timeout) => FrameRead::TimedOut,
                Err(RecvTimeoutError::Disconnected) => FrameRead::Eof,
            },
        }
    }
}

impl CaptureBackend for ReplayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::GenericLive
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn install_filter(&mut self, program: &FilterProgram) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        if self.reject_filters || self.link_type != LinkType::Ethernet {
            return Err(Error::FilterInstallFailed(format!(
                "replay source with link type {:?} refused the filter",
                self.link_type
            )));
        }
        self.filter = Some(program.clone());
        Ok(())
    }

    fn read_frame(&mut self) -> Result<FrameRead> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            if self.closed {
                return Err(Error::SessionClosed);
            }
            let frame = match self.next_frame() {
                FrameRead::Frame(frame) => frame,
                other => return Ok(other),
            };

            if let Some(filter) = &self.filter {
                if !filter.matches(frame.data()) {
                    self.stats.record_filtered();
                    if Instant::now() >= deadline {
                        return Ok(FrameRead::TimedOut);
                    }
                    continue;
                }
            }
            self.stats.record_frame(frame.len());
            return Ok(FrameRead::Frame(frame));
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
            debug!("Replay backend closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn stats(&self) -> CaptureStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use sniwatch_packet::{MacAddress, PacketBuilder};

    fn tcp_frame(dst_port: u16) -> RawFrame {
        PacketBuilder::new()
            .ethernet(MacAddress([2, 0, 0, 0, 0, 1]), MacAddress([2, 0, 0, 0, 0, 2]))
            .tcp_flow(
                "10.0.0.2:50000".parse().unwrap(),
                format!("10.0.0.1:{}", dst_port).parse().unwrap(),
                1,
            )
            .build_frame()
            .unwrap()
    }

    #[test]
    fn test_list_replay_with_filter() {
        let mut backend = ReplayBackend::new(vec![tcp_frame(80), tcp_frame(443), tcp_frame(22)]);
        backend
            .install_filter(&compile("tcp and port 443", 2000).unwrap())
            .unwrap();

        match backend.read_frame().unwrap() {
            FrameRead::Frame(frame) => assert_eq!(&frame.data()[36..38], &443u16.to_be_bytes()),
            other => panic!("Expected frame, got {other:?}"),
        }
        assert!(matches!(backend.read_frame().unwrap(), FrameRead::Eof));

        let stats = backend.stats();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.frames_filtered, 2);
    }

    #[test]
    fn test_channel_replay() {
        let (backend, sender) = ReplayBackend::channel();
        let mut backend = backend.with_read_timeout(Duration::from_millis(10));
        assert!(matches!(backend.read_frame().unwrap(), FrameRead::TimedOut));

        sender.send(tcp_frame(443)).unwrap();
        assert!(matches!(backend.read_frame().unwrap(), FrameRead::Frame(_)));

        drop(sender);
        assert!(matches!(backend.read_frame().unwrap(), FrameRead::Eof));
    }

    #[test]
    fn test_close_once() {
        let mut backend = ReplayBackend::new(Vec::new());
        let closes = backend.close_counter();
        backend.close();
        backend.close();
        assert!(backend.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(backend.read_frame(), Err(Error::SessionClosed)));
    }

    #[test]
    fn test_non_ethernet_refuses_filter() {
        let mut backend = ReplayBackend::new(Vec::new()).with_link_type(LinkType::RawIp);
        let result = backend.install_filter(&compile("tcp", 2000).unwrap());
        assert!(matches!(result, Err(Error::FilterInstallFailed(_))));
    }
}
