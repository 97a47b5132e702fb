//! Capture sessions and identity correlation
//!
//! A [`CaptureSession`] owns one backend. Once started, a pump thread reads
//! frames, decodes them, feeds the flow table and publishes every identity
//! record it completes to the session's [`CorrelationHandle`].

use crate::backend::{open_backend, CaptureBackend, FrameRead};
use crate::bpf::FilterProgram;
use crate::compiler::FilterCompiler;
use crate::flow::{FlowLimits, FlowTable, SniffOutcome};
use crate::stats::{CaptureStats, SessionCounters, SessionStats};
use parking_lot::{Mutex, RwLock};
use sniwatch_core::{CaptureConfig, Error, FilterFailurePolicy, IdentityRecord, RawFrame, Result};
use sniwatch_packet::{Decoded, PacketDecoder};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Configuration validated and filter compiled
    Created,
    /// Capture handle acquired and filter installed
    Open,
    /// Pump thread reading frames
    Running,
    /// Handle released; terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Open => "open",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

type PumpHandle = JoinHandle<Box<dyn CaptureBackend>>;

/// State shared by the session, its pump and its correlation handle
struct SessionShared {
    interface: String,
    state: RwLock<SessionState>,
    stop_requested: AtomicBool,
    /// Backend while the session is open but not started
    idle_backend: Mutex<Option<Box<dyn CaptureBackend>>>,
    pump: Mutex<Option<PumpHandle>>,
    counters: SessionCounters,
    backend_stats: Mutex<CaptureStats>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn stats(&self) -> SessionStats {
        self.counters.snapshot(self.backend_stats.lock().clone())
    }

    /// Stop the pump, release the backend, and mark the session closed
    ///
    /// Returns within one read timeout of being called.
    fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);

        let pump = self.pump.lock().take();
        let backend = match pump {
            Some(handle) => match handle.join() {
                Ok(backend) => Some(backend),
                Err(_) => {
                    error!(interface = %self.interface, "Capture pump panicked");
                    None
                }
            },
            None => self.idle_backend.lock().take(),
        };

        if let Some(mut backend) = backend {
            if !backend.is_closed() {
                backend.close();
            }
            *self.backend_stats.lock() = backend.stats();
        }

        let mut state = self.state.write();
        if *state != SessionState::Closed {
            *state = SessionState::Closed;
            info!(interface = %self.interface, "Capture session closed");
        }
    }
}

/// A capture session over one backend
///
/// Sessions are independent values; any number may exist at once as long
/// as each has its own backend.
pub struct CaptureSession {
    config: CaptureConfig,
    program: Option<FilterProgram>,
    shared: Arc<SessionShared>,
}

impl CaptureSession {
    /// Validate `config` and compile its filter without touching the network
    pub fn new(config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        let program = match config.filter_expression() {
            Some(expression) => Some(FilterCompiler::compile(expression, config.snaplen)?),
            None => None,
        };

        let shared = Arc::new(SessionShared {
            interface: config.interface.clone(),
            state: RwLock::new(SessionState::Created),
            stop_requested: AtomicBool::new(false),
            idle_backend: Mutex::new(None),
            pump: Mutex::new(None),
            counters: SessionCounters::default(),
            backend_stats: Mutex::new(CaptureStats::default()),
        });

        Ok(Self {
            config,
            program,
            shared,
        })
    }

    /// Create a session and open the backend selected by the configuration
    pub fn open(config: CaptureConfig) -> Result<Self> {
        let mut session = Self::new(config)?;
        let backend = open_backend(&session.config)?;
        session.attach(backend)?;
        Ok(session)
    }

    /// Create a session over an already opened backend
    pub fn with_backend(config: CaptureConfig, backend: Box<dyn CaptureBackend>) -> Result<Self> {
        let mut session = Self::new(config)?;
        session.attach(backend)?;
        Ok(session)
    }

    /// Install the filter and take ownership of `backend`
    fn attach(&mut self, mut backend: Box<dyn CaptureBackend>) -> Result<()> {
        if self.state() != SessionState::Created {
            backend.close();
            return Err(Error::invalid_config(format!(
                "cannot attach a backend to a {} session",
                self.state()
            )));
        }

        if let Some(program) = &self.program {
            if let Err(err) = backend.install_filter(program) {
                match self.config.filter_failure_policy {
                    FilterFailurePolicy::FailClosed => {
                        backend.close();
                        return Err(match err {
                            Error::FilterInstallFailed(_) => err,
                            other => Error::FilterInstallFailed(other.to_string()),
                        });
                    }
                    FilterFailurePolicy::FailOpen => {
                        warn!(
                            interface = %self.config.interface,
                            error = %err,
                            "Filter not installed, capturing unfiltered traffic"
                        );
                    }
                }
            }
        }

        info!(
            interface = %self.config.interface,
            backend = %backend.kind(),
            filter = self.config.filter_expression().unwrap_or(""),
            "Capture session open"
        );
        *self.shared.idle_backend.lock() = Some(backend);
        *self.shared.state.write() = SessionState::Open;
        Ok(())
    }

    /// Spawn the pump thread and return the handle identity records arrive on
    pub fn start(&mut self) -> Result<CorrelationHandle> {
        match self.state() {
            SessionState::Open => {}
            SessionState::Closed => return Err(Error::SessionClosed),
            other => {
                return Err(Error::invalid_config(format!(
                    "cannot start a {} session",
                    other
                )))
            }
        }

        let backend = self
            .shared
            .idle_backend
            .lock()
            .take()
            .ok_or(Error::SessionClosed)?;
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);

        let pump = Pump {
            backend,
            decoder: PacketDecoder::new(),
            flows: FlowTable::new(FlowLimits::from_config(&self.config)),
            sender,
            backlog: VecDeque::new(),
            shared: Arc::clone(&self.shared),
            sweep_interval: sweep_interval(self.config.flow_idle_timeout),
            last_sweep: Instant::now(),
        };

        // Running before the first read, so nothing is published earlier
        *self.shared.state.write() = SessionState::Running;
        let handle = thread::Builder::new()
            .name("sniwatch-pump".to_string())
            .spawn(move || pump.run())
            .map_err(|e| {
                *self.shared.state.write() = SessionState::Closed;
                Error::Io(e)
            })?;
        *self.shared.pump.lock() = Some(handle);

        info!(interface = %self.config.interface, "Capture session running");
        Ok(CorrelationHandle {
            receiver,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stop capturing and release the backend; idempotent
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Compiled filter, if the configuration has one
    pub fn program(&self) -> Option<&FilterProgram> {
        self.program.as_ref()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

/// Records held by the pump while the consumer's queue is full
const BACKLOG_LIMIT: usize = 1024;

fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1))
}

/// Frame pump running on its own thread
struct Pump {
    backend: Box<dyn CaptureBackend>,
    decoder: PacketDecoder,
    flows: FlowTable,
    sender: mpsc::Sender<IdentityRecord>,
    /// Records waiting for queue space, oldest first
    backlog: VecDeque<IdentityRecord>,
    shared: Arc<SessionShared>,
    sweep_interval: Duration,
    last_sweep: Instant,
}

impl Pump {
    fn run(mut self) -> Box<dyn CaptureBackend> {
        let interface = self.shared.interface.clone();
        debug!(interface = %interface, "Capture pump started");

        let mut ended = false;
        while !self.shared.stop_requested.load(Ordering::Acquire) {
            match self.backend.read_frame() {
                Ok(FrameRead::Frame(frame)) => self.handle(&frame),
                Ok(FrameRead::TimedOut) => {}
                Ok(FrameRead::Eof) => {
                    info!(interface = %interface, "Capture source exhausted");
                    ended = true;
                    break;
                }
                Err(e) => {
                    error!(interface = %interface, error = %e, "Capture read failed");
                    ended = true;
                    break;
                }
            }
            self.maintain(Instant::now());
        }

        self.flows.clear();
        if ended {
            self.backend.close();
            *self.shared.state.write() = SessionState::Closed;
            self.drain_backlog();
        }
        self.drop_backlog();
        *self.shared.backend_stats.lock() = self.backend.stats();
        info!(
            interface = %interface,
            published = self.shared.counters.snapshot(CaptureStats::default()).records_published,
            "Capture pump stopped"
        );
        self.backend
    }

    fn handle(&mut self, frame: &RawFrame) {
        let counters = &self.shared.counters;
        counters.record_read();

        let packet = match self.decoder.decode(frame) {
            Decoded::Packet(packet) => packet,
            Decoded::Skip(reason) => {
                trace!(reason = %reason, len = frame.len(), "Frame skipped");
                counters.record_skip(reason);
                return;
            }
        };
        counters.record_decoded();

        match self.flows.observe(&packet, Instant::now()) {
            SniffOutcome::Identity(record) => self.publish(record),
            SniffOutcome::Malformed(reason) => {
                debug!(flow = %packet.flow_key(), reason, "Unusable ClientHello");
            }
            SniffOutcome::Incomplete | SniffOutcome::NotFound => {}
        }
    }

    /// Queue `record` behind anything already waiting, then push what fits
    fn publish(&mut self, record: IdentityRecord) {
        if self.backlog.len() >= BACKLOG_LIMIT {
            warn!(
                hostname = %record.hostname,
                flow = %record.flow_key(),
                backlog = self.backlog.len(),
                "Identity backlog full, record dropped"
            );
            self.shared.counters.record_dropped();
            return;
        }
        self.backlog.push_back(record);
        self.flush();
    }

    /// Move backlogged records into the queue until it is full
    fn flush(&mut self) {
        let counters = &self.shared.counters;
        while let Some(record) = self.backlog.pop_front() {
            match self.sender.try_send(record) {
                Ok(()) => counters.record_published(),
                Err(TrySendError::Full(record)) => {
                    self.backlog.push_front(record);
                    break;
                }
                Err(TrySendError::Closed(record)) => {
                    trace!(hostname = %record.hostname, "No consumer for identity record");
                    counters.record_dropped();
                }
            }
        }
    }

    /// After the source ends, keep delivering until the backlog is empty or stop is requested
    fn drain_backlog(&mut self) {
        loop {
            self.flush();
            if self.backlog.is_empty() || self.shared.stop_requested.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Count whatever is still waiting as dropped
    fn drop_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        warn!(
            interface = %self.shared.interface,
            records = self.backlog.len(),
            "Session stopped with undelivered identity records"
        );
        for _ in self.backlog.drain(..) {
            self.shared.counters.record_dropped();
        }
    }

    fn maintain(&mut self, now: Instant) {
        self.flush();
        if now.saturating_duration_since(self.last_sweep) >= self.sweep_interval {
            self.flows.expire_idle(now);
            self.last_sweep = now;
        }
        self.shared.counters.record_flow_totals(
            self.flows.evicted(),
            self.flows.overflowed(),
            self.flows.expired(),
        );
        *self.shared.backend_stats.lock() = self.backend.stats();
    }
}

/// Receiving side of a running session
///
/// Records arrive in capture order.
pub struct CorrelationHandle {
    receiver: mpsc::Receiver<IdentityRecord>,
    shared: Arc<SessionShared>,
}

impl CorrelationHandle {
    /// Wait up to `timeout` for the next identity record
    ///
    /// Returns `Error::Timeout` if nothing arrives in time and
    /// `Error::SessionClosed` once the session has stopped and every
    /// queued record has been taken.
    pub async fn wait_for_identity(&mut self, timeout: Duration) -> Result<IdentityRecord> {
        self.wait_for_identity_matching(|_| true, timeout).await
    }

    /// Wait up to `timeout` for a record accepted by `predicate`
    ///
    /// Records rejected by the predicate are discarded.
    pub async fn wait_for_identity_matching<F>(
        &mut self,
        mut predicate: F,
        timeout: Duration,
    ) -> Result<IdentityRecord>
    where
        F: FnMut(&IdentityRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(record)) if predicate(&record) => return Ok(record),
                Ok(Some(record)) => {
                    debug!(
                        hostname = %record.hostname,
                        flow = %record.flow_key(),
                        "Ignoring identity from unrelated flow"
                    );
                }
                Ok(None) => return Err(Error::SessionClosed),
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "no identity observed within {:.1}s",
                        timeout.as_secs_f64()
                    )))
                }
            }
        }
    }

    /// Wait for the next identity record with no deadline
    ///
    /// Cancel safe, so it can sit in a `select!` next to other work.
    pub async fn next_identity(&mut self) -> Result<IdentityRecord> {
        self.receiver.recv().await.ok_or(Error::SessionClosed)
    }

    /// Take a queued record without waiting
    pub fn try_next(&mut self) -> Result<Option<IdentityRecord>> {
        match self.receiver.try_recv() {
            Ok(record) => Ok(Some(record)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::SessionClosed),
        }
    }

    /// Stop the session; blocks for at most one read timeout
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Stop the session from async code without blocking the runtime
    pub async fn shutdown(&self) {
        let shared = Arc::clone(&self.shared);
        if tokio::task::spawn_blocking(move || shared.stop())
            .await
            .is_err()
        {
            error!(interface = %self.shared.interface, "Session shutdown task failed");
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }
}
