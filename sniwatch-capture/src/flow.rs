//! Per-flow reassembly of ClientHello messages
//!
//! A ClientHello may arrive in several TCP segments. The table buffers the
//! client half of each candidate flow by sequence number until the message
//! parses, the flow exceeds its byte budget, or it goes idle. Finished and
//! abandoned flows stay behind as tombstones so their later segments are
//! answered without buffering again.

use sniwatch_core::{CaptureConfig, FlowKey, IdentityRecord};
use sniwatch_packet::tls::{self, looks_like_client_hello};
use sniwatch_packet::{DecodedPacket, ScanOutcome};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// What a segment told us about its flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffOutcome {
    /// The flow's ClientHello is complete and names a host
    Identity(IdentityRecord),
    /// A ClientHello is being buffered
    Incomplete,
    /// No identity will come from this flow (or not from this segment)
    NotFound,
    /// The flow carried a ClientHello that could not be used
    Malformed(&'static str),
}

/// Why a flow stopped being buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tombstone {
    Published,
    NoIdentity,
    Malformed,
    OverBudget,
    Idle,
    Reset,
}

#[derive(Debug)]
struct Reassembly {
    client: SocketAddr,
    server: SocketAddr,
    base_sequence: u32,
    /// Contiguous bytes from `base_sequence`
    stream: Vec<u8>,
    /// Segments beyond a gap, keyed by offset from `base_sequence`
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
}

impl Reassembly {
    fn new(packet: &DecodedPacket<'_>) -> Self {
        Self {
            client: packet.source,
            server: packet.destination,
            base_sequence: packet.sequence,
            stream: packet.payload.to_vec(),
            pending: BTreeMap::new(),
            pending_bytes: 0,
        }
    }

    fn buffered(&self) -> usize {
        self.stream.len() + self.pending_bytes
    }

    /// Place a client segment; returns false for pure duplicates
    fn insert(&mut self, sequence: u32, payload: &[u8]) -> bool {
        let offset = sequence.wrapping_sub(self.base_sequence);
        // Bytes before the start of the message are retransmissions we cannot use
        if offset > u32::MAX / 2 {
            return false;
        }
        let offset = offset as usize;
        let end = offset + payload.len();

        if end <= self.stream.len() {
            return false;
        }

        if offset <= self.stream.len() {
            self.stream
                .extend_from_slice(&payload[self.stream.len() - offset..]);
            self.drain_pending();
            return true;
        }

        let key = offset as u32;
        match self.pending.get(&key) {
            Some(existing) if existing.len() >= payload.len() => false,
            Some(existing) => {
                self.pending_bytes += payload.len() - existing.len();
                self.pending.insert(key, payload.to_vec());
                true
            }
            None => {
                self.pending_bytes += payload.len();
                self.pending.insert(key, payload.to_vec());
                true
            }
        }
    }

    fn drain_pending(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            let offset = *entry.key() as usize;
            if offset > self.stream.len() {
                break;
            }
            let segment = entry.remove();
            self.pending_bytes -= segment.len();
            let end = offset + segment.len();
            if end > self.stream.len() {
                self.stream
                    .extend_from_slice(&segment[self.stream.len() - offset..]);
            }
        }
    }
}

#[derive(Debug)]
enum FlowState {
    Buffering(Reassembly),
    Dead(Tombstone),
}

#[derive(Debug)]
struct FlowEntry {
    state: FlowState,
    /// Admission order, used for oldest-first eviction
    admitted: u64,
    last_seen: Instant,
}

/// Limits applied to the flow table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowLimits {
    /// Flows (live or tombstoned) tracked at once
    pub max_flows: usize,
    /// Bytes one flow may buffer
    pub byte_budget: usize,
    /// Time without segments after which a flow is dropped
    pub idle_timeout: Duration,
}

impl FlowLimits {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            max_flows: config.max_flows.max(1),
            byte_budget: config.flow_byte_budget,
            idle_timeout: config.flow_idle_timeout,
        }
    }
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self::from_config(&CaptureConfig::default())
    }
}

/// Per-flow reassembly table
///
/// Owned by the pump thread; never shared.
#[derive(Debug)]
pub struct FlowTable {
    limits: FlowLimits,
    flows: HashMap<FlowKey, FlowEntry>,
    by_age: BTreeMap<u64, FlowKey>,
    next_admission: u64,
    evicted: u64,
    overflowed: u64,
    expired: u64,
}

impl FlowTable {
    pub fn new(limits: FlowLimits) -> Self {
        Self {
            limits,
            flows: HashMap::new(),
            by_age: BTreeMap::new(),
            next_admission: 0,
            evicted: 0,
            overflowed: 0,
            expired: 0,
        }
    }

    /// Feed one decoded segment observed at `now`
    pub fn observe(&mut self, packet: &DecodedPacket<'_>, now: Instant) -> SniffOutcome {
        let key = packet.flow_key();

        let Some(entry) = self.flows.get_mut(&key) else {
            if packet.payload.is_empty() || !looks_like_client_hello(packet.payload) {
                return SniffOutcome::NotFound;
            }
            let mut reassembly = Reassembly::new(packet);
            let outcome = self.advance(&key, &mut reassembly, packet);
            self.admit(key, reassembly, outcome.1, now);
            return outcome.0;
        };

        entry.last_seen = now;
        let reassembly = match &mut entry.state {
            FlowState::Dead(tombstone) => {
                trace!(flow = %key, ?tombstone, "Segment on finished flow");
                return SniffOutcome::NotFound;
            }
            FlowState::Buffering(reassembly) => reassembly,
        };

        if packet.flags.rst {
            trace!(flow = %key, "Flow reset while buffering");
            entry.state = FlowState::Dead(Tombstone::Reset);
            return SniffOutcome::NotFound;
        }

        if packet.source != reassembly.client || packet.payload.is_empty() {
            return SniffOutcome::Incomplete;
        }

        if !reassembly.insert(packet.sequence, packet.payload) {
            trace!(flow = %key, sequence = packet.sequence, "Duplicate segment ignored");
            return SniffOutcome::Incomplete;
        }

        let mut reassembly = match std::mem::replace(
            &mut entry.state,
            FlowState::Dead(Tombstone::NoIdentity),
        ) {
            FlowState::Buffering(reassembly) => reassembly,
            FlowState::Dead(tombstone) => {
                entry.state = FlowState::Dead(tombstone);
                return SniffOutcome::NotFound;
            }
        };

        let (outcome, tombstone) = self.advance(&key, &mut reassembly, packet);
        if let Some(entry) = self.flows.get_mut(&key) {
            entry.state = match tombstone {
                Some(tombstone) => FlowState::Dead(tombstone),
                None => FlowState::Buffering(reassembly),
            };
        }
        outcome
    }

    /// Scan the buffered stream and decide the flow's fate
    fn advance(
        &mut self,
        key: &FlowKey,
        reassembly: &mut Reassembly,
        packet: &DecodedPacket<'_>,
    ) -> (SniffOutcome, Option<Tombstone>) {
        if reassembly.buffered() > self.limits.byte_budget {
            return self.overflow(key, reassembly.buffered());
        }

        match tls::scan(&reassembly.stream) {
            ScanOutcome::Found(info) => {
                let record = IdentityRecord::new(
                    info.hostname,
                    reassembly.client,
                    reassembly.server,
                    packet.timestamp,
                );
                debug!(flow = %key, hostname = %record.hostname, "Identity observed");
                (SniffOutcome::Identity(record), Some(Tombstone::Published))
            }
            ScanOutcome::Incomplete { needed } => {
                if reassembly.stream.len() + needed > self.limits.byte_budget {
                    return self.overflow(key, reassembly.stream.len() + needed);
                }
                trace!(flow = %key, buffered = reassembly.buffered(), needed, "ClientHello incomplete");
                (SniffOutcome::Incomplete, None)
            }
            ScanOutcome::NotFound => (SniffOutcome::NotFound, Some(Tombstone::NoIdentity)),
            ScanOutcome::Malformed(reason) => {
                debug!(flow = %key, reason, "Malformed ClientHello");
                (SniffOutcome::Malformed(reason), Some(Tombstone::Malformed))
            }
        }
    }

    fn overflow(&mut self, key: &FlowKey, bytes: usize) -> (SniffOutcome, Option<Tombstone>) {
        self.overflowed += 1;
        debug!(
            flow = %key,
            bytes,
            budget = self.limits.byte_budget,
            "Flow exceeded reassembly budget"
        );
        (SniffOutcome::NotFound, Some(Tombstone::OverBudget))
    }

    fn admit(
        &mut self,
        key: FlowKey,
        reassembly: Reassembly,
        tombstone: Option<Tombstone>,
        now: Instant,
    ) {
        while self.flows.len() >= self.limits.max_flows {
            let Some((_, oldest)) = self.by_age.pop_first() else {
                break;
            };
            self.flows.remove(&oldest);
            self.evicted += 1;
            debug!(flow = %oldest, "Evicted oldest flow");
        }

        let admitted = self.next_admission;
        self.next_admission += 1;
        self.by_age.insert(admitted, key);
        self.flows.insert(
            key,
            FlowEntry {
                state: match tombstone {
                    Some(tombstone) => FlowState::Dead(tombstone),
                    None => FlowState::Buffering(reassembly),
                },
                admitted,
                last_seen: now,
            },
        );
    }

    /// Abandon buffering flows and forget tombstones idle since before `now - idle_timeout`
    pub fn expire_idle(&mut self, now: Instant) {
        let idle_timeout = self.limits.idle_timeout;
        let mut forgotten = Vec::new();

        for (key, entry) in self.flows.iter_mut() {
            if now.saturating_duration_since(entry.last_seen) < idle_timeout {
                continue;
            }
            match entry.state {
                FlowState::Buffering(_) => {
                    trace!(flow = %key, "Flow idle, abandoning reassembly");
                    entry.state = FlowState::Dead(Tombstone::Idle);
                    entry.last_seen = now;
                    self.expired += 1;
                }
                FlowState::Dead(_) => forgotten.push((*key, entry.admitted)),
            }
        }

        for (key, admitted) in forgotten {
            self.flows.remove(&key);
            self.by_age.remove(&admitted);
        }
    }

    /// Number of tracked flows, tombstones included
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Number of flows still buffering
    pub fn buffering(&self) -> usize {
        self.flows
            .values()
            .filter(|entry| matches!(entry.state, FlowState::Buffering(_)))
            .count()
    }

    /// True if `key` is tracked (live or tombstoned)
    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    /// Flows evicted to admit new ones
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Flows abandoned for exceeding the byte budget
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    /// Flows abandoned for going idle
    pub fn expired(&self) -> u64 {
        self.expired
    }

    /// Release all flow state
    pub fn clear(&mut self) {
        self.flows.clear();
        self.by_age.clear();
    }
}
