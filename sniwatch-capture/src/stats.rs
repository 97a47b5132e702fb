//! Capture statistics and metrics

use sniwatch_packet::SkipReason;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Statistics reported by a capture backend
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Frames handed to the application
    pub frames_received: u64,
    /// Bytes handed to the application
    pub bytes_received: u64,
    /// Frames rejected by the installed filter in userland
    pub frames_filtered: u64,
    /// Frames dropped by the kernel, where the backend can tell
    pub kernel_dropped: u64,
    /// Time since the backend was opened
    pub duration: Duration,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel drop rate as percentage of frames seen
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_received + self.kernel_dropped;
        if total == 0 {
            return 0.0;
        }
        (self.kernel_dropped as f64 / total as f64) * 100.0
    }

    /// Frames per second over the capture duration
    pub fn frames_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.frames_received as f64 / secs
        } else {
            0.0
        }
    }

    /// Format statistics as human-readable string
    pub fn format(&self) -> String {
        format!(
            "Received: {} frames ({} bytes)\n\
             Filtered: {} frames\n\
             Dropped: {} frames ({:.2}%)\n\
             Duration: {:.2}s",
            self.frames_received,
            self.bytes_received,
            self.frames_filtered,
            self.kernel_dropped,
            self.drop_rate(),
            self.duration.as_secs_f64(),
        )
    }
}

/// Thread-safe statistics accumulator for a backend
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    frames_received: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    frames_filtered: Arc<AtomicU64>,
    kernel_dropped: Arc<AtomicU64>,
    start_time: Instant,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self {
            frames_received: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            frames_filtered: Arc::new(AtomicU64::new(0)),
            kernel_dropped: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Record a frame delivered to the application
    pub fn record_frame(&self, size: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a frame rejected by the filter
    pub fn record_filtered(&self) {
        self.frames_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Add kernel drops reported since the last call
    pub fn record_kernel_drops(&self, count: u64) {
        self.kernel_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Replace the kernel drop count with a cumulative figure
    pub fn set_kernel_drops(&self, total: u64) {
        self.kernel_dropped.store(total, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_filtered: self.frames_filtered.load(Ordering::Relaxed),
            kernel_dropped: self.kernel_dropped.load(Ordering::Relaxed),
            duration: self.start_time.elapsed(),
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_filtered(&self) -> u64 {
        self.frames_filtered.load(Ordering::Relaxed)
    }
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

const SKIP_REASONS: [SkipReason; 6] = [
    SkipReason::UnsupportedLink,
    SkipReason::UnsupportedNetwork,
    SkipReason::Fragment,
    SkipReason::NotStream,
    SkipReason::Truncated,
    SkipReason::Malformed,
];

fn skip_index(reason: SkipReason) -> usize {
    match reason {
        SkipReason::UnsupportedLink => 0,
        SkipReason::UnsupportedNetwork => 1,
        SkipReason::Fragment => 2,
        SkipReason::NotStream => 3,
        SkipReason::Truncated => 4,
        SkipReason::Malformed => 5,
    }
}

/// Statistics for a capture session's decode and sniff pipeline
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Frames read from the backend
    pub frames_read: u64,
    /// Frames decoded down to a TCP payload
    pub frames_decoded: u64,
    /// Frames skipped, indexed like [`SessionStats::skipped`]
    skipped: [u64; 6],
    /// Identity records sent to the correlation handle
    pub records_published: u64,
    /// Identity records lost because the queue was full or gone
    pub records_dropped: u64,
    /// Flows evicted to admit new ones
    pub flows_evicted: u64,
    /// Flows abandoned after exceeding their byte budget
    pub flows_overflowed: u64,
    /// Flows abandoned after going idle
    pub flows_expired: u64,
    /// Backend counters at the time of the snapshot
    pub backend: CaptureStats,
}

impl SessionStats {
    /// Frames skipped for `reason`
    pub fn skipped(&self, reason: SkipReason) -> u64 {
        self.skipped[skip_index(reason)]
    }

    /// Frames skipped for any reason
    pub fn skipped_total(&self) -> u64 {
        self.skipped.iter().sum()
    }

    /// Non-zero skip counters
    pub fn skip_breakdown(&self) -> Vec<(SkipReason, u64)> {
        SKIP_REASONS
            .iter()
            .map(|reason| (*reason, self.skipped(*reason)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// Format statistics as human-readable string
    pub fn format(&self) -> String {
        let skips = self
            .skip_breakdown()
            .iter()
            .map(|(reason, count)| format!("{}={}", reason, count))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Frames: {} read, {} decoded, {} skipped{}\n\
             Records: {} published, {} dropped\n\
             Flows: {} evicted, {} over budget, {} idle",
            self.frames_read,
            self.frames_decoded,
            self.skipped_total(),
            if skips.is_empty() {
                String::new()
            } else {
                format!(" ({})", skips)
            },
            self.records_published,
            self.records_dropped,
            self.flows_evicted,
            self.flows_overflowed,
            self.flows_expired,
        )
    }
}

/// Counters shared between a session and its pump thread
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    frames_read: AtomicU64,
    frames_decoded: AtomicU64,
    skipped: [AtomicU64; 6],
    records_published: AtomicU64,
    records_dropped: AtomicU64,
    flows_evicted: AtomicU64,
    flows_overflowed: AtomicU64,
    flows_expired: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn record_read(&self) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skip(&self, reason: SkipReason) {
        self.skipped[skip_index(reason)].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self) {
        self.records_published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flow_totals(&self, evicted: u64, overflowed: u64, expired: u64) {
        self.flows_evicted.store(evicted, Ordering::Relaxed);
        self.flows_overflowed.store(overflowed, Ordering::Relaxed);
        self.flows_expired.store(expired, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, backend: CaptureStats) -> SessionStats {
        let mut skipped = [0u64; 6];
        for (slot, counter) in skipped.iter_mut().zip(self.skipped.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        SessionStats {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            skipped,
            records_published: self.records_published.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            flows_evicted: self.flows_evicted.load(Ordering::Relaxed),
            flows_overflowed: self.flows_overflowed.load(Ordering::Relaxed),
            flows_expired: self.flows_expired.load(Ordering::Relaxed),
            backend,
        }
    }
}
