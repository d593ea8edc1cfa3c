//! Session counters and request latency.
//!
//! Pull-style: counters accumulate atomically and [`SessionMetrics::snapshot`]
//! returns a point-in-time copy. Nothing here ever blocks the hot paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct LatencyState {
    count: u64,
    sum: Duration,
    min: Option<Duration>,
    max: Option<Duration>,
}

/// Live counters owned by the session.
#[derive(Default)]
pub struct SessionMetrics {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    request_timeouts: AtomicU64,
    request_errors: AtomicU64,
    requests_cancelled: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    inbound_dropped: AtomicU64,
    stream_dropped: AtomicU64,
    inbound_orphaned: AtomicU64,
    inbound_unrouted: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    latency: Mutex<LatencyState>,
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub request_timeouts: u64,
    pub request_errors: u64,
    pub requests_cancelled: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub inbound_dropped: u64,
    pub stream_dropped: u64,
    pub inbound_orphaned: u64,
    pub inbound_unrouted: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub latency_count: u64,
    pub latency_sum: Duration,
    pub latency_min: Option<Duration>,
    pub latency_max: Option<Duration>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn response_received(&self, latency: Duration) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        let mut state = self.latency.lock().expect("latency lock poisoned");
        state.count += 1;
        state.sum += latency;
        state.min = Some(state.min.map_or(latency, |m| m.min(latency)));
        state.max = Some(state.max.map_or(latency, |m| m.max(latency)));
    }

    pub(crate) fn request_timeout(&self, n: u64) {
        self.request_timeouts.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn request_error(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_dropped(&self, n: u64) {
        self.stream_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inbound_orphaned(&self) {
        self.inbound_orphaned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inbound_unrouted(&self) {
        self.inbound_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_success(&self) {
        self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency.lock().expect("latency lock poisoned");
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            stream_dropped: self.stream_dropped.load(Ordering::Relaxed),
            inbound_orphaned: self.inbound_orphaned.load(Ordering::Relaxed),
            inbound_unrouted: self.inbound_unrouted.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnect_successes: self.reconnect_successes.load(Ordering::Relaxed),
            latency_count: latency.count,
            latency_sum: latency.sum,
            latency_min: latency.min,
            latency_max: latency.max,
        }
    }
}

impl MetricsSnapshot {
    /// Mean request latency, when any response has been observed.
    pub fn latency_mean(&self) -> Option<Duration> {
        if self.latency_count == 0 {
            None
        } else {
            Some(self.latency_sum / self.latency_count as u32)
        }
    }
}
