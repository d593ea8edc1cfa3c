//! Request/response correlation with deadlines and cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{CTraderError, Result};
use crate::protocol::envelope::Envelope;

struct PendingEntry {
    sink: oneshot::Sender<Result<Envelope>>,
    deadline: Instant,
    timeout: Duration,
    payload_type: u32,
    created_at: Instant,
    cancelled: Arc<AtomicBool>,
}

/// A registered request: the correlation id, the completion receiver the
/// caller awaits, and the flag the send scheduler checks before writing the
/// frame.
pub(crate) struct PendingHandle {
    pub id: String,
    pub receiver: oneshot::Receiver<Result<Envelope>>,
    pub cancelled: Arc<AtomicBool>,
}

/// Maps correlation ids to pending response slots.
///
/// Every entry is resolved exactly once: by a matching inbound envelope, by
/// deadline expiry (driven by the housekeeping tick), by caller
/// cancellation, or by transport loss.
#[derive(Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending request with a fresh process-unique correlation
    /// id and the given deadline.
    pub(crate) fn register(&self, payload_type: u32, timeout: Duration) -> PendingHandle {
        let id = Uuid::new_v4().to_string();
        let (sink, receiver) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let now = Instant::now();

        let entry = PendingEntry {
            sink,
            deadline: now + timeout,
            timeout,
            payload_type,
            created_at: now,
            cancelled: Arc::clone(&cancelled),
        };
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .insert(id.clone(), entry);

        debug!(
            "Registered request: id={}, type={}, timeout={:?}",
            id, payload_type, timeout
        );
        PendingHandle {
            id,
            receiver,
            cancelled,
        }
    }

    /// Resolves a pending request with a response envelope (or the typed
    /// remote error decoded from it). Returns `false` when no entry matches,
    /// which means the inbound envelope belongs to a timed-out or cancelled
    /// request.
    pub(crate) fn resolve(&self, id: &str, result: Result<Envelope>) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(id);
        let Some(entry) = entry else {
            return false;
        };
        let elapsed = entry.created_at.elapsed();
        debug!(
            "Resolved request: id={}, type={}, elapsed={:?}",
            id, entry.payload_type, elapsed
        );
        // Receiver gone means the caller dropped the future; nothing to do.
        let _ = entry.sink.send(result);
        true
    }

    /// Removes an entry on caller cancellation, marking its queued frame so
    /// the scheduler discards it before the wire. A cancelled request never
    /// delivers a value: any receiver still alive sees `Cancelled`.
    pub(crate) fn cancel(&self, id: &str) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(id);
        match entry {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::Release);
                let _ = entry.sink.send(Err(CTraderError::Cancelled));
                debug!("Cancelled request: id={}", id);
                true
            }
            None => false,
        }
    }

    /// Fails every pending entry. Used on transport loss and terminal
    /// shutdown.
    pub(crate) fn fail_all(&self, error: impl Fn() -> CTraderError) -> usize {
        let drained: Vec<(String, PendingEntry)> = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            pending.drain().collect()
        };
        let count = drained.len();
        for (id, entry) in drained {
            debug!("Failing in-flight request: id={}", id);
            let _ = entry.sink.send(Err(error()));
        }
        count
    }

    /// Resolves every entry whose deadline has passed with a timeout error.
    /// Called from the housekeeping tick; returns how many entries expired.
    pub(crate) fn expire_due(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingEntry)> = {
            let mut pending = self.pending.lock().expect("correlator lock poisoned");
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };
        let count = expired.len();
        for (id, entry) in expired {
            warn!(
                "Request timed out: id={}, type={}, timeout={:?}",
                id, entry.payload_type, entry.timeout
            );
            let _ = entry.sink.send(Err(CTraderError::Timeout {
                timeout: entry.timeout,
            }));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").len()
    }
}
