//! Outbound rate limiting.
//!
//! The server enforces a per-connection message budget, so the scheduler
//! paces every outbound frame through one token bucket: integer capacity,
//! refilled to capacity once per second. Heartbeats and auth frames share
//! the bucket with data frames; there are no priority lanes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket with whole-second refill semantics.
///
/// `acquire` takes one token, waiting for the next refill when the bucket
/// is empty. Waiters are served in FIFO order.
pub struct TokenBucket {
    capacity: u32,
    state: Mutex<BucketState>,
    // Single-permit turnstile: tokio semaphores queue waiters FIFO, which
    // keeps acquisition order fair when the bucket runs dry.
    turnstile: Semaphore,
}

impl TokenBucket {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            turnstile: Semaphore::new(1),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Takes one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        // One waiter at a time proceeds; the rest queue behind it.
        let _turn = self
            .turnstile
            .acquire()
            .await
            .expect("turnstile never closed");
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock poisoned");
                let elapsed = state.last_refill.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    state.tokens = self.capacity;
                    state.last_refill = Instant::now();
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                Duration::from_secs(1).saturating_sub(elapsed)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Takes one token without waiting. Returns `false` when the bucket is
    /// empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        if state.last_refill.elapsed() >= Duration::from_secs(1) {
            state.tokens = self.capacity;
            state.last_refill = Instant::now();
        }
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, without refilling.
    pub fn available(&self) -> u32 {
        self.state.lock().expect("bucket lock poisoned").tokens
    }
}
