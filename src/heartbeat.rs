//! Keepalive engine.
//!
//! Tracks the time of the last successfully written frame and synthesizes a
//! keepalive once the connection has been idle for the configured interval.
//! Keepalives go through the same queue and token bucket as every other
//! frame; replies to server keepalives are handled by the inbound worker.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::handler::Outbound;

/// Runs the keepalive timer for one connection generation until the
/// connection token is cancelled.
pub(crate) async fn run(
    idle: Duration,
    last_write: Arc<Mutex<Instant>>,
    tx: Option<mpsc::Sender<Outbound>>,
    token: CancellationToken,
) {
    let Some(tx) = tx else {
        return;
    };
    let check = idle.min(Duration::from_secs(1)).max(Duration::from_millis(50));
    debug!("Heartbeat timer started (idle interval {:?})", idle);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(check) => {}
        }

        let elapsed = last_write
            .lock()
            .expect("last_write lock poisoned")
            .elapsed();
        if elapsed < idle {
            continue;
        }

        trace!("Connection idle for {:?}; enqueueing keepalive", elapsed);
        let send = tokio::select! {
            _ = token.cancelled() => break,
            sent = tx.send(Outbound::keepalive()) => sent,
        };
        if send.is_err() {
            break;
        }
        // The write itself refreshes last_write; avoid a burst while the
        // keepalive waits for a rate-limit token.
        *last_write.lock().expect("last_write lock poisoned") = Instant::now();
    }
    debug!("Heartbeat timer finished");
}
