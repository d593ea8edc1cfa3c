//! Per-connection plumbing: the reader/worker pipeline, the rate-limited
//! writer, and the correlated request path.
//!
//! Exactly one reader task owns the read half of the socket and exactly one
//! writer task owns the write half. Inbound frames pass through a bounded
//! staging queue before decode/dispatch so a slow consumer applies
//! backpressure instead of growing memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, SessionState};
use crate::error::{CTraderError, Result};
use crate::hooks::{HookContext, HookPoint, SessionEvent};
use crate::protocol::dispatcher::{classify, TopicMatch, ORPHAN_TOPIC};
use crate::protocol::envelope::{self, Envelope};
use crate::protocol::queue::{DeliveryQueue, OfferOutcome, QueuePolicy};
use crate::session::SessionShared;
use crate::transport::{self, FrameCodec};
use crate::types::{self, payload_type};

/// Outbound queue depth between callers and the writer task.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Housekeeping scan interval; expired correlator entries are resolved
/// within one tick.
pub(crate) const HOUSEKEEPING_TICK: Duration = Duration::from_millis(100);

/// A frame queued for the writer task.
pub(crate) struct Outbound {
    pub frame: Bytes,
    /// Set when the owning request was cancelled before the frame was
    /// drawn from the queue; the writer discards it without writing.
    pub cancelled: Option<Arc<AtomicBool>>,
}

impl Outbound {
    pub(crate) fn keepalive() -> Self {
        let envelope = Envelope::new(
            payload_type::HEARTBEAT_EVENT,
            types::encode_payload(&types::HeartbeatEvent {}),
        );
        Self {
            frame: envelope::encode(&envelope),
            cancelled: None,
        }
    }
}

/// Notification that a connection generation died.
#[derive(Debug)]
pub(crate) struct ConnectionLost {
    pub generation: u64,
    pub reason: String,
}

/// Opens a transport, wires up the reader/worker/writer/heartbeat tasks for
/// a new connection generation, and installs its outbound sender. Returns
/// the generation number.
pub(crate) async fn open_connection(
    shared: &Arc<SessionShared>,
    lost_tx: &mpsc::Sender<ConnectionLost>,
) -> Result<u64> {
    let stream = transport::connect(&shared.config).await?;
    let generation = shared.next_generation();

    let codec = FrameCodec::new(shared.config.max_frame_bytes);
    let (read_half, write_half) = tokio::io::split(stream);
    let framed_read = FramedRead::new(read_half, codec.clone());
    let framed_write = FramedWrite::new(write_half, codec);

    let token = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_CAPACITY);

    let staging_policy = if shared.config.drop_inbound_when_full {
        QueuePolicy::DropOldest
    } else {
        QueuePolicy::Block
    };
    let staging = Arc::new(DeliveryQueue::<Bytes>::new(
        shared.config.inbound_queue_size,
        staging_policy,
    ));
    let last_write = Arc::new(Mutex::new(Instant::now()));

    shared.install_connection(outbound_tx.clone(), token.clone());

    tokio::spawn(writer_loop(
        Arc::clone(shared),
        outbound_rx,
        framed_write,
        Arc::clone(&last_write),
        token.clone(),
        generation,
        lost_tx.clone(),
    ));
    tokio::spawn(reader_loop(
        Arc::clone(shared),
        framed_read,
        Arc::clone(&staging),
        token.clone(),
        generation,
        lost_tx.clone(),
    ));
    tokio::spawn(worker_loop(
        Arc::clone(shared),
        staging,
        outbound_tx,
        token.clone(),
        generation,
        lost_tx.clone(),
    ));
    tokio::spawn(crate::heartbeat::run(
        shared.config.heartbeat_idle(),
        last_write,
        shared.sender(),
        token,
    ));

    debug!("Connection generation {} established", generation);
    Ok(generation)
}

fn report_lost(
    lost_tx: &mpsc::Sender<ConnectionLost>,
    token: &CancellationToken,
    generation: u64,
    reason: String,
) {
    token.cancel();
    // The supervisor dedups by generation, so a full channel is harmless.
    let _ = lost_tx.try_send(ConnectionLost { generation, reason });
}

async fn writer_loop(
    shared: Arc<SessionShared>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: FramedWrite<tokio::io::WriteHalf<transport::MaybeTlsStream>, FrameCodec>,
    last_write: Arc<Mutex<Instant>>,
    token: CancellationToken,
    generation: u64,
    lost_tx: mpsc::Sender<ConnectionLost>,
) {
    loop {
        let outbound = tokio::select! {
            _ = token.cancelled() => break,
            out = rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        if is_cancelled(&outbound) {
            trace!("Discarding cancelled frame before rate limiting");
            continue;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = shared.bucket.acquire() => {}
        }

        // The caller may have cancelled while the frame waited for a token.
        if is_cancelled(&outbound) {
            trace!("Discarding cancelled frame after rate limiting");
            continue;
        }

        let len = outbound.frame.len();
        if let Err(e) = sink.send(outbound.frame).await {
            error!("Socket write failed: {}", e);
            report_lost(&lost_tx, &token, generation, format!("write failed: {}", e));
            break;
        }
        *last_write.lock().expect("last_write lock poisoned") = Instant::now();
        shared.metrics.frame_sent(len);
        trace!("Wrote frame of {} bytes", len);
    }
    debug!("Writer task finished (generation {})", generation);
}

fn is_cancelled(outbound: &Outbound) -> bool {
    outbound
        .cancelled
        .as_ref()
        .map(|flag| flag.load(Ordering::Acquire))
        .unwrap_or(false)
}

async fn reader_loop(
    shared: Arc<SessionShared>,
    mut framed: FramedRead<tokio::io::ReadHalf<transport::MaybeTlsStream>, FrameCodec>,
    staging: Arc<DeliveryQueue<Bytes>>,
    token: CancellationToken,
    generation: u64,
    lost_tx: mpsc::Sender<ConnectionLost>,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = framed.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                shared.metrics.frame_received();
                match staging.offer(None, frame).await {
                    OfferOutcome::DroppedOldest => {
                        shared.metrics.inbound_dropped();
                        shared.emit(SessionEvent::InboundDropped);
                    }
                    OfferOutcome::Closed => break,
                    _ => {}
                }
            }
            Some(Err(e)) => {
                error!("Frame read failed: {}", e);
                report_lost(&lost_tx, &token, generation, format!("read failed: {}", e));
                break;
            }
            None => {
                info!("Connection closed by server");
                report_lost(
                    &lost_tx,
                    &token,
                    generation,
                    "connection closed by server".to_string(),
                );
                break;
            }
        }
    }
    staging.close();
    debug!("Reader task finished (generation {})", generation);
}

async fn worker_loop(
    shared: Arc<SessionShared>,
    staging: Arc<DeliveryQueue<Bytes>>,
    outbound_tx: mpsc::Sender<Outbound>,
    token: CancellationToken,
    generation: u64,
    lost_tx: mpsc::Sender<ConnectionLost>,
) {
    while let Some(frame) = staging.pop().await {
        let envelope = match envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Envelope decode failed: {}", e);
                report_lost(
                    &lost_tx,
                    &token,
                    generation,
                    format!("envelope decode failed: {}", e),
                );
                break;
            }
        };
        handle_envelope(&shared, envelope, &outbound_tx).await;
    }
    debug!("Inbound worker finished (generation {})", generation);
}

async fn handle_envelope(
    shared: &Arc<SessionShared>,
    envelope: Envelope,
    outbound_tx: &mpsc::Sender<Outbound>,
) {
    shared.emit(SessionEvent::EnvelopeReceived(envelope.clone()));

    if envelope.payload_type == payload_type::HEARTBEAT_EVENT {
        trace!("Server keepalive received; replying");
        let _ = outbound_tx.try_send(Outbound::keepalive());
        return;
    }

    if let Some(id) = envelope.client_msg_id.clone() {
        let result = if types::is_error_payload(envelope.payload_type) {
            Err(auth::decode_remote_error(
                envelope.payload_type,
                envelope.payload.as_ref(),
            ))
        } else {
            Ok(envelope.clone())
        };
        let was_error = result.is_err();
        if shared.correlator.resolve(&id, result) {
            if was_error {
                shared.metrics.request_error();
            }
            return;
        }
        // Cancelled or timed out before the response arrived: observable on
        // the orphan topic, otherwise discarded.
        debug!("Orphaned response for correlation id {}", id);
        shared.metrics.inbound_orphaned();
        let orphan = TopicMatch {
            key: ORPHAN_TOPIC.to_string(),
            coalesce_key: None,
        };
        shared.dispatcher.dispatch(&orphan, &envelope).await;
        return;
    }

    let topics = classify(&envelope);
    if topics.is_empty() {
        shared.metrics.inbound_unrouted();
        trace!(
            "No route for uncorrelated payload type {}",
            envelope.payload_type
        );
        return;
    }
    for topic in &topics {
        let outcome = shared.dispatcher.dispatch(topic, &envelope).await;
        if outcome.dropped > 0 {
            shared.metrics.stream_dropped(outcome.dropped as u64);
            shared.emit(SessionEvent::StreamDropped {
                topic: topic.key.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Request path
// ---------------------------------------------------------------------------

/// Removes the correlator entry if the request future is dropped before it
/// completes, and marks the queued frame so the scheduler skips it.
struct RequestGuard {
    shared: Arc<SessionShared>,
    id: String,
    armed: bool,
}

impl RequestGuard {
    fn new(shared: Arc<SessionShared>, id: String) -> Self {
        Self {
            shared,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.armed && self.shared.correlator.cancel(&self.id) {
            debug!("Request {} cancelled by caller", self.id);
            self.shared.metrics.request_cancelled();
        }
    }
}

/// Sends a correlated request and awaits its resolution.
///
/// With `gated`, the call waits for `Ready` (bounded by `timeout`) and runs
/// the request-path hooks; the authentication handshake itself runs ungated.
/// Dropping the returned future cancels the request: the correlator entry is
/// removed and, if the frame is still queued, it never reaches the wire.
pub(crate) async fn request_envelope(
    shared: &Arc<SessionShared>,
    request_type: u32,
    payload: Bytes,
    timeout: Duration,
    gated: bool,
) -> Result<Envelope> {
    if gated {
        shared
            .hooks
            .run(
                HookPoint::PreSendRequest,
                HookContext {
                    payload_type: request_type,
                    correlation_id: None,
                    bytes: 0,
                    elapsed: None,
                },
            )
            .await;
        wait_ready(shared, timeout).await?;
    }

    let handle = shared.correlator.register(request_type, timeout);
    let mut guard = RequestGuard::new(Arc::clone(shared), handle.id.clone());

    let envelope = Envelope::with_correlation(request_type, payload, handle.id.clone());
    let frame = envelope::encode(&envelope);
    let frame_len = frame.len();

    let sender = match shared.sender() {
        Some(sender) => sender,
        None => {
            guard.disarm();
            shared.correlator.cancel(&handle.id);
            return Err(CTraderError::transport_lost("no active connection"));
        }
    };
    let outbound = Outbound {
        frame,
        cancelled: Some(Arc::clone(&handle.cancelled)),
    };
    if sender.send(outbound).await.is_err() {
        guard.disarm();
        shared.correlator.cancel(&handle.id);
        return Err(CTraderError::transport_lost("send queue closed"));
    }

    if gated {
        // Counters track the user-visible request surface; the auth
        // handshake and recovery traffic stay out of them.
        shared.metrics.request_sent();
        shared
            .hooks
            .run(
                HookPoint::PostSendRequest,
                HookContext {
                    payload_type: request_type,
                    correlation_id: Some(handle.id.clone()),
                    bytes: frame_len,
                    elapsed: None,
                },
            )
            .await;
    }

    let started = Instant::now();
    let result = handle.receiver.await;
    guard.disarm();

    match result {
        Ok(Ok(response)) => {
            let elapsed = started.elapsed();
            if gated {
                shared.metrics.response_received(elapsed);
                shared
                    .hooks
                    .run(
                        HookPoint::PostResponse,
                        HookContext {
                            payload_type: response.payload_type,
                            correlation_id: Some(handle.id),
                            bytes: frame_len,
                            elapsed: Some(elapsed),
                        },
                    )
                    .await;
            }
            Ok(response)
        }
        Ok(Err(e)) => Err(e),
        // The sink vanished without a resolution, which only happens when
        // the correlator itself is torn down.
        Err(_) => Err(CTraderError::transport_lost("request slot dropped")),
    }
}

/// Waits until the session is `Ready`, bounded by `timeout`.
///
/// Transient states wait; `Disconnected` fails fast with `NotReady`;
/// `Fatal` fails fast with `AuthFailed`.
pub(crate) async fn wait_ready(shared: &Arc<SessionShared>, timeout: Duration) -> Result<()> {
    let mut rx = shared.state_receiver();
    let deadline = Instant::now() + timeout;
    loop {
        let state = *rx.borrow_and_update();
        match state {
            SessionState::Ready => return Ok(()),
            SessionState::Fatal => {
                return Err(CTraderError::AuthFailed(
                    "session is in the fatal state".to_string(),
                ))
            }
            SessionState::Disconnected => return Err(CTraderError::NotReady { state }),
            _ => {
                debug_assert!(state.is_transient());
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CTraderError::Timeout { timeout });
        }
        match tokio::time::timeout(remaining, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return Err(CTraderError::NotReady { state }),
            Err(_) => return Err(CTraderError::Timeout { timeout }),
        }
    }
}

/// Spawns the correlator housekeeping tick. The task holds only a weak
/// reference and stops when the session is dropped.
pub(crate) fn spawn_housekeeping(shared: &Arc<SessionShared>) -> tokio::task::JoinHandle<()> {
    let weak: Weak<SessionShared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HOUSEKEEPING_TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let expired = shared.correlator.expire_due(Instant::now());
            if expired > 0 {
                warn!("{} request(s) expired", expired);
                shared.metrics.request_timeout(expired as u64);
            }
        }
    })
}
