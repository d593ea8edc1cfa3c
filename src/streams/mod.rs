//! Typed async streams over dispatcher subscriptions.
//!
//! Every stream is backed by exactly one [`registry::Subscription`] and its
//! bounded queue. During a reconnect the queue simply goes quiet; the
//! consumer sees a gap, never an end-of-stream. Queues end only when the
//! consumer closes the stream, the session disconnects, or the session goes
//! fatal.

pub mod candle;
pub mod depth;
pub mod execution;
pub mod registry;
pub mod tick;

pub use candle::CandleStream;
pub use depth::DepthStream;
pub use execution::ExecutionStream;
pub use registry::{ResubscribeRequest, StreamRegistry, Subscription};
pub use tick::{MultiTickStream, TickStream};

use std::sync::Arc;

use crate::protocol::envelope::Envelope;
use crate::protocol::handler;
use crate::session::SessionShared;

/// Shared lifecycle plumbing for all stream types: queue access, the
/// best-effort unsubscribe on close, and registry removal on drop.
pub(crate) struct StreamCore {
    shared: Arc<SessionShared>,
    sub: Arc<registry::Subscription>,
    closed: bool,
}

impl StreamCore {
    pub(crate) fn new(shared: Arc<SessionShared>, sub: Arc<registry::Subscription>) -> Self {
        Self {
            shared,
            sub,
            closed: false,
        }
    }

    pub(crate) fn subscription(&self) -> &registry::Subscription {
        &self.sub
    }

    pub(crate) async fn next_envelope(&self) -> Option<Envelope> {
        self.sub.queue.pop().await
    }

    /// Sends the unsubscribe request(s) and removes the subscription. The
    /// request is best-effort; local teardown always happens.
    pub(crate) async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for req in self.sub.unsubscribe_recipe() {
            let _ = handler::request_envelope(
                &self.shared,
                req.payload_type,
                req.payload.clone(),
                self.shared.config.request_timeout(),
                false,
            )
            .await;
        }
        self.shared
            .registry
            .remove(&self.shared.dispatcher, &self.sub);
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        // Consumer dropped the stream without an explicit close: still
        // remove every local trace of the subscription. The unsubscribe
        // request is skipped; the server-side subscription dies with the
        // session or the next reconnect.
        if !self.closed {
            self.shared
                .registry
                .remove(&self.shared.dispatcher, &self.sub);
        }
    }
}

/// An untyped stream yielding raw envelopes for a caller-chosen topic key.
/// This is the escape hatch behind the typed streams, and the way to
/// observe the `orphan` diagnostics topic.
pub struct RawStream {
    core: StreamCore,
}

impl RawStream {
    pub(crate) fn new(shared: Arc<SessionShared>, sub: Arc<registry::Subscription>) -> Self {
        Self {
            core: StreamCore::new(shared, sub),
        }
    }

    /// The next envelope, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.core.next_envelope().await
    }

    pub fn topic_keys(&self) -> &[String] {
        self.core.subscription().topic_keys()
    }

    /// Unsubscribes and removes the stream.
    pub async fn close(mut self) {
        self.core.close().await;
    }
}
