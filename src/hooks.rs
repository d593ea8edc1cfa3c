//! Hook points and the session event bus.
//!
//! Hooks observe the request path (pre/post send, post response). They run
//! sequentially per invocation on the caller's task, never on the read
//! loop, so a slow hook only delays its own request.
//!
//! The event bus is a broadcast channel carrying everything else an
//! embedder may want to observe: reconnect lifecycle, the raw-envelope tap,
//! drops, and model refresh events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use crate::auth::SessionState;
use crate::protocol::envelope::Envelope;

/// Named hook points on the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Before the request is handed to the send scheduler
    PreSendRequest,
    /// After the frame was accepted by the send scheduler
    PostSendRequest,
    /// After the matching response resolved the request
    PostResponse,
}

/// Context passed to request-path hooks.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Payload-type tag of the request
    pub payload_type: u32,
    /// Correlation id, once one has been assigned
    pub correlation_id: Option<String>,
    /// Encoded envelope size in bytes (post-send and later)
    pub bytes: usize,
    /// Time from pre-send to response (post-response only)
    pub elapsed: Option<Duration>,
}

/// An async hook callback.
pub type Hook = Arc<dyn Fn(HookContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of request-path hooks, keyed by hook point.
#[derive(Default)]
pub struct HookManager {
    hooks: Mutex<HashMap<HookPoint, Vec<Hook>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook at the given point.
    pub fn on(&self, point: HookPoint, hook: Hook) {
        self.hooks
            .lock()
            .expect("hook lock poisoned")
            .entry(point)
            .or_default()
            .push(hook);
    }

    /// Runs all hooks at the point, sequentially, in registration order.
    pub(crate) async fn run(&self, point: HookPoint, ctx: HookContext) {
        let hooks: Vec<Hook> = {
            let hooks = self.hooks.lock().expect("hook lock poisoned");
            match hooks.get(&point) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for hook in hooks {
            hook(ctx.clone()).await;
        }
    }
}

/// Which model slice was re-fetched during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRefreshKind {
    Symbols,
    Trader,
    Reconcile,
}

/// Events published on the session bus.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session moved to a new state
    StateChanged(SessionState),
    /// The supervisor is about to try a reconnect
    ReconnectAttempt { attempt: u32 },
    /// A reconnect cycle finished with the session `Ready`
    ReconnectSuccess { attempts: u32 },
    /// Reconnection hit a non-retriable failure; the session is `Fatal`
    ReconnectFatal { reason: String },
    /// Raw tap: every decoded inbound envelope
    EnvelopeReceived(Envelope),
    /// The inbound staging queue shed its oldest frame
    InboundDropped,
    /// A subscription queue shed an item
    StreamDropped { topic: String },
    /// Recovery is about to replay the model re-fetches
    ModelRefreshStart,
    /// One model slice arrived during recovery
    ModelRefreshed {
        kind: ModelRefreshKind,
        payload: Bytes,
    },
    /// Recovery finished replaying the model re-fetches
    ModelRefreshEnd,
}

/// Creates the session event bus. The connector only ever sends; embedders
/// subscribe through [`crate::session::CTraderSession::events`].
pub(crate) fn event_bus(capacity: usize) -> broadcast::Sender<SessionEvent> {
    broadcast::channel(capacity.max(16)).0
}
