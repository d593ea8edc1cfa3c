//! Typed execution event streaming.
//!
//! Execution events flow without an explicit subscribe, so this stream has
//! no resubscribe recipe and is not rearmed after a reconnect; the
//! supervisor's reconcile re-fetch covers the gap.

use std::sync::Arc;

use prost::Message;

use crate::session::SessionShared;
use crate::streams::registry::Subscription;
use crate::streams::StreamCore;
use crate::types::{ExecutionEvent, ExecutionEventData};

/// Async iterator over order/position lifecycle events.
///
/// # Examples
///
/// ```no_run
/// # async fn example(session: &ctrader_connector_rs::session::CTraderSession) {
/// use ctrader_connector_rs::types::ExecutionType;
///
/// let mut events = session.subscribe_execution().await.unwrap();
/// while let Some(event) = events.next().await {
///     if event.execution_type == ExecutionType::OrderFilled {
///         println!("Order {:?} filled", event.order_id);
///     }
/// }
/// # }
/// ```
pub struct ExecutionStream {
    core: StreamCore,
}

impl ExecutionStream {
    pub(crate) fn new(shared: Arc<SessionShared>, sub: Arc<Subscription>) -> Self {
        Self {
            core: StreamCore::new(shared, sub),
        }
    }

    /// The next execution event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        loop {
            let envelope = self.core.next_envelope().await?;
            match ExecutionEventData::decode(envelope.payload.as_ref()) {
                Ok(data) => return Some(ExecutionEvent::from_wire(&data)),
                Err(_) => continue,
            }
        }
    }

    /// Removes the stream.
    pub async fn close(mut self) {
        self.core.close().await;
    }
}
