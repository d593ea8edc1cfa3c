//! Live candle streaming.
//!
//! The server piggybacks trendbar updates for subscribed timeframes on spot
//! events. The stream yields the forming bar each time such an event
//! arrives for its symbol and period.

use std::sync::Arc;

use prost::Message;

use crate::session::SessionShared;
use crate::streams::registry::Subscription;
use crate::streams::StreamCore;
use crate::types::{SpotEvent, TrendBar, TrendbarPeriod};

/// Async iterator over the forming candle of one symbol/timeframe pair.
pub struct CandleStream {
    core: StreamCore,
    period: TrendbarPeriod,
}

impl CandleStream {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        sub: Arc<Subscription>,
        period: TrendbarPeriod,
    ) -> Self {
        Self {
            core: StreamCore::new(shared, sub),
            period,
        }
    }

    pub fn period(&self) -> TrendbarPeriod {
        self.period
    }

    /// The next trendbar update, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<TrendBar> {
        loop {
            let envelope = self.core.next_envelope().await?;
            let Ok(event) = SpotEvent::decode(envelope.payload.as_ref()) else {
                continue;
            };
            let bar = event
                .trendbar
                .iter()
                .filter(|bar| bar.period == Some(self.period.wire_value()))
                .find_map(|bar| TrendBar::from_wire(event.symbol_id, bar));
            if let Some(bar) = bar {
                return Some(bar);
            }
        }
    }

    /// Unsubscribes and removes the stream.
    pub async fn close(mut self) {
        self.core.close().await;
    }
}
