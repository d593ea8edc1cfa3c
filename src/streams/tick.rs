//! Live tick streams.

use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;

use crate::protocol::envelope::Envelope;
use crate::session::SessionShared;
use crate::streams::registry::Subscription;
use crate::streams::StreamCore;
use crate::types::{price_from_wire, SpotEvent, Tick};

fn decode_tick(envelope: &Envelope, symbol_names: &HashMap<i64, String>) -> Option<Tick> {
    let event = SpotEvent::decode(envelope.payload.as_ref()).ok()?;
    // Spot events without a quote are trendbar-only updates.
    if event.bid.is_none() && event.ask.is_none() {
        return None;
    }
    let symbol_name = symbol_names
        .get(&event.symbol_id)
        .cloned()
        .unwrap_or_else(|| event.symbol_id.to_string());
    Some(Tick {
        symbol_id: event.symbol_id,
        symbol_name,
        bid: event.bid.map(price_from_wire),
        ask: event.ask.map(price_from_wire),
        timestamp: event.timestamp,
    })
}

/// Async iterator over ticks of one symbol.
///
/// Queue policy is drop-oldest: under load the consumer keeps seeing the
/// most recent quotes. The iterator pauses across reconnects and ends only
/// when closed, dropped, or the session dies.
///
/// # Examples
///
/// ```no_run
/// # async fn example(session: &ctrader_connector_rs::session::CTraderSession) {
/// let mut ticks = session.subscribe_ticks(1, "EURUSD").await.unwrap();
/// while let Some(tick) = ticks.next().await {
///     println!("{}: {:?}/{:?}", tick.symbol_name, tick.bid, tick.ask);
/// }
/// # }
/// ```
pub struct TickStream {
    core: StreamCore,
    symbol_names: HashMap<i64, String>,
}

impl TickStream {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        sub: Arc<Subscription>,
        symbol_id: i64,
        symbol_name: String,
    ) -> Self {
        let mut symbol_names = HashMap::new();
        symbol_names.insert(symbol_id, symbol_name);
        Self {
            core: StreamCore::new(shared, sub),
            symbol_names,
        }
    }

    /// The next tick, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Tick> {
        loop {
            let envelope = self.core.next_envelope().await?;
            if let Some(tick) = decode_tick(&envelope, &self.symbol_names) {
                return Some(tick);
            }
        }
    }

    /// Unsubscribes and removes the stream.
    pub async fn close(mut self) {
        self.core.close().await;
    }
}

/// Async iterator over ticks of several symbols sharing one subscription.
///
/// With `coalesce_latest` the queue keeps only the newest tick per symbol
/// under load; otherwise it behaves like [`TickStream`] with drop-oldest.
pub struct MultiTickStream {
    core: StreamCore,
    symbol_names: HashMap<i64, String>,
}

impl MultiTickStream {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        sub: Arc<Subscription>,
        symbol_names: HashMap<i64, String>,
    ) -> Self {
        Self {
            core: StreamCore::new(shared, sub),
            symbol_names,
        }
    }

    /// The next tick from any subscribed symbol.
    pub async fn next(&mut self) -> Option<Tick> {
        loop {
            let envelope = self.core.next_envelope().await?;
            if let Some(tick) = decode_tick(&envelope, &self.symbol_names) {
                return Some(tick);
            }
        }
    }

    pub fn symbol_ids(&self) -> Vec<i64> {
        self.symbol_names.keys().copied().collect()
    }

    /// Unsubscribes and removes the stream.
    pub async fn close(mut self) {
        self.core.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{encode_payload, payload_type};

    fn spot(symbol_id: i64, bid: Option<u64>, ask: Option<u64>) -> Envelope {
        let event = SpotEvent {
            ctid_trader_account_id: 1,
            symbol_id,
            bid,
            ask,
            trendbar: Vec::new(),
            timestamp: Some(1_700_000_000_000),
        };
        Envelope::new(payload_type::SPOT_EVENT, encode_payload(&event))
    }

    #[test]
    fn test_decode_tick_scales_prices() {
        let mut names = HashMap::new();
        names.insert(42i64, "EURUSD".to_string());
        let tick = decode_tick(&spot(42, Some(110_000), Some(110_020)), &names).unwrap();
        assert_eq!(tick.symbol_name, "EURUSD");
        assert!((tick.bid.unwrap() - 1.1).abs() < 1e-9);
        assert!((tick.ask.unwrap() - 1.1002).abs() < 1e-9);
        assert_eq!(tick.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_decode_tick_skips_quoteless_events() {
        let names = HashMap::new();
        assert!(decode_tick(&spot(42, None, None), &names).is_none());
    }

    #[test]
    fn test_decode_tick_unknown_symbol_uses_id() {
        let names = HashMap::new();
        let tick = decode_tick(&spot(7, Some(110_000), None), &names).unwrap();
        assert_eq!(tick.symbol_name, "7");
        assert!(tick.ask.is_none());
    }
}
