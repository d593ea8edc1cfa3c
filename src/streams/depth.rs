//! Order book depth streaming (Level II market data).
//!
//! The server sends incremental updates: quotes added plus quote ids
//! removed. The stream maintains a per-symbol book and yields a full sorted
//! snapshot after each applied delta. The book is rebuilt from scratch
//! after a reconnect; no delta ever crosses a session boundary.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use prost::Message;

use crate::session::SessionShared;
use crate::streams::registry::Subscription;
use crate::streams::StreamCore;
use crate::types::{
    price_from_wire, volume_from_wire, DepthEvent, DepthQuote, DepthSnapshot, QuoteSide,
};

/// In-memory book for one symbol, keyed by quote id.
#[derive(Default)]
pub(crate) struct OrderBook {
    bids: HashMap<u64, DepthQuote>,
    asks: HashMap<u64, DepthQuote>,
}

impl OrderBook {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Applies one delta and returns the resulting snapshot.
    pub(crate) fn apply(&mut self, event: &DepthEvent, symbol_name: &str) -> DepthSnapshot {
        for quote in &event.new_quotes {
            let volume = volume_from_wire(quote.size);
            if let Some(bid) = quote.bid {
                self.bids.insert(
                    quote.id,
                    DepthQuote {
                        id: quote.id,
                        price: price_from_wire(bid),
                        volume,
                        side: QuoteSide::Bid,
                    },
                );
            } else if let Some(ask) = quote.ask {
                self.asks.insert(
                    quote.id,
                    DepthQuote {
                        id: quote.id,
                        price: price_from_wire(ask),
                        volume,
                        side: QuoteSide::Ask,
                    },
                );
            }
        }
        for id in &event.deleted_quotes {
            // Ids unknown to the book are tolerated; the server may delete
            // quotes the client never saw after a partial subscribe.
            self.bids.remove(id);
            self.asks.remove(id);
        }

        let mut bids: Vec<DepthQuote> = self.bids.values().cloned().collect();
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).expect("finite prices"));
        let mut asks: Vec<DepthQuote> = self.asks.values().cloned().collect();
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).expect("finite prices"));

        DepthSnapshot {
            symbol_id: event.symbol_id,
            symbol_name: symbol_name.to_string(),
            bids,
            asks,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Async iterator yielding an order book snapshot after every applied
/// delta.
///
/// # Examples
///
/// ```no_run
/// # async fn example(session: &ctrader_connector_rs::session::CTraderSession) {
/// let mut depth = session.subscribe_depth(1, "EURUSD").await.unwrap();
/// while let Some(snapshot) = depth.next().await {
///     if let (Some(bid), Some(ask)) = (snapshot.best_bid(), snapshot.best_ask()) {
///         println!("{} @ {} / {} @ {}", bid.volume, bid.price, ask.volume, ask.price);
///     }
/// }
/// # }
/// ```
pub struct DepthStream {
    core: StreamCore,
    symbol_name: String,
    book: OrderBook,
    seen_generation: u64,
}

impl DepthStream {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        sub: Arc<Subscription>,
        symbol_name: String,
    ) -> Self {
        let seen_generation = sub.generation();
        Self {
            core: StreamCore::new(shared, sub),
            symbol_name,
            book: OrderBook::new(),
            seen_generation,
        }
    }

    /// The next snapshot, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<DepthSnapshot> {
        loop {
            let envelope = self.core.next_envelope().await?;

            // A rearm means a new server-side subscription: the old book is
            // meaningless against the fresh delta sequence.
            let generation = self.core.subscription().generation();
            if generation != self.seen_generation {
                self.book.clear();
                self.seen_generation = generation;
            }

            match DepthEvent::decode(envelope.payload.as_ref()) {
                Ok(event) => return Some(self.book.apply(&event, &self.symbol_name)),
                Err(_) => continue,
            }
        }
    }

    /// Unsubscribes and removes the stream.
    pub async fn close(mut self) {
        self.core.close().await;
    }
}
