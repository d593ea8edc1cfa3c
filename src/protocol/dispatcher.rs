//! Routing of uncorrelated inbound envelopes to topic subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use prost::Message;

use crate::protocol::envelope::Envelope;
use crate::protocol::queue::{DeliveryQueue, OfferOutcome};
use crate::types::{payload_type, DepthEvent, SpotEvent};

/// Topic that receives responses whose correlation entry was already
/// cancelled or timed out. Observable for diagnostics.
pub const ORPHAN_TOPIC: &str = "orphan";

/// A topic computed for an inbound envelope, with the key used for
/// coalescing queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch {
    pub key: String,
    pub coalesce_key: Option<u64>,
}

/// Builds the topic key for tick subscriptions of one symbol.
pub fn tick_topic(symbol_id: i64) -> String {
    format!("ticks:{}", symbol_id)
}

/// Builds the topic key for depth subscriptions of one symbol.
pub fn depth_topic(symbol_id: i64) -> String {
    format!("depth:{}", symbol_id)
}

/// Builds the topic key for candle subscriptions of one symbol/period pair.
pub fn candle_topic(symbol_id: i64, period: i32) -> String {
    format!("candles:{}:{}", symbol_id, period)
}

/// Topic key for execution events.
pub const EXECUTION_TOPIC: &str = "execution";

/// Computes the topics an uncorrelated envelope belongs to.
///
/// This is a pure function of the payload-type tag and a few well-known
/// fields inside the payload (symbol id, trendbar periods). Envelopes whose
/// reserved payload fails to decode match nothing.
pub fn classify(envelope: &Envelope) -> Vec<TopicMatch> {
    match envelope.payload_type {
        payload_type::SPOT_EVENT => match SpotEvent::decode(envelope.payload.as_ref()) {
            Ok(event) => {
                let mut matches = vec![TopicMatch {
                    key: tick_topic(event.symbol_id),
                    coalesce_key: Some(event.symbol_id as u64),
                }];
                for bar in &event.trendbar {
                    if let Some(period) = bar.period {
                        matches.push(TopicMatch {
                            key: candle_topic(event.symbol_id, period),
                            coalesce_key: Some(event.symbol_id as u64),
                        });
                    }
                }
                matches
            }
            Err(e) => {
                debug!("Unparseable spot event skipped: {}", e);
                Vec::new()
            }
        },
        payload_type::DEPTH_EVENT => match DepthEvent::decode(envelope.payload.as_ref()) {
            Ok(event) => vec![TopicMatch {
                key: depth_topic(event.symbol_id as i64),
                coalesce_key: Some(event.symbol_id),
            }],
            Err(e) => {
                debug!("Unparseable depth event skipped: {}", e);
                Vec::new()
            }
        },
        payload_type::EXECUTION_EVENT => vec![TopicMatch {
            key: EXECUTION_TOPIC.to_string(),
            coalesce_key: None,
        }],
        _ => Vec::new(),
    }
}

/// Delivery counters for one dispatched envelope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

/// Maps topic keys to the bounded queues of their subscribers.
///
/// Within a single topic, envelopes are offered to every queue in
/// registration order, one at a time, so delivery order equals transport
/// receive order. No ordering is promised across topics.
#[derive(Default)]
pub struct EventDispatcher {
    topics: Mutex<HashMap<String, Vec<(u64, Arc<DeliveryQueue<Envelope>>)>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one subscriber queue under each of the given topic keys.
    /// The `subscriber_id` ties the registration to its subscription so it
    /// can be removed later.
    pub(crate) fn register(
        &self,
        subscriber_id: u64,
        keys: &[String],
        queue: Arc<DeliveryQueue<Envelope>>,
    ) {
        let mut topics = self.topics.lock().expect("dispatcher lock poisoned");
        for key in keys {
            topics
                .entry(key.clone())
                .or_default()
                .push((subscriber_id, Arc::clone(&queue)));
        }
        debug!("Registered subscriber {} for {:?}", subscriber_id, keys);
    }

    /// Removes every registration of the given subscriber.
    pub(crate) fn unregister(&self, subscriber_id: u64) {
        let mut topics = self.topics.lock().expect("dispatcher lock poisoned");
        topics.retain(|_, queues| {
            queues.retain(|(id, _)| *id != subscriber_id);
            !queues.is_empty()
        });
    }

    /// Offers an envelope to every subscriber of `topic` according to each
    /// queue's policy.
    pub(crate) async fn dispatch(
        &self,
        topic: &TopicMatch,
        envelope: &Envelope,
    ) -> DispatchOutcome {
        let queues: Vec<Arc<DeliveryQueue<Envelope>>> = {
            let topics = self.topics.lock().expect("dispatcher lock poisoned");
            match topics.get(&topic.key) {
                Some(queues) => queues.iter().map(|(_, q)| Arc::clone(q)).collect(),
                None => return DispatchOutcome::default(),
            }
        };

        let mut outcome = DispatchOutcome::default();
        for queue in queues {
            match queue.offer(topic.coalesce_key, envelope.clone()).await {
                OfferOutcome::Delivered | OfferOutcome::Coalesced => outcome.delivered += 1,
                OfferOutcome::DroppedOldest => {
                    outcome.delivered += 1;
                    outcome.dropped += 1;
                }
                OfferOutcome::Closed => {}
            }
        }
        outcome
    }

    /// Whether any subscriber is registered for the key.
    pub(crate) fn has_topic(&self, key: &str) -> bool {
        self.topics
            .lock()
            .expect("dispatcher lock poisoned")
            .contains_key(key)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("dispatcher lock poisoned").len()
    }
}
