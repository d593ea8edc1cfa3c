//! Live subscription tracking and reconnect rearm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::protocol::dispatcher::EventDispatcher;
use crate::protocol::envelope::Envelope;
use crate::protocol::handler;
use crate::protocol::queue::{DeliveryQueue, QueuePolicy};
use crate::session::SessionShared;

/// One request of a resubscribe recipe: enough to recreate the subscription
/// on any fresh, authenticated session.
#[derive(Debug, Clone)]
pub struct ResubscribeRequest {
    pub payload_type: u32,
    pub payload: Bytes,
}

/// A live subscription: its topic registration, bounded queue, and the
/// recipe that rearms it after a reconnect.
pub struct Subscription {
    id: u64,
    topic_keys: Vec<String>,
    pub(crate) queue: Arc<DeliveryQueue<Envelope>>,
    recipe: Vec<ResubscribeRequest>,
    unsubscribe: Vec<ResubscribeRequest>,
    alive: AtomicBool,
    // Bumped on every rearm; consumers that keep derived state (the order
    // book) reset it when the generation moves.
    generation: AtomicU64,
    purge_on_rearm: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic_keys(&self) -> &[String] {
        &self.topic_keys
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn unsubscribe_recipe(&self) -> &[ResubscribeRequest] {
        &self.unsubscribe
    }
}

/// Holds every live subscription so streams survive reconnects.
#[derive(Default)]
pub struct StreamRegistry {
    subs: Mutex<HashMap<u64, Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the bounded queue and registers it with the dispatcher
    /// under each topic key.
    pub(crate) fn subscribe(
        &self,
        dispatcher: &EventDispatcher,
        topic_keys: Vec<String>,
        capacity: usize,
        policy: QueuePolicy,
        recipe: Vec<ResubscribeRequest>,
        unsubscribe: Vec<ResubscribeRequest>,
        purge_on_rearm: bool,
    ) -> Arc<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let queue = Arc::new(DeliveryQueue::new(capacity, policy));
        let subscription = Arc::new(Subscription {
            id,
            topic_keys: topic_keys.clone(),
            queue: Arc::clone(&queue),
            recipe,
            unsubscribe,
            alive: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            purge_on_rearm,
        });
        dispatcher.register(id, &topic_keys, queue);
        self.subs
            .lock()
            .expect("registry lock poisoned")
            .insert(id, Arc::clone(&subscription));
        debug!("Subscription {} opened for {:?}", id, topic_keys);
        subscription
    }

    /// Removes a subscription: dispatcher routes are dropped and the queue
    /// is closed so the consumer sees end-of-stream.
    pub(crate) fn remove(&self, dispatcher: &EventDispatcher, subscription: &Subscription) {
        subscription.alive.store(false, Ordering::Release);
        dispatcher.unregister(subscription.id);
        subscription.queue.close();
        self.subs
            .lock()
            .expect("registry lock poisoned")
            .remove(&subscription.id);
        debug!("Subscription {} closed", subscription.id);
    }

    /// Re-issues every live subscription's recipe against a fresh `Ready`
    /// session. Best-effort and per-subscription: one failure logs and
    /// moves on; the iterator on the other side stays alive either way.
    pub(crate) async fn rearm_all(&self, shared: &Arc<SessionShared>) -> usize {
        let subs: Vec<Arc<Subscription>> = {
            let subs = self.subs.lock().expect("registry lock poisoned");
            subs.values().cloned().collect()
        };
        let mut rearmed = 0;
        for sub in subs {
            if !sub.is_alive() || sub.recipe.is_empty() {
                continue;
            }
            if sub.purge_on_rearm {
                let purged = sub.queue.purge();
                if purged > 0 {
                    debug!(
                        "Purged {} stale item(s) from subscription {}",
                        purged,
                        sub.id()
                    );
                }
            }
            sub.generation.fetch_add(1, Ordering::AcqRel);

            let mut ok = true;
            for req in &sub.recipe {
                let result = handler::request_envelope(
                    shared,
                    req.payload_type,
                    req.payload.clone(),
                    shared.config.request_timeout(),
                    false,
                )
                .await;
                if let Err(e) = result {
                    warn!(
                        "Failed to rearm subscription {} ({:?}): {}",
                        sub.id(),
                        sub.topic_keys(),
                        e
                    );
                    ok = false;
                    break;
                }
            }
            if ok {
                rearmed += 1;
            }
        }
        info!("Rearmed {} subscription(s)", rearmed);
        rearmed
    }

    /// Closes every queue. Terminal: used on disconnect and `Fatal`, where
    /// all streams must end with end-of-stream.
    pub(crate) fn close_all(&self) {
        let subs: Vec<Arc<Subscription>> = {
            let mut subs = self.subs.lock().expect("registry lock poisoned");
            subs.drain().map(|(_, sub)| sub).collect()
        };
        for sub in &subs {
            sub.alive.store(false, Ordering::Release);
            sub.queue.close();
        }
        if !subs.is_empty() {
            debug!("Closed {} subscription(s)", subs.len());
        }
    }

    pub fn live_count(&self) -> usize {
        self.subs.lock().expect("registry lock poisoned").len()
    }
}
