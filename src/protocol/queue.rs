//! Bounded delivery queues with per-subscription overflow policies.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// What a queue does when an item arrives and it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Suspend delivery (and therefore the inbound pipeline) until space is
    /// available. Never appropriate for high-volume streams.
    Block,
    /// Evict the head and enqueue the new item.
    DropOldest,
    /// Replace any pending item sharing the same coalescing key; fall back
    /// to drop-oldest when the key is new and the queue is full.
    CoalesceLatest,
}

/// Result of offering an item to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Delivered,
    DroppedOldest,
    Coalesced,
    Closed,
}

struct QueueState<T> {
    items: VecDeque<(Option<u64>, T)>,
    closed: bool,
}

enum Offered<T> {
    Done(OfferOutcome),
    Full(T),
}

enum Popped<T> {
    Item(T),
    Empty,
    Closed,
}

/// A bounded queue with an overflow policy and a coalescing key.
///
/// Producers call [`DeliveryQueue::offer`]; the consumer calls
/// [`DeliveryQueue::pop`], which returns `None` once the queue is closed
/// and drained. Closing wakes everyone. Waiting uses the
/// register-then-recheck (`Notified::enable`) pattern so no wakeup can be
/// lost between a state check and the await.
pub struct DeliveryQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    policy: QueuePolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> DeliveryQueue<T> {
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    // One locked attempt to place the item; under Block policy a full queue
    // hands the item back for another round.
    fn offer_once(&self, key: Option<u64>, item: T) -> Offered<T> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.closed {
            return Offered::Done(OfferOutcome::Closed);
        }

        if self.policy == QueuePolicy::CoalesceLatest {
            if let Some(key) = key {
                if let Some(slot) = state.items.iter_mut().find(|(k, _)| *k == Some(key)) {
                    slot.1 = item;
                    self.not_empty.notify_waiters();
                    return Offered::Done(OfferOutcome::Coalesced);
                }
            }
        }

        if state.items.len() < self.capacity {
            state.items.push_back((key, item));
            self.not_empty.notify_waiters();
            return Offered::Done(OfferOutcome::Delivered);
        }

        match self.policy {
            QueuePolicy::Block => Offered::Full(item),
            QueuePolicy::DropOldest | QueuePolicy::CoalesceLatest => {
                state.items.pop_front();
                state.items.push_back((key, item));
                self.not_empty.notify_waiters();
                Offered::Done(OfferOutcome::DroppedOldest)
            }
        }
    }

    /// Offers an item. Suspends only under [`QueuePolicy::Block`] when the
    /// queue is full.
    pub async fn offer(&self, key: Option<u64>, item: T) -> OfferOutcome {
        let mut item = item;
        loop {
            item = match self.offer_once(key, item) {
                Offered::Done(outcome) => return outcome,
                Offered::Full(item) => item,
            };

            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Space may have appeared between the failed attempt and the
            // waiter registration.
            item = match self.offer_once(key, item) {
                Offered::Done(outcome) => return outcome,
                Offered::Full(item) => item,
            };
            notified.await;
        }
    }

    fn pop_once(&self) -> Popped<T> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if let Some((_, item)) = state.items.pop_front() {
            self.not_full.notify_waiters();
            return Popped::Item(item);
        }
        if state.closed {
            return Popped::Closed;
        }
        Popped::Empty
    }

    /// Pops the next item, waiting while the queue is open and empty.
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            match self.pop_once() {
                Popped::Item(item) => return Some(item),
                Popped::Closed => return None,
                Popped::Empty => {}
            }

            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.pop_once() {
                Popped::Item(item) => return Some(item),
                Popped::Closed => return None,
                Popped::Empty => notified.await,
            }
        }
    }

    /// Pops without waiting.
    pub fn try_pop(&self) -> Option<T> {
        match self.pop_once() {
            Popped::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards all queued items. Used when a subscription is rearmed and
    /// stale pre-reconnect items must not reach the consumer.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let n = state.items.len();
        state.items.clear();
        drop(state);
        if n > 0 {
            self.not_full.notify_waiters();
        }
        n
    }

    /// Closes the queue. Pending items remain poppable; producers and the
    /// consumer are woken.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.closed = true;
        drop(state);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("queue lock poisoned").closed
    }
}
