//! # Event Bus
//!
//! Fan-out of transaction status changes to external subscribers — the
//! WS layer, the explorer, tests. Three topic families: one per
//! transaction hash, one per account address (sender and target contract
//! both count), and a global firehose.
//!
//! Delivery contract:
//!
//! - Per-topic FIFO ordering.
//! - At-least-once for subscribers that keep up.
//! - Publishers never block. A slow subscriber gets consecutive identical
//!   status transitions for the same hash coalesced; if its buffer still
//!   overflows, the oldest event is dropped and counted, because the
//!   newest status is the one a catching-up subscriber actually needs.
//!
//! No acknowledgements. Subscribers that care about exactness re-read the
//! store, which is the source of truth anyway.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::primitives::clock::Millis;
use crate::primitives::ids::{Address, TxHash};
use crate::transaction::types::{RoundTag, TransactionStatus};

// ---------------------------------------------------------------------------
// Topics & events
// ---------------------------------------------------------------------------

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event on the bus.
    Global,
    /// Events for one transaction.
    Tx(TxHash),
    /// Events touching one account, as sender or as target contract.
    Account(Address),
}

/// A status transition, as published to subscribers.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatusEvent {
    pub hash: TxHash,
    pub sender: Address,
    pub contract: Option<Address>,
    pub status: TransactionStatus,
    pub round_index: u32,
    /// Terminal tag of the round, when the transition closed one.
    pub tag: Option<RoundTag>,
    pub at: Millis,
}

// ---------------------------------------------------------------------------
// Subscriber plumbing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SubscriberShared {
    queue: Mutex<VecDeque<StatusEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberShared {
    /// Enqueues an event, coalescing and shedding per the delivery
    /// contract. Never blocks.
    fn push(&self, event: StatusEvent) {
        let mut queue = self.queue.lock();

        // Coalesce consecutive identical transitions for the same hash:
        // keep the newer timestamp, drop the older duplicate.
        if let Some(back) = queue.back_mut() {
            if back.hash == event.hash && back.status == event.status {
                *back = event;
                drop(queue);
                self.notify.notify_one();
                return;
            }
        }

        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// A live subscription. Dropping it detaches from the bus.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    topic: Topic,
    shared: Arc<SubscriberShared>,
    bus: Arc<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Events shed from this subscription's buffer so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Takes the next event without waiting.
    pub fn try_recv(&self) -> Option<StatusEvent> {
        self.shared.queue.lock().pop_front()
    }

    /// Waits for the next event. Returns `None` once the subscription is
    /// closed and drained.
    pub async fn recv(&self) -> Option<StatusEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.detach(self.topic, self.id);
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BusInner {
    subscribers: DashMap<Topic, Vec<(Uuid, Arc<SubscriberShared>)>>,
    capacity: usize,
}

impl BusInner {
    fn detach(&self, topic: Topic, id: Uuid) {
        if let Some(mut list) = self.subscribers.get_mut(&topic) {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                let (_, shared) = list.remove(pos);
                shared.closed.store(true, Ordering::Release);
                shared.notify.notify_one();
            }
        }
    }
}

/// The bus itself. Cheap to clone; all clones share the subscriber table.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer depth before shedding.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Attaches a subscriber to a topic.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.inner.capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let id = Uuid::new_v4();
        self.inner
            .subscribers
            .entry(topic)
            .or_default()
            .push((id, Arc::clone(&shared)));
        Subscription {
            id,
            topic,
            shared,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Publishes a status event to every topic it touches.
    pub fn publish(&self, event: StatusEvent) {
        let mut topics = vec![Topic::Global, Topic::Tx(event.hash), Topic::Account(event.sender)];
        if let Some(contract) = event.contract {
            if contract != event.sender {
                topics.push(Topic::Account(contract));
            }
        }

        for topic in topics {
            if let Some(list) = self.inner.subscribers.get(&topic) {
                for (_, shared) in list.iter() {
                    shared.push(event.clone());
                }
            }
        }
    }

    /// Subscriber count across all topics. For metrics.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.iter().map(|e| e.value().len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(hash_byte: u8, status: TransactionStatus, at: Millis) -> StatusEvent {
        StatusEvent {
            hash: TxHash([hash_byte; 32]),
            sender: Address([1; 20]),
            contract: Some(Address([2; 20])),
            status,
            round_index: 0,
            tag: None,
            at,
        }
    }

    #[tokio::test]
    async fn global_subscriber_sees_everything_in_order() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe(Topic::Global);

        bus.publish(event(1, TransactionStatus::Pending, 10));
        bus.publish(event(2, TransactionStatus::Activated, 20));

        assert_eq!(sub.recv().await.unwrap().hash, TxHash([1; 32]));
        assert_eq!(sub.recv().await.unwrap().hash, TxHash([2; 32]));
    }

    #[tokio::test]
    async fn tx_topic_filters_other_hashes() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe(Topic::Tx(TxHash([1; 32])));

        bus.publish(event(2, TransactionStatus::Pending, 10));
        bus.publish(event(1, TransactionStatus::Pending, 20));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.hash, TxHash([1; 32]));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn account_topic_matches_sender_and_contract() {
        let bus = EventBus::new(16);
        let by_sender = bus.subscribe(Topic::Account(Address([1; 20])));
        let by_contract = bus.subscribe(Topic::Account(Address([2; 20])));

        bus.publish(event(1, TransactionStatus::Accepted, 10));

        assert!(by_sender.try_recv().is_some());
        assert!(by_contract.try_recv().is_some());
    }

    #[tokio::test]
    async fn consecutive_identical_transitions_coalesce() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe(Topic::Global);

        bus.publish(event(1, TransactionStatus::Proposing, 10));
        bus.publish(event(1, TransactionStatus::Proposing, 20));
        bus.publish(event(1, TransactionStatus::Committing, 30));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.status, TransactionStatus::Proposing);
        assert_eq!(first.at, 20, "coalescing keeps the newer event");
        assert_eq!(sub.recv().await.unwrap().status, TransactionStatus::Committing);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn overflow_sheds_oldest_and_counts() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe(Topic::Global);

        bus.publish(event(1, TransactionStatus::Pending, 1));
        bus.publish(event(2, TransactionStatus::Pending, 2));
        bus.publish(event(3, TransactionStatus::Pending, 3));

        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.recv().await.unwrap().hash, TxHash([2; 32]));
        assert_eq!(sub.recv().await.unwrap().hash, TxHash([3; 32]));
    }

    #[tokio::test]
    async fn dropped_subscription_detaches() {
        let bus = EventBus::new(16);
        {
            let _sub = bus.subscribe(Topic::Global);
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing into the void is fine.
        bus.publish(event(1, TransactionStatus::Pending, 1));
    }

    #[tokio::test]
    async fn recv_wakes_on_late_publish() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe(Topic::Global);

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                bus.publish(event(7, TransactionStatus::Finalized, 99));
            })
        };

        let got = sub.recv().await.unwrap();
        assert_eq!(got.status, TransactionStatus::Finalized);
        publisher.await.unwrap();
    }
}
