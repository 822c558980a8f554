//! Typed in-process event bus
//!
//! Multi-producer, multi-subscriber. Every subscriber owns an independent
//! bounded queue; publish never blocks the producer: when a queue is full
//! the oldest entry is dropped and counted. Delivery order per subscriber
//! equals publish order per topic; nothing is guaranteed across topics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

use hawk_monitor::{ProtocolFamily, Reading, RuntimeStatus};
use hawk_transport::{ConnectionState, DeviceAddress};

use crate::registry::VehicleSummary;

/// Default per-subscriber queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Topics subscribers can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A scan saw a device
    DeviceDiscovered,
    /// A session produced a validated reading
    DeviceReading,
    /// A device's runtime status changed
    DeviceStatus,
    /// A device's connection state changed
    DeviceConnection,
    /// A device was associated with a vehicle
    VehicleAssociated,
    /// A vehicle summary was recomputed
    VehicleSummary,
    /// A poll cycle was skipped or cancelled
    Poll,
    /// The daemon is going down; final event on the bus
    SystemShutdown,
}

/// Events carried on the bus
#[derive(Debug, Clone)]
pub enum BusEvent {
    DeviceDiscovered {
        address: DeviceAddress,
        local_name: Option<String>,
        family: ProtocolFamily,
    },
    DeviceReading {
        address: DeviceAddress,
        reading: Reading,
        vehicle_id: Option<String>,
        family: ProtocolFamily,
    },
    DeviceStatus {
        address: DeviceAddress,
        status: RuntimeStatus,
    },
    DeviceConnection {
        address: DeviceAddress,
        old: ConnectionState,
        new: ConnectionState,
    },
    VehicleAssociated {
        vehicle_id: String,
        address: DeviceAddress,
    },
    VehicleSummary {
        vehicle_id: String,
        summary: VehicleSummary,
    },
    PollSkipped {
        address: DeviceAddress,
    },
    PollCancelled {
        address: DeviceAddress,
    },
    SystemShutdown,
}

impl BusEvent {
    /// The topic an event is published on
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::DeviceDiscovered { .. } => Topic::DeviceDiscovered,
            BusEvent::DeviceReading { .. } => Topic::DeviceReading,
            BusEvent::DeviceStatus { .. } => Topic::DeviceStatus,
            BusEvent::DeviceConnection { .. } => Topic::DeviceConnection,
            BusEvent::VehicleAssociated { .. } => Topic::VehicleAssociated,
            BusEvent::VehicleSummary { .. } => Topic::VehicleSummary,
            BusEvent::PollSkipped { .. } | BusEvent::PollCancelled { .. } => Topic::Poll,
            BusEvent::SystemShutdown => Topic::SystemShutdown,
        }
    }
}

struct SubQueue {
    id: u64,
    capacity: usize,
    queue: Mutex<VecDeque<BusEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubQueue {
    fn push(&self, event: BusEvent) -> bool {
        let mut queue = self.queue.lock();
        let mut overflowed = false;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::SeqCst);
            overflowed = true;
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
        overflowed
    }

    fn pop(&self) -> Option<BusEvent> {
        self.queue.lock().pop_front()
    }
}

struct BusShared {
    subscribers: Mutex<HashMap<Topic, Vec<Arc<SubQueue>>>>,
    next_id: AtomicU64,
    overflow_total: AtomicU64,
    closed: AtomicBool,
}

/// Handle to the bus; cheap to clone
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
    default_capacity: usize,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            shared: Arc::new(BusShared {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                overflow_total: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            default_capacity,
        }
    }

    /// Register a subscriber with the default queue capacity
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.subscribe_with_capacity(topic, self.default_capacity)
    }

    pub fn subscribe_with_capacity(&self, topic: Topic, capacity: usize) -> Subscription {
        let queue = Arc::new(SubQueue {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(self.shared.closed.load(Ordering::SeqCst)),
        });
        self.shared
            .subscribers
            .lock()
            .entry(topic)
            .or_default()
            .push(Arc::clone(&queue));
        Subscription {
            topic,
            queue,
            bus: Arc::downgrade(&self.shared),
        }
    }

    /// Publish an event to every subscriber of its topic.
    ///
    /// Never blocks; full queues drop their oldest entry. Publishing on a
    /// closed bus is a silent no-op.
    pub fn publish(&self, event: BusEvent) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let topic = event.topic();
        let queues: Vec<Arc<SubQueue>> = self
            .shared
            .subscribers
            .lock()
            .get(&topic)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for queue in queues {
            if queue.push(event.clone()) {
                self.shared.overflow_total.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Total events dropped to overflow across all subscribers
    pub fn overflow_total(&self) -> u64 {
        self.shared.overflow_total.load(Ordering::SeqCst)
    }

    /// Number of live subscribers across all topics
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().values().map(Vec::len).sum()
    }

    /// Stop accepting publishes and wake every subscriber for drain-out.
    ///
    /// Subscribers read queued events to the end, then observe `None`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for queues in self.shared.subscribers.lock().values() {
            for queue in queues {
                queue.closed.store(true, Ordering::SeqCst);
                queue.notify.notify_one();
            }
        }
    }
}

/// One subscriber's end of the bus
pub struct Subscription {
    topic: Topic,
    queue: Arc<SubQueue>,
    bus: Weak<BusShared>,
}

impl Subscription {
    /// Next event in publish order; `None` once the bus is closed and the
    /// queue is drained
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking read
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.queue.pop()
    }

    /// Events this subscriber lost to overflow
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::SeqCst)
    }

    /// Detach from the bus. Idempotent; dropping the subscription does the
    /// same thing.
    pub fn unsubscribe(&self) {
        let Some(shared) = self.bus.upgrade() else {
            return;
        };
        if let Some(queues) = shared.subscribers.lock().get_mut(&self.topic) {
            queues.retain(|q| q.id != self.queue.id);
        }
        self.queue.closed.store(true, Ordering::SeqCst);
        self.queue.notify.notify_one();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> DeviceAddress {
        format!("AA:BB:CC:DD:EE:{last:02X}").parse().unwrap()
    }

    fn poll_skipped(last: u8) -> BusEvent {
        BusEvent::PollSkipped { address: addr(last) }
    }

    #[tokio::test]
    async fn per_subscriber_delivery_matches_publish_order() {
        let bus = EventBus::new(DEFAULT_QUEUE_CAPACITY);
        let mut first = bus.subscribe(Topic::Poll);
        let mut second = bus.subscribe(Topic::Poll);

        for i in 0..20 {
            bus.publish(poll_skipped(i));
        }
        for sub in [&mut first, &mut second] {
            for i in 0..20 {
                let Some(BusEvent::PollSkipped { address }) = sub.recv().await else {
                    panic!("expected a poll event");
                };
                assert_eq!(address, addr(i));
            }
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(Topic::Poll);

        for i in 0..6 {
            bus.publish(poll_skipped(i));
        }
        // The two oldest events were dropped
        let Some(BusEvent::PollSkipped { address }) = sub.recv().await else {
            panic!("expected a poll event");
        };
        assert_eq!(address, addr(2));
        assert_eq!(sub.dropped(), 2);
        assert_eq!(bus.overflow_total(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe(Topic::Poll);
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing to a topic with no subscribers is fine
        bus.publish(poll_skipped(1));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(Topic::Poll);
        bus.publish(poll_skipped(1));
        bus.close();
        // Publishes after close are dropped
        bus.publish(poll_skipped(2));

        assert!(matches!(
            sub.recv().await,
            Some(BusEvent::PollSkipped { .. })
        ));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::new(2);
        let mut fast = bus.subscribe(Topic::Poll);
        let _slow = bus.subscribe_with_capacity(Topic::Poll, 1);

        // Far more events than the slow queue holds; publish stays sync
        for i in 0..50 {
            bus.publish(poll_skipped(i % 10));
        }
        assert!(fast.recv().await.is_some());
    }
}
