//! # Notification Bus
//!
//! The fan-in between the append path and live subscriptions. After a
//! commit, the writer publishes `(stream_uuid, events)` here; every
//! registration whose selector matches (the specific stream, or the
//! all-streams topic) receives a copy in its bounded queue.
//!
//! ## Ordering
//!
//! Publishes happen on the single writer thread, in commit order, and each
//! registration's queue is FIFO. A subscription therefore observes
//! notifications in commit order for its stream, and in global commit
//! order on the all-streams topic.
//!
//! ## Slow Subscribers
//!
//! Queues are bounded. A registration whose queue is full (or whose
//! receiver is gone) is evicted: its sender is dropped, the subscription
//! task observes the closed channel, and terminates with a buffer-overflow
//! error. The bus never blocks the writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{RecordedEvent, StreamSelector, StreamUuid};

/// Default queue capacity for one registration.
///
/// Deep enough to absorb a burst of appends while the subscription task is
/// persisting a cursor; the FSM's own pending buffer handles sustained
/// backpressure.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

type Registry = Arc<RwLock<HashMap<StreamSelector, Vec<BusEntry>>>>;

struct BusEntry {
    id: u64,
    tx: mpsc::Sender<Vec<RecordedEvent>>,
}

/// Topic-keyed publish/subscribe for committed events.
///
/// Cloning shares the registry: the writer thread holds one clone for
/// publishing, the subscribe path another for registering.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Registry,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for a selector.
    ///
    /// Returns the receiving end of the bounded queue and a registration
    /// handle that deregisters on drop.
    pub fn register(
        &self,
        selector: StreamSelector,
        capacity: usize,
    ) -> (BusRegistration, mpsc::Receiver<Vec<RecordedEvent>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity);

        self.registry
            .write()
            .entry(selector.clone())
            .or_default()
            .push(BusEntry { id, tx });

        let registration = BusRegistration {
            id,
            selector,
            registry: Arc::clone(&self.registry),
        };
        (registration, rx)
    }

    /// Publishes a committed batch to every matching registration.
    ///
    /// Called from the writer thread after commit, once per append, with
    /// the events in commit order.
    pub fn publish(&self, stream_uuid: &StreamUuid, events: &[RecordedEvent]) {
        if events.is_empty() {
            return;
        }
        self.publish_topic(&StreamSelector::Stream(stream_uuid.clone()), events);
        self.publish_topic(&StreamSelector::All, events);
    }

    fn publish_topic(&self, topic: &StreamSelector, events: &[RecordedEvent]) {
        let mut evicted = Vec::new();

        {
            let registry = self.registry.read();
            let Some(entries) = registry.get(topic) else {
                return;
            };
            for entry in entries {
                if entry.tx.try_send(events.to_vec()).is_err() {
                    evicted.push(entry.id);
                }
            }
        }

        if !evicted.is_empty() {
            let mut registry = self.registry.write();
            if let Some(entries) = registry.get_mut(topic) {
                entries.retain(|entry| {
                    let keep = !evicted.contains(&entry.id);
                    if !keep {
                        warn!(topic = %topic, id = entry.id, "evicting slow bus subscriber");
                    }
                    keep
                });
                if entries.is_empty() {
                    registry.remove(topic);
                }
            }
        }
    }

    /// Number of live registrations across all topics.
    pub fn registration_count(&self) -> usize {
        self.registry.read().values().map(Vec::len).sum()
    }
}

/// Keeps one bus registration alive; deregisters on drop.
pub struct BusRegistration {
    id: u64,
    selector: StreamSelector,
    registry: Registry,
}

impl Drop for BusRegistration {
    fn drop(&mut self) {
        let mut registry = self.registry.write();
        if let Some(entries) = registry.get_mut(&self.selector) {
            entries.retain(|entry| entry.id != self.id);
            if entries.is_empty() {
                registry.remove(&self.selector);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventNumber, StreamVersion};
    use uuid::Uuid;

    fn event(stream: &str, event_number: u64, stream_version: u64) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            event_number: EventNumber::from_raw(event_number),
            stream_uuid: StreamUuid::new(stream),
            stream_version: StreamVersion::from_raw(stream_version),
            event_type: "Example".to_string(),
            correlation_id: None,
            causation_id: None,
            data: Vec::new(),
            metadata: None,
            created_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_routes_by_stream_and_all() {
        let bus = EventBus::new();
        let (_reg_a, mut rx_a) = bus.register(StreamSelector::stream("a"), 8);
        let (_reg_all, mut rx_all) = bus.register(StreamSelector::All, 8);

        bus.publish(&StreamUuid::new("a"), &[event("a", 1, 1)]);
        bus.publish(&StreamUuid::new("b"), &[event("b", 2, 1)]);

        // Stream topic sees only its own events.
        let batch = rx_a.recv().await.unwrap();
        assert_eq!(batch[0].event_number.as_raw(), 1);
        assert!(rx_a.try_recv().is_err());

        // The all topic sees both, in commit order.
        assert_eq!(rx_all.recv().await.unwrap()[0].event_number.as_raw(), 1);
        assert_eq!(rx_all.recv().await.unwrap()[0].event_number.as_raw(), 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let bus = EventBus::new();
        let (_reg, mut rx) = bus.register(StreamSelector::stream("a"), 1);

        let stream = StreamUuid::new("a");
        bus.publish(&stream, &[event("a", 1, 1)]);
        // Queue full: this publish evicts the registration.
        bus.publish(&stream, &[event("a", 2, 2)]);

        assert_eq!(bus.registration_count(), 0);

        // The buffered batch is still readable, then the channel reports closed.
        assert_eq!(rx.recv().await.unwrap()[0].event_number.as_raw(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_registration_drop_deregisters() {
        let bus = EventBus::new();
        let (reg, _rx) = bus.register(StreamSelector::All, 8);
        assert_eq!(bus.registration_count(), 1);

        drop(reg);
        assert_eq!(bus.registration_count(), 0);
    }
}
