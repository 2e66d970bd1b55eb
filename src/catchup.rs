//! # Catch-Up Worker
//!
//! Drives the historical-replay phase of a subscription: read a bounded
//! batch from the event source, hand it to the subscription task, wait for
//! the acknowledgement watermark to reach the batch's tail, repeat. An
//! empty read means the live tail was reached, reported as `CaughtUp` with
//! the final cursor.
//!
//! The worker is strictly sequential per subscription: batch N+1 is never
//! read before batch N is fully acknowledged. That is what bounds
//! in-flight events during replay and guarantees historical events precede
//! any live event past the boundary.
//!
//! Because the watermark only reaches a batch's tail after that batch's
//! ack, the `CaughtUp` report (sent after one further, empty read) can
//! never overtake an unacknowledged delivery.

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::store::EventStore;
use crate::subscription::SubscriptionMessage;
use crate::types::StreamSelector;

/// Replays history from `from` until the tail is reached.
///
/// Runs as its own task; the subscription task aborts it on unsubscribe.
/// All exits are silent besides the messages sent into the inbox: a closed
/// inbox or a dropped watermark sender means the subscription is gone.
pub(crate) async fn run_catch_up<S: EventStore>(
    store: S,
    selector: StreamSelector,
    mut from: u64,
    batch_size: usize,
    inbox: mpsc::Sender<SubscriptionMessage>,
    mut acks: watch::Receiver<u64>,
) {
    debug!(selector = %selector, from, batch_size, "catch-up started");

    loop {
        let events = match store.read_forward(&selector, from, batch_size).await {
            Ok(events) => events,
            Err(err) => {
                let _ = inbox.send(SubscriptionMessage::CatchUpFailed(err)).await;
                return;
            }
        };

        let target = match events.last() {
            Some(last) => selector.cursor_of(last),
            None => {
                debug!(selector = %selector, cursor = from, "catch-up complete");
                let _ = inbox.send(SubscriptionMessage::CaughtUp(from)).await;
                return;
            }
        };

        if inbox
            .send(SubscriptionMessage::CatchUpBatch(events))
            .await
            .is_err()
        {
            return;
        }

        // One batch in flight: wait for its tail to be acknowledged.
        while *acks.borrow_and_update() < target {
            if acks.changed().await.is_err() {
                return;
            }
        }

        from = target;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use uuid::Uuid;

    use crate::bus::{BusRegistration, EventBus};
    use crate::error::Result;
    use crate::locks::{AdvisoryLockGuard, AdvisoryLocks};
    use crate::types::{
        AppendResult, EventData, EventNumber, ExpectedVersion, RecordedEvent, StreamUuid,
        StreamVersion, SubscriptionRow,
    };

    /// An in-memory event source: enough of the port to drive the worker.
    #[derive(Clone)]
    struct MemoryStore {
        events: Arc<Vec<RecordedEvent>>,
        bus: EventBus,
        locks: AdvisoryLocks,
    }

    impl MemoryStore {
        fn with_events(count: u64) -> Self {
            let events = (1..=count)
                .map(|i| RecordedEvent {
                    event_id: Uuid::new_v4(),
                    event_number: EventNumber::from_raw(i),
                    stream_uuid: StreamUuid::new("s"),
                    stream_version: StreamVersion::from_raw(i),
                    event_type: "Example".to_string(),
                    correlation_id: None,
                    causation_id: None,
                    data: Vec::new(),
                    metadata: None,
                    created_at_ms: 0,
                })
                .collect();
            Self {
                events: Arc::new(events),
                bus: EventBus::new(),
                locks: AdvisoryLocks::new(),
            }
        }
    }

    #[async_trait]
    impl EventStore for MemoryStore {
        async fn create_stream(&self, _stream_uuid: &StreamUuid) -> Result<i64> {
            Ok(1)
        }

        async fn append_to_stream(
            &self,
            _stream_uuid: &StreamUuid,
            _expected: ExpectedVersion,
            _events: Vec<EventData>,
        ) -> Result<AppendResult> {
            unreachable!("worker never appends")
        }

        async fn read_stream_forward(
            &self,
            stream_uuid: &StreamUuid,
            from_version: StreamVersion,
            count: usize,
        ) -> Result<Vec<RecordedEvent>> {
            Ok(self
                .events
                .iter()
                .filter(|e| &e.stream_uuid == stream_uuid && e.stream_version > from_version)
                .take(count)
                .cloned()
                .collect())
        }

        async fn read_all_forward(
            &self,
            from_event_number: EventNumber,
            count: usize,
        ) -> Result<Vec<RecordedEvent>> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.event_number > from_event_number)
                .take(count)
                .cloned()
                .collect())
        }

        async fn locate_or_create_subscription(
            &self,
            stream_uuid: &str,
            name: &str,
            start_event_number: EventNumber,
            start_stream_version: StreamVersion,
        ) -> Result<SubscriptionRow> {
            Ok(SubscriptionRow {
                subscription_id: 1,
                stream_uuid: stream_uuid.to_string(),
                subscription_name: name.to_string(),
                last_seen_event_number: start_event_number,
                last_seen_stream_version: start_stream_version,
                created_at_ms: 0,
            })
        }

        async fn update_subscription_cursor(
            &self,
            _stream_uuid: &str,
            _name: &str,
            _event_number: EventNumber,
            _stream_version: StreamVersion,
        ) -> Result<()> {
            Ok(())
        }

        async fn delete_subscription(&self, _stream_uuid: &str, _name: &str) -> Result<()> {
            Ok(())
        }

        fn try_advisory_lock(&self, subscription_id: i64) -> Option<AdvisoryLockGuard> {
            self.locks.try_acquire(subscription_id)
        }

        fn subscribe_to_bus(
            &self,
            selector: &StreamSelector,
            capacity: usize,
        ) -> (BusRegistration, mpsc::Receiver<Vec<RecordedEvent>>) {
            self.bus.register(selector.clone(), capacity)
        }
    }

    fn batch_versions(message: SubscriptionMessage) -> Vec<u64> {
        match message {
            SubscriptionMessage::CatchUpBatch(events) => {
                events.iter().map(|e| e.stream_version.as_raw()).collect()
            }
            other => panic!("expected a batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_source_reports_caught_up() {
        let store = MemoryStore::with_events(0);
        let (tx, mut rx) = mpsc::channel(8);
        let (_ack_tx, ack_rx) = watch::channel(0);

        run_catch_up(store, StreamSelector::stream("s"), 0, 100, tx, ack_rx).await;

        assert!(matches!(rx.recv().await, Some(SubscriptionMessage::CaughtUp(0))));
    }

    #[tokio::test]
    async fn test_batches_are_gated_on_acks() {
        let store = MemoryStore::with_events(5);
        let (tx, mut rx) = mpsc::channel(8);
        let (ack_tx, ack_rx) = watch::channel(0u64);

        let worker = tokio::spawn(run_catch_up(
            store,
            StreamSelector::stream("s"),
            0,
            2,
            tx,
            ack_rx,
        ));

        // First batch arrives unprompted.
        assert_eq!(batch_versions(rx.recv().await.unwrap()), vec![1, 2]);

        // No second batch until the first is fully acknowledged.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        // A partial ack is not enough.
        ack_tx.send_replace(1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        ack_tx.send_replace(2);
        assert_eq!(batch_versions(rx.recv().await.unwrap()), vec![3, 4]);

        ack_tx.send_replace(4);
        assert_eq!(batch_versions(rx.recv().await.unwrap()), vec![5]);

        // Final batch acked: one more (empty) read completes the replay.
        ack_tx.send_replace(5);
        assert!(matches!(rx.recv().await, Some(SubscriptionMessage::CaughtUp(5))));

        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_resumes_from_cursor() {
        let store = MemoryStore::with_events(4);
        let (tx, mut rx) = mpsc::channel(8);
        let (ack_tx, ack_rx) = watch::channel(2u64);

        let worker = tokio::spawn(run_catch_up(
            store,
            StreamSelector::stream("s"),
            2,
            100,
            tx,
            ack_rx,
        ));

        // Only events past the cursor are replayed.
        assert_eq!(batch_versions(rx.recv().await.unwrap()), vec![3, 4]);
        ack_tx.send_replace(4);
        assert!(matches!(rx.recv().await, Some(SubscriptionMessage::CaughtUp(4))));

        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_worker() {
        let store = MemoryStore::with_events(10);
        let (tx, mut rx) = mpsc::channel(8);
        let (ack_tx, ack_rx) = watch::channel(0u64);

        let worker = tokio::spawn(run_catch_up(
            store,
            StreamSelector::All,
            0,
            2,
            tx,
            ack_rx,
        ));

        let _ = rx.recv().await.unwrap();
        // Subscription gone: inbox closed, watermark sender dropped.
        drop(rx);
        drop(ack_tx);

        worker.await.unwrap();
    }
}
