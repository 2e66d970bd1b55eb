//! # The EventStore Port
//!
//! The seam between the subscription engine and the storage backend. The
//! engine (the subscription task and the catch-up worker) only ever
//! talks to this trait, never to SQL, so the state machine can be driven
//! by the bundled SQLite backend, a test double, or a server-backed store
//! with the same semantics.
//!
//! [`TailStore`](crate::api::TailStore) is the bundled implementation.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::BusRegistration;
use crate::error::Result;
use crate::locks::AdvisoryLockGuard;
use crate::types::{
    AppendResult, EventData, EventNumber, ExpectedVersion, RecordedEvent, StreamSelector,
    StreamUuid, StreamVersion, SubscriptionRow,
};

/// Operations the subscription engine consumes.
///
/// Implementations must uphold the storage invariants: globally dense,
/// strictly increasing event numbers; dense per-stream versions; forward
/// reads ordered by the respective scalar with an exclusive `from` cursor;
/// bus publishes in commit order.
#[async_trait]
pub trait EventStore: Clone + Send + Sync + 'static {
    /// Creates an empty stream, returning its internal id. Fails with a
    /// conflict if the stream exists.
    async fn create_stream(&self, stream_uuid: &StreamUuid) -> Result<i64>;

    /// Appends events, assigning dense positions, and publishes them to
    /// the bus after commit.
    async fn append_to_stream(
        &self,
        stream_uuid: &StreamUuid,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<AppendResult>;

    /// Events of one stream with `stream_version > from_version`,
    /// ascending, at most `count`.
    async fn read_stream_forward(
        &self,
        stream_uuid: &StreamUuid,
        from_version: StreamVersion,
        count: usize,
    ) -> Result<Vec<RecordedEvent>>;

    /// Events across all streams with `event_number > from_event_number`,
    /// ascending, at most `count`.
    async fn read_all_forward(
        &self,
        from_event_number: EventNumber,
        count: usize,
    ) -> Result<Vec<RecordedEvent>>;

    /// Finds or creates the durable cursor row for `(stream_uuid, name)`.
    /// The start position applies only when the row is created.
    async fn locate_or_create_subscription(
        &self,
        stream_uuid: &str,
        name: &str,
        start_event_number: EventNumber,
        start_stream_version: StreamVersion,
    ) -> Result<SubscriptionRow>;

    /// Persists an acknowledged cursor pair.
    async fn update_subscription_cursor(
        &self,
        stream_uuid: &str,
        name: &str,
        event_number: EventNumber,
        stream_version: StreamVersion,
    ) -> Result<()>;

    /// Deletes a cursor row; missing rows are a no-op.
    async fn delete_subscription(&self, stream_uuid: &str, name: &str) -> Result<()>;

    /// Attempts the advisory lock for a subscription id. `None` means a
    /// concurrent consumer holds it; the guard releases on drop.
    fn try_advisory_lock(&self, subscription_id: i64) -> Option<AdvisoryLockGuard>;

    /// Registers for live notifications matching a selector. The
    /// registration deregisters on drop; a full queue gets evicted and the
    /// receiver observes the closed channel.
    fn subscribe_to_bus(
        &self,
        selector: &StreamSelector,
        capacity: usize,
    ) -> (BusRegistration, mpsc::Receiver<Vec<RecordedEvent>>);

    /// Forward read dispatched by selector kind, with a raw cursor value.
    ///
    /// The catch-up worker tracks one scalar whose meaning depends on the
    /// selector; this keeps that dispatch in one place.
    async fn read_forward(
        &self,
        selector: &StreamSelector,
        from_cursor: u64,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        match selector {
            StreamSelector::All => {
                self.read_all_forward(EventNumber::from_raw(from_cursor), count)
                    .await
            }
            StreamSelector::Stream(uuid) => {
                self.read_stream_forward(uuid, StreamVersion::from_raw(from_cursor), count)
                    .await
            }
        }
    }
}
