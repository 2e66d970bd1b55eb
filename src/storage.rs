//! # Synchronous Storage Layer
//!
//! The write path of TailStore. A single `Storage` instance wraps the sole
//! read-write connection and performs every mutation: appends, stream
//! creation, and subscription cursor updates.
//!
//! ## Design: Single-Writer Architecture
//!
//! All writes are funneled through one `Storage` owned by one thread. The
//! benefits:
//!
//! - Dense position assignment needs no locking: the next event number and
//!   the stream heads live in memory beside the connection
//! - Commit order equals publish order, which is what gives subscriptions
//!   their per-stream and global ordering guarantees
//! - SQLite performs best with a single writer
//!
//! ## Invariant: Memory Lags Disk
//!
//! The in-memory heads are updated only after a successful commit. After a
//! crash they are rebuilt from disk on open, so they may briefly lag the
//! database but can never lead it.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{
    AppendResult, EventData, EventNumber, ExpectedVersion, RecordedEvent, StreamUuid,
    StreamVersion, SubscriptionRow, ALL_STREAMS,
};

/// Returns the current time as Unix milliseconds.
pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Stream Heads
// =============================================================================

/// Cached head of one stream: its row id and latest version.
#[derive(Debug, Clone, Copy)]
struct StreamHead {
    stream_id: i64,
    version: StreamVersion,
}

// =============================================================================
// Storage
// =============================================================================

/// The single-writer storage engine.
///
/// Owns the read-write connection plus the in-memory positions needed to
/// assign dense event numbers and stream versions without querying on
/// every append.
#[derive(Debug)]
pub struct Storage {
    conn: Connection,

    /// The number the next committed event will receive.
    next_event_number: EventNumber,

    /// Head cache, keyed by stream uuid. Rebuilt from disk on open.
    stream_heads: HashMap<String, StreamHead>,
}

impl Storage {
    /// Creates a storage engine over an initialized connection, recovering
    /// in-memory state from disk.
    pub fn new(conn: Connection) -> Result<Self> {
        let mut storage = Self {
            conn,
            next_event_number: EventNumber::FIRST,
            stream_heads: HashMap::new(),
        };
        storage.recover()?;
        Ok(storage)
    }

    /// Rebuilds the next event number and stream heads from the database.
    fn recover(&mut self) -> Result<()> {
        let max_number: Option<i64> =
            self.conn
                .query_row("SELECT MAX(event_number) FROM events", [], |row| row.get(0))?;

        self.next_event_number = match max_number {
            Some(n) if n > 0 => EventNumber::from_raw(n as u64).next(),
            _ => EventNumber::FIRST,
        };

        let mut stmt = self
            .conn
            .prepare("SELECT stream_id, stream_uuid, stream_version FROM streams")?;
        let heads = stmt.query_map([], |row| {
            let stream_id: i64 = row.get(0)?;
            let stream_uuid: String = row.get(1)?;
            let version: i64 = row.get(2)?;
            Ok((stream_uuid, stream_id, version))
        })?;

        self.stream_heads.clear();
        for head in heads {
            let (stream_uuid, stream_id, version) = head?;
            self.stream_heads.insert(
                stream_uuid,
                StreamHead {
                    stream_id,
                    version: StreamVersion::from_raw(version as u64),
                },
            );
        }
        drop(stmt);

        debug!(
            streams = self.stream_heads.len(),
            next_event_number = self.next_event_number.as_raw(),
            "storage recovered"
        );
        Ok(())
    }

    /// The number the next committed event will receive (for tests).
    pub fn next_event_number(&self) -> EventNumber {
        self.next_event_number
    }

    /// The current version of a stream; the zero sentinel if it has none.
    pub fn stream_version(&self, stream_uuid: &StreamUuid) -> StreamVersion {
        self.stream_heads
            .get(stream_uuid.as_str())
            .map(|h| h.version)
            .unwrap_or(StreamVersion::NONE)
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Creates an empty stream, returning its internal id.
    ///
    /// # Errors
    ///
    /// `Error::Conflict` if the stream already exists. Appends with
    /// [`ExpectedVersion::Any`] create streams implicitly, so explicit
    /// creation is only for callers asserting first use.
    pub fn create_stream(&mut self, stream_uuid: &StreamUuid) -> Result<i64> {
        if stream_uuid.is_all() {
            return Err(Error::Schema(format!(
                "'{ALL_STREAMS}' is reserved and cannot be a stream identity"
            )));
        }
        if let Some(head) = self.stream_heads.get(stream_uuid.as_str()) {
            return Err(Error::Conflict {
                stream_uuid: stream_uuid.to_string(),
                expected: StreamVersion::NONE.as_raw(),
                actual: head.version.as_raw(),
            });
        }

        let stream_id = self.insert_stream(stream_uuid)?;
        self.stream_heads.insert(
            stream_uuid.as_str().to_string(),
            StreamHead {
                stream_id,
                version: StreamVersion::NONE,
            },
        );
        Ok(stream_id)
    }

    fn insert_stream(&self, stream_uuid: &StreamUuid) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO streams (stream_uuid, stream_version, created_ms) VALUES (?, 0, ?)",
            params![stream_uuid.as_str(), current_time_ms() as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Appends events to a stream, returning the assigned positions and
    /// the recorded events for bus publication.
    ///
    /// # Conflict Detection
    ///
    /// `expected` is checked against the cached head before anything is
    /// written. A mismatch returns `Error::Conflict` and writes nothing.
    ///
    /// # Atomicity
    ///
    /// The event inserts and the head update run in one transaction; the
    /// in-memory positions advance only after commit.
    pub fn append_to_stream(
        &mut self,
        stream_uuid: &StreamUuid,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<(AppendResult, Vec<RecordedEvent>)> {
        if stream_uuid.is_all() {
            return Err(Error::Schema(format!(
                "cannot append to the reserved '{ALL_STREAMS}' selector"
            )));
        }
        if events.is_empty() {
            return Err(Error::Schema("append requires at least one event".to_string()));
        }

        let current = self.stream_version(stream_uuid);
        match expected {
            ExpectedVersion::Any => {}
            ExpectedVersion::NoStream if current.is_none() => {}
            ExpectedVersion::Exact(v) if v == current => {}
            ExpectedVersion::NoStream | ExpectedVersion::Exact(_) => {
                let expected_raw = match expected {
                    ExpectedVersion::Exact(v) => v.as_raw(),
                    _ => StreamVersion::NONE.as_raw(),
                };
                return Err(Error::Conflict {
                    stream_uuid: stream_uuid.to_string(),
                    expected: expected_raw,
                    actual: current.as_raw(),
                });
            }
        }

        // Resolve or create the stream row before the event transaction;
        // a stream row with no events is harmless if the insert fails.
        let stream_id = match self.stream_heads.get(stream_uuid.as_str()) {
            Some(head) => head.stream_id,
            None => {
                let id = self.insert_stream(stream_uuid)?;
                self.stream_heads.insert(
                    stream_uuid.as_str().to_string(),
                    StreamHead {
                        stream_id: id,
                        version: StreamVersion::NONE,
                    },
                );
                id
            }
        };

        let event_count = events.len() as u64;
        let first_event_number = self.next_event_number;
        let last_event_number = first_event_number.add(event_count - 1);
        let first_version = current.next();
        let last_version = first_version.add(event_count - 1);
        let now_ms = current_time_ms();

        // Materialize the recorded form up front; it is both what gets
        // inserted and what the bus publishes after commit.
        let mut recorded = Vec::with_capacity(events.len());
        {
            let mut event_number = first_event_number;
            let mut version = first_version;
            for event in events {
                recorded.push(RecordedEvent {
                    event_id: Uuid::new_v4(),
                    event_number,
                    stream_uuid: stream_uuid.clone(),
                    stream_version: version,
                    event_type: event.event_type,
                    correlation_id: event.correlation_id,
                    causation_id: event.causation_id,
                    data: event.data,
                    metadata: event.metadata,
                    created_at_ms: now_ms,
                });
                event_number = event_number.next();
                version = version.next();
            }
        }

        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO events (event_number, event_id, stream_id, stream_version,
                                     event_type, correlation_id, causation_id, data, metadata,
                                     created_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for event in &recorded {
                insert.execute(params![
                    event.event_number.as_raw() as i64,
                    event.event_id.to_string(),
                    stream_id,
                    event.stream_version.as_raw() as i64,
                    event.event_type,
                    event.correlation_id.map(|id| id.to_string()),
                    event.causation_id.map(|id| id.to_string()),
                    event.data,
                    event.metadata,
                    event.created_at_ms as i64,
                ])?;
            }
        }
        tx.execute(
            "UPDATE streams SET stream_version = ? WHERE stream_id = ?",
            params![last_version.as_raw() as i64, stream_id],
        )?;
        tx.commit()?;

        // Committed: now the in-memory positions may advance.
        self.next_event_number = last_event_number.next();
        self.stream_heads.insert(
            stream_uuid.as_str().to_string(),
            StreamHead {
                stream_id,
                version: last_version,
            },
        );

        let result = AppendResult {
            first_event_number,
            last_event_number,
            first_version,
            last_version,
        };
        Ok((result, recorded))
    }

    // =========================================================================
    // Subscription Cursors
    // =========================================================================

    /// Finds the cursor row for `(stream_uuid, name)`, creating it at the
    /// given start position if absent.
    ///
    /// An existing row is returned unchanged: the starting position only
    /// matters on first subscribe. A new row defaults to `(0, 0)`, before
    /// the first event.
    pub fn locate_or_create_subscription(
        &mut self,
        stream_uuid: &str,
        name: &str,
        start_event_number: EventNumber,
        start_stream_version: StreamVersion,
    ) -> Result<SubscriptionRow> {
        if let Some(row) = self.find_subscription(stream_uuid, name)? {
            return Ok(row);
        }

        let now_ms = current_time_ms();
        self.conn.execute(
            "INSERT INTO subscriptions (stream_uuid, subscription_name,
                                        last_seen_event_number, last_seen_stream_version,
                                        created_ms)
             VALUES (?, ?, ?, ?, ?)",
            params![
                stream_uuid,
                name,
                start_event_number.as_raw() as i64,
                start_stream_version.as_raw() as i64,
                now_ms as i64,
            ],
        )?;

        Ok(SubscriptionRow {
            subscription_id: self.conn.last_insert_rowid(),
            stream_uuid: stream_uuid.to_string(),
            subscription_name: name.to_string(),
            last_seen_event_number: start_event_number,
            last_seen_stream_version: start_stream_version,
            created_at_ms: now_ms,
        })
    }

    fn find_subscription(&self, stream_uuid: &str, name: &str) -> Result<Option<SubscriptionRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT subscription_id, stream_uuid, subscription_name,
                        last_seen_event_number, last_seen_stream_version, created_ms
                 FROM subscriptions
                 WHERE stream_uuid = ? AND subscription_name = ?",
                params![stream_uuid, name],
                |row| {
                    Ok(SubscriptionRow {
                        subscription_id: row.get(0)?,
                        stream_uuid: row.get(1)?,
                        subscription_name: row.get(2)?,
                        last_seen_event_number: EventNumber::from_raw(row.get::<_, i64>(3)? as u64),
                        last_seen_stream_version: StreamVersion::from_raw(
                            row.get::<_, i64>(4)? as u64
                        ),
                        created_at_ms: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Persists an acknowledged cursor pair.
    ///
    /// Called on every ack; the advisory lock guarantees a single writer
    /// per row, and acks only move forward, so this is a plain update.
    pub fn update_subscription_cursor(
        &mut self,
        stream_uuid: &str,
        name: &str,
        event_number: EventNumber,
        stream_version: StreamVersion,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE subscriptions
             SET last_seen_event_number = ?, last_seen_stream_version = ?
             WHERE stream_uuid = ? AND subscription_name = ?",
            params![
                event_number.as_raw() as i64,
                stream_version.as_raw() as i64,
                stream_uuid,
                name,
            ],
        )?;
        Ok(())
    }

    /// Deletes a cursor row. Deleting a missing row is a no-op.
    pub fn delete_subscription(&mut self, stream_uuid: &str, name: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM subscriptions WHERE stream_uuid = ? AND subscription_name = ?",
            params![stream_uuid, name],
        )?;
        Ok(())
    }

    /// Borrows the underlying connection (for reads in single-connection
    /// deployments).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn storage() -> Storage {
        let db = Database::open_in_memory().unwrap();
        Storage::new(db.into_connection()).unwrap()
    }

    fn events(n: usize) -> Vec<EventData> {
        (0..n)
            .map(|i| EventData::new("Example", format!("payload-{i}").into_bytes()))
            .collect()
    }

    #[test]
    fn test_append_assigns_dense_positions() {
        let mut storage = storage();
        let stream = StreamUuid::new("account-1");

        let (first, recorded) = storage
            .append_to_stream(&stream, ExpectedVersion::NoStream, events(3))
            .unwrap();
        assert_eq!(first.first_event_number, EventNumber::from_raw(1));
        assert_eq!(first.last_event_number, EventNumber::from_raw(3));
        assert_eq!(first.first_version, StreamVersion::from_raw(1));
        assert_eq!(first.last_version, StreamVersion::from_raw(3));

        // The recorded form mirrors the assigned positions.
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[0].event_number, EventNumber::from_raw(1));
        assert_eq!(recorded[2].stream_version, StreamVersion::from_raw(3));
        assert_eq!(recorded[1].data, b"payload-1");

        let (second, _) = storage
            .append_to_stream(&stream, ExpectedVersion::Exact(StreamVersion::from_raw(3)), events(2))
            .unwrap();
        assert_eq!(second.first_event_number, EventNumber::from_raw(4));
        assert_eq!(second.first_version, StreamVersion::from_raw(4));
        assert_eq!(second.last_version, StreamVersion::from_raw(5));
    }

    #[test]
    fn test_event_numbers_interleave_across_streams() {
        let mut storage = storage();

        storage
            .append_to_stream(&StreamUuid::new("a"), ExpectedVersion::Any, events(2))
            .unwrap();
        let (result, _) = storage
            .append_to_stream(&StreamUuid::new("b"), ExpectedVersion::Any, events(1))
            .unwrap();

        // Global numbering continues across streams; per-stream versions restart.
        assert_eq!(result.first_event_number, EventNumber::from_raw(3));
        assert_eq!(result.first_version, StreamVersion::from_raw(1));
    }

    #[test]
    fn test_append_conflict_on_wrong_expectation() {
        let mut storage = storage();
        let stream = StreamUuid::new("account-1");

        storage
            .append_to_stream(&stream, ExpectedVersion::NoStream, events(1))
            .unwrap();

        let conflict = storage
            .append_to_stream(&stream, ExpectedVersion::NoStream, events(1))
            .unwrap_err();
        assert!(matches!(conflict, Error::Conflict { actual: 1, .. }));

        let conflict = storage
            .append_to_stream(
                &stream,
                ExpectedVersion::Exact(StreamVersion::from_raw(5)),
                events(1),
            )
            .unwrap_err();
        assert!(matches!(conflict, Error::Conflict { expected: 5, actual: 1, .. }));
    }

    #[test]
    fn test_append_rejects_all_streams_sentinel() {
        let mut storage = storage();
        let result =
            storage.append_to_stream(&StreamUuid::new(ALL_STREAMS), ExpectedVersion::Any, events(1));
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_create_stream_conflicts_on_duplicate() {
        let mut storage = storage();
        let stream = StreamUuid::new("account-1");

        storage.create_stream(&stream).unwrap();
        assert!(matches!(
            storage.create_stream(&stream),
            Err(Error::Conflict { .. })
        ));
    }

    #[test]
    fn test_locate_or_create_ignores_start_for_existing_row() {
        let mut storage = storage();

        let created = storage
            .locate_or_create_subscription("$all", "projector", EventNumber::NONE, StreamVersion::NONE)
            .unwrap();
        assert_eq!(created.last_seen_event_number, EventNumber::NONE);

        storage
            .update_subscription_cursor("$all", "projector", EventNumber::from_raw(7), StreamVersion::NONE)
            .unwrap();

        // A second locate with a different start must return the stored cursor.
        let located = storage
            .locate_or_create_subscription(
                "$all",
                "projector",
                EventNumber::from_raw(100),
                StreamVersion::NONE,
            )
            .unwrap();
        assert_eq!(located.subscription_id, created.subscription_id);
        assert_eq!(located.last_seen_event_number, EventNumber::from_raw(7));
    }

    #[test]
    fn test_delete_subscription_removes_row() {
        let mut storage = storage();

        storage
            .locate_or_create_subscription("account-1", "worker", EventNumber::NONE, StreamVersion::NONE)
            .unwrap();
        storage.delete_subscription("account-1", "worker").unwrap();

        // Recreation starts over at the requested position.
        let row = storage
            .locate_or_create_subscription(
                "account-1",
                "worker",
                EventNumber::NONE,
                StreamVersion::from_raw(2),
            )
            .unwrap();
        assert_eq!(row.last_seen_stream_version, StreamVersion::from_raw(2));
    }

    #[test]
    fn test_recovery_rebuilds_positions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("recover.db");

        {
            let db = Database::open(&path).unwrap();
            let mut storage = Storage::new(db.into_connection()).unwrap();
            storage
                .append_to_stream(&StreamUuid::new("a"), ExpectedVersion::Any, events(3))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let storage = Storage::new(db.into_connection()).unwrap();
        assert_eq!(storage.next_event_number(), EventNumber::from_raw(4));
        assert_eq!(
            storage.stream_version(&StreamUuid::new("a")),
            StreamVersion::from_raw(3)
        );
    }
}
