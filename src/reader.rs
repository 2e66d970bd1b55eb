//! # Event Reader
//!
//! Forward-only read operations over the event log, as direct SQL queries
//! against any connection: the writer's own connection in
//! single-connection deployments, or a read-only WAL connection in the
//! reader pool.
//!
//! ## Cursor Semantics
//!
//! Both readers take an *exclusive* `from` cursor: they return events whose
//! position is strictly greater than it. The zero sentinel therefore reads
//! from the very beginning, and a subscription can pass its cursor straight
//! through without off-by-one adjustment. Returning fewer than `count`
//! events means the tail has been reached.

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{EventNumber, RecordedEvent, StreamUuid, StreamVersion};

const SELECT_COLUMNS: &str = "e.event_number, e.event_id, s.stream_uuid, e.stream_version,
        e.event_type, e.correlation_id, e.causation_id, e.data, e.metadata, e.created_ms";

/// Reads a bounded batch of one stream's events, ascending by version.
///
/// Returns events with `stream_version > from_version`. An unknown stream
/// yields an empty batch.
pub fn read_stream_forward(
    conn: &Connection,
    stream_uuid: &StreamUuid,
    from_version: StreamVersion,
    count: usize,
) -> Result<Vec<RecordedEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS}
         FROM events e
         JOIN streams s ON e.stream_id = s.stream_id
         WHERE s.stream_uuid = ? AND e.stream_version > ?
         ORDER BY e.stream_version
         LIMIT ?"
    ))?;

    let rows = stmt.query_map(
        params![stream_uuid.as_str(), from_version.as_raw() as i64, count as i64],
        row_to_event,
    )?;

    collect_events(rows)
}

/// Reads a bounded batch across all streams, ascending by event number.
///
/// Returns events with `event_number > from_event_number`.
pub fn read_all_forward(
    conn: &Connection,
    from_event_number: EventNumber,
    count: usize,
) -> Result<Vec<RecordedEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS}
         FROM events e
         JOIN streams s ON e.stream_id = s.stream_id
         WHERE e.event_number > ?
         ORDER BY e.event_number
         LIMIT ?"
    ))?;

    let rows = stmt.query_map(
        params![from_event_number.as_raw() as i64, count as i64],
        row_to_event,
    )?;

    collect_events(rows)
}

/// The highest committed event number; the zero sentinel for an empty log.
pub fn last_event_number(conn: &Connection) -> Result<EventNumber> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(event_number) FROM events", [], |row| row.get(0))?;
    Ok(match max {
        Some(n) if n > 0 => EventNumber::from_raw(n as u64),
        _ => EventNumber::NONE,
    })
}

/// The current version of a stream; the zero sentinel if absent or empty.
pub fn stream_version(conn: &Connection, stream_uuid: &StreamUuid) -> Result<StreamVersion> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT stream_version FROM streams WHERE stream_uuid = ?",
            [stream_uuid.as_str()],
            |row| row.get(0),
        )
        .ok();
    Ok(match version {
        Some(v) if v > 0 => StreamVersion::from_raw(v as u64),
        _ => StreamVersion::NONE,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordedEvent> {
    let event_number: i64 = row.get(0)?;
    let event_id: String = row.get(1)?;
    let stream_uuid: String = row.get(2)?;
    let stream_version: i64 = row.get(3)?;
    let event_type: String = row.get(4)?;
    let correlation_id: Option<String> = row.get(5)?;
    let causation_id: Option<String> = row.get(6)?;
    let data: Vec<u8> = row.get(7)?;
    let metadata: Option<Vec<u8>> = row.get(8)?;
    let created_ms: i64 = row.get(9)?;

    Ok(RecordedEvent {
        event_id: Uuid::parse_str(&event_id).unwrap_or_default(),
        event_number: EventNumber::from_raw(event_number as u64),
        stream_uuid: StreamUuid::new(stream_uuid),
        stream_version: StreamVersion::from_raw(stream_version as u64),
        event_type,
        correlation_id: correlation_id.and_then(|id| Uuid::parse_str(&id).ok()),
        causation_id: causation_id.and_then(|id| Uuid::parse_str(&id).ok()),
        data,
        metadata,
        created_at_ms: created_ms as u64,
    })
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<RecordedEvent>>,
) -> Result<Vec<RecordedEvent>> {
    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::storage::Storage;
    use crate::types::{EventData, ExpectedVersion};

    fn seeded_storage() -> Storage {
        let db = Database::open_in_memory().unwrap();
        let mut storage = Storage::new(db.into_connection()).unwrap();

        let a = StreamUuid::new("stream-a");
        let b = StreamUuid::new("stream-b");
        storage
            .append_to_stream(
                &a,
                ExpectedVersion::Any,
                vec![
                    EventData::new("A1", b"a1".to_vec()),
                    EventData::new("A2", b"a2".to_vec()),
                ],
            )
            .unwrap();
        storage
            .append_to_stream(&b, ExpectedVersion::Any, vec![EventData::new("B1", b"b1".to_vec())])
            .unwrap();
        storage
            .append_to_stream(
                &a,
                ExpectedVersion::Exact(StreamVersion::from_raw(2)),
                vec![EventData::new("A3", b"a3".to_vec())],
            )
            .unwrap();
        storage
    }

    #[test]
    fn test_read_stream_forward_is_exclusive_and_ordered() {
        let storage = seeded_storage();
        let conn = storage.connection();
        let a = StreamUuid::new("stream-a");

        let all = read_stream_forward(conn, &a, StreamVersion::NONE, 100).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(
            all.iter().map(|e| e.stream_version.as_raw()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(all[2].event_number.as_raw(), 4);

        // from_version is exclusive: cursor 1 yields versions 2 and 3.
        let tail = read_stream_forward(conn, &a, StreamVersion::from_raw(1), 100).unwrap();
        assert_eq!(
            tail.iter().map(|e| e.stream_version.as_raw()).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let bounded = read_stream_forward(conn, &a, StreamVersion::NONE, 2).unwrap();
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn test_read_all_forward_spans_streams() {
        let storage = seeded_storage();
        let conn = storage.connection();

        let all = read_all_forward(conn, EventNumber::NONE, 100).unwrap();
        assert_eq!(
            all.iter().map(|e| e.event_number.as_raw()).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(all[2].stream_uuid.as_str(), "stream-b");

        let tail = read_all_forward(conn, EventNumber::from_raw(2), 100).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event_number.as_raw(), 3);
    }

    #[test]
    fn test_read_unknown_stream_is_empty() {
        let storage = seeded_storage();
        let events =
            read_stream_forward(storage.connection(), &StreamUuid::new("nope"), StreamVersion::NONE, 10)
                .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_head_queries() {
        let storage = seeded_storage();
        let conn = storage.connection();

        assert_eq!(last_event_number(conn).unwrap(), EventNumber::from_raw(4));
        assert_eq!(
            stream_version(conn, &StreamUuid::new("stream-a")).unwrap(),
            StreamVersion::from_raw(3)
        );
        assert_eq!(
            stream_version(conn, &StreamUuid::new("missing")).unwrap(),
            StreamVersion::NONE
        );
    }
}
