#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tailstore::{
    Database, EventData, ExpectedVersion, RecordedEvent, SubscriberMessage, Subscription,
    TailStore,
};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

/// Appends `count` typed events to a stream, numbered from `offset`.
pub async fn append_events(store: &TailStore, stream: &str, offset: usize, count: usize) {
    let events = (offset..offset + count)
        .map(|i| EventData::new("Example", format!("{stream}-{i}").into_bytes()))
        .collect();
    store
        .append_to_stream(stream, ExpectedVersion::Any, events)
        .await
        .expect("append events");
}

/// Receives the next subscriber message, failing the test on silence.
pub async fn recv(sub: &mut Subscription<RecordedEvent>) -> SubscriberMessage<RecordedEvent> {
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for a subscriber message")
        .expect("subscription closed unexpectedly")
}

/// Receives a message and asserts it is an `Events` batch.
pub async fn recv_events(sub: &mut Subscription<RecordedEvent>) -> Vec<RecordedEvent> {
    match recv(sub).await {
        SubscriberMessage::Events(events) => events,
        other => panic!("expected an events batch, got {:?}", other),
    }
}

/// Receives a message and asserts it is `CaughtUp` at the given cursor.
pub async fn recv_caught_up(sub: &mut Subscription<RecordedEvent>, expected: u64) {
    match recv(sub).await {
        SubscriberMessage::CaughtUp(cursor) => assert_eq!(cursor, expected),
        other => panic!("expected caught-up at {}, got {:?}", expected, other),
    }
}

/// Asserts that no subscriber message arrives within a grace period.
pub async fn expect_silence(sub: &mut Subscription<RecordedEvent>, grace: Duration) {
    if let Ok(message) = tokio::time::timeout(grace, sub.next()).await {
        panic!("expected silence, got {:?}", message);
    }
}

/// Polls until `f` yields a value or the timeout expires.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

