//! Append-path invariants: gapless global numbering, dense per-stream
//! versions, optimistic concurrency, and forward-read semantics.

mod common;

use tailstore::{
    Error, EventData, EventNumber, ExpectedVersion, StreamVersion, TailStore,
};

fn payloads(prefix: &str, count: usize) -> Vec<EventData> {
    (1..=count)
        .map(|i| EventData::new("Example", format!("{prefix}-{i}").into_bytes()))
        .collect()
}

#[tokio::test]
async fn global_positions_and_stream_versions_are_gapless() {
    let (_dir, path) = common::create_temp_db_file("invariants.db");
    let store = TailStore::open(&path).await.unwrap();

    let r1 = store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, payloads("s1", 3))
        .await
        .unwrap();
    assert_eq!(r1.first_event_number.as_raw(), 1);
    assert_eq!(r1.last_event_number.as_raw(), 3);
    assert_eq!(r1.first_version.as_raw(), 1);
    assert_eq!(r1.last_version.as_raw(), 3);

    let r2 = store
        .append_to_stream(
            "stream-1",
            ExpectedVersion::Exact(StreamVersion::from_raw(3)),
            payloads("s1-more", 2),
        )
        .await
        .unwrap();
    assert_eq!(r2.first_event_number.as_raw(), 4);
    assert_eq!(r2.last_event_number.as_raw(), 5);
    assert_eq!(r2.first_version.as_raw(), 4);
    assert_eq!(r2.last_version.as_raw(), 5);

    let r3 = store
        .append_to_stream("stream-2", ExpectedVersion::NoStream, payloads("s2", 1))
        .await
        .unwrap();
    assert_eq!(r3.first_event_number.as_raw(), 6);
    assert_eq!(r3.first_version.as_raw(), 1);

    let global = store.read_all_forward(EventNumber::NONE, 1000).await.unwrap();
    assert_eq!(global.len(), 6);
    for (i, event) in global.iter().enumerate() {
        assert_eq!(event.event_number.as_raw(), (i + 1) as u64);
    }

    let s1 = store
        .read_stream_forward("stream-1", StreamVersion::NONE, 1000)
        .await
        .unwrap();
    assert_eq!(s1.len(), 5);
    for (i, event) in s1.iter().enumerate() {
        assert_eq!(event.stream_version.as_raw(), (i + 1) as u64);
    }
    assert_eq!(s1[0].data, b"s1-1");
    assert_eq!(s1[4].data, b"s1-more-2");

    store.shutdown().await;
}

#[tokio::test]
async fn forward_reads_use_exclusive_cursors() {
    let store = TailStore::open_in_memory().await.unwrap();
    common::append_events(&store, "stream-1", 1, 5).await;

    // Cursor 2 yields versions 3, 4 with a count of 2.
    let slice = store
        .read_stream_forward("stream-1", StreamVersion::from_raw(2), 2)
        .await
        .unwrap();
    assert_eq!(
        slice.iter().map(|e| e.stream_version.as_raw()).collect::<Vec<_>>(),
        vec![3, 4]
    );

    let slice = store.read_all_forward(EventNumber::from_raw(3), 10).await.unwrap();
    assert_eq!(
        slice.iter().map(|e| e.event_number.as_raw()).collect::<Vec<_>>(),
        vec![4, 5]
    );

    // A short read means the tail was reached.
    assert!(slice.len() < 10);

    let missing = store
        .read_stream_forward("does-not-exist", StreamVersion::NONE, 10)
        .await
        .unwrap();
    assert!(missing.is_empty());

    store.shutdown().await;
}

#[tokio::test]
async fn expected_version_guards_concurrent_writers() {
    let store = TailStore::open_in_memory().await.unwrap();

    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, payloads("a", 2))
        .await
        .unwrap();

    // A writer with a stale expectation is rejected and nothing commits.
    let err = store
        .append_to_stream(
            "stream-1",
            ExpectedVersion::Exact(StreamVersion::from_raw(1)),
            payloads("stale", 1),
        )
        .await
        .unwrap_err();
    match err {
        Error::Conflict { expected, actual, .. } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected a conflict, got {}", other),
    }
    assert_eq!(
        store.stream_version("stream-1").await.unwrap(),
        StreamVersion::from_raw(2)
    );

    // NoStream on an existing stream conflicts too.
    let err = store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, payloads("dup", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));

    store.shutdown().await;
}

#[tokio::test]
async fn event_numbers_stay_gapless_across_concurrent_appends() {
    let store = TailStore::open_in_memory().await.unwrap();

    let mut writers = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..10 {
                store
                    .append_to_stream(
                        format!("stream-{w}"),
                        ExpectedVersion::Any,
                        vec![EventData::new("E", format!("{w}-{i}").into_bytes())],
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let all = store.read_all_forward(EventNumber::NONE, 1000).await.unwrap();
    assert_eq!(all.len(), 80);
    for (i, event) in all.iter().enumerate() {
        assert_eq!(event.event_number.as_raw(), (i + 1) as u64);
    }

    // Each stream's versions are dense from 1.
    for w in 0..8 {
        let events = store
            .read_stream_forward(format!("stream-{w}"), StreamVersion::NONE, 100)
            .await
            .unwrap();
        assert_eq!(
            events.iter().map(|e| e.stream_version.as_raw()).collect::<Vec<_>>(),
            (1..=10).collect::<Vec<_>>()
        );
    }

    store.shutdown().await;
}

#[tokio::test]
async fn recorded_metadata_round_trips() {
    let store = TailStore::open_in_memory().await.unwrap();

    let correlation = uuid::Uuid::new_v4();
    let causation = uuid::Uuid::new_v4();
    store
        .append_to_stream(
            "stream-1",
            ExpectedVersion::Any,
            vec![EventData::new("AccountOpened", b"{\"owner\":\"ada\"}".to_vec())
                .with_metadata(b"trace-7".to_vec())
                .with_correlation_id(correlation)
                .with_causation_id(causation)],
        )
        .await
        .unwrap();

    let events = store
        .read_stream_forward("stream-1", StreamVersion::NONE, 1)
        .await
        .unwrap();
    let event = &events[0];
    assert_eq!(event.event_type, "AccountOpened");
    assert_eq!(event.data, b"{\"owner\":\"ada\"}");
    assert_eq!(event.metadata.as_deref(), Some(b"trace-7".as_slice()));
    assert_eq!(event.correlation_id, Some(correlation));
    assert_eq!(event.causation_id, Some(causation));
    assert!(!event.event_id.is_nil());
    assert!(event.created_at_ms > 0);

    store.shutdown().await;
}

#[tokio::test]
async fn store_reopens_with_positions_intact() {
    let (_dir, path) = common::create_temp_db_file("reopen.db");

    {
        let store = TailStore::open(&path).await.unwrap();
        common::append_events(&store, "stream-1", 1, 3).await;
        store.shutdown().await;
    }

    let store = TailStore::open(&path).await.unwrap();
    assert_eq!(store.last_event_number().await.unwrap(), EventNumber::from_raw(3));

    // Numbering continues where it left off.
    let result = store
        .append_to_stream("stream-2", ExpectedVersion::Any, payloads("s2", 1))
        .await
        .unwrap();
    assert_eq!(result.first_event_number.as_raw(), 4);

    store.shutdown().await;
}

#[tokio::test]
async fn empty_append_and_reserved_stream_are_rejected() {
    let store = TailStore::open_in_memory().await.unwrap();

    let err = store
        .append_to_stream("stream-1", ExpectedVersion::Any, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Schema(_)));

    let err = store
        .append_to_stream(tailstore::ALL_STREAMS, ExpectedVersion::Any, payloads("x", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Schema(_)));

    store.shutdown().await;
}
