//! # Async API for TailStore
//!
//! The public async interface. rusqlite connections are `!Sync`, so they
//! live on dedicated OS threads; async callers talk to them over
//! `tokio::sync` channels.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             Async Tasks                                 │
//! │   append / read / subscribe        subscription tasks (one per active  │
//! │            │                       consumer, spawned by subscribe)      │
//! └────────────┼──────────────────────────────────┬────────────────────────┘
//!              │                                  │ acks, cursor updates
//!      ┌───────┴────────┐                ┌────────┴────────┐
//!      ▼                ▼                ▼                 │
//! ┌───────────────┐ ┌─────────────────────┐                │
//! │ Writer thread │ │    Reader pool      │                │
//! │ (owns Storage)│ │ (read-only conns)   │                │
//! │               │ │                     │                │
//! │ append ───────┼─┼──► EventBus ────────┼────► notify ───┘
//! └───────┬───────┘ └──────────┬──────────┘
//!         │                    │
//!         └─────────┬──────────┘
//!                   ▼
//!            ┌─────────────┐
//!            │   SQLite    │
//!            │   (WAL)     │
//!            └─────────────┘
//! ```
//!
//! One writer thread owns the sole read-write connection (and the
//! `Storage` positions); every mutation, appends and cursor updates alike, is a
//! message to it, which serializes commits and makes bus publish order
//! equal commit order. File-backed stores get a pool of reader threads
//! with read-only WAL connections; in-memory stores cannot share a
//! connection, so the writer thread serves reads as well.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, available_parallelism, JoinHandle};

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

use crate::bus::{BusRegistration, EventBus, DEFAULT_NOTIFY_CAPACITY};
use crate::error::{Error, Result};
use crate::locks::{AdvisoryLockGuard, AdvisoryLocks};
use crate::reader;
use crate::schema::Database;
use crate::storage::Storage;
use crate::store::EventStore;
use crate::subscription::{
    self, identity_mapper, Mapper, Subscription, SubscriptionFsm, SubscriptionMessage,
    SubscriptionOptions, SubscriptionRuntime,
};
use crate::types::{
    AppendResult, EventData, EventNumber, ExpectedVersion, RecordedEvent, StreamSelector,
    StreamUuid, StreamVersion, SubscriptionRow,
};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the write request channel.
const WRITE_CHANNEL_SIZE: usize = 1024;

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Size of a subscription task's inbox.
const SUBSCRIPTION_INBOX_SIZE: usize = 64;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

// =============================================================================
// Request Types
// =============================================================================

/// Requests handled by the writer thread. Everything that mutates the
/// database goes through here, including subscription cursor writes.
enum WriteRequest {
    CreateStream {
        stream_uuid: StreamUuid,
        response: oneshot::Sender<Result<i64>>,
    },
    Append {
        stream_uuid: StreamUuid,
        expected: ExpectedVersion,
        events: Vec<EventData>,
        response: oneshot::Sender<Result<AppendResult>>,
    },
    LocateOrCreateSubscription {
        stream_uuid: String,
        name: String,
        start_event_number: EventNumber,
        start_stream_version: StreamVersion,
        response: oneshot::Sender<Result<SubscriptionRow>>,
    },
    UpdateCursor {
        stream_uuid: String,
        name: String,
        event_number: EventNumber,
        stream_version: StreamVersion,
        response: oneshot::Sender<Result<()>>,
    },
    DeleteSubscription {
        stream_uuid: String,
        name: String,
        response: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Requests handled by the reader pool (or, in-memory, the writer thread).
enum ReadRequest {
    ReadStreamForward {
        stream_uuid: StreamUuid,
        from_version: StreamVersion,
        count: usize,
        response: oneshot::Sender<Result<Vec<RecordedEvent>>>,
    },
    ReadAllForward {
        from_event_number: EventNumber,
        count: usize,
        response: oneshot::Sender<Result<Vec<RecordedEvent>>>,
    },
    StreamVersion {
        stream_uuid: StreamUuid,
        response: oneshot::Sender<Result<StreamVersion>>,
    },
    LastEventNumber {
        response: oneshot::Sender<Result<EventNumber>>,
    },
    Shutdown,
}

// =============================================================================
// TailStore
// =============================================================================

/// The main async handle.
///
/// `Clone + Send + Sync`; all clones share the same threads, bus, and lock
/// table. Implements [`EventStore`], which is what the subscription engine
/// consumes.
#[derive(Clone)]
pub struct TailStore {
    write_tx: mpsc::Sender<WriteRequest>,
    read_tx: mpsc::Sender<ReadRequest>,
    bus: EventBus,
    locks: AdvisoryLocks,
    writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    reader_count: usize,
}

impl TailStore {
    /// Opens or creates a store at the given path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_internal(Some(path.as_ref().to_path_buf())).await
    }

    /// Creates an in-memory store (lost on shutdown; for tests and
    /// experimentation).
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_internal(None).await
    }

    async fn open_internal(path: Option<PathBuf>) -> Result<Self> {
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let bus = EventBus::new();
        let locks = AdvisoryLocks::new();

        // The writer thread reports initialization errors back before the
        // constructor returns, so a bad path fails open() rather than the
        // first append.
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();

        // A private in-memory database has exactly one connection, so the
        // writer serves reads too; file-backed stores get a reader pool.
        let (writer_read_rx, pool_read_rx) = if path.is_none() {
            (Some(read_rx), None)
        } else {
            (None, Some(read_rx))
        };

        let writer_path = path.clone();
        let writer_bus = bus.clone();
        let writer_handle = thread::Builder::new()
            .name("tailstore-writer".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to create writer runtime");

                rt.block_on(async move {
                    let storage = match open_storage(writer_path.as_deref()) {
                        Ok(storage) => {
                            let _ = init_tx.send(Ok(()));
                            storage
                        }
                        Err(err) => {
                            let _ = init_tx.send(Err(err));
                            return;
                        }
                    };

                    match writer_read_rx {
                        Some(read_rx) => {
                            run_writer_with_reads(storage, write_rx, read_rx, writer_bus).await;
                        }
                        None => run_writer(storage, write_rx, writer_bus).await,
                    }
                });
            })
            .map_err(|e| Error::Schema(format!("failed to spawn writer thread: {}", e)))?;

        init_rx
            .await
            .map_err(|_| Error::Closed("writer thread exited during startup".to_string()))??;

        // Reader pool, file mode only. Threads compete on a shared
        // receiver; each owns a read-only WAL connection.
        let mut reader_handles = Vec::new();
        let reader_count = if let (Some(path), Some(read_rx)) = (path, pool_read_rx) {
            let count = available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_READ_THREADS)
                .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

            let read_rx = Arc::new(std::sync::Mutex::new(read_rx));
            for i in 0..count {
                let rx = Arc::clone(&read_rx);
                let path = path.clone();

                let handle = thread::Builder::new()
                    .name(format!("tailstore-reader-{}", i))
                    .spawn(move || {
                        let rt = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("failed to create reader runtime");

                        rt.block_on(async move {
                            let conn = match Connection::open_with_flags(
                                &path,
                                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                            ) {
                                Ok(conn) => conn,
                                Err(err) => {
                                    error!(error = %err, "reader failed to open connection");
                                    return;
                                }
                            };
                            run_reader_pooled(conn, rx).await;
                        });
                    })
                    .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {}", e)))?;

                reader_handles.push(handle);
            }
            count
        } else {
            0
        };

        Ok(Self {
            write_tx,
            read_tx,
            bus,
            locks,
            writer_handle: Arc::new(Mutex::new(Some(writer_handle))),
            reader_handles: Arc::new(Mutex::new(reader_handles)),
            reader_count,
        })
    }

    /// Number of reader threads (0 when the writer serves reads).
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    async fn write_request<R>(
        &self,
        request: WriteRequest,
        response: oneshot::Receiver<Result<R>>,
    ) -> Result<R> {
        self.write_tx
            .send(request)
            .await
            .map_err(|_| Error::Closed("writer thread has shut down".to_string()))?;
        response
            .await
            .map_err(|_| Error::Closed("writer dropped the response channel".to_string()))?
    }

    async fn read_request<R>(
        &self,
        request: ReadRequest,
        response: oneshot::Receiver<Result<R>>,
    ) -> Result<R> {
        self.read_tx
            .send(request)
            .await
            .map_err(|_| Error::Closed("reader threads have shut down".to_string()))?;
        response
            .await
            .map_err(|_| Error::Closed("reader dropped the response channel".to_string()))?
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Creates an empty stream; fails with a conflict if it exists.
    pub async fn create_stream(&self, stream_uuid: impl Into<StreamUuid>) -> Result<i64> {
        let (response, rx) = oneshot::channel();
        self.write_request(
            WriteRequest::CreateStream { stream_uuid: stream_uuid.into(), response },
            rx,
        )
        .await
    }

    /// Appends events to a stream.
    ///
    /// On commit the events are published to live subscriptions of the
    /// stream and of `$all`, in commit order.
    pub async fn append_to_stream(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<AppendResult> {
        let (response, rx) = oneshot::channel();
        self.write_request(
            WriteRequest::Append {
                stream_uuid: stream_uuid.into(),
                expected,
                events,
                response,
            },
            rx,
        )
        .await
    }

    /// Events of one stream after `from_version`, ascending, at most
    /// `count`.
    pub async fn read_stream_forward(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        from_version: StreamVersion,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        let (response, rx) = oneshot::channel();
        self.read_request(
            ReadRequest::ReadStreamForward {
                stream_uuid: stream_uuid.into(),
                from_version,
                count,
                response,
            },
            rx,
        )
        .await
    }

    /// Events across all streams after `from_event_number`, ascending, at
    /// most `count`.
    pub async fn read_all_forward(
        &self,
        from_event_number: EventNumber,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        let (response, rx) = oneshot::channel();
        self.read_request(
            ReadRequest::ReadAllForward { from_event_number, count, response },
            rx,
        )
        .await
    }

    /// The current version of a stream; the zero sentinel if absent.
    pub async fn stream_version(&self, stream_uuid: impl Into<StreamUuid>) -> Result<StreamVersion> {
        let (response, rx) = oneshot::channel();
        self.read_request(
            ReadRequest::StreamVersion { stream_uuid: stream_uuid.into(), response },
            rx,
        )
        .await
    }

    /// The highest committed event number; the zero sentinel when empty.
    pub async fn last_event_number(&self) -> Result<EventNumber> {
        let (response, rx) = oneshot::channel();
        self.read_request(ReadRequest::LastEventNumber { response }, rx).await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribes to a single stream.
    ///
    /// Locates or creates the durable cursor row, takes the advisory lock
    /// (failing with [`Error::LockContested`] if another consumer is
    /// active), and spawns the subscription task: catch-up from the
    /// cursor, then live delivery, every batch gated on acknowledgement.
    pub async fn subscribe(
        &self,
        stream_uuid: impl Into<StreamUuid>,
        name: impl Into<String>,
        options: SubscriptionOptions,
    ) -> Result<Subscription<RecordedEvent>> {
        self.subscribe_mapped(
            StreamSelector::Stream(stream_uuid.into()),
            name,
            options,
            identity_mapper(),
        )
        .await
    }

    /// Subscribes to all streams, ordered by global event number.
    pub async fn subscribe_to_all(
        &self,
        name: impl Into<String>,
        options: SubscriptionOptions,
    ) -> Result<Subscription<RecordedEvent>> {
        self.subscribe_mapped(StreamSelector::All, name, options, identity_mapper()).await
    }

    /// Subscribes with a mapper applied to each event before delivery.
    ///
    /// The mapper is a projection only: ordering and acknowledgement
    /// cursors still run on the recorded positions, so consumers of mapped
    /// values must retain what they need for [`Subscription::ack`].
    pub async fn subscribe_mapped<T: Send + 'static>(
        &self,
        selector: StreamSelector,
        name: impl Into<String>,
        options: SubscriptionOptions,
        mapper: Mapper<T>,
    ) -> Result<Subscription<T>> {
        let name = name.into();

        let row = self
            .locate_or_create_subscription(
                selector.persisted_uuid(),
                &name,
                options.start_from_event_number,
                options.start_from_stream_version,
            )
            .await?;

        let lock = self.try_advisory_lock(row.subscription_id).ok_or_else(|| {
            Error::LockContested {
                stream_uuid: row.stream_uuid.clone(),
                name: name.clone(),
            }
        })?;

        // Register on the bus before catch-up begins: anything committed
        // from here on reaches the pending buffer, anything before is
        // covered by the historical read.
        let (registration, notify_rx) = self.subscribe_to_bus(&selector, DEFAULT_NOTIFY_CAPACITY);

        let mut fsm = SubscriptionFsm::new(selector.clone(), name.clone(), mapper);
        fsm.subscribe(&row, &options);

        let (inbox_tx, inbox_rx) = mpsc::channel(SUBSCRIPTION_INBOX_SIZE);
        // Deliveries never outrun `max_in_flight` unacked events, so this
        // capacity keeps sends from blocking on an attentive consumer.
        let (subscriber_tx, subscriber_rx) = mpsc::channel(options.max_in_flight + 2);

        // The lock is held: begin catch-up as soon as the task runs.
        let _ = inbox_tx.try_send(SubscriptionMessage::Start);

        let runtime = SubscriptionRuntime {
            store: self.clone(),
            row,
            options,
            worker_inbox: inbox_tx.clone(),
            inbox_rx,
            notify_rx,
            subscriber_tx,
            lock,
            registration,
        };
        tokio::spawn(subscription::run_subscription(fsm, runtime));

        debug!(subscription = %name, selector = %selector, "subscribed");
        Ok(Subscription::new(name, selector, inbox_tx, subscriber_rx))
    }

    /// Deletes a subscription's cursor row without an active consumer.
    ///
    /// Fails with [`Error::LockContested`] while a consumer holds the
    /// subscription; use [`Subscription::unsubscribe`] in that case.
    pub async fn delete_subscription(
        &self,
        selector: &StreamSelector,
        name: &str,
    ) -> Result<()> {
        let row = self
            .locate_or_create_subscription(
                selector.persisted_uuid(),
                name,
                EventNumber::NONE,
                StreamVersion::NONE,
            )
            .await?;
        let _lock = self.try_advisory_lock(row.subscription_id).ok_or_else(|| {
            Error::LockContested {
                stream_uuid: row.stream_uuid.clone(),
                name: name.to_string(),
            }
        })?;
        EventStore::delete_subscription(self, selector.persisted_uuid(), name).await
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Shuts down the store threads gracefully.
    ///
    /// Active subscription tasks observe the closed channels and
    /// terminate. Idempotent; clones of this handle fail with
    /// [`Error::Closed`] afterwards.
    pub async fn shutdown(&self) {
        let _ = self.write_tx.send(WriteRequest::Shutdown).await;
        for _ in 0..self.reader_count.max(1) {
            let _ = self.read_tx.send(ReadRequest::Shutdown).await;
        }

        if let Some(handle) = self.writer_handle.lock().await.take() {
            let _ = handle.join();
        }
        for handle in self.reader_handles.lock().await.drain(..) {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// EventStore Port
// =============================================================================

#[async_trait::async_trait]
impl EventStore for TailStore {
    async fn create_stream(&self, stream_uuid: &StreamUuid) -> Result<i64> {
        TailStore::create_stream(self, stream_uuid.clone()).await
    }

    async fn append_to_stream(
        &self,
        stream_uuid: &StreamUuid,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<AppendResult> {
        TailStore::append_to_stream(self, stream_uuid.clone(), expected, events).await
    }

    async fn read_stream_forward(
        &self,
        stream_uuid: &StreamUuid,
        from_version: StreamVersion,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        TailStore::read_stream_forward(self, stream_uuid.clone(), from_version, count).await
    }

    async fn read_all_forward(
        &self,
        from_event_number: EventNumber,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        TailStore::read_all_forward(self, from_event_number, count).await
    }

    async fn locate_or_create_subscription(
        &self,
        stream_uuid: &str,
        name: &str,
        start_event_number: EventNumber,
        start_stream_version: StreamVersion,
    ) -> Result<SubscriptionRow> {
        let (response, rx) = oneshot::channel();
        self.write_request(
            WriteRequest::LocateOrCreateSubscription {
                stream_uuid: stream_uuid.to_string(),
                name: name.to_string(),
                start_event_number,
                start_stream_version,
                response,
            },
            rx,
        )
        .await
    }

    async fn update_subscription_cursor(
        &self,
        stream_uuid: &str,
        name: &str,
        event_number: EventNumber,
        stream_version: StreamVersion,
    ) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.write_request(
            WriteRequest::UpdateCursor {
                stream_uuid: stream_uuid.to_string(),
                name: name.to_string(),
                event_number,
                stream_version,
                response,
            },
            rx,
        )
        .await
    }

    async fn delete_subscription(&self, stream_uuid: &str, name: &str) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.write_request(
            WriteRequest::DeleteSubscription {
                stream_uuid: stream_uuid.to_string(),
                name: name.to_string(),
                response,
            },
            rx,
        )
        .await
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

// =============================================================================
// Thread Loops
// =============================================================================

fn open_storage(path: Option<&Path>) -> Result<Storage> {
    let db = match path {
        Some(path) => Database::open(path)?,
        None => Database::open_in_memory()?,
    };
    Storage::new(db.into_connection())
}

/// Applies one write request. Returns `false` on shutdown.
fn handle_write(storage: &mut Storage, bus: &EventBus, request: WriteRequest) -> bool {
    match request {
        WriteRequest::CreateStream { stream_uuid, response } => {
            let _ = response.send(storage.create_stream(&stream_uuid));
        }
        WriteRequest::Append { stream_uuid, expected, events, response } => {
            match storage.append_to_stream(&stream_uuid, expected, events) {
                Ok((result, recorded)) => {
                    // Committed: notify live subscriptions before anything
                    // else can observe the append.
                    bus.publish(&stream_uuid, &recorded);
                    let _ = response.send(Ok(result));
                }
                Err(err) => {
                    let _ = response.send(Err(err));
                }
            }
        }
        WriteRequest::LocateOrCreateSubscription {
            stream_uuid,
            name,
            start_event_number,
            start_stream_version,
            response,
        } => {
            let _ = response.send(storage.locate_or_create_subscription(
                &stream_uuid,
                &name,
                start_event_number,
                start_stream_version,
            ));
        }
        WriteRequest::UpdateCursor { stream_uuid, name, event_number, stream_version, response } => {
            let _ = response.send(storage.update_subscription_cursor(
                &stream_uuid,
                &name,
                event_number,
                stream_version,
            ));
        }
        WriteRequest::DeleteSubscription { stream_uuid, name, response } => {
            let _ = response.send(storage.delete_subscription(&stream_uuid, &name));
        }
        WriteRequest::Shutdown => return false,
    }
    true
}

/// Applies one read request against a connection. Returns `false` on
/// shutdown.
fn handle_read(conn: &Connection, request: ReadRequest) -> bool {
    match request {
        ReadRequest::ReadStreamForward { stream_uuid, from_version, count, response } => {
            let _ = response.send(reader::read_stream_forward(conn, &stream_uuid, from_version, count));
        }
        ReadRequest::ReadAllForward { from_event_number, count, response } => {
            let _ = response.send(reader::read_all_forward(conn, from_event_number, count));
        }
        ReadRequest::StreamVersion { stream_uuid, response } => {
            let _ = response.send(reader::stream_version(conn, &stream_uuid));
        }
        ReadRequest::LastEventNumber { response } => {
            let _ = response.send(reader::last_event_number(conn));
        }
        ReadRequest::Shutdown => return false,
    }
    true
}

/// Writer loop, file mode: reads are served elsewhere.
async fn run_writer(mut storage: Storage, mut write_rx: mpsc::Receiver<WriteRequest>, bus: EventBus) {
    while let Some(request) = write_rx.recv().await {
        if !handle_write(&mut storage, &bus, request) {
            break;
        }
    }
    debug!("writer thread stopped");
}

/// Writer loop, in-memory mode: the single connection serves reads too.
async fn run_writer_with_reads(
    mut storage: Storage,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    mut read_rx: mpsc::Receiver<ReadRequest>,
    bus: EventBus,
) {
    loop {
        tokio::select! {
            request = write_rx.recv() => match request {
                Some(request) => {
                    if !handle_write(&mut storage, &bus, request) {
                        break;
                    }
                }
                None => break,
            },
            request = read_rx.recv() => {
                if let Some(request) = request {
                    // Shutdown is driven by the write channel here.
                    let _ = handle_read(storage.connection(), request);
                }
            },
        }
    }
    debug!("writer thread stopped");
}

/// Reader loop: threads compete on the shared receiver, each with its own
/// read-only connection. WAL mode keeps reads consistent with commits.
async fn run_reader_pooled(
    conn: Connection,
    rx: Arc<std::sync::Mutex<mpsc::Receiver<ReadRequest>>>,
) {
    loop {
        let request = {
            let mut guard = rx.lock().expect("receiver mutex poisoned");
            guard.recv().await
        };
        match request {
            Some(request) => {
                if !handle_read(&conn, request) {
                    break;
                }
            }
            None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
