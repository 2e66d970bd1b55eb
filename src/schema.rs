//! # SQLite Schema for TailStore
//!
//! Database schema and initialization. Three domain tables plus a metadata
//! table:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Schema Overview                            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  streams                      events                                │
//! │  ┌──────────────────┐         ┌─────────────────────┐               │
//! │  │ stream_id (PK)   │◄────────│ stream_id (FK)      │               │
//! │  │ stream_uuid (UQ) │         │ event_number (PK)   │               │
//! │  │ stream_version   │         │ event_id (UQ)       │               │
//! │  │ created_ms       │         │ stream_version      │               │
//! │  └──────────────────┘         │ event_type, data... │               │
//! │                               └─────────────────────┘               │
//! │                                                                     │
//! │  subscriptions                                                      │
//! │  ┌────────────────────────────────────────┐                         │
//! │  │ subscription_id (PK)                   │                         │
//! │  │ (stream_uuid, subscription_name) (UQ)  │                         │
//! │  │ last_seen_event_number                 │                         │
//! │  │ last_seen_stream_version               │                         │
//! │  └────────────────────────────────────────┘                         │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why an integer `stream_id` foreign key?
//!
//! Stream identities are opaque strings of arbitrary length. Events are
//! the hot table; storing an 8-byte integer per row instead of the full
//! uuid keeps the B-tree compact, and the unique index on
//! `streams.stream_uuid` resolves identities in one lookup.
//!
//! ### Why does `streams.stream_version` cache the head?
//!
//! Appends must assign dense versions and check `ExpectedVersion` without
//! scanning `events`. The head lives with the stream row and is updated in
//! the same transaction as the insert, so it can never lead the events.
//!
//! ### Why both cursor scalars on `subscriptions`?
//!
//! A subscription row stores `last_seen_event_number` *and*
//! `last_seen_stream_version`; which one is authoritative depends on the
//! selector kind ($all vs a single stream). Persisting the pair verbatim
//! means re-subscribing never has to reconstruct the inactive scalar.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment on breaking schema changes.
///
/// No migrations in v1: a version mismatch is an error.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `streams` table: one row per logical stream, caching its head.
///
/// # Columns
///
/// - `stream_id`: auto-increment primary key; the FK used by `events`
/// - `stream_uuid`: the opaque client-facing identity, unique
/// - `stream_version`: version of the most recent event (0 = empty stream)
/// - `created_ms`: Unix timestamp in milliseconds
const CREATE_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    stream_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_uuid    TEXT NOT NULL UNIQUE,
    stream_version INTEGER NOT NULL DEFAULT 0,
    created_ms     INTEGER NOT NULL
)
"#;

/// The `events` table: the append-only log, one row per event.
///
/// # Columns
///
/// - `event_number`: globally dense, strictly increasing position (PK)
/// - `event_id`: UUID assigned at append, unique
/// - `stream_id`: FK into `streams`
/// - `stream_version`: dense per-stream version (1, 2, 3, ...)
/// - `event_type`: client-supplied classification
/// - `correlation_id` / `causation_id`: optional UUIDs
/// - `data` / `metadata`: opaque payloads
/// - `created_ms`: Unix timestamp in milliseconds
///
/// # Invariants
///
/// - `event_number` strictly increases, is never reused
/// - `stream_version` strictly increases per stream, no gaps
/// - Rows are never updated or deleted
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_number   INTEGER PRIMARY KEY,
    event_id       TEXT NOT NULL UNIQUE,
    stream_id      INTEGER NOT NULL,
    stream_version INTEGER NOT NULL,
    event_type     TEXT NOT NULL,
    correlation_id TEXT,
    causation_id   TEXT,
    data           BLOB NOT NULL,
    metadata       BLOB,
    created_ms     INTEGER NOT NULL
)
"#;

/// Unique index enforcing dense per-stream versions and serving
/// stream-forward reads: `WHERE stream_id = ? AND stream_version > ?
/// ORDER BY stream_version`.
const CREATE_EVENTS_STREAM_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS events_stream_version
ON events(stream_id, stream_version)
"#;

/// The `subscriptions` table: one durable cursor row per
/// `(stream_uuid, subscription_name)`.
///
/// # Columns
///
/// - `subscription_id`: auto-increment primary key; keys the advisory lock
/// - `stream_uuid`: the selector identity; the literal `$all` denotes the
///   all-streams selector
/// - `subscription_name`: consumer-chosen name, unique per selector
/// - `last_seen_event_number` / `last_seen_stream_version`: the persisted
///   cursor pair, both defaulting to 0 ("before the first event")
/// - `created_ms`: Unix timestamp in milliseconds
///
/// The cursor only ever moves forward, and only on acknowledgement.
const CREATE_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    subscription_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_uuid              TEXT NOT NULL,
    subscription_name        TEXT NOT NULL,
    last_seen_event_number   INTEGER NOT NULL DEFAULT 0,
    last_seen_stream_version INTEGER NOT NULL DEFAULT 0,
    created_ms               INTEGER NOT NULL,
    UNIQUE (stream_uuid, subscription_name)
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS tailstore_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A wrapper around a SQLite connection with the TailStore schema applied.
///
/// `Database` owns its `Connection`; dropping it closes the connection.
/// All schema decisions (pragmas, tables, version checks) live here so the
/// rest of the crate can assume an initialized database.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the stored schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database.
    ///
    /// In-memory databases are lost when the connection closes; they exist
    /// for tests and experimentation.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Initializes pragmas, tables, and the schema version.
    ///
    /// Idempotent: every statement uses `IF NOT EXISTS`, and the version
    /// check accepts a database initialized by the same version.
    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see a consistent snapshot while the writer commits.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        // Sync the WAL on commit, not on every write.
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_STREAMS)?;
        self.conn.execute_batch(CREATE_EVENTS)?;
        self.conn.execute_batch(CREATE_EVENTS_STREAM_INDEX)?;
        self.conn.execute_batch(CREATE_SUBSCRIPTIONS)?;

        self.check_or_set_version()
    }

    /// Verifies the schema version, storing it on first initialization.
    fn check_or_set_version(&mut self) -> Result<()> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM tailstore_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .ok();

        match stored {
            None => {
                self.conn.execute(
                    "INSERT INTO tailstore_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(value) if value == SCHEMA_VERSION.to_string() => Ok(()),
            Some(value) => Err(Error::Schema(format!(
                "schema version mismatch: database has {}, this build expects {}",
                value, SCHEMA_VERSION
            ))),
        }
    }

    /// Consumes the wrapper, returning the initialized connection.
    ///
    /// Used to hand the connection to the single-writer storage layer.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Borrows the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
