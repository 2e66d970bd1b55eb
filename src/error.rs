//! # Error Handling for TailStore
//!
//! A single error enum ([`Error`]) represents every failure mode, which
//! keeps function signatures simple and lets callers handle errors
//! uniformly.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Conflict | `Conflict`, `LockContested` | retry with fresh state / retry later |
//! | Transient storage | `Sqlite`, `Schema`, `Closed` | supervisor restarts, cursor reloaded |
//! | Fatal subscription | `OrderingViolation`, `BufferOverflow` | terminate; operator inspects |
//! | Consumer gone | `SubscriberDown` | terminate task, release the lock |
//!
//! A stale acknowledgement (cursor regression) is deliberately **not** an
//! error: the subscription state machine ignores it, making acks
//! idempotent.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in TailStore operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflicts (caller can retry)
    // =========================================================================

    /// Optimistic concurrency conflict: the stream was modified since last
    /// read, or the expected-version assertion failed.
    ///
    /// Recovery: re-read the stream head, re-apply business logic, retry
    /// the append with the updated expectation.
    #[error("conflict on stream '{stream_uuid}': expected version {expected}, but found {actual}")]
    Conflict {
        /// The stream where the conflict occurred.
        stream_uuid: String,
        /// The version the client expected.
        expected: u64,
        /// The actual current version.
        actual: u64,
    },

    /// Another consumer already holds the advisory lock for this
    /// subscription identity.
    ///
    /// A subscription admits at most one concurrent consumer. The caller
    /// may retry later; the lock is released when the current holder's
    /// task exits.
    #[error("subscription '{name}' on '{stream_uuid}' already has an active consumer")]
    LockContested {
        /// The persisted selector identity.
        stream_uuid: String,
        /// The subscription name.
        name: String,
    },

    // =========================================================================
    // Transient storage (supervisor restarts; cursor reloaded from disk)
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),

    /// The store handle was used after shutdown, or an internal channel
    /// closed unexpectedly.
    #[error("store closed: {0}")]
    Closed(String),

    // =========================================================================
    // Fatal subscription errors (terminate; operator inspects)
    // =========================================================================

    /// The event source produced an event whose cursor does not strictly
    /// exceed the last delivered cursor.
    ///
    /// Delivered cursors are strictly increasing per subscription; a
    /// violation indicates storage corruption or a broken read path, so
    /// the subscription terminates rather than deliver out of order.
    #[error(
        "ordering violation on subscription '{name}': cursor {cursor} does not exceed last seen {last_seen}"
    )]
    OrderingViolation {
        /// The subscription name.
        name: String,
        /// The offending cursor value.
        cursor: u64,
        /// The cursor of the last delivered event.
        last_seen: u64,
    },

    /// The pending buffer of a stalled subscription exceeded its bound.
    ///
    /// Live events accumulate while deliveries are stalled on acks; the
    /// buffer is the memory budget for that. A consumer that never acks
    /// is terminated here instead of growing without bound.
    #[error("subscription '{name}' buffered {buffered} events, exceeding the limit of {limit}")]
    BufferOverflow {
        /// The subscription name.
        name: String,
        /// Events buffered when the limit was hit.
        buffered: usize,
        /// The configured bound.
        limit: usize,
    },

    /// The subscriber's delivery channel is no longer reachable.
    #[error("subscriber for '{name}' is gone")]
    SubscriberDown {
        /// The subscription name.
        name: String,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs and operator output; keep them
    /// readable and complete.
    #[test]
    fn test_error_display() {
        let conflict = Error::Conflict {
            stream_uuid: "account-42".to_string(),
            expected: 5,
            actual: 7,
        };
        assert_eq!(
            conflict.to_string(),
            "conflict on stream 'account-42': expected version 5, but found 7"
        );

        let contested = Error::LockContested {
            stream_uuid: "$all".to_string(),
            name: "projector".to_string(),
        };
        assert_eq!(
            contested.to_string(),
            "subscription 'projector' on '$all' already has an active consumer"
        );

        let ordering = Error::OrderingViolation {
            name: "projector".to_string(),
            cursor: 3,
            last_seen: 5,
        };
        assert!(ordering.to_string().contains("cursor 3"));
        assert!(ordering.to_string().contains("last seen 5"));

        let overflow = Error::BufferOverflow {
            name: "projector".to_string(),
            buffered: 10_001,
            limit: 10_000,
        };
        assert!(overflow.to_string().contains("10001"));
    }

    /// `#[from]` lets `?` convert rusqlite errors automatically.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }
}
