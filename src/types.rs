//! # Domain Types for TailStore
//!
//! This module defines the core types used throughout TailStore. They model
//! the event sourcing domain: streams, recorded events, positions, and
//! subscription cursors.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! The two position scalars, the global event number and the per-stream
//! version, are both `u64`s that must never be mixed up. Wrapping them in
//! single-field structs means:
//!
//! - Can't accidentally pass an `EventNumber` where a `StreamVersion` is expected
//! - Function signatures document what they expect
//! - Representation can change later without touching call sites
//!
//! ## Invariants
//!
//! - [`EventNumber`]: globally dense and strictly increasing, starts at 1
//! - [`StreamVersion`]: dense and strictly increasing per stream, starts at 1
//! - Both treat `0` as the sentinel "before the first event"

use std::fmt;

use uuid::Uuid;

// =============================================================================
// Positions
// =============================================================================

/// A position in the global event log.
///
/// Assigned on commit; strictly increases across all streams with no gaps.
/// `0` is the cursor sentinel meaning "before the first event", so a
/// subscription with cursor `EventNumber::NONE` replays everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventNumber(u64);

impl EventNumber {
    /// The cursor sentinel: before the first event.
    pub const NONE: EventNumber = EventNumber(0);

    /// The first event number assigned to any event.
    pub const FIRST: EventNumber = EventNumber(1);

    /// Creates an EventNumber from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next event number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Adds an offset, for computing the last number of an appended batch.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Returns true if this is the "before the first event" sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EventNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A version number within a single stream.
///
/// Dense from 1 per stream; `0` is the same "before the first event"
/// sentinel as [`EventNumber::NONE`]. An event carries both scalars:
/// "event at number 1000 is version 5 of stream X".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamVersion(u64);

impl StreamVersion {
    /// The cursor sentinel: before the first event of the stream.
    pub const NONE: StreamVersion = StreamVersion(0);

    /// The first version in a stream.
    pub const FIRST: StreamVersion = StreamVersion(1);

    /// Creates a StreamVersion from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Adds an offset to this version.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Returns true if this represents "no events yet".
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// Stream Identification
// =============================================================================

/// The reserved stream identity denoting "all streams".
///
/// Never a valid identity for appends; only subscriptions use it, and it is
/// what the subscriptions table stores for an all-streams cursor row.
pub const ALL_STREAMS: &str = "$all";

/// An opaque identity for an event stream.
///
/// Typically a UUID string (`"7c0e3ba2-..."`), but any string that is not
/// the reserved [`ALL_STREAMS`] sentinel is accepted; the store treats it
/// as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamUuid(String);

impl StreamUuid {
    /// Creates a stream identity from a string.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the reserved all-streams sentinel.
    pub fn is_all(&self) -> bool {
        self.0 == ALL_STREAMS
    }
}

impl fmt::Display for StreamUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamUuid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamUuid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a subscription reads: one stream, or the union of all streams.
///
/// The selector decides which cursor scalar is active (`stream_version`
/// for a single stream, `event_number` for [`StreamSelector::All`]) and
/// which bus topic the subscription registers under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamSelector {
    /// Every stream, ordered by global event number.
    All,
    /// A single stream, ordered by stream version.
    Stream(StreamUuid),
}

impl StreamSelector {
    /// Creates a single-stream selector.
    pub fn stream(uuid: impl Into<StreamUuid>) -> Self {
        Self::Stream(uuid.into())
    }

    /// The identity persisted in the subscriptions table: the stream uuid,
    /// or [`ALL_STREAMS`] for the all-streams selector.
    pub fn persisted_uuid(&self) -> &str {
        match self {
            Self::All => ALL_STREAMS,
            Self::Stream(uuid) => uuid.as_str(),
        }
    }

    /// Reconstructs a selector from a persisted stream uuid.
    pub fn from_persisted(uuid: &str) -> Self {
        if uuid == ALL_STREAMS {
            Self::All
        } else {
            Self::Stream(StreamUuid::new(uuid))
        }
    }

    /// The active cursor scalar of an event under this selector.
    pub fn cursor_of(&self, event: &RecordedEvent) -> u64 {
        match self {
            Self::All => event.event_number.as_raw(),
            Self::Stream(_) => event.stream_version.as_raw(),
        }
    }
}

impl fmt::Display for StreamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.persisted_uuid())
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event to be appended to a stream.
///
/// This is the input form, what the client provides. Positions and the
/// event id are assigned during append. Payload and metadata are opaque
/// bytes; the client chooses the serialization format.
#[derive(Debug, Clone)]
pub struct EventData {
    /// Classification of the event (e.g. `"AccountOpened"`).
    pub event_type: String,

    /// Correlation id linking this event to a larger interaction.
    pub correlation_id: Option<Uuid>,

    /// The id of the event that caused this one.
    pub causation_id: Option<Uuid>,

    /// The event payload.
    pub data: Vec<u8>,

    /// Optional metadata (tracing context, actor info, ...).
    pub metadata: Option<Vec<u8>>,
}

impl EventData {
    /// Creates an event with a type and payload.
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id: None,
            causation_id: None,
            data: data.into(),
            metadata: None,
        }
    }

    /// Adds metadata (builder pattern).
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Adds a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Adds a causation id.
    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

/// A stored event with full position information.
///
/// The output form: what readers and subscribers receive. Immutable once
/// committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Unique id assigned at append.
    pub event_id: Uuid,

    /// Position in the global log.
    pub event_number: EventNumber,

    /// The stream this event belongs to.
    pub stream_uuid: StreamUuid,

    /// Version within the stream.
    pub stream_version: StreamVersion,

    /// Classification of the event.
    pub event_type: String,

    /// Correlation id, if provided.
    pub correlation_id: Option<Uuid>,

    /// Causation id, if provided.
    pub causation_id: Option<Uuid>,

    /// The event payload.
    pub data: Vec<u8>,

    /// The event metadata, if provided.
    pub metadata: Option<Vec<u8>>,

    /// When the event was committed (UTC, Unix milliseconds).
    pub created_at_ms: u64,
}

// =============================================================================
// Append
// =============================================================================

/// Expected state of a stream when appending, for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No expectation; the stream is created on first use.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must be at exactly this version.
    Exact(StreamVersion),
}

/// The result of a successful append: the positions assigned.
#[derive(Debug, Clone)]
pub struct AppendResult {
    /// First global event number assigned.
    pub first_event_number: EventNumber,

    /// Last global event number assigned.
    pub last_event_number: EventNumber,

    /// First stream version assigned.
    pub first_version: StreamVersion,

    /// Last stream version assigned.
    pub last_version: StreamVersion,
}

impl AppendResult {
    /// Returns the number of events that were appended.
    pub fn event_count(&self) -> u64 {
        self.last_event_number.as_raw() - self.first_event_number.as_raw() + 1
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// The durable cursor row for a `(stream_uuid, subscription_name)` pair.
///
/// Both scalars are persisted verbatim; which one is authoritative depends
/// on the subscription's selector kind. `subscription_id` keys the
/// advisory lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
    /// Internal row id; the advisory lock key.
    pub subscription_id: i64,

    /// The persisted selector identity (a stream uuid or [`ALL_STREAMS`]).
    pub stream_uuid: String,

    /// The subscription name, unique per selector.
    pub subscription_name: String,

    /// Last acknowledged global event number.
    pub last_seen_event_number: EventNumber,

    /// Last acknowledged stream version.
    pub last_seen_stream_version: StreamVersion,

    /// When the row was created (UTC, Unix milliseconds).
    pub created_at_ms: u64,
}

// =============================================================================
// Tests
// =============================================================================
