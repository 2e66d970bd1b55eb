//! # TailStore: Durable Event Streams with Resumable Subscriptions
//!
//! TailStore is an append-only event store with long-lived, pull-style
//! subscriptions. Clients append ordered events to logical streams;
//! consumers subscribe to one stream or to all of them (`$all`), receive
//! events strictly in order, and acknowledge them to advance a durable
//! cursor.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Async API Layer                           │
//! │                 (append, read, subscribe)                       │
//! └───────────────┬─────────────────────────────┬───────────────────┘
//!                 │                             │
//!                 ▼                             ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────────┐
//! │       Writer Thread       │   │     Subscription Tasks          │
//! │ (owns the R/W connection, │──►│  (one per consumer: catch-up,   │
//! │  publishes to the bus)    │bus│   live delivery, ack cursors)   │
//! └───────────────┬───────────┘   └─────────────────────────────────┘
//!                 │
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SQLite (WAL)                             │
//! │            events · streams · subscriptions                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Dense global order**: `event_number` strictly increases across
//!    all streams, with no gaps, and is never reused
//! 2. **Dense stream order**: `stream_version` strictly increases per
//!    stream from 1, with no gaps
//! 3. **Single consumer**: a subscription identity is served by at most
//!    one consumer at a time, enforced by an advisory lock
//! 4. **Ordered delivery**: a subscriber observes strictly increasing
//!    cursors; historical replay always precedes newer live events
//! 5. **At-least-once, at-most-once-after-ack**: unacknowledged events
//!    are redelivered on resubscribe; acknowledged events never are
//!
//! ## Subscribing
//!
//! ```rust,ignore
//! use tailstore::{SubscriberMessage, SubscriptionOptions, TailStore};
//!
//! let store = TailStore::open("events.db").await?;
//! let mut sub = store
//!     .subscribe("account-1", "projector", SubscriptionOptions::default())
//!     .await?;
//!
//! while let Some(message) = sub.next().await {
//!     match message {
//!         SubscriberMessage::Events(events) => {
//!             for event in &events {
//!                 process(event);
//!             }
//!             // Acking the last event advances past the whole batch.
//!             if let Some(last) = events.last() {
//!                 sub.ack_event(last).await?;
//!             }
//!         }
//!         SubscriberMessage::CaughtUp(cursor) => println!("live from {cursor}"),
//!         SubscriberMessage::Dropped(reason) => break,
//!     }
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for TailStore operations.
pub mod error;

/// SQLite DDL and database initialization.
pub mod schema;

/// Domain types (streams, events, positions, cursors).
pub mod types;

/// The single-writer storage engine (append path, cursor rows).
pub mod storage;

/// Forward-only read operations.
pub mod reader;

/// Advisory locks guarding single-consumer subscriptions.
pub mod locks;

/// The notification bus between the append path and live subscriptions.
pub mod bus;

/// The `EventStore` port consumed by the subscription engine.
pub mod store;

/// The subscription state machine, task, and consumer handle.
pub mod subscription;

/// The catch-up worker driving historical replay.
mod catchup;

/// The async API (main entry point).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::TailStore;
pub use error::{Error, Result};
pub use schema::Database;
pub use store::EventStore;

pub use types::{
    AppendResult, EventData, EventNumber, ExpectedVersion, RecordedEvent, StreamSelector,
    StreamUuid, StreamVersion, SubscriptionRow, ALL_STREAMS,
};

pub use subscription::{
    identity_mapper, DropReason, Mapper, SubscriberMessage, Subscription, SubscriptionOptions,
};
