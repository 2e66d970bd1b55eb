//! # Durable Subscriptions
//!
//! The subscription state machine and its surrounding task. A subscription
//! delivers persisted events to one consumer strictly in order, resumes
//! from a durable cursor, and bridges historical replay into live
//! notification without duplication or gaps.
//!
//! ## Lifecycle
//!
//! ```text
//!  Initial ──subscribe──► SubscribeToEvents ──lock acquired──► CatchingUp
//!                                                                  │
//!                                 caught up (final batch acked)    │
//!                                                                  ▼
//!  Unsubscribed ◄──unsubscribe── Subscribed { overflowing: bool } ◄┘
//! ```
//!
//! While `CatchingUp`, the catch-up worker feeds historical batches
//! through the state machine and live notifications are parked in the
//! pending buffer. Once the final historical batch is acknowledged, the
//! machine emits `{caught_up, cursor}`, flushes the buffer, and forwards
//! live events directly, stalling again (`overflowing`) whenever the
//! unacknowledged window reaches `max_in_flight`.
//!
//! ## Two Cursors
//!
//! - `last_seen`: cursor of the newest event handed to the subscriber
//! - `last_ack`: cursor of the newest event the subscriber acknowledged
//!
//! `last_ack ≤ last_seen` always; their difference is the in-flight window
//! bounded by `max_in_flight`; after catch-up completes they are equal.
//! Only `last_ack` is persisted, on every ack, so a restarted consumer
//! re-receives exactly the delivered-but-unacknowledged suffix.
//!
//! ## Pure Transitions, Effects After
//!
//! [`SubscriptionFsm::handle`] is a pure function from a message to the
//! next state plus a list of [`Effect`]s. The task loop performs the
//! effects (channel sends, cursor persistence, worker spawn) afterwards,
//! so no I/O ever happens with the machine in a transient state, and the
//! whole protocol is unit-testable without a database.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::bus::BusRegistration;
use crate::catchup;
use crate::error::{Error, Result};
use crate::locks::AdvisoryLockGuard;
use crate::store::EventStore;
use crate::types::{
    EventNumber, RecordedEvent, StreamSelector, StreamVersion, SubscriptionRow,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default bound on delivered-but-unacknowledged events.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1_000;

/// Default batch size for catch-up reads.
pub const DEFAULT_CATCHUP_BATCH_SIZE: usize = 1_000;

/// Default bound on the pending buffer of live events parked during
/// catch-up or backpressure. Exceeding it terminates the subscription.
pub const DEFAULT_BUFFER_LIMIT: usize = 10_000;

/// Options recognized when subscribing.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Initial cursor for an all-streams subscription, applied on first
    /// subscribe only. `0` means from the beginning.
    pub start_from_event_number: EventNumber,

    /// Initial cursor for a single-stream subscription, applied on first
    /// subscribe only. `0` means from the beginning.
    pub start_from_stream_version: StreamVersion,

    /// Cap on delivered-but-unacknowledged events.
    pub max_in_flight: usize,

    /// Batch size for historical reads. The effective catch-up batch is
    /// `min(catchup_batch_size, max_in_flight)` so the in-flight bound
    /// holds during replay too.
    pub catchup_batch_size: usize,

    /// Memory budget (in events) for the pending buffer.
    pub buffer_limit: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            start_from_event_number: EventNumber::NONE,
            start_from_stream_version: StreamVersion::NONE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            catchup_batch_size: DEFAULT_CATCHUP_BATCH_SIZE,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Why a subscription terminated; the payload of the terminal
/// [`SubscriberMessage::Dropped`] notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The consumer unsubscribed; the cursor row was deleted.
    Unsubscribed,
    /// The pending buffer exceeded its bound, or the bus evicted the
    /// subscription's notification queue.
    BufferOverflow,
    /// The event source produced a cursor that does not strictly exceed
    /// the last delivered one.
    OrderingViolation,
    /// A storage operation failed; resubscribing resumes from the
    /// persisted cursor.
    StorageFailure,
}

/// Messages delivered to the subscriber.
#[derive(Debug)]
pub enum SubscriberMessage<T> {
    /// An in-order batch of (mapped) events. Acknowledge the last one to
    /// advance the cursor past the whole batch.
    Events(Vec<T>),

    /// Historical replay is complete up to this cursor; everything that
    /// follows is live. Emitted only after the final historical batch was
    /// acknowledged.
    CaughtUp(u64),

    /// Terminal notice: the subscription ended and no further messages
    /// follow. Best-effort.
    Dropped(DropReason),
}

/// The subscription task's inbox protocol.
#[derive(Debug)]
pub enum SubscriptionMessage {
    /// The advisory lock was acquired; begin catch-up.
    Start,

    /// A historical batch from the catch-up worker.
    CatchUpBatch(Vec<RecordedEvent>),

    /// The catch-up worker found the tail at this cursor.
    CaughtUp(u64),

    /// The catch-up worker failed to read.
    CatchUpFailed(Error),

    /// Live events from the notification bus.
    Notify(Vec<RecordedEvent>),

    /// Consumer acknowledgement. Both scalars travel together; the active
    /// one depends on the selector kind.
    Ack {
        event_number: EventNumber,
        stream_version: StreamVersion,
    },

    /// Stop consuming and delete the cursor row.
    Unsubscribe,
}

// =============================================================================
// State Machine
// =============================================================================

/// The states of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created, not yet bound to a cursor row.
    Initial,
    /// Cursor row located, waiting for the advisory lock.
    SubscribeToEvents,
    /// Replaying history; live notifications are buffered.
    CatchingUp,
    /// Live. `overflowing` stalls deliveries until acks free the window.
    Subscribed {
        /// The `max_in_flight_exceeded` sub-state.
        overflowing: bool,
    },
    /// Terminated; every further message is a no-op.
    Unsubscribed,
}

/// I/O the task loop must perform after a transition.
pub enum Effect<T> {
    /// Send a batch to the subscriber.
    Deliver(Vec<T>),
    /// Send the caught-up control message.
    NotifyCaughtUp(u64),
    /// Persist the acknowledged cursor pair.
    PersistCursor {
        event_number: EventNumber,
        stream_version: StreamVersion,
    },
    /// Spawn the catch-up worker from this cursor.
    StartCatchUp { from: u64 },
    /// Delete the cursor row (explicit unsubscribe).
    DeleteRow,
    /// Stop the task, notifying the subscriber with the reason.
    Terminate(DropReason),
}

/// The transform applied to each event before delivery.
pub type Mapper<T> = Arc<dyn Fn(&RecordedEvent) -> T + Send + Sync>;

/// Returns the identity mapper: deliver events as recorded.
pub fn identity_mapper() -> Mapper<RecordedEvent> {
    Arc::new(|event| event.clone())
}

/// The subscription state machine.
///
/// Owns the two cursors, the pending buffer, and the mapper. All methods
/// are synchronous and side-effect free apart from mutating `self`; I/O is
/// described by the returned [`Effect`]s.
pub struct SubscriptionFsm<T> {
    state: SubscriptionState,
    selector: StreamSelector,
    name: String,

    /// Cursor of the newest delivered event.
    last_seen: u64,
    /// Cursor of the newest acknowledged event.
    last_ack: u64,

    max_in_flight: usize,
    buffer: VecDeque<RecordedEvent>,
    buffer_limit: usize,

    /// A caught-up report waiting for outstanding acks.
    deferred_caught_up: Option<u64>,

    mapper: Mapper<T>,
}

impl<T> SubscriptionFsm<T> {
    /// Creates a machine in `Initial`.
    pub fn new(selector: StreamSelector, name: impl Into<String>, mapper: Mapper<T>) -> Self {
        Self {
            state: SubscriptionState::Initial,
            selector,
            name: name.into(),
            last_seen: 0,
            last_ack: 0,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            buffer: VecDeque::new(),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            deferred_caught_up: None,
            mapper,
        }
    }

    /// Binds the machine to its cursor row: `Initial → SubscribeToEvents`.
    ///
    /// The in-memory cursor starts at the greater of the persisted cursor
    /// and the requested start position, so a start position is honored on
    /// first subscribe and ignored on resume.
    pub fn subscribe(&mut self, row: &SubscriptionRow, options: &SubscriptionOptions) {
        debug_assert_eq!(self.state, SubscriptionState::Initial);

        let (persisted, requested) = match self.selector {
            StreamSelector::All => (
                row.last_seen_event_number.as_raw(),
                options.start_from_event_number.as_raw(),
            ),
            StreamSelector::Stream(_) => (
                row.last_seen_stream_version.as_raw(),
                options.start_from_stream_version.as_raw(),
            ),
        };

        self.last_seen = persisted.max(requested);
        self.last_ack = self.last_seen;
        self.max_in_flight = options.max_in_flight.max(1);
        self.buffer_limit = options.buffer_limit;
        self.state = SubscriptionState::SubscribeToEvents;
    }

    /// Applies one message, returning the effects to perform.
    pub fn handle(&mut self, message: SubscriptionMessage) -> Vec<Effect<T>> {
        use SubscriptionMessage as Msg;
        use SubscriptionState as State;

        match (self.state, message) {
            (State::Unsubscribed, _) => Vec::new(),

            (_, Msg::Unsubscribe) => {
                self.state = State::Unsubscribed;
                vec![Effect::DeleteRow, Effect::Terminate(DropReason::Unsubscribed)]
            }

            (State::SubscribeToEvents, Msg::Start) => {
                self.state = State::CatchingUp;
                vec![Effect::StartCatchUp { from: self.last_seen }]
            }

            (State::CatchingUp, Msg::CatchUpBatch(events)) => self.deliver_historical(events),

            (State::CatchingUp, Msg::CaughtUp(cursor)) => {
                if cursor <= self.last_ack {
                    self.complete_catch_up(cursor)
                } else {
                    // Outstanding acks for the final batch; finish on ack.
                    self.deferred_caught_up = Some(cursor);
                    Vec::new()
                }
            }

            (State::CatchingUp, Msg::CatchUpFailed(_)) => {
                self.state = State::Unsubscribed;
                vec![Effect::Terminate(DropReason::StorageFailure)]
            }

            (State::CatchingUp, Msg::Notify(events))
            | (State::Subscribed { overflowing: true }, Msg::Notify(events)) => {
                self.buffer.extend(events);
                self.check_buffer_limit()
            }

            (State::Subscribed { overflowing: false }, Msg::Notify(events)) => {
                self.buffer.extend(events);
                let mut effects = self.flush_buffer();
                effects.extend(self.check_buffer_limit());
                effects
            }

            (_, Msg::Ack { event_number, stream_version }) => {
                self.acknowledge(event_number, stream_version)
            }

            // Stale worker or protocol noise outside the expected state.
            (state, message) => {
                debug!(
                    subscription = %self.name,
                    ?state,
                    ?message,
                    "ignoring message in current state"
                );
                Vec::new()
            }
        }
    }

    /// Delivered-but-unacknowledged window.
    fn in_flight(&self) -> usize {
        (self.last_seen - self.last_ack) as usize
    }

    fn map_batch(&self, events: &[RecordedEvent]) -> Vec<T> {
        events.iter().map(|event| (self.mapper)(event)).collect()
    }

    /// A historical batch: cursors must strictly increase past `last_seen`.
    fn deliver_historical(&mut self, events: Vec<RecordedEvent>) -> Vec<Effect<T>> {
        for event in &events {
            let cursor = self.selector.cursor_of(event);
            if cursor <= self.last_seen {
                error!(
                    subscription = %self.name,
                    cursor,
                    last_seen = self.last_seen,
                    "event source violated cursor ordering"
                );
                self.state = SubscriptionState::Unsubscribed;
                return vec![Effect::Terminate(DropReason::OrderingViolation)];
            }
            self.last_seen = cursor;
        }
        if events.is_empty() {
            return Vec::new();
        }
        vec![Effect::Deliver(self.map_batch(&events))]
    }

    /// An acknowledgement. Stale and unknown cursors are ignored, which
    /// makes acks idempotent; a fresh one persists and may unblock a
    /// stalled delivery window or a deferred caught-up report.
    fn acknowledge(
        &mut self,
        event_number: EventNumber,
        stream_version: StreamVersion,
    ) -> Vec<Effect<T>> {
        let active = match self.selector {
            StreamSelector::All => event_number.as_raw(),
            StreamSelector::Stream(_) => stream_version.as_raw(),
        };

        if active <= self.last_ack {
            // Cursor regression: already acknowledged.
            return Vec::new();
        }
        if active > self.last_seen {
            warn!(
                subscription = %self.name,
                ack = active,
                last_seen = self.last_seen,
                "ignoring ack beyond the delivered window"
            );
            return Vec::new();
        }

        self.last_ack = active;
        let mut effects = vec![Effect::PersistCursor { event_number, stream_version }];

        match self.state {
            SubscriptionState::Subscribed { overflowing: true }
                if self.in_flight() < self.max_in_flight =>
            {
                effects.extend(self.flush_buffer());
            }
            SubscriptionState::CatchingUp => {
                if let Some(cursor) = self.deferred_caught_up {
                    if cursor <= self.last_ack {
                        effects.extend(self.complete_catch_up(cursor));
                    }
                }
            }
            _ => {}
        }
        effects
    }

    /// `CatchingUp → Subscribed`: report the boundary cursor, then flush
    /// whatever live events accumulated past it.
    fn complete_catch_up(&mut self, cursor: u64) -> Vec<Effect<T>> {
        self.deferred_caught_up = None;
        self.last_seen = self.last_seen.max(cursor);
        self.state = SubscriptionState::Subscribed { overflowing: false };

        let mut effects = vec![Effect::NotifyCaughtUp(cursor)];
        effects.extend(self.flush_buffer());
        effects.extend(self.check_buffer_limit());
        effects
    }

    /// Delivers buffered events up to the in-flight window.
    ///
    /// Events at or below `last_seen` are duplicates of the catch-up
    /// delivery (or live events below a beyond-tail start position) and
    /// are discarded. Updates the overflow flag afterwards.
    fn flush_buffer(&mut self) -> Vec<Effect<T>> {
        let mut ready = Vec::new();
        while let Some(event) = self.buffer.front() {
            let cursor = self.selector.cursor_of(event);
            if cursor <= self.last_seen {
                self.buffer.pop_front();
                continue;
            }
            if self.in_flight() >= self.max_in_flight {
                break;
            }
            let event = self.buffer.pop_front().expect("front checked above");
            self.last_seen = cursor;
            ready.push(event);
        }

        if let SubscriptionState::Subscribed { .. } = self.state {
            self.state = SubscriptionState::Subscribed {
                overflowing: self.in_flight() >= self.max_in_flight || !self.buffer.is_empty(),
            };
        }

        if ready.is_empty() {
            Vec::new()
        } else {
            vec![Effect::Deliver(self.map_batch(&ready))]
        }
    }

    fn check_buffer_limit(&mut self) -> Vec<Effect<T>> {
        if self.buffer.len() <= self.buffer_limit {
            return Vec::new();
        }
        error!(
            subscription = %self.name,
            buffered = self.buffer.len(),
            limit = self.buffer_limit,
            "pending buffer exceeded its bound"
        );
        self.state = SubscriptionState::Unsubscribed;
        vec![Effect::Terminate(DropReason::BufferOverflow)]
    }

    /// Current state (for the task loop and tests).
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Cursor of the newest delivered event.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Cursor of the newest acknowledged event.
    pub fn last_ack(&self) -> u64 {
        self.last_ack
    }

    /// Number of events parked in the pending buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The subscription name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The selector this subscription reads.
    pub fn selector(&self) -> &StreamSelector {
        &self.selector
    }
}

// =============================================================================
// The Subscription Task
// =============================================================================

/// Everything the task loop owns besides the machine itself.
pub(crate) struct SubscriptionRuntime<S, T> {
    pub store: S,
    pub row: SubscriptionRow,
    pub options: SubscriptionOptions,
    /// Inbox sender handed to the catch-up worker (and nobody else, so a
    /// dropped consumer handle closes the inbox once the worker is done).
    pub worker_inbox: mpsc::Sender<SubscriptionMessage>,
    pub inbox_rx: mpsc::Receiver<SubscriptionMessage>,
    pub notify_rx: mpsc::Receiver<Vec<RecordedEvent>>,
    pub subscriber_tx: mpsc::Sender<SubscriberMessage<T>>,
    pub lock: AdvisoryLockGuard,
    pub registration: BusRegistration,
}

/// Runs one subscription to completion.
///
/// Messages are processed strictly sequentially; each is applied to the
/// machine and its effects performed before the next is taken, so the
/// machine is never observed mid-transition.
pub(crate) async fn run_subscription<S, T>(
    mut fsm: SubscriptionFsm<T>,
    runtime: SubscriptionRuntime<S, T>,
) where
    S: EventStore,
    T: Send + 'static,
{
    let SubscriptionRuntime {
        store,
        row,
        options,
        worker_inbox,
        mut inbox_rx,
        mut notify_rx,
        subscriber_tx,
        lock,
        registration,
    } = runtime;

    let (ack_tx, ack_rx) = watch::channel(fsm.last_ack());
    let mut worker_inbox = Some(worker_inbox);
    let mut worker: Option<tokio::task::JoinHandle<()>> = None;

    debug!(subscription = %fsm.name(), selector = %fsm.selector(), "subscription task started");

    'run: loop {
        // Acks are preferred over fresh notifications so a stalled window
        // drains before more events are buffered.
        let message = tokio::select! {
            biased;
            message = inbox_rx.recv() => match message {
                Some(message) => message,
                None => {
                    // Consumer handle dropped without unsubscribing.
                    warn!(subscription = %fsm.name(), "subscriber gone; terminating");
                    break 'run;
                }
            },
            // The consumer handle owns the receiving end; its drop must
            // release the lock even while the catch-up worker still holds
            // an inbox sender.
            _ = subscriber_tx.closed() => {
                warn!(subscription = %fsm.name(), "subscriber gone; terminating");
                break 'run;
            },
            batch = notify_rx.recv() => match batch {
                Some(events) => SubscriptionMessage::Notify(events),
                None => {
                    // The bus evicted our queue: we fell too far behind.
                    error!(
                        subscription = %fsm.name(),
                        "notification queue overflowed; terminating"
                    );
                    let _ = subscriber_tx.try_send(SubscriberMessage::Dropped(DropReason::BufferOverflow));
                    break 'run;
                }
            },
        };

        if let SubscriptionMessage::CatchUpFailed(ref err) = message {
            error!(subscription = %fsm.name(), error = %err, "catch-up read failed");
        }

        for effect in fsm.handle(message) {
            match effect {
                Effect::Deliver(batch) => {
                    if subscriber_tx
                        .send(SubscriberMessage::Events(batch))
                        .await
                        .is_err()
                    {
                        warn!(subscription = %fsm.name(), "subscriber channel closed mid-delivery");
                        break 'run;
                    }
                }

                Effect::NotifyCaughtUp(cursor) => {
                    debug!(subscription = %fsm.name(), cursor, "caught up");
                    if subscriber_tx
                        .send(SubscriberMessage::CaughtUp(cursor))
                        .await
                        .is_err()
                    {
                        break 'run;
                    }
                }

                Effect::PersistCursor { event_number, stream_version } => {
                    if let Err(err) = store
                        .update_subscription_cursor(
                            &row.stream_uuid,
                            &row.subscription_name,
                            event_number,
                            stream_version,
                        )
                        .await
                    {
                        error!(subscription = %fsm.name(), error = %err, "cursor persistence failed");
                        let _ = subscriber_tx
                            .try_send(SubscriberMessage::Dropped(DropReason::StorageFailure));
                        break 'run;
                    }
                    // Wake the catch-up worker for its next batch.
                    ack_tx.send_replace(fsm.last_ack());
                }

                Effect::StartCatchUp { from } => {
                    let batch_size = options.catchup_batch_size.min(options.max_in_flight).max(1);
                    if let Some(inbox) = worker_inbox.take() {
                        worker = Some(tokio::spawn(catchup::run_catch_up(
                            store.clone(),
                            fsm.selector().clone(),
                            from,
                            batch_size,
                            inbox,
                            ack_rx.clone(),
                        )));
                    }
                }

                Effect::DeleteRow => {
                    if let Err(err) = store
                        .delete_subscription(&row.stream_uuid, &row.subscription_name)
                        .await
                    {
                        error!(subscription = %fsm.name(), error = %err, "cursor deletion failed");
                    }
                }

                Effect::Terminate(reason) => {
                    debug!(subscription = %fsm.name(), ?reason, "subscription terminated");
                    let _ = subscriber_tx.try_send(SubscriberMessage::Dropped(reason));
                    break 'run;
                }
            }
        }
    }

    if let Some(worker) = worker {
        worker.abort();
    }
    // Dropping the guard releases the advisory lock; dropping the
    // registration detaches us from the bus.
    drop(lock);
    drop(registration);
}

// =============================================================================
// Consumer Handle
// =============================================================================

/// A live subscription, held by the consumer.
///
/// Receives [`SubscriberMessage`]s via [`next`](Subscription::next) (or the
/// `futures::Stream` impl) and sends acknowledgements back with
/// [`ack`](Subscription::ack). Dropping the handle without unsubscribing
/// keeps the cursor row: a later subscribe resumes from the last
/// acknowledged position.
pub struct Subscription<T = RecordedEvent> {
    name: String,
    selector: StreamSelector,
    inbox: mpsc::Sender<SubscriptionMessage>,
    receiver: mpsc::Receiver<SubscriberMessage<T>>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        name: String,
        selector: StreamSelector,
        inbox: mpsc::Sender<SubscriptionMessage>,
        receiver: mpsc::Receiver<SubscriberMessage<T>>,
    ) -> Self {
        Self { name, selector, inbox, receiver }
    }

    /// Receives the next message; `None` once the subscription has
    /// terminated and the terminal notice was consumed.
    pub async fn next(&mut self) -> Option<SubscriberMessage<T>> {
        self.receiver.recv().await
    }

    /// Acknowledges everything up to the given cursor pair.
    ///
    /// Intermediate events are acknowledged implicitly; acking only the
    /// last event of a batch is the efficient pattern. Stale acks are
    /// ignored by the state machine, so retrying is safe.
    pub async fn ack(&self, event_number: EventNumber, stream_version: StreamVersion) -> Result<()> {
        self.inbox
            .send(SubscriptionMessage::Ack { event_number, stream_version })
            .await
            .map_err(|_| Error::Closed("subscription task has terminated".to_string()))
    }

    /// Acknowledges a received event by its recorded positions.
    pub async fn ack_event(&self, event: &RecordedEvent) -> Result<()> {
        self.ack(event.event_number, event.stream_version).await
    }

    /// Stops the subscription and deletes its cursor row.
    ///
    /// Idempotent: unsubscribing an already-terminated subscription is a
    /// no-op.
    pub async fn unsubscribe(self) -> Result<()> {
        let _ = self.inbox.send(SubscriptionMessage::Unsubscribe).await;
        Ok(())
    }

    /// The subscription name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The selector this subscription reads.
    pub fn selector(&self) -> &StreamSelector {
        &self.selector
    }
}

impl<T> Stream for Subscription<T> {
    type Item = SubscriberMessage<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

// =============================================================================
// Tests
// =============================================================================
