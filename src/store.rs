//! Event store facade consumed by routers and process instances.
//!
//! The store itself is an external collaborator; this module defines the
//! narrow surface the runtime needs from it: a durable all-events
//! subscription, per-subscription acknowledgement, and snapshot
//! read/record/delete. Implementations are expected to be linearizable per
//! subscription handle for ack and subscribe.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::{RecordedEvent, SnapshotData, StartFrom};

/// Messages delivered on a subscription channel.
///
/// The store sends exactly one [`Subscribed`](SubscriptionMessage::Subscribed)
/// confirmation before any event batch.
#[derive(Debug)]
pub enum SubscriptionMessage {
    /// The subscription is established; event batches follow.
    Subscribed,
    /// A batch of recorded events in `event_number` order.
    Events(Vec<RecordedEvent>),
}

/// A live subscription to the global event log.
///
/// Dropping the subscription (or its receiver) cancels delivery; the
/// durable cursor named by `subscriber_name` survives and a later
/// subscription under the same name resumes after the last acknowledged
/// event.
#[derive(Debug)]
pub struct Subscription {
    /// The durable subscriber name this subscription was created under.
    pub subscriber_name: String,
    /// Delivery channel: one `Subscribed` confirmation, then event batches.
    pub receiver: mpsc::Receiver<SubscriptionMessage>,
}

/// Error returned by non-snapshot store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    /// No subscription exists under the given subscriber name.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
}

/// Error returned by snapshot operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
    /// No snapshot is recorded under the requested source ID. Benign: the
    /// reader proceeds with default state.
    #[error("snapshot not found")]
    NotFound,

    /// The store could not be reached.
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// The event store operations the runtime consumes.
///
/// Kept object-safe so routers and instances hold `Arc<dyn EventStore>`.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Create (or resume) a durable subscription to all streams.
    ///
    /// The returned channel first yields
    /// [`SubscriptionMessage::Subscribed`], then zero or more event
    /// batches. `from` applies only when no cursor exists yet under
    /// `subscriber_name`; an existing cursor always wins.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the subscription cannot be established.
    async fn subscribe_to_all(
        &self,
        subscriber_name: &str,
        from: StartFrom,
    ) -> Result<Subscription, StoreError>;

    /// Confirm receipt of `event` for the named subscription, advancing its
    /// durable cursor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownSubscription`] if no subscription
    /// exists under `subscriber_name`.
    async fn ack_event(
        &self,
        subscriber_name: &str,
        event: &RecordedEvent,
    ) -> Result<(), StoreError>;

    /// Read the latest snapshot recorded under `source_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::NotFound`] when no snapshot exists.
    async fn read_snapshot(&self, source_id: &str) -> Result<SnapshotData, SnapshotError>;

    /// Record a snapshot, replacing any previous one for its `source_id`.
    async fn record_snapshot(&self, snapshot: SnapshotData) -> Result<(), SnapshotError>;

    /// Delete the snapshot recorded under `source_id`, if any.
    async fn delete_snapshot(&self, source_id: &str) -> Result<(), SnapshotError>;
}
