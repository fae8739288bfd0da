//! Shared event and snapshot types exchanged between the event store,
//! routers, and process instances. No I/O occurs here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An event as durably recorded in the global log.
///
/// Delivered to routers in batches by the event store subscription. The
/// `data` payload is opaque JSON at this layer; process-manager modules
/// decode it into their own event type (undecodable payloads are skipped
/// for forward compatibility).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// One-based position in the global log. Monotone across all streams.
    pub event_number: u64,
    /// Store-assigned event ID. Becomes the causation ID of any command
    /// produced while handling this event.
    pub event_id: Uuid,
    /// Correlation ID carried over from the command that produced the event.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    /// The source stream (aggregate) identity.
    pub stream_id: String,
    /// One-based version within the source stream.
    pub stream_version: u64,
    /// Opaque event payload.
    pub data: Value,
    /// Opaque event metadata.
    pub metadata: Value,
}

/// A point-in-time snapshot of a process instance's state.
///
/// Written after each successfully handled unseen event and deleted when
/// the instance is stopped by its router. `source_version` records the
/// `event_number` of the last event folded into `data`, so a rehydrating
/// instance ignores events at or below it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Snapshot key: `"{process_manager_name}-{process_id}"`.
    pub source_id: String,
    /// Global `event_number` of the last event reflected in `data`.
    pub source_version: u64,
    /// Fully qualified name of the process-manager type that owns the state.
    pub source_type: String,
    /// Serialized process state.
    pub data: Value,
}

/// Where a new subscription begins reading the global log.
///
/// Only consulted the first time a named subscription is created; an
/// existing subscription always resumes from its last acknowledged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// The beginning of the log.
    #[default]
    Origin,
    /// The current end of the log; only events recorded after the
    /// subscription is established are delivered.
    Current,
    /// Resume after an explicit global event number.
    Position(u64),
}

/// Consistency guarantee a handler registers under.
///
/// `Strong` handlers participate in dispatch-side waits: a command
/// dispatcher configured for strong consistency blocks until every strong
/// handler has acknowledged the produced events. `Eventual` handlers are
/// tracked for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Dispatchers wait for this handler's acknowledgement.
    Strong,
    /// Tracked but never waited on.
    #[default]
    Eventual,
}
