//! Crate-level error types for routers and process instances.

use crate::store::StoreError;

/// Abnormal termination reason of a process instance.
///
/// A fault is fatal for the instance: the event being handled is neither
/// applied nor acknowledged, and the owning router stops with the fault to
/// prevent events from being skipped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InstanceFault {
    /// The process manager's event handler returned an error.
    #[error("event handler failed: {0}")]
    Handle(String),

    /// The dispatch error callback requested a stop.
    #[error("stopped by dispatch error handler: {0}")]
    DispatchStopped(String),

    /// The process state could not be serialized or the snapshot write
    /// failed.
    #[error("snapshot persistence failed: {0}")]
    Snapshot(String),

    /// The instance task panicked.
    #[error("instance task panicked: {0}")]
    Panicked(String),
}

/// Error returned when a router terminates abnormally or a handle
/// operation cannot be served.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    /// Creating the event store subscription failed.
    #[error("event store subscription failed: {0}")]
    Subscribe(StoreError),

    /// The event store subscription channel closed unexpectedly.
    ///
    /// Re-subscription is the caller's concern; the router surfaces the
    /// loss and terminates.
    #[error("subscription to the event store was lost")]
    SubscriptionLost,

    /// Confirming receipt of an event upstream failed.
    #[error("event acknowledgement failed: {0}")]
    Ack(StoreError),

    /// A monitored instance terminated abnormally.
    #[error("process instance {process_id} failed: {fault}")]
    InstanceFailed {
        /// Correlation key of the failed instance.
        process_id: String,
        /// The instance's termination reason.
        fault: InstanceFault,
    },

    /// The router task panicked.
    #[error("router task panicked: {0}")]
    Panicked(String),
}

/// Error returned when reading state through a handle fails.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    /// The instance task has exited, so its state can no longer be queried.
    #[error("process instance is no longer running")]
    InstanceGone,
}
