//! Command dispatch seam between process instances and the rest of the
//! application.
//!
//! The runtime never routes a command to an aggregate itself; it hands each
//! command to a [`CommandDispatcher`] together with a [`DispatchContext`]
//! carrying causation and correlation metadata. Delivery is at-least-once:
//! the failure policy may re-dispatch a command, and a crash before the
//! event is acknowledged re-derives commands on replay.

use async_trait::async_trait;
use uuid::Uuid;

/// Cross-cutting metadata passed alongside a dispatched command.
///
/// The causation ID is the `event_id` of the event being handled; the
/// correlation ID is carried over from that event so an entire workflow can
/// be traced end to end.
///
/// # Examples
///
/// ```
/// use sagaflow::DispatchContext;
/// use uuid::Uuid;
///
/// let cause = Uuid::new_v4();
/// let ctx = DispatchContext::default()
///     .with_causation_id(cause)
///     .with_correlation_id("order-flow-7");
///
/// assert_eq!(ctx.causation_id, Some(cause));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("order-flow-7"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// `event_id` of the event that produced the command.
    pub causation_id: Option<Uuid>,
    /// Correlation ID linking the command to its originating workflow.
    pub correlation_id: Option<String>,
}

impl DispatchContext {
    /// Set the causation ID.
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Error returned by a [`CommandDispatcher`] when a command cannot be
/// delivered or is rejected by its target.
///
/// Dispatch failures are not fatal by themselves: the owning process
/// manager's error callback decides whether to retry, skip, replace the
/// remaining commands, or stop the instance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The target aggregate rejected the command.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// The dispatch target could not be reached.
    #[error("dispatch target unavailable: {0}")]
    Unavailable(String),

    /// The dispatch did not complete in time.
    #[error("dispatch timed out")]
    Timeout,
}

/// Routes commands produced by process managers to their target aggregates.
///
/// Implementations are application-owned; the runtime treats dispatch as an
/// opaque async operation that either succeeds or fails with a
/// [`DispatchError`]. Implementations must tolerate re-dispatch of the same
/// command (at-least-once delivery).
#[async_trait]
pub trait CommandDispatcher<C>: Send + Sync + 'static {
    /// Dispatch a single command.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to route.
    /// * `ctx` - Causation and correlation metadata for the command.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if the command cannot be delivered or is
    /// rejected; the caller applies the owning module's failure policy.
    async fn dispatch(&self, command: C, ctx: DispatchContext) -> Result<(), DispatchError>;
}
