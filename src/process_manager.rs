//! The user-authored process-manager contract.
//!
//! A process manager is a long-lived, correlation-keyed workflow that
//! observes events and emits commands. User modules implement
//! [`ProcessManager`]: a pure classifier ([`interested_in`]) that routes
//! events to workflow instances, a pure decision function ([`handle`]) that
//! produces commands, a pure state fold ([`apply`]), and a dispatch-failure
//! callback ([`on_dispatch_error`]) that drives the retry/skip/stop policy.
//!
//! [`interested_in`]: ProcessManager::interested_in
//! [`handle`]: ProcessManager::handle
//! [`apply`]: ProcessManager::apply
//! [`on_dispatch_error`]: ProcessManager::on_dispatch_error

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::command::DispatchError;
use crate::event::RecordedEvent;

/// Routing decision for one event, returned by
/// [`ProcessManager::interested_in`].
///
/// A single decision may address one instance or several; the constructors
/// below accept either shape. An empty id list is treated as [`Ignore`]
/// by the router.
///
/// [`Ignore`]: Interest::Ignore
///
/// # Examples
///
/// ```
/// use sagaflow::Interest;
///
/// assert_eq!(Interest::start("t-1"), Interest::Start(vec!["t-1".into()]));
/// assert_eq!(
///     Interest::start_all(["a", "b"]),
///     Interest::Start(vec!["a".into(), "b".into()])
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// The event is not relevant to this process manager.
    Ignore,
    /// Start a new instance per id. Ids that already have a live instance
    /// are delegated to the existing one.
    Start(Vec<String>),
    /// Deliver to the named instances, starting any that are absent.
    Continue(Vec<String>),
    /// Stop the named instances (unknown ids are ignored) and advance
    /// without delegation.
    Stop(Vec<String>),
}

impl Interest {
    /// Start a single instance.
    pub fn start(id: impl Into<String>) -> Self {
        Interest::Start(vec![id.into()])
    }

    /// Start several instances from one event.
    pub fn start_all<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Interest::Start(ids.into_iter().map(Into::into).collect())
    }

    /// Continue a single instance.
    pub fn continue_with(id: impl Into<String>) -> Self {
        Interest::Continue(vec![id.into()])
    }

    /// Continue several instances.
    pub fn continue_all<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Interest::Continue(ids.into_iter().map(Into::into).collect())
    }

    /// Stop a single instance.
    pub fn stop(id: impl Into<String>) -> Self {
        Interest::Stop(vec![id.into()])
    }

    /// Stop several instances.
    pub fn stop_all<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Interest::Stop(ids.into_iter().map(Into::into).collect())
    }
}

/// How to skip a failed command, chosen by
/// [`ProcessManager::on_dispatch_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipBehaviour {
    /// Abandon the failed command and every command after it. The event is
    /// still applied, snapshotted, and acknowledged.
    DiscardPending,
    /// Abandon only the failed command and continue with the remainder.
    ContinuePending,
}

/// Response from [`ProcessManager::on_dispatch_error`], deciding how the
/// dispatch loop proceeds after a failure.
#[derive(Debug, Clone)]
pub enum ErrorAction<C> {
    /// Replace the remaining work (the failed command included) with
    /// `commands` and resume dispatching with the updated carry-over
    /// context.
    Continue {
        /// Commands that replace the failed command and its tail.
        commands: Vec<C>,
        /// Carry-over value passed to subsequent error callbacks.
        context: Value,
    },

    /// Re-attempt the failed command, then continue with the original
    /// tail. With a delay set, the instance sleeps first; the sleep is
    /// local to the instance and never stalls its router or siblings.
    Retry {
        /// Optional pause before the re-attempt.
        delay: Option<Duration>,
        /// Carry-over value passed to subsequent error callbacks.
        context: Value,
    },

    /// Abandon the failed command per the chosen [`SkipBehaviour`]. The
    /// event is still applied, snapshotted, and acknowledged.
    Skip(SkipBehaviour),

    /// Abort: the event is not applied and not acknowledged, and the
    /// instance terminates with the given reason.
    Stop(String),
}

/// Context handed to [`ProcessManager::on_dispatch_error`] after a command
/// dispatch fails.
pub struct FailureContext<'a, P: ProcessManager> {
    /// The commands that were still queued after the failed one.
    pub pending_commands: &'a [P::Command],
    /// The state as it *would* become once the current event is applied,
    /// so the callback decides with full knowledge of the prospective
    /// outcome.
    pub state: &'a P,
    /// The event whose commands are being dispatched.
    pub last_event: &'a RecordedEvent,
    /// Opaque value carried between successive callbacks for the same
    /// event (retry counters and the like). Starts as `Value::Null`.
    pub context: &'a Value,
}

/// A long-lived, correlation-keyed workflow driven by recorded events.
///
/// The implementing type itself is the process state; it is rebuilt from a
/// snapshot on restart, so it must round-trip through serde.
///
/// # Associated Types
///
/// - `Event`: the decoded event payload this module understands. Recorded
///   events whose payload does not deserialize into it are skipped for
///   forward compatibility.
/// - `Command`: the commands this module emits.
/// - `Error`: fatal decision error; returning it terminates the instance.
///
/// # Contract
///
/// - [`interested_in`](ProcessManager::interested_in) must be a pure
///   function of the event payload.
/// - [`handle`](ProcessManager::handle) must be a pure decision function:
///   no I/O, no side effects. It sees the state *before* the event is
///   applied.
/// - [`apply`](ProcessManager::apply) must be pure and total over events
///   the classifier routed to an instance.
/// - [`on_dispatch_error`](ProcessManager::on_dispatch_error) may log but
///   must not perform other side effects.
pub trait ProcessManager:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this process manager. Used as the durable subscription
    /// name, the registry key, and the snapshot key prefix.
    const NAME: &'static str;

    /// The decoded event payload this module reacts to.
    type Event: DeserializeOwned + Clone + Send + Sync + 'static;

    /// The commands this module emits.
    type Command: Clone + Send + Sync + 'static;

    /// Fatal decision error returned by [`handle`](ProcessManager::handle).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Classify an event: which instances (by correlation id) should see
    /// it, and whether they are being started, continued, or stopped.
    fn interested_in(event: &Self::Event) -> Interest;

    /// Decide which commands to emit in response to `event`, given the
    /// current state.
    ///
    /// Returning `Ok(vec![])` is a no-op. Returning `Err` terminates the
    /// instance (and its router) without acknowledging the event.
    fn handle(&self, event: &Self::Event) -> Result<Vec<Self::Command>, Self::Error>;

    /// Fold `event` into the state, producing the next state.
    fn apply(self, event: &Self::Event) -> Self;

    /// Decide how to proceed after a command dispatch fails.
    ///
    /// The default stops the instance with the dispatch error, which in
    /// turn stops the router; override to retry or skip.
    fn on_dispatch_error(
        error: &DispatchError,
        failed_command: &Self::Command,
        ctx: &FailureContext<'_, Self>,
    ) -> ErrorAction<Self::Command> {
        let _ = (failed_command, ctx);
        ErrorAction::Stop(error.to_string())
    }
}
