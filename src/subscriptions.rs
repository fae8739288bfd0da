//! Process-wide registry of event-handler progress.
//!
//! Routers (and any other event handlers) register here under a name and a
//! [`Consistency`] level, then acknowledge each event they finish. The
//! registry answers "has every strong handler processed stream S up to
//! version V?" and parks waiters until the answer becomes yes, which is how
//! command dispatchers implement read-your-writes ("strong") consistency.
//!
//! All mutation goes through the single internal mutex; waiters are parked
//! on a [`Notify`] and re-check the predicate on every acknowledgement.

use std::collections::HashMap;
use std::pin::pin;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::event::{Consistency, RecordedEvent};

/// Opaque identity of a registered handler's holder (one per
/// registration), used to exclude a waiter's own registration from its
/// wait quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(Uuid);

/// Options narrowing a [`Subscriptions::handled`] or
/// [`Subscriptions::wait_for`] quorum.
#[derive(Debug, Clone, Default)]
pub struct WaitOpts {
    /// Holders to leave out of the quorum (typically the caller's own
    /// registration).
    pub exclude: Vec<HolderId>,
    /// When set, only the named handlers participate; names that are not
    /// registered are vacuously satisfied.
    pub handlers: Option<Vec<String>>,
}

impl WaitOpts {
    /// Exclude a holder from the quorum.
    pub fn exclude(mut self, holder: HolderId) -> Self {
        self.exclude.push(holder);
        self
    }

    /// Restrict the quorum to the named handlers.
    pub fn only_handlers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handlers = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// Error returned when [`Subscriptions::wait_for`] times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out waiting for handlers to reach the requested version")]
pub struct WaitTimeout;

/// Per-stream acknowledgement state for one registration.
#[derive(Debug, Clone)]
struct StreamAck {
    /// Highest acknowledged `stream_version` ("at least up to" semantics).
    version: u64,
    /// Refreshed on every ack; stale entries are removed by
    /// [`Subscriptions::purge_expired_streams`].
    updated_at: Instant,
}

/// One (handler name, consistency) registration.
#[derive(Debug, Clone)]
struct Registration {
    holder: HolderId,
    streams: HashMap<String, StreamAck>,
    /// Highest acknowledged global event number. Survives stream purges.
    last_event_number: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    /// A handler may hold one registration per consistency level.
    registrations: HashMap<(String, Consistency), Registration>,
}

/// The registry. Shared across the application via `Arc`.
#[derive(Debug, Default)]
pub struct Subscriptions {
    inner: std::sync::Mutex<Inner>,
    /// Woken on every ack (and reset) so parked waiters re-check.
    notify: Notify,
}

impl Subscriptions {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a consistency level, returning the holder
    /// identity for this registration.
    ///
    /// Re-registering an existing (name, consistency) pair issues a fresh
    /// holder identity but keeps the accumulated acknowledgements, so a
    /// restarted handler does not forget its progress.
    pub fn register(&self, handler_name: &str, consistency: Consistency) -> HolderId {
        let holder = HolderId(Uuid::new_v4());
        let mut inner = self.inner.lock().expect("subscriptions lock poisoned");
        inner
            .registrations
            .entry((handler_name.to_string(), consistency))
            .and_modify(|reg| reg.holder = holder)
            .or_insert_with(|| Registration {
                holder,
                streams: HashMap::new(),
                last_event_number: None,
            });
        tracing::debug!(handler = handler_name, ?consistency, "handler registered");
        holder
    }

    /// Record that `handler_name` (at the given consistency level) has
    /// processed `event`.
    ///
    /// Advances the per-stream version and the global event number
    /// monotonically and refreshes the stream's last-updated timestamp.
    /// Acks for an unregistered pair are dropped with a warning.
    pub fn ack_event(&self, handler_name: &str, consistency: Consistency, event: &RecordedEvent) {
        {
            let mut inner = self.inner.lock().expect("subscriptions lock poisoned");
            let Some(reg) = inner
                .registrations
                .get_mut(&(handler_name.to_string(), consistency))
            else {
                tracing::warn!(
                    handler = handler_name,
                    ?consistency,
                    "ack for unregistered handler dropped"
                );
                return;
            };

            let entry = reg
                .streams
                .entry(event.stream_id.clone())
                .or_insert(StreamAck {
                    version: 0,
                    updated_at: Instant::now(),
                });
            entry.version = entry.version.max(event.stream_version);
            entry.updated_at = Instant::now();
            reg.last_event_number = Some(
                reg.last_event_number
                    .map_or(event.event_number, |n| n.max(event.event_number)),
            );
        }
        self.notify.notify_waiters();
    }

    /// Whether every participating strong handler has acknowledged
    /// `stream_id` up to at least `version`.
    ///
    /// Participating means: registered as [`Consistency::Strong`], holder
    /// not listed in `opts.exclude`, and (when `opts.handlers` is set)
    /// named in that subset. With no participating handlers the answer is
    /// vacuously `true`.
    pub fn handled(&self, stream_id: &str, version: u64, opts: &WaitOpts) -> bool {
        let inner = self.inner.lock().expect("subscriptions lock poisoned");
        inner
            .registrations
            .iter()
            .filter(|((name, consistency), reg)| {
                *consistency == Consistency::Strong
                    && !opts.exclude.contains(&reg.holder)
                    && opts
                        .handlers
                        .as_ref()
                        .is_none_or(|subset| subset.iter().any(|h| h == name))
            })
            .all(|(_, reg)| {
                reg.streams
                    .get(stream_id)
                    .is_some_and(|ack| ack.version >= version)
            })
    }

    /// Block until [`handled`](Subscriptions::handled) holds for
    /// (`stream_id`, `version`) or the timeout fires.
    ///
    /// Returns immediately when the predicate already holds (in
    /// particular, when no strong handlers are registered).
    ///
    /// # Errors
    ///
    /// Returns [`WaitTimeout`] on expiry; registry state is unchanged.
    pub async fn wait_for(
        &self,
        stream_id: &str,
        version: u64,
        opts: &WaitOpts,
        timeout: Duration,
    ) -> Result<(), WaitTimeout> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so an ack between the
            // check and the await cannot be missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if self.handled(stream_id, version, opts) {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(WaitTimeout);
            }
        }
    }

    /// All strong registrations as (handler name, holder) pairs.
    pub fn all(&self) -> Vec<(String, HolderId)> {
        let inner = self.inner.lock().expect("subscriptions lock poisoned");
        inner
            .registrations
            .iter()
            .filter(|((_, consistency), _)| *consistency == Consistency::Strong)
            .map(|((name, _), reg)| (name.clone(), reg.holder))
            .collect()
    }

    /// Clear all registrations. Test hook.
    pub fn reset(&self) {
        self.inner
            .lock()
            .expect("subscriptions lock poisoned")
            .registrations
            .clear();
        self.notify.notify_waiters();
    }

    /// Remove per-stream acknowledgements not refreshed within `ttl`.
    ///
    /// Global event-number acknowledgements are unaffected.
    pub fn purge_expired_streams(&self, ttl: Duration) {
        let mut inner = self.inner.lock().expect("subscriptions lock poisoned");
        for reg in inner.registrations.values_mut() {
            reg.streams.retain(|_, ack| ack.updated_at.elapsed() < ttl);
        }
    }
}
