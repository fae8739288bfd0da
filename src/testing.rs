//! Shared test fixtures: an in-memory event store, a scriptable command
//! dispatcher, and canned process-manager modules.
//!
//! The in-memory store keeps a durable ack cursor per subscriber so
//! restart tests observe real re-delivery of unacknowledged events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

use crate::command::{CommandDispatcher, DispatchContext, DispatchError};
use crate::event::{RecordedEvent, SnapshotData, StartFrom};
use crate::store::{
    EventStore, SnapshotError, StoreError, Subscription, SubscriptionMessage,
};

/// In-memory event store with catch-up + live delivery.
pub(crate) struct InMemoryEventStore {
    inner: StdMutex<Inner>,
}

#[derive(Default)]
struct Inner {
    events: Vec<RecordedEvent>,
    subscribers: HashMap<String, SubscriberState>,
    snapshots: HashMap<String, SnapshotData>,
}

#[derive(Default)]
struct SubscriberState {
    last_acked: Option<u64>,
    history: Vec<u64>,
    live: Option<mpsc::Sender<SubscriptionMessage>>,
}

impl InMemoryEventStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: StdMutex::new(Inner::default()),
        }
    }

    /// Append an event to the log and push it to live subscribers.
    /// Event numbers are one-based and global; stream versions are
    /// one-based per stream.
    pub(crate) fn append_event(&self, stream_id: &str, data: Value) -> RecordedEvent {
        // Deliver while holding the lock so live pushes can never overtake
        // a concurrent catch-up batch.
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let event_number = inner.events.len() as u64 + 1;
        let stream_version = inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .count() as u64
            + 1;
        let event = RecordedEvent {
            event_number,
            event_id: Uuid::new_v4(),
            correlation_id: Some(format!("corr-{event_number}")),
            stream_id: stream_id.to_string(),
            stream_version,
            data,
            metadata: Value::Null,
        };
        inner.events.push(event.clone());
        for state in inner.subscribers.values() {
            if let Some(tx) = &state.live {
                let _ = tx.try_send(SubscriptionMessage::Events(vec![event.clone()]));
            }
        }
        event
    }

    pub(crate) fn snapshot(&self, source_id: &str) -> Option<SnapshotData> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .snapshots
            .get(source_id)
            .cloned()
    }

    pub(crate) fn put_snapshot(&self, snapshot: SnapshotData) {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .snapshots
            .insert(snapshot.source_id.clone(), snapshot);
    }

    /// Highest event number the named subscriber has acknowledged.
    pub(crate) fn last_acked(&self, subscriber_name: &str) -> Option<u64> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .subscribers
            .get(subscriber_name)
            .and_then(|s| s.last_acked)
    }

    /// Every acknowledgement the named subscriber has made, in order.
    pub(crate) fn ack_history(&self, subscriber_name: &str) -> Vec<u64> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .subscribers
            .get(subscriber_name)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// Drop the live feed for a subscriber, simulating a lost
    /// subscription. The durable cursor is untouched.
    pub(crate) fn disconnect(&self, subscriber_name: &str) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(state) = inner.subscribers.get_mut(subscriber_name) {
            state.live = None;
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn subscribe_to_all(
        &self,
        subscriber_name: &str,
        from: StartFrom,
    ) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(256);
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let current_end = inner.events.last().map(|e| e.event_number);
        let state = inner
            .subscribers
            .entry(subscriber_name.to_string())
            .or_default();
        // An existing cursor always wins over the requested start.
        let resume_after = state.last_acked.or(match from {
            StartFrom::Origin => None,
            StartFrom::Current => current_end,
            StartFrom::Position(n) => Some(n),
        });
        state.live = Some(tx.clone());
        let replay: Vec<_> = inner
            .events
            .iter()
            .filter(|e| resume_after.is_none_or(|n| e.event_number > n))
            .cloned()
            .collect();

        let _ = tx.try_send(SubscriptionMessage::Subscribed);
        if !replay.is_empty() {
            let _ = tx.try_send(SubscriptionMessage::Events(replay));
        }
        Ok(Subscription {
            subscriber_name: subscriber_name.to_string(),
            receiver: rx,
        })
    }

    async fn ack_event(
        &self,
        subscriber_name: &str,
        event: &RecordedEvent,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .subscribers
            .get_mut(subscriber_name)
            .ok_or_else(|| StoreError::UnknownSubscription(subscriber_name.to_string()))?;
        state.last_acked = Some(
            state
                .last_acked
                .map_or(event.event_number, |n| n.max(event.event_number)),
        );
        state.history.push(event.event_number);
        Ok(())
    }

    async fn read_snapshot(&self, source_id: &str) -> Result<SnapshotData, SnapshotError> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .snapshots
            .get(source_id)
            .cloned()
            .ok_or(SnapshotError::NotFound)
    }

    async fn record_snapshot(&self, snapshot: SnapshotData) -> Result<(), SnapshotError> {
        self.put_snapshot(snapshot);
        Ok(())
    }

    async fn delete_snapshot(&self, source_id: &str) -> Result<(), SnapshotError> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .snapshots
            .remove(source_id);
        Ok(())
    }
}

/// Dispatcher that records every attempt and can be scripted to fail or
/// block.
pub(crate) struct RecordingDispatcher<C> {
    attempts: StdMutex<Vec<(C, DispatchContext)>>,
    failures: StdMutex<VecDeque<DispatchError>>,
    gate: StdMutex<Option<Arc<Semaphore>>>,
}

impl<C> RecordingDispatcher<C> {
    pub(crate) fn new() -> Self {
        Self {
            attempts: StdMutex::new(Vec::new()),
            failures: StdMutex::new(VecDeque::new()),
            gate: StdMutex::new(None),
        }
    }

    /// Every dispatch attempt so far, in order.
    pub(crate) fn attempts(&self) -> Vec<(C, DispatchContext)>
    where
        C: Clone,
    {
        self.attempts.lock().expect("dispatcher lock poisoned").clone()
    }

    /// Fail the next attempt with `error` (queued; call repeatedly to
    /// fail several attempts).
    pub(crate) fn fail_next(&self, error: DispatchError) {
        self.failures
            .lock()
            .expect("dispatcher lock poisoned")
            .push_back(error);
    }

    /// Gate dispatches behind a semaphore with `permits` initial permits.
    /// Returns the semaphore so tests can release blocked dispatches.
    pub(crate) fn gate(&self, permits: usize) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(permits));
        *self.gate.lock().expect("dispatcher lock poisoned") = Some(Arc::clone(&semaphore));
        semaphore
    }
}

#[async_trait]
impl<C: Clone + Send + Sync + 'static> CommandDispatcher<C> for RecordingDispatcher<C> {
    async fn dispatch(&self, command: C, ctx: DispatchContext) -> Result<(), DispatchError> {
        let gate = self.gate.lock().expect("dispatcher lock poisoned").clone();
        if let Some(semaphore) = gate {
            let permit = semaphore
                .acquire()
                .await
                .map_err(|_| DispatchError::Unavailable("gate closed".to_string()))?;
            permit.forget();
        }
        self.attempts
            .lock()
            .expect("dispatcher lock poisoned")
            .push((command, ctx));
        if let Some(error) = self
            .failures
            .lock()
            .expect("dispatcher lock poisoned")
            .pop_front()
        {
            return Err(error);
        }
        Ok(())
    }
}

/// A start/continue/stop lifecycle module: one workflow per enrollment id.
pub(crate) mod lifecycle {
    use serde::{Deserialize, Serialize};

    use crate::process_manager::{Interest, ProcessManager};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Enrollment {
        pub started: bool,
        pub progress: Vec<u64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) enum EnrollmentEvent {
        Started { id: String },
        Progressed { id: String, index: u64 },
        Stopped { id: String },
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum EnrollmentCommand {
        RecordProgress { id: String, index: u64 },
    }

    #[derive(Debug, thiserror::Error)]
    #[error("enrollment decision failed")]
    pub(crate) struct EnrollmentError;

    impl ProcessManager for Enrollment {
        const NAME: &'static str = "enrollment";
        type Event = EnrollmentEvent;
        type Command = EnrollmentCommand;
        type Error = EnrollmentError;

        fn interested_in(event: &EnrollmentEvent) -> Interest {
            match event {
                EnrollmentEvent::Started { id } => Interest::start(id.clone()),
                EnrollmentEvent::Progressed { id, .. } => Interest::continue_with(id.clone()),
                EnrollmentEvent::Stopped { id } => Interest::stop(id.clone()),
            }
        }

        fn handle(&self, event: &EnrollmentEvent) -> Result<Vec<EnrollmentCommand>, EnrollmentError> {
            match event {
                EnrollmentEvent::Progressed { id, index } => {
                    Ok(vec![EnrollmentCommand::RecordProgress {
                        id: id.clone(),
                        index: *index,
                    }])
                }
                _ => Ok(vec![]),
            }
        }

        fn apply(mut self, event: &EnrollmentEvent) -> Self {
            match event {
                EnrollmentEvent::Started { .. } => self.started = true,
                EnrollmentEvent::Progressed { index, .. } => self.progress.push(*index),
                EnrollmentEvent::Stopped { .. } => {}
            }
            self
        }
    }
}

/// A module whose events address several instances at once.
pub(crate) mod fanout {
    use serde::{Deserialize, Serialize};

    use crate::process_manager::{Interest, ProcessManager};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Fanout {
        pub seen: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) enum FanoutEvent {
        Opened { ids: Vec<String> },
        Noted { id: String },
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum FanoutCommand {
        Announce,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("fanout decision failed")]
    pub(crate) struct FanoutError;

    impl ProcessManager for Fanout {
        const NAME: &'static str = "fanout";
        type Event = FanoutEvent;
        type Command = FanoutCommand;
        type Error = FanoutError;

        fn interested_in(event: &FanoutEvent) -> Interest {
            match event {
                FanoutEvent::Opened { ids } => Interest::start_all(ids.clone()),
                FanoutEvent::Noted { id } => Interest::continue_with(id.clone()),
            }
        }

        fn handle(&self, event: &FanoutEvent) -> Result<Vec<FanoutCommand>, FanoutError> {
            match event {
                FanoutEvent::Opened { .. } => Ok(vec![FanoutCommand::Announce]),
                FanoutEvent::Noted { .. } => Ok(vec![]),
            }
        }

        fn apply(mut self, _event: &FanoutEvent) -> Self {
            self.seen += 1;
            self
        }
    }
}

/// A module whose dispatch-failure policy is scripted by the event
/// payload, covering every [`ErrorAction`](crate::ErrorAction) branch.
pub(crate) mod scripted {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};

    use crate::command::DispatchError;
    use crate::process_manager::{
        ErrorAction, FailureContext, Interest, ProcessManager, SkipBehaviour,
    };

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) enum ErrorPolicy {
        #[default]
        None,
        Retry {
            delay_ms: u64,
        },
        SkipDiscard,
        SkipContinue,
        StopFatal,
        ReplaceWith(Vec<String>),
        FailHandle,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Scripted {
        pub handled_events: u64,
        pub policy: Option<ErrorPolicy>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) enum ScriptedEvent {
        Run {
            id: String,
            commands: Vec<String>,
            policy: ErrorPolicy,
        },
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct ScriptedCommand(pub String);

    #[derive(Debug, thiserror::Error)]
    #[error("scripted handle failure")]
    pub(crate) struct ScriptedError;

    impl ProcessManager for Scripted {
        const NAME: &'static str = "scripted";
        type Event = ScriptedEvent;
        type Command = ScriptedCommand;
        type Error = ScriptedError;

        fn interested_in(event: &ScriptedEvent) -> Interest {
            let ScriptedEvent::Run { id, .. } = event;
            Interest::continue_with(id.clone())
        }

        fn handle(&self, event: &ScriptedEvent) -> Result<Vec<ScriptedCommand>, ScriptedError> {
            let ScriptedEvent::Run {
                commands, policy, ..
            } = event;
            if *policy == ErrorPolicy::FailHandle {
                return Err(ScriptedError);
            }
            Ok(commands.iter().cloned().map(ScriptedCommand).collect())
        }

        fn apply(mut self, event: &ScriptedEvent) -> Self {
            let ScriptedEvent::Run { policy, .. } = event;
            self.handled_events += 1;
            self.policy = Some(policy.clone());
            self
        }

        fn on_dispatch_error(
            error: &DispatchError,
            _failed_command: &ScriptedCommand,
            ctx: &FailureContext<'_, Self>,
        ) -> ErrorAction<ScriptedCommand> {
            match ctx.state.policy.as_ref().unwrap_or(&ErrorPolicy::None) {
                ErrorPolicy::Retry { delay_ms } => {
                    let attempts = ctx.context.as_u64().unwrap_or(0) + 1;
                    ErrorAction::Retry {
                        delay: Some(Duration::from_millis(*delay_ms)),
                        context: json!(attempts),
                    }
                }
                ErrorPolicy::SkipDiscard => ErrorAction::Skip(SkipBehaviour::DiscardPending),
                ErrorPolicy::SkipContinue => ErrorAction::Skip(SkipBehaviour::ContinuePending),
                ErrorPolicy::StopFatal => ErrorAction::Stop("fatal".to_string()),
                ErrorPolicy::ReplaceWith(commands) => ErrorAction::Continue {
                    commands: commands.iter().cloned().map(ScriptedCommand).collect(),
                    context: Value::Null,
                },
                ErrorPolicy::None | ErrorPolicy::FailHandle => {
                    ErrorAction::Stop(error.to_string())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscription_replays_from_origin_then_receives_live_events() {
        let store = InMemoryEventStore::new();
        store.append_event("s1", json!({"n": 1}));
        store.append_event("s1", json!({"n": 2}));

        let mut sub = store
            .subscribe_to_all("h1", StartFrom::Origin)
            .await
            .expect("subscribe should succeed");

        assert!(matches!(
            sub.receiver.recv().await,
            Some(SubscriptionMessage::Subscribed)
        ));
        match sub.receiver.recv().await {
            Some(SubscriptionMessage::Events(batch)) => {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch[0].event_number, 1);
                assert_eq!(batch[1].event_number, 2);
            }
            _ => panic!("expected the catch-up batch"),
        }

        store.append_event("s1", json!({"n": 3}));
        match sub.receiver.recv().await {
            Some(SubscriptionMessage::Events(batch)) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].event_number, 3);
            }
            _ => panic!("expected the live event"),
        }
    }

    #[tokio::test]
    async fn subscription_from_current_skips_history() {
        let store = InMemoryEventStore::new();
        store.append_event("s1", json!({"n": 1}));

        let mut sub = store
            .subscribe_to_all("h1", StartFrom::Current)
            .await
            .expect("subscribe should succeed");
        assert!(matches!(
            sub.receiver.recv().await,
            Some(SubscriptionMessage::Subscribed)
        ));

        store.append_event("s1", json!({"n": 2}));
        match sub.receiver.recv().await {
            Some(SubscriptionMessage::Events(batch)) => {
                assert_eq!(batch[0].event_number, 2, "event 1 must be skipped");
            }
            _ => panic!("expected the live event"),
        }
    }

    #[tokio::test]
    async fn resubscription_resumes_after_the_durable_cursor() {
        let store = InMemoryEventStore::new();
        let e1 = store.append_event("s1", json!({"n": 1}));
        store.append_event("s1", json!({"n": 2}));

        {
            let _sub = store
                .subscribe_to_all("h1", StartFrom::Origin)
                .await
                .expect("subscribe should succeed");
            store.ack_event("h1", &e1).await.expect("ack should succeed");
        }

        // Second subscription: event 1 is acked, so only event 2 replays,
        // regardless of the requested start position.
        let mut sub = store
            .subscribe_to_all("h1", StartFrom::Origin)
            .await
            .expect("resubscribe should succeed");
        assert!(matches!(
            sub.receiver.recv().await,
            Some(SubscriptionMessage::Subscribed)
        ));
        match sub.receiver.recv().await {
            Some(SubscriptionMessage::Events(batch)) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].event_number, 2);
            }
            _ => panic!("expected the resumed batch"),
        }
    }

    #[tokio::test]
    async fn ack_for_unknown_subscription_is_rejected() {
        let store = InMemoryEventStore::new();
        let event = store.append_event("s1", json!({}));
        let result = store.ack_event("nobody", &event).await;
        assert!(matches!(result, Err(StoreError::UnknownSubscription(_))));
    }

    #[tokio::test]
    async fn stream_versions_are_per_stream() {
        let store = InMemoryEventStore::new();
        let a1 = store.append_event("a", json!({}));
        let b1 = store.append_event("b", json!({}));
        let a2 = store.append_event("a", json!({}));

        assert_eq!((a1.event_number, a1.stream_version), (1, 1));
        assert_eq!((b1.event_number, b1.stream_version), (2, 1));
        assert_eq!((a2.event_number, a2.stream_version), (3, 2));
    }

    #[tokio::test]
    async fn snapshots_roundtrip_and_delete() {
        let store = InMemoryEventStore::new();
        let snapshot = SnapshotData {
            source_id: "pm-x".to_string(),
            source_version: 4,
            source_type: "test".to_string(),
            data: json!({"k": "v"}),
        };
        store
            .record_snapshot(snapshot)
            .await
            .expect("record should succeed");

        let loaded = store
            .read_snapshot("pm-x")
            .await
            .expect("read should succeed");
        assert_eq!(loaded.source_version, 4);

        store
            .delete_snapshot("pm-x")
            .await
            .expect("delete should succeed");
        assert!(matches!(
            store.read_snapshot("pm-x").await,
            Err(SnapshotError::NotFound)
        ));
    }
}
