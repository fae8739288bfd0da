//! Actor loop that owns one process-manager instance.
//!
//! Each instance is a tokio task servicing an `mpsc` mailbox. It
//! exclusively owns the process state for one correlation id: it rehydrates
//! from the latest snapshot, folds every unseen event through the user
//! module, dispatches the resulting commands under the module's failure
//! policy, snapshots the new state, and acknowledges the event back to its
//! router.
//!
//! Public API: [`InstanceHandle`] (cloneable async handle). Spawning is
//! crate-internal; instances only come into existence through a router's
//! classifier.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::command::{CommandDispatcher, DispatchContext};
use crate::error::{InstanceFault, StateError};
use crate::event::{RecordedEvent, SnapshotData};
use crate::process_manager::{ErrorAction, FailureContext, ProcessManager, SkipBehaviour};
use crate::router::RouterMessage;
use crate::store::{EventStore, SnapshotError};

/// Mailbox capacity per instance. Bounded so a slow instance backpressures
/// its router instead of buffering without limit.
const MAILBOX_CAPACITY: usize = 32;

/// Messages sent from routers (and handles) to the instance loop.
pub(crate) enum InstanceMessage<P: ProcessManager> {
    /// Handle one recorded event. The payload is pre-decoded by the router
    /// so classifier and handler see the same value.
    ProcessEvent {
        event: RecordedEvent,
        payload: P::Event,
    },

    /// Retrieve a clone of the current process state.
    GetState { reply: oneshot::Sender<P> },

    /// Lifecycle stop: delete the snapshot, then exit normally. Driven by
    /// the classifier's stop decision.
    Stop { reply: oneshot::Sender<()> },

    /// Graceful exit that keeps the snapshot, used when the router shuts
    /// down. The instance rehydrates on the next start.
    Shutdown,
}

/// Async handle to a running process instance.
///
/// Lightweight and cloneable; communicates with the instance task over a
/// bounded channel.
#[derive(Debug)]
pub struct InstanceHandle<P: ProcessManager> {
    process_id: String,
    /// Unique per spawn. A stopped-then-restarted correlation id gets a
    /// fresh ref, letting the router tell a stale down-notification from
    /// the live instance.
    ref_id: uuid::Uuid,
    sender: mpsc::Sender<InstanceMessage<P>>,
}

// Manual `Clone`: only the id and sender are cloned, so `P` itself need
// not be `Clone` for the handle (it is, but the bound would be misleading).
impl<P: ProcessManager> Clone for InstanceHandle<P> {
    fn clone(&self) -> Self {
        Self {
            process_id: self.process_id.clone(),
            ref_id: self.ref_id,
            sender: self.sender.clone(),
        }
    }
}

impl<P: ProcessManager> InstanceHandle<P> {
    /// The correlation id this instance serves.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// The spawn-unique reference of this instance.
    pub(crate) fn ref_id(&self) -> uuid::Uuid {
        self.ref_id
    }

    /// Read the current process state.
    ///
    /// Served by the instance task between events, so the returned state
    /// never reflects a half-processed event.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InstanceGone`] if the instance has exited.
    pub async fn process_state(&self) -> Result<P, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(InstanceMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::InstanceGone)?;
        rx.await.map_err(|_| StateError::InstanceGone)
    }

    /// Check whether the instance task is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue an event for processing. The instance acknowledges back to
    /// its router when done.
    pub(crate) async fn deliver(&self, event: RecordedEvent, payload: P::Event) {
        if self
            .sender
            .send(InstanceMessage::ProcessEvent { event, payload })
            .await
            .is_err()
        {
            // The instance exited; its down notification reaches the
            // router separately.
            tracing::warn!(
                process_id = %self.process_id,
                "event delivery to exited instance dropped"
            );
        }
    }

    /// Lifecycle stop: deletes the snapshot and exits normally. Any event
    /// already being processed completes first. Idempotent: stopping an
    /// already-exited instance is a no-op.
    pub(crate) async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(InstanceMessage::Stop { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Ask the instance to exit without deleting its snapshot.
    pub(crate) async fn shutdown(&self) {
        let _ = self.sender.send(InstanceMessage::Shutdown).await;
    }

    /// Resolves once the instance task has exited and its mailbox closed.
    pub(crate) async fn closed(&self) {
        self.sender.closed().await;
    }
}

/// State owned by the instance task.
struct InstanceRuntime<P: ProcessManager> {
    process_id: String,
    store: Arc<dyn EventStore>,
    dispatcher: Arc<dyn CommandDispatcher<P::Command>>,
    router: mpsc::Sender<RouterMessage<P>>,
    state: P,
    last_seen_event: Option<u64>,
}

/// Spawn the instance task, returning its handle and join handle.
///
/// The join handle resolves to `Ok(())` on a normal exit (lifecycle stop,
/// shutdown, or mailbox closure) and `Err(fault)` on abnormal termination.
pub(crate) fn spawn_instance<P: ProcessManager>(
    process_id: &str,
    store: Arc<dyn EventStore>,
    dispatcher: Arc<dyn CommandDispatcher<P::Command>>,
    router: mpsc::Sender<RouterMessage<P>>,
) -> (
    InstanceHandle<P>,
    tokio::task::JoinHandle<Result<(), InstanceFault>>,
) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let runtime = InstanceRuntime {
        process_id: process_id.to_string(),
        store,
        dispatcher,
        router,
        state: P::default(),
        last_seen_event: None,
    };
    let task = tokio::spawn(run_instance(runtime, rx));
    (
        InstanceHandle {
            process_id: process_id.to_string(),
            ref_id: uuid::Uuid::new_v4(),
            sender: tx,
        },
        task,
    )
}

/// The instance actor loop.
///
/// Rehydrates from the snapshot first; events queued in the mailbox while
/// the load is in flight are processed afterwards in arrival order.
async fn run_instance<P: ProcessManager>(
    mut rt: InstanceRuntime<P>,
    mut rx: mpsc::Receiver<InstanceMessage<P>>,
) -> Result<(), InstanceFault> {
    rt.load_snapshot().await;

    loop {
        let Some(msg) = rx.recv().await else {
            // All senders dropped.
            return Ok(());
        };
        match msg {
            InstanceMessage::ProcessEvent { event, payload } => {
                rt.process_event(event, payload).await?;
            }
            InstanceMessage::GetState { reply } => {
                let _ = reply.send(rt.state.clone());
            }
            InstanceMessage::Stop { reply } => {
                if let Err(error) = rt.store.delete_snapshot(&rt.source_id()).await {
                    tracing::warn!(
                        process_manager = P::NAME,
                        process_id = %rt.process_id,
                        %error,
                        "snapshot delete on stop failed"
                    );
                }
                tracing::debug!(
                    process_manager = P::NAME,
                    process_id = %rt.process_id,
                    "instance stopped"
                );
                let _ = reply.send(());
                return Ok(());
            }
            InstanceMessage::Shutdown => return Ok(()),
        }
    }
}

impl<P: ProcessManager> InstanceRuntime<P> {
    /// Snapshot key for this instance.
    fn source_id(&self) -> String {
        format!("{}-{}", P::NAME, self.process_id)
    }

    /// Rehydrate state from the latest snapshot, if one exists.
    ///
    /// A missing snapshot is the normal first-start case; an undecodable
    /// one is treated as a miss, the same way a corrupt cache entry would
    /// be.
    async fn load_snapshot(&mut self) {
        match self.store.read_snapshot(&self.source_id()).await {
            Ok(snapshot) => match serde_json::from_value::<P>(snapshot.data) {
                Ok(state) => {
                    self.state = state;
                    self.last_seen_event = Some(snapshot.source_version);
                    tracing::debug!(
                        process_manager = P::NAME,
                        process_id = %self.process_id,
                        source_version = snapshot.source_version,
                        "rehydrated from snapshot"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        process_manager = P::NAME,
                        process_id = %self.process_id,
                        %error,
                        "failed to deserialize snapshot; starting from default state"
                    );
                }
            },
            Err(SnapshotError::NotFound) => {}
            Err(error) => {
                tracing::warn!(
                    process_manager = P::NAME,
                    process_id = %self.process_id,
                    %error,
                    "snapshot read failed; starting from default state"
                );
            }
        }
    }

    /// Handle one delegated event end to end.
    async fn process_event(
        &mut self,
        event: RecordedEvent,
        payload: P::Event,
    ) -> Result<(), InstanceFault> {
        // Already folded into a snapshot on a previous run: acknowledge
        // without re-invoking the user module.
        if self.last_seen_event.is_some_and(|n| event.event_number <= n) {
            tracing::debug!(
                process_manager = P::NAME,
                process_id = %self.process_id,
                event_number = event.event_number,
                "event already seen, acknowledging"
            );
            self.ack(&event).await;
            return Ok(());
        }

        let commands = self
            .state
            .handle(&payload)
            .map_err(|e| InstanceFault::Handle(e.to_string()))?;

        // The prospective post-event state: committed on success and shown
        // to the error callback so it decides with knowledge of what the
        // state would become.
        let next_state = self.state.clone().apply(&payload);

        self.dispatch_pending(commands, &event, &next_state).await?;

        self.state = next_state;
        self.last_seen_event = Some(event.event_number);
        self.persist_snapshot(event.event_number).await?;
        self.ack(&event).await;

        tracing::debug!(
            process_manager = P::NAME,
            process_id = %self.process_id,
            event_number = event.event_number,
            "event processed"
        );
        Ok(())
    }

    /// Dispatch commands in order, applying the module's failure policy.
    ///
    /// Returns `Ok(())` when dispatching finished (possibly with skipped
    /// commands), `Err` when the policy aborted the event.
    async fn dispatch_pending(
        &self,
        commands: Vec<P::Command>,
        event: &RecordedEvent,
        next_state: &P,
    ) -> Result<(), InstanceFault> {
        let mut ctx = DispatchContext::default().with_causation_id(event.event_id);
        if let Some(correlation_id) = &event.correlation_id {
            ctx = ctx.with_correlation_id(correlation_id.clone());
        }

        let mut pending: VecDeque<P::Command> = commands.into();
        let mut carry = Value::Null;

        while let Some(command) = pending.pop_front() {
            loop {
                match self.dispatcher.dispatch(command.clone(), ctx.clone()).await {
                    Ok(()) => break,
                    Err(error) => {
                        tracing::debug!(
                            process_manager = P::NAME,
                            process_id = %self.process_id,
                            event_number = event.event_number,
                            %error,
                            "command dispatch failed"
                        );
                        let action = {
                            let failure = FailureContext {
                                pending_commands: pending.make_contiguous(),
                                state: next_state,
                                last_event: event,
                                context: &carry,
                            };
                            P::on_dispatch_error(&error, &command, &failure)
                        };
                        match action {
                            ErrorAction::Retry { delay, context } => {
                                carry = context;
                                if let Some(delay) = delay {
                                    // Instance-local sleep: the router and
                                    // sibling instances keep running.
                                    tokio::time::sleep(delay).await;
                                }
                            }
                            ErrorAction::Continue { commands, context } => {
                                pending = commands.into();
                                carry = context;
                                break;
                            }
                            ErrorAction::Skip(SkipBehaviour::DiscardPending) => {
                                pending.clear();
                                break;
                            }
                            ErrorAction::Skip(SkipBehaviour::ContinuePending) => break,
                            ErrorAction::Stop(reason) => {
                                return Err(InstanceFault::DispatchStopped(reason));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist the current state as a snapshot at `source_version`.
    async fn persist_snapshot(&self, source_version: u64) -> Result<(), InstanceFault> {
        let data = serde_json::to_value(&self.state)
            .map_err(|e| InstanceFault::Snapshot(e.to_string()))?;
        let snapshot = SnapshotData {
            source_id: self.source_id(),
            source_version,
            source_type: std::any::type_name::<P>().to_string(),
            data,
        };
        self.store
            .record_snapshot(snapshot)
            .await
            .map_err(|e| InstanceFault::Snapshot(e.to_string()))
    }

    /// Acknowledge `event` back to the router. A closed router mailbox
    /// means the router already terminated; the ack is moot.
    async fn ack(&self, event: &RecordedEvent) {
        let _ = self
            .router
            .send(RouterMessage::Ack {
                event_number: event.event_number,
                process_id: self.process_id.clone(),
            })
            .await;
    }
}
