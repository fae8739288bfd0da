//! The process router: one actor per process-manager definition.
//!
//! The router owns the durable all-events subscription for its definition.
//! Incoming batches are appended to a FIFO of pending events; the router
//! drains that queue strictly head-first, consulting the user module's
//! classifier for each event. Interesting events are delegated to
//! per-correlation instances and tracked in a pending-ack set; the
//! subscription cursor advances only once every addressee of the head
//! event has acknowledged it, so the acknowledged sequence is always a
//! strictly increasing prefix of the log.
//!
//! Instance failures are fatal for the router: skipping an event because
//! its instance died would break the ordering contract, so the router
//! surfaces the fault and stops. A restarted router resumes from the last
//! acknowledged event and its instances rehydrate from snapshots.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::command::CommandDispatcher;
use crate::error::{InstanceFault, RouterError};
use crate::event::{Consistency, RecordedEvent, StartFrom};
use crate::instance::InstanceHandle;
use crate::process_manager::{Interest, ProcessManager};
use crate::store::{EventStore, Subscription, SubscriptionMessage};
use crate::subscriptions::{HolderId, Subscriptions};
use crate::supervisor::InstanceSupervisor;

/// Router mailbox capacity. Acks, down notifications, and handle requests
/// are all small and drained promptly.
const MAILBOX_CAPACITY: usize = 64;

/// How an instance task ended, as reported by its watcher.
pub(crate) enum InstanceExit {
    /// Lifecycle stop, shutdown, or mailbox closure.
    Normal,
    /// The instance terminated abnormally.
    Fault(InstanceFault),
}

/// Messages serviced by the router actor.
pub(crate) enum RouterMessage<P: ProcessManager> {
    /// An instance finished processing the event with this number.
    Ack {
        event_number: u64,
        process_id: String,
    },

    /// An instance task exited.
    InstanceDown {
        process_id: String,
        ref_id: Uuid,
        exit: InstanceExit,
    },

    /// Look up a single instance handle.
    ProcessInstance {
        process_id: String,
        reply: oneshot::Sender<Option<InstanceHandle<P>>>,
    },

    /// List all live instances.
    ProcessInstances {
        reply: oneshot::Sender<Vec<(String, InstanceHandle<P>)>>,
    },

    /// Stop gracefully: cancel the subscription, shut instances down
    /// (snapshots kept), and exit.
    Shutdown,
}

/// Configures and spawns a router for the process manager `P`.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use sagaflow::{Consistency, RouterBuilder, StartFrom, Subscriptions};
/// # async fn example<P, S, D>(store: Arc<S>, dispatcher: Arc<D>) -> Result<(), Box<dyn std::error::Error>>
/// # where
/// #     P: sagaflow::ProcessManager,
/// #     S: sagaflow::EventStore,
/// #     D: sagaflow::CommandDispatcher<P::Command>,
/// # {
/// let subscriptions = Arc::new(Subscriptions::new());
/// let router = RouterBuilder::<P>::new(store, dispatcher, subscriptions)
///     .consistency(Consistency::Strong)
///     .start_from(StartFrom::Origin)
///     .spawn()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RouterBuilder<P: ProcessManager> {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<dyn CommandDispatcher<P::Command>>,
    subscriptions: Arc<Subscriptions>,
    consistency: Consistency,
    start_from: StartFrom,
}

impl<P: ProcessManager> RouterBuilder<P> {
    /// Create a builder with the default options: eventual consistency,
    /// subscribing from the origin of the log.
    pub fn new(
        store: Arc<impl EventStore>,
        dispatcher: Arc<impl CommandDispatcher<P::Command>>,
        subscriptions: Arc<Subscriptions>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            subscriptions,
            consistency: Consistency::default(),
            start_from: StartFrom::default(),
        }
    }

    /// Set the consistency level this router registers under.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Set where a brand-new subscription starts reading. Ignored when a
    /// durable cursor already exists for `P::NAME`.
    pub fn start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    /// Subscribe to the event store, register with the subscriptions
    /// registry, and spawn the router actor.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Subscribe`] if the subscription cannot be
    /// established.
    pub async fn spawn(self) -> Result<RouterHandle<P>, RouterError> {
        let subscription = self
            .store
            .subscribe_to_all(P::NAME, self.start_from)
            .await
            .map_err(RouterError::Subscribe)?;
        let holder = self.subscriptions.register(P::NAME, self.consistency);

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let supervisor = InstanceSupervisor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            tx.clone(),
        );
        let runtime = RouterRuntime::<P> {
            store: self.store,
            subscriptions: self.subscriptions,
            consistency: self.consistency,
            supervisor,
            last_seen_event: None,
            instances: HashMap::new(),
            pending_acks: HashMap::new(),
            pending_events: VecDeque::new(),
        };

        tracing::info!(
            process_manager = P::NAME,
            consistency = ?self.consistency,
            "router starting"
        );
        let task = tokio::spawn(run_router(runtime, subscription, rx));
        Ok(RouterHandle {
            sender: tx,
            holder,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Handle for a running router.
///
/// `Clone` is cheap; all clones refer to the same router task.
pub struct RouterHandle<P: ProcessManager> {
    sender: mpsc::Sender<RouterMessage<P>>,
    holder: HolderId,
    /// Wrapped in `Option` so it can be taken and awaited exactly once by
    /// [`shutdown`](RouterHandle::shutdown).
    task: Arc<Mutex<Option<JoinHandle<Result<(), RouterError>>>>>,
}

impl<P: ProcessManager> Clone for RouterHandle<P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            holder: self.holder,
            task: Arc::clone(&self.task),
        }
    }
}

impl<P: ProcessManager> RouterHandle<P> {
    /// The registry holder identity of this router, for excluding the
    /// router's own registration from a wait quorum.
    pub fn holder(&self) -> HolderId {
        self.holder
    }

    /// Check whether the router task is still running.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Look up a live instance by correlation id.
    ///
    /// Returns `None` for unknown ids and when the router has stopped.
    pub async fn process_instance(&self, process_id: &str) -> Option<InstanceHandle<P>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RouterMessage::ProcessInstance {
                process_id: process_id.to_string(),
                reply: tx,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// List all live instances as (correlation id, handle) pairs.
    ///
    /// Returns an empty list when the router has stopped.
    pub async fn process_instances(&self) -> Vec<(String, InstanceHandle<P>)> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RouterMessage::ProcessInstances { reply: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the router and wait for it to exit.
    ///
    /// A graceful stop cancels the subscription and shuts every instance
    /// down with its snapshot intact. If the router already terminated
    /// abnormally, the fault is returned here. Calling `shutdown` more
    /// than once is safe; subsequent calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the [`RouterError`] the router terminated with, if any.
    pub async fn shutdown(&self) -> Result<(), RouterError> {
        // Ignore send errors: the task may already have exited.
        let _ = self.sender.send(RouterMessage::Shutdown).await;

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => match join_handle.await {
                Ok(result) => result,
                Err(join_error) => Err(RouterError::Panicked(join_error.to_string())),
            },
            None => Ok(()),
        }
    }
}

/// State owned by the router actor.
struct RouterRuntime<P: ProcessManager> {
    store: Arc<dyn EventStore>,
    subscriptions: Arc<Subscriptions>,
    consistency: Consistency,
    supervisor: InstanceSupervisor<P>,
    /// Highest event number confirmed upstream. Non-decreasing.
    last_seen_event: Option<u64>,
    /// Live instances by correlation id. Exclusively owned by this actor.
    instances: HashMap<String, InstanceHandle<P>>,
    /// Outstanding acknowledgements per delegated event number. The set is
    /// exactly the instances the event was delegated to.
    pending_acks: HashMap<u64, HashSet<String>>,
    /// Events received but not yet confirmed, in log order.
    pending_events: VecDeque<RecordedEvent>,
}

/// Outcome of classifying and acting on one event.
enum EventOutcome {
    /// The event was delegated; the cursor waits for acknowledgements.
    Delegated,
    /// The event was confirmed without delegation.
    Completed,
}

/// The router actor loop.
async fn run_router<P: ProcessManager>(
    mut rt: RouterRuntime<P>,
    subscription: Subscription,
    mut mailbox: mpsc::Receiver<RouterMessage<P>>,
) -> Result<(), RouterError> {
    let mut sub_rx = subscription.receiver;

    let outcome: Result<(), RouterError> = loop {
        tokio::select! {
            msg = mailbox.recv() => {
                let Some(msg) = msg else {
                    // All handles dropped: treat as a graceful stop.
                    break Ok(());
                };
                match msg {
                    RouterMessage::Ack { event_number, process_id } => {
                        if let Err(error) = rt.handle_ack(event_number, &process_id).await {
                            break Err(error);
                        }
                    }
                    RouterMessage::InstanceDown { process_id, ref_id, exit } => {
                        if let Err(error) = rt.handle_instance_down(process_id, ref_id, exit).await {
                            break Err(error);
                        }
                    }
                    RouterMessage::ProcessInstance { process_id, reply } => {
                        let _ = reply.send(rt.instances.get(&process_id).cloned());
                    }
                    RouterMessage::ProcessInstances { reply } => {
                        let list = rt
                            .instances
                            .iter()
                            .map(|(id, handle)| (id.clone(), handle.clone()))
                            .collect();
                        let _ = reply.send(list);
                    }
                    RouterMessage::Shutdown => break Ok(()),
                }
            }
            msg = sub_rx.recv() => {
                match msg {
                    Some(SubscriptionMessage::Subscribed) => {
                        tracing::info!(process_manager = P::NAME, "subscription confirmed");
                    }
                    Some(SubscriptionMessage::Events(batch)) => {
                        rt.enqueue(batch);
                        if let Err(error) = rt.drain().await {
                            break Err(error);
                        }
                    }
                    None => break Err(RouterError::SubscriptionLost),
                }
            }
        }
    };

    // Cancel delivery before touching instances.
    drop(sub_rx);

    match outcome {
        Ok(()) => {
            rt.shutdown_instances(true).await;
            tracing::info!(process_manager = P::NAME, "router stopped");
            Ok(())
        }
        Err(error) => {
            rt.shutdown_instances(false).await;
            tracing::error!(process_manager = P::NAME, %error, "router terminated");
            Err(error)
        }
    }
}

impl<P: ProcessManager> RouterRuntime<P> {
    /// Append a batch, dropping events at or below the confirmed cursor.
    fn enqueue(&mut self, batch: Vec<RecordedEvent>) {
        for event in batch {
            if self.last_seen_event.is_some_and(|n| event.event_number <= n) {
                tracing::debug!(
                    process_manager = P::NAME,
                    event_number = event.event_number,
                    "already confirmed event dropped"
                );
                continue;
            }
            self.pending_events.push_back(event);
        }
    }

    /// Process pending events head-first until the queue empties or the
    /// head is delegated and must wait for acknowledgements.
    async fn drain(&mut self) -> Result<(), RouterError> {
        while let Some(head) = self.pending_events.front() {
            if self.pending_acks.contains_key(&head.event_number) {
                // Head already delegated on a previous pass.
                return Ok(());
            }
            let event = head.clone();
            match self.handle_event(event).await? {
                EventOutcome::Delegated => return Ok(()),
                EventOutcome::Completed => {
                    self.pending_events.pop_front();
                }
            }
        }
        Ok(())
    }

    /// Classify one event and act on the decision.
    async fn handle_event(&mut self, event: RecordedEvent) -> Result<EventOutcome, RouterError> {
        // Payloads this module does not understand are not interesting.
        let payload: P::Event = match serde_json::from_value(event.data.clone()) {
            Ok(payload) => payload,
            Err(_) => {
                tracing::debug!(
                    process_manager = P::NAME,
                    event_number = event.event_number,
                    "undecodable event payload skipped"
                );
                self.confirm(&event).await?;
                return Ok(EventOutcome::Completed);
            }
        };

        match P::interested_in(&payload) {
            Interest::Start(ids) | Interest::Continue(ids) if !ids.is_empty() => {
                self.delegate(&event, &payload, ids).await;
                Ok(EventOutcome::Delegated)
            }
            Interest::Stop(ids) if !ids.is_empty() => {
                for id in ids {
                    // Unknown ids are ignored.
                    if let Some(instance) = self.instances.remove(&id) {
                        instance.stop().await;
                        tracing::info!(
                            process_manager = P::NAME,
                            process_id = %id,
                            "instance stopped"
                        );
                    }
                }
                self.confirm(&event).await?;
                Ok(EventOutcome::Completed)
            }
            _ => {
                self.confirm(&event).await?;
                Ok(EventOutcome::Completed)
            }
        }
    }

    /// Deliver `event` to every addressed instance, spawning absent ones,
    /// and record the pending-ack set.
    ///
    /// Starting an id that already has a live instance delegates to the
    /// existing one, so a duplicate start cannot fork a correlation.
    async fn delegate(&mut self, event: &RecordedEvent, payload: &P::Event, ids: Vec<String>) {
        let addressees: HashSet<String> = ids.into_iter().collect();
        self.pending_acks
            .insert(event.event_number, addressees.clone());

        for id in &addressees {
            if !self.instances.contains_key(id) {
                tracing::debug!(
                    process_manager = P::NAME,
                    process_id = %id,
                    "starting instance"
                );
                let instance = self.supervisor.start_instance(id);
                self.instances.insert(id.clone(), instance);
            }
            if let Some(instance) = self.instances.get(id) {
                instance.deliver(event.clone(), payload.clone()).await;
            }
        }
        tracing::debug!(
            process_manager = P::NAME,
            event_number = event.event_number,
            addressees = addressees.len(),
            "event delegated"
        );
    }

    /// Confirm receipt upstream and advance the cursor.
    async fn confirm(&mut self, event: &RecordedEvent) -> Result<(), RouterError> {
        self.store
            .ack_event(P::NAME, event)
            .await
            .map_err(RouterError::Ack)?;
        self.subscriptions
            .ack_event(P::NAME, self.consistency, event);
        self.last_seen_event = Some(event.event_number);
        tracing::debug!(
            process_manager = P::NAME,
            event_number = event.event_number,
            "cursor advanced"
        );
        Ok(())
    }

    /// Remove `process_id` from the event's pending set; confirm and
    /// resume draining once the set empties.
    async fn handle_ack(&mut self, event_number: u64, process_id: &str) -> Result<(), RouterError> {
        let Some(set) = self.pending_acks.get_mut(&event_number) else {
            // Ack for an already confirmed event (e.g. a rehydrated
            // instance re-acking a seen event).
            return Ok(());
        };
        set.remove(process_id);
        if set.is_empty() {
            self.pending_acks.remove(&event_number);
            self.complete_head(event_number).await?;
        }
        Ok(())
    }

    /// Confirm the head event once its pending set has drained, then
    /// continue processing the queue.
    async fn complete_head(&mut self, event_number: u64) -> Result<(), RouterError> {
        let head_matches = self
            .pending_events
            .front()
            .is_some_and(|head| head.event_number == event_number);
        if head_matches
            && let Some(event) = self.pending_events.pop_front()
        {
            self.confirm(&event).await?;
            self.drain().await?;
        }
        Ok(())
    }

    /// React to an instance exit.
    ///
    /// A normal exit is routine lifecycle: the instance is dropped from
    /// the map and from any pending-ack set it appears in so the head can
    /// never wait on an acknowledgement that will not come. An abnormal
    /// exit stops the router with the instance's fault; the pending map is
    /// deliberately left as-is, since resuming past an unhandled event
    /// would mean silently skipping it.
    async fn handle_instance_down(
        &mut self,
        process_id: String,
        ref_id: Uuid,
        exit: InstanceExit,
    ) -> Result<(), RouterError> {
        match exit {
            InstanceExit::Normal => {
                // Only clean up if the notification refers to the instance
                // currently mapped; a stopped-then-restarted id has a live
                // successor with a different ref.
                let current = self
                    .instances
                    .get(&process_id)
                    .is_some_and(|handle| handle.ref_id() == ref_id);
                if current {
                    self.instances.remove(&process_id);
                    let mut completed = Vec::new();
                    for (event_number, set) in self.pending_acks.iter_mut() {
                        if set.remove(&process_id) && set.is_empty() {
                            completed.push(*event_number);
                        }
                    }
                    for event_number in completed {
                        self.pending_acks.remove(&event_number);
                        self.complete_head(event_number).await?;
                    }
                }
                Ok(())
            }
            InstanceExit::Fault(fault) => {
                tracing::error!(
                    process_manager = P::NAME,
                    process_id = %process_id,
                    %fault,
                    "instance terminated abnormally; stopping router"
                );
                Err(RouterError::InstanceFailed { process_id, fault })
            }
        }
    }

    /// Ask every remaining instance to exit with its snapshot intact.
    ///
    /// On a graceful stop the router waits for the instances to finish;
    /// on an abnormal stop it only signals them, since a wedged instance
    /// must not keep a failing router alive.
    async fn shutdown_instances(&mut self, wait: bool) {
        for instance in self.instances.values() {
            instance.shutdown().await;
        }
        if wait {
            for instance in self.instances.values() {
                instance.closed().await;
            }
        }
        self.instances.clear();
    }
}
