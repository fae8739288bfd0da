//! Process-manager runtime for event-sourced CQRS applications.
//!
//! `sagaflow` drives long-lived, event-correlated workflows ("sagas") from
//! a totally-ordered event log. A [`RouterBuilder`] spawns one router per
//! process-manager definition; the router owns a durable subscription to
//! the all-events stream, routes each event to zero or more
//! per-correlation instances, and advances the subscription cursor in
//! strict order once every addressee has acknowledged. Instances invoke
//! the user module's pure decision logic, dispatch the resulting commands
//! with a retry/skip/stop failure policy, and persist their state as
//! snapshots so restarts never replay the world.
//!
//! The event store and the command dispatcher are external collaborators,
//! reached only through the [`EventStore`] and [`CommandDispatcher`]
//! seams.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`ProcessManager`] | User module: classifies events, emits commands, folds state |
//! | [`RouterBuilder`] / [`RouterHandle`] | Spawns and controls the per-definition router actor |
//! | [`InstanceHandle`] | Async handle to one per-correlation instance |
//! | [`EventStore`] | Facade over subscribe/ack/snapshot operations |
//! | [`CommandDispatcher`] | Routes emitted commands to their targets |
//! | [`Subscriptions`] | Registry of handler progress; implements strong-consistency waits |
//!
//! # Quick Start
//!
//! ```no_run
//! use sagaflow::{Consistency, Interest, ProcessManager, RouterBuilder, Subscriptions};
//! use serde::{Deserialize, Serialize};
//!
//! // 1. Define your workflow state and the events it reacts to.
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct TransferWorkflow {
//!     withdrawn: bool,
//! }
//!
//! #[derive(Debug, Clone, Deserialize)]
//! enum TransferEvent {
//!     Initiated { transfer_id: String },
//!     Completed { transfer_id: String },
//! }
//!
//! #[derive(Debug, Clone)]
//! enum BankCommand {
//!     Withdraw { transfer_id: String },
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! enum TransferError {}
//!
//! impl ProcessManager for TransferWorkflow {
//!     const NAME: &'static str = "transfer";
//!     type Event = TransferEvent;
//!     type Command = BankCommand;
//!     type Error = TransferError;
//!
//!     fn interested_in(event: &TransferEvent) -> Interest {
//!         match event {
//!             TransferEvent::Initiated { transfer_id } => Interest::start(transfer_id.clone()),
//!             TransferEvent::Completed { transfer_id } => Interest::stop(transfer_id.clone()),
//!         }
//!     }
//!
//!     fn handle(&self, event: &TransferEvent) -> Result<Vec<BankCommand>, TransferError> {
//!         match event {
//!             TransferEvent::Initiated { transfer_id } => Ok(vec![BankCommand::Withdraw {
//!                 transfer_id: transfer_id.clone(),
//!             }]),
//!             TransferEvent::Completed { .. } => Ok(vec![]),
//!         }
//!     }
//!
//!     fn apply(mut self, event: &TransferEvent) -> Self {
//!         if matches!(event, TransferEvent::Initiated { .. }) {
//!             self.withdrawn = true;
//!         }
//!         self
//!     }
//! }
//!
//! // 2. Spawn a router over your event store and command dispatcher.
//! # use std::sync::Arc;
//! # async fn run(
//! #     store: Arc<impl sagaflow::EventStore>,
//! #     dispatcher: Arc<impl sagaflow::CommandDispatcher<BankCommand>>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let subscriptions = Arc::new(Subscriptions::new());
//! let router = RouterBuilder::<TransferWorkflow>::new(store, dispatcher, subscriptions)
//!     .consistency(Consistency::Strong)
//!     .spawn()
//!     .await?;
//!
//! // Events now flow: instances spawn on demand, commands dispatch with
//! // causation metadata, snapshots persist after each handled event.
//! router.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod error;
mod event;
mod instance;
mod process_manager;
mod router;
mod store;
mod subscriptions;
mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{CommandDispatcher, DispatchContext, DispatchError};
pub use error::{InstanceFault, RouterError, StateError};
pub use event::{Consistency, RecordedEvent, SnapshotData, StartFrom};
pub use instance::InstanceHandle;
pub use process_manager::{
    ErrorAction, FailureContext, Interest, ProcessManager, SkipBehaviour,
};
pub use router::{RouterBuilder, RouterHandle};
pub use store::{EventStore, SnapshotError, StoreError, Subscription, SubscriptionMessage};
pub use subscriptions::{HolderId, Subscriptions, WaitOpts, WaitTimeout};
