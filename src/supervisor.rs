//! On-demand factory for process instances.
//!
//! The supervisor spawns instance actors for a single router and isolates
//! their failures: each instance gets a watcher task that awaits its exit
//! and reports the outcome to the router, so a panicking or faulting
//! instance never takes a sibling down with it. Restart strategy is
//! transient: an abnormal exit is not restarted here; the router decides
//! what the failure means.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::command::CommandDispatcher;
use crate::error::InstanceFault;
use crate::instance::{InstanceHandle, spawn_instance};
use crate::process_manager::ProcessManager;
use crate::router::{InstanceExit, RouterMessage};
use crate::store::EventStore;

pub(crate) struct InstanceSupervisor<P: ProcessManager> {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<dyn CommandDispatcher<P::Command>>,
    router: mpsc::Sender<RouterMessage<P>>,
}

impl<P: ProcessManager> InstanceSupervisor<P> {
    pub(crate) fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Arc<dyn CommandDispatcher<P::Command>>,
        router: mpsc::Sender<RouterMessage<P>>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            router,
        }
    }

    /// Spawn an instance for `process_id` plus a watcher that notifies the
    /// router when it exits.
    pub(crate) fn start_instance(&self, process_id: &str) -> InstanceHandle<P> {
        let (handle, task) = spawn_instance::<P>(
            process_id,
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            self.router.clone(),
        );

        let router = self.router.clone();
        let process_id = process_id.to_string();
        let ref_id = handle.ref_id();
        tokio::spawn(async move {
            let exit = match task.await {
                Ok(Ok(())) => InstanceExit::Normal,
                Ok(Err(fault)) => InstanceExit::Fault(fault),
                Err(join_error) => {
                    InstanceExit::Fault(InstanceFault::Panicked(join_error.to_string()))
                }
            };
            // A closed router mailbox means the router already terminated;
            // nothing left to notify.
            let _ = router
                .send(RouterMessage::InstanceDown {
                    process_id,
                    ref_id,
                    exit,
                })
                .await;
        });

        handle
    }
}
