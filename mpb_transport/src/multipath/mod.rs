//! Multipath session controller.
//!
//! A [`Session`] bundles several transport connections ([`Subflow`]s)
//! between two endpoints. The controller intercepts each connection's
//! event hooks, authorizes subflows through a key exchange on the first
//! one and derived tokens on the rest, and moves them between the
//! session's pending, listening and active sets. Outbound records are
//! spread over active subflows by a [`Scheduler`]; inbound payloads pass
//! a [`ReorderEngine`] and receive admission before reaching the consumer.

pub mod dispatcher;
pub mod path_manager;
pub mod rcu;
pub mod recv;
pub mod registry;
pub mod reorder;
pub mod scheduler;
pub mod session;
pub mod subflow;
pub mod workqueue;
pub mod xmit;

use std::sync::Arc;

use mpb_core::types::Role;
use tracing::{info, warn};

pub use path_manager::{ManualPathManager, PathManager};
pub use registry::SessionRegistry;
pub use reorder::{PassthroughReorder, ReceiveContext, ReorderEngine};
pub use scheduler::{
    create_scheduler, FirstAvailableScheduler, MinRttScheduler, RoundRobinScheduler, Scheduler,
};
pub use session::{Session, SessionBuilder, SessionState, SessionStats};
pub use subflow::{Membership, Subflow, SubflowState};
pub use workqueue::WorkQueue;
pub use xmit::TxRecord;

use crate::link::LinkRegistry;
use crate::transport::TransportProvider;

/// Collaborators shared by every session of one controller instance.
#[derive(Clone)]
pub struct MultipathContext {
    registry: Arc<SessionRegistry>,
    links: Arc<dyn LinkRegistry>,
    transport: Arc<dyn TransportProvider>,
    work: WorkQueue,
}

impl MultipathContext {
    /// Must be called from within a tokio runtime: the work queue's worker
    /// is spawned here.
    pub fn new(transport: Arc<dyn TransportProvider>, links: Arc<dyn LinkRegistry>) -> Self {
        info!("multipath controller started");
        Self {
            registry: Arc::new(SessionRegistry::new()),
            links,
            transport,
            work: WorkQueue::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn links(&self) -> &Arc<dyn LinkRegistry> {
        &self.links
    }

    pub fn transport(&self) -> &Arc<dyn TransportProvider> {
        &self.transport
    }

    pub fn work(&self) -> &WorkQueue {
        &self.work
    }

    pub fn session(&self, role: Role) -> SessionBuilder {
        SessionBuilder::new(self, role)
    }

    /// Wait for all deferred teardown to finish.
    pub async fn flush(&self) {
        self.work.flush().await;
    }

    /// Tear down every session, then stop the work queue.
    pub async fn shutdown(&self) {
        for session in self.registry.snapshot().iter() {
            if let Err(e) = session.shutdown() {
                warn!(session = session.id(), error = %e, "session teardown incomplete");
            }
        }
        self.work.shutdown().await;
        info!("multipath controller stopped");
    }
}

#[cfg(test)]
mod tests;
