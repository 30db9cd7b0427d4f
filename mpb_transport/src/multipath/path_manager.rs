//! Path managers

use std::sync::Arc;

use mpb_core::Result;
use tracing::debug;

use super::session::Session;

/// Decides when a session gains or loses subflows.
///
/// A path manager drives the session through
/// [`Session::add_outbound_subflow`], [`Session::add_listener`],
/// [`Session::close_subflow_by_id`] and
/// [`SessionRegistry::remove_subflows_for_link`](super::SessionRegistry::remove_subflows_for_link).
pub trait PathManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Session created.
    fn init(&self, _session: &Arc<Session>) -> Result<()> {
        Ok(())
    }

    /// Session torn down.
    fn release(&self, _session: &Session) {}
}

/// No discovery: subflows are added by explicit calls only.
pub struct ManualPathManager;

impl PathManager for ManualPathManager {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn init(&self, session: &Arc<Session>) -> Result<()> {
        debug!(session = session.id(), "manual path manager attached");
        Ok(())
    }
}
