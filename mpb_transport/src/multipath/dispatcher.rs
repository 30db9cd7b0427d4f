//! Event dispatcher installed in the hook slots of every subflow connection.

use std::io;
use std::sync::{Arc, Weak};

use mpb_core::types::Packet;
use tracing::{debug, trace};

use super::subflow::Subflow;
use crate::transport::{ConnState, ConnectionEvents, ConnectionRef, EventsRef, HookKind};

/// Routes connection events of one subflow into its session.
///
/// Holds the subflow weakly: the connection owns the dispatcher through
/// its hook slots, and the session's sets own the subflow.
pub(crate) struct SubflowEvents {
    subflow: Weak<Subflow>,
}

impl SubflowEvents {
    pub(crate) fn new(subflow: &Arc<Subflow>) -> EventsRef {
        Arc::new(Self {
            subflow: Arc::downgrade(subflow),
        })
    }
}

impl ConnectionEvents for SubflowEvents {
    fn data_ready(&self, conn: &ConnectionRef) {
        let Some(sf) = self.subflow.upgrade() else { return };
        match conn.state() {
            // The handshake still belongs to the transport.
            ConnState::Requesting => {
                if let Some(saved) = sf.saved_hook(HookKind::DataReady) {
                    saved.data_ready(conn);
                }
            }
            ConnState::Listen => {
                trace!(subflow = sf.id(), "data ready on listener ignored");
            }
            ConnState::Open | ConnState::PartOpen => {
                let Some(session) = sf.session() else { return };
                if let Err(e) = session.read_from_subflow(&sf) {
                    debug!(subflow = sf.id(), error = %e, "failed to read from subflow");
                }
            }
            _ => {}
        }
    }

    fn backlog_rcv(&self, conn: &ConnectionRef, packet: &Packet) -> io::Result<()> {
        let Some(sf) = self.subflow.upgrade() else { return Ok(()) };
        match sf.saved_hook(HookKind::BacklogRcv) {
            Some(saved) => saved.backlog_rcv(conn, packet),
            None => Ok(()),
        }
    }

    fn state_change(&self, _conn: &ConnectionRef) {
        let Some(sf) = self.subflow.upgrade() else { return };
        if let Some(session) = sf.session() {
            session.on_state_change(&sf);
        }
    }

    fn accept(&self, _listener: &ConnectionRef, child: ConnectionRef) {
        let Some(sf) = self.subflow.upgrade() else { return };
        match sf.session() {
            Some(session) => session.accept_subflow(&sf, child),
            None => child.close(),
        }
    }

    fn write_space(&self, conn: &ConnectionRef) {
        let Some(sf) = self.subflow.upgrade() else { return };
        if let Some(saved) = sf.saved_hook(HookKind::WriteSpace) {
            saved.write_space(conn);
        }
        if let Some(session) = sf.session() {
            session.push_pending_quiet();
        }
    }

    fn destruct(&self, conn: &ConnectionRef) {
        match self.subflow.upgrade() {
            Some(sf) => match sf.session() {
                Some(session) => session.destroy_subflow(&sf),
                None => {
                    if let Some(saved) = sf.restore_hooks() {
                        saved.destruct(conn);
                    }
                }
            },
            None => trace!(conn = conn.id(), "destruct for released subflow"),
        }
    }
}
