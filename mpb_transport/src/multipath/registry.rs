//! Process-wide set of live sessions.

use std::sync::Arc;

use tracing::{debug, info};

use super::rcu::RcuList;
use super::session::Session;
use crate::link::LinkId;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RcuList<Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        let mut guard = self.sessions.lock();
        if guard.contains(&session) {
            return;
        }
        guard.push_back(session);
    }

    pub(crate) fn remove(&self, session: &Arc<Session>) -> bool {
        self.sessions.lock().remove(session)
    }

    pub fn contains(&self, session: &Arc<Session>) -> bool {
        self.sessions.contains(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Session>>> {
        self.sessions.snapshot()
    }

    pub fn find(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.snapshot().iter().find(|s| s.id() == id).cloned()
    }

    /// Close every subflow, in every session, bound to `link`. Returns how
    /// many teardowns were scheduled.
    pub fn remove_subflows_for_link(&self, link: LinkId) -> usize {
        let mut closed = 0;
        for session in self.sessions.snapshot().iter() {
            for sf in session.all_subflows() {
                let bound = sf.link().map_or(false, |l| l.id() == link);
                if bound && session.schedule_close(&sf) {
                    debug!(session = session.id(), subflow = sf.id(), link, "closing subflow on removed link");
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            info!(link, closed, "link removed");
        }
        closed
    }
}
