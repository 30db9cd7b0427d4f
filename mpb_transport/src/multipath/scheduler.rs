//! Subflow schedulers

use std::sync::Arc;

use super::session::Session;
use super::subflow::Subflow;
use crate::config::SchedulerAlgorithm;

/// Picks the active subflow that carries the next outbound record.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per subflow on promotion, before other readers see it
    /// in the active set.
    fn init_subflow(&self, _subflow: &Subflow) {}

    fn select_subflow(&self, session: &Session) -> Option<Arc<Subflow>>;

    /// Session teardown.
    fn release(&self, _session: &Session) {}
}

/// First active subflow that can send.
pub struct FirstAvailableScheduler;

impl Scheduler for FirstAvailableScheduler {
    fn name(&self) -> &'static str {
        "first_available"
    }

    fn select_subflow(&self, session: &Session) -> Option<Arc<Subflow>> {
        session.active_subflows().iter().find(|s| s.can_send()).cloned()
    }
}

/// Lowest smoothed RTT among subflows that can send.
pub struct MinRttScheduler;

impl Scheduler for MinRttScheduler {
    fn name(&self) -> &'static str {
        "min_rtt"
    }

    fn select_subflow(&self, session: &Session) -> Option<Arc<Subflow>> {
        session
            .active_subflows()
            .iter()
            .filter(|s| s.can_send())
            .min_by_key(|s| s.conn().srtt())
            .cloned()
    }
}

/// Per-subflow pick counter kept in the subflow's scheduler scratch.
#[derive(Debug, Default)]
struct RoundRobinState {
    picks: u64,
}

/// Spreads records evenly: the subflow picked least often goes next.
pub struct RoundRobinScheduler;

impl Scheduler for RoundRobinScheduler {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn init_subflow(&self, subflow: &Subflow) {
        subflow.set_sched_state(RoundRobinState::default());
    }

    fn select_subflow(&self, session: &Session) -> Option<Arc<Subflow>> {
        let active = session.active_subflows();
        let chosen = active
            .iter()
            .filter(|s| s.can_send())
            .min_by_key(|s| s.with_sched_state(|st: &mut RoundRobinState| st.picks).unwrap_or(0))?
            .clone();
        chosen.with_sched_state(|st: &mut RoundRobinState| st.picks += 1);
        Some(chosen)
    }
}

pub fn create_scheduler(algo: SchedulerAlgorithm) -> Arc<dyn Scheduler> {
    match algo {
        SchedulerAlgorithm::FirstAvailable => Arc::new(FirstAvailableScheduler),
        SchedulerAlgorithm::RoundRobin => Arc::new(RoundRobinScheduler),
        SchedulerAlgorithm::MinRtt => Arc::new(MinRttScheduler),
    }
}
