//! One transport connection participating in a session.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use arc_swap::ArcSwapOption;
use mpb_core::types::Role;
use tracing::{debug, trace};

use super::session::Session;
use crate::link::{LinkInfo, LinkRegistry};
use crate::transport::{ConnectionRef, EventsRef, HookKind};

/// Lifecycle of a subflow as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubflowState {
    /// Outbound dial issued, or inbound accept pending.
    Requested,
    /// Passive-open socket. Never carries data.
    Listening,
    /// Transport handshake complete, session authorization pending.
    Authorizing,
    Active,
    /// Teardown scheduled.
    Closing,
    Destroyed,
}

/// Which of the session's sets holds the subflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Membership {
    None = 0,
    Pending = 1,
    Listening = 2,
    Active = 3,
}

impl Membership {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Membership::Pending,
            2 => Membership::Listening,
            3 => Membership::Active,
            _ => Membership::None,
        }
    }
}

/// Hook slots taken over from the connection, with their previous occupants.
#[derive(Default)]
struct SavedHooks {
    slots: [Option<Option<EventsRef>>; HookKind::COUNT],
    order: Vec<HookKind>,
}

pub struct Subflow {
    id: u64,
    role: Role,
    conn: ConnectionRef,
    session: Weak<Session>,
    if_index: u32,

    link: ArcSwapOption<LinkInfo>,
    link_generation: AtomicU32,

    kex_carrier: AtomicBool,
    authorized: AtomicBool,
    closing: AtomicBool,
    destroyed: AtomicBool,
    membership: AtomicU8,
    state: Mutex<SubflowState>,

    saved_hooks: Mutex<SavedHooks>,
    sched_state: Mutex<Option<Box<dyn Any + Send>>>,
    tx_lock: Mutex<()>,
    sent: AtomicU64,
}

impl Subflow {
    pub(crate) fn new(conn: ConnectionRef, session: Weak<Session>, role: Role, if_index: u32) -> Self {
        Self {
            id: conn.id(),
            role,
            conn,
            session,
            if_index,
            link: ArcSwapOption::empty(),
            link_generation: AtomicU32::new(0),
            kex_carrier: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            membership: AtomicU8::new(Membership::None as u8),
            state: Mutex::new(SubflowState::Requested),
            saved_hooks: Mutex::new(SavedHooks::default()),
            sched_state: Mutex::new(None),
            tx_lock: Mutex::new(()),
            sent: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn conn(&self) -> &ConnectionRef {
        &self.conn
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn state(&self) -> SubflowState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, next: SubflowState) {
        let mut state = self.state.lock().unwrap();
        // Terminal states only move forward.
        if matches!(*state, SubflowState::Destroyed)
            || (*state == SubflowState::Closing && next != SubflowState::Destroyed)
        {
            return;
        }
        trace!(subflow = self.id, from = ?*state, to = ?next, "subflow state");
        *state = next;
    }

    pub fn membership(&self) -> Membership {
        Membership::from_u8(self.membership.load(Ordering::Acquire))
    }

    /// Only called with the lock of the set being entered or left held.
    pub(crate) fn set_membership(&self, m: Membership) {
        self.membership.store(m as u8, Ordering::Release);
    }

    pub fn is_kex_carrier(&self) -> bool {
        self.kex_carrier.load(Ordering::Acquire)
    }

    pub(crate) fn mark_kex_carrier(&self) {
        self.kex_carrier.store(true, Ordering::Release);
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    pub(crate) fn set_authorized(&self) {
        self.authorized.store(true, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Claim the right to schedule teardown. True for exactly one caller.
    pub(crate) fn begin_close(&self) -> bool {
        let first = self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.set_state(SubflowState::Closing);
        }
        first
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn begin_destroy(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    /// Active, not closing, connected and with room in the send queue.
    pub fn can_send(&self) -> bool {
        !self.is_closing()
            && self.membership() == Membership::Active
            && self.conn.state().is_established()
            && !self.conn.queue_full()
    }

    pub fn packets_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Exclusive sender access, waiting for a concurrent sender.
    pub(crate) fn lock_tx(&self) -> MutexGuard<'_, ()> {
        self.tx_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Exclusive sender access from a context that cannot wait.
    pub(crate) fn try_lock_tx(&self) -> Option<MutexGuard<'_, ()>> {
        match self.tx_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        }
    }

    // ---- hook interception ----

    /// Take over `kinds` on the connection, remembering what was there.
    pub(crate) fn install_hooks(&self, handler: &EventsRef, kinds: &[HookKind]) {
        let mut saved = self.saved_hooks.lock().unwrap();
        for &kind in kinds {
            if saved.slots[kind.index()].is_some() {
                continue;
            }
            let previous = self.conn.replace_hook(kind, Some(handler.clone()));
            saved.slots[kind.index()] = Some(previous);
            saved.order.push(kind);
        }
    }

    /// Handler that occupied `kind` before interception.
    pub fn saved_hook(&self, kind: HookKind) -> Option<EventsRef> {
        self.saved_hooks.lock().unwrap().slots[kind.index()].clone().flatten()
    }

    pub fn intercepts(&self, kind: HookKind) -> bool {
        self.saved_hooks.lock().unwrap().slots[kind.index()].is_some()
    }

    /// Put the saved handlers back, newest first. Slots never taken over
    /// are left alone. Returns the saved destruct handler.
    pub(crate) fn restore_hooks(&self) -> Option<EventsRef> {
        let mut saved = self.saved_hooks.lock().unwrap();
        let destruct = saved.slots[HookKind::Destruct.index()].clone().flatten();
        let order = std::mem::take(&mut saved.order);
        for kind in order.into_iter().rev() {
            if let Some(previous) = saved.slots[kind.index()].take() {
                self.conn.replace_hook(kind, previous);
            }
        }
        destruct
    }

    // ---- scheduler scratch ----

    /// Replace the scheduler-private state.
    pub fn set_sched_state<T: Any + Send>(&self, state: T) {
        *self.sched_state.lock().unwrap() = Some(Box::new(state));
    }

    /// Run `f` on the scheduler-private state if it holds a `T`.
    pub fn with_sched_state<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.sched_state.lock().unwrap();
        guard.as_mut().and_then(|s| s.downcast_mut::<T>()).map(f)
    }

    pub fn has_sched_state(&self) -> bool {
        self.sched_state.lock().unwrap().is_some()
    }

    pub(crate) fn clear_sched_state(&self) {
        self.sched_state.lock().unwrap().take();
    }

    // ---- link info ----

    pub(crate) fn attach_link(&self, link: Arc<LinkInfo>) {
        self.link_generation.store(link.generation(), Ordering::Release);
        self.link.store(Some(link));
    }

    /// Drop this subflow's reference to its link.
    pub(crate) fn release_link(&self) -> Option<Arc<LinkInfo>> {
        self.link.swap(None)
    }

    /// Snapshot of the current link. The value stays valid for as long as
    /// the caller holds it, even if the subflow swaps in a newer one.
    pub fn link(&self) -> Option<Arc<LinkInfo>> {
        self.link.load_full()
    }

    pub fn link_is_copy(&self) -> bool {
        (*self.link.load()).as_ref().map_or(false, |l| l.is_copy())
    }

    /// Give the subflow a private copy of its link. No-op when it already
    /// holds one.
    pub fn copy_link(&self) {
        let current = self.link.load_full();
        let Some(current) = current else { return };
        if current.is_copy() {
            return;
        }
        let copy = Arc::new(current.private_copy());
        let previous = self.link.compare_and_swap(&Some(current.clone()), Some(copy));
        if (*previous).as_ref().map_or(false, |p| Arc::ptr_eq(p, &current)) {
            debug!(subflow = self.id, link = current.id(), "link copied");
        }
    }

    /// Private copy of the link, made on first use.
    pub fn copied_link(&self) -> Option<Arc<LinkInfo>> {
        self.copy_link();
        self.link()
    }

    /// Whether the held link was superseded since the last
    /// [`config_update`](Self::config_update).
    pub fn has_config_changed(&self) -> bool {
        match (*self.link.load()).as_ref() {
            Some(link) => link.generation() != self.link_generation.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Acknowledge the current link generation.
    pub fn config_update(&self) {
        if let Some(link) = (*self.link.load()).as_ref() {
            self.link_generation.store(link.generation(), Ordering::Release);
        }
    }

    /// Swap in the latest published value of the link. A subflow holding a
    /// private copy gets a fresh copy. Returns whether the handle changed.
    pub fn refresh_link(&self, registry: &dyn LinkRegistry) -> bool {
        let Some(current) = self.link() else { return false };
        if !current.is_copy() && !self.has_config_changed() {
            return false;
        }
        let latest = registry.get(current.id()).unwrap_or_else(|| registry.fallback_link());
        if current.is_copy() && latest.generation() == self.link_generation.load(Ordering::Acquire) {
            return false;
        }
        let next = if current.is_copy() {
            Arc::new(latest.private_copy())
        } else {
            latest
        };
        debug!(
            subflow = self.id,
            link = next.id(),
            generation = next.generation(),
            "link refreshed"
        );
        self.attach_link(next);
        true
    }
}

impl fmt::Debug for Subflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subflow")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("membership", &self.membership())
            .field("kex_carrier", &self.is_kex_carrier())
            .field("closing", &self.is_closing())
            .finish()
    }
}
