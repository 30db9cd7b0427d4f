//! Multipath session: the aggregate of subflows between two endpoints.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use mpb_core::token::TokenPair;
use mpb_core::types::{MpOption, Role, SessionKey};
use mpb_core::{MultipathError, Result};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use super::dispatcher::SubflowEvents;
use super::path_manager::{ManualPathManager, PathManager};
use super::rcu::RcuList;
use super::reorder::{PassthroughReorder, ReorderEngine};
use super::scheduler::{create_scheduler, Scheduler};
use super::subflow::{Membership, Subflow, SubflowState};
use super::xmit::TxRecord;
use super::MultipathContext;
use crate::config::SessionConfig;
use crate::transport::{ConnState, ConnectionRef, HookKind};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const INITIATOR_HOOKS: [HookKind; 5] = [
    HookKind::DataReady,
    HookKind::BacklogRcv,
    HookKind::Destruct,
    HookKind::StateChange,
    HookKind::WriteSpace,
];
const LISTENER_HOOKS: [HookKind; 4] = [
    HookKind::DataReady,
    HookKind::BacklogRcv,
    HookKind::Destruct,
    HookKind::Accept,
];
const CHILD_HOOKS: [HookKind; 4] = [
    HookKind::DataReady,
    HookKind::BacklogRcv,
    HookKind::Destruct,
    HookKind::WriteSpace,
];

/// State of the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Listening,
    Open,
    Closed,
}

struct KeyState {
    local: SessionKey,
    remote: Option<SessionKey>,
    tokens: Option<TokenPair>,
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub(super) delivered: AtomicU64,
    pub(super) dropped: AtomicU64,
    pub(super) sent: AtomicU64,
}

impl SessionStats {
    /// Payloads admitted to the delivery queue.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Payloads refused by receive admission.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records pushed onto a subflow.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

pub struct SessionBuilder {
    ctx: MultipathContext,
    role: Role,
    config: SessionConfig,
    key: Option<SessionKey>,
    scheduler: Option<Arc<dyn Scheduler>>,
    reorder: Option<Arc<dyn ReorderEngine>>,
    path_manager: Option<Arc<dyn PathManager>>,
}

impl SessionBuilder {
    pub fn new(ctx: &MultipathContext, role: Role) -> Self {
        Self {
            ctx: ctx.clone(),
            role,
            config: SessionConfig::default(),
            key: None,
            scheduler: None,
            reorder: None,
            path_manager: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Fixed local key instead of a random one.
    pub fn local_key(mut self, key: SessionKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Overrides the scheduler named in the configuration.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn reorder(mut self, reorder: Arc<dyn ReorderEngine>) -> Self {
        self.reorder = Some(reorder);
        self
    }

    pub fn path_manager(mut self, path_manager: Arc<dyn PathManager>) -> Self {
        self.path_manager = Some(path_manager);
        self
    }

    pub fn build(self) -> Result<Arc<Session>> {
        self.config.validate()?;

        let scheduler = self
            .scheduler
            .unwrap_or_else(|| create_scheduler(self.config.scheduler));
        let reorder: Arc<dyn ReorderEngine> = match self.reorder {
            Some(reorder) => reorder,
            None => Arc::new(PassthroughReorder),
        };
        let path_manager: Arc<dyn PathManager> = match self.path_manager {
            Some(pm) => pm,
            None => Arc::new(ManualPathManager),
        };
        let key = self.key.unwrap_or_else(SessionKey::generate);
        let ctx = self.ctx;
        let role = self.role;
        let config = self.config;

        let session = Arc::new_cyclic(|me| Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            me: me.clone(),
            config,
            ctx: ctx.clone(),
            scheduler,
            reorder,
            path_manager,
            pending: RcuList::new(),
            listening: RcuList::new(),
            active: RcuList::new(),
            subflow_count: AtomicUsize::new(0),
            keys: Mutex::new(KeyState {
                local: key,
                remote: None,
                tokens: None,
            }),
            kex_done: AtomicBool::new(false),
            carrier_claimed: AtomicBool::new(false),
            state: Mutex::new(SessionState::Init),
            torn_down: AtomicBool::new(false),
            mss_cache: AtomicUsize::new(usize::MAX),
            dsn_local: AtomicU64::new(0),
            dsn_remote: AtomicU64::new(0),
            rx_queue: Mutex::new(VecDeque::new()),
            rx_notify: Notify::new(),
            tx_queue: Mutex::new(VecDeque::new()),
            stats: SessionStats::default(),
        });

        ctx.registry().insert(session.clone());
        if let Err(e) = session.path_manager.init(&session) {
            ctx.registry().remove(&session);
            return Err(e);
        }
        info!(
            session = session.id,
            role = %role,
            scheduler = session.scheduler.name(),
            reorder = session.reorder.name(),
            path_manager = session.path_manager.name(),
            "session created"
        );
        Ok(session)
    }
}

pub struct Session {
    id: u64,
    role: Role,
    me: Weak<Session>,
    pub(super) config: SessionConfig,
    ctx: MultipathContext,
    pub(super) scheduler: Arc<dyn Scheduler>,
    pub(super) reorder: Arc<dyn ReorderEngine>,
    path_manager: Arc<dyn PathManager>,

    pending: RcuList<Subflow>,
    listening: RcuList<Subflow>,
    active: RcuList<Subflow>,
    /// Equals the size of `active`. Changed only under the active set's lock.
    subflow_count: AtomicUsize,

    keys: Mutex<KeyState>,
    kex_done: AtomicBool,
    carrier_claimed: AtomicBool,

    state: Mutex<SessionState>,
    torn_down: AtomicBool,
    pub(super) mss_cache: AtomicUsize,
    pub(super) dsn_local: AtomicU64,
    pub(super) dsn_remote: AtomicU64,

    pub(super) rx_queue: Mutex<VecDeque<Bytes>>,
    pub(super) rx_notify: Notify,
    pub(super) tx_queue: Mutex<VecDeque<Arc<TxRecord>>>,
    pub(super) stats: SessionStats,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn context(&self) -> &MultipathContext {
        &self.ctx
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Closed {
            return;
        }
        debug!(session = self.id, from = ?*state, to = ?next, "session state");
        *state = next;
    }

    pub(super) fn arc(&self) -> Option<Arc<Session>> {
        self.me.upgrade()
    }

    pub fn key_exchange_done(&self) -> bool {
        self.kex_done.load(Ordering::Acquire)
    }

    /// Derived tokens, once key exchange is done.
    pub fn tokens(&self) -> Option<TokenPair> {
        if !self.key_exchange_done() {
            return None;
        }
        self.keys.lock().unwrap().tokens
    }

    pub fn local_key(&self) -> SessionKey {
        self.keys.lock().unwrap().local
    }

    pub fn remote_key(&self) -> Option<SessionKey> {
        self.keys.lock().unwrap().remote
    }

    /// Smallest segment size seen on any path.
    pub fn mss_cache(&self) -> usize {
        self.mss_cache.load(Ordering::Acquire)
    }

    pub fn subflow_count(&self) -> usize {
        self.subflow_count.load(Ordering::Acquire)
    }

    pub fn pending_subflows(&self) -> Arc<Vec<Arc<Subflow>>> {
        self.pending.snapshot()
    }

    pub fn listening_subflows(&self) -> Arc<Vec<Arc<Subflow>>> {
        self.listening.snapshot()
    }

    pub fn active_subflows(&self) -> Arc<Vec<Arc<Subflow>>> {
        self.active.snapshot()
    }

    /// Members of all three sets: active, listening, then pending.
    pub fn all_subflows(&self) -> Vec<Arc<Subflow>> {
        let mut all = Vec::new();
        all.extend(self.active.snapshot().iter().cloned());
        all.extend(self.listening.snapshot().iter().cloned());
        all.extend(self.pending.snapshot().iter().cloned());
        all
    }

    pub fn find_subflow(&self, id: u64) -> Option<Arc<Subflow>> {
        self.all_subflows().into_iter().find(|s| s.id() == id)
    }

    // ---- membership ----

    fn set_for(&self, m: Membership) -> Option<&RcuList<Subflow>> {
        match m {
            Membership::Pending => Some(&self.pending),
            Membership::Listening => Some(&self.listening),
            Membership::Active => Some(&self.active),
            Membership::None => None,
        }
    }

    fn invariant_violation(&self, sf: &Subflow, what: &str) {
        error!(session = self.id, subflow = sf.id(), membership = ?sf.membership(), "{}", what);
        debug_assert!(false, "membership invariant violated: {}", what);
    }

    pub(super) fn link_into(&self, sf: &Arc<Subflow>, m: Membership) {
        let Some(list) = self.set_for(m) else { return };
        let mut guard = list.lock();
        if sf.membership() != Membership::None || guard.contains(sf) {
            drop(guard);
            self.invariant_violation(sf, "subflow linked twice");
            return;
        }
        guard.push_back(sf.clone());
        sf.set_membership(m);
        if m == Membership::Active {
            self.subflow_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Remove `sf` from whichever set holds it.
    pub(super) fn unlink(&self, sf: &Arc<Subflow>) -> Membership {
        loop {
            let m = sf.membership();
            let Some(list) = self.set_for(m) else { return Membership::None };
            let mut guard = list.lock();
            // A promotion may have moved it meanwhile.
            if sf.membership() != m {
                continue;
            }
            if !guard.remove(sf) {
                drop(guard);
                self.invariant_violation(sf, "member missing from its set");
                sf.set_membership(Membership::None);
                return Membership::None;
            }
            if m == Membership::Active {
                self.subflow_count.fetch_sub(1, Ordering::AcqRel);
            }
            sf.set_membership(Membership::None);
            trace!(session = self.id, subflow = sf.id(), from = ?m, "subflow unlinked");
            return m;
        }
    }

    /// Verify, under the set locks, that every member sits in exactly one
    /// set matching its membership mark and that the subflow count equals
    /// the size of the active set.
    pub fn check_invariants(&self) -> bool {
        let _pending = self.pending.lock();
        let active = self.active.lock();
        let _listening = self.listening.lock();

        let mut seen = HashSet::new();
        for (m, members) in [
            (Membership::Pending, self.pending.snapshot()),
            (Membership::Active, self.active.snapshot()),
            (Membership::Listening, self.listening.snapshot()),
        ] {
            for sf in members.iter() {
                if sf.membership() != m || !seen.insert(sf.id()) {
                    return false;
                }
            }
        }
        self.subflow_count() == active.len()
    }

    /// Move an authorized subflow from pending to active.
    pub(crate) fn promote(&self, sf: &Arc<Subflow>) -> Result<()> {
        {
            let mut pending = self.pending.lock();
            let mut active = self.active.lock();

            if active.contains(sf) {
                if sf.membership() != Membership::Active {
                    self.invariant_violation(sf, "active member not marked active");
                }
                return Err(MultipathError::AlreadyInProgress);
            }
            if sf.is_closing() || sf.is_destroyed() {
                return Err(MultipathError::AlreadyInProgress);
            }
            match sf.membership() {
                Membership::Pending => {
                    if !pending.remove(sf) {
                        drop(active);
                        drop(pending);
                        self.invariant_violation(sf, "pending member missing from pending set");
                        return Err(MultipathError::AlreadyInProgress);
                    }
                }
                Membership::None => return Err(MultipathError::AlreadyInProgress),
                _ => return Err(MultipathError::InvalidArgument("subflow is not pending")),
            }

            // Lock-free readers of the active set must find it initialized.
            self.scheduler.init_subflow(sf);
            active.push_back(sf.clone());
            sf.set_membership(Membership::Active);
            self.subflow_count.fetch_add(1, Ordering::AcqRel);
        }

        sf.set_authorized();
        sf.set_state(SubflowState::Active);
        info!(
            session = self.id,
            subflow = sf.id(),
            kex = sf.is_kex_carrier(),
            link = sf.link().map(|l| l.id()),
            subflows = self.subflow_count(),
            "new subflow"
        );
        Ok(())
    }

    // ---- key exchange ----

    fn claim_carrier(&self) -> bool {
        !self.key_exchange_done()
            && self
                .carrier_claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Derive both tokens from the peer's key. Repeated calls are no-ops.
    fn complete_key_exchange(&self, remote: SessionKey, carrier: &Subflow) -> TokenPair {
        let tokens = {
            let mut keys = self.keys.lock().unwrap();
            if let Some(tokens) = keys.tokens {
                return tokens;
            }
            let tokens = TokenPair::derive(&keys.local, &remote);
            keys.remote = Some(remote);
            keys.tokens = Some(tokens);
            tokens
        };
        self.kex_done.store(true, Ordering::Release);
        self.mss_cache.store(carrier.conn().mss(), Ordering::Release);
        self.set_state(SessionState::Open);
        info!(
            session = self.id,
            subflow = carrier.id(),
            local_token = %format!("{:08x}", tokens.local),
            remote_token = %format!("{:08x}", tokens.remote),
            "key exchange complete"
        );
        tokens
    }

    // ---- subflow creation ----

    /// Dial a new subflow from `local` to `remote`.
    ///
    /// The first subflow of a session carries the key exchange and is
    /// dialed blocking, bounded by the connect timeout. Later subflows join
    /// with the derived token and return while their handshake runs.
    pub async fn add_outbound_subflow(
        &self,
        local: SocketAddr,
        if_index: u32,
        remote: SocketAddr,
    ) -> Result<Arc<Subflow>> {
        if self.role != Role::Initiator {
            return Err(MultipathError::InvalidArgument("outbound subflows need the initiator role"));
        }
        if self.is_closed() {
            return Err(MultipathError::SessionClosed);
        }

        let conn = self.ctx.transport().create()?;
        let sf = Arc::new(Subflow::new(conn.clone(), self.me.clone(), self.role, if_index));

        if let Err(e) = conn.bind(local) {
            warn!(session = self.id, %local, error = %e, "failed to bind subflow");
            self.abort_subflow(&sf);
            return Err(e.into());
        }
        sf.attach_link(self.ctx.links().resolve(&local.ip()));

        let carrier = self.claim_carrier();
        if carrier {
            sf.mark_kex_carrier();
            conn.set_local_option(Some(MpOption::Key(self.local_key())));
        } else {
            let Some(tokens) = self.tokens() else {
                self.abort_subflow(&sf);
                return Err(MultipathError::InvalidArgument("key exchange still in progress"));
            };
            conn.set_local_option(Some(MpOption::join(tokens.remote)));
            conn.set_retransmit_timeout(self.config.join_retransmit_timeout());
        }

        sf.install_hooks(&SubflowEvents::new(&sf), &INITIATOR_HOOKS);
        self.link_into(&sf, Membership::Pending);
        debug!(session = self.id, subflow = sf.id(), %local, %remote, kex = carrier, "dialing subflow");

        let connected = if carrier {
            match tokio::time::timeout(self.config.connect_timeout(), conn.connect(remote, true)).await {
                Ok(res) => res.map_err(MultipathError::from),
                Err(_) => Err(MultipathError::Timeout),
            }
        } else {
            match conn.connect(remote, false).await {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                res => res.map_err(MultipathError::from),
            }
        };
        if let Err(e) = connected {
            warn!(session = self.id, subflow = sf.id(), %remote, error = %e, "failed to connect subflow");
            self.abort_subflow(&sf);
            if carrier {
                self.carrier_claimed.store(false, Ordering::Release);
            }
            return Err(e);
        }

        if carrier && !self.key_exchange_done() {
            match conn.remote_option() {
                Some(MpOption::Key(remote_key)) => {
                    self.complete_key_exchange(remote_key, &sf);
                }
                _ => {
                    self.abort_subflow(&sf);
                    self.carrier_claimed.store(false, Ordering::Release);
                    return Err(MultipathError::ProtocolViolation(
                        "peer did not return its key".into(),
                    ));
                }
            }
        }
        Ok(sf)
    }

    /// Open a passive socket on `local` that accepts joining subflows.
    pub fn add_listener(&self, local: SocketAddr, if_index: u32) -> Result<Arc<Subflow>> {
        if self.role != Role::Responder {
            return Err(MultipathError::InvalidArgument("listeners need the responder role"));
        }
        if self.is_closed() {
            return Err(MultipathError::SessionClosed);
        }

        let conn = self.ctx.transport().create()?;
        let sf = Arc::new(Subflow::new(conn.clone(), self.me.clone(), self.role, if_index));
        sf.install_hooks(&SubflowEvents::new(&sf), &LISTENER_HOOKS);

        if let Err(e) = conn.bind(local) {
            warn!(session = self.id, %local, error = %e, "failed to bind listener");
            self.abort_subflow(&sf);
            return Err(e.into());
        }
        sf.attach_link(self.ctx.links().resolve(&local.ip()));

        if let Err(e) = conn.listen(self.config.listen_backlog) {
            warn!(session = self.id, %local, error = %e, "failed to listen");
            self.abort_subflow(&sf);
            return Err(e.into());
        }

        self.link_into(&sf, Membership::Listening);
        sf.set_state(SubflowState::Listening);
        if self.state() == SessionState::Init {
            self.set_state(SessionState::Listening);
        }
        info!(
            session = self.id,
            subflow = sf.id(),
            addr = ?conn.local_addr(),
            listeners = self.listening.len(),
            "listener added"
        );
        Ok(sf)
    }

    /// A listener produced `child`. Authorize it from its handshake option
    /// and admit it, or reject and close it.
    pub(crate) fn accept_subflow(&self, listener: &Arc<Subflow>, child: ConnectionRef) {
        let sf = Arc::new(Subflow::new(child.clone(), self.me.clone(), self.role, listener.if_index()));
        let link = match child.local_addr() {
            Some(addr) => self.ctx.links().resolve(&addr.ip()),
            None => self.ctx.links().fallback_link(),
        };
        sf.attach_link(link);
        sf.install_hooks(&SubflowEvents::new(&sf), &CHILD_HOOKS);
        self.link_into(&sf, Membership::Pending);

        let admitted = self.authorize_child(&sf).and_then(|()| match self.promote(&sf) {
            Err(MultipathError::AlreadyInProgress) => Ok(()),
            other => other,
        });
        match admitted {
            Ok(()) => self.push_pending_quiet(),
            Err(e) => {
                warn!(
                    session = self.id,
                    listener = listener.id(),
                    subflow = sf.id(),
                    error = %e,
                    "rejecting subflow"
                );
                self.abort_subflow(&sf);
            }
        }
    }

    fn authorize_child(&self, sf: &Arc<Subflow>) -> Result<()> {
        let conn = sf.conn();
        sf.set_state(SubflowState::Authorizing);
        match conn.remote_option() {
            Some(MpOption::Key(remote_key)) => {
                if !self.claim_carrier() {
                    return Err(MultipathError::ProtocolViolation(
                        "key exchange repeated on an established session".into(),
                    ));
                }
                sf.mark_kex_carrier();
                self.complete_key_exchange(remote_key, sf);
                conn.set_local_option(Some(MpOption::Key(self.local_key())));
                Ok(())
            }
            Some(MpOption::Join { token, nonce }) => {
                let tokens = self
                    .tokens()
                    .ok_or_else(|| MultipathError::NotAuthorized("join before key exchange".into()))?;
                if token != tokens.local {
                    return Err(MultipathError::NotAuthorized(format!("unknown token {:08x}", token)));
                }
                trace!(session = self.id, subflow = sf.id(), nonce, "join token accepted");
                conn.set_local_option(Some(MpOption::join(tokens.remote)));
                Ok(())
            }
            None => Err(MultipathError::ProtocolViolation("handshake without multipath option".into())),
        }
    }

    /// The peer's reply on a joining subflow must carry our local token.
    fn verify_join_reply(&self, sf: &Subflow) -> Result<()> {
        let tokens = self
            .tokens()
            .ok_or_else(|| MultipathError::NotAuthorized("join before key exchange".into()))?;
        match sf.conn().remote_option() {
            Some(MpOption::Join { token, .. }) if token == tokens.local => Ok(()),
            Some(MpOption::Join { token, .. }) => {
                Err(MultipathError::NotAuthorized(format!("peer answered with token {:08x}", token)))
            }
            _ => Err(MultipathError::ProtocolViolation("join answered without join option".into())),
        }
    }

    /// Handshake progress on an initiator subflow.
    pub(crate) fn on_state_change(&self, sf: &Arc<Subflow>) {
        let state = sf.conn().state();
        trace!(session = self.id, subflow = sf.id(), ?state, "transport state change");

        if state == ConnState::Closed || state.is_passive_close() {
            if sf.membership() != Membership::None {
                self.schedule_close(sf);
            }
            return;
        }

        // The carrier is usable at PARTOPEN, joins wait for the final ack.
        let ready = (state == ConnState::PartOpen && sf.is_kex_carrier()) || state == ConnState::Open;
        if !ready || sf.membership() == Membership::Active {
            return;
        }

        sf.set_state(SubflowState::Authorizing);
        let authorized = if sf.is_kex_carrier() {
            match sf.conn().remote_option() {
                Some(MpOption::Key(remote_key)) => {
                    self.complete_key_exchange(remote_key, sf);
                    Ok(())
                }
                _ => Err(MultipathError::ProtocolViolation("carrier handshake without peer key".into())),
            }
        } else {
            self.verify_join_reply(sf)
        };
        if let Err(e) = authorized {
            warn!(session = self.id, subflow = sf.id(), error = %e, "subflow failed authorization");
            self.schedule_close(sf);
            return;
        }

        match self.promote(sf) {
            Ok(()) => self.push_pending_quiet(),
            Err(MultipathError::AlreadyInProgress) => {
                trace!(session = self.id, subflow = sf.id(), "duplicate promotion absorbed");
            }
            Err(e) => warn!(session = self.id, subflow = sf.id(), error = %e, "promotion failed"),
        }
    }

    // ---- teardown ----

    /// Schedule teardown of `sf` on the work queue. Only the first caller
    /// per subflow schedules anything; returns whether this call did.
    pub fn schedule_close(&self, sf: &Arc<Subflow>) -> bool {
        if !sf.begin_close() {
            trace!(session = self.id, subflow = sf.id(), "close already scheduled");
            return false;
        }
        let Some(session) = self.arc() else {
            sf.conn().close();
            return true;
        };
        let job_sf = sf.clone();
        if !self.ctx.work().schedule(move || session.run_close(&job_sf)) {
            warn!(session = self.id, subflow = sf.id(), "work queue stopped, closing inline");
            self.run_close(sf);
        }
        debug!(session = self.id, subflow = sf.id(), "close scheduled");
        true
    }

    fn run_close(&self, sf: &Subflow) {
        let conn = sf.conn();
        if conn.state().is_passive_close() {
            conn.finish_passive_close();
        }
        debug!(session = self.id, subflow = sf.id(), state = ?conn.state(), "closing subflow");
        conn.close();
    }

    /// Close a subflow of this session. A repeated close is absorbed.
    pub fn close_subflow(&self, sf: &Arc<Subflow>) -> Result<()> {
        match sf.session() {
            Some(owner) if owner.id == self.id => {}
            _ => return Err(MultipathError::InvalidArgument("subflow belongs to another session")),
        }
        self.schedule_close(sf);
        Ok(())
    }

    pub fn close_subflow_by_id(&self, id: u64) -> Result<()> {
        let sf = self
            .find_subflow(id)
            .ok_or(MultipathError::InvalidArgument("unknown subflow"))?;
        self.close_subflow(&sf)
    }

    /// Tear down a subflow that never got going.
    fn abort_subflow(&self, sf: &Arc<Subflow>) {
        sf.begin_close();
        sf.conn().close();
        self.destroy_subflow(sf);
    }

    /// The connection's teardown notification fired.
    pub(crate) fn destroy_subflow(&self, sf: &Arc<Subflow>) {
        if !sf.begin_destroy() {
            return;
        }
        let was = self.unlink(sf);
        sf.release_link();
        self.reorder.release_path(sf);
        sf.clear_sched_state();
        let saved = sf.restore_hooks();
        sf.set_state(SubflowState::Destroyed);
        info!(
            session = self.id,
            subflow = sf.id(),
            from = ?was,
            subflows = self.subflow_count(),
            "subflow destroyed"
        );
        if let Some(saved) = saved {
            saved.destruct(sf.conn());
        }

        if was == Membership::Active && self.subflow_count() == 0 && !self.is_closed() {
            debug!(session = self.id, "last active subflow gone, closing session");
            self.schedule_shutdown();
        }
    }

    fn schedule_shutdown(&self) {
        let Some(session) = self.arc() else { return };
        let job = session.clone();
        let queued = self.ctx.work().schedule(move || {
            if let Err(e) = job.shutdown() {
                warn!(session = job.id, error = %e, "session teardown incomplete");
            }
        });
        if !queued {
            if let Err(e) = session.shutdown() {
                warn!(session = self.id, error = %e, "session teardown incomplete");
            }
        }
    }

    /// Tear the session down: leave the registry, close every subflow
    /// (active, listening, pending), release the strategies.
    ///
    /// Every subflow is closed even if one fails; the first error is
    /// returned.
    pub fn shutdown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.state.lock().unwrap() = SessionState::Closed;
        if let Some(me) = self.arc() {
            self.ctx.registry().remove(&me);
        }

        let mut first_error = None;
        for set in [&self.active, &self.listening, &self.pending] {
            for sf in set.snapshot().iter() {
                if let Err(e) = self.close_subflow(sf) {
                    warn!(session = self.id, subflow = sf.id(), error = %e, "failed to close subflow");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.reorder.release_all(self);
        self.scheduler.release(self);
        self.path_manager.release(self);
        self.tx_queue.lock().unwrap().clear();
        self.rx_notify.notify_waiters();

        info!(
            session = self.id,
            delivered = self.stats.delivered(),
            dropped = self.stats.dropped(),
            sent = self.stats.sent(),
            "session closed"
        );
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("subflows", &self.subflow_count())
            .field("kex_done", &self.key_exchange_done())
            .finish()
    }
}
