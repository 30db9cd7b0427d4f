//! In-memory datagram transport.
//!
//! Connections created by one [`SimNetwork`] reach each other by address.
//! Handshakes complete instantly on `connect` and carry the multipath
//! handshake option both ways; pushed packets are delivered to the peer on
//! `write_xmit`. Every transport event is raised through the connection's
//! hook slots, so a session controller attached to these connections sees
//! the same notification sequence a host stack would produce.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mpb_core::types::{MpOption, Packet, PacketType};
use tokio::sync::watch;
use tracing::debug;

use crate::transport::{
    ConnState, ConnectionEvents, ConnectionRef, DatagramConnection, EventsRef, HookKind,
    TransportProvider,
};

/// Link characteristics applied to every connection of a network.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub mss: usize,
    pub queue_capacity: usize,
    pub srtt: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mss: 1400,
            queue_capacity: 64,
            srtt: Duration::from_millis(20),
        }
    }
}

pub struct SimNetwork {
    config: SimConfig,
    me: Weak<SimNetwork>,
    listeners: DashMap<SocketAddr, Weak<SimConnection>>,
    connections: DashMap<u64, Weak<SimConnection>>,
    default_hooks: Mutex<Option<EventsRef>>,
    next_id: AtomicU64,
    next_port: AtomicU16,
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            listeners: DashMap::new(),
            connections: DashMap::new(),
            default_hooks: Mutex::new(None),
            next_id: AtomicU64::new(1),
            next_port: AtomicU16::new(40000),
        })
    }

    /// Handler placed in every hook slot of connections created afterwards,
    /// standing in for the stack's own handlers.
    pub fn set_default_hooks(&self, hooks: Option<EventsRef>) {
        *self.default_hooks.lock().unwrap() = hooks;
    }

    pub fn connection(&self) -> Arc<SimConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, _) = watch::channel(ConnState::Closed);
        let defaults = self.default_hooks.lock().unwrap().clone();
        let mut hooks: [Option<EventsRef>; HookKind::COUNT] = Default::default();
        if let Some(defaults) = defaults {
            for kind in [
                HookKind::DataReady,
                HookKind::BacklogRcv,
                HookKind::StateChange,
                HookKind::Destruct,
                HookKind::WriteSpace,
            ] {
                hooks[kind.index()] = Some(defaults.clone());
            }
        }

        let conn = Arc::new_cyclic(|me| SimConnection {
            id,
            network: self.me.clone(),
            me: me.clone(),
            state_tx,
            inner: Mutex::new(SimInner::default()),
            hooks: Mutex::new(hooks),
            mss: AtomicUsize::new(self.config.mss),
            queue_capacity: AtomicUsize::new(self.config.queue_capacity),
            srtt: self.config.srtt,
            timer_pending: AtomicBool::new(false),
            destructed: AtomicBool::new(false),
            transmitted: AtomicU64::new(0),
        });
        self.connections.insert(id, Arc::downgrade(&conn));
        conn
    }

    /// Look up a live connection by id.
    pub fn connection_by_id(&self, id: u64) -> Option<Arc<SimConnection>> {
        self.connections.get(&id).and_then(|c| c.upgrade())
    }

    fn listener(&self, addr: &SocketAddr) -> Option<Arc<SimConnection>> {
        self.listeners
            .get(addr)
            .and_then(|l| l.upgrade())
            .filter(|l| l.state() == ConnState::Listen)
    }

    fn register_listener(&self, addr: SocketAddr, conn: &Arc<SimConnection>) -> io::Result<()> {
        if self.listener(&addr).is_some() {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{} already listening", addr)));
        }
        self.listeners.insert(addr, Arc::downgrade(conn));
        Ok(())
    }

    fn unregister_listener(&self, addr: &SocketAddr, id: u64) {
        self.listeners
            .remove_if(addr, |_, l| l.upgrade().map_or(true, |l| l.id == id));
    }

    fn ephemeral(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.next_port.fetch_add(1, Ordering::Relaxed))
    }
}

impl TransportProvider for SimNetwork {
    fn create(&self) -> io::Result<ConnectionRef> {
        Ok(self.connection())
    }
}

#[derive(Default)]
struct SimInner {
    local: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    peer: Weak<SimConnection>,
    rx: VecDeque<Packet>,
    tx: VecDeque<Packet>,
    local_option: Option<MpOption>,
    remote_option: Option<MpOption>,
    rto: Option<Duration>,
    backlog: u32,
}

pub struct SimConnection {
    id: u64,
    network: Weak<SimNetwork>,
    me: Weak<SimConnection>,
    state_tx: watch::Sender<ConnState>,
    inner: Mutex<SimInner>,
    hooks: Mutex<[Option<EventsRef>; HookKind::COUNT]>,
    mss: AtomicUsize,
    queue_capacity: AtomicUsize,
    srtt: Duration,
    timer_pending: AtomicBool,
    destructed: AtomicBool,
    transmitted: AtomicU64,
}

impl SimConnection {
    pub fn set_mss(&self, mss: usize) {
        self.mss.store(mss, Ordering::Relaxed);
    }

    pub fn set_queue_capacity(&self, capacity: usize) {
        self.queue_capacity.store(capacity, Ordering::Relaxed);
    }

    /// Hold pushed packets in the send queue until [`fire_xmit_timer`](Self::fire_xmit_timer).
    pub fn set_xmit_timer_pending(&self, pending: bool) {
        self.timer_pending.store(pending, Ordering::Relaxed);
    }

    pub fn fire_xmit_timer(&self) {
        self.timer_pending.store(false, Ordering::Relaxed);
        self.write_xmit();
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().tx.len()
    }

    pub fn pending_rx(&self) -> usize {
        self.inner.lock().unwrap().rx.len()
    }

    /// Packets delivered to the peer so far.
    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    pub fn retransmit_timeout(&self) -> Option<Duration> {
        self.inner.lock().unwrap().rto
    }

    pub fn peer(&self) -> Option<Arc<SimConnection>> {
        self.inner.lock().unwrap().peer.upgrade()
    }

    pub fn hook(&self, kind: HookKind) -> Option<EventsRef> {
        self.hooks.lock().unwrap()[kind.index()].clone()
    }

    pub fn is_destructed(&self) -> bool {
        self.destructed.load(Ordering::Acquire)
    }

    /// Deliver a packet as if it had arrived from the peer.
    pub fn inject(&self, packet: Packet) {
        self.deliver(packet);
    }

    fn as_conn(&self) -> Option<ConnectionRef> {
        self.me.upgrade().map(|c| c as ConnectionRef)
    }

    fn set_state(&self, state: ConnState) {
        self.state_tx.send_replace(state);
    }

    fn fire(&self, kind: HookKind, call: impl FnOnce(&dyn ConnectionEvents, &ConnectionRef)) {
        if let (Some(hook), Some(conn)) = (self.hook(kind), self.as_conn()) {
            call(hook.as_ref(), &conn);
        }
    }

    fn deliver(&self, packet: Packet) {
        let state = self.state();
        if !state.is_established() && !state.is_passive_close() {
            debug!(conn = self.id, ?state, "sim: dropping packet on idle connection");
            return;
        }
        let kind = packet.kind;
        self.inner.lock().unwrap().rx.push_back(packet);
        self.fire(HookKind::DataReady, |h, c| h.data_ready(c));

        let next = match kind {
            PacketType::Close => Some(ConnState::PassiveClose),
            PacketType::CloseReq => Some(ConnState::PassiveCloseReq),
            _ => None,
        };
        if let Some(next) = next {
            if self.state().is_established() {
                self.set_state(next);
                self.fire(HookKind::StateChange, |h, c| h.state_change(c));
            }
        }
    }

    fn handshake(self: &Arc<Self>, remote: SocketAddr) -> io::Result<()> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network gone"))?;

        let Some(listener) = network.listener(&remote) else {
            self.set_state(ConnState::Closed);
            self.fire(HookKind::StateChange, |h, c| h.state_change(c));
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, format!("no listener at {}", remote)));
        };

        let (local, option) = {
            let inner = self.inner.lock().unwrap();
            (inner.local, inner.local_option)
        };

        let child = network.connection();
        {
            let mut inner = child.inner.lock().unwrap();
            inner.local = Some(remote);
            inner.peer_addr = local;
            inner.remote_option = option;
            inner.peer = Arc::downgrade(self);
        }
        child.set_state(ConnState::Respond);

        listener.fire(HookKind::BacklogRcv, |h, c| {
            if let Err(e) = h.backlog_rcv(c, &Packet::control(PacketType::Request)) {
                debug!(conn = listener.id, error = %e, "sim: backlog handler failed");
            }
        });
        let child_ref: ConnectionRef = child.clone();
        listener.fire(HookKind::Accept, |h, c| h.accept(c, child_ref));

        if child.state() == ConnState::Closed {
            self.set_state(ConnState::Closed);
            self.fire(HookKind::StateChange, |h, c| h.state_change(c));
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "handshake rejected"));
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.peer = Arc::downgrade(&child);
            inner.peer_addr = Some(remote);
            inner.remote_option = child.local_option();
        }

        // The responder side opens on the client's first ack, so data the
        // client sends from PARTOPEN on is accepted.
        child.set_state(ConnState::Open);
        child.fire(HookKind::StateChange, |h, c| h.state_change(c));

        self.set_state(ConnState::PartOpen);
        self.fire(HookKind::StateChange, |h, c| h.state_change(c));

        if self.state() == ConnState::PartOpen {
            self.set_state(ConnState::Open);
            self.fire(HookKind::StateChange, |h, c| h.state_change(c));
        }
        Ok(())
    }
}

#[async_trait]
impl DatagramConnection for SimConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().peer_addr
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network gone"))?;
        let addr = if addr.port() == 0 { network.ephemeral(addr.ip()) } else { addr };
        let mut inner = self.inner.lock().unwrap();
        if inner.local.is_some() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "already bound"));
        }
        inner.local = Some(addr);
        Ok(())
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection gone"))?;
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network gone"))?;
        let local = {
            let mut inner = self.inner.lock().unwrap();
            inner.backlog = backlog;
            inner.local
        };
        let local = local.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "listen on unbound connection"))?;
        if self.state() != ConnState::Closed {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "connection not idle"));
        }
        network.register_listener(local, &me)?;
        self.set_state(ConnState::Listen);
        Ok(())
    }

    async fn connect(&self, remote: SocketAddr, blocking: bool) -> io::Result<()> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection gone"))?;
        if self.state() != ConnState::Closed {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "connection not idle"));
        }
        if self.local_addr().is_none() {
            self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))?;
        }

        self.set_state(ConnState::Requesting);
        self.fire(HookKind::StateChange, |h, c| h.state_change(c));

        if blocking {
            return me.handshake(remote);
        }
        tokio::spawn(async move {
            if let Err(e) = me.handshake(remote) {
                debug!(conn = me.id, error = %e, "sim: background handshake failed");
            }
        });
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn recv_packet(&self) -> Option<Packet> {
        self.inner.lock().unwrap().rx.pop_front()
    }

    fn mss(&self) -> usize {
        self.mss.load(Ordering::Relaxed)
    }

    fn srtt(&self) -> Duration {
        self.srtt
    }

    fn queue_full(&self) -> bool {
        self.inner.lock().unwrap().tx.len() >= self.queue_capacity.load(Ordering::Relaxed)
    }

    fn push(&self, packet: Packet) {
        self.inner.lock().unwrap().tx.push_back(packet);
    }

    fn xmit_timer_pending(&self) -> bool {
        self.timer_pending.load(Ordering::Relaxed)
    }

    fn write_xmit(&self) {
        let (packets, peer, was_full) = {
            let mut inner = self.inner.lock().unwrap();
            let was_full = inner.tx.len() >= self.queue_capacity.load(Ordering::Relaxed);
            let packets: Vec<Packet> = inner.tx.drain(..).collect();
            (packets, inner.peer.upgrade(), was_full)
        };
        match peer {
            Some(peer) => {
                for packet in packets {
                    self.transmitted.fetch_add(1, Ordering::Relaxed);
                    peer.deliver(packet);
                }
            }
            None => debug!(conn = self.id, dropped = packets.len(), "sim: no peer, discarding send queue"),
        }
        if was_full {
            self.fire(HookKind::WriteSpace, |h, c| h.write_space(c));
        }
    }

    fn finish_passive_close(&self) {
        if self.state().is_passive_close() {
            self.set_state(ConnState::Closing);
        }
    }

    fn close(&self) {
        if self.destructed.load(Ordering::Acquire) {
            return;
        }
        let previous = self.state();
        let (peer, local) = {
            let mut inner = self.inner.lock().unwrap();
            inner.tx.clear();
            (std::mem::take(&mut inner.peer), inner.local)
        };
        if previous.is_established() {
            if let Some(peer) = peer.upgrade() {
                peer.deliver(Packet::control(PacketType::Close));
            }
        }
        if previous == ConnState::Listen {
            if let (Some(network), Some(local)) = (self.network.upgrade(), local) {
                network.unregister_listener(&local, self.id);
            }
        }

        self.set_state(ConnState::Closed);
        self.fire(HookKind::StateChange, |h, c| h.state_change(c));

        if !self.destructed.swap(true, Ordering::AcqRel) {
            self.fire(HookKind::Destruct, |h, c| h.destruct(c));
        }
    }

    fn set_retransmit_timeout(&self, rto: Duration) {
        self.inner.lock().unwrap().rto = Some(rto);
    }

    fn local_option(&self) -> Option<MpOption> {
        self.inner.lock().unwrap().local_option
    }

    fn set_local_option(&self, option: Option<MpOption>) {
        self.inner.lock().unwrap().local_option = option;
    }

    fn remote_option(&self) -> Option<MpOption> {
        self.inner.lock().unwrap().remote_option
    }

    fn replace_hook(&self, kind: HookKind, hook: Option<EventsRef>) -> Option<EventsRef> {
        std::mem::replace(&mut self.hooks.lock().unwrap()[kind.index()], hook)
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        if let Some(network) = self.network.upgrade() {
            network.connections.remove(&self.id);
        }
    }
}
