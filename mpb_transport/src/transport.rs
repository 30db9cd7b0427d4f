//! Transport abstraction the session controller attaches to.
//!
//! A [`DatagramConnection`] is one connection-oriented, unreliable datagram
//! transport endpoint provided by the host stack. The controller never owns
//! a connection's protocol machinery; it intercepts the connection's event
//! hooks and drives it through this narrow surface.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mpb_core::types::{MpOption, Packet};
use tokio::sync::watch;

pub type ConnectionRef = Arc<dyn DatagramConnection>;
pub type EventsRef = Arc<dyn ConnectionEvents>;

/// Connection states of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Closed,
    Requesting,
    Listen,
    Respond,
    PartOpen,
    Open,
    PassiveClose,
    PassiveCloseReq,
    Closing,
}

impl ConnState {
    /// Data may flow.
    pub fn is_established(&self) -> bool {
        matches!(self, ConnState::Open | ConnState::PartOpen)
    }

    /// Handshake still running.
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnState::Requesting | ConnState::Respond)
    }

    /// The peer started the close.
    pub fn is_passive_close(&self) -> bool {
        matches!(self, ConnState::PassiveClose | ConnState::PassiveCloseReq)
    }
}

/// Event hook slots on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    DataReady,
    BacklogRcv,
    StateChange,
    Accept,
    Destruct,
    WriteSpace,
}

impl HookKind {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        match self {
            HookKind::DataReady => 0,
            HookKind::BacklogRcv => 1,
            HookKind::StateChange => 2,
            HookKind::Accept => 3,
            HookKind::Destruct => 4,
            HookKind::WriteSpace => 5,
        }
    }
}

/// Notifications a connection delivers to whoever occupies its hook slots.
///
/// Hooks run in the transport's notification context: they must not block.
pub trait ConnectionEvents: Send + Sync {
    /// A packet can be read.
    fn data_ready(&self, _conn: &ConnectionRef) {}

    /// A packet is being processed on the connection's backlog.
    fn backlog_rcv(&self, _conn: &ConnectionRef, _packet: &Packet) -> io::Result<()> {
        Ok(())
    }

    /// The connection state changed.
    fn state_change(&self, _conn: &ConnectionRef) {}

    /// A listening connection produced a new child connection.
    fn accept(&self, _listener: &ConnectionRef, _child: ConnectionRef) {}

    /// The connection is being torn down. Fires once.
    fn destruct(&self, _conn: &ConnectionRef) {}

    /// A full send queue has room again.
    fn write_space(&self, _conn: &ConnectionRef) {}
}

/// One transport connection.
#[async_trait]
pub trait DatagramConnection: Send + Sync {
    fn id(&self) -> u64;

    fn state(&self) -> ConnState;

    fn subscribe_state(&self) -> watch::Receiver<ConnState>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn bind(&self, addr: SocketAddr) -> io::Result<()>;

    fn listen(&self, backlog: u32) -> io::Result<()>;

    /// Start the handshake. A non-blocking connect that is still running
    /// returns `ErrorKind::WouldBlock`.
    async fn connect(&self, remote: SocketAddr, blocking: bool) -> io::Result<()>;

    /// Pull one packet without blocking.
    fn recv_packet(&self) -> Option<Packet>;

    /// Current maximum segment size.
    fn mss(&self) -> usize;

    /// Smoothed round-trip time estimate.
    fn srtt(&self) -> Duration;

    fn queue_full(&self) -> bool;

    /// Append a packet to the send queue.
    fn push(&self, packet: Packet);

    fn xmit_timer_pending(&self) -> bool;

    /// Transmit whatever the send queue allows right now.
    fn write_xmit(&self);

    fn finish_passive_close(&self);

    fn close(&self);

    fn set_retransmit_timeout(&self, rto: Duration);

    fn local_option(&self) -> Option<MpOption>;

    fn set_local_option(&self, option: Option<MpOption>);

    /// Handshake option received from the peer.
    fn remote_option(&self) -> Option<MpOption>;

    /// Install `hook` in the given slot, returning the previous occupant.
    fn replace_hook(&self, kind: HookKind, hook: Option<EventsRef>) -> Option<EventsRef>;
}

/// Creates unbound transport connections.
pub trait TransportProvider: Send + Sync {
    fn create(&self) -> io::Result<ConnectionRef>;
}
