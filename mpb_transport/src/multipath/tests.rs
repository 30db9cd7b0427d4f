use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mpb_core::types::{MpOption, PacketType, Role, SessionKey};
use mpb_core::MultipathError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::config::{SchedulerAlgorithm, SessionConfig};
use crate::link::StaticLinkRegistry;
use crate::sim::{SimConfig, SimConnection, SimNetwork};
use crate::transport::{ConnState, ConnectionEvents, ConnectionRef, DatagramConnection, EventsRef, HookKind};

const LISTEN: &str = "10.0.0.1:9000";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

struct Harness {
    net: Arc<SimNetwork>,
    links: Arc<StaticLinkRegistry>,
    ctx: MultipathContext,
}

impl Harness {
    fn new() -> Self {
        let net = SimNetwork::new(SimConfig::default());
        let links = Arc::new(StaticLinkRegistry::new());
        let ctx = MultipathContext::new(net.clone(), links.clone());
        Self { net, links, ctx }
    }

    fn responder(&self, config: SessionConfig) -> Arc<Session> {
        let session = self.ctx.session(Role::Responder).config(config).build().unwrap();
        session.add_listener(addr(LISTEN), 1).unwrap();
        session
    }

    fn initiator(&self, config: SessionConfig) -> Arc<Session> {
        self.ctx.session(Role::Initiator).config(config).build().unwrap()
    }

    /// Initiator and responder joined by one key-exchange carrier.
    async fn pair(&self, config: SessionConfig) -> (Arc<Session>, Arc<Session>) {
        let responder = self.responder(config.clone());
        let initiator = self.initiator(config);
        initiator
            .add_outbound_subflow(addr("10.0.0.2:0"), 2, addr(LISTEN))
            .await
            .unwrap();
        (initiator, responder)
    }

    fn sim(&self, sf: &Subflow) -> Arc<SimConnection> {
        self.net.connection_by_id(sf.id()).unwrap()
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Same handler object, independent of which vtable the pointers carry.
fn same_hook(a: &EventsRef, b: &EventsRef) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Default)]
struct StackHooks {
    destructs: AtomicUsize,
}

impl ConnectionEvents for StackHooks {
    fn destruct(&self, _conn: &ConnectionRef) {
        self.destructs.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_key_exchange_tokens_mirror() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;

    assert!(initiator.key_exchange_done());
    assert!(responder.key_exchange_done());
    let i = initiator.tokens().unwrap();
    let r = responder.tokens().unwrap();
    assert_eq!(i.remote, r.local);
    assert_eq!(i.local, r.remote);
    assert_eq!(initiator.remote_key(), Some(responder.local_key()));

    assert_eq!(initiator.state(), SessionState::Open);
    assert_eq!(responder.state(), SessionState::Open);
    assert_eq!(initiator.subflow_count(), 1);
    assert_eq!(responder.subflow_count(), 1);
    assert!(initiator.active_subflows()[0].is_kex_carrier());
    assert_eq!(initiator.active_subflows()[0].state(), SubflowState::Active);
    assert!(initiator.check_invariants());
    assert!(responder.check_invariants());
}

#[tokio::test]
async fn test_fixed_keys_give_known_tokens() {
    let h = Harness::new();
    let responder = h
        .ctx
        .session(Role::Responder)
        .local_key(SessionKey([0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10]))
        .build()
        .unwrap();
    responder.add_listener(addr(LISTEN), 1).unwrap();
    let initiator = h
        .ctx
        .session(Role::Initiator)
        .local_key(SessionKey([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]))
        .build()
        .unwrap();
    initiator
        .add_outbound_subflow(addr("10.0.0.2:0"), 2, addr(LISTEN))
        .await
        .unwrap();

    assert_eq!(initiator.tokens().unwrap().local, 0x2cc4_2983);
    assert_eq!(responder.tokens().unwrap().local, 0xe055_999e);
}

#[tokio::test]
async fn test_join_reaches_active_without_second_key_exchange() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;
    let tokens = initiator.tokens().unwrap();
    let remote_key = initiator.remote_key();

    let join = initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert!(!join.is_kex_carrier());
    assert!(matches!(
        join.conn().local_option(),
        Some(MpOption::Join { token, .. }) if token == tokens.remote
    ));
    assert_eq!(h.sim(&join).retransmit_timeout(), Some(Duration::from_millis(200)));

    assert!(wait_for(|| initiator.subflow_count() == 2).await);
    assert_eq!(responder.subflow_count(), 2);
    assert_eq!(join.state(), SubflowState::Active);
    assert!(join.is_authorized());
    assert_eq!(initiator.tokens(), Some(tokens));
    assert_eq!(initiator.remote_key(), remote_key);
    assert!(initiator.pending_subflows().is_empty());
    assert!(initiator.check_invariants());
}

#[tokio::test]
async fn test_join_with_unknown_token_rejected() {
    let h = Harness::new();
    let (_initiator, responder) = h.pair(SessionConfig::default()).await;

    let rogue = h.net.connection();
    rogue.set_local_option(Some(MpOption::Join {
        token: responder.tokens().unwrap().local ^ 1,
        nonce: 7,
    }));
    let err = rogue.connect(addr(LISTEN), true).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

    assert_eq!(responder.subflow_count(), 1);
    assert!(responder.pending_subflows().is_empty());
    assert!(responder.check_invariants());
}

#[tokio::test]
async fn test_second_key_exchange_rejected() {
    let h = Harness::new();
    let (_initiator, responder) = h.pair(SessionConfig::default()).await;
    let tokens = responder.tokens();

    let rogue = h.net.connection();
    rogue.set_local_option(Some(MpOption::Key(SessionKey::generate())));
    assert!(rogue.connect(addr(LISTEN), true).await.is_err());
    assert_eq!(responder.tokens(), tokens);
    assert_eq!(responder.subflow_count(), 1);
}

#[tokio::test]
async fn test_carrier_connect_refused_releases_subflow() {
    let h = Harness::new();
    let initiator = h.initiator(SessionConfig::default());

    let err = initiator
        .add_outbound_subflow(addr("10.0.0.2:0"), 2, addr(LISTEN))
        .await
        .unwrap_err();
    assert!(matches!(err, MultipathError::Transport(ref e) if e.kind() == std::io::ErrorKind::ConnectionRefused));
    assert!(initiator.all_subflows().is_empty());
    assert!(!initiator.key_exchange_done());

    // The next dial carries the key exchange again.
    let _responder = h.responder(SessionConfig::default());
    let sf = initiator
        .add_outbound_subflow(addr("10.0.0.2:0"), 2, addr(LISTEN))
        .await
        .unwrap();
    assert!(sf.is_kex_carrier());
    assert!(initiator.key_exchange_done());
}

#[tokio::test]
async fn test_role_checks() {
    let h = Harness::new();
    let initiator = h.initiator(SessionConfig::default());
    let responder = h.ctx.session(Role::Responder).build().unwrap();

    assert!(matches!(
        initiator.add_listener(addr(LISTEN), 1),
        Err(MultipathError::InvalidArgument(_))
    ));
    assert!(matches!(
        responder.add_outbound_subflow(addr("10.0.0.2:0"), 2, addr(LISTEN)).await,
        Err(MultipathError::InvalidArgument(_))
    ));
    assert!(matches!(initiator.close_subflow_by_id(u64::MAX), Err(MultipathError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_invalid_config_reason_reported() {
    let h = Harness::new();
    let config = SessionConfig::builder().listen_backlog(0).build();
    let err = h.ctx.session(Role::Responder).config(config).build().unwrap_err();
    assert!(matches!(err, MultipathError::Config(ref reason) if reason.contains("listen_backlog")));
    assert!(h.ctx.registry().is_empty());
}

#[tokio::test]
async fn test_data_flows_both_ways() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;

    let dsn = initiator.send(Bytes::from_static(b"hello")).unwrap();
    assert_eq!(dsn, 0);
    assert_eq!(responder.recv().await.unwrap().as_ref(), b"hello");

    responder.send(Bytes::from_static(b"world")).unwrap();
    assert_eq!(initiator.recv().await.unwrap().as_ref(), b"world");

    assert_eq!(initiator.stats().sent(), 1);
    assert_eq!(responder.stats().delivered(), 1);
    assert_eq!(responder.remote_sequence(), 1);
}

#[tokio::test]
async fn test_send_queue_drains_on_promotion() {
    let h = Harness::new();
    let responder = h.responder(SessionConfig::default());
    let initiator = h.initiator(SessionConfig::default());

    initiator.send(Bytes::from_static(b"early")).unwrap();
    assert_eq!(initiator.queued_records(), 1);

    initiator
        .add_outbound_subflow(addr("10.0.0.2:0"), 2, addr(LISTEN))
        .await
        .unwrap();
    assert_eq!(initiator.queued_records(), 0);
    assert_eq!(responder.try_recv().unwrap().as_ref(), b"early");
}

#[tokio::test]
async fn test_oversized_buffer_rejected_without_enqueue() {
    let h = Harness::new();
    let (initiator, _responder) = h.pair(SessionConfig::default()).await;
    let sf = initiator.active_subflows()[0].clone();
    let conn = h.sim(&sf);
    conn.set_mss(100);
    conn.set_xmit_timer_pending(true);

    let record = initiator.new_record(Bytes::from(vec![0u8; 200]));
    let err = initiator.try_xmit_to_subflow(&sf, &record).unwrap_err();
    assert!(matches!(err, MultipathError::MessageTooLarge { len: 200, mss: 100 }));
    assert_eq!(conn.queued(), 0);
    assert!(!record.is_claimed());
    assert_eq!(initiator.mss_cache(), 100);

    assert!(matches!(
        initiator.send(Bytes::from(vec![0u8; 150])),
        Err(MultipathError::MessageTooLarge { len: 150, mss: 100 })
    ));
    assert_eq!(initiator.queued_records(), 0);
}

#[tokio::test]
async fn test_full_send_queue_fails_fast() {
    let h = Harness::new();
    let (initiator, _responder) = h.pair(SessionConfig::default()).await;
    let sf = initiator.active_subflows()[0].clone();
    let conn = h.sim(&sf);
    conn.set_queue_capacity(1);
    conn.set_xmit_timer_pending(true);

    let first = initiator.new_record(Bytes::from_static(b"one"));
    initiator.try_xmit_to_subflow(&sf, &first).unwrap();
    assert_eq!(conn.queued(), 1);

    let second = initiator.new_record(Bytes::from_static(b"two"));
    let err = initiator
        .xmit_to_subflow(&sf, &second, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, MultipathError::WouldBlock));

    conn.fire_xmit_timer();
    assert_eq!(conn.queued(), 0);
    assert_eq!(conn.transmitted(), 1);
}

#[tokio::test]
async fn test_record_never_queued_twice() {
    let h = Harness::new();
    let (initiator, _responder) = h.pair(SessionConfig::default()).await;
    let sf = initiator.active_subflows()[0].clone();
    h.sim(&sf).set_xmit_timer_pending(true);

    let record = initiator.new_record(Bytes::from_static(b"once"));
    initiator.try_xmit_to_subflow(&sf, &record).unwrap();
    assert!(matches!(
        initiator.try_xmit_to_subflow(&sf, &record),
        Err(MultipathError::AlreadyInProgress)
    ));
    assert_eq!(h.sim(&sf).queued(), 1);
}

#[tokio::test]
async fn test_xmit_waits_for_join_handshake() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;

    let join = initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert_eq!(join.conn().state(), ConnState::Requesting);

    let early = initiator.new_record(Bytes::from_static(b"early"));
    assert!(matches!(
        initiator.xmit_to_subflow(&join, &early, Duration::ZERO).await,
        Err(MultipathError::WouldBlock)
    ));

    let record = initiator.new_record(Bytes::from_static(b"raced"));
    initiator
        .xmit_to_subflow(&join, &record, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(responder.recv().await.unwrap().as_ref(), b"raced");
}

#[tokio::test]
async fn test_write_space_drains_send_queue() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;
    let sf = initiator.active_subflows()[0].clone();
    let conn = h.sim(&sf);
    conn.set_queue_capacity(1);
    conn.set_xmit_timer_pending(true);

    initiator.send(Bytes::from_static(b"one")).unwrap();
    initiator.send(Bytes::from_static(b"two")).unwrap();
    assert_eq!(conn.queued(), 1);
    assert_eq!(initiator.queued_records(), 1);

    conn.fire_xmit_timer();
    assert_eq!(initiator.queued_records(), 0);
    assert_eq!(sf.packets_sent(), 2);
    assert_eq!(responder.delivery_queue_len(), 2);
    assert_eq!(responder.try_recv().unwrap().as_ref(), b"one");
    assert_eq!(responder.try_recv().unwrap().as_ref(), b"two");
}

#[tokio::test]
async fn test_waiting_sender_drains_records_it_blocked() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;
    let sf = initiator.active_subflows()[0].clone();

    let tx = sf.try_lock_tx().unwrap();
    initiator.send(Bytes::from_static(b"blocked")).unwrap();
    assert_eq!(initiator.queued_records(), 1);
    drop(tx);

    let record = initiator.new_record(Bytes::from_static(b"direct"));
    initiator
        .xmit_to_subflow(&sf, &record, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(initiator.queued_records(), 0);
    assert_eq!(sf.packets_sent(), 2);
    assert_eq!(responder.delivery_queue_len(), 2);
}

#[tokio::test]
async fn test_send_wait_rides_connecting_join() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;
    let carrier = initiator.active_subflows()[0].clone();
    h.sim(&carrier).set_queue_capacity(0);

    let join = initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert_eq!(join.conn().state(), ConnState::Requesting);

    initiator.send_wait(Bytes::from_static(b"via join")).await.unwrap();
    assert_eq!(join.packets_sent(), 1);
    assert_eq!(carrier.packets_sent(), 0);
    assert_eq!(responder.recv().await.unwrap().as_ref(), b"via join");
}

#[tokio::test]
async fn test_send_wait_bounded_by_send_timeout() {
    let h = Harness::new();
    let config = SessionConfig::builder().send_timeout(Duration::ZERO).build();

    let lone = h.initiator(config.clone());
    assert!(matches!(
        lone.send_wait(Bytes::from_static(b"nowhere")).await,
        Err(MultipathError::WouldBlock)
    ));

    let (initiator, _responder) = h.pair(config).await;
    let carrier = initiator.active_subflows()[0].clone();
    h.sim(&carrier).set_queue_capacity(0);
    let join = initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert!(matches!(
        initiator.send_wait(Bytes::from_static(b"too soon")).await,
        Err(MultipathError::WouldBlock)
    ));
    assert_eq!(join.packets_sent(), 0);

    assert!(wait_for(|| initiator.subflow_count() == 2).await);
    initiator.send_wait(Bytes::from_static(b"now")).await.unwrap();
    assert_eq!(join.packets_sent(), 1);
}

#[tokio::test]
async fn test_receive_admission_drops_exactly_one() {
    let h = Harness::new();
    let config = SessionConfig::builder().rx_queue_limit(4).build();
    let session = h.initiator(config);

    for i in 0..4u8 {
        session.forward_packet(Bytes::from(vec![i])).unwrap();
    }
    let err = session.forward_packet(Bytes::from_static(b"x")).unwrap_err();
    assert!(matches!(err, MultipathError::ResourceExhausted(_)));
    assert_eq!(session.stats().dropped(), 1);
    assert_eq!(session.stats().delivered(), 4);
    assert_eq!(session.delivery_queue_len(), 4);
    for i in 0..4u8 {
        assert_eq!(session.try_recv().unwrap().as_ref(), &[i]);
    }
    assert!(session.try_recv().is_none());
}

#[tokio::test]
async fn test_unlimited_delivery_queue() {
    let h = Harness::new();
    let session = h.initiator(SessionConfig::builder().rx_queue_limit(0).build());
    for _ in 0..1000 {
        session.forward_packet(Bytes::from_static(b"p")).unwrap();
    }
    assert_eq!(session.stats().dropped(), 0);
}

#[tokio::test]
async fn test_unexpected_packet_is_protocol_violation() {
    let h = Harness::new();
    let (_initiator, responder) = h.pair(SessionConfig::default()).await;
    let sf = responder.active_subflows()[0].clone();
    let conn = h.sim(&sf);
    // Park packets instead of dispatching them.
    let dispatcher = conn.replace_hook(HookKind::DataReady, None);

    conn.inject(mpb_core::types::Packet::control(PacketType::Sync));
    assert!(matches!(
        responder.read_from_subflow(&sf),
        Err(MultipathError::ProtocolViolation(_))
    ));
    assert!(!sf.is_closing());

    conn.inject(mpb_core::types::Packet::data(Bytes::new()));
    assert_eq!(responder.read_from_subflow(&sf).unwrap(), 0);
    assert_eq!(responder.read_from_subflow(&sf).unwrap(), 0);
    assert_eq!(responder.delivery_queue_len(), 0);

    conn.replace_hook(HookKind::DataReady, dispatcher);
}

#[tokio::test]
async fn test_close_scheduled_once_under_contention() {
    let h = Harness::new();
    let (initiator, _responder) = h.pair(SessionConfig::default()).await;
    let sf = initiator.active_subflows()[0].clone();

    let scheduled = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..100 {
                    if initiator.schedule_close(&sf) {
                        scheduled.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });
    assert_eq!(scheduled.load(Ordering::SeqCst), 1);
    assert!(sf.is_closing());
    assert!(initiator.close_subflow(&sf).is_ok());
    h.ctx.flush().await;
    assert!(sf.is_destroyed());
}

#[tokio::test]
async fn test_closing_only_subflow_tears_down_session() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;
    let sf = initiator.active_subflows()[0].clone();

    initiator.close_subflow(&sf).unwrap();
    h.ctx.flush().await;

    assert_eq!(sf.state(), SubflowState::Destroyed);
    assert_eq!(initiator.subflow_count(), 0);
    assert!(initiator.is_closed());
    assert!(!h.ctx.registry().contains(&initiator));

    // The peer saw the close and lost its only path as well.
    assert!(responder.is_closed());
    assert!(responder.all_subflows().is_empty());
    assert!(h.ctx.registry().is_empty());
    assert!(initiator.recv().await.is_none());
}

#[tokio::test]
async fn test_peer_close_request_closes_subflow() {
    let h = Harness::new();
    let (initiator, _responder) = h.pair(SessionConfig::default()).await;
    let join = initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert!(wait_for(|| initiator.subflow_count() == 2).await);

    h.sim(&join).inject(mpb_core::types::Packet::control(PacketType::CloseReq));
    assert!(join.is_closing());
    h.ctx.flush().await;

    assert!(join.is_destroyed());
    assert_eq!(initiator.subflow_count(), 1);
    assert!(!initiator.is_closed());
}

#[tokio::test]
async fn test_hooks_restored_after_destroy() {
    let h = Harness::new();
    let responder = h.responder(SessionConfig::default());
    let stack = Arc::new(StackHooks::default());
    let stack_ref: EventsRef = stack.clone();
    h.net.set_default_hooks(Some(stack_ref.clone()));

    let initiator = h.initiator(SessionConfig::default());
    let sf = initiator
        .add_outbound_subflow(addr("10.0.0.2:0"), 2, addr(LISTEN))
        .await
        .unwrap();
    let conn = h.sim(&sf);
    assert!(!same_hook(&conn.hook(HookKind::StateChange).unwrap(), &stack_ref));

    initiator.close_subflow(&sf).unwrap();
    h.ctx.flush().await;

    for kind in [
        HookKind::DataReady,
        HookKind::BacklogRcv,
        HookKind::StateChange,
        HookKind::Destruct,
        HookKind::WriteSpace,
    ] {
        assert!(same_hook(&conn.hook(kind).unwrap(), &stack_ref));
    }
    assert!(conn.hook(HookKind::Accept).is_none());
    // Initiator carrier and responder child, each once.
    assert_eq!(stack.destructs.load(Ordering::SeqCst), 2);
    assert!(responder.is_closed());
}

#[tokio::test]
async fn test_remove_subflows_for_link() {
    let h = Harness::new();
    h.links.add_link("wlan0", 2, &["10.0.0.2".parse().unwrap()]);
    let lte = h.links.add_link("lte0", 3, &["10.0.0.3".parse().unwrap()]);
    let (initiator, responder) = h.pair(SessionConfig::default()).await;
    let join = initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert!(wait_for(|| responder.subflow_count() == 2 && initiator.subflow_count() == 2).await);
    assert_eq!(join.link().unwrap().name(), "lte0");

    assert_eq!(h.ctx.registry().remove_subflows_for_link(lte.id()), 1);
    h.ctx.flush().await;

    assert!(join.is_destroyed());
    assert!(join.link().is_none());
    assert_eq!(initiator.subflow_count(), 1);
    assert_eq!(responder.subflow_count(), 1);
    assert_eq!(initiator.active_subflows()[0].link().unwrap().name(), "wlan0");
}

/// First-available picks, recording whether a subflow being set up was
/// already published to the active set.
#[derive(Default)]
struct SetupOrderScheduler {
    inits: AtomicUsize,
    visible_before_init: AtomicUsize,
}

impl Scheduler for SetupOrderScheduler {
    fn name(&self) -> &'static str {
        "setup_order"
    }

    fn init_subflow(&self, subflow: &Subflow) {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let Some(session) = subflow.session() else { return };
        if session.active_subflows().iter().any(|s| s.id() == subflow.id()) {
            self.visible_before_init.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn select_subflow(&self, session: &Session) -> Option<Arc<Subflow>> {
        session.active_subflows().iter().find(|s| s.can_send()).cloned()
    }
}

#[tokio::test]
async fn test_scheduler_setup_precedes_publication() {
    let h = Harness::new();
    let scheduler = Arc::new(SetupOrderScheduler::default());
    let responder = h
        .ctx
        .session(Role::Responder)
        .scheduler(scheduler.clone())
        .build()
        .unwrap();
    responder.add_listener(addr(LISTEN), 1).unwrap();
    let initiator = h
        .ctx
        .session(Role::Initiator)
        .scheduler(scheduler.clone())
        .build()
        .unwrap();

    initiator
        .add_outbound_subflow(addr("10.0.0.2:0"), 2, addr(LISTEN))
        .await
        .unwrap();
    initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert!(wait_for(|| initiator.subflow_count() == 2 && responder.subflow_count() == 2).await);

    // Carrier and join on both ends.
    assert_eq!(scheduler.inits.load(Ordering::SeqCst), 4);
    assert_eq!(scheduler.visible_before_init.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_round_robin_spreads_records() {
    let h = Harness::new();
    let config = SessionConfig::builder().scheduler(SchedulerAlgorithm::RoundRobin).build();
    let (initiator, responder) = h.pair(config).await;
    initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert!(wait_for(|| initiator.subflow_count() == 2).await);

    for i in 0..6u8 {
        initiator.send(Bytes::from(vec![i])).unwrap();
    }
    for sf in initiator.active_subflows().iter() {
        assert!(sf.has_sched_state());
        assert_eq!(sf.packets_sent(), 3);
    }
    assert!(wait_for(|| responder.delivery_queue_len() == 6).await);
}

#[tokio::test]
async fn test_first_available_sticks_to_first_path() {
    let h = Harness::new();
    let (initiator, _responder) = h.pair(SessionConfig::default()).await;
    initiator
        .add_outbound_subflow(addr("10.0.0.3:0"), 3, addr(LISTEN))
        .await
        .unwrap();
    assert!(wait_for(|| initiator.subflow_count() == 2).await);

    for _ in 0..4 {
        initiator.send(Bytes::from_static(b"x")).unwrap();
    }
    let active = initiator.active_subflows();
    assert_eq!(active[0].packets_sent(), 4);
    assert_eq!(active[1].packets_sent(), 0);
    assert_eq!(initiator.select_announce_subflow().unwrap().id(), active[0].id());
}

#[tokio::test]
async fn test_shutdown_closes_every_set() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;

    responder.shutdown().unwrap();
    assert!(responder.shutdown().is_ok());
    assert!(!h.ctx.registry().contains(&responder));
    h.ctx.flush().await;

    assert!(responder.all_subflows().is_empty());
    assert!(matches!(responder.send(Bytes::from_static(b"late")), Err(MultipathError::SessionClosed)));
    // The initiator lost its only path through the peer's close.
    assert!(initiator.is_closed());
}

#[tokio::test]
async fn test_context_shutdown() {
    let h = Harness::new();
    let (initiator, responder) = h.pair(SessionConfig::default()).await;
    h.ctx.shutdown().await;
    assert!(initiator.is_closed());
    assert!(responder.is_closed());
    assert!(h.ctx.registry().is_empty());
    assert!(h.ctx.work().is_stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_membership_stress() {
    let h = Harness::new();
    let session = h.initiator(SessionConfig::default());

    let mut tasks = Vec::new();
    for seed in 0..32u64 {
        let session = session.clone();
        let conn: ConnectionRef = h.net.connection();
        tasks.push(tokio::spawn(async move {
            let sf = Arc::new(Subflow::new(conn, Arc::downgrade(&session), Role::Initiator, 0));
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..200 {
                match sf.membership() {
                    Membership::None => session.link_into(&sf, Membership::Pending),
                    Membership::Pending => session.promote(&sf).unwrap(),
                    Membership::Active => {
                        if rng.gen_bool(0.5) {
                            assert!(matches!(session.promote(&sf), Err(MultipathError::AlreadyInProgress)));
                        } else {
                            assert_eq!(session.unlink(&sf), Membership::Active);
                        }
                    }
                    Membership::Listening => unreachable!(),
                }
                assert!(session.check_invariants());
                if rng.gen_ratio(1, 8) {
                    tokio::task::yield_now().await;
                }
            }
            sf
        }));
    }

    let checker = {
        let session = session.clone();
        tokio::spawn(async move {
            for _ in 0..500 {
                assert!(session.check_invariants());
                tokio::task::yield_now().await;
            }
        })
    };

    let mut subflows = Vec::new();
    for task in tasks {
        subflows.push(task.await.unwrap());
    }
    checker.await.unwrap();

    let active = subflows.iter().filter(|sf| sf.membership() == Membership::Active).count();
    assert_eq!(session.subflow_count(), active);
    assert_eq!(session.active_subflows().len(), active);
    assert!(session.check_invariants());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_promote_and_close_race() {
    let h = Harness::new();
    let stack = Arc::new(StackHooks::default());
    let stack_ref: EventsRef = stack.clone();
    h.net.set_default_hooks(Some(stack_ref));
    let session = h.initiator(SessionConfig::default());

    // Keeps the session open while the others come and go.
    let anchor = Arc::new(Subflow::new(h.net.connection(), Arc::downgrade(&session), Role::Initiator, 0));
    session.link_into(&anchor, Membership::Pending);
    session.promote(&anchor).unwrap();

    let scheduled = Arc::new(AtomicUsize::new(0));
    let mut subflows = Vec::new();
    let mut tasks = Vec::new();
    for seed in 0..32u64 {
        let sf = Arc::new(Subflow::new(h.net.connection(), Arc::downgrade(&session), Role::Initiator, 0));
        sf.install_hooks(&dispatcher::SubflowEvents::new(&sf), &[HookKind::Destruct]);
        session.link_into(&sf, Membership::Pending);
        subflows.push(sf.clone());

        {
            let session = session.clone();
            let sf = sf.clone();
            tasks.push(tokio::spawn(async move {
                if seed % 2 == 0 {
                    tokio::task::yield_now().await;
                }
                match session.promote(&sf) {
                    Ok(()) | Err(MultipathError::AlreadyInProgress) => {}
                    Err(e) => panic!("unexpected promotion error: {}", e),
                }
                assert!(session.check_invariants());
            }));
        }
        for closer in 0..3u64 {
            let session = session.clone();
            let sf = sf.clone();
            let scheduled = scheduled.clone();
            tasks.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed * 3 + closer);
                for _ in 0..rng.gen_range(0..4) {
                    tokio::task::yield_now().await;
                }
                if session.schedule_close(&sf) {
                    scheduled.fetch_add(1, Ordering::SeqCst);
                }
                assert!(session.check_invariants());
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
    h.ctx.flush().await;

    assert_eq!(scheduled.load(Ordering::SeqCst), subflows.len());
    assert_eq!(stack.destructs.load(Ordering::SeqCst), subflows.len());
    for sf in &subflows {
        assert!(sf.is_destroyed());
        assert_eq!(sf.membership(), Membership::None);
    }
    assert!(session.check_invariants());
    assert_eq!(session.subflow_count(), 1);
    assert_eq!(session.active_subflows().len(), 1);
    assert!(!session.is_closed());
}
