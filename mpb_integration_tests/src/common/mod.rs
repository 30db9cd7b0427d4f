// Common test utilities for integration tests
#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mpb_core::types::Role;
use mpb_transport::multipath::{MultipathContext, Session};
use mpb_transport::sim::{SimConfig, SimNetwork};
use mpb_transport::{LinkInfo, SessionConfig, StaticLinkRegistry};
use tracing::info;

pub const SERVER_ADDR: &str = "10.0.0.1:9000";
pub const WIFI_ADDR: &str = "10.0.0.2";
pub const LTE_ADDR: &str = "10.0.0.3";

/// One simulated network with two client links and a controller on top.
pub struct TestBed {
    pub net: Arc<SimNetwork>,
    pub links: Arc<StaticLinkRegistry>,
    pub ctx: MultipathContext,
    pub wifi: Arc<LinkInfo>,
    pub lte: Arc<LinkInfo>,
}

impl TestBed {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let net = SimNetwork::new(SimConfig::default());
        let links = Arc::new(StaticLinkRegistry::new());
        let wifi = links.add_link("wlan0", 2, &[ip(WIFI_ADDR)]);
        let lte = links.add_link("lte0", 3, &[ip(LTE_ADDR)]);
        let ctx = MultipathContext::new(net.clone(), links.clone());
        Self { net, links, ctx, wifi, lte }
    }

    pub fn server(&self, config: SessionConfig) -> Result<Arc<Session>> {
        let session = self.ctx.session(Role::Responder).config(config).build()?;
        session.add_listener(SERVER_ADDR.parse()?, 1)?;
        Ok(session)
    }

    pub fn client(&self, config: SessionConfig) -> Result<Arc<Session>> {
        Ok(self.ctx.session(Role::Initiator).config(config).build()?)
    }

    /// Client and server joined over the wifi link.
    pub async fn connected(&self, config: SessionConfig) -> Result<(Arc<Session>, Arc<Session>)> {
        let server = self.server(config.clone())?;
        let client = self.client(config)?;
        client
            .add_outbound_subflow(local(WIFI_ADDR), 2, SERVER_ADDR.parse()?)
            .await
            .context("carrier dial failed")?;
        info!(client = client.id(), server = server.id(), "test sessions connected");
        Ok((client, server))
    }

    /// Add a joining subflow over lte and wait until both ends count it.
    pub async fn join_lte(&self, client: &Session, server: &Session) -> Result<()> {
        let before = client.subflow_count();
        client
            .add_outbound_subflow(local(LTE_ADDR), 3, SERVER_ADDR.parse()?)
            .await
            .context("join dial failed")?;
        let joined = wait_for(
            || client.subflow_count() == before + 1 && server.subflow_count() == before + 1,
            Duration::from_secs(2),
        )
        .await;
        anyhow::ensure!(joined, "join never became active");
        Ok(())
    }
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().expect("valid test address")
}

/// Ephemeral port on `addr`.
pub fn local(addr: &str) -> SocketAddr {
    SocketAddr::new(ip(addr), 0)
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}

pub fn init_test_logging() {
    mpb_transport::logging::init_logging_with_filter("mpb_transport=debug");
}
