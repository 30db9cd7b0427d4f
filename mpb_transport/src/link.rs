//! Link registry.
//!
//! A [`LinkInfo`] describes one local network path. Published values are
//! never mutated apart from their generation counter: an update publishes a
//! new value and marks the superseded one stale, so holders of the old
//! handle can detect the change and swap.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

pub type LinkId = u32;

/// Routing and capability metadata of a local link.
#[derive(Debug)]
pub struct LinkInfo {
    id: LinkId,
    name: String,
    if_index: u32,
    priority: u8,
    is_copy: bool,
    generation: AtomicU32,
}

impl LinkInfo {
    pub fn new(id: LinkId, name: impl Into<String>, if_index: u32, priority: u8) -> Self {
        Self {
            id,
            name: name.into(),
            if_index,
            priority,
            is_copy: false,
            generation: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Private copy made for a single subflow.
    pub fn is_copy(&self) -> bool {
        self.is_copy
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Private copy carrying the current generation.
    pub fn private_copy(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            if_index: self.if_index,
            priority: self.priority,
            is_copy: true,
            generation: AtomicU32::new(self.generation()),
        }
    }

    fn successor(&self, priority: u8) -> Self {
        let next = self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        Self {
            id: self.id,
            name: self.name.clone(),
            if_index: self.if_index,
            priority,
            is_copy: false,
            generation: AtomicU32::new(next),
        }
    }
}

/// Classifies local addresses into links.
pub trait LinkRegistry: Send + Sync {
    fn lookup(&self, addr: &IpAddr) -> Option<Arc<LinkInfo>>;

    fn get(&self, id: LinkId) -> Option<Arc<LinkInfo>>;

    /// Link used for addresses no registered link claims.
    fn fallback_link(&self) -> Arc<LinkInfo>;

    fn resolve(&self, addr: &IpAddr) -> Arc<LinkInfo> {
        self.lookup(addr).unwrap_or_else(|| self.fallback_link())
    }
}

/// In-memory link registry.
pub struct StaticLinkRegistry {
    links: DashMap<LinkId, Arc<LinkInfo>>,
    by_addr: DashMap<IpAddr, LinkId>,
    fallback: Arc<LinkInfo>,
    next_id: AtomicU32,
}

impl Default for StaticLinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticLinkRegistry {
    pub fn new() -> Self {
        Self {
            links: DashMap::new(),
            by_addr: DashMap::new(),
            fallback: Arc::new(LinkInfo::new(0, "default", 0, 0)),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn add_link(&self, name: &str, if_index: u32, addrs: &[IpAddr]) -> Arc<LinkInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(LinkInfo::new(id, name, if_index, 0));
        self.links.insert(id, link.clone());
        for addr in addrs {
            self.by_addr.insert(*addr, id);
        }
        debug!(link = id, name, "link registered");
        link
    }

    /// Publish a new value for the link and mark the old one stale.
    pub fn update_priority(&self, id: LinkId, priority: u8) -> Option<Arc<LinkInfo>> {
        let mut entry = self.links.get_mut(&id)?;
        let next = Arc::new(entry.successor(priority));
        *entry = next.clone();
        debug!(link = id, generation = next.generation(), "link updated");
        Some(next)
    }

    pub fn remove_link(&self, id: LinkId) -> Option<Arc<LinkInfo>> {
        self.by_addr.retain(|_, link| *link != id);
        self.links.remove(&id).map(|(_, link)| link)
    }
}

impl LinkRegistry for StaticLinkRegistry {
    fn lookup(&self, addr: &IpAddr) -> Option<Arc<LinkInfo>> {
        let id = *self.by_addr.get(addr)?;
        self.get(id)
    }

    fn get(&self, id: LinkId) -> Option<Arc<LinkInfo>> {
        self.links.get(&id).map(|l| l.clone())
    }

    fn fallback_link(&self) -> Arc<LinkInfo> {
        self.fallback.clone()
    }
}
