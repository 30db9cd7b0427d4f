//! Reorder engines

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::session::Session;
use super::subflow::Subflow;

/// One inbound payload on its way to the session's consumer.
pub struct ReceiveContext {
    pub session: Arc<Session>,
    pub subflow: Arc<Subflow>,
    pub payload: Bytes,
}

/// Restores stream order across subflows before delivery.
pub trait ReorderEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accept one payload. Delivery backpressure is the session's concern.
    fn submit(&self, ctx: ReceiveContext);

    /// Drop state kept for one subflow.
    fn release_path(&self, _subflow: &Subflow) {}

    /// Drop all state kept for the session.
    fn release_all(&self, _session: &Session) {}
}

/// Delivers in arrival order.
pub struct PassthroughReorder;

impl ReorderEngine for PassthroughReorder {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn submit(&self, ctx: ReceiveContext) {
        trace!(subflow = ctx.subflow.id(), len = ctx.payload.len(), "reorder: pass through");
        // Drops are counted and logged by the session.
        let _ = ctx.session.forward_packet(ctx.payload);
    }
}
