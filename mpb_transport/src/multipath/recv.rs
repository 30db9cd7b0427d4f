//! Receive path and consumer-facing delivery queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use mpb_core::{MultipathError, Result};
use tracing::{debug, trace, warn};

use super::reorder::ReceiveContext;
use super::session::Session;
use super::subflow::Subflow;

impl Session {
    /// Pull one packet from `sf` and route it. Returns the payload length
    /// handed on, 0 when nothing was waiting or nothing was forwarded.
    pub(crate) fn read_from_subflow(&self, sf: &Arc<Subflow>) -> Result<usize> {
        let Some(packet) = sf.conn().recv_packet() else {
            return Ok(0);
        };

        if packet.kind.carries_data() {
            let len = packet.len();
            if len == 0 {
                debug!(session = self.id(), subflow = sf.id(), "zero-length data discarded");
                return Ok(0);
            }
            let session = self.arc().ok_or(MultipathError::SessionClosed)?;
            trace!(session = self.id(), subflow = sf.id(), len, "read from subflow");
            self.reorder.submit(ReceiveContext {
                session,
                subflow: sf.clone(),
                payload: packet.payload,
            });
            return Ok(len);
        }

        if packet.kind.is_close() {
            debug!(session = self.id(), subflow = sf.id(), kind = ?packet.kind, "peer closing subflow");
            self.schedule_close(sf);
            return Ok(0);
        }

        warn!(session = self.id(), subflow = sf.id(), kind = ?packet.kind, "unhandled packet type");
        Err(MultipathError::ProtocolViolation(format!("unexpected {:?} packet", packet.kind)))
    }

    /// Admit one in-order payload to the delivery queue. At the configured
    /// limit the payload is dropped, never buffered or waited on.
    pub fn forward_packet(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(MultipathError::SessionClosed);
        }
        {
            let mut queue = self.rx_queue.lock().unwrap();
            let limit = self.config.rx_queue_limit;
            if limit != 0 && queue.len() >= limit {
                drop(queue);
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(session = self.id(), limit, dropped, "delivery queue full, dropping packet");
                return Err(MultipathError::ResourceExhausted("delivery queue"));
            }
            queue.push_back(payload);
        }
        self.dsn_remote.fetch_add(1, Ordering::AcqRel);
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        self.rx_notify.notify_one();
        Ok(())
    }

    pub fn try_recv(&self) -> Option<Bytes> {
        self.rx_queue.lock().unwrap().pop_front()
    }

    /// Next delivered payload. `None` once the session is closed and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            let notified = self.rx_notify.notified();
            if let Some(payload) = self.try_recv() {
                return Some(payload);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn delivery_queue_len(&self) -> usize {
        self.rx_queue.lock().unwrap().len()
    }

    /// Payloads admitted so far.
    pub fn remote_sequence(&self) -> u64 {
        self.dsn_remote.load(Ordering::Acquire)
    }
}
