//! Transmit path.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mpb_core::types::Packet;
use mpb_core::{MultipathError, Result};
use tracing::{debug, trace, warn};

use super::session::Session;
use super::subflow::Subflow;

/// One outbound record.
///
/// A record waits in the session's send queue until a subflow takes it.
/// Taking it is a one-time claim, so no record is ever queued on two
/// subflows.
#[derive(Debug)]
pub struct TxRecord {
    dsn: u64,
    payload: Bytes,
    claimed: AtomicBool,
}

impl TxRecord {
    pub fn new(dsn: u64, payload: Bytes) -> Arc<Self> {
        Arc::new(Self {
            dsn,
            payload,
            claimed: AtomicBool::new(false),
        })
    }

    pub fn dsn(&self) -> u64 {
        self.dsn
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Already pushed onto a subflow.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

fn not_connected() -> MultipathError {
    io::Error::new(io::ErrorKind::NotConnected, "subflow not connected").into()
}

impl Session {
    /// Record with the next local sequence number, not yet queued anywhere.
    pub fn new_record(&self, payload: Bytes) -> Arc<TxRecord> {
        TxRecord::new(self.dsn_local.fetch_add(1, Ordering::AcqRel), payload)
    }

    /// Queue `payload` for transmission and push what the scheduler allows.
    /// Returns the record's sequence number.
    pub fn send(&self, payload: Bytes) -> Result<u64> {
        if payload.is_empty() {
            return Err(MultipathError::InvalidArgument("empty payload"));
        }
        if self.is_closed() {
            return Err(MultipathError::SessionClosed);
        }
        let mss = self.mss_cache();
        if payload.len() > mss {
            return Err(MultipathError::MessageTooLarge {
                len: payload.len(),
                mss,
            });
        }

        let dsn = {
            let mut queue = self.tx_queue.lock().unwrap();
            let limit = self.config.tx_queue_limit;
            if limit != 0 && queue.len() >= limit {
                return Err(MultipathError::WouldBlock);
            }
            let record = self.new_record(payload);
            let dsn = record.dsn();
            queue.push_back(record);
            dsn
        };
        self.push_pending();
        Ok(dsn)
    }

    /// Records waiting in the session send queue.
    pub fn queued_records(&self) -> usize {
        self.tx_queue.lock().unwrap().len()
    }

    /// Drain the send queue through the scheduler until it runs dry or no
    /// subflow can take more. Returns how many records went out.
    pub fn push_pending(&self) -> usize {
        let mut sent = 0;
        loop {
            let front = self.tx_queue.lock().unwrap().front().cloned();
            let Some(record) = front else { break };
            let Some(sf) = self.scheduler.select_subflow(self) else {
                trace!(session = self.id(), queued = self.queued_records(), "no subflow can send");
                break;
            };
            match self.try_xmit_to_subflow(&sf, &record) {
                Ok(()) => sent += 1,
                Err(MultipathError::MessageTooLarge { len, mss }) => {
                    warn!(session = self.id(), dsn = record.dsn(), len, mss, "dropping oversized record");
                    self.unqueue(&record);
                }
                // Taken by a concurrent sender; the queue has moved on.
                Err(MultipathError::AlreadyInProgress) => continue,
                Err(e) if e.is_transient() => break,
                Err(e) => {
                    debug!(session = self.id(), subflow = sf.id(), error = %e, "push stopped");
                    break;
                }
            }
        }
        sent
    }

    pub(crate) fn push_pending_quiet(&self) {
        let sent = self.push_pending();
        if sent > 0 {
            trace!(session = self.id(), sent, "pending records pushed");
        }
    }

    /// First active subflow that can send, for announcements.
    pub fn select_announce_subflow(&self) -> Option<Arc<Subflow>> {
        self.active_subflows().iter().find(|s| s.can_send()).cloned()
    }

    /// Send `payload` as one record without going through the send queue,
    /// waiting up to the configured send timeout for the chosen subflow to
    /// finish connecting. A subflow still in its handshake is used when no
    /// active one can take the record.
    pub async fn send_wait(&self, payload: Bytes) -> Result<u64> {
        if payload.is_empty() {
            return Err(MultipathError::InvalidArgument("empty payload"));
        }
        if self.is_closed() {
            return Err(MultipathError::SessionClosed);
        }
        let sf = match self.scheduler.select_subflow(self) {
            Some(sf) => sf,
            None => self.connecting_subflow().ok_or(MultipathError::WouldBlock)?,
        };
        let record = self.new_record(payload);
        self.xmit_to_subflow(&sf, &record, self.config.send_timeout()).await?;
        Ok(record.dsn())
    }

    fn connecting_subflow(&self) -> Option<Arc<Subflow>> {
        self.all_subflows()
            .into_iter()
            .find(|s| !s.is_closing() && s.conn().state().is_connecting())
    }

    /// Push `record` onto `sf`, waiting up to `timeout` for the subflow to
    /// finish connecting. Never waits for queue space.
    pub async fn xmit_to_subflow(
        &self,
        sf: &Arc<Subflow>,
        record: &Arc<TxRecord>,
        timeout: Duration,
    ) -> Result<()> {
        self.check_segment(sf, record)?;
        wait_connected(sf, timeout).await?;
        let queued = {
            let _tx = sf.lock_tx();
            self.enqueue_locked(sf, record)
        };
        // Queued senders gave up while we held the lock.
        self.push_pending_quiet();
        queued
    }

    /// Push `record` onto `sf` without waiting for anything: an unconnected
    /// subflow or a concurrent sender yields [`MultipathError::WouldBlock`].
    pub fn try_xmit_to_subflow(&self, sf: &Arc<Subflow>, record: &Arc<TxRecord>) -> Result<()> {
        self.check_segment(sf, record)?;
        if !sf.conn().state().is_established() {
            return Err(MultipathError::WouldBlock);
        }
        let _tx = sf.try_lock_tx().ok_or(MultipathError::WouldBlock)?;
        self.enqueue_locked(sf, record)
    }

    fn check_segment(&self, sf: &Subflow, record: &TxRecord) -> Result<()> {
        if record.is_empty() {
            return Err(MultipathError::InvalidArgument("empty payload"));
        }
        if sf.is_closing() {
            return Err(not_connected());
        }
        let mss = sf.conn().mss();
        if record.len() > mss {
            let previous = self.mss_cache.fetch_min(mss, Ordering::AcqRel);
            if mss < previous {
                debug!(session = self.id(), subflow = sf.id(), mss, "session mss lowered");
            }
            return Err(MultipathError::MessageTooLarge {
                len: record.len(),
                mss,
            });
        }
        if sf.conn().queue_full() {
            return Err(MultipathError::WouldBlock);
        }
        Ok(())
    }

    /// Caller holds the subflow's sender lock.
    fn enqueue_locked(&self, sf: &Subflow, record: &Arc<TxRecord>) -> Result<()> {
        let conn = sf.conn();
        if conn.queue_full() {
            return Err(MultipathError::WouldBlock);
        }
        self.claim(record)?;
        conn.push(Packet::data(record.payload().clone()));
        sf.record_sent();
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        trace!(session = self.id(), subflow = sf.id(), dsn = record.dsn(), len = record.len(), "record queued");
        if !conn.xmit_timer_pending() {
            conn.write_xmit();
        }
        Ok(())
    }

    /// Take `record` out of the session queue for good.
    fn claim(&self, record: &Arc<TxRecord>) -> Result<()> {
        let mut queue = self.tx_queue.lock().unwrap();
        if record.claimed.swap(true, Ordering::AcqRel) {
            return Err(MultipathError::AlreadyInProgress);
        }
        if let Some(pos) = queue.iter().position(|r| Arc::ptr_eq(r, record)) {
            queue.remove(pos);
        }
        Ok(())
    }

    fn unqueue(&self, record: &Arc<TxRecord>) {
        let mut queue = self.tx_queue.lock().unwrap();
        if let Some(pos) = queue.iter().position(|r| Arc::ptr_eq(r, record)) {
            queue.remove(pos);
        }
    }
}

async fn wait_connected(sf: &Subflow, timeout: Duration) -> Result<()> {
    let mut rx = sf.conn().subscribe_state();
    let state = *rx.borrow_and_update();
    if state.is_established() {
        return Ok(());
    }
    if !state.is_connecting() {
        return Err(not_connected());
    }
    if timeout.is_zero() {
        return Err(MultipathError::WouldBlock);
    }

    let wait = async {
        loop {
            if rx.changed().await.is_err() {
                return Err(not_connected());
            }
            let state = *rx.borrow_and_update();
            if state.is_established() {
                return Ok(());
            }
            if !state.is_connecting() {
                return Err(not_connected());
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| MultipathError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_claim_is_one_time() {
        let record = TxRecord::new(3, Bytes::from_static(b"abc"));
        assert!(!record.is_claimed());
        assert!(!record.claimed.swap(true, Ordering::AcqRel));
        assert!(record.is_claimed());
        assert_eq!(record.dsn(), 3);
        assert_eq!(record.len(), 3);
    }
}
