//! Deferred work queue.
//!
//! Transport notifications run in a context that must not block, so
//! subflow teardown and cascading session shutdown are handed to a single
//! worker task and run there in submission order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Barrier(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<Command>,
    pending: AtomicUsize,
    stopped: AtomicBool,
}

impl WorkQueue {
    /// Start the worker on the current tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let inner = Arc::new(Inner {
            tx,
            pending: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });

        let worker = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Run(job) => {
                        job();
                        if let Some(inner) = worker.upgrade() {
                            inner.pending.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                    Command::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("work queue worker exited");
        });

        Self { inner }
    }

    /// Queue `job`. Returns false when the queue no longer accepts work.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.inner.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        if self.inner.tx.send(Command::Run(Box::new(job))).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        trace!("work item queued");
        true
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Wait until every queued job, including jobs queued by jobs, has run.
    pub async fn flush(&self) {
        loop {
            let (done_tx, done_rx) = oneshot::channel();
            if self.inner.tx.send(Command::Barrier(done_tx)).is_err() {
                return;
            }
            if done_rx.await.is_err() {
                return;
            }
            if self.pending() == 0 {
                return;
            }
        }
    }

    /// Refuse new work, then drain what is already queued.
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.flush().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}
