//! Copy-on-write membership list.
//!
//! Readers load the current snapshot without locking and traverse it at
//! leisure; an element unlinked meanwhile stays alive through the snapshot's
//! reference until the reader drops it. Writers serialize on a per-list
//! mutex held only for the pointer swap.

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

pub struct RcuList<T> {
    entries: ArcSwap<Vec<Arc<T>>>,
    writer: Mutex<()>,
}

impl<T> Default for RcuList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RcuList<T> {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    /// Consistent view of the list at this instant.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.entries.load_full()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item: &Arc<T>) -> bool {
        self.entries.load().iter().any(|e| Arc::ptr_eq(e, item))
    }

    /// Take the writer lock.
    pub fn lock(&self) -> RcuGuard<'_, T> {
        RcuGuard {
            list: self,
            _guard: self.writer.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// Exclusive writer access to one list.
pub struct RcuGuard<'a, T> {
    list: &'a RcuList<T>,
    _guard: MutexGuard<'a, ()>,
}

impl<T> RcuGuard<'_, T> {
    pub fn contains(&self, item: &Arc<T>) -> bool {
        self.list.contains(item)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn push_back(&mut self, item: Arc<T>) {
        let current = self.list.entries.load();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(item);
        self.list.entries.store(Arc::new(next));
    }

    /// Unlink `item`. Returns whether it was present.
    pub fn remove(&mut self, item: &Arc<T>) -> bool {
        let current = self.list.entries.load();
        if !current.iter().any(|e| Arc::ptr_eq(e, item)) {
            return false;
        }
        let next: Vec<Arc<T>> = current
            .iter()
            .filter(|e| !Arc::ptr_eq(e, item))
            .cloned()
            .collect();
        self.list.entries.store(Arc::new(next));
        true
    }
}
