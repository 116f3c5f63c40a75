//! Registry of live local queues.
//!
//! Thieves need to enumerate every local queue in the process. The registry
//! publishes an immutable snapshot behind a reader-writer lock: readers
//! clone the current `Arc` and scan without holding anything, writers
//! rebuild the vector and swap it in. Retired snapshots free themselves
//! once the last scanning reader drops its clone.

use std::sync::{Arc, PoisonError, RwLock};

use crate::local_queue::LocalQueue;

pub struct QueueRegistry {
    queues: RwLock<Arc<Vec<Arc<LocalQueue>>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        QueueRegistry {
            queues: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Returns the current snapshot of live queues.
    pub fn snapshot(&self) -> Arc<Vec<Arc<LocalQueue>>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds a worker's queue to the published snapshot.
    pub fn register(&self, queue: Arc<LocalQueue>) {
        let mut guard = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(queue);
        *guard = Arc::new(next);
    }

    /// Removes a worker's queue from the published snapshot.
    pub fn unregister(&self, queue: &Arc<LocalQueue>) {
        let mut guard = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let next: Vec<Arc<LocalQueue>> = guard
            .iter()
            .filter(|existing| !Arc::ptr_eq(existing, queue))
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }

    /// Number of currently registered queues.
    pub fn len(&self) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        QueueRegistry::new()
    }
}
