//! Bounded drop-on-full queues between ingestion and processing.
//!
//! Producers never suspend on a full queue: the item is dropped, counted and
//! logged.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Create a bounded queue whose sender drops instead of waiting.
pub fn bounded<T>(name: &'static str, capacity: usize) -> (QueueSender<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = QueueSender {
        name,
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

pub struct QueueSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

// Manual impl: a derive would require `T: Clone`.
impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Non-blocking enqueue. Returns false when the item was not accepted.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(queue = self.name, dropped_total = dropped, "queue_full");
                false
            }
            // Consumers are gone (shutdown); nothing to count.
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Items dropped because the queue was full, across all clones.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current occupancy
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
