//! Deferred write-back queue shared by every cell of one client.

use crate::backend::StorageBackend;
use crate::error::StorageError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Something that can produce its current serialized form on demand.
pub trait DeferredWrite: Send + Sync {
    fn key(&self) -> &str;
    fn serialize(&self) -> Result<String, StorageError>;
}

pub type StorageErrorHandler = Box<dyn Fn(&StorageError) + Send + Sync>;

#[derive(Default)]
struct Queue {
    order: VecDeque<String>,
    slots: HashMap<String, Weak<dyn DeferredWrite>>,
}

/// Coalescing write queue.
///
/// Scheduling a key that is already queued is a no-op; the value written is
/// whatever the cell holds when the queue drains.
pub struct WriteScheduler {
    backend: Arc<dyn StorageBackend>,
    queue: Mutex<Queue>,
    notify: Notify,
    shutdown: AtomicBool,
    error_handlers: Mutex<Vec<StorageErrorHandler>>,
}

impl WriteScheduler {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            error_handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend)
    }

    /// Register a handler for failed writes.
    pub fn on_error(&self, handler: StorageErrorHandler) {
        self.error_handlers.lock().push(handler);
    }

    fn emit_error(&self, error: &StorageError) {
        warn!(%error, "deferred write failed");
        for handler in self.error_handlers.lock().iter() {
            handler(error);
        }
    }

    pub fn schedule(&self, cell: Weak<dyn DeferredWrite>) {
        let Some(strong) = cell.upgrade() else {
            return;
        };
        let key = strong.key().to_string();
        {
            let mut queue = self.queue.lock();
            if queue.slots.contains_key(&key) {
                return;
            }
            queue.order.push_back(key.clone());
            queue.slots.insert(key, cell);
        }
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().order.len()
    }

    /// Drain the queue once. Returns the number of successful writes.
    pub async fn flush(&self) -> usize {
        let mut written = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock();
                queue
                    .order
                    .pop_front()
                    .and_then(|key| queue.slots.remove(&key))
            };
            let Some(cell) = next else {
                break;
            };
            let Some(cell) = cell.upgrade() else {
                continue;
            };
            let result = match cell.serialize() {
                Ok(text) => self.backend.set_item(cell.key(), text).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    debug!(key = cell.key(), "persisted");
                    written += 1;
                }
                Err(e) => self.emit_error(&e),
            }
        }
        written
    }

    /// Drain loop; returns after [`WriteScheduler::shutdown`] with a final flush.
    pub async fn run(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.notify.notified().await;
            self.flush().await;
        }
        self.flush().await;
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}
