//! Durable state cell.

use crate::backend::StorageBackend;
use crate::error::StorageError;
use crate::scheduler::{DeferredWrite, WriteScheduler};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Reconciles the stored value (if any) with writes made before load.
pub type MergeFn<T> = Box<dyn Fn(Option<T>, T) -> T + Send + Sync>;

struct CellState<T> {
    value: T,
    version: u64,
    loaded: bool,
}

struct Cell<T> {
    key: String,
    state: Mutex<CellState<T>>,
    loaded_tx: watch::Sender<bool>,
    merge: MergeFn<T>,
    backend: Arc<dyn StorageBackend>,
    scheduler: Arc<WriteScheduler>,
}

impl<T> DeferredWrite for Cell<T>
where
    T: Serialize + Send + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn serialize(&self) -> Result<String, StorageError> {
        let state = self.state.lock();
        serde_json::to_string(&state.value).map_err(|source| StorageError::Json {
            key: self.key.clone(),
            source,
        })
    }
}

/// One named value with load-then-merge persistence.
///
/// Cheap to clone; clones share the same cell.
pub struct PersistedObject<T> {
    inner: Arc<Cell<T>>,
}

impl<T> Clone for PersistedObject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PersistedObject<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
{
    pub fn new(
        key: impl Into<String>,
        initial: T,
        scheduler: Arc<WriteScheduler>,
        merge: MergeFn<T>,
    ) -> Self {
        let (loaded_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Cell {
                key: key.into(),
                state: Mutex::new(CellState {
                    value: initial,
                    version: 0,
                    loaded: false,
                }),
                loaded_tx,
                merge,
                backend: scheduler.backend(),
                scheduler,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Borrow the current value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.state.lock().value)
    }

    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Bumped on every `set` and on load.
    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.state.lock().loaded
    }

    /// Update in memory; once loaded, also queue a write-back.
    pub fn set<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let (out, loaded) = {
            let mut state = self.inner.state.lock();
            let out = f(&mut state.value);
            state.version += 1;
            (out, state.loaded)
        };
        if loaded {
            self.schedule_write();
        }
        out
    }

    fn schedule_write(&self) {
        let weak: Weak<dyn DeferredWrite> = Arc::downgrade(&self.inner) as Weak<Cell<T>>;
        self.inner.scheduler.schedule(weak);
    }

    /// Read the stored value and merge it in. Only the first call merges.
    pub async fn load(&self) {
        if self.is_loaded() {
            return;
        }
        let stored = match self.inner.backend.get_item(&self.inner.key).await {
            Ok(Some(text)) => match serde_json::from_str::<T>(&text) {
                Ok(value) => Some(value),
                Err(error) => {
                    warn!(key = %self.inner.key, %error, "discarding unreadable stored value");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(key = %self.inner.key, %error, "unable to read from storage");
                None
            }
        };

        {
            let mut state = self.inner.state.lock();
            if state.loaded {
                return;
            }
            let in_memory = std::mem::take(&mut state.value);
            state.value = (self.inner.merge)(stored, in_memory);
            state.loaded = true;
            state.version += 1;
        }
        debug!(key = %self.inner.key, "loaded");
        self.inner.loaded_tx.send_replace(true);
        self.schedule_write();
    }

    /// Resolves once the first merge has happened.
    pub async fn wait_for_loaded(&self) {
        let mut rx = self.inner.loaded_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Write the current value now, bypassing the scheduler.
    pub async fn flush_now(&self) -> Result<(), StorageError> {
        let text = self.inner.serialize()?;
        self.inner.backend.set_item(&self.inner.key, text).await
    }
}
