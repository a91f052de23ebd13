//! graphsync-storage: durable state cells
//!
//! A [`PersistedObject`] owns one named value. Writes always land in memory
//! first; once the cell has loaded, each write also queues a deferred
//! write-back on the shared [`WriteScheduler`].
//!
//! ```text
//!   set(f) ──► in-memory value ──(loaded?)──► WriteScheduler ──► StorageBackend
//!                    ▲                          (one slot per key,
//!                    │                           serialized at drain)
//!   load() ──────────┘  on_merge(stored, in_memory), exactly once
//! ```
//!
//! Backend failures never reach the code that called `set`; they are
//! reported to [`WriteScheduler::on_error`] handlers.

pub mod backend;
pub mod error;
pub mod persisted;
pub mod scheduler;


pub use backend::{FileStorage, MemoryStorage, StorageBackend};
pub use error::StorageError;
pub use persisted::{MergeFn, PersistedObject};
pub use scheduler::{DeferredWrite, StorageErrorHandler, WriteScheduler};
