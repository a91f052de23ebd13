//! graphsync-reactor: optimistic client sync engine
//!
//! Local writes are lowered to tx-steps, queued durably and replayed on top
//! of the last server snapshot of every subscribed query until the server
//! has folded them in. Rooms carry ephemeral presence and broadcasts next to
//! the data sync.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Reactor                                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  transact(ops) ──► instaml::transform ──► MutationPipeline ──┐       │
//! │                    (add-attr bootstrap)   (pendingMutations) │       │
//! │                                                 │        transact    │
//! │                                           rewrite+replay     ▼       │
//! │  subscribe_query ──► QueryManager ◄─────────────┘      ┌──────────┐  │
//! │                      (querySubs) ◄── add-query-ok ─────│Transport │  │
//! │                                                         └──────────┘  │
//! │  join_room / topics ──► RoomManager ◄── presence / broadcasts ─┘     │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - `instaml`: edit ops, schema bootstrap and attribute-id rewriting
//! - `mutations`: the pending queue, send gate, timeouts and cleanup
//! - `queries`: subscriptions, optimistic projections, notification
//! - `rooms` / `presence`: room lifecycle, presence slices, topics
//! - `protocol`: wire messages in both directions
//! - `reactor`: the composition root that wires it all to a [`Transport`]

pub mod clock;
pub mod config;
pub mod error;
pub mod instaml;
pub mod mutations;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod queries;
pub mod reactor;
pub mod rooms;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReactorConfig;
pub use error::{
    ApiErrorBody, MutationError, MutationErrorDetails, ReactorError, Result, TransformError,
};
pub use instaml::{
    rewrite_step, transform, AttrMapping, EditAction, EditEntity, EditOp, EditOpts,
    TransformContext,
};
pub use mutations::{
    apply_optimistic_updates, MutationErrorCallback, MutationPipeline, MutationReceipt,
    PendingMutation, PendingMutations, TxOutcome, TxStatus,
};
pub use notify::{Outbox, Transport};
pub use presence::{PresenceEdit, PresenceOpts, PresenceResponse};
pub use protocol::{ClientMessage, ServerMessage};
pub use queries::{query_hash, QueryCallback, QueryError, QueryOnce, QueryResponse};
pub use reactor::{BackgroundTasks, Reactor, Subscription};
pub use rooms::{PresenceCallback, RoomManager, TopicCallback};
