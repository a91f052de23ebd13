//! The composition root.
//!
//! ```text
//!   app ──transact/subscribe──►┌──────────── Reactor ────────────┐
//!                              │  Mutex<ReactorState>            │
//!   transport ──ServerMessage─►│    MutationPipeline             │──Outbox──► transport.send
//!                              │    QueryManager                 │        └─► subscriber callbacks
//!   tick / online / closed ───►│    RoomManager                  │
//!                              └─────────────────────────────────┘
//! ```
//!
//! Every entry point locks the state, lets the components push effects onto
//! an [`Outbox`], unlocks, then delivers the outbox. Callbacks therefore run
//! without the lock held and may call back into the reactor.

use crate::clock::{Clock, SystemClock};
use crate::config::ReactorConfig;
use crate::error::{MutationErrorDetails, Result};
use crate::instaml::{transform, EditOp, TransformContext};
use crate::mutations::{
    Failure, FailureKind, MutationErrorCallback, MutationPipeline, MutationReceipt,
    PipelineContext, SessionGate,
};
use crate::notify::{Outbox, Transport};
use crate::presence::{PresenceOpts, PresenceResponse};
use crate::protocol::{ClientMessage, ErrorFrame, ServerMessage};
use crate::queries::{
    ProjectionContext, QueryCallback, QueryError, QueryManager, QueryOnce, SnapshotContext,
};
use crate::rooms::{PresenceCallback, RoomManager, TopicCallback};
use graphsync_storage::{StorageBackend, WriteScheduler};
use graphsync_store::{Attr, AttrsStore, LinkIndex};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

// ============================================================================
// State
// ============================================================================

struct ReactorState {
    attrs: AttrsStore,
    link_index: Option<LinkIndex>,
    session_id: Option<String>,
    /// Connection-level error; shadows every query projection while set.
    error: Option<QueryError>,
    gate: SessionGate,
    mutations: MutationPipeline,
    queries: QueryManager,
    rooms: RoomManager,
}

impl ReactorState {
    fn notify_all(&mut self, out: &mut Outbox) {
        let ctx = ProjectionContext {
            pending: &self.mutations,
            error: self.error.as_ref(),
        };
        self.queries.notify_all(ctx, out);
    }

    /// Replace the attribute set; later entries win on id.
    fn set_attrs(&mut self, attrs: Vec<Attr>) {
        self.attrs = AttrsStore::new(attrs);
        self.queries.invalidate_projections();
    }

    fn set_authenticated(&mut self, authenticated: bool) {
        self.gate.authenticated = authenticated;
        self.rooms.set_authenticated(authenticated);
    }

    fn handle_error_frame(&mut self, frame: ErrorFrame, out: &mut Outbox) {
        if let Some(event_id) = frame
            .client_event_id
            .as_deref()
            .filter(|id| self.mutations.is_pending(id))
        {
            let failure = Failure::from(&frame);
            if self
                .mutations
                .handle_mutation_error(FailureKind::Error, event_id, failure, out)
            {
                self.notify_all(out);
            }
            return;
        }

        if let Some(q) = frame.query() {
            let error = QueryError {
                message: frame.message.clone(),
                hint: frame.hint.clone(),
            };
            self.queries.handle_query_error(q, error, out);
            return;
        }

        let is_init = frame
            .original_event
            .as_ref()
            .and_then(|e| e.get("op"))
            .and_then(Value::as_str)
            == Some("init");
        if is_init {
            warn!(message = %frame.message, "connection rejected");
            self.error = Some(QueryError {
                message: frame.message.clone(),
                hint: frame.hint.clone(),
            });
            self.notify_all(out);
            return;
        }

        error!(message = %frame.message, "unhandled error frame");
    }
}

struct Inner {
    state: Mutex<ReactorState>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<WriteScheduler>,
    config: ReactorConfig,
}

// ============================================================================
// Subscriptions
// ============================================================================

type Teardown = Box<dyn FnOnce(&Reactor) + Send>;

/// Handle returned by every `subscribe_*` and `join_room`.
///
/// Dropping it keeps the subscription alive; call [`Subscription::unsubscribe`]
/// to end it.
#[must_use = "a subscription stays registered until unsubscribe is called"]
pub struct Subscription {
    reactor: Weak<Inner>,
    teardown: Option<Teardown>,
}

impl Subscription {
    fn new(inner: &Arc<Inner>, teardown: impl FnOnce(&Reactor) + Send + 'static) -> Self {
        Self {
            reactor: Arc::downgrade(inner),
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn unsubscribe(mut self) {
        let (Some(inner), Some(teardown)) = (self.reactor.upgrade(), self.teardown.take()) else {
            return;
        };
        teardown(&Reactor { inner });
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("live", &self.teardown.is_some())
            .finish()
    }
}

/// Write-back drain and the timeout ticker.
pub struct BackgroundTasks {
    scheduler: Arc<WriteScheduler>,
    writer: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Stop ticking and wait for the final flush.
    pub async fn shutdown(self) {
        self.ticker.abort();
        self.scheduler.shutdown();
        if let Err(error) = self.writer.await {
            warn!(%error, "write-back task ended abnormally");
        }
    }
}

// ============================================================================
// Reactor
// ============================================================================

#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    pub fn new(
        config: ReactorConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self::with_clock(config, transport, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ReactorConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = WriteScheduler::new(backend);
        scheduler.on_error(Box::new(|error| {
            error!(%error, "unable to persist reactor state");
        }));
        let state = ReactorState {
            attrs: AttrsStore::default(),
            link_index: None,
            session_id: None,
            error: None,
            gate: SessionGate {
                online: true,
                authenticated: false,
            },
            mutations: MutationPipeline::new(Arc::clone(&scheduler), &config),
            queries: QueryManager::new(Arc::clone(&scheduler), config.query_cache_limit),
            rooms: RoomManager::new(),
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                transport,
                clock,
                scheduler,
                config,
            }),
        }
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    /// Lock, run `f`, unlock, deliver.
    fn with_state<R>(&self, f: impl FnOnce(&mut ReactorState, &mut Outbox) -> R) -> R {
        let mut out = Outbox::new();
        let result = {
            let mut state = self.inner.state.lock();
            let result = f(&mut *state, &mut out);
            if !state.gate.authenticated {
                // Re-sent by `flush_pending_messages` once the socket is authenticated.
                out.retain_sends(|m| {
                    !matches!(m, ClientMessage::AddQuery { .. } | ClientMessage::RemoveQuery { .. })
                });
            }
            result
        };
        out.deliver(self.inner.transport.as_ref());
        result
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn attrs(&self) -> AttrsStore {
        self.inner.state.lock().attrs.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.lock().gate.authenticated
    }

    pub fn pending_mutation_count(&self) -> usize {
        self.inner.state.lock().mutations.len()
    }

    /// Schema hints used when building snapshot stores.
    pub fn set_link_index(&self, link_index: Option<LinkIndex>) {
        self.with_state(|state, out| {
            state.link_index = link_index;
            state.queries.invalidate_projections();
            state.notify_all(out);
        });
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Lower `ops` and enqueue the result. A transform failure still yields
    /// a receipt, which rejects with the transform error.
    pub fn transact(&self, ops: &[EditOp]) -> MutationReceipt {
        let now = self.now();
        self.with_state(|state, out| {
            let attrs = state.mutations.optimistic_attrs(&state.attrs);
            let stores = state.queries.snapshot_stores();
            let ctx = TransformContext::new(&attrs).with_stores(&stores);
            let (tx_steps, error) = match transform(ctx, ops) {
                Ok(steps) => (steps, None),
                Err(error) => {
                    debug!(%error, "transform failed");
                    (
                        Vec::new(),
                        Some(MutationErrorDetails {
                            message: error.to_string(),
                            hint: None,
                        }),
                    )
                }
            };
            let ctx = PipelineContext {
                attrs: &state.attrs,
                gate: state.gate,
                now,
            };
            let receipt = state.mutations.enqueue(tx_steps, error, ctx, out);
            state.notify_all(out);
            receipt
        })
    }

    pub fn subscribe_mutation_errors(&self, cb: MutationErrorCallback) -> Subscription {
        let id = self.with_state(|state, _| state.mutations.subscribe_errors(cb));
        Subscription::new(&self.inner, move |reactor| {
            reactor.with_state(|state, _| state.mutations.unsubscribe_errors(id));
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn subscribe_query(&self, q: Value, cb: QueryCallback) -> Subscription {
        let now = self.now();
        let (hash, id) = self.with_state(|state, out| {
            let ctx = ProjectionContext {
                pending: &state.mutations,
                error: state.error.as_ref(),
            };
            state.queries.subscribe(q, cb, ctx, now, out)
        });
        Subscription::new(&self.inner, move |reactor| {
            reactor.with_state(|state, out| state.queries.unsubscribe(&hash, id, out));
        })
    }

    pub fn query_once(&self, q: Value) -> QueryOnce {
        let now = self.now();
        self.with_state(|state, out| state.queries.query_once(q, now, out))
    }

    // ------------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------------

    pub fn join_room(&self, room_id: &str, initial_presence: Option<Value>) -> Subscription {
        self.with_state(|state, out| state.rooms.join_room(room_id, initial_presence, out));
        let room_id = room_id.to_string();
        Subscription::new(&self.inner, move |reactor| {
            reactor.with_state(|state, out| state.rooms.leave_room(&room_id, out));
        })
    }

    pub fn publish_presence(&self, room_id: &str, partial: Value) {
        self.with_state(|state, out| state.rooms.publish_presence(room_id, partial, out));
    }

    pub fn get_presence(&self, room_id: &str, opts: &PresenceOpts) -> Option<PresenceResponse> {
        self.inner.state.lock().rooms.get_presence(room_id, opts)
    }

    pub fn subscribe_presence(
        &self,
        room_id: &str,
        opts: PresenceOpts,
        cb: PresenceCallback,
    ) -> Subscription {
        let id = self.with_state(|state, out| state.rooms.subscribe_presence(room_id, opts, cb, out));
        let room_id = room_id.to_string();
        Subscription::new(&self.inner, move |reactor| {
            reactor.with_state(|state, out| state.rooms.unsubscribe_presence(&room_id, id, out));
        })
    }

    pub fn publish_topic(&self, room_type: &str, room_id: &str, topic: &str, data: Value) {
        self.with_state(|state, out| state.rooms.publish_topic(room_type, room_id, topic, data, out));
    }

    pub fn subscribe_topic(&self, room_id: &str, topic: &str, cb: TopicCallback) -> Subscription {
        let id = self.with_state(|state, out| state.rooms.subscribe_topic(room_id, topic, cb, out));
        let (room_id, topic) = (room_id.to_string(), topic.to_string());
        Subscription::new(&self.inner, move |reactor| {
            reactor.with_state(|state, out| state.rooms.unsubscribe_topic(&room_id, &topic, id, out));
        })
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    /// Parse one inbound frame and dispatch it.
    pub fn handle_raw(&self, text: &str) -> Result<()> {
        let message: ServerMessage = serde_json::from_str(text)?;
        self.handle_receive(message);
        Ok(())
    }

    pub fn handle_receive(&self, message: ServerMessage) {
        let now = self.now();
        let cardinality_inference = self.inner.config.cardinality_inference;
        self.with_state(|state, out| match message {
            ServerMessage::InitOk { attrs, session_id } => {
                debug!(?session_id, attrs = attrs.len(), "init-ok");
                state.set_authenticated(true);
                state.set_attrs(attrs);
                state.error = None;
                state.rooms.set_session_id(session_id.clone());
                state.session_id = session_id;
                state.queries.flush_pending_messages(out);
                let ctx = PipelineContext {
                    attrs: &state.attrs,
                    gate: state.gate,
                    now,
                };
                state.mutations.send_pending(ctx, out);
                state.rooms.resend_joins(out);
                state.notify_all(out);
            }
            ServerMessage::AddQueryOk {
                q,
                result,
                processed_tx_id,
            } => {
                let snapshot = SnapshotContext {
                    attrs: &state.attrs,
                    cardinality_inference,
                    link_index: state.link_index.as_ref(),
                };
                let ctx = ProjectionContext {
                    pending: &state.mutations,
                    error: state.error.as_ref(),
                };
                state
                    .queries
                    .handle_add_query_ok(&q, &result, processed_tx_id, snapshot, ctx, out);
                if let Some(min) = state.queries.min_processed_tx_id() {
                    state.mutations.cleanup_confirmed(min);
                }
            }
            ServerMessage::RefreshOk {
                computations,
                attrs,
                processed_tx_id,
            } => {
                if let Some(attrs) = attrs {
                    state.set_attrs(attrs);
                }
                let snapshot = SnapshotContext {
                    attrs: &state.attrs,
                    cardinality_inference,
                    link_index: state.link_index.as_ref(),
                };
                let ctx = ProjectionContext {
                    pending: &state.mutations,
                    error: state.error.as_ref(),
                };
                state
                    .queries
                    .handle_refresh_ok(&computations, processed_tx_id, snapshot, ctx, out);
                if let Some(min) = state.queries.min_processed_tx_id() {
                    state.mutations.cleanup_confirmed(min);
                }
            }
            ServerMessage::TransactOk {
                client_event_id,
                tx_id,
            } => {
                let ctx = PipelineContext {
                    attrs: &state.attrs,
                    gate: state.gate,
                    now,
                };
                if let Some(attrs) = state
                    .mutations
                    .handle_transact_ok(&client_event_id, tx_id, ctx, out)
                {
                    state.set_attrs(attrs);
                }
                state.notify_all(out);
            }
            ServerMessage::Error(frame) => state.handle_error_frame(frame, out),
            ServerMessage::JoinRoomOk { room_id } => state.rooms.handle_join_room_ok(&room_id, out),
            ServerMessage::JoinRoomError { room_id, error } => {
                state.rooms.handle_join_room_error(&room_id, error, out)
            }
            ServerMessage::RefreshPresence { room_id, data } => {
                state.rooms.handle_refresh_presence(&room_id, &data, out)
            }
            ServerMessage::PatchPresence { room_id, edits } => {
                state.rooms.handle_patch_presence(&room_id, &edits, out)
            }
            ServerMessage::ServerBroadcast {
                room_id,
                topic,
                data,
            } => state.rooms.handle_server_broadcast(&room_id, &topic, &data, out),
            ServerMessage::Unknown => debug!("ignoring unknown op"),
        });
    }

    /// The socket went away: nothing is authenticated and in-flight sends
    /// must be repeated on the next connection.
    pub fn handle_socket_closed(&self) {
        self.with_state(|state, out| {
            debug!("socket closed");
            state.set_authenticated(false);
            state.mutations.clear_deadlines();
            state.rooms.handle_socket_closed(out);
        });
    }

    pub fn handle_online(&self, online: bool) {
        let now = self.now();
        self.with_state(|state, out| {
            state.gate.online = online;
            if online {
                let ctx = PipelineContext {
                    attrs: &state.attrs,
                    gate: state.gate,
                    now,
                };
                state.mutations.send_pending(ctx, out);
            }
        });
    }

    /// Fire due mutation deadlines.
    pub fn tick(&self) {
        let now = self.now();
        self.with_state(|state, out| {
            if state.mutations.expire_timeouts(now, state.gate.online, out) {
                state.notify_all(out);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    /// Load both durable cells, then resend what only storage knew about.
    pub async fn load_storage(&self) {
        let (pending, subs) = {
            let state = self.inner.state.lock();
            (state.mutations.cell().clone(), state.queries.cell().clone())
        };
        tokio::join!(pending.load(), subs.load());

        let now = self.now();
        self.with_state(|state, out| {
            let ctx = PipelineContext {
                attrs: &state.attrs,
                gate: state.gate,
                now,
            };
            state.mutations.handle_loaded(ctx, out);
            state.queries.invalidate_projections();
            state.notify_all(out);
        });
    }

    /// Drain queued write-backs. Returns how many were written.
    pub async fn flush_storage(&self) -> usize {
        self.inner.scheduler.flush().await
    }

    /// Start the write-back drain and the deadline ticker on the current
    /// tokio runtime.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let scheduler = Arc::clone(&self.inner.scheduler);
        let writer = tokio::spawn(Arc::clone(&scheduler).run());

        let weak = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.timer_tick_ms.max(1));
        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Reactor { inner }.tick();
            }
        });

        BackgroundTasks {
            scheduler,
            writer,
            ticker,
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("app_id", &self.inner.config.app_id)
            .finish()
    }
}
