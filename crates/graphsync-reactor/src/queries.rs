//! Query subscriptions and their optimistic projections.
//!
//! Each distinct query (by content hash) keeps the last server snapshot.
//! A projection replays every pending mutation the snapshot does not
//! include yet and evaluates the query on the result:
//!
//! ```text
//!   snapshot store ──► + pending mutations (rewritten, sorted) ──► evaluate(q)
//!        ▲                                                            │
//!   add-query-ok / refresh-ok                          memoized on (subs version,
//!                                                       pending version)
//! ```

use crate::mutations::{apply_optimistic_updates, MutationPipeline};
use crate::notify::Outbox;
use crate::protocol::{extract_triples, result_meta, ClientMessage, Computation};
use graphsync_storage::{MergeFn, PersistedObject, WriteScheduler};
use graphsync_store::{query, AttrsStore, LinkIndex, Store, StoreJson};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Storage key of the query-subscription cell.
pub const QUERY_SUBS_KEY: &str = "querySubs";

/// Content hash of a query. Object keys are ordered, so equal queries hash
/// equally regardless of how they were written.
pub fn query_hash(q: &Value) -> String {
    let digest = Sha256::digest(q.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ============================================================================
// Cached Subscriptions
// ============================================================================

mod store_json {
    use super::*;

    pub fn serialize<S: Serializer>(store: &Store, serializer: S) -> Result<S::Ok, S::Error> {
        store.to_json().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Store, D::Error> {
        let json = StoreJson::deserialize(deserializer)?;
        Store::from_json(json).map_err(serde::de::Error::custom)
    }
}

/// A server snapshot for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(with = "store_json")]
    pub store: Store,
    #[serde(rename = "pageInfo", default, skip_serializing_if = "Option::is_none")]
    pub page_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Value>,
    #[serde(rename = "processedTxId", default, skip_serializing_if = "Option::is_none")]
    pub processed_tx_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySub {
    pub q: Value,
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(default)]
    pub result: Option<QueryResult>,
    #[serde(rename = "lastAccessed", default)]
    pub last_accessed: i64,
}

pub type QuerySubs = BTreeMap<String, QuerySub>;

/// In-memory subscriptions win; those without a result adopt the stored
/// one. Up to `limit` storage-only entries are kept, most recent first.
pub fn merge_query_subs(stored: Option<QuerySubs>, in_memory: QuerySubs, limit: usize) -> QuerySubs {
    let mut stored = stored.unwrap_or_default();
    let mut merged = in_memory;
    for (hash, sub) in merged.iter_mut() {
        if sub.result.is_none() {
            if let Some(result) = stored.get_mut(hash).and_then(|s| s.result.take()) {
                sub.result = Some(result);
            }
        }
    }

    let mut extra: Vec<(String, QuerySub)> = stored
        .into_iter()
        .filter(|(hash, _)| !merged.contains_key(hash))
        .collect();
    extra.sort_by(|(_, a), (_, b)| b.last_accessed.cmp(&a.last_accessed));
    merged.extend(extra.into_iter().take(limit));
    merged
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<Value>,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for QueryError {}

/// What a query subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Data {
        data: Value,
        page_info: Option<Value>,
        aggregate: Option<Value>,
    },
    Error(QueryError),
}

impl QueryResponse {
    pub fn data(&self) -> Option<&Value> {
        match self {
            QueryResponse::Data { data, .. } => Some(data),
            QueryResponse::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            QueryResponse::Error(error) => Some(error),
            QueryResponse::Data { .. } => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            QueryResponse::Data {
                data,
                page_info,
                aggregate,
            } => json!({"data": data, "pageInfo": page_info, "aggregate": aggregate}),
            QueryResponse::Error(error) => json!({ "error": error }),
        }
    }
}

pub type QueryCallback = Arc<dyn Fn(&QueryResponse) + Send + Sync>;

type OnceSender = oneshot::Sender<Result<QueryResponse, QueryError>>;

/// Resolves with the first projection after the server answers.
#[derive(Debug)]
pub struct QueryOnce {
    rx: oneshot::Receiver<Result<QueryResponse, QueryError>>,
}

impl Future for QueryOnce {
    type Output = Result<QueryResponse, QueryError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(QueryError::new("query abandoned"))))
    }
}

struct OnceWaiter {
    event_id: String,
    q: Value,
    tx: OnceSender,
}

#[derive(Default)]
struct QueryEntry {
    listeners: BTreeMap<u64, QueryCallback>,
    once: Vec<OnceWaiter>,
}

impl QueryEntry {
    fn is_idle(&self) -> bool {
        self.listeners.is_empty() && self.once.is_empty()
    }
}

struct CachedProjection {
    subs_version: u64,
    pending_version: u64,
    response: QueryResponse,
}

/// Schema facts a fresh snapshot store is built with.
#[derive(Clone, Copy)]
pub struct SnapshotContext<'a> {
    pub attrs: &'a AttrsStore,
    pub cardinality_inference: bool,
    pub link_index: Option<&'a LinkIndex>,
}

impl SnapshotContext<'_> {
    fn store(&self, result: &Value) -> Store {
        Store::new(
            self.attrs.clone(),
            extract_triples(result),
            self.cardinality_inference,
            self.link_index.cloned(),
        )
    }
}

// ============================================================================
// Query Manager
// ============================================================================

pub struct QueryManager {
    subs: PersistedObject<QuerySubs>,
    registry: BTreeMap<String, QueryEntry>,
    cache: HashMap<String, CachedProjection>,
    delivered: HashMap<String, QueryResponse>,
    next_listener_id: u64,
}

impl QueryManager {
    pub fn new(scheduler: Arc<WriteScheduler>, query_cache_limit: usize) -> Self {
        let merge: MergeFn<QuerySubs> =
            Box::new(move |stored, in_memory| merge_query_subs(stored, in_memory, query_cache_limit));
        Self {
            subs: PersistedObject::new(QUERY_SUBS_KEY, QuerySubs::new(), scheduler, merge),
            registry: BTreeMap::new(),
            cache: HashMap::new(),
            delivered: HashMap::new(),
            next_listener_id: 0,
        }
    }

    /// The durable cell, for loading and flushing.
    pub fn cell(&self) -> &PersistedObject<QuerySubs> {
        &self.subs
    }

    pub fn sub(&self, hash: &str) -> Option<QuerySub> {
        self.subs.with(|subs| subs.get(hash).cloned())
    }

    pub fn listener_count(&self, hash: &str) -> usize {
        self.registry.get(hash).map_or(0, |e| e.listeners.len())
    }

    /// Smallest processed-tx-id over the snapshots someone is listening to.
    /// Entries restored from storage with no listener do not count.
    pub fn min_processed_tx_id(&self) -> Option<i64> {
        self.subs.with(|subs| {
            subs.iter()
                .filter(|(hash, _)| self.registry.get(*hash).is_some_and(|e| !e.is_idle()))
                .filter_map(|(_, s)| s.result.as_ref().and_then(|r| r.processed_tx_id))
                .min()
        })
    }

    /// Snapshot stores, for deciding whether an entity already exists.
    pub fn snapshot_stores(&self) -> Vec<Store> {
        self.subs.with(|subs| {
            subs.values()
                .filter_map(|s| s.result.as_ref().map(|r| r.store.clone()))
                .collect()
        })
    }

    // ------------------------------------------------------------------------
    // Subscribe / Unsubscribe
    // ------------------------------------------------------------------------

    /// Register `cb`, replay the cached projection to it and ask the server
    /// for the query. Returns the hash and the listener id.
    pub fn subscribe(
        &mut self,
        q: Value,
        cb: QueryCallback,
        ctx: ProjectionContext<'_>,
        now: i64,
        out: &mut Outbox,
    ) -> (String, u64) {
        let hash = query_hash(&q);
        if let Some(response) = self.data_for_query(&hash, ctx) {
            self.delivered
                .entry(hash.clone())
                .or_insert_with(|| response.clone());
            let replay = Arc::clone(&cb);
            out.call(move || replay(&response));
        }

        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.registry.entry(hash.clone()).or_default().listeners.insert(id, cb);
        self.start_query_sub(q, &hash, now, out);
        (hash, id)
    }

    fn start_query_sub(&mut self, q: Value, hash: &str, now: i64, out: &mut Outbox) -> String {
        let event_id = self.subs.set(|subs| {
            let sub = subs.entry(hash.to_string()).or_insert_with(|| QuerySub {
                q: q.clone(),
                event_id: Uuid::new_v4().to_string(),
                result: None,
                last_accessed: now,
            });
            sub.last_accessed = now;
            sub.event_id.clone()
        });
        debug!(%hash, %event_id, "add-query");
        out.send(event_id.clone(), ClientMessage::AddQuery { q });
        event_id
    }

    /// Remove one listener; the last one out tells the server.
    pub fn unsubscribe(&mut self, hash: &str, listener_id: u64, out: &mut Outbox) {
        let Some(entry) = self.registry.get_mut(hash) else {
            return;
        };
        entry.listeners.remove(&listener_id);
        self.cleanup_query(hash, out);
    }

    fn cleanup_query(&mut self, hash: &str, out: &mut Outbox) {
        if self.registry.get(hash).is_some_and(|e| !e.is_idle()) {
            return;
        }
        self.registry.remove(hash);
        self.delivered.remove(hash);
        let Some(q) = self.subs.with(|subs| subs.get(hash).map(|s| s.q.clone())) else {
            return;
        };
        debug!(%hash, "remove-query");
        out.send(Uuid::new_v4().to_string(), ClientMessage::RemoveQuery { q });
    }

    /// One-shot query. Holds the query open until it resolves.
    pub fn query_once(&mut self, q: Value, now: i64, out: &mut Outbox) -> QueryOnce {
        let hash = query_hash(&q);
        let (tx, rx) = oneshot::channel();
        let event_id = self.start_query_sub(q.clone(), &hash, now, out);
        self.registry
            .entry(hash)
            .or_default()
            .once
            .push(OnceWaiter { event_id, q, tx });
        QueryOnce { rx }
    }

    // ------------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------------

    /// The optimistic projection for `hash`, or `None` before the first
    /// server result.
    pub fn data_for_query(&mut self, hash: &str, ctx: ProjectionContext<'_>) -> Option<QueryResponse> {
        if let Some(error) = ctx.error {
            return Some(QueryResponse::Error(error.clone()));
        }
        let subs_version = self.subs.version();
        let pending_version = ctx.pending.version();
        let (q, result) = self
            .subs
            .with(|subs| subs.get(hash).and_then(|s| Some((s.q.clone(), s.result.clone()?))))?;

        if let Some(cached) = self.cache.get(hash) {
            if cached.subs_version == subs_version && cached.pending_version == pending_version {
                return Some(cached.response.clone());
            }
        }

        let processed = result.processed_tx_id;
        let mutations = ctx.pending.rewrite_sorted(result.store.attrs(), processed);
        let store = apply_optimistic_updates(
            &result.store,
            mutations.iter().map(|(id, m)| (id, m)),
            processed,
        );
        let response = match query::evaluate(&store, &q) {
            Ok(data) => QueryResponse::Data {
                data,
                page_info: result.page_info,
                aggregate: result.aggregate,
            },
            Err(error) => {
                warn!(%hash, %error, "query evaluation failed");
                QueryResponse::Error(QueryError::new(error.to_string()))
            }
        };
        self.cache.insert(
            hash.to_string(),
            CachedProjection {
                subs_version,
                pending_version,
                response: response.clone(),
            },
        );
        Some(response)
    }

    /// Drop memoized projections so the next read re-evaluates. What
    /// listeners last received is kept, so an unchanged result stays quiet.
    pub fn invalidate_projections(&mut self) {
        self.cache.clear();
    }

    /// Recompute and deliver `hash`, unless it equals what listeners last saw.
    pub fn notify_one(&mut self, hash: &str, ctx: ProjectionContext<'_>, out: &mut Outbox) {
        let Some(response) = self.data_for_query(hash, ctx) else {
            return;
        };
        if self.delivered.get(hash) == Some(&response) {
            return;
        }
        let Some(entry) = self.registry.get(hash) else {
            return;
        };
        self.delivered.insert(hash.to_string(), response.clone());
        for cb in entry.listeners.values() {
            let cb = Arc::clone(cb);
            let response = response.clone();
            out.call(move || cb(&response));
        }
    }

    pub fn notify_all(&mut self, ctx: ProjectionContext<'_>, out: &mut Outbox) {
        let hashes: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, e)| !e.listeners.is_empty())
            .map(|(h, _)| h.clone())
            .collect();
        for hash in hashes {
            self.notify_one(&hash, ctx, out);
        }
    }

    fn resolve_once(&mut self, hash: &str, ctx: ProjectionContext<'_>, out: &mut Outbox) {
        let Some(waiters) = self.registry.get_mut(hash).map(|e| std::mem::take(&mut e.once)) else {
            return;
        };
        if waiters.is_empty() {
            return;
        }
        let response = self.data_for_query(hash, ctx);
        for waiter in waiters {
            let outcome = response
                .clone()
                .ok_or_else(|| QueryError::new("query returned no result"));
            out.call(move || {
                let _ = waiter.tx.send(outcome);
            });
        }
        self.cleanup_query(hash, out);
    }

    // ------------------------------------------------------------------------
    // Server Results
    // ------------------------------------------------------------------------

    pub fn handle_add_query_ok(
        &mut self,
        q: &Value,
        result: &Value,
        processed_tx_id: Option<i64>,
        snapshot: SnapshotContext<'_>,
        ctx: ProjectionContext<'_>,
        out: &mut Outbox,
    ) {
        let hash = query_hash(q);
        let (page_info, aggregate) = result_meta(result);
        let store = snapshot.store(result);
        let stored = self.subs.set(|subs| match subs.get_mut(&hash) {
            Some(sub) => {
                sub.result = Some(QueryResult {
                    store,
                    page_info,
                    aggregate,
                    processed_tx_id,
                });
                true
            }
            None => false,
        });
        if !stored {
            debug!(%hash, "result for a query nobody holds");
            return;
        }
        self.notify_one(&hash, ctx, out);
        self.resolve_once(&hash, ctx, out);
    }

    pub fn handle_refresh_ok(
        &mut self,
        computations: &[Computation],
        processed_tx_id: Option<i64>,
        snapshot: SnapshotContext<'_>,
        ctx: ProjectionContext<'_>,
        out: &mut Outbox,
    ) {
        let mut refreshed = Vec::new();
        for computation in computations {
            let hash = query_hash(&computation.query);
            let (page_info, aggregate) = result_meta(&computation.result);
            let store = snapshot.store(&computation.result);
            let known = self.subs.set(|subs| match subs.get_mut(&hash) {
                Some(sub) => {
                    sub.result = Some(QueryResult {
                        store,
                        page_info,
                        aggregate,
                        processed_tx_id,
                    });
                    true
                }
                None => false,
            });
            if known {
                refreshed.push(hash);
            }
        }
        for hash in refreshed {
            self.notify_one(&hash, ctx, out);
        }
    }

    /// A server error about `q`: forget it, tell listeners, fail one-shots.
    pub fn handle_query_error(&mut self, q: &Value, error: QueryError, out: &mut Outbox) {
        let hash = query_hash(q);
        self.subs.set(|subs| subs.remove(&hash));
        self.cache.remove(&hash);
        let Some(entry) = self.registry.get_mut(&hash) else {
            return;
        };
        let response = QueryResponse::Error(error.clone());
        self.delivered.insert(hash.clone(), response.clone());
        for cb in entry.listeners.values() {
            let cb = Arc::clone(cb);
            let response = response.clone();
            out.call(move || cb(&response));
        }
        for waiter in std::mem::take(&mut entry.once) {
            let error = error.clone();
            out.call(move || {
                let _ = waiter.tx.send(Err(error));
            });
        }
        if entry.is_idle() {
            self.registry.remove(&hash);
            self.delivered.remove(&hash);
        }
    }

    /// Re-send `add-query` for everything still wanted.
    pub fn flush_pending_messages(&self, out: &mut Outbox) {
        self.subs.with(|subs| {
            for (hash, entry) in &self.registry {
                if entry.listeners.is_empty() {
                    continue;
                }
                if let Some(sub) = subs.get(hash) {
                    out.send(sub.event_id.clone(), ClientMessage::AddQuery { q: sub.q.clone() });
                }
            }
        });
        for entry in self.registry.values() {
            for waiter in &entry.once {
                out.send(waiter.event_id.clone(), ClientMessage::AddQuery { q: waiter.q.clone() });
            }
        }
    }
}

/// Inputs a projection depends on besides the snapshot.
#[derive(Clone, Copy)]
pub struct ProjectionContext<'a> {
    pub pending: &'a MutationPipeline,
    pub error: Option<&'a QueryError>,
}
