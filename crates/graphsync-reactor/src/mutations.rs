//! Optimistic mutation pipeline.
//!
//! ```text
//!   enqueue ──► pending (durable) ──► send gate ──► transport
//!                   │                     │
//!                   │            offline / unauthenticated:
//!                   │            resolve `enqueued`, resend later
//!                   ▼
//!   transact-ok: stamp tx-id + confirmed, promote add-attrs, resolve `synced`
//!   error / deadline: drop, reject, broadcast to error subscribers
//! ```
//!
//! Stored mutations are never rewritten. Every read recomputes the mapping
//! from client-invented attribute ids to the server's and applies it to a
//! copy, so storage stays exactly what the caller enqueued.

use crate::config::ReactorConfig;
use crate::error::{ApiErrorBody, MutationError, MutationErrorDetails};
use crate::instaml::{rewrite_step, AttrMapping};
use crate::notify::Outbox;
use crate::protocol::{ClientMessage, ErrorFrame};
use graphsync_storage::{MergeFn, PersistedObject, WriteScheduler};
use graphsync_store::{Attr, AttrsStore, Store, TxStep};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Storage key of the pending-mutation cell.
pub const PENDING_MUTATIONS_KEY: &str = "pendingMutations";

// ============================================================================
// Pending Mutations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    #[serde(rename = "tx-steps")]
    pub tx_steps: Vec<TxStep>,
    pub created: i64,
    #[serde(default)]
    pub order: u64,
    #[serde(rename = "tx-id", default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<i64>,
    /// When the server acknowledged it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<i64>,
    /// Set when the transform failed; the mutation is rejected on send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MutationErrorDetails>,
}

impl PendingMutation {
    fn superseded_by(&self, processed_tx_id: Option<i64>) -> bool {
        matches!((processed_tx_id, self.tx_id), (Some(p), Some(t)) if p >= t)
    }

    /// Whether a snapshot at `processed_tx_id` does not include this write yet.
    pub fn is_ahead_of(&self, processed_tx_id: Option<i64>) -> bool {
        match (self.tx_id, processed_tx_id) {
            (None, _) => true,
            (Some(t), Some(p)) => t > p,
            (Some(_), None) => false,
        }
    }
}

/// `event-id -> mutation`, persisted as a list of `[event-id, mutation]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingMutations {
    entries: BTreeMap<String, PendingMutation>,
}

impl PendingMutations {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, event_id: &str) -> Option<&PendingMutation> {
        self.entries.get(event_id)
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.entries.contains_key(event_id)
    }

    pub fn insert(&mut self, event_id: impl Into<String>, mutation: PendingMutation) {
        self.entries.insert(event_id.into(), mutation);
    }

    pub fn remove(&mut self, event_id: &str) -> Option<PendingMutation> {
        self.entries.remove(event_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PendingMutation)> {
        self.entries.iter()
    }

    pub fn max_order(&self) -> u64 {
        self.entries.values().map(|m| m.order).max().unwrap_or(0)
    }

    /// Apply order: by `order`, ties broken by event id.
    pub fn sorted(&self) -> Vec<(&String, &PendingMutation)> {
        let mut out: Vec<_> = self.entries.iter().collect();
        out.sort_by(|(ka, a), (kb, b)| a.order.cmp(&b.order).then_with(|| ka.cmp(kb)));
        out
    }

    /// Storage entries overlaid by in-memory ones.
    pub fn merged(stored: Option<PendingMutations>, in_memory: PendingMutations) -> Self {
        let mut out = stored.unwrap_or_default();
        out.entries.extend(in_memory.entries);
        out
    }

    /// The mapping from client-invented attribute ids onto `attrs`.
    pub fn attr_mapping(&self, attrs: &AttrsStore) -> AttrMapping {
        let mut mapping = AttrMapping::default();
        for step in self.entries.values().flat_map(|m| &m.tx_steps) {
            let TxStep::AddAttr(attr) = step else {
                continue;
            };
            let (etype, label) = (attr.forward_identity.etype(), attr.forward_identity.label());
            if let Some(existing) = attrs.by_forward_label(etype, label) {
                if existing.id != attr.id {
                    mapping.attr_id_map.insert(attr.id.clone(), existing.id.clone());
                }
                continue;
            }
            if attr.is_ref() {
                if let Some(reverse) = attrs.by_reverse_label(etype, label) {
                    mapping.attr_id_map.insert(attr.id.clone(), reverse.id.clone());
                    mapping.ref_swap_attr_ids.insert(attr.id.clone());
                }
            }
        }
        mapping
    }

    /// Every mutation with its steps mapped onto `attrs`.
    ///
    /// Drops `add-attr` steps the server already has under another id, and
    /// schema steps of mutations a snapshot at `processed_tx_id` includes.
    /// Borrows `self` when nothing changes.
    pub fn rewritten(&self, attrs: &AttrsStore, processed_tx_id: Option<i64>) -> Cow<'_, Self> {
        let mapping = self.attr_mapping(attrs);
        let drops_schema = self
            .entries
            .values()
            .any(|m| m.superseded_by(processed_tx_id) && m.tx_steps.iter().any(TxStep::is_schema_step));
        if mapping.is_empty() && !drops_schema {
            return Cow::Borrowed(self);
        }

        let entries = self
            .entries
            .iter()
            .map(|(event_id, mutation)| {
                let superseded = mutation.superseded_by(processed_tx_id);
                let tx_steps = mutation
                    .tx_steps
                    .iter()
                    .filter(|step| match step {
                        TxStep::AddAttr(attr) if mapping.attr_id_map.contains_key(&attr.id) => false,
                        step => !(superseded && step.is_schema_step()),
                    })
                    .map(|step| rewrite_step(&mapping, step))
                    .collect();
                let mut mutation = mutation.clone();
                mutation.tx_steps = tx_steps;
                (event_id.clone(), mutation)
            })
            .collect();
        Cow::Owned(PendingMutations { entries })
    }
}

impl Serialize for PendingMutations {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.sorted().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PendingMutations {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(String, PendingMutation)>::deserialize(deserializer)?;
        Ok(PendingMutations {
            entries: pairs.into_iter().collect(),
        })
    }
}

/// Replay `mutations` onto `store`, skipping those `processed_tx_id` covers.
///
/// A mutation whose steps fail to apply is skipped.
pub fn apply_optimistic_updates<'a>(
    store: &Store,
    mutations: impl IntoIterator<Item = (&'a String, &'a PendingMutation)>,
    processed_tx_id: Option<i64>,
) -> Store {
    let mut store = store.clone();
    for (event_id, mutation) in mutations {
        if !mutation.is_ahead_of(processed_tx_id) {
            continue;
        }
        match store.transact(&mutation.tx_steps) {
            Ok(next) => store = next,
            Err(error) => warn!(%event_id, %error, "skipping pending mutation that does not apply"),
        }
    }
    store
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Parked until the connection is usable.
    Enqueued,
    /// Acknowledged by the server.
    Synced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub status: TxStatus,
    #[serde(rename = "eventId")]
    pub event_id: String,
}

type Deferred = oneshot::Sender<Result<TxOutcome, MutationError>>;

/// Resolves once the mutation is enqueued, synced or rejected.
#[derive(Debug)]
pub struct MutationReceipt {
    event_id: String,
    rx: oneshot::Receiver<Result<TxOutcome, MutationError>>,
}

impl MutationReceipt {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// The outcome if it is already known.
    pub fn try_outcome(&mut self) -> Option<Result<TxOutcome, MutationError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(MutationError::Abandoned)),
        }
    }
}

impl Future for MutationReceipt {
    type Output = Result<TxOutcome, MutationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(MutationError::Abandoned)))
    }
}

/// How a mutation ended badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Error,
}

/// Error payload as the server (or the client) reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Failure {
    pub message: String,
    pub kind: Option<String>,
    pub status: Option<u16>,
    pub hint: Option<Value>,
}

impl Failure {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    fn details(&self) -> MutationErrorDetails {
        MutationErrorDetails {
            message: self.message.clone(),
            hint: self.hint.clone(),
        }
    }

    fn into_error(self, kind: FailureKind) -> MutationError {
        match (kind, self.kind) {
            (FailureKind::Timeout, _) => MutationError::Timeout,
            (FailureKind::Error, Some(kind)) => MutationError::Api {
                status: self.status.unwrap_or_default(),
                body: ApiErrorBody {
                    kind: Some(kind),
                    message: self.message,
                    hint: self.hint,
                },
            },
            (FailureKind::Error, None) => MutationError::Client {
                message: self.message,
                hint: self.hint,
            },
        }
    }
}

impl From<&ErrorFrame> for Failure {
    fn from(frame: &ErrorFrame) -> Self {
        Self {
            message: frame.message.clone(),
            kind: frame.kind.clone(),
            status: frame.status,
            hint: frame.hint.clone(),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub type MutationErrorCallback = Arc<dyn Fn(&MutationErrorDetails) + Send + Sync>;

/// Connection facts the send gate consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionGate {
    pub online: bool,
    pub authenticated: bool,
}

impl SessionGate {
    pub fn is_open(&self) -> bool {
        self.online && self.authenticated
    }
}

/// What the pipeline needs from the rest of the reactor for one call.
#[derive(Clone, Copy)]
pub struct PipelineContext<'a> {
    pub attrs: &'a AttrsStore,
    pub gate: SessionGate,
    pub now: i64,
}

enum Finish {
    Enqueued,
    Synced,
    Failed(FailureKind, Failure),
}

pub struct MutationPipeline {
    pending: PersistedObject<PendingMutations>,
    deferreds: HashMap<String, Deferred>,
    /// Send deadlines by event id.
    deadlines: HashMap<String, i64>,
    /// Enqueued by this process, as opposed to found in storage.
    local_ids: HashSet<String>,
    error_subs: BTreeMap<u64, MutationErrorCallback>,
    next_sub_id: u64,
    timeout_floor_ms: i64,
    cleanup_threshold: usize,
    cleanup_age_ms: i64,
}

impl MutationPipeline {
    pub fn new(scheduler: Arc<WriteScheduler>, config: &ReactorConfig) -> Self {
        let merge: MergeFn<PendingMutations> = Box::new(PendingMutations::merged);
        Self {
            pending: PersistedObject::new(
                PENDING_MUTATIONS_KEY,
                PendingMutations::default(),
                scheduler,
                merge,
            ),
            deferreds: HashMap::new(),
            deadlines: HashMap::new(),
            local_ids: HashSet::new(),
            error_subs: BTreeMap::new(),
            next_sub_id: 0,
            timeout_floor_ms: config.mutation_timeout_floor_ms,
            cleanup_threshold: config.pending_cleanup_threshold,
            cleanup_age_ms: config.pending_cleanup_age_ms,
        }
    }

    /// The durable cell, for loading and flushing.
    pub fn cell(&self) -> &PersistedObject<PendingMutations> {
        &self.pending
    }

    pub fn version(&self) -> u64 {
        self.pending.version()
    }

    pub fn len(&self) -> usize {
        self.pending.with(PendingMutations::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> PendingMutations {
        self.pending.get()
    }

    pub fn has_deadline(&self, event_id: &str) -> bool {
        self.deadlines.contains_key(event_id)
    }

    /// Rewritten against `attrs`, in apply order.
    pub fn rewrite_sorted(&self, attrs: &AttrsStore, processed_tx_id: Option<i64>) -> Vec<(String, PendingMutation)> {
        self.pending.with(|pending| {
            pending
                .rewritten(attrs, processed_tx_id)
                .sorted()
                .into_iter()
                .map(|(k, m)| (k.clone(), m.clone()))
                .collect()
        })
    }

    /// `base` plus pending schema changes.
    pub fn optimistic_attrs(&self, base: &AttrsStore) -> AttrsStore {
        self.pending.with(|pending| {
            let mut attrs = base.clone();
            let mut deleted = HashSet::new();
            for (_, mutation) in pending.sorted() {
                for step in &mutation.tx_steps {
                    match step {
                        TxStep::AddAttr(attr) => attrs.add(attr.clone()),
                        TxStep::UpdateAttr(patch) => {
                            if let Some(existing) = base.get(&patch.id) {
                                let mut full = existing.clone();
                                full.apply_patch(patch);
                                attrs.add(full);
                            }
                        }
                        TxStep::DeleteAttr(id) => {
                            deleted.insert(id.clone());
                        }
                        _ => {}
                    }
                }
            }
            for id in &deleted {
                attrs.remove(id);
            }
            attrs
        })
    }

    // ------------------------------------------------------------------------
    // Enqueue / Send
    // ------------------------------------------------------------------------

    /// Append a mutation and try to send it right away.
    pub fn enqueue(
        &mut self,
        tx_steps: Vec<TxStep>,
        error: Option<MutationErrorDetails>,
        ctx: PipelineContext<'_>,
        out: &mut Outbox,
    ) -> MutationReceipt {
        let event_id = Uuid::new_v4().to_string();
        self.pending.set(|pending| {
            let mutation = PendingMutation {
                tx_steps,
                created: ctx.now,
                order: pending.max_order() + 1,
                tx_id: None,
                confirmed: None,
                error,
            };
            pending.insert(event_id.clone(), mutation);
        });
        self.local_ids.insert(event_id.clone());

        let (tx, rx) = oneshot::channel();
        self.deferreds.insert(event_id.clone(), tx);
        debug!(%event_id, "mutation enqueued");
        self.send_mutation(&event_id, ctx, out);
        MutationReceipt { event_id, rx }
    }

    fn send_mutation(&mut self, event_id: &str, ctx: PipelineContext<'_>, out: &mut Outbox) {
        let (mutation, queue_len) = self.pending.with(|pending| {
            let mutation = pending
                .rewritten(ctx.attrs, None)
                .get(event_id)
                .cloned();
            (mutation, pending.len())
        });
        let Some(mutation) = mutation else {
            return;
        };

        if let Some(details) = mutation.error {
            let failure = Failure {
                message: details.message,
                hint: details.hint,
                ..Default::default()
            };
            self.handle_mutation_error(FailureKind::Error, event_id, failure, out);
            return;
        }
        if !ctx.gate.is_open() {
            self.finish(event_id, Finish::Enqueued, out);
            return;
        }

        let timeout_ms = self.timeout_floor_ms.max(queue_len as i64 * self.timeout_floor_ms);
        out.send(
            event_id,
            ClientMessage::Transact {
                tx_steps: mutation.tx_steps,
                created: mutation.created,
                order: mutation.order,
            },
        );
        self.deadlines.insert(event_id.to_string(), ctx.now + timeout_ms);
        debug!(%event_id, timeout_ms, "mutation sent");
    }

    /// Resend every unconfirmed mutation without an armed deadline.
    pub fn send_pending(&mut self, ctx: PipelineContext<'_>, out: &mut Outbox) {
        let ids: Vec<String> = self.pending.with(|pending| {
            pending
                .sorted()
                .into_iter()
                .filter(|(id, m)| m.tx_id.is_none() && !self.deadlines.contains_key(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect()
        });
        for event_id in ids {
            self.send_mutation(&event_id, ctx, out);
        }
    }

    /// After the durable load: send what only storage knew about.
    pub fn handle_loaded(&mut self, ctx: PipelineContext<'_>, out: &mut Outbox) {
        let ids: Vec<String> = self.pending.with(|pending| {
            pending
                .sorted()
                .into_iter()
                .filter(|(id, m)| m.tx_id.is_none() && !self.local_ids.contains(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect()
        });
        for event_id in ids {
            debug!(%event_id, "resending mutation restored from storage");
            self.send_mutation(&event_id, ctx, out);
        }
    }

    /// Mutations sent on a dead socket must be sent again.
    pub fn clear_deadlines(&mut self) {
        self.deadlines.clear();
    }

    // ------------------------------------------------------------------------
    // Server Responses
    // ------------------------------------------------------------------------

    pub fn is_pending(&self, event_id: &str) -> bool {
        self.pending.with(|pending| pending.contains(event_id))
    }

    /// Drop a failed mutation and tell everyone. Returns whether it was
    /// dropped, in which case projections need recomputing.
    ///
    /// A timeout does nothing to a mutation the server already acknowledged.
    pub fn handle_mutation_error(
        &mut self,
        kind: FailureKind,
        event_id: &str,
        failure: Failure,
        out: &mut Outbox,
    ) -> bool {
        let removable = self.pending.with(|pending| {
            pending
                .get(event_id)
                .is_some_and(|m| kind != FailureKind::Timeout || m.tx_id.is_none())
        });
        if !removable {
            return false;
        }
        self.pending.set(|pending| pending.remove(event_id));
        self.deadlines.remove(event_id);
        self.local_ids.remove(event_id);

        let details = failure.details();
        for cb in self.error_subs.values() {
            let cb = Arc::clone(cb);
            let details = details.clone();
            out.call(move || cb(&details));
        }
        self.finish(event_id, Finish::Failed(kind, failure), out);
        true
    }

    /// Stamp the ack and return the attribute set it implies: the
    /// mutation's own `add-attr`s followed by `attrs`, later entries winning.
    pub fn handle_transact_ok(
        &mut self,
        event_id: &str,
        tx_id: i64,
        ctx: PipelineContext<'_>,
        out: &mut Outbox,
    ) -> Option<Vec<Attr>> {
        let acked = self.pending.with(|pending| {
            pending
                .rewritten(ctx.attrs, None)
                .get(event_id)
                .cloned()
        })?;

        self.pending.set(|pending| {
            if let Some(mutation) = pending.entries.get_mut(event_id) {
                mutation.tx_id = Some(tx_id);
                mutation.confirmed = Some(ctx.now);
            }
        });
        self.deadlines.remove(event_id);
        self.cleanup_timeout(ctx.now);

        let mut attrs: Vec<Attr> = acked
            .tx_steps
            .into_iter()
            .filter_map(|step| match step {
                TxStep::AddAttr(attr) => Some(attr),
                _ => None,
            })
            .collect();
        attrs.extend(ctx.attrs.iter().cloned());

        self.finish(event_id, Finish::Synced, out);
        Some(attrs)
    }

    /// Drop confirmed mutations every snapshot at `min_processed_tx_id` includes.
    pub fn cleanup_confirmed(&mut self, min_processed_tx_id: i64) {
        let stale: Vec<String> = self.pending.with(|pending| {
            pending
                .iter()
                .filter(|(_, m)| m.tx_id.is_some_and(|t| t <= min_processed_tx_id))
                .map(|(id, _)| id.clone())
                .collect()
        });
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), min_processed_tx_id, "cleaning up confirmed mutations");
        self.pending.set(|pending| {
            for id in &stale {
                pending.remove(id);
            }
        });
    }

    /// Bound the queue: past the threshold, drop confirmations older than
    /// the cleanup age and, if any went, every unconfirmed mutation too.
    pub fn cleanup_timeout(&mut self, now: i64) {
        if self.len() < self.cleanup_threshold {
            return;
        }
        let age = self.cleanup_age_ms;
        let removed = self.pending.set(|pending| {
            let expired: Vec<String> = pending
                .iter()
                .filter(|(_, m)| m.confirmed.is_some_and(|c| c + age < now))
                .map(|(id, _)| id.clone())
                .collect();
            let timeless: Vec<String> = pending
                .iter()
                .filter(|(_, m)| m.confirmed.is_none())
                .map(|(id, _)| id.clone())
                .collect();
            let mut removed = Vec::new();
            if !expired.is_empty() {
                removed.extend(expired);
                removed.extend(timeless);
            }
            for id in &removed {
                pending.remove(id);
            }
            removed
        });
        if !removed.is_empty() {
            warn!(count = removed.len(), "pending mutation queue overflowed, dropped entries");
        }
        for id in removed {
            self.deadlines.remove(&id);
        }
    }

    /// Fire every deadline at or before `now`. Returns whether any
    /// mutation was dropped.
    pub fn expire_timeouts(&mut self, now: i64, online: bool, out: &mut Outbox) -> bool {
        let due: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut dropped = false;
        for event_id in due {
            self.deadlines.remove(&event_id);
            if !online {
                continue;
            }
            dropped |= self.handle_mutation_error(
                FailureKind::Timeout,
                &event_id,
                Failure::message("transaction timed out"),
                out,
            );
        }
        dropped
    }

    // ------------------------------------------------------------------------
    // Error Subscribers
    // ------------------------------------------------------------------------

    pub fn subscribe_errors(&mut self, cb: MutationErrorCallback) -> u64 {
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.error_subs.insert(id, cb);
        id
    }

    pub fn unsubscribe_errors(&mut self, id: u64) {
        self.error_subs.remove(&id);
    }

    fn finish(&mut self, event_id: &str, finish: Finish, out: &mut Outbox) {
        let deferred = self.deferreds.remove(event_id);
        let outcome = match finish {
            Finish::Enqueued => Ok(TxStatus::Enqueued),
            Finish::Synced => Ok(TxStatus::Synced),
            Finish::Failed(kind, failure) => Err((kind, failure)),
        };
        let Some(deferred) = deferred else {
            if let Err((kind, failure)) = outcome {
                error!(%event_id, ?kind, message = %failure.message, "mutation failed");
            }
            return;
        };
        let result = match outcome {
            Ok(status) => Ok(TxOutcome {
                status,
                event_id: event_id.to_string(),
            }),
            Err((kind, failure)) => Err(failure.into_error(kind)),
        };
        // Resolve after the lock is released so awaiting tasks see settled state.
        out.call(move || {
            let _ = deferred.send(result);
        });
    }
}
