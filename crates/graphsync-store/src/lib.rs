//! graphsync-store: indexed, versioned in-memory triple store
//!
//! A [`Store`] is an immutable value. [`Store::transact`] applies a batch of
//! [`TxStep`]s to a copy that shares every untouched index subtree with its
//! parent, so holders of older versions never observe a write.
//!
//! ```text
//!            ┌────────────┐   transact(steps)   ┌────────────┐
//!  server ──►│  Store v1  │ ──────────────────► │  Store v2  │ ──► query::evaluate
//!  triples   └────────────┘   (copy-on-write)   └────────────┘
//!                 │  eav[e][a][v]  aev[a][e][v]  vae[v][a][e] (refs only)
//! ```
//!
//! ## Failure policy
//!
//! Steps that reference an unknown attribute, or a lookup that does not
//! resolve yet, are dropped without error. Those are races with the server
//! and heal once the server's own triples arrive. The only hard failure is
//! a `deep-merge-triple` into a reference attribute.
//!
//! ## Module Organization
//!
//! - `attrs`: attribute schema and the lazily derived label indexes
//! - `triple`: triples, lookup refs and the tx-step wire encoding
//! - `pattern`: triple patterns and value predicates
//! - `query`: evaluation of `{etype: form}` queries against a store

pub mod attrs;
mod clock;
pub mod error;
mod index;
pub mod pattern;
pub mod query;
pub mod triple;

pub use attrs::{
    Attr, AttrId, AttrPatch, AttrsStore, Cardinality, Ident, OnDelete, ValueType,
};
pub use clock::TripleClock;
pub use error::StoreError;
pub use pattern::{Comparator, TriplePattern, ValuePattern};
pub use triple::{
    deep_merge, EntityId, EntityRef, Triple, TripleOpts, TxStep, ValueKey, WriteMode,
};

use index::{Leaf, TripleIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Current [`StoreJson`] layout.
pub const STORE_JSON_VERSION: u32 = 1;

// ============================================================================
// Link Index
// ============================================================================

/// Per-link schema hints: `etype -> label -> info`.
pub type LinkIndex = BTreeMap<String, BTreeMap<String, LinkInfo>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkInfo {
    #[serde(rename = "isSingular", default)]
    pub is_singular: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has: Option<String>,
    #[serde(rename = "entityName", default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
}

impl LinkInfo {
    pub fn singular(&self) -> bool {
        self.is_singular || self.has.as_deref() == Some("one")
    }
}

/// Serialized store: schema plus a flat triple list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreJson {
    pub attrs: AttrsStore,
    pub triples: Vec<Triple>,
    #[serde(rename = "cardinality-inference", default)]
    pub cardinality_inference: bool,
    #[serde(rename = "link-index", default, skip_serializing_if = "Option::is_none")]
    pub link_index: Option<LinkIndex>,
    pub version: u32,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone)]
pub struct Store {
    attrs: Arc<AttrsStore>,
    eav: TripleIndex<ValueKey>,
    aev: TripleIndex<ValueKey>,
    vae: TripleIndex<String>,
    cardinality_inference: bool,
    link_index: Option<Arc<LinkIndex>>,
    clock: Arc<TripleClock>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new(AttrsStore::default(), Vec::new(), false, None)
    }
}

impl Store {
    /// Build a store from a schema and a triple list.
    ///
    /// Triples whose attribute is unknown are skipped.
    pub fn new(
        attrs: impl Into<Arc<AttrsStore>>,
        triples: impl IntoIterator<Item = Triple>,
        cardinality_inference: bool,
        link_index: Option<LinkIndex>,
    ) -> Self {
        let mut store = Store {
            attrs: attrs.into(),
            eav: TripleIndex::default(),
            aev: TripleIndex::default(),
            vae: TripleIndex::default(),
            cardinality_inference,
            link_index: link_index.map(Arc::new),
            clock: Arc::new(TripleClock::new()),
        };
        store.reindex(triples);
        store
    }

    pub fn from_json(json: StoreJson) -> Result<Self, StoreError> {
        if json.version != STORE_JSON_VERSION {
            return Err(StoreError::UnsupportedVersion(json.version));
        }
        Ok(Store::new(
            json.attrs,
            json.triples,
            json.cardinality_inference,
            json.link_index,
        ))
    }

    pub fn to_json(&self) -> StoreJson {
        StoreJson {
            attrs: (*self.attrs).clone(),
            triples: self.all_triples(),
            cardinality_inference: self.cardinality_inference,
            link_index: self.link_index.as_deref().cloned(),
            version: STORE_JSON_VERSION,
        }
    }

    /// Same triples under a different schema.
    ///
    /// Shares everything when `attrs` is the schema already in use.
    pub fn with_attrs(&self, attrs: Arc<AttrsStore>) -> Self {
        if Arc::ptr_eq(&self.attrs, &attrs) || *self.attrs == *attrs {
            let mut next = self.clone();
            next.attrs = attrs;
            return next;
        }
        let triples = self.all_triples();
        let mut next = self.clone();
        next.attrs = attrs;
        next.reindex(triples);
        next
    }

    pub fn attrs(&self) -> &AttrsStore {
        &self.attrs
    }

    pub fn attrs_arc(&self) -> Arc<AttrsStore> {
        Arc::clone(&self.attrs)
    }

    pub fn cardinality_inference(&self) -> bool {
        self.cardinality_inference
    }

    pub fn link_index(&self) -> Option<&LinkIndex> {
        self.link_index.as_deref()
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Every triple in `eav` order.
    pub fn all_triples(&self) -> Vec<Triple> {
        self.eav.triples().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.eav.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eav.triples().next().is_none()
    }

    pub fn has_triple(&self, entity: &str, attr_id: &str, value: &Value) -> bool {
        self.eav.get(entity, attr_id, &ValueKey::of(value)).is_some()
    }

    pub fn has_entity(&self, entity: &str) -> bool {
        self.eav.contains_top(entity)
    }

    /// Attribute ids `entity` has values for.
    pub fn attr_ids_of(&self, entity: &str) -> Vec<&str> {
        self.eav
            .level(entity)
            .map(|mid| mid.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Values of `(entity, attr)`, in value order.
    pub fn values(&self, entity: &str, attr_id: &str) -> Vec<&Value> {
        self.eav
            .leaf(entity, attr_id)
            .map(|leaf| leaf.values().map(|t| &t.value).collect())
            .unwrap_or_default()
    }

    /// Entities that point at `target` through the ref attribute `attr_id`.
    pub fn referrers(&self, target: &str, attr_id: &str) -> Vec<&str> {
        self.vae
            .leaf(target, attr_id)
            .map(|leaf| leaf.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Entities carrying any value for `attr_id`, with those triples.
    pub(crate) fn entities_with_attr(
        &self,
        attr_id: &str,
    ) -> impl Iterator<Item = (&String, &Leaf<ValueKey>)> {
        self.aev
            .level(attr_id)
            .into_iter()
            .flat_map(|mid| mid.iter().map(|(e, leaf)| (e, leaf.as_ref())))
    }

    pub(crate) fn entity_attr_leaf(&self, entity: &str, attr_id: &str) -> Option<&Leaf<ValueKey>> {
        self.eav.leaf(entity, attr_id)
    }

    /// Blob attributes of `entity` as an object keyed by label.
    pub fn entity_as_object(&self, etype: &str, entity: &str) -> Map<String, Value> {
        let mut obj = Map::new();
        for (label, attr) in self.attrs.blob_attrs(etype) {
            if let Some(leaf) = self.eav.leaf(entity, &attr.id) {
                for triple in leaf.values() {
                    obj.insert(label.to_string(), triple.value.clone());
                }
            }
        }
        obj
    }

    pub fn get_triples(&self, pattern: &TriplePattern) -> Vec<Triple> {
        let TriplePattern {
            entity,
            attr_id,
            value,
        } = pattern;
        let mut out = Vec::new();
        match (entity.as_deref(), attr_id.as_deref(), value.as_ref()) {
            (Some(e), None, None) => out.extend(self.eav.triples_under(e).cloned()),
            (Some(e), Some(a), None) => {
                if let Some(leaf) = self.eav.leaf(e, a) {
                    out.extend(leaf.values().cloned());
                }
            }
            (Some(e), Some(a), Some(v)) => {
                if let Some(leaf) = self.eav.leaf(e, a) {
                    self.triples_by_value(leaf, v, &mut out);
                }
            }
            (Some(e), None, Some(v)) => {
                for leaf in self.eav.level(e).into_iter().flat_map(|m| m.values()) {
                    self.triples_by_value(leaf, v, &mut out);
                }
            }
            (None, Some(a), None) => out.extend(self.aev.triples_under(a).cloned()),
            (None, Some(a), Some(v)) => {
                for leaf in self.aev.level(a).into_iter().flat_map(|m| m.values()) {
                    self.triples_by_value(leaf, v, &mut out);
                }
            }
            (None, None, Some(v)) => {
                for e in self.eav.top_keys() {
                    for leaf in self.eav.level(e).into_iter().flat_map(|m| m.values()) {
                        self.triples_by_value(leaf, v, &mut out);
                    }
                }
            }
            (None, None, None) => out.extend(self.eav.triples().cloned()),
        }
        out
    }

    fn triples_by_value(&self, leaf: &Leaf<ValueKey>, pattern: &ValuePattern, out: &mut Vec<Triple>) {
        match pattern {
            ValuePattern::Eq(v) => out.extend(leaf.get(&ValueKey::of(v)).cloned()),
            ValuePattern::In(values) => {
                for v in values {
                    out.extend(leaf.get(&ValueKey::of(v)).cloned());
                }
            }
            ValuePattern::Not(v) => {
                out.extend(leaf.values().filter(|t| t.value != *v).cloned());
            }
            ValuePattern::IsNull {
                attr_id,
                is_null,
                reverse,
            } => {
                for triple in leaf.values() {
                    let candidate = triple.value.as_str().unwrap_or_default();
                    let value_is_null = if *reverse {
                        self.vae.leaf(candidate, attr_id).is_none()
                    } else {
                        match self.aev.leaf(attr_id, candidate) {
                            None => true,
                            Some(values) => values.contains_key(&ValueKey::of(&Value::Null)),
                        }
                    };
                    if value_is_null == *is_null {
                        out.push(triple.clone());
                    }
                }
            }
            ValuePattern::Compare(op, bound) => {
                out.extend(leaf.values().filter(|t| op.matches(&t.value, bound)).cloned());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transact
    // ------------------------------------------------------------------------

    /// Apply `steps` to a copy of this store.
    pub fn transact(&self, steps: &[TxStep]) -> Result<Store, StoreError> {
        let mut next = self.clone();
        for step in steps {
            if !self.passes_mode_filter(step) {
                debug!(action = step.action(), "dropping step filtered by write mode");
                continue;
            }
            next.apply_step(step)?;
        }
        Ok(next)
    }

    /// `create` writes only land on missing entities, `update` writes only
    /// on existing ones. Existence is judged before the batch runs.
    fn passes_mode_filter(&self, step: &TxStep) -> bool {
        let (entity, attr_id, opts) = match step {
            TxStep::AddTriple {
                entity,
                attr_id,
                opts,
                ..
            }
            | TxStep::DeepMergeTriple {
                entity,
                attr_id,
                opts,
                ..
            } => (entity, attr_id, opts),
            _ => return true,
        };
        let Some(mode) = opts.and_then(|o| o.mode) else {
            return true;
        };
        let exists = self
            .attrs
            .get(attr_id)
            .and_then(|attr| self.attrs.primary_key(attr.forward_etype()))
            .zip(self.resolve_entity(entity))
            .map(|(id_attr, eid)| self.eav.leaf(&eid, &id_attr.id).is_some())
            .unwrap_or(false);
        match mode {
            WriteMode::Create => !exists,
            WriteMode::Update => exists,
        }
    }

    fn apply_step(&mut self, step: &TxStep) -> Result<(), StoreError> {
        match step {
            TxStep::AddTriple {
                entity,
                attr_id,
                value,
                ..
            } => self.add_triple(entity, attr_id, value),
            TxStep::DeepMergeTriple {
                entity,
                attr_id,
                value,
                ..
            } => self.merge_triple(entity, attr_id, value)?,
            TxStep::RetractTriple {
                entity,
                attr_id,
                value,
            } => self.retract_triple(entity, attr_id, value),
            TxStep::DeleteEntity { entity, etype } => match self.resolve_entity(entity) {
                Some(id) => self.delete_entity(&id, etype.as_deref(), &mut HashSet::new()),
                None => debug!(?entity, "delete-entity lookup did not resolve"),
            },
            TxStep::AddAttr(attr) => Arc::make_mut(&mut self.attrs).add(attr.clone()),
            TxStep::UpdateAttr(patch) => {
                if self.attrs.contains(&patch.id) {
                    Arc::make_mut(&mut self.attrs).update(patch);
                    let triples = self.all_triples();
                    self.reindex(triples);
                }
            }
            TxStep::DeleteAttr(attr_id) => {
                if self.attrs.contains(attr_id) {
                    let triples: Vec<Triple> = self
                        .eav
                        .triples()
                        .filter(|t| t.attr_id != *attr_id)
                        .cloned()
                        .collect();
                    Arc::make_mut(&mut self.attrs).remove(attr_id);
                    self.reindex(triples);
                }
            }
        }
        Ok(())
    }

    fn add_triple(&mut self, entity: &EntityRef, attr_id: &str, value: &Value) {
        let Some((eid, attr, value)) = self.resolve(entity, attr_id, value) else {
            return;
        };
        let key = ValueKey::of(&value);
        let existing = if attr.has_single_value() {
            self.eav.leaf(&eid, attr_id).and_then(|leaf| leaf.values().next())
        } else {
            self.eav.get(&eid, attr_id, &key)
        };
        let created_at = existing
            .map(|t| t.created_at)
            .unwrap_or_else(|| self.clock.next());

        if attr.has_single_value() {
            self.remove_leaf(&eid, attr_id);
        }
        self.index_triple(Triple::new(eid, attr_id, value, created_at), attr.is_ref());
    }

    fn merge_triple(
        &mut self,
        entity: &EntityRef,
        attr_id: &str,
        update: &Value,
    ) -> Result<(), StoreError> {
        let Some((eid, attr, update)) = self.resolve(entity, attr_id, update) else {
            return Ok(());
        };
        if !attr.is_blob() {
            return Err(StoreError::MergeOnRef {
                attr_id: attr_id.to_string(),
            });
        }
        let Some(current) = self
            .eav
            .leaf(&eid, attr_id)
            .and_then(|leaf| leaf.values().next())
            .cloned()
        else {
            return Ok(());
        };
        let merged = deep_merge(&current.value, &update);
        self.unindex_triple(&current);
        self.index_triple(
            Triple::new(eid, attr_id, merged, current.created_at),
            false,
        );
        Ok(())
    }

    fn retract_triple(&mut self, entity: &EntityRef, attr_id: &str, value: &Value) {
        let Some((eid, _, value)) = self.resolve(entity, attr_id, value) else {
            return;
        };
        if let Some(triple) = self.eav.get(&eid, attr_id, &ValueKey::of(&value)).cloned() {
            self.unindex_triple(&triple);
        }
    }

    /// Remove `id`'s attributes and the links pointing at it.
    ///
    /// With `etype`, only forward attributes of that type and reverse links
    /// whose reverse identity names that type are removed.
    fn delete_entity(&mut self, id: &str, etype: Option<&str>, visited: &mut HashSet<String>) {
        if !visited.insert(id.to_string()) {
            return;
        }

        let forward: Vec<(AttrId, Vec<Triple>)> = self
            .eav
            .level(id)
            .map(|mid| {
                mid.iter()
                    .map(|(a, leaf)| (a.clone(), leaf.values().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default();
        for (attr_id, triples) in forward {
            let attr = self.attrs.get(&attr_id).cloned();
            if let Some(attr) = attr.as_ref().filter(|a| a.on_delete_reverse == Some(OnDelete::Cascade)) {
                for triple in &triples {
                    if let Some(target) = triple.value.as_str() {
                        self.delete_entity(target, attr.reverse_etype(), visited);
                    }
                }
            }
            let matches = match (etype, &attr) {
                (Some(etype), Some(attr)) => attr.forward_etype() == etype,
                _ => true,
            };
            if matches {
                for triple in &triples {
                    self.unindex_triple(triple);
                }
            }
        }

        let reverse: Vec<Triple> = self.vae.triples_under(id).cloned().collect();
        for triple in reverse {
            let attr = self.attrs.get(&triple.attr_id).cloned();
            let matches = match (etype, &attr) {
                (Some(etype), Some(attr)) => attr.reverse_etype() == Some(etype),
                _ => true,
            };
            if matches {
                self.unindex_triple(&triple);
            }
            if let Some(attr) = attr {
                if attr.on_delete == Some(OnDelete::Cascade) && attr.reverse_etype() == etype {
                    self.delete_entity(&triple.entity, Some(attr.forward_etype()), visited);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookup Resolution
    // ------------------------------------------------------------------------

    /// Entity holding `value` under the unique attribute `attr_id`.
    pub fn resolve_lookup(&self, attr_id: &str, value: &Value) -> Option<EntityId> {
        let key = ValueKey::of(value);
        self.entities_with_attr(attr_id)
            .find(|(_, leaf)| leaf.contains_key(&key))
            .map(|(e, _)| e.clone())
    }

    pub fn resolve_entity(&self, entity: &EntityRef) -> Option<EntityId> {
        match entity {
            EntityRef::Id(id) => Some(id.clone()),
            EntityRef::Lookup { attr_id, value } => self.resolve_lookup(attr_id, value),
        }
    }

    /// Resolve both positions of a triple-level step and find its attribute.
    fn resolve(&self, entity: &EntityRef, attr_id: &str, value: &Value) -> Option<(EntityId, Attr, Value)> {
        let Some(eid) = self.resolve_entity(entity) else {
            debug!(?entity, attr_id, "entity lookup did not resolve, dropping step");
            return None;
        };
        let Some(attr) = self.attrs.get(attr_id) else {
            debug!(attr_id, "unknown attribute, dropping step");
            return None;
        };
        let value = match triple::value_as_lookup(value) {
            Some((lookup_attr, lookup_value)) if self.aev.contains_top(lookup_attr) => {
                match self.resolve_lookup(lookup_attr, lookup_value) {
                    Some(target) => Value::String(target),
                    None => {
                        debug!(attr_id, "value lookup did not resolve, dropping step");
                        return None;
                    }
                }
            }
            _ => value.clone(),
        };
        Some((eid, attr.clone(), value))
    }

    // ------------------------------------------------------------------------
    // Index Maintenance
    // ------------------------------------------------------------------------

    fn index_triple(&mut self, triple: Triple, is_ref: bool) {
        let key = ValueKey::of(&triple.value);
        if is_ref {
            if let Some(target) = triple.value.as_str() {
                self.vae
                    .insert(target, &triple.attr_id, triple.entity.clone(), triple.clone());
            }
        }
        self.aev
            .insert(&triple.attr_id, &triple.entity, key.clone(), triple.clone());
        let (entity, attr_id) = (triple.entity.clone(), triple.attr_id.clone());
        self.eav.insert(&entity, &attr_id, key, triple);
    }

    fn unindex_triple(&mut self, triple: &Triple) {
        let key = ValueKey::of(&triple.value);
        self.eav.remove(&triple.entity, &triple.attr_id, &key);
        self.aev.remove(&triple.attr_id, &triple.entity, &key);
        if let Some(target) = triple.value.as_str() {
            self.vae.remove(target, &triple.attr_id, &triple.entity);
        }
    }

    fn remove_leaf(&mut self, entity: &str, attr_id: &str) {
        if let Some(leaf) = self.eav.remove_leaf(entity, attr_id) {
            for triple in leaf.values() {
                self.unindex_triple(triple);
            }
        }
    }

    /// Rebuild all three indexes from `triples` under the current schema.
    fn reindex(&mut self, triples: impl IntoIterator<Item = Triple>) {
        self.eav = TripleIndex::default();
        self.aev = TripleIndex::default();
        self.vae = TripleIndex::default();
        for triple in triples {
            let Some(is_ref) = self.attrs.get(&triple.attr_id).map(Attr::is_ref) else {
                warn!(attr_id = %triple.attr_id, entity = %triple.entity, "no such attr, skipping triple");
                continue;
            };
            self.index_triple(triple, is_ref);
        }
    }
}

/// Functional form of [`Store::transact`].
pub fn transact(store: &Store, steps: &[TxStep]) -> Result<Store, StoreError> {
    store.transact(steps)
}

#[cfg(test)]
mod tests;
