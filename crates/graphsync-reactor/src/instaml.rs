//! Lowering high-level edits into tx-steps.
//!
//! ```text
//!   [EditOp]                      (update users/u1 {name: ..}, link ..)
//!      │
//!      ├─► bootstrap attrs  ──►  add-attr steps for every missing label,
//!      │                         lookups first so they come out unique
//!      └─► lower each op    ──►  add-triple / deep-merge-triple /
//!                                retract-triple / delete-entity
//! ```
//!
//! Attributes invented here carry `isUnsynced` until the server confirms
//! them; [`rewrite_step`] later maps their ids onto the server's.

use crate::error::TransformError;
use graphsync_store::{
    Attr, AttrsStore, Cardinality, EntityRef, Ident, Store, TripleOpts, TxStep, WriteMode,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

// ============================================================================
// Edit Ops
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Create,
    Update,
    Merge,
    Link,
    Unlink,
    Delete,
}

impl EditAction {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "create" => EditAction::Create,
            "update" => EditAction::Update,
            "merge" => EditAction::Merge,
            "link" => EditAction::Link,
            "unlink" => EditAction::Unlink,
            "delete" => EditAction::Delete,
            _ => return None,
        })
    }

    fn writes_fields(self) -> bool {
        matches!(self, EditAction::Create | EditAction::Update | EditAction::Merge)
    }

    fn writes_links(self) -> bool {
        matches!(self, EditAction::Link | EditAction::Unlink)
    }
}

/// An entity named by id or by a unique attribute's value.
#[derive(Debug, Clone, PartialEq)]
pub enum EditEntity {
    Id(String),
    Lookup { label: String, value: Value },
}

const LOOKUP_PREFIX: &str = "lookup__";

impl EditEntity {
    pub fn id(id: impl Into<String>) -> Self {
        EditEntity::Id(id.into())
    }

    pub fn lookup(label: impl Into<String>, value: Value) -> Self {
        EditEntity::Lookup {
            label: label.into(),
            value,
        }
    }

    /// Accepts an id, a `lookup__label__<json>` string, a single-key object
    /// or a `[label, value]` pair.
    pub fn from_json(raw: &Value) -> Result<Self, TransformError> {
        match raw {
            Value::String(s) if s.starts_with(LOOKUP_PREFIX) => parse_lookup_string(s),
            Value::String(s) => Ok(EditEntity::Id(s.clone())),
            Value::Object(obj) if obj.len() == 1 => {
                let (label, value) = obj
                    .iter()
                    .next()
                    .ok_or_else(|| TransformError::InvalidLookup(raw.to_string()))?;
                Ok(EditEntity::lookup(label.clone(), value.clone()))
            }
            Value::Array(parts) if parts.len() == 2 => match parts[0].as_str() {
                Some(label) => Ok(EditEntity::lookup(label, parts[1].clone())),
                None => Err(TransformError::InvalidLookup(raw.to_string())),
            },
            _ => Err(TransformError::InvalidLookup(raw.to_string())),
        }
    }

    fn as_lookup(&self) -> Option<(&str, &Value)> {
        match self {
            EditEntity::Lookup { label, value } => Some((label, value)),
            EditEntity::Id(_) => None,
        }
    }
}

fn parse_lookup_string(s: &str) -> Result<EditEntity, TransformError> {
    let mut parts = s.splitn(3, "__");
    let (_, label, json) = (parts.next(), parts.next(), parts.next());
    let (Some(label), Some(json)) = (label, json) else {
        return Err(TransformError::InvalidLookup(s.to_string()));
    };
    let value = serde_json::from_str(json)
        .map_err(|_| TransformError::InvalidLookup(s.to_string()))?;
    Ok(EditEntity::lookup(label, value))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditOpts {
    /// `Some(false)`: only update existing entities. `Some(true)`: always
    /// upsert. Unset: decided by whether the entity is already known.
    pub upsert: Option<bool>,
}

/// One high-level edit: `[action, etype, entity, payload?, opts?]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EditOp {
    pub action: EditAction,
    pub etype: String,
    pub entity: EditEntity,
    pub payload: Map<String, Value>,
    pub opts: EditOpts,
}

impl EditOp {
    pub fn new(action: EditAction, etype: impl Into<String>, entity: EditEntity) -> Self {
        Self {
            action,
            etype: etype.into(),
            entity,
            payload: Map::new(),
            opts: EditOpts::default(),
        }
    }

    pub fn create(etype: impl Into<String>, entity: EditEntity, payload: Value) -> Self {
        Self::new(EditAction::Create, etype, entity).with_payload(payload)
    }

    pub fn update(etype: impl Into<String>, entity: EditEntity, payload: Value) -> Self {
        Self::new(EditAction::Update, etype, entity).with_payload(payload)
    }

    pub fn merge(etype: impl Into<String>, entity: EditEntity, payload: Value) -> Self {
        Self::new(EditAction::Merge, etype, entity).with_payload(payload)
    }

    pub fn link(etype: impl Into<String>, entity: EditEntity, payload: Value) -> Self {
        Self::new(EditAction::Link, etype, entity).with_payload(payload)
    }

    pub fn unlink(etype: impl Into<String>, entity: EditEntity, payload: Value) -> Self {
        Self::new(EditAction::Unlink, etype, entity).with_payload(payload)
    }

    pub fn delete(etype: impl Into<String>, entity: EditEntity) -> Self {
        Self::new(EditAction::Delete, etype, entity)
    }

    /// Non-object payloads are ignored.
    pub fn with_payload(mut self, payload: Value) -> Self {
        if let Value::Object(obj) = payload {
            self.payload = obj;
        }
        self
    }

    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.opts.upsert = Some(upsert);
        self
    }

    pub fn from_json(raw: &Value) -> Result<Self, TransformError> {
        let parts = raw
            .as_array()
            .ok_or_else(|| TransformError::InvalidOp(format!("expected array, got {raw}")))?;
        let action = parts
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| TransformError::InvalidOp("missing action".to_string()))?;
        let action = EditAction::parse(action)
            .ok_or_else(|| TransformError::InvalidOp(format!("unsupported action {action}")))?;
        let etype = parts
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| TransformError::InvalidOp("missing entity type".to_string()))?;
        let entity = EditEntity::from_json(
            parts
                .get(2)
                .ok_or_else(|| TransformError::InvalidOp("missing entity".to_string()))?,
        )?;
        let mut op = EditOp::new(action, etype, entity)
            .with_payload(parts.get(3).cloned().unwrap_or(Value::Null));
        if let Some(upsert) = parts.get(4).and_then(|o| o.get("upsert")).and_then(Value::as_bool) {
            op.opts.upsert = Some(upsert);
        }
        Ok(op)
    }

    /// Link targets of one payload entry; a list means several targets.
    fn link_targets(value: &Value) -> Vec<&Value> {
        match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    /// Every lookup this op mentions: `(etype, label, link label)`.
    fn lookups(&self) -> Result<Vec<(&str, String, Option<&str>)>, TransformError> {
        let mut out = Vec::new();
        if let Some((label, _)) = self.entity.as_lookup() {
            out.push((self.etype.as_str(), label.to_string(), None));
        }
        if self.action == EditAction::Link {
            for (link_label, targets) in &self.payload {
                for target in Self::link_targets(targets) {
                    if let EditEntity::Lookup { label, .. } = EditEntity::from_json(target)? {
                        out.push((self.etype.as_str(), label, Some(link_label.as_str())));
                    }
                }
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Attribute Bootstrap
// ============================================================================

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn object_attr(etype: &str, label: &str) -> Attr {
    let mut attr = Attr::blob(new_id(), Ident::new(new_id(), etype, label));
    attr.is_unsynced = true;
    attr
}

fn lookup_attr(etype: &str, label: &str) -> Attr {
    let mut attr = object_attr(etype, label);
    attr.unique = true;
    attr.indexed = true;
    attr
}

fn ref_attr(etype: &str, label: &str) -> Attr {
    let mut attr = Attr::link(
        new_id(),
        Ident::new(new_id(), etype, label),
        Ident::new(new_id(), label, etype),
    );
    attr.is_unsynced = true;
    attr
}

fn ref_lookup_attr(etype: &str, label: &str) -> Attr {
    let mut attr = ref_attr(etype, label);
    attr.unique = true;
    attr.indexed = true;
    attr.cardinality = Cardinality::One;
    attr
}

/// `label.id` names a lookup through a link, unless an attribute is
/// literally called `label.id`.
fn is_ref_lookup_ident(attrs: &AttrsStore, etype: &str, ident: &str) -> bool {
    ident.contains('.') && attrs.by_forward_label(etype, ident).is_none()
}

fn ref_lookup_fwd_name(ident: &str) -> Result<&str, TransformError> {
    let mut parts = ident.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(fwd), Some("id"), None) => Ok(fwd),
        _ => Err(TransformError::InvalidRefLookup(ident.to_string())),
    }
}

/// Working copy of the schema plus the `add-attr` steps it took to get there.
struct Bootstrap {
    attrs: AttrsStore,
    added: HashSet<String>,
    steps: Vec<TxStep>,
}

impl Bootstrap {
    fn new(attrs: &AttrsStore) -> Self {
        Self {
            attrs: attrs.clone(),
            added: HashSet::new(),
            steps: Vec::new(),
        }
    }

    fn fwd(&self, etype: &str, label: &str) -> Option<Attr> {
        self.attrs.by_forward_label(etype, label).cloned()
    }

    fn rev(&self, etype: &str, label: &str) -> Option<Attr> {
        self.attrs.by_reverse_label(etype, label).cloned()
    }

    fn add(&mut self, attr: Attr) {
        self.added.insert(attr.id.clone());
        self.steps.push(TxStep::AddAttr(attr.clone()));
        self.attrs.add(attr);
    }

    /// Re-announce an attribute the server has not confirmed yet.
    fn add_unsynced(&mut self, attr: Option<&Attr>) {
        if let Some(attr) = attr.filter(|a| a.is_unsynced && !self.added.contains(&a.id)) {
            self.added.insert(attr.id.clone());
            self.steps.push(TxStep::AddAttr(attr.clone()));
        }
    }

    fn ensure_ref(&mut self, etype: &str, label: &str) {
        let fwd = self.fwd(etype, label);
        let rev = self.rev(etype, label);
        self.add_unsynced(fwd.as_ref());
        self.add_unsynced(rev.as_ref());
        if fwd.is_none() && rev.is_none() {
            self.add(ref_lookup_attr(etype, label));
        }
    }

    fn ensure_lookup(&mut self, etype: &str, ident: &str) -> Result<(), TransformError> {
        if is_ref_lookup_ident(&self.attrs, etype, ident) {
            let fwd_name = ref_lookup_fwd_name(ident)?;
            self.ensure_ref(etype, fwd_name);
            return Ok(());
        }
        match self.fwd(etype, ident) {
            Some(existing) => self.add_unsynced(Some(&existing)),
            None => self.add(lookup_attr(etype, ident)),
        }
        Ok(())
    }

    /// Lookup attributes go first so they are created unique.
    fn lookups_pass(&mut self, ops: &[EditOp]) -> Result<(), TransformError> {
        for op in ops {
            for (etype, ident, link_label) in op.lookups()? {
                let Some(link_label) = link_label else {
                    self.ensure_lookup(etype, &ident)?;
                    continue;
                };
                self.ensure_ref(etype, link_label);
                let fwd = self.fwd(etype, link_label);
                let rev = self.rev(etype, link_label);
                self.add_unsynced(fwd.as_ref());
                self.add_unsynced(rev.as_ref());
                let link_etype = fwd
                    .as_ref()
                    .and_then(|a| a.reverse_etype().map(str::to_string))
                    .or_else(|| rev.as_ref().map(|a| a.forward_etype().to_string()))
                    .unwrap_or_else(|| link_label.to_string());
                self.ensure_lookup(&link_etype, &ident)?;
            }
        }
        Ok(())
    }

    fn fields_pass(&mut self, ops: &[EditOp]) {
        for op in ops {
            if !(op.action.writes_fields() || op.action.writes_links()) {
                continue;
            }
            let etype = op.etype.as_str();
            match self.fwd(etype, "id") {
                Some(id_attr) => self.add_unsynced(Some(&id_attr)),
                None => {
                    let mut id_attr = object_attr(etype, "id");
                    id_attr.unique = true;
                    self.add(id_attr);
                }
            }

            for label in op.payload.keys() {
                let fwd = self.fwd(etype, label);
                self.add_unsynced(fwd.as_ref());
                if op.action.writes_fields() && fwd.is_none() {
                    let mut attr = object_attr(etype, label);
                    attr.unique = label == "id";
                    self.add(attr);
                }
                if op.action.writes_links() {
                    let rev = self.rev(etype, label);
                    if fwd.is_none() && rev.is_none() {
                        self.add(ref_attr(etype, label));
                    }
                    self.add_unsynced(rev.as_ref());
                }
            }
        }
    }
}

// ============================================================================
// Lowering
// ============================================================================

/// What the transform may consult besides the schema.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub attrs: &'a AttrsStore,
    /// Stores used to decide whether an entity already exists.
    pub stores: &'a [Store],
}

impl<'a> TransformContext<'a> {
    pub fn new(attrs: &'a AttrsStore) -> Self {
        Self { attrs, stores: &[] }
    }

    pub fn with_stores(mut self, stores: &'a [Store]) -> Self {
        self.stores = stores;
        self
    }
}

struct Lowering<'a> {
    attrs: &'a AttrsStore,
    stores: &'a [Store],
}

impl<'a> Lowering<'a> {
    fn lookup_ident_to_attr(&self, etype: &str, ident: &str) -> Result<Option<&'a Attr>, TransformError> {
        if !is_ref_lookup_ident(self.attrs, etype, ident) {
            return Ok(self.attrs.by_forward_label(etype, ident));
        }
        let fwd_name = ref_lookup_fwd_name(ident)?;
        let attr = self
            .attrs
            .by_forward_label(etype, fwd_name)
            .or_else(|| self.attrs.by_reverse_label(etype, fwd_name));
        match attr {
            Some(attr) if !attr.is_ref() => Err(TransformError::NotALink(ident.to_string())),
            other => Ok(other),
        }
    }

    fn extract_lookup(&self, etype: &str, entity: &EditEntity) -> Result<EntityRef, TransformError> {
        match entity {
            EditEntity::Id(id) => Ok(EntityRef::id(id.clone())),
            EditEntity::Lookup { label, value } => {
                match self.lookup_ident_to_attr(etype, label)? {
                    Some(attr) if attr.unique => Ok(EntityRef::lookup(attr.id.clone(), value.clone())),
                    _ => Err(TransformError::NotUnique(label.clone())),
                }
            }
        }
    }

    fn field_attr(&self, etype: &str, label: &str) -> Result<&'a Attr, TransformError> {
        self.attrs
            .by_forward_label(etype, label)
            .ok_or_else(|| TransformError::InvalidOp(format!("no attribute for {etype}.{label}")))
    }

    fn entity_exists(&self, etype: &str, entity: &EntityRef) -> bool {
        self.stores.iter().any(|store| match entity {
            EntityRef::Lookup { attr_id, value } => store.resolve_lookup(attr_id, value).is_some(),
            EntityRef::Id(id) => store.attr_ids_of(id).into_iter().any(|attr_id| {
                self.attrs
                    .get(attr_id)
                    .is_some_and(|a| a.forward_etype() == etype)
            }),
        })
    }

    fn upsert_opts(&self, op: &EditOp, entity: &EntityRef) -> Option<TripleOpts> {
        match op.opts.upsert {
            Some(false) => Some(TripleOpts::mode(WriteMode::Update)),
            Some(true) => None,
            None if self.entity_exists(&op.etype, entity) => Some(TripleOpts::mode(WriteMode::Update)),
            None => None,
        }
    }

    fn fields(op: &EditOp) -> impl Iterator<Item = (&String, &Value)> {
        op.payload.iter().filter(|(label, _)| label.as_str() != "id")
    }

    fn lower(&self, op: &EditOp) -> Result<Vec<TxStep>, TransformError> {
        match op.action {
            EditAction::Create => self.lower_write(op, Some(TripleOpts::mode(WriteMode::Create))),
            EditAction::Update => {
                let entity = self.extract_lookup(&op.etype, &op.entity)?;
                self.lower_write(op, self.upsert_opts(op, &entity))
            }
            EditAction::Merge => self.lower_merge(op),
            EditAction::Link | EditAction::Unlink => self.lower_links(op),
            EditAction::Delete => Ok(vec![TxStep::DeleteEntity {
                entity: self.extract_lookup(&op.etype, &op.entity)?,
                etype: Some(op.etype.clone()),
            }]),
        }
    }

    /// The id triple is written first so field writes cannot clobber the
    /// lookup value it was addressed by.
    fn lower_write(&self, op: &EditOp, opts: Option<TripleOpts>) -> Result<Vec<TxStep>, TransformError> {
        let entity = self.extract_lookup(&op.etype, &op.entity)?;
        let id_value = entity.to_json();
        std::iter::once(("id", &id_value))
            .chain(Self::fields(op).map(|(k, v)| (k.as_str(), v)))
            .map(|(label, value)| {
                Ok(TxStep::AddTriple {
                    entity: entity.clone(),
                    attr_id: self.field_attr(&op.etype, label)?.id.clone(),
                    value: value.clone(),
                    opts,
                })
            })
            .collect()
    }

    fn lower_merge(&self, op: &EditOp) -> Result<Vec<TxStep>, TransformError> {
        let entity = self.extract_lookup(&op.etype, &op.entity)?;
        let opts = self.upsert_opts(op, &entity);
        let mut steps = vec![TxStep::AddTriple {
            entity: entity.clone(),
            attr_id: self.field_attr(&op.etype, "id")?.id.clone(),
            value: entity.to_json(),
            opts,
        }];
        for (label, value) in Self::fields(op) {
            steps.push(TxStep::DeepMergeTriple {
                entity: entity.clone(),
                attr_id: self.field_attr(&op.etype, label)?.id.clone(),
                value: value.clone(),
                opts,
            });
        }
        Ok(steps)
    }

    fn lower_links(&self, op: &EditOp) -> Result<Vec<TxStep>, TransformError> {
        let etype = op.etype.as_str();
        let mut steps = Vec::new();
        for (label, targets) in Self::fields(op) {
            let fwd = self.attrs.by_forward_label(etype, label);
            let rev = self.attrs.by_reverse_label(etype, label);
            for target in EditOp::link_targets(targets) {
                let target = EditEntity::from_json(target)?;
                let (entity, attr_id, value) = match (fwd, rev) {
                    (Some(fwd), _) => {
                        let target_etype = fwd
                            .reverse_etype()
                            .ok_or_else(|| TransformError::NotALink(format!("{etype}.{label}")))?;
                        (
                            self.extract_lookup(etype, &op.entity)?,
                            fwd.id.clone(),
                            self.extract_lookup(target_etype, &target)?.to_json(),
                        )
                    }
                    (None, Some(rev)) => (
                        self.extract_lookup(rev.forward_etype(), &target)?,
                        rev.id.clone(),
                        self.extract_lookup(etype, &op.entity)?.to_json(),
                    ),
                    (None, None) => {
                        return Err(TransformError::InvalidOp(format!(
                            "no link attribute for {etype}.{label}"
                        )))
                    }
                };
                steps.push(match op.action {
                    EditAction::Unlink => TxStep::retract_triple(entity, attr_id, value),
                    _ => TxStep::add_triple(entity, attr_id, value),
                });
            }
        }
        self.with_id_for_lookup(op, steps)
    }

    fn with_id_for_lookup(&self, op: &EditOp, steps: Vec<TxStep>) -> Result<Vec<TxStep>, TransformError> {
        let entity = self.extract_lookup(&op.etype, &op.entity)?;
        if entity.as_lookup().is_none() {
            return Ok(steps);
        }
        let Some(id_attr) = self.attrs.by_forward_label(&op.etype, "id") else {
            return Ok(steps);
        };
        let mut out = Vec::with_capacity(steps.len() + 1);
        out.push(TxStep::add_triple(entity.clone(), id_attr.id.clone(), entity.to_json()));
        out.extend(steps);
        Ok(out)
    }
}

/// Lower `ops` against `ctx.attrs`, inventing attributes that do not exist.
///
/// Output: the `add-attr` steps, then each op's steps in order.
pub fn transform(ctx: TransformContext<'_>, ops: &[EditOp]) -> Result<Vec<TxStep>, TransformError> {
    let mut bootstrap = Bootstrap::new(ctx.attrs);
    bootstrap.lookups_pass(ops)?;
    bootstrap.fields_pass(ops);

    let Bootstrap { attrs, mut steps, .. } = bootstrap;
    let lowering = Lowering {
        attrs: &attrs,
        stores: ctx.stores,
    };
    for op in ops {
        steps.extend(lowering.lower(op)?);
    }
    Ok(steps)
}

// ============================================================================
// Attribute Rewrites
// ============================================================================

/// Translation from client-invented attribute ids to the server's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrMapping {
    pub attr_id_map: HashMap<String, String>,
    /// Local link attrs that matched a server attr in the other direction.
    pub ref_swap_attr_ids: HashSet<String>,
}

impl AttrMapping {
    pub fn is_empty(&self) -> bool {
        self.attr_id_map.is_empty() && self.ref_swap_attr_ids.is_empty()
    }

    fn map_id(&self, id: &mut String) {
        if let Some(canonical) = self.attr_id_map.get(id.as_str()) {
            *id = canonical.clone();
        }
    }

    fn map_entity(&self, entity: &mut EntityRef) {
        if let EntityRef::Lookup { attr_id, .. } = entity {
            self.map_id(attr_id);
        }
    }

    fn map_value(&self, value: &mut Value) {
        if let Value::Array(parts) = value {
            if parts.len() == 2 {
                if let Some(canonical) = parts[0].as_str().and_then(|a| self.attr_id_map.get(a)) {
                    parts[0] = Value::String(canonical.clone());
                }
            }
        }
    }
}

/// Apply `mapping` to every attribute-id operand of `step`, swapping the
/// link direction of triples whose attribute matched in reverse.
pub fn rewrite_step(mapping: &AttrMapping, step: &TxStep) -> TxStep {
    let mut out = step.clone();
    let swap = matches!(step, TxStep::AddTriple { .. } | TxStep::RetractTriple { .. })
        && step
            .attr_id()
            .is_some_and(|a| mapping.ref_swap_attr_ids.contains(a));

    match &mut out {
        TxStep::AddTriple {
            entity,
            attr_id,
            value,
            ..
        }
        | TxStep::DeepMergeTriple {
            entity,
            attr_id,
            value,
            ..
        }
        | TxStep::RetractTriple {
            entity,
            attr_id,
            value,
        } => {
            mapping.map_entity(entity);
            mapping.map_id(attr_id);
            mapping.map_value(value);
            if swap {
                match EntityRef::from_json(value) {
                    Some(target) => {
                        let source = std::mem::replace(entity, target);
                        *value = source.to_json();
                    }
                    None => warn!(attr_id = %attr_id, "cannot swap a non-entity link value"),
                }
            }
        }
        TxStep::DeleteEntity { entity, .. } => mapping.map_entity(entity),
        TxStep::UpdateAttr(patch) => mapping.map_id(&mut patch.id),
        TxStep::DeleteAttr(id) => mapping.map_id(id),
        TxStep::AddAttr(_) => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_store::{Triple, TriplePattern};
    use serde_json::json;

    fn user_attrs() -> AttrsStore {
        let mut email = Attr::blob("a-email", Ident::new("i-email", "users", "email"));
        email.unique = true;
        email.indexed = true;
        AttrsStore::new([
            Attr::blob("a-id", Ident::new("i-id", "users", "id")),
            Attr::blob("a-name", Ident::new("i-name", "users", "name")),
            email,
            Attr::blob("p-id", Ident::new("i-pid", "posts", "id")),
            Attr::link(
                "a-posts",
                Ident::new("i-posts", "users", "posts"),
                Ident::new("i-author", "posts", "author"),
            ),
        ])
    }

    fn add_attrs(steps: &[TxStep]) -> Vec<&Attr> {
        steps
            .iter()
            .filter_map(|s| match s {
                TxStep::AddAttr(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_update_with_known_attrs() {
        let attrs = user_attrs();
        let ops = [EditOp::update("users", EditEntity::id("u1"), json!({"name": "Alice"}))];
        let steps = transform(TransformContext::new(&attrs), &ops).unwrap();
        assert_eq!(
            steps,
            vec![
                TxStep::add_triple(EntityRef::id("u1"), "a-id", json!("u1")),
                TxStep::add_triple(EntityRef::id("u1"), "a-name", json!("Alice")),
            ]
        );
    }

    #[test]
    fn test_update_invents_missing_attrs() {
        let attrs = AttrsStore::default();
        let ops = [EditOp::update("todos", EditEntity::id("t1"), json!({"title": "x", "done": false}))];
        let steps = transform(TransformContext::new(&attrs), &ops).unwrap();
        let added = add_attrs(&steps);
        assert_eq!(added.len(), 3);
        assert!(added.iter().all(|a| a.is_unsynced && a.is_blob()));
        let id_attr = added.iter().find(|a| a.forward_identity.label() == "id").unwrap();
        assert!(id_attr.unique);
        // add-attr steps come first
        assert!(steps[..3].iter().all(TxStep::is_schema_step));
        assert_eq!(steps.len(), 6);
    }

    #[test]
    fn test_create_marks_every_step() {
        let attrs = user_attrs();
        let ops = [EditOp::create("users", EditEntity::id("u1"), json!({"name": "A"}))];
        let steps = transform(TransformContext::new(&attrs), &ops).unwrap();
        assert!(steps.iter().all(|s| matches!(
            s,
            TxStep::AddTriple { opts: Some(TripleOpts { mode: Some(WriteMode::Create) }), .. }
        )));
    }

    #[test]
    fn test_upsert_modes() {
        let attrs = user_attrs();
        let store = Store::new(
            attrs.clone(),
            [Triple::new("u1", "a-id", json!("u1"), 1)],
            false,
            None,
        );
        let stores = [store];
        let ctx = TransformContext::new(&attrs).with_stores(&stores);

        let existing = transform(ctx, &[EditOp::update("users", EditEntity::id("u1"), json!({"name": "B"}))]).unwrap();
        assert!(matches!(existing[0], TxStep::AddTriple { opts: Some(_), .. }));

        let fresh = transform(ctx, &[EditOp::update("users", EditEntity::id("u2"), json!({"name": "B"}))]).unwrap();
        assert!(matches!(fresh[0], TxStep::AddTriple { opts: None, .. }));

        let forced = transform(
            ctx,
            &[EditOp::update("users", EditEntity::id("u2"), json!({})).with_upsert(false)],
        )
        .unwrap();
        assert!(matches!(
            forced[0],
            TxStep::AddTriple { opts: Some(TripleOpts { mode: Some(WriteMode::Update) }), .. }
        ));
    }

    #[test]
    fn test_update_by_lookup() {
        let attrs = user_attrs();
        let op = EditOp::update("users", EditEntity::lookup("email", json!("a@b.c")), json!({"name": "A"}));
        let steps = transform(TransformContext::new(&attrs), &[op]).unwrap();
        let lookup = EntityRef::lookup("a-email", json!("a@b.c"));
        assert_eq!(steps[0], TxStep::add_triple(lookup.clone(), "a-id", lookup.to_json()));
        assert_eq!(steps[1], TxStep::add_triple(lookup, "a-name", json!("A")));
    }

    #[test]
    fn test_lookup_on_new_label_creates_unique_attr() {
        let attrs = user_attrs();
        let op = EditOp::update("users", EditEntity::from_json(&json!("lookup__handle__\"al\"")).unwrap(), json!({}));
        let steps = transform(TransformContext::new(&attrs), &[op]).unwrap();
        let handle = add_attrs(&steps)
            .into_iter()
            .find(|a| a.forward_identity.label() == "handle")
            .cloned()
            .unwrap();
        assert!(handle.unique && handle.indexed && handle.is_unsynced);
        assert_eq!(
            steps.last().unwrap(),
            &TxStep::add_triple(
                EntityRef::lookup(handle.id.clone(), json!("al")),
                "a-id",
                json!([handle.id, "al"])
            )
        );
    }

    #[test]
    fn test_lookup_on_non_unique_attr_fails() {
        let attrs = user_attrs();
        let op = EditOp::update("users", EditEntity::lookup("name", json!("A")), json!({}));
        let err = transform(TransformContext::new(&attrs), &[op]).unwrap_err();
        assert!(matches!(err, TransformError::NotUnique(label) if label == "name"));
    }

    #[test]
    fn test_multi_key_lookup_is_rejected() {
        let err = EditEntity::from_json(&json!({"a": 1, "b": 2})).unwrap_err();
        assert!(matches!(err, TransformError::InvalidLookup(_)));
    }

    #[test]
    fn test_bad_ref_lookup_name() {
        let attrs = user_attrs();
        let op = EditOp::update("users", EditEntity::lookup("posts.title", json!("x")), json!({}));
        let err = transform(TransformContext::new(&attrs), &[op]).unwrap_err();
        assert!(matches!(err, TransformError::InvalidRefLookup(_)));
    }

    #[test]
    fn test_link_forward_and_reverse() {
        let attrs = user_attrs();
        let fwd = transform(
            TransformContext::new(&attrs),
            &[EditOp::link("users", EditEntity::id("u1"), json!({"posts": ["p1", "p2"]}))],
        )
        .unwrap();
        assert_eq!(
            fwd,
            vec![
                TxStep::add_triple(EntityRef::id("u1"), "a-posts", json!("p1")),
                TxStep::add_triple(EntityRef::id("u1"), "a-posts", json!("p2")),
            ]
        );

        let rev = transform(
            TransformContext::new(&attrs),
            &[EditOp::unlink("posts", EditEntity::id("p1"), json!({"author": "u1"}))],
        )
        .unwrap();
        assert_eq!(
            rev,
            vec![TxStep::retract_triple(EntityRef::id("u1"), "a-posts", json!("p1"))]
        );
    }

    #[test]
    fn test_link_invents_ref_attr() {
        let attrs = user_attrs();
        let steps = transform(
            TransformContext::new(&attrs),
            &[EditOp::link("users", EditEntity::id("u1"), json!({"pets": "d1"}))],
        )
        .unwrap();
        let pets = add_attrs(&steps)[0].clone();
        assert!(pets.is_ref());
        assert_eq!(pets.cardinality, Cardinality::Many);
        assert_eq!(pets.reverse_identity.as_ref().unwrap().etype(), "pets");
        assert_eq!(
            steps.last().unwrap(),
            &TxStep::add_triple(EntityRef::id("u1"), pets.id.clone(), json!("d1"))
        );
    }

    #[test]
    fn test_link_to_lookup_target() {
        let attrs = user_attrs();
        let steps = transform(
            TransformContext::new(&attrs),
            &[EditOp::link("posts", EditEntity::id("p1"), json!({"author": {"email": "a@b.c"}}))],
        )
        .unwrap();
        assert_eq!(
            steps,
            vec![TxStep::add_triple(
                EntityRef::lookup("a-email", json!("a@b.c")),
                "a-posts",
                json!("p1")
            )]
        );
    }

    #[test]
    fn test_merge_and_delete() {
        let attrs = user_attrs();
        let steps = transform(
            TransformContext::new(&attrs),
            &[
                EditOp::merge("users", EditEntity::id("u1"), json!({"name": {"first": "A"}})),
                EditOp::delete("users", EditEntity::id("u9")),
            ],
        )
        .unwrap();
        assert_eq!(steps[0], TxStep::add_triple(EntityRef::id("u1"), "a-id", json!("u1")));
        assert!(matches!(&steps[1], TxStep::DeepMergeTriple { attr_id, .. } if attr_id == "a-name"));
        assert_eq!(
            steps[2],
            TxStep::DeleteEntity {
                entity: EntityRef::id("u9"),
                etype: Some("users".into())
            }
        );
    }

    #[test]
    fn test_unsynced_attrs_are_reannounced_once() {
        let mut attrs = user_attrs();
        let mut pending = Attr::blob("a-bio", Ident::new("i-bio", "users", "bio"));
        pending.is_unsynced = true;
        attrs.add(pending);
        let ops = [
            EditOp::update("users", EditEntity::id("u1"), json!({"bio": "x"})),
            EditOp::update("users", EditEntity::id("u2"), json!({"bio": "y"})),
        ];
        let steps = transform(TransformContext::new(&attrs), &ops).unwrap();
        let added = add_attrs(&steps);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, "a-bio");
    }

    #[test]
    fn test_edit_op_from_json() {
        let op = EditOp::from_json(&json!(["update", "users", {"email": "a@b.c"}, {"name": "A"}, {"upsert": false}])).unwrap();
        assert_eq!(op.action, EditAction::Update);
        assert_eq!(op.entity, EditEntity::lookup("email", json!("a@b.c")));
        assert_eq!(op.opts.upsert, Some(false));
        assert!(EditOp::from_json(&json!(["explode", "users", "u1"])).is_err());
    }

    #[test]
    fn test_rewrite_step_maps_ids_and_lookups() {
        let mapping = AttrMapping {
            attr_id_map: HashMap::from([("local".to_string(), "server".to_string())]),
            ref_swap_attr_ids: HashSet::new(),
        };
        let step = TxStep::add_triple(EntityRef::lookup("local", json!("k")), "local", json!(["local", "v"]));
        assert_eq!(
            rewrite_step(&mapping, &step),
            TxStep::add_triple(EntityRef::lookup("server", json!("k")), "server", json!(["server", "v"]))
        );
        assert_eq!(
            rewrite_step(&mapping, &TxStep::DeleteAttr("local".into())),
            TxStep::DeleteAttr("server".into())
        );
    }

    #[test]
    fn test_rewrite_step_swaps_reversed_links() {
        let mapping = AttrMapping {
            attr_id_map: HashMap::from([("local-author".to_string(), "a-posts".to_string())]),
            ref_swap_attr_ids: HashSet::from(["local-author".to_string()]),
        };
        let step = TxStep::add_triple(EntityRef::id("p1"), "local-author", json!("u1"));
        let rewritten = rewrite_step(&mapping, &step);
        assert_eq!(rewritten, TxStep::add_triple(EntityRef::id("u1"), "a-posts", json!("p1")));

        let store = Store::new(user_attrs(), Vec::new(), false, None)
            .transact(&[rewritten])
            .unwrap();
        assert_eq!(store.get_triples(&TriplePattern::all().entity("u1")).len(), 1);
    }
}
