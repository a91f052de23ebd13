//! Attribute registry: the schema objects every triple points at.
//!
//! Attributes are mutable schema, not facts. The registry keeps the raw
//! `id -> Attr` map and derives label lookups lazily; any add/update/delete
//! throws the derived indexes away and they are rebuilt on next access.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// Attribute ids are server (or client-invented) uuids.
pub type AttrId = String;

// ============================================================================
// Attribute Types
// ============================================================================

/// `(ident_id, entity_type, label)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ident(pub String, pub String, pub String);

impl Ident {
    pub fn new(id: impl Into<String>, etype: impl Into<String>, label: impl Into<String>) -> Self {
        Self(id.into(), etype.into(), label.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    pub fn etype(&self) -> &str {
        &self.1
    }

    pub fn label(&self) -> &str {
        &self.2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Ref,
    Blob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDelete {
    Cascade,
    Restrict,
}

/// A schema attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attr {
    pub id: AttrId,
    #[serde(rename = "forward-identity")]
    pub forward_identity: Ident,
    #[serde(
        rename = "reverse-identity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reverse_identity: Option<Ident>,
    pub cardinality: Cardinality,
    #[serde(rename = "value-type")]
    pub value_type: ValueType,
    #[serde(rename = "unique?", default)]
    pub unique: bool,
    #[serde(rename = "index?", default)]
    pub indexed: bool,
    #[serde(rename = "primary?", default, skip_serializing_if = "is_false")]
    pub primary: bool,
    #[serde(rename = "on-delete", default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<OnDelete>,
    #[serde(
        rename = "on-delete-reverse",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub on_delete_reverse: Option<OnDelete>,
    #[serde(
        rename = "checked-data-type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub checked_data_type: Option<String>,
    /// Invented client-side and not yet acknowledged by the server.
    #[serde(rename = "isUnsynced", default, skip_serializing_if = "is_false")]
    pub is_unsynced: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Attr {
    /// A scalar attribute `etype.label`.
    pub fn blob(id: impl Into<String>, ident: Ident) -> Self {
        Self {
            id: id.into(),
            forward_identity: ident,
            reverse_identity: None,
            cardinality: Cardinality::One,
            value_type: ValueType::Blob,
            unique: false,
            indexed: false,
            primary: false,
            on_delete: None,
            on_delete_reverse: None,
            checked_data_type: None,
            is_unsynced: false,
        }
    }

    /// A link attribute `forward.etype.label <-> reverse.etype.label`.
    pub fn link(id: impl Into<String>, forward: Ident, reverse: Ident) -> Self {
        Self {
            id: id.into(),
            forward_identity: forward,
            reverse_identity: Some(reverse),
            cardinality: Cardinality::Many,
            value_type: ValueType::Ref,
            unique: false,
            indexed: false,
            primary: false,
            on_delete: None,
            on_delete_reverse: None,
            checked_data_type: None,
            is_unsynced: false,
        }
    }

    pub fn is_ref(&self) -> bool {
        self.value_type == ValueType::Ref
    }

    pub fn is_blob(&self) -> bool {
        self.value_type == ValueType::Blob
    }

    pub fn has_single_value(&self) -> bool {
        self.cardinality == Cardinality::One
    }

    pub fn forward_etype(&self) -> &str {
        self.forward_identity.etype()
    }

    pub fn reverse_etype(&self) -> Option<&str> {
        self.reverse_identity.as_ref().map(|i| i.etype())
    }

    /// Overlay the fields present in `patch`.
    pub fn apply_patch(&mut self, patch: &AttrPatch) {
        if let Some(v) = &patch.forward_identity {
            self.forward_identity = v.clone();
        }
        if let Some(v) = &patch.reverse_identity {
            self.reverse_identity = Some(v.clone());
        }
        if let Some(v) = patch.cardinality {
            self.cardinality = v;
        }
        if let Some(v) = patch.value_type {
            self.value_type = v;
        }
        if let Some(v) = patch.unique {
            self.unique = v;
        }
        if let Some(v) = patch.indexed {
            self.indexed = v;
        }
        if let Some(v) = patch.primary {
            self.primary = v;
        }
        if let Some(v) = patch.on_delete {
            self.on_delete = Some(v);
        }
        if let Some(v) = patch.on_delete_reverse {
            self.on_delete_reverse = Some(v);
        }
        if let Some(v) = &patch.checked_data_type {
            self.checked_data_type = Some(v.clone());
        }
    }
}

/// Partial attribute carried by `update-attr`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrPatch {
    pub id: AttrId,
    #[serde(rename = "forward-identity", default, skip_serializing_if = "Option::is_none")]
    pub forward_identity: Option<Ident>,
    #[serde(rename = "reverse-identity", default, skip_serializing_if = "Option::is_none")]
    pub reverse_identity: Option<Ident>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<Cardinality>,
    #[serde(rename = "value-type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(rename = "unique?", default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    #[serde(rename = "index?", default, skip_serializing_if = "Option::is_none")]
    pub indexed: Option<bool>,
    #[serde(rename = "primary?", default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,
    #[serde(rename = "on-delete", default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<OnDelete>,
    #[serde(rename = "on-delete-reverse", default, skip_serializing_if = "Option::is_none")]
    pub on_delete_reverse: Option<OnDelete>,
    #[serde(rename = "checked-data-type", default, skip_serializing_if = "Option::is_none")]
    pub checked_data_type: Option<String>,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Default)]
struct AttrIndexes {
    /// `(etype, label) -> attr id` over forward identities.
    forward_by_label: HashMap<(String, String), AttrId>,
    /// `(etype, label) -> attr id` over reverse identities.
    reverse_by_label: HashMap<(String, String), AttrId>,
    /// `etype -> label -> attr id` for blob attributes.
    blob_attrs_by_type: HashMap<String, BTreeMap<String, AttrId>>,
    /// `etype -> attr id` for attributes flagged `primary?`.
    primary_key_by_type: HashMap<String, AttrId>,
}

impl AttrIndexes {
    fn build(attrs: &BTreeMap<AttrId, Attr>) -> Self {
        let mut out = AttrIndexes::default();
        for attr in attrs.values() {
            let fwd = &attr.forward_identity;
            out.forward_by_label
                .insert((fwd.etype().to_string(), fwd.label().to_string()), attr.id.clone());
            if attr.is_blob() {
                out.blob_attrs_by_type
                    .entry(fwd.etype().to_string())
                    .or_default()
                    .insert(fwd.label().to_string(), attr.id.clone());
            }
            if attr.primary {
                out.primary_key_by_type
                    .insert(fwd.etype().to_string(), attr.id.clone());
            }
            if let Some(rev) = &attr.reverse_identity {
                out.reverse_by_label
                    .insert((rev.etype().to_string(), rev.label().to_string()), attr.id.clone());
            }
        }
        out
    }
}

/// The attribute set plus lazily derived label indexes.
#[derive(Debug, Default)]
pub struct AttrsStore {
    attrs: BTreeMap<AttrId, Attr>,
    indexes: OnceLock<AttrIndexes>,
}

impl Clone for AttrsStore {
    fn clone(&self) -> Self {
        // Derived indexes are cheap to rebuild; don't copy them.
        Self {
            attrs: self.attrs.clone(),
            indexes: OnceLock::new(),
        }
    }
}

impl PartialEq for AttrsStore {
    fn eq(&self, other: &Self) -> bool {
        self.attrs == other.attrs
    }
}

impl AttrsStore {
    pub fn new(attrs: impl IntoIterator<Item = Attr>) -> Self {
        Self {
            attrs: attrs.into_iter().map(|a| (a.id.clone(), a)).collect(),
            indexes: OnceLock::new(),
        }
    }

    fn reset_indexes(&mut self) {
        self.indexes = OnceLock::new();
    }

    fn indexes(&self) -> &AttrIndexes {
        self.indexes.get_or_init(|| AttrIndexes::build(&self.attrs))
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Attr> {
        self.attrs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.attrs.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.values()
    }

    pub fn add(&mut self, attr: Attr) {
        self.attrs.insert(attr.id.clone(), attr);
        self.reset_indexes();
    }

    /// Returns false when the attribute is unknown.
    pub fn update(&mut self, patch: &AttrPatch) -> bool {
        let Some(attr) = self.attrs.get_mut(&patch.id) else {
            return false;
        };
        attr.apply_patch(patch);
        self.reset_indexes();
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Attr> {
        let removed = self.attrs.remove(id);
        if removed.is_some() {
            self.reset_indexes();
        }
        removed
    }

    pub fn by_forward_label(&self, etype: &str, label: &str) -> Option<&Attr> {
        let id = self
            .indexes()
            .forward_by_label
            .get(&(etype.to_string(), label.to_string()))?;
        self.attrs.get(id)
    }

    pub fn by_reverse_label(&self, etype: &str, label: &str) -> Option<&Attr> {
        let id = self
            .indexes()
            .reverse_by_label
            .get(&(etype.to_string(), label.to_string()))?;
        self.attrs.get(id)
    }

    /// Blob attributes of `etype`, keyed by label.
    pub fn blob_attrs(&self, etype: &str) -> Vec<(&str, &Attr)> {
        let Some(by_label) = self.indexes().blob_attrs_by_type.get(etype) else {
            return Vec::new();
        };
        by_label
            .iter()
            .filter_map(|(label, id)| self.attrs.get(id).map(|a| (label.as_str(), a)))
            .collect()
    }

    /// The `primary?` attribute of `etype`, falling back to its `id` attribute.
    pub fn primary_key(&self, etype: &str) -> Option<&Attr> {
        if let Some(id) = self.indexes().primary_key_by_type.get(etype) {
            return self.attrs.get(id);
        }
        self.by_forward_label(etype, "id")
    }

    pub fn to_vec(&self) -> Vec<Attr> {
        self.attrs.values().cloned().collect()
    }
}

impl Serialize for AttrsStore {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.attrs.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttrsStore {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let attrs = BTreeMap::<AttrId, Attr>::deserialize(deserializer)?;
        Ok(Self {
            attrs,
            indexes: OnceLock::new(),
        })
    }
}
