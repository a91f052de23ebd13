//! Triples, value keys and the positional tx-step encoding.
//!
//! On the wire both triples and tx-steps are JSON arrays:
//!
//! ```text
//! triple   = [entity, attr, value, createdAt]
//! tx-step  = ["add-triple", entity-or-lookup, attr, value, opts?]
//!          | ["deep-merge-triple", entity-or-lookup, attr, value, opts?]
//!          | ["retract-triple", entity-or-lookup, attr, value]
//!          | ["delete-entity", entity-or-lookup, etype?]
//!          | ["add-attr", attr] | ["update-attr", patch] | ["delete-attr", attr-id]
//! lookup   = [unique-attr-id, value]
//! ```

use crate::attrs::{Attr, AttrId, AttrPatch};
use crate::error::StoreError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;

pub type EntityId = String;

// ============================================================================
// Triple
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Triple {
    pub entity: EntityId,
    pub attr_id: AttrId,
    pub value: Value,
    pub created_at: i64,
}

impl Triple {
    pub fn new(
        entity: impl Into<String>,
        attr_id: impl Into<String>,
        value: Value,
        created_at: i64,
    ) -> Self {
        Self {
            entity: entity.into(),
            attr_id: attr_id.into(),
            value,
            created_at,
        }
    }
}

impl Serialize for Triple {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.entity, &self.attr_id, &self.value, self.created_at).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Triple {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts = Vec::<Value>::deserialize(deserializer)?;
        if parts.len() < 3 {
            return Err(serde::de::Error::custom("triple needs at least 3 elements"));
        }
        let entity = parts[0]
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("triple entity must be a string"))?;
        let attr_id = parts[1]
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("triple attr must be a string"))?;
        let created_at = parts.get(3).and_then(Value::as_i64).unwrap_or(0);
        Ok(Triple::new(entity, attr_id, parts[2].clone(), created_at))
    }
}

// ============================================================================
// Value Keys
// ============================================================================

/// Ordered, hashable key for a JSON value: its canonical compact encoding.
///
/// `serde_json` maps are sorted, so equal values always encode equally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueKey(String);

impl ValueKey {
    pub fn of(value: &Value) -> Self {
        Self(value.to_string())
    }

    pub fn entity(id: &str) -> Self {
        Self::of(&Value::String(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Value> for ValueKey {
    fn from(value: &Value) -> Self {
        Self::of(value)
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recursive object merge. `null` leaves in `update` remove the key.
pub fn deep_merge(current: &Value, update: &Value) -> Value {
    match (current, update) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut out = base.clone();
            for (k, v) in patch {
                if v.is_null() {
                    out.remove(k);
                    continue;
                }
                let merged = match out.get(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        _ => update.clone(),
    }
}

// ============================================================================
// Entity References
// ============================================================================

/// An entity position: a raw id or a `(unique attr, value)` lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRef {
    Id(EntityId),
    Lookup { attr_id: AttrId, value: Value },
}

impl EntityRef {
    pub fn id(id: impl Into<String>) -> Self {
        EntityRef::Id(id.into())
    }

    pub fn lookup(attr_id: impl Into<String>, value: Value) -> Self {
        EntityRef::Lookup {
            attr_id: attr_id.into(),
            value,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            EntityRef::Id(id) => Value::String(id.clone()),
            EntityRef::Lookup { attr_id, value } => json!([attr_id, value]),
        }
    }

    /// Inverse of [`EntityRef::to_json`]; also used to read a value position
    /// as an entity when link operands are swapped.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(EntityRef::Id(s.clone())),
            Value::Array(parts) if parts.len() == 2 => {
                let attr_id = parts[0].as_str()?;
                Some(EntityRef::lookup(attr_id, parts[1].clone()))
            }
            _ => None,
        }
    }

    pub fn as_lookup(&self) -> Option<(&str, &Value)> {
        match self {
            EntityRef::Lookup { attr_id, value } => Some((attr_id, value)),
            EntityRef::Id(_) => None,
        }
    }
}

/// A value position that is a lookup: `[attr-id, value]`.
pub fn value_as_lookup(value: &Value) -> Option<(&str, &Value)> {
    match value {
        Value::Array(parts) if parts.len() == 2 => Some((parts[0].as_str()?, &parts[1])),
        _ => None,
    }
}

// ============================================================================
// Tx Steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TripleOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WriteMode>,
}

impl TripleOpts {
    pub fn mode(mode: WriteMode) -> Self {
        Self { mode: Some(mode) }
    }
}

/// One primitive store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TxStep {
    AddTriple {
        entity: EntityRef,
        attr_id: AttrId,
        value: Value,
        opts: Option<TripleOpts>,
    },
    DeepMergeTriple {
        entity: EntityRef,
        attr_id: AttrId,
        value: Value,
        opts: Option<TripleOpts>,
    },
    RetractTriple {
        entity: EntityRef,
        attr_id: AttrId,
        value: Value,
    },
    DeleteEntity {
        entity: EntityRef,
        etype: Option<String>,
    },
    AddAttr(Attr),
    UpdateAttr(AttrPatch),
    DeleteAttr(AttrId),
}

impl TxStep {
    pub fn add_triple(entity: EntityRef, attr_id: impl Into<String>, value: Value) -> Self {
        TxStep::AddTriple {
            entity,
            attr_id: attr_id.into(),
            value,
            opts: None,
        }
    }

    pub fn retract_triple(entity: EntityRef, attr_id: impl Into<String>, value: Value) -> Self {
        TxStep::RetractTriple {
            entity,
            attr_id: attr_id.into(),
            value,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            TxStep::AddTriple { .. } => "add-triple",
            TxStep::DeepMergeTriple { .. } => "deep-merge-triple",
            TxStep::RetractTriple { .. } => "retract-triple",
            TxStep::DeleteEntity { .. } => "delete-entity",
            TxStep::AddAttr(_) => "add-attr",
            TxStep::UpdateAttr(_) => "update-attr",
            TxStep::DeleteAttr(_) => "delete-attr",
        }
    }

    /// The attribute a triple-level step writes through.
    pub fn attr_id(&self) -> Option<&str> {
        match self {
            TxStep::AddTriple { attr_id, .. }
            | TxStep::DeepMergeTriple { attr_id, .. }
            | TxStep::RetractTriple { attr_id, .. } => Some(attr_id),
            _ => None,
        }
    }

    pub fn is_schema_step(&self) -> bool {
        matches!(
            self,
            TxStep::AddAttr(_) | TxStep::UpdateAttr(_) | TxStep::DeleteAttr(_)
        )
    }

    pub fn to_json(&self) -> Value {
        let with_opts = |mut parts: Vec<Value>, opts: &Option<TripleOpts>| {
            if let Some(opts) = opts {
                parts.push(serde_json::to_value(opts).unwrap_or(Value::Null));
            }
            Value::Array(parts)
        };
        match self {
            TxStep::AddTriple {
                entity,
                attr_id,
                value,
                opts,
            }
            | TxStep::DeepMergeTriple {
                entity,
                attr_id,
                value,
                opts,
            } => with_opts(
                vec![
                    json!(self.action()),
                    entity.to_json(),
                    json!(attr_id),
                    value.clone(),
                ],
                opts,
            ),
            TxStep::RetractTriple {
                entity,
                attr_id,
                value,
            } => json!([self.action(), entity.to_json(), attr_id, value]),
            TxStep::DeleteEntity { entity, etype } => match etype {
                Some(etype) => json!([self.action(), entity.to_json(), etype]),
                None => json!([self.action(), entity.to_json()]),
            },
            TxStep::AddAttr(attr) => json!([self.action(), attr]),
            TxStep::UpdateAttr(patch) => json!([self.action(), patch]),
            TxStep::DeleteAttr(id) => json!([self.action(), id]),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, StoreError> {
        let parts = value
            .as_array()
            .ok_or_else(|| StoreError::InvalidTxStep(format!("expected array, got {value}")))?;
        let action = parts
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::InvalidTxStep("missing action".to_string()))?;
        let arg = |i: usize| {
            parts.get(i).ok_or_else(|| {
                StoreError::InvalidTxStep(format!("{action}: missing operand {i}"))
            })
        };
        let entity = |i: usize| -> Result<EntityRef, StoreError> {
            let raw = arg(i)?;
            EntityRef::from_json(raw)
                .ok_or_else(|| StoreError::InvalidTxStep(format!("{action}: bad entity {raw}")))
        };
        let attr = |i: usize| -> Result<AttrId, StoreError> {
            arg(i)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| StoreError::InvalidTxStep(format!("{action}: bad attr id")))
        };
        let opts = |i: usize| -> Result<Option<TripleOpts>, StoreError> {
            match parts.get(i) {
                None | Some(Value::Null) => Ok(None),
                Some(raw) => serde_json::from_value(raw.clone())
                    .map(Some)
                    .map_err(|e| StoreError::InvalidTxStep(format!("{action}: bad opts: {e}"))),
            }
        };

        match action {
            "add-triple" => Ok(TxStep::AddTriple {
                entity: entity(1)?,
                attr_id: attr(2)?,
                value: arg(3)?.clone(),
                opts: opts(4)?,
            }),
            "deep-merge-triple" => Ok(TxStep::DeepMergeTriple {
                entity: entity(1)?,
                attr_id: attr(2)?,
                value: arg(3)?.clone(),
                opts: opts(4)?,
            }),
            "retract-triple" => Ok(TxStep::RetractTriple {
                entity: entity(1)?,
                attr_id: attr(2)?,
                value: arg(3)?.clone(),
            }),
            "delete-entity" => Ok(TxStep::DeleteEntity {
                entity: entity(1)?,
                etype: parts.get(2).and_then(Value::as_str).map(str::to_string),
            }),
            "add-attr" => serde_json::from_value(arg(1)?.clone())
                .map(TxStep::AddAttr)
                .map_err(|e| StoreError::InvalidTxStep(format!("add-attr: {e}"))),
            "update-attr" => serde_json::from_value(arg(1)?.clone())
                .map(TxStep::UpdateAttr)
                .map_err(|e| StoreError::InvalidTxStep(format!("update-attr: {e}"))),
            "delete-attr" => Ok(TxStep::DeleteAttr(attr(1)?)),
            other => Err(StoreError::UnknownAction(other.to_string())),
        }
    }
}

impl Serialize for TxStep {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TxStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        TxStep::from_json(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_step_positional_encoding() {
        let step = TxStep::AddTriple {
            entity: EntityRef::lookup("a-email", json!("a@b.c")),
            attr_id: "a-name".to_string(),
            value: json!("Alice"),
            opts: Some(TripleOpts::mode(WriteMode::Update)),
        };
        let encoded = step.to_json();
        assert_eq!(
            encoded,
            json!(["add-triple", ["a-email", "a@b.c"], "a-name", "Alice", {"mode": "update"}])
        );
        assert_eq!(TxStep::from_json(&encoded).unwrap(), step);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = TxStep::from_json(&json!(["explode", "e"])).unwrap_err();
        assert!(matches!(err, StoreError::UnknownAction(a) if a == "explode"));
    }

    #[test]
    fn test_deep_merge_null_removes_key() {
        let merged = deep_merge(
            &json!({"a": {"b": 1, "c": 2}, "d": 3}),
            &json!({"a": {"c": null, "e": 4}}),
        );
        assert_eq!(merged, json!({"a": {"b": 1, "e": 4}, "d": 3}));
    }

    #[test]
    fn test_value_key_is_canonical() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(ValueKey::of(&a), ValueKey::of(&b));
    }
}
