//! Presence slices and presence patch edits.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// What a presence subscriber wants to see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceOpts {
    /// Include the local user (default true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<bool>,
    /// Only these peers; all peers when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<String>>,
    /// Only these presence keys; all keys when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    /// Presence to publish when this subscription joins the room.
    #[serde(rename = "initialPresence", default, skip_serializing_if = "Option::is_none")]
    pub initial_presence: Option<Value>,
}

/// Known presence for one room: ours plus every peer's, by session id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceRecord {
    pub user: Option<Value>,
    pub peers: BTreeMap<String, Value>,
}

/// The slice a presence subscriber receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Map<String, Value>>,
    pub peers: BTreeMap<String, Map<String, Value>>,
    #[serde(rename = "isLoading")]
    pub is_loading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

fn pick(data: Option<&Value>, keys: Option<&[String]>) -> Map<String, Value> {
    let Some(Value::Object(obj)) = data else {
        return Map::new();
    };
    match keys {
        None => obj.clone(),
        Some(keys) => keys
            .iter()
            .filter_map(|k| obj.get(k).map(|v| (k.clone(), v.clone())))
            .collect(),
    }
}

/// Project `record` through `opts`, tagging entries with their `peerId`.
pub fn build_presence_slice(
    record: &PresenceRecord,
    opts: &PresenceOpts,
    session_id: Option<&str>,
    is_loading: bool,
    error: Option<Value>,
) -> PresenceResponse {
    let keys = opts.keys.as_deref();
    let user = opts.user.unwrap_or(true).then(|| {
        let mut user = pick(record.user.as_ref(), keys);
        user.insert("peerId".to_string(), json!(session_id));
        user
    });

    let peers = record
        .peers
        .iter()
        .filter(|(id, _)| match &opts.peers {
            None => true,
            Some(wanted) => wanted.contains(id),
        })
        .map(|(id, data)| {
            let mut peer = pick(Some(data), keys);
            peer.insert("peerId".to_string(), json!(id));
            (id.clone(), peer)
        })
        .collect();

    PresenceResponse {
        user,
        peers,
        is_loading,
        error,
    }
}

// ============================================================================
// Patch Edits
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Insert,
    Replace,
    Remove,
}

/// `[path, op, value]` applied to the `session-id -> {data}` map.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEdit {
    pub path: Vec<Value>,
    pub op: PatchOp,
    pub value: Value,
}

impl PresenceEdit {
    fn op_code(&self) -> &'static str {
        match self.op {
            PatchOp::Insert => "+",
            PatchOp::Replace => "r",
            PatchOp::Remove => "-",
        }
    }
}

impl Serialize for PresenceEdit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.path, self.op_code(), &self.value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PresenceEdit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts = Vec::<Value>::deserialize(deserializer)?;
        let path = parts
            .first()
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| serde::de::Error::custom("presence edit needs a path"))?;
        let op = match parts.get(1).and_then(Value::as_str) {
            Some("+") => PatchOp::Insert,
            Some("r") => PatchOp::Replace,
            Some("-") => PatchOp::Remove,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unknown presence edit op {other:?}"
                )))
            }
        };
        let value = parts.get(2).cloned().unwrap_or(Value::Null);
        Ok(PresenceEdit { path, op, value })
    }
}

fn segment_key(seg: &Value) -> Option<String> {
    match seg {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Walk to the container holding the last path segment, creating objects
/// along the way.
fn parent_mut<'a>(root: &'a mut Value, path: &[Value]) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in path {
        cur = match cur {
            Value::Array(items) => {
                let idx = seg.as_u64()? as usize;
                items.get_mut(idx)?
            }
            Value::Object(obj) => obj
                .entry(segment_key(seg)?)
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return None,
        };
    }
    Some(cur)
}

fn apply_edit(root: &mut Value, edit: &PresenceEdit) {
    let Some((last, prefix)) = edit.path.split_last() else {
        return;
    };
    let Some(parent) = parent_mut(root, prefix) else {
        return;
    };
    match (parent, edit.op) {
        (Value::Array(items), PatchOp::Insert) => {
            let idx = last.as_u64().map(|i| i as usize).unwrap_or(items.len());
            items.insert(idx.min(items.len()), edit.value.clone());
        }
        (Value::Array(items), PatchOp::Replace) => {
            if let Some(slot) = last.as_u64().and_then(|i| items.get_mut(i as usize)) {
                *slot = edit.value.clone();
            }
        }
        (Value::Array(items), PatchOp::Remove) => {
            if let Some(idx) = last.as_u64().map(|i| i as usize).filter(|i| *i < items.len()) {
                items.remove(idx);
            }
        }
        (Value::Object(obj), PatchOp::Insert | PatchOp::Replace) => {
            if let Some(key) = segment_key(last) {
                obj.insert(key, edit.value.clone());
            }
        }
        (Value::Object(obj), PatchOp::Remove) => {
            if let Some(key) = segment_key(last) {
                obj.remove(&key);
            }
        }
        _ => {}
    }
}

/// Apply `edits` to the peers of a room, expressed as `{session: {data}}`.
pub fn apply_presence_edits(
    peers: &BTreeMap<String, Value>,
    edits: &[PresenceEdit],
) -> BTreeMap<String, Value> {
    let mut sessions = Value::Object(
        peers
            .iter()
            .map(|(id, data)| (id.clone(), json!({ "data": data })))
            .collect(),
    );
    for edit in edits {
        apply_edit(&mut sessions, edit);
    }
    match sessions {
        Value::Object(obj) => obj
            .into_iter()
            .map(|(id, session)| (id, session.get("data").cloned().unwrap_or(Value::Null)))
            .collect(),
        _ => BTreeMap::new(),
    }
}
