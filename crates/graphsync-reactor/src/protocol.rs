//! Wire messages exchanged with the server.
//!
//! Both directions are closed enums tagged by `op`. Field names are the
//! kebab-case wire names; everything round-trips through `serde_json`.

use crate::presence::PresenceEdit;
use graphsync_store::{Attr, Triple, TxStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// Client -> Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClientMessage {
    AddQuery {
        q: Value,
    },
    RemoveQuery {
        q: Value,
    },
    Transact {
        #[serde(rename = "tx-steps")]
        tx_steps: Vec<TxStep>,
        created: i64,
        order: u64,
    },
    JoinRoom {
        #[serde(rename = "room-id")]
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    LeaveRoom {
        #[serde(rename = "room-id")]
        room_id: String,
    },
    SetPresence {
        #[serde(rename = "room-id")]
        room_id: String,
        data: Value,
    },
    ClientBroadcast {
        #[serde(rename = "room-id")]
        room_id: String,
        #[serde(rename = "roomType")]
        room_type: String,
        topic: String,
        data: Value,
    },
}

impl ClientMessage {
    pub fn op(&self) -> &'static str {
        match self {
            ClientMessage::AddQuery { .. } => "add-query",
            ClientMessage::RemoveQuery { .. } => "remove-query",
            ClientMessage::Transact { .. } => "transact",
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::SetPresence { .. } => "set-presence",
            ClientMessage::ClientBroadcast { .. } => "client-broadcast",
        }
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    #[serde(rename = "instaql-query")]
    pub query: Value,
    #[serde(rename = "instaql-result", default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    #[serde(rename = "peer-id", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// An `error` frame. Which fields are set depends on what failed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "client-event-id", default, skip_serializing_if = "Option::is_none")]
    pub client_event_id: Option<String>,
    #[serde(rename = "original-event", default, skip_serializing_if = "Option::is_none")]
    pub original_event: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<Value>,
}

impl ErrorFrame {
    /// The query this error is about, if any.
    pub fn query(&self) -> Option<&Value> {
        self.q
            .as_ref()
            .or_else(|| self.original_event.as_ref().and_then(|e| e.get("q")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ServerMessage {
    InitOk {
        #[serde(default)]
        attrs: Vec<Attr>,
        #[serde(rename = "session-id", default)]
        session_id: Option<String>,
    },
    AddQueryOk {
        q: Value,
        #[serde(default)]
        result: Value,
        #[serde(rename = "processed-tx-id", default)]
        processed_tx_id: Option<i64>,
    },
    RefreshOk {
        #[serde(default)]
        computations: Vec<Computation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attrs: Option<Vec<Attr>>,
        #[serde(rename = "processed-tx-id", default)]
        processed_tx_id: Option<i64>,
    },
    TransactOk {
        #[serde(rename = "client-event-id")]
        client_event_id: String,
        #[serde(rename = "tx-id")]
        tx_id: i64,
    },
    Error(ErrorFrame),
    JoinRoomOk {
        #[serde(rename = "room-id")]
        room_id: String,
    },
    JoinRoomError {
        #[serde(rename = "room-id")]
        room_id: String,
        #[serde(default)]
        error: Value,
    },
    RefreshPresence {
        #[serde(rename = "room-id")]
        room_id: String,
        #[serde(alias = "peers", default)]
        data: BTreeMap<String, PeerPresence>,
    },
    PatchPresence {
        #[serde(rename = "room-id")]
        room_id: String,
        #[serde(default)]
        edits: Vec<PresenceEdit>,
    },
    ServerBroadcast {
        #[serde(rename = "room-id")]
        room_id: String,
        topic: String,
        #[serde(default)]
        data: BroadcastEnvelope,
    },
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Query Results
// ============================================================================

/// Every triple in a query result tree.
///
/// A result is a list of nodes; each node carries
/// `data.datalog-result.join-rows` (rows of triples) and `child-nodes`.
pub fn extract_triples(result: &Value) -> Vec<Triple> {
    let mut out = Vec::new();
    collect_triples(result, &mut out);
    out
}

fn collect_triples(nodes: &Value, out: &mut Vec<Triple>) {
    let Some(nodes) = nodes.as_array() else {
        return;
    };
    for node in nodes {
        let rows = node
            .pointer("/data/datalog-result/join-rows")
            .and_then(Value::as_array);
        for row in rows.into_iter().flatten() {
            for raw in row.as_array().into_iter().flatten() {
                match serde_json::from_value::<Triple>(raw.clone()) {
                    Ok(triple) => out.push(triple),
                    Err(error) => tracing::debug!(%error, "skipping malformed triple"),
                }
            }
        }
        if let Some(children) = node.get("child-nodes") {
            collect_triples(children, out);
        }
    }
}

/// `page-info` and `aggregate` of the first result node.
pub fn result_meta(result: &Value) -> (Option<Value>, Option<Value>) {
    let data = result.get(0).and_then(|n| n.get("data"));
    let page_info = data.and_then(|d| d.get("page-info")).cloned();
    let aggregate = data.and_then(|d| d.get("aggregate")).cloned();
    (page_info, aggregate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_use_wire_names() {
        let msg = ClientMessage::ClientBroadcast {
            room_id: "room-1".into(),
            room_type: "chat".into(),
            topic: "emoji".into(),
            data: json!({"e": 1}),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["op"], "client-broadcast");
        assert_eq!(v["room-id"], "room-1");
        assert_eq!(v["roomType"], "chat");
        assert_eq!(msg.op(), "client-broadcast");
    }

    #[test]
    fn test_transact_carries_positional_steps() {
        let msg = ClientMessage::Transact {
            tx_steps: vec![TxStep::add_triple(
                graphsync_store::EntityRef::id("u1"),
                "a-name",
                json!("Alice"),
            )],
            created: 5,
            order: 1,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["tx-steps"][0], json!(["add-triple", "u1", "a-name", "Alice"]));
    }

    #[test]
    fn test_server_messages_parse() {
        let ok: ServerMessage =
            serde_json::from_value(json!({"op": "transact-ok", "client-event-id": "e1", "tx-id": 9}))
                .unwrap();
        assert_eq!(
            ok,
            ServerMessage::TransactOk {
                client_event_id: "e1".into(),
                tx_id: 9
            }
        );

        let err: ServerMessage = serde_json::from_value(json!({
            "op": "error",
            "original-event": {"op": "add-query", "q": {"users": {}}},
            "message": "bad query"
        }))
        .unwrap();
        match err {
            ServerMessage::Error(frame) => {
                assert_eq!(frame.query(), Some(&json!({"users": {}})));
                assert_eq!(frame.message, "bad query");
            }
            other => panic!("unexpected {other:?}"),
        }

        let unknown: ServerMessage =
            serde_json::from_value(json!({"op": "something-new", "x": 1})).unwrap();
        assert_eq!(unknown, ServerMessage::Unknown);
    }

    #[test]
    fn test_extract_triples_walks_child_nodes() {
        let result = json!([{
            "data": {
                "datalog-result": {"join-rows": [[["u1", "a-id", "u1", 1], ["u1", "a-name", "Alice", 2]]]},
                "page-info": {"users": {"has-next-page": false}}
            },
            "child-nodes": [{
                "data": {"datalog-result": {"join-rows": [[["p1", "a-title", "Hi", 3]]]}},
                "child-nodes": []
            }]
        }]);
        let triples = extract_triples(&result);
        assert_eq!(triples.len(), 3);
        assert_eq!(triples[2].entity, "p1");

        let (page_info, aggregate) = result_meta(&result);
        assert_eq!(page_info, Some(json!({"users": {"has-next-page": false}})));
        assert!(aggregate.is_none());
    }
}
