//! Rooms: presence and broadcast topics.
//!
//! ```text
//!   join_room ──► disconnected ──(join-room-ok)──► connected
//!                      ▲                               │
//!                      └────── socket closed ──────────┘
//! ```
//!
//! Presence written while disconnected is coalesced into the local record
//! and sent on connect. Broadcasts are queued in order and flushed on
//! connect. Nothing here is persisted.

use crate::notify::Outbox;
use crate::presence::{
    apply_presence_edits, build_presence_slice, PresenceEdit, PresenceOpts, PresenceRecord,
    PresenceResponse,
};
use crate::protocol::{BroadcastEnvelope, ClientMessage, PeerPresence};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub type PresenceCallback = Arc<dyn Fn(&PresenceResponse) + Send + Sync>;

/// `(payload, sender presence)`; the sender is `None` when unknown.
pub type TopicCallback = Arc<dyn Fn(&Value, Option<&Value>) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
struct RoomState {
    connected: bool,
    error: Option<Value>,
}

struct PresenceHandler {
    id: u64,
    opts: PresenceOpts,
    cb: PresenceCallback,
    prev: Option<PresenceResponse>,
}

#[derive(Default)]
struct PresenceState {
    record: PresenceRecord,
    handlers: Vec<PresenceHandler>,
}

#[derive(Debug, Clone, PartialEq)]
struct QueuedBroadcast {
    topic: String,
    room_type: String,
    data: Value,
}

fn notify_handler(
    record: &PresenceRecord,
    room: &RoomState,
    session_id: Option<&str>,
    handler: &mut PresenceHandler,
    out: &mut Outbox,
) {
    let slice = build_presence_slice(
        record,
        &handler.opts,
        session_id,
        !room.connected,
        room.error.clone(),
    );
    if handler.prev.as_ref() == Some(&slice) {
        return;
    }
    handler.prev = Some(slice.clone());
    let cb = Arc::clone(&handler.cb);
    out.call(move || cb(&slice));
}

#[derive(Default)]
pub struct RoomManager {
    rooms: BTreeMap<String, RoomState>,
    pending_leave: HashSet<String>,
    presence: BTreeMap<String, PresenceState>,
    broadcast_queue: BTreeMap<String, Vec<QueuedBroadcast>>,
    topic_subs: BTreeMap<String, BTreeMap<String, BTreeMap<u64, TopicCallback>>>,
    session_id: Option<String>,
    authenticated: bool,
    next_id: u64,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    /// Outbound room messages are only sent on an authenticated socket.
    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    pub fn is_connected(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).is_some_and(|r| r.connected)
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn queued_broadcasts(&self, room_id: &str) -> usize {
        self.broadcast_queue.get(room_id).map_or(0, Vec::len)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn send_authed(&self, message: ClientMessage, out: &mut Outbox) {
        if self.authenticated {
            out.send(Uuid::new_v4().to_string(), message);
        }
    }

    // ------------------------------------------------------------------------
    // Joining / Leaving
    // ------------------------------------------------------------------------

    /// Join `room_id`, optionally publishing `initial` presence. Only a new
    /// room sends `join-room`; an existing one just takes the presence.
    pub fn join_room(&mut self, room_id: &str, initial: Option<Value>, out: &mut Outbox) {
        let is_new = !self.rooms.contains_key(room_id);
        self.rooms.entry(room_id.to_string()).or_default();
        self.pending_leave.remove(room_id);
        if let Some(data) = initial.clone() {
            self.presence.entry(room_id.to_string()).or_default().record.user = Some(data);
            self.notify_presence_subs(room_id, out);
        }

        if is_new {
            debug!(%room_id, "join-room");
            self.send_authed(
                ClientMessage::JoinRoom {
                    room_id: room_id.to_string(),
                    data: initial,
                },
                out,
            );
        } else if let Some(data) = initial {
            if self.is_connected(room_id) {
                self.send_authed(
                    ClientMessage::SetPresence {
                        room_id: room_id.to_string(),
                        data,
                    },
                    out,
                );
            }
        }
    }

    /// Leave `room_id` once nothing in it is subscribed any more.
    pub fn leave_room(&mut self, room_id: &str, out: &mut Outbox) {
        let has_handlers = self
            .presence
            .get(room_id)
            .is_some_and(|p| !p.handlers.is_empty());
        let has_topic_subs = self
            .topic_subs
            .get(room_id)
            .is_some_and(|topics| topics.values().any(|subs| !subs.is_empty()));
        if has_handlers || has_topic_subs {
            return;
        }

        if self.is_connected(room_id) {
            self.send_authed(
                ClientMessage::LeaveRoom {
                    room_id: room_id.to_string(),
                },
                out,
            );
        } else {
            self.pending_leave.insert(room_id.to_string());
        }
        self.rooms.remove(room_id);
        self.presence.remove(room_id);
        self.topic_subs.remove(room_id);
        self.broadcast_queue.remove(room_id);
    }

    // ------------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------------

    /// Merge `partial` into our presence; sent right away when connected.
    pub fn publish_presence(&mut self, room_id: &str, partial: Value, out: &mut Outbox) {
        if !self.rooms.contains_key(room_id) {
            debug!(%room_id, "publish_presence on a room that was never joined");
            return;
        }
        let entry = self.presence.entry(room_id.to_string()).or_default();
        let user = match (entry.record.user.take(), partial) {
            (Some(Value::Object(mut current)), Value::Object(partial)) => {
                current.extend(partial);
                Value::Object(current)
            }
            (_, partial) => partial,
        };
        entry.record.user = Some(user.clone());

        if !self.is_connected(room_id) {
            return;
        }
        self.send_authed(
            ClientMessage::SetPresence {
                room_id: room_id.to_string(),
                data: user,
            },
            out,
        );
        self.notify_presence_subs(room_id, out);
    }

    /// Current slice for `opts`, if the room is joined.
    pub fn get_presence(&self, room_id: &str, opts: &PresenceOpts) -> Option<PresenceResponse> {
        let room = self.rooms.get(room_id)?;
        let entry = self.presence.get(room_id)?;
        Some(build_presence_slice(
            &entry.record,
            opts,
            self.session_id.as_deref(),
            !room.connected,
            room.error.clone(),
        ))
    }

    /// Join the room and receive presence slices for `opts`.
    pub fn subscribe_presence(
        &mut self,
        room_id: &str,
        opts: PresenceOpts,
        cb: PresenceCallback,
        out: &mut Outbox,
    ) -> u64 {
        self.join_room(room_id, opts.initial_presence.clone(), out);
        let id = self.next_id();
        let mut handler = PresenceHandler {
            id,
            opts,
            cb,
            prev: None,
        };
        let entry = self.presence.entry(room_id.to_string()).or_default();
        if let Some(room) = self.rooms.get(room_id) {
            notify_handler(&entry.record, room, self.session_id.as_deref(), &mut handler, out);
        }
        entry.handlers.push(handler);
        id
    }

    pub fn unsubscribe_presence(&mut self, room_id: &str, id: u64, out: &mut Outbox) {
        if let Some(entry) = self.presence.get_mut(room_id) {
            entry.handlers.retain(|h| h.id != id);
        }
        self.leave_room(room_id, out);
    }

    fn notify_presence_subs(&mut self, room_id: &str, out: &mut Outbox) {
        let (Some(room), Some(entry)) = (self.rooms.get(room_id), self.presence.get_mut(room_id)) else {
            return;
        };
        let PresenceState { record, handlers } = entry;
        for handler in handlers.iter_mut() {
            notify_handler(record, room, self.session_id.as_deref(), handler, out);
        }
    }

    fn set_presence_peers(&mut self, room_id: &str, mut peers: BTreeMap<String, Value>, out: &mut Outbox) {
        if let Some(session_id) = &self.session_id {
            peers.remove(session_id);
        }
        self.presence.entry(room_id.to_string()).or_default().record.peers = peers;
        self.notify_presence_subs(room_id, out);
    }

    // ------------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------------

    /// Broadcast on `(room_id, topic)`; queued until the room is connected.
    pub fn publish_topic(
        &mut self,
        room_type: &str,
        room_id: &str,
        topic: &str,
        data: Value,
        out: &mut Outbox,
    ) {
        if !self.rooms.contains_key(room_id) {
            debug!(%room_id, %topic, "publish_topic on a room that was never joined");
            return;
        }
        if !self.is_connected(room_id) {
            self.broadcast_queue
                .entry(room_id.to_string())
                .or_default()
                .push(QueuedBroadcast {
                    topic: topic.to_string(),
                    room_type: room_type.to_string(),
                    data,
                });
            return;
        }
        self.send_broadcast(room_id, room_type, topic, data, out);
    }

    fn send_broadcast(&self, room_id: &str, room_type: &str, topic: &str, data: Value, out: &mut Outbox) {
        self.send_authed(
            ClientMessage::ClientBroadcast {
                room_id: room_id.to_string(),
                room_type: room_type.to_string(),
                topic: topic.to_string(),
                data,
            },
            out,
        );
    }

    /// Join the room and receive broadcasts on `topic`.
    pub fn subscribe_topic(&mut self, room_id: &str, topic: &str, cb: TopicCallback, out: &mut Outbox) -> u64 {
        self.join_room(room_id, None, out);
        let id = self.next_id();
        self.topic_subs
            .entry(room_id.to_string())
            .or_default()
            .entry(topic.to_string())
            .or_default()
            .insert(id, cb);
        id
    }

    pub fn unsubscribe_topic(&mut self, room_id: &str, topic: &str, id: u64, out: &mut Outbox) {
        if let Some(topics) = self.topic_subs.get_mut(room_id) {
            if let Some(subs) = topics.get_mut(topic) {
                subs.remove(&id);
                if subs.is_empty() {
                    topics.remove(topic);
                }
            }
            if topics.is_empty() {
                self.topic_subs.remove(room_id);
            }
        }
        self.leave_room(room_id, out);
    }

    // ------------------------------------------------------------------------
    // Server Events
    // ------------------------------------------------------------------------

    pub fn handle_join_room_ok(&mut self, room_id: &str, out: &mut Outbox) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            if self.pending_leave.remove(room_id) {
                self.send_authed(
                    ClientMessage::LeaveRoom {
                        room_id: room_id.to_string(),
                    },
                    out,
                );
            }
            return;
        };
        room.connected = true;
        room.error = None;
        debug!(%room_id, "room connected");

        for queued in self.broadcast_queue.remove(room_id).unwrap_or_default() {
            self.send_broadcast(room_id, &queued.room_type, &queued.topic, queued.data, out);
        }
        let user = self.presence.get(room_id).and_then(|p| p.record.user.clone());
        if let Some(data) = user {
            self.send_authed(
                ClientMessage::SetPresence {
                    room_id: room_id.to_string(),
                    data,
                },
                out,
            );
        }
        self.notify_presence_subs(room_id, out);
    }

    pub fn handle_join_room_error(&mut self, room_id: &str, error: Value, out: &mut Outbox) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        room.error = Some(error);
        self.notify_presence_subs(room_id, out);
    }

    pub fn handle_refresh_presence(
        &mut self,
        room_id: &str,
        sessions: &BTreeMap<String, PeerPresence>,
        out: &mut Outbox,
    ) {
        let peers = sessions
            .iter()
            .map(|(id, p)| (id.clone(), p.data.clone()))
            .collect();
        self.set_presence_peers(room_id, peers, out);
    }

    pub fn handle_patch_presence(&mut self, room_id: &str, edits: &[PresenceEdit], out: &mut Outbox) {
        let current = self
            .presence
            .get(room_id)
            .map(|p| p.record.peers.clone())
            .unwrap_or_default();
        let peers = apply_presence_edits(&current, edits);
        self.set_presence_peers(room_id, peers, out);
    }

    /// Deliver a broadcast, resolving its sender to our own presence or a
    /// peer's.
    pub fn handle_server_broadcast(
        &self,
        room_id: &str,
        topic: &str,
        envelope: &BroadcastEnvelope,
        out: &mut Outbox,
    ) {
        let Some(subs) = self.topic_subs.get(room_id).and_then(|t| t.get(topic)) else {
            return;
        };
        let record = self.presence.get(room_id).map(|p| &p.record);
        let peer = match (&envelope.peer_id, record) {
            (Some(peer_id), Some(record)) if Some(peer_id) == self.session_id.as_ref() => record.user.clone(),
            (Some(peer_id), Some(record)) => record.peers.get(peer_id).cloned(),
            _ => None,
        };
        for cb in subs.values() {
            let cb = Arc::clone(cb);
            let data = envelope.data.clone();
            let peer = peer.clone();
            out.call(move || cb(&data, peer.as_ref()));
        }
    }

    pub fn handle_socket_closed(&mut self, out: &mut Outbox) {
        let room_ids: Vec<String> = self.rooms.keys().cloned().collect();
        for room_id in room_ids {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.connected = false;
            }
            self.notify_presence_subs(&room_id, out);
        }
    }

    /// Re-join every room with our last presence.
    pub fn resend_joins(&self, out: &mut Outbox) {
        for room_id in self.rooms.keys() {
            let user = self.presence.get(room_id).and_then(|p| p.record.user.clone());
            self.send_authed(
                ClientMessage::JoinRoom {
                    room_id: room_id.clone(),
                    data: user,
                },
                out,
            );
        }
    }
}
