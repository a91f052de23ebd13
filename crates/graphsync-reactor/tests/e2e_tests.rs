//! End-to-end tests for the reactor
//!
//! These drive a [`Reactor`] the way a socket would:
//! 1. Authentication and query subscription
//! 2. Optimistic mutations and their acknowledgement
//! 3. Offline queueing, timeouts and server rejections
//! 4. Rooms and topics
//! 5. Durable state across a reload

use graphsync_reactor::mutations::PENDING_MUTATIONS_KEY;
use graphsync_reactor::protocol::ErrorFrame;
use graphsync_reactor::*;
use graphsync_storage::{MemoryStorage, StorageBackend};
use graphsync_store::{Attr, EntityRef, Ident, TxStep};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, ClientMessage)>>,
}

impl Transport for RecordingTransport {
    fn send(&self, event_id: &str, message: ClientMessage) {
        self.sent.lock().push((event_id.to_string(), message));
    }
}

impl RecordingTransport {
    fn take(&self) -> Vec<(String, ClientMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    fn ops(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|(_, m)| m.op()).collect()
    }

    fn transacts(&self) -> Vec<(String, ClientMessage)> {
        self.take()
            .into_iter()
            .filter(|(_, m)| matches!(m, ClientMessage::Transact { .. }))
            .collect()
    }
}

/// Helper to create test environment
fn test_env_with(backend: Arc<MemoryStorage>) -> (Reactor, Arc<RecordingTransport>, Arc<ManualClock>) {
    // RUST_LOG=graphsync_reactor=debug shows the reactor's decisions.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let transport = Arc::new(RecordingTransport::default());
    let clock = Arc::new(ManualClock::new(1_000));
    let reactor = Reactor::with_clock(
        ReactorConfig::default(),
        transport.clone(),
        backend,
        clock.clone(),
    );
    (reactor, transport, clock)
}

fn test_env() -> (Reactor, Arc<RecordingTransport>, Arc<ManualClock>) {
    test_env_with(Arc::new(MemoryStorage::new()))
}

fn init_ok(reactor: &Reactor) {
    reactor.handle_receive(ServerMessage::InitOk {
        attrs: vec![],
        session_id: Some("s1".into()),
    });
}

fn recorder() -> (QueryCallback, Arc<Mutex<Vec<QueryResponse>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (Arc::new(move |r: &QueryResponse| sink.lock().push(r.clone())), seen)
}

fn users() -> Value {
    json!({"users": {}})
}

fn empty_result(reactor: &Reactor, processed: i64) {
    reactor.handle_receive(ServerMessage::AddQueryOk {
        q: users(),
        result: json!([]),
        processed_tx_id: Some(processed),
    });
}

fn set_name(id: &str, name: &str) -> EditOp {
    EditOp::update("users", EditEntity::id(id), json!({ "name": name }))
}

// ============================================================================
// Queries
// ============================================================================

#[test]
fn test_queries_wait_for_authentication() {
    let (reactor, transport, _) = test_env();
    let (cb, _) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    assert!(transport.ops().is_empty());

    init_ok(&reactor);
    assert_eq!(transport.ops(), vec!["add-query"]);
    assert_eq!(reactor.session_id().as_deref(), Some("s1"));
}

#[test]
fn test_unsubscribe_removes_query() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    let (cb, _) = recorder();
    let sub = reactor.subscribe_query(users(), cb);
    sub.unsubscribe();
    let sent = transport.take();
    assert_eq!(sent.last().unwrap().1, ClientMessage::RemoveQuery { q: users() });
}

#[test]
fn test_identical_results_notify_once() {
    let (reactor, _, _) = test_env();
    init_ok(&reactor);
    let (cb, seen) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    for processed in 1..4 {
        empty_result(&reactor, processed);
    }
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_transact_ok_keeps_unchanged_results_quiet() {
    let (reactor, _, _) = test_env();
    init_ok(&reactor);
    let (cb, seen) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    empty_result(&reactor, 1);
    let receipt = reactor.transact(&[set_name("user1", "Alice")]);
    assert_eq!(seen.lock().len(), 2);

    reactor.handle_receive(ServerMessage::TransactOk {
        client_event_id: receipt.event_id().to_string(),
        tx_id: 10,
    });
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].data().unwrap()["users"][0]["name"], "Alice");
}

#[test]
fn test_repeated_init_ok_keeps_unchanged_results_quiet() {
    let (reactor, _, _) = test_env();
    init_ok(&reactor);
    let (cb, seen) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    empty_result(&reactor, 1);
    assert_eq!(seen.lock().len(), 1);

    init_ok(&reactor);
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_load_storage_keeps_unchanged_results_quiet() {
    let (reactor, _, _) = test_env();
    init_ok(&reactor);
    let (cb, seen) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    empty_result(&reactor, 1);
    assert_eq!(seen.lock().len(), 1);

    reactor.load_storage().await;
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_init_error_reaches_every_query() {
    let (reactor, _, _) = test_env();
    let (cb, seen) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    reactor.handle_receive(ServerMessage::Error(ErrorFrame {
        original_event: Some(json!({"op": "init"})),
        message: "unknown app".into(),
        ..Default::default()
    }));
    let seen = seen.lock();
    assert_eq!(seen.last().unwrap().error().unwrap().message, "unknown app");
}

#[test]
fn test_query_error_frame() {
    let (reactor, _, _) = test_env();
    init_ok(&reactor);
    let (cb, seen) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    reactor
        .handle_raw(
            &json!({
                "op": "error",
                "original-event": {"op": "add-query", "q": users()},
                "message": "permission denied"
            })
            .to_string(),
        )
        .unwrap();
    assert_eq!(seen.lock()[0].error().unwrap().message, "permission denied");
}

#[test]
fn test_handle_raw_rejects_garbage() {
    let (reactor, _, _) = test_env();
    let err = reactor.handle_raw("{not json").unwrap_err();
    assert!(matches!(err, ReactorError::Json(_)));
    // Unknown ops are accepted and ignored.
    reactor.handle_raw(r#"{"op": "something-new"}"#).unwrap();
}

// ============================================================================
// Mutations
// ============================================================================

#[test]
fn test_optimistic_write_with_new_attrs() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    let (cb, seen) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    empty_result(&reactor, 1);

    let mut receipt = reactor.transact(&[set_name("user1", "Alice")]);
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].data().unwrap()["users"][0]["name"], "Alice");
    }

    let transacts = transport.transacts();
    assert_eq!(transacts.len(), 1);
    let (event_id, ClientMessage::Transact { tx_steps, .. }) = &transacts[0] else {
        unreachable!()
    };
    assert_eq!(event_id, receipt.event_id());
    let added: Vec<String> = tx_steps
        .iter()
        .filter_map(|s| match s {
            TxStep::AddAttr(a) => Some(a.id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(added.len(), 2);
    assert!(receipt.try_outcome().is_none());

    reactor.handle_receive(ServerMessage::TransactOk {
        client_event_id: event_id.clone(),
        tx_id: 10,
    });
    let attrs = reactor.attrs();
    assert!(added.iter().all(|id| attrs.contains(id)));
    assert!(attrs.by_forward_label("users", "name").is_some());
    assert_eq!(
        receipt.try_outcome(),
        Some(Ok(TxOutcome {
            status: TxStatus::Synced,
            event_id: event_id.clone(),
        }))
    );
    // Still visible until a snapshot at tx 10 arrives.
    assert_eq!(reactor.pending_mutation_count(), 1);
}

#[test]
fn test_confirmed_mutations_collected_once_every_query_caught_up() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    let (cb, _) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    empty_result(&reactor, 1);
    let receipt = reactor.transact(&[set_name("user1", "Alice")]);
    transport.take();
    reactor.handle_receive(ServerMessage::TransactOk {
        client_event_id: receipt.event_id().to_string(),
        tx_id: 10,
    });

    empty_result(&reactor, 9);
    assert_eq!(reactor.pending_mutation_count(), 1);
    empty_result(&reactor, 10);
    assert_eq!(reactor.pending_mutation_count(), 0);
}

#[test]
fn test_offline_mutations_enqueue_then_send_in_order() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    transport.take();
    reactor.handle_online(false);

    let mut first = reactor.transact(&[set_name("u1", "A")]);
    let mut second = reactor.transact(&[set_name("u2", "B")]);
    for receipt in [&mut first, &mut second] {
        let event_id = receipt.event_id().to_string();
        assert_eq!(
            receipt.try_outcome(),
            Some(Ok(TxOutcome {
                status: TxStatus::Enqueued,
                event_id,
            }))
        );
    }
    assert!(transport.ops().is_empty());

    reactor.handle_online(true);
    let sent = transport.transacts();
    let ids: Vec<&str> = sent.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec![first.event_id(), second.event_id()]);
    let orders: Vec<u64> = sent
        .iter()
        .filter_map(|(_, m)| match m {
            ClientMessage::Transact { order, .. } => Some(*order),
            _ => None,
        })
        .collect();
    assert_eq!(orders, vec![1, 2]);
}

#[test]
fn test_timeout_rejects_and_reports() {
    let (reactor, _, clock) = test_env();
    init_ok(&reactor);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let _errors_sub =
        reactor.subscribe_mutation_errors(Arc::new(move |e: &MutationErrorDetails| sink.lock().push(e.clone())));

    let mut receipt = reactor.transact(&[set_name("u1", "A")]);
    clock.advance(4_999);
    reactor.tick();
    assert!(receipt.try_outcome().is_none());

    clock.advance(1);
    reactor.tick();
    assert_eq!(receipt.try_outcome(), Some(Err(MutationError::Timeout)));
    assert_eq!(errors.lock()[0].message, "transaction timed out");
    assert_eq!(reactor.pending_mutation_count(), 0);
}

#[test]
fn test_server_rejection_reverts_projection() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    let (cb, seen) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    empty_result(&reactor, 1);
    let mut receipt = reactor.transact(&[set_name("u1", "A")]);
    transport.take();

    reactor.handle_receive(ServerMessage::Error(ErrorFrame {
        client_event_id: Some(receipt.event_id().to_string()),
        kind: Some("permission-denied".into()),
        status: Some(400),
        message: "not allowed".into(),
        hint: Some(json!({"rule": "users.update"})),
        ..Default::default()
    }));

    match receipt.try_outcome() {
        Some(Err(MutationError::Api { status, body })) => {
            assert_eq!(status, 400);
            assert_eq!(body.kind.as_deref(), Some("permission-denied"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].data().unwrap()["users"], json!([]));
}

#[test]
fn test_transform_failure_never_reaches_transport() {
    let (reactor, transport, _) = test_env();
    reactor.handle_receive(ServerMessage::InitOk {
        attrs: vec![
            Attr::blob("a-id", Ident::new("f-id", "users", "id")),
            Attr::blob("a-name", Ident::new("f-name", "users", "name")),
        ],
        session_id: Some("s1".into()),
    });
    transport.take();

    // `name` is not unique, so it cannot address an entity.
    let mut receipt = reactor.transact(&[EditOp::update(
        "users",
        EditEntity::lookup("name", json!("Alice")),
        json!({"name": "Bob"}),
    )]);
    match receipt.try_outcome() {
        Some(Err(MutationError::Client { message, .. })) => assert!(message.contains("not a unique")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(transport.ops().is_empty());
    assert_eq!(reactor.pending_mutation_count(), 0);
}

#[test]
fn test_socket_close_resends_in_flight_mutations() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    let (cb, _) = recorder();
    let _sub = reactor.subscribe_query(users(), cb);
    let receipt = reactor.transact(&[set_name("u1", "A")]);
    transport.take();

    reactor.handle_socket_closed();
    assert!(!reactor.is_authenticated());
    reactor.tick();
    assert!(transport.ops().is_empty());

    init_ok(&reactor);
    let sent = transport.take();
    let ops: Vec<&str> = sent.iter().map(|(_, m)| m.op()).collect();
    assert_eq!(ops, vec!["add-query", "transact"]);
    assert_eq!(sent[1].0, receipt.event_id());
}

#[test]
fn test_pending_queue_json_layout() {
    // Raw tx-steps survive the trip through the persisted layout.
    let mut pending = PendingMutations::default();
    pending.insert(
        "e1",
        PendingMutation {
            tx_steps: vec![TxStep::add_triple(EntityRef::id("u1"), "a-name", json!("A"))],
            created: 1,
            order: 1,
            tx_id: None,
            confirmed: None,
            error: None,
        },
    );
    let text = serde_json::to_string(&pending).unwrap();
    let back: PendingMutations = serde_json::from_str(&text).unwrap();
    assert_eq!(back, pending);
}

// ============================================================================
// Rooms
// ============================================================================

#[test]
fn test_topic_published_before_join_is_sent_once() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    let _sub = reactor.subscribe_topic("room-1", "chat", Arc::new(|_: &Value, _: Option<&Value>| {}));
    assert_eq!(transport.ops(), vec!["join-room"]);
    transport.take();

    reactor.publish_topic("chat", "room-1", "chat", json!({"text": "hi"}));
    assert!(transport.ops().is_empty());

    reactor.handle_receive(ServerMessage::JoinRoomOk {
        room_id: "room-1".into(),
    });
    let sent: Vec<ClientMessage> = transport.take().into_iter().map(|(_, m)| m).collect();
    assert_eq!(
        sent,
        vec![ClientMessage::ClientBroadcast {
            room_id: "room-1".into(),
            room_type: "chat".into(),
            topic: "chat".into(),
            data: json!({"text": "hi"}),
        }]
    );
}

#[test]
fn test_room_is_joined_once_per_subscription_set() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    let joins = |t: &RecordingTransport| t.ops().iter().filter(|op| **op == "join-room").count();

    let _a = reactor.subscribe_topic("r1", "a", Arc::new(|_: &Value, _: Option<&Value>| {}));
    let _b = reactor.subscribe_topic("r1", "b", Arc::new(|_: &Value, _: Option<&Value>| {}));
    assert_eq!(joins(&transport), 1);

    reactor.handle_receive(ServerMessage::JoinRoomOk {
        room_id: "r1".into(),
    });
    let _c = reactor.subscribe_topic("r1", "c", Arc::new(|_: &Value, _: Option<&Value>| {}));
    let _p = reactor.subscribe_presence("r1", PresenceOpts::default(), Arc::new(|_: &PresenceResponse| {}));
    assert_eq!(joins(&transport), 1);
}

#[test]
fn test_presence_and_broadcast_over_the_wire() {
    let (reactor, transport, _) = test_env();
    init_ok(&reactor);
    let slices = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&slices);
    let sub = reactor.subscribe_presence(
        "r1",
        PresenceOpts {
            initial_presence: Some(json!({"name": "me"})),
            ..Default::default()
        },
        Arc::new(move |s: &PresenceResponse| sink.lock().push(s.clone())),
    );
    let heard = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&heard);
    let topic = reactor.subscribe_topic(
        "r1",
        "emoji",
        Arc::new(move |d: &Value, peer: Option<&Value>| sink.lock().push((d.clone(), peer.cloned()))),
    );

    reactor
        .handle_raw(r#"{"op": "join-room-ok", "room-id": "r1"}"#)
        .unwrap();
    reactor
        .handle_raw(
            &json!({
                "op": "refresh-presence",
                "room-id": "r1",
                "data": {"s1": {"data": {"name": "me"}}, "s2": {"data": {"name": "bob"}}}
            })
            .to_string(),
        )
        .unwrap();
    reactor
        .handle_raw(
            &json!({
                "op": "server-broadcast",
                "room-id": "r1",
                "topic": "emoji",
                "data": {"peer-id": "s2", "data": "🎉"}
            })
            .to_string(),
        )
        .unwrap();

    let last = slices.lock().last().cloned().unwrap();
    assert!(!last.is_loading);
    assert_eq!(last.peers.keys().collect::<Vec<_>>(), vec!["s2"]);
    assert_eq!(heard.lock()[0], (json!("🎉"), Some(json!({"name": "bob"}))));

    reactor.handle_socket_closed();
    assert!(slices.lock().last().unwrap().is_loading);

    transport.take();
    sub.unsubscribe();
    assert!(transport.ops().is_empty());
    topic.unsubscribe();
    // Disconnected, so the leave waits for the next join-room-ok.
    assert!(transport.ops().is_empty());
}

// ============================================================================
// Storage
// ============================================================================

#[tokio::test]
async fn test_stored_mutations_resend_after_load() {
    let mut stored = PendingMutations::default();
    stored.insert(
        "stored-1",
        PendingMutation {
            tx_steps: vec![TxStep::add_triple(EntityRef::id("u1"), "a-name", json!("A"))],
            created: 1,
            order: 1,
            tx_id: None,
            confirmed: None,
            error: None,
        },
    );
    let backend = Arc::new(
        MemoryStorage::new().with_item(PENDING_MUTATIONS_KEY, serde_json::to_string(&stored).unwrap()),
    );
    let (reactor, transport, _) = test_env_with(backend);
    init_ok(&reactor);
    transport.take();

    reactor.load_storage().await;
    let sent = transport.transacts();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "stored-1");
    assert_eq!(reactor.pending_mutation_count(), 1);
}

#[tokio::test]
async fn test_flush_persists_pending_queue() {
    let backend = Arc::new(MemoryStorage::new());
    let (reactor, _, _) = test_env_with(Arc::clone(&backend));
    reactor.load_storage().await;
    let receipt = reactor.transact(&[set_name("u1", "A")]);
    assert!(reactor.flush_storage().await >= 1);

    let raw = backend.get_item(PENDING_MUTATIONS_KEY).await.unwrap().unwrap();
    let persisted: PendingMutations = serde_json::from_str(&raw).unwrap();
    assert!(persisted.contains(receipt.event_id()));
}

#[tokio::test]
async fn test_background_tasks_flush_on_shutdown() {
    let backend = Arc::new(MemoryStorage::new());
    let (reactor, _, _) = test_env_with(Arc::clone(&backend));
    reactor.load_storage().await;
    let tasks = reactor.spawn_background();
    let receipt = reactor.transact(&[set_name("u1", "A")]);
    tasks.shutdown().await;

    let raw = backend.raw(PENDING_MUTATIONS_KEY).unwrap();
    assert!(raw.contains(receipt.event_id()));
}
