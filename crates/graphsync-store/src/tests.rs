//! Store behaviour tests

use super::*;
use serde_json::json;

/// users(id, name, email unique) --posts--> posts(id, title, body)
fn schema() -> AttrsStore {
    let mut email = Attr::blob("a-email", Ident::new("f-email", "users", "email"));
    email.unique = true;
    email.indexed = true;
    let mut posts = Attr::link(
        "a-posts",
        Ident::new("f-posts", "users", "posts"),
        Ident::new("r-posts", "posts", "author"),
    );
    posts.on_delete_reverse = None;
    AttrsStore::new([
        Attr::blob("a-uid", Ident::new("f-uid", "users", "id")),
        Attr::blob("a-name", Ident::new("f-name", "users", "name")),
        email,
        Attr::blob("a-pid", Ident::new("f-pid", "posts", "id")),
        Attr::blob("a-title", Ident::new("f-title", "posts", "title")),
        Attr::blob("a-body", Ident::new("f-body", "posts", "body")),
        posts,
    ])
}

fn add(e: &str, a: &str, v: Value) -> TxStep {
    TxStep::add_triple(EntityRef::id(e), a, v)
}

fn seeded() -> Store {
    Store::new(
        schema(),
        vec![
            Triple::new("u1", "a-uid", json!("u1"), 10),
            Triple::new("u1", "a-name", json!("Alice"), 11),
            Triple::new("u1", "a-email", json!("alice@x.io"), 12),
            Triple::new("p1", "a-pid", json!("p1"), 20),
            Triple::new("p1", "a-title", json!("Hello"), 21),
            Triple::new("u1", "a-posts", json!("p1"), 22),
        ],
        true,
        None,
    )
}

// ============================================================================
// Indexes
// ============================================================================

#[test]
fn test_indexes_mirror_each_other() {
    let store = seeded();
    assert_eq!(store.len(), 6);
    let by_attr = store.get_triples(&TriplePattern::all().attr("a-name"));
    assert_eq!(by_attr.len(), 1);
    assert_eq!(by_attr[0].entity, "u1");
    assert_eq!(store.referrers("p1", "a-posts"), vec!["u1"]);
    // vae only carries refs
    assert!(store.referrers("Alice", "a-name").is_empty());
}

#[test]
fn test_pattern_shapes() {
    let store = seeded();
    assert_eq!(store.get_triples(&TriplePattern::all().entity("u1")).len(), 4);
    assert_eq!(
        store
            .get_triples(&TriplePattern::all().entity("u1").eq(json!("Alice")))
            .len(),
        1
    );
    assert_eq!(
        store
            .get_triples(&TriplePattern::all().value(ValuePattern::In(vec![
                json!("Alice"),
                json!("Hello")
            ])))
            .len(),
        2
    );
    let not_alice = store.get_triples(
        &TriplePattern::all()
            .attr("a-name")
            .value(ValuePattern::Not(json!("Alice"))),
    );
    assert!(not_alice.is_empty());

    let linked_posts_with_title = store.get_triples(
        &TriplePattern::all().attr("a-posts").value(ValuePattern::IsNull {
            attr_id: "a-title".to_string(),
            is_null: false,
            reverse: false,
        }),
    );
    assert_eq!(linked_posts_with_title.len(), 1);
}

#[test]
fn test_comparator_pattern() {
    let mut attrs = schema();
    attrs.add(Attr::blob("a-age", Ident::new("f-age", "users", "age")));
    let store = Store::new(
        attrs,
        vec![
            Triple::new("u1", "a-age", json!(30), 1),
            Triple::new("u2", "a-age", json!(18), 2),
        ],
        false,
        None,
    );
    let adults = store.get_triples(
        &TriplePattern::all()
            .attr("a-age")
            .value(ValuePattern::Compare(Comparator::Gte, json!(21))),
    );
    assert_eq!(adults.len(), 1);
    assert_eq!(adults[0].entity, "u1");
}

// ============================================================================
// Transact
// ============================================================================

#[test]
fn test_transact_leaves_parent_untouched() {
    let base = seeded();
    let next = base.transact(&[add("u1", "a-name", json!("Bob"))]).unwrap();
    assert!(base.has_triple("u1", "a-name", &json!("Alice")));
    assert!(next.has_triple("u1", "a-name", &json!("Bob")));
    assert!(!next.has_triple("u1", "a-name", &json!("Alice")));
}

#[test]
fn test_cardinality_one_update_keeps_created_at() {
    let store = seeded()
        .transact(&[add("u1", "a-name", json!("Bob"))])
        .unwrap();
    let triples = store.get_triples(&TriplePattern::all().entity("u1").attr("a-name"));
    assert_eq!(triples.len(), 1);
    assert_eq!(triples[0].created_at, 11);
}

#[test]
fn test_new_triples_sort_after_server_triples() {
    let store = seeded()
        .transact(&[add("u2", "a-uid", json!("u2"))])
        .unwrap();
    let t = &store.get_triples(&TriplePattern::all().entity("u2"))[0];
    assert!(t.created_at > 22);
}

#[test]
fn test_unknown_attr_is_silent_noop() {
    let base = seeded();
    let next = base
        .transact(&[add("u1", "a-missing", json!(1))])
        .unwrap();
    assert_eq!(next.all_triples(), base.all_triples());
}

#[test]
fn test_lookup_ref_resolution() {
    let next = seeded()
        .transact(&[TxStep::add_triple(
            EntityRef::lookup("a-email", json!("alice@x.io")),
            "a-name",
            json!("Alicia"),
        )])
        .unwrap();
    assert!(next.has_triple("u1", "a-name", &json!("Alicia")));
}

#[test]
fn test_unresolved_lookup_drops_step() {
    let base = seeded();
    let next = base
        .transact(&[TxStep::add_triple(
            EntityRef::lookup("a-email", json!("nobody@x.io")),
            "a-name",
            json!("Ghost"),
        )])
        .unwrap();
    assert_eq!(next.len(), base.len());
}

#[test]
fn test_value_lookup_on_link() {
    let next = seeded()
        .transact(&[
            add("p2", "a-pid", json!("p2")),
            add("u1", "a-posts", json!(["a-pid", "p2"])),
        ])
        .unwrap();
    assert!(next.has_triple("u1", "a-posts", &json!("p2")));
    assert_eq!(next.referrers("p2", "a-posts"), vec!["u1"]);
}

#[test]
fn test_retract_removes_from_all_indexes() {
    let next = seeded()
        .transact(&[TxStep::retract_triple(
            EntityRef::id("u1"),
            "a-posts",
            json!("p1"),
        )])
        .unwrap();
    assert!(next.referrers("p1", "a-posts").is_empty());
    assert!(next
        .get_triples(&TriplePattern::all().attr("a-posts"))
        .is_empty());
}

#[test]
fn test_deep_merge_triple() {
    let mut attrs = schema();
    attrs.add(Attr::blob("a-prefs", Ident::new("f-prefs", "users", "prefs")));
    let store = Store::new(
        attrs,
        vec![Triple::new("u1", "a-prefs", json!({"theme": "dark", "lang": "en"}), 5)],
        false,
        None,
    );
    let merge = TxStep::DeepMergeTriple {
        entity: EntityRef::id("u1"),
        attr_id: "a-prefs".to_string(),
        value: json!({"lang": null, "font": "mono"}),
        opts: None,
    };
    let next = store.transact(&[merge]).unwrap();
    assert_eq!(next.values("u1", "a-prefs"), vec![&json!({"theme": "dark", "font": "mono"})]);

    // no current value: no-op
    let merge_missing = TxStep::DeepMergeTriple {
        entity: EntityRef::id("u2"),
        attr_id: "a-prefs".to_string(),
        value: json!({"a": 1}),
        opts: None,
    };
    assert!(!next.transact(&[merge_missing]).unwrap().has_entity("u2"));
}

#[test]
fn test_deep_merge_on_ref_fails() {
    let merge = TxStep::DeepMergeTriple {
        entity: EntityRef::id("u1"),
        attr_id: "a-posts".to_string(),
        value: json!({"x": 1}),
        opts: None,
    };
    let err = seeded().transact(&[merge]).unwrap_err();
    assert!(matches!(err, StoreError::MergeOnRef { .. }));
}

#[test]
fn test_write_modes() {
    let store = seeded();
    let create_existing = TxStep::AddTriple {
        entity: EntityRef::id("u1"),
        attr_id: "a-name".to_string(),
        value: json!("Clobbered"),
        opts: Some(TripleOpts::mode(WriteMode::Create)),
    };
    let update_missing = TxStep::AddTriple {
        entity: EntityRef::id("u9"),
        attr_id: "a-name".to_string(),
        value: json!("Nobody"),
        opts: Some(TripleOpts::mode(WriteMode::Update)),
    };
    let next = store.transact(&[create_existing, update_missing]).unwrap();
    assert!(next.has_triple("u1", "a-name", &json!("Alice")));
    assert!(!next.has_entity("u9"));
}

#[test]
fn test_delete_entity_removes_reverse_links() {
    let next = seeded()
        .transact(&[TxStep::DeleteEntity {
            entity: EntityRef::id("p1"),
            etype: Some("posts".to_string()),
        }])
        .unwrap();
    assert!(!next.has_entity("p1"));
    assert!(!next.has_triple("u1", "a-posts", &json!("p1")));
    assert!(next.has_entity("u1"));
}

#[test]
fn test_delete_entity_cascades() {
    let mut attrs = schema();
    let mut posts = attrs.get("a-posts").cloned().unwrap();
    posts.on_delete_reverse = Some(OnDelete::Cascade);
    attrs.add(posts);
    let store = Store::new(attrs, seeded().all_triples(), false, None);
    let next = store
        .transact(&[TxStep::DeleteEntity {
            entity: EntityRef::id("u1"),
            etype: Some("users".to_string()),
        }])
        .unwrap();
    assert!(!next.has_entity("u1"));
    assert!(!next.has_entity("p1"));
}

#[test]
fn test_schema_steps_rebuild_indexes() {
    let store = seeded();
    let next = store
        .transact(&[TxStep::DeleteAttr("a-title".to_string())])
        .unwrap();
    assert!(next.attrs().get("a-title").is_none());
    assert!(next.get_triples(&TriplePattern::all().attr("a-title")).is_empty());
    assert!(store.attrs().get("a-title").is_some());

    let patch = AttrPatch {
        id: "a-name".to_string(),
        unique: Some(true),
        ..Default::default()
    };
    let next = store.transact(&[TxStep::UpdateAttr(patch)]).unwrap();
    assert!(next.attrs().get("a-name").unwrap().unique);
    assert_eq!(next.len(), store.len());
}

#[test]
fn test_json_snapshot_reload() {
    let store = seeded();
    let json = serde_json::to_value(store.to_json()).unwrap();
    assert_eq!(json["version"], 1);
    let reloaded = Store::from_json(serde_json::from_value(json).unwrap()).unwrap();
    assert_eq!(reloaded.all_triples(), store.all_triples());
    assert_eq!(reloaded.attrs(), store.attrs());
    assert!(reloaded.cardinality_inference());
}

// ============================================================================
// Query
// ============================================================================

#[test]
fn test_query_with_links_and_where() {
    let store = seeded();
    let result = query::evaluate(
        &store,
        &json!({"users": {"$": {"where": {"name": "Alice"}}, "posts": {}}}),
    )
    .unwrap();
    assert_eq!(
        result,
        json!({"users": [{
            "id": "u1",
            "name": "Alice",
            "email": "alice@x.io",
            "posts": [{"id": "p1", "title": "Hello"}]
        }]})
    );
}

#[test]
fn test_query_reverse_link_is_singular_with_link_index() {
    let mut link_index = LinkIndex::new();
    link_index.entry("posts".to_string()).or_default().insert(
        "author".to_string(),
        LinkInfo {
            is_singular: true,
            ..Default::default()
        },
    );
    let store = Store::new(schema(), seeded().all_triples(), true, Some(link_index));
    let result = query::evaluate(&store, &json!({"posts": {"author": {}}})).unwrap();
    assert_eq!(result["posts"][0]["author"]["id"], "u1");
}

#[test]
fn test_query_order_and_limit() {
    let store = seeded()
        .transact(&[add("u2", "a-uid", json!("u2")), add("u3", "a-uid", json!("u3"))])
        .unwrap();
    let result = query::evaluate(
        &store,
        &json!({"users": {"$": {"order": {"serverCreatedAt": "desc"}, "limit": 2}}}),
    )
    .unwrap();
    let ids: Vec<&str> = result["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["u3", "u2"]);
}

#[test]
fn test_query_unknown_namespace_is_empty() {
    let result = query::evaluate(&seeded(), &json!({"widgets": {}})).unwrap();
    assert_eq!(result, json!({"widgets": []}));
}

#[test]
fn test_query_operators() {
    let store = seeded();
    let q = |w: Value| {
        query::evaluate(&store, &json!({"users": {"$": {"where": w}}})).unwrap()["users"]
            .as_array()
            .unwrap()
            .len()
    };
    assert_eq!(q(json!({"name": {"$in": ["Alice", "Bob"]}})), 1);
    assert_eq!(q(json!({"name": {"$not": "Alice"}})), 0);
    assert_eq!(q(json!({"nickname": {"$isNull": true}})), 1);
    assert_eq!(q(json!({"name": {"$gt": "Aa"}})), 1);
    assert_eq!(q(json!({"or": [{"name": "Bob"}, {"id": "u1"}]})), 1);
}
