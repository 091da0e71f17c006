use std::sync::Arc;

use catalog_refresh::config::Config;
use catalog_refresh::error::Result as CatalogResult;
use catalog_refresh::ingest::open_store;
use catalog_refresh::models::{
    DeferredEntity, Entity, EntityRelationSpec, ProcessableEntity, RelationRow,
};
use catalog_refresh::store::{
    ReplaceOptions, StateStore, UpdateProcessedEntityOptions, UpdateProcessedEntityResult,
};
use tempfile::TempDir;

async fn setup() -> (TempDir, Arc<StateStore>) {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("data/catalog.sqlite"));
    let store = open_store(&config).await.unwrap();
    (tmp, store)
}

fn deferred(kind: &str, name: &str, location_key: Option<&str>) -> DeferredEntity {
    DeferredEntity::new(
        Entity::new(kind, None, name),
        location_key.map(str::to_string),
    )
}

async fn apply(store: &StateStore, options: ReplaceOptions) {
    let mut tx = store.pool().begin().await.unwrap();
    store
        .replace_unprocessed_entities(&mut tx, options)
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

async fn replace_full(store: &StateStore, source_key: &str, items: Vec<DeferredEntity>) {
    apply(
        store,
        ReplaceOptions::Full {
            source_key: source_key.to_string(),
            items,
        },
    )
    .await;
}

async fn entity_refs(store: &StateStore) -> Vec<String> {
    sqlx::query_scalar("SELECT entity_ref FROM refresh_state ORDER BY entity_ref")
        .fetch_all(store.pool())
        .await
        .unwrap()
}

async fn claim(store: &StateStore, limit: usize) -> Vec<ProcessableEntity> {
    let mut tx = store.pool().begin().await.unwrap();
    let items = store.get_processable_entities(&mut tx, limit).await.unwrap();
    tx.commit().await.unwrap();
    items
}

async fn claim_ref(store: &StateStore, entity_ref: &str) -> ProcessableEntity {
    claim(store, 100)
        .await
        .into_iter()
        .find(|item| item.entity_ref == entity_ref)
        .unwrap_or_else(|| panic!("{entity_ref} was not due"))
}

async fn complete(
    store: &StateStore,
    item: &ProcessableEntity,
    deferred_entities: &[DeferredEntity],
    relations: &[EntityRelationSpec],
    location_key: Option<&str>,
) -> CatalogResult<UpdateProcessedEntityResult> {
    let mut tx = store.pool().begin().await.unwrap();
    let result = store
        .update_processed_entity(
            &mut tx,
            UpdateProcessedEntityOptions {
                id: &item.id,
                processed_entity: &item.unprocessed_entity,
                result_hash: "hash",
                errors: "[]",
                relations,
                deferred_entities,
                location_key,
            },
        )
        .await;
    if result.is_ok() {
        tx.commit().await.unwrap();
    } else {
        tx.rollback().await.unwrap();
    }
    result
}

#[tokio::test]
async fn test_full_replace_inserts_once_and_is_idempotent() {
    let (_tmp, store) = setup().await;

    let items = vec![
        deferred("Component", "a", Some("file:/a.json")),
        deferred("Component", "b", Some("file:/b.json")),
    ];
    replace_full(&store, "p", items.clone()).await;
    assert_eq!(
        entity_refs(&store).await,
        vec!["component:default/a", "component:default/b"]
    );

    let mut conn = store.pool().acquire().await.unwrap();
    let before = store
        .get_entity(&mut conn, "component:default/a")
        .await
        .unwrap()
        .unwrap();
    drop(conn);

    replace_full(&store, "p", items).await;

    let mut conn = store.pool().acquire().await.unwrap();
    let after = store
        .get_entity(&mut conn, "component:default/a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.entity_id, after.entity_id);
    assert_eq!(before.last_discovery_at, after.last_discovery_at);
    assert_eq!(before.unprocessed_hash, after.unprocessed_hash);
    assert_eq!(store.stats(&mut conn).await.unwrap().references, 2);
}

#[tokio::test]
async fn test_changed_entity_is_rescheduled() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Component", "a", None)]).await;
    assert_eq!(claim(&store, 10).await.len(), 1);
    assert!(claim(&store, 10).await.is_empty());

    let mut changed = deferred("Component", "a", None);
    changed.entity.spec = Some(serde_json::json!({ "lifecycle": "production" }));
    replace_full(&store, "p", vec![changed]).await;

    let items = claim(&store, 10).await;
    assert_eq!(items.len(), 1);
    assert_eq!(
        items[0].unprocessed_entity.spec,
        Some(serde_json::json!({ "lifecycle": "production" }))
    );
}

#[tokio::test]
async fn test_full_replace_removes_entities_no_longer_provided() {
    let (_tmp, store) = setup().await;
    replace_full(
        &store,
        "p",
        vec![deferred("Component", "a", None), deferred("Component", "b", None)],
    )
    .await;
    replace_full(&store, "p", vec![deferred("Component", "a", None)]).await;

    assert_eq!(entity_refs(&store).await, vec!["component:default/a"]);
}

#[tokio::test]
async fn test_delta_adds_and_removes() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Component", "a", None)]).await;

    apply(
        &store,
        ReplaceOptions::Delta {
            source_key: "p".to_string(),
            added: vec![deferred("Component", "c", None)],
            removed: vec![],
        },
    )
    .await;
    assert_eq!(
        entity_refs(&store).await,
        vec!["component:default/a", "component:default/c"]
    );

    apply(
        &store,
        ReplaceOptions::Delta {
            source_key: "p".to_string(),
            added: vec![],
            removed: vec!["component:default/c".to_string()],
        },
    )
    .await;
    assert_eq!(entity_refs(&store).await, vec!["component:default/a"]);
}

#[tokio::test]
async fn test_entity_survives_while_another_source_provides_it() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "one", vec![deferred("Component", "a", None)]).await;
    replace_full(&store, "two", vec![deferred("Component", "a", None)]).await;

    replace_full(&store, "one", vec![]).await;
    assert_eq!(entity_refs(&store).await, vec!["component:default/a"]);

    replace_full(&store, "two", vec![]).await;
    assert!(entity_refs(&store).await.is_empty());
}

#[tokio::test]
async fn test_conflicting_location_key_is_rejected() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "one", vec![deferred("Component", "a", Some("file:/one.json"))]).await;
    replace_full(&store, "two", vec![deferred("Component", "a", Some("file:/two.json"))]).await;

    let mut conn = store.pool().acquire().await.unwrap();
    let entry = store
        .get_entity(&mut conn, "component:default/a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.location_key.as_deref(), Some("file:/one.json"));
    // The rejected source gained no edge.
    assert_eq!(store.stats(&mut conn).await.unwrap().references, 1);
    drop(conn);

    // Removing the owner's edge collects the entity; the loser never held it.
    replace_full(&store, "one", vec![]).await;
    assert!(entity_refs(&store).await.is_empty());
}

#[tokio::test]
async fn test_sole_source_may_move_location() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Component", "a", Some("file:/old.json"))]).await;
    replace_full(&store, "p", vec![deferred("Component", "a", Some("file:/new.json"))]).await;

    let mut conn = store.pool().acquire().await.unwrap();
    let entry = store
        .get_entity(&mut conn, "component:default/a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.location_key.as_deref(), Some("file:/new.json"));
}

#[tokio::test]
async fn test_claim_leases_rows_within_refresh_interval() {
    let (_tmp, store) = setup().await;
    replace_full(
        &store,
        "p",
        vec![
            deferred("Component", "a", None),
            deferred("Component", "b", None),
            deferred("Component", "c", None),
        ],
    )
    .await;

    let before = chrono::Utc::now().timestamp_millis();
    let first = claim(&store, 2).await;
    let second = claim(&store, 2).await;
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert!(claim(&store, 2).await.is_empty());

    for item in first.iter().chain(second.iter()) {
        assert!(item.next_update_at >= before + 100_000);
        assert!(item.next_update_at <= chrono::Utc::now().timestamp_millis() + 150_001);
    }
}

#[tokio::test]
async fn test_ancestry_and_refresh_follow_the_discovery_graph() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Location", "a", None)]).await;

    let a = claim_ref(&store, "location:default/a").await;
    complete(&store, &a, &[deferred("Location", "b", None)], &[], None)
        .await
        .unwrap();
    let b = claim_ref(&store, "location:default/b").await;
    complete(&store, &b, &[deferred("Component", "c", None)], &[], None)
        .await
        .unwrap();
    let _c = claim_ref(&store, "component:default/c").await;

    let mut conn = store.pool().acquire().await.unwrap();
    assert_eq!(
        store
            .list_ancestors(&mut conn, "component:default/c")
            .await
            .unwrap(),
        vec!["location:default/b", "location:default/a"]
    );
    assert_eq!(
        store.list_parents(&mut conn, "component:default/c").await.unwrap(),
        vec!["location:default/b"]
    );
    drop(conn);

    // Nothing is due until a refresh reschedules the entity and its ancestors.
    assert!(claim(&store, 10).await.is_empty());
    let mut tx = store.pool().begin().await.unwrap();
    store.refresh(&mut tx, "component:default/c").await.unwrap();
    tx.commit().await.unwrap();

    let mut due: Vec<String> = claim(&store, 10)
        .await
        .into_iter()
        .map(|item| item.entity_ref)
        .collect();
    due.sort();
    assert_eq!(
        due,
        vec!["component:default/c", "location:default/a", "location:default/b"]
    );
}

#[tokio::test]
async fn test_refresh_of_unknown_entity_is_not_found() {
    let (_tmp, store) = setup().await;
    let mut tx = store.pool().begin().await.unwrap();
    let err = store
        .refresh(&mut tx, "component:default/missing")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_removing_a_root_collects_its_whole_subtree() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "config", vec![deferred("Location", "root", None)]).await;

    let root = claim_ref(&store, "location:default/root").await;
    complete(&store, &root, &[deferred("Component", "comp", None)], &[], None)
        .await
        .unwrap();
    let comp = claim_ref(&store, "component:default/comp").await;
    let relations = vec![EntityRelationSpec::new(
        "component:default/comp",
        "dependsOn",
        "component:default/x",
    )];
    complete(&store, &comp, &[deferred("Component", "x", None)], &relations, None)
        .await
        .unwrap();
    assert_eq!(entity_refs(&store).await.len(), 3);

    replace_full(&store, "config", vec![]).await;

    assert!(entity_refs(&store).await.is_empty());
    let mut conn = store.pool().acquire().await.unwrap();
    let stats = store.stats(&mut conn).await.unwrap();
    assert_eq!(stats.references, 0);
    assert_eq!(stats.relations, 0);
}

#[tokio::test]
async fn test_reprocessing_without_a_child_collects_it() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Location", "root", None)]).await;

    let root = claim_ref(&store, "location:default/root").await;
    complete(
        &store,
        &root,
        &[deferred("Component", "keep", None), deferred("Component", "drop", None)],
        &[],
        None,
    )
    .await
    .unwrap();

    complete(&store, &root, &[deferred("Component", "keep", None)], &[], None)
        .await
        .unwrap();

    assert_eq!(
        entity_refs(&store).await,
        vec!["component:default/keep", "location:default/root"]
    );
}

#[tokio::test]
async fn test_unreachable_cycle_is_collected() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Location", "a", None)]).await;

    let a = claim_ref(&store, "location:default/a").await;
    complete(&store, &a, &[deferred("Location", "b", None)], &[], None)
        .await
        .unwrap();
    let b = claim_ref(&store, "location:default/b").await;
    complete(&store, &b, &[deferred("Location", "a", None)], &[], None)
        .await
        .unwrap();

    let mut conn = store.pool().acquire().await.unwrap();
    assert_eq!(
        store.list_ancestors(&mut conn, "location:default/a").await.unwrap(),
        vec!["location:default/b"]
    );
    drop(conn);

    replace_full(&store, "p", vec![]).await;
    assert!(entity_refs(&store).await.is_empty());
}

#[tokio::test]
async fn test_update_rejects_foreign_location_key() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Component", "a", Some("file:/one.json"))]).await;
    let item = claim_ref(&store, "component:default/a").await;

    let err = complete(&store, &item, &[], &[], Some("file:/two.json"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let mut conn = store.pool().acquire().await.unwrap();
    let entry = store
        .get_entity(&mut conn, "component:default/a")
        .await
        .unwrap()
        .unwrap();
    assert!(entry.processed_entity.is_none());
    drop(conn);

    complete(&store, &item, &[], &[], Some("file:/one.json"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_of_deleted_row_is_not_found() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Component", "a", None)]).await;
    let item = claim_ref(&store, "component:default/a").await;
    replace_full(&store, "p", vec![]).await;

    let err = complete(&store, &item, &[], &[], None).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_relations_are_replaced_and_previous_rows_returned() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Component", "a", None)]).await;
    let item = claim_ref(&store, "component:default/a").await;

    let first = EntityRelationSpec::new("component:default/a", "ownedBy", "group:default/x");
    let second = EntityRelationSpec::new("component:default/a", "ownedBy", "group:default/y");

    let result = complete(&store, &item, &[], &[first.clone(), first.clone()], None)
        .await
        .unwrap();
    assert!(result.previous_relations.is_empty());

    let result = complete(&store, &item, &[], &[second], None).await.unwrap();
    assert_eq!(
        result.previous_relations,
        vec![RelationRow {
            originating_entity_id: item.id.clone(),
            source_entity_ref: "component:default/a".to_string(),
            relation_type: "ownedBy".to_string(),
            target_entity_ref: "group:default/x".to_string(),
        }]
    );

    let mut conn = store.pool().acquire().await.unwrap();
    let rows = store.list_relations(&mut conn, &item.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].target_entity_ref, "group:default/y");
}

#[tokio::test]
async fn test_cache_state_round_trips() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![deferred("Component", "a", None)]).await;
    let item = claim_ref(&store, "component:default/a").await;
    assert!(item.state.is_empty());

    let mut state = catalog_refresh::models::CacheState::default();
    state.ttl = Some(3);
    state
        .entries
        .insert("etag".to_string(), serde_json::json!("abc"));

    let mut tx = store.pool().begin().await.unwrap();
    store
        .update_entity_cache(&mut tx, &item.id, Some(&state))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut conn = store.pool().acquire().await.unwrap();
    let entry = store
        .get_entity(&mut conn, "component:default/a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.cache, state);
}

fn owned(name: &str, owner: &str, location_key: &str) -> DeferredEntity {
    let mut entity = Entity::new("Component", None, name);
    entity.spec = Some(serde_json::json!({ "owner": owner }));
    DeferredEntity::new(entity, Some(location_key.to_string()))
}

async fn spec_owner(store: &StateStore, entity_ref: &str) -> (Option<String>, serde_json::Value) {
    let mut conn = store.pool().acquire().await.unwrap();
    let entry = store
        .get_entity(&mut conn, entity_ref)
        .await
        .unwrap()
        .unwrap();
    let owner = entry
        .unprocessed_entity
        .spec
        .map(|spec| spec["owner"].clone())
        .unwrap_or_default();
    (entry.location_key, owner)
}

#[tokio::test]
async fn test_duplicate_ref_in_one_batch_keeps_the_first_location() {
    let (_tmp, store) = setup().await;
    let batch = vec![
        owned("x", "a", "file:/a.json"),
        owned("x", "b", "file:/b.json"),
    ];

    for round in 0..3 {
        replace_full(&store, "files", batch.clone()).await;
        let claimed = claim(&store, 10).await;
        if round == 0 {
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].location_key.as_deref(), Some("file:/a.json"));
        } else {
            assert!(claimed.is_empty(), "round {round} rescheduled the entity");
        }

        let (location_key, owner) = spec_owner(&store, "component:default/x").await;
        assert_eq!(location_key.as_deref(), Some("file:/a.json"));
        assert_eq!(owner, "a");

        let mut conn = store.pool().acquire().await.unwrap();
        assert_eq!(store.stats(&mut conn).await.unwrap().references, 1);
    }
}

#[tokio::test]
async fn test_repeated_deferred_entity_keeps_one_row_and_one_edge() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "cfg", vec![deferred("Location", "root", None)]).await;
    let root = claim_ref(&store, "location:default/root").await;

    let children = vec![
        deferred("Component", "x", Some("k")),
        deferred("Component", "x", Some("k")),
    ];
    for _ in 0..2 {
        complete(&store, &root, &children, &[], None).await.unwrap();
    }

    let rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM refresh_state WHERE entity_ref = ?")
            .bind("component:default/x")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(rows, 1);

    let edges: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM refresh_state_references WHERE source_entity_ref = ? AND target_entity_ref = ?",
    )
    .bind("location:default/root")
    .bind("component:default/x")
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(edges, 1);

    let mut conn = store.pool().acquire().await.unwrap();
    assert!(store
        .list_parents(&mut conn, "location:default/root")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store
            .list_parents(&mut conn, "component:default/x")
            .await
            .unwrap(),
        vec!["location:default/root"]
    );
}

#[tokio::test]
async fn test_deferred_entity_cannot_claim_a_provided_location() {
    let (_tmp, store) = setup().await;
    replace_full(&store, "p", vec![owned("x", "owner", "file:/owned.json")]).await;
    replace_full(&store, "cfg", vec![deferred("Location", "root", None)]).await;

    let root = claim_ref(&store, "location:default/root").await;
    complete(
        &store,
        &root,
        &[owned("x", "intruder", "file:/other.json")],
        &[],
        None,
    )
    .await
    .unwrap();

    let (location_key, owner) = spec_owner(&store, "component:default/x").await;
    assert_eq!(location_key.as_deref(), Some("file:/owned.json"));
    assert_eq!(owner, "owner");

    let mut conn = store.pool().acquire().await.unwrap();
    assert!(store
        .list_parents(&mut conn, "component:default/x")
        .await
        .unwrap()
        .is_empty());
    let edges: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM refresh_state_references WHERE source_entity_ref = ?",
    )
    .bind("location:default/root")
    .fetch_one(&mut *conn)
    .await
    .unwrap();
    assert_eq!(edges, 0);
}
