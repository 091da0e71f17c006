use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use catalog_refresh::config::{Config, FileProviderConfig};
use catalog_refresh::connector_fs::FileEntityProvider;
use catalog_refresh::events::ProcessingOutcome;
use catalog_refresh::ingest::{build_engine, open_store, run_process};
use catalog_refresh::models::{DeferredEntity, Entity};
use catalog_refresh::providers::{connect_entity_providers, ProviderConnection};
use catalog_refresh::stitcher::get_final_entity;
use catalog_refresh::store::{ReplaceOptions, StateStore};
use catalog_refresh::traits::{EntityProvider, EntityProviderConnection, EntityProviderMutation};
use tempfile::TempDir;

fn write_catalog(root: &Path) {
    fs::create_dir_all(root.join("targets")).unwrap();
    fs::write(
        root.join("root.json"),
        r#"{
            "apiVersion": "catalog.io/v1alpha1",
            "kind": "Location",
            "metadata": { "name": "root" },
            "spec": { "targets": ["targets/components.json"] }
        }"#,
    )
    .unwrap();
    fs::write(
        root.join("targets/components.json"),
        r#"[
            {
                "apiVersion": "catalog.io/v1alpha1",
                "kind": "Component",
                "metadata": { "name": "api" },
                "spec": { "owner": "team-a", "dependsOn": ["db"] }
            },
            {
                "apiVersion": "catalog.io/v1alpha1",
                "kind": "Component",
                "metadata": { "name": "db" },
                "spec": { "owner": "team-a" }
            }
        ]"#,
    )
    .unwrap();
}

fn setup() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let catalog = tmp.path().join("catalog");
    write_catalog(&catalog);

    let mut config = Config::minimal(tmp.path().join("data/catalog.sqlite"));
    config.providers.file.push(FileProviderConfig {
        name: "local".to_string(),
        root: catalog,
        include_globs: vec!["**/*.json".to_string()],
        exclude_globs: vec!["targets/**".to_string()],
        follow_symlinks: false,
        rescan_interval_secs: 0,
    });
    (tmp, config)
}

async fn entity_count(store: &StateStore) -> i64 {
    let mut conn = store.pool().acquire().await.unwrap();
    store.stats(&mut conn).await.unwrap().entities
}

#[tokio::test]
async fn test_file_catalog_is_processed_and_stitched() {
    let (_tmp, config) = setup();
    let store = open_store(&config).await.unwrap();

    let provider = Arc::new(FileEntityProvider::new(config.providers.file[0].clone()));
    let providers: Vec<Arc<dyn EntityProvider>> = vec![provider.clone()];
    connect_entity_providers(Arc::clone(&store), &providers)
        .await
        .unwrap();
    assert_eq!(entity_count(&store).await, 1);

    let engine = build_engine(&config, Arc::clone(&store));
    let mut rounds = 0;
    while !engine.process_batch(10).await.unwrap().is_empty() {
        rounds += 1;
        assert!(rounds < 10, "processing did not settle");
    }
    assert_eq!(entity_count(&store).await, 3);

    let api = get_final_entity(store.pool(), "component:default/api")
        .await
        .unwrap()
        .expect("api was stitched");
    let relations = api["relations"].as_array().unwrap();
    assert!(relations.iter().any(|r| {
        r["type"] == "ownedBy" && r["targetRef"] == "group:default/team-a"
    }));
    assert!(relations.iter().any(|r| {
        r["type"] == "dependsOn" && r["targetRef"] == "component:default/db"
    }));
    // Reverse relation from db, emitted while processing api.
    let db = get_final_entity(store.pool(), "component:default/db")
        .await
        .unwrap()
        .unwrap();
    assert!(db["relations"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r["type"] == "dependencyOf" && r["targetRef"] == "component:default/api"));

    let mut conn = store.pool().acquire().await.unwrap();
    assert_eq!(
        store
            .list_ancestors(&mut conn, "component:default/api")
            .await
            .unwrap(),
        vec!["location:default/root"]
    );
    drop(conn);

    // Removing the location file removes everything it led to.
    fs::remove_file(config.providers.file[0].root.join("root.json")).unwrap();
    assert_eq!(provider.rescan().await.unwrap(), 0);
    assert_eq!(entity_count(&store).await, 0);
    assert!(get_final_entity(store.pool(), "component:default/api")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_processing_errors_surface_in_final_entity_status() {
    let (tmp, config) = setup();
    fs::write(
        tmp.path().join("catalog/root.json"),
        r#"{
            "apiVersion": "catalog.io/v1alpha1",
            "kind": "Location",
            "metadata": { "name": "root" },
            "spec": { "targets": ["missing.json"] }
        }"#,
    )
    .unwrap();
    let store = open_store(&config).await.unwrap();
    let providers: Vec<Arc<dyn EntityProvider>> = vec![Arc::new(FileEntityProvider::new(
        config.providers.file[0].clone(),
    ))];
    connect_entity_providers(Arc::clone(&store), &providers)
        .await
        .unwrap();

    let engine = build_engine(&config, Arc::clone(&store));
    assert_eq!(
        engine.process_batch(10).await.unwrap(),
        vec![ProcessingOutcome::Failed]
    );

    let root = get_final_entity(store.pool(), "location:default/root")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        root["status"]["items"][0]["error"]["name"],
        "NotFoundError"
    );
}

#[tokio::test]
async fn test_rescan_requires_connection() {
    let (_tmp, config) = setup();
    let provider = FileEntityProvider::new(config.providers.file[0].clone());
    assert!(provider.rescan().await.is_err());
}

struct NamedProvider(&'static str);

#[async_trait]
impl EntityProvider for NamedProvider {
    fn provider_name(&self) -> &str {
        self.0
    }

    async fn connect(&self, connection: Arc<dyn EntityProviderConnection>) -> Result<()> {
        connection
            .apply_mutation(EntityProviderMutation::Full {
                entities: vec![DeferredEntity::new(
                    Entity::new("Group", None, self.0),
                    None,
                )],
            })
            .await
    }
}

#[tokio::test]
async fn test_duplicate_provider_names_are_rejected() {
    let (_tmp, config) = setup();
    let store = open_store(&config).await.unwrap();
    let providers: Vec<Arc<dyn EntityProvider>> =
        vec![Arc::new(NamedProvider("dup")), Arc::new(NamedProvider("dup"))];

    assert!(connect_entity_providers(Arc::clone(&store), &providers)
        .await
        .is_err());
    assert_eq!(entity_count(&store).await, 0);
}

#[tokio::test]
async fn test_connection_applies_delta_and_rejects_invalid_entities() {
    let (_tmp, config) = setup();
    let store = open_store(&config).await.unwrap();
    let connection = ProviderConnection::new(Arc::clone(&store), "manual");
    assert_eq!(connection.source_key(), "manual");

    connection
        .apply_mutation(EntityProviderMutation::Delta {
            added: vec![DeferredEntity::new(Entity::new("Group", None, "ops"), None)],
            removed: vec![],
        })
        .await
        .unwrap();
    assert_eq!(entity_count(&store).await, 1);

    let invalid = EntityProviderMutation::Full {
        entities: vec![DeferredEntity::new(Entity::new("", None, "nameless"), None)],
    };
    assert!(connection.apply_mutation(invalid).await.is_err());
    assert_eq!(entity_count(&store).await, 1);

    connection
        .apply_mutation(EntityProviderMutation::Delta {
            added: vec![],
            removed: vec!["group:default/ops".to_string()],
        })
        .await
        .unwrap();
    assert_eq!(entity_count(&store).await, 0);

    assert!(connection.refresh("group:default/ops").await.is_err());
}

#[tokio::test]
async fn test_process_until_idle_handles_more_entities_than_the_event_buffer() {
    let (_tmp, mut config) = setup();
    config.providers.file.clear();
    config.processing.high_watermark = 100;
    let store = open_store(&config).await.unwrap();

    let items = (0..1100)
        .map(|i| DeferredEntity::new(Entity::new("Component", None, &format!("c{i}")), None))
        .collect();
    let mut tx = store.pool().begin().await.unwrap();
    store
        .replace_unprocessed_entities(
            &mut tx,
            ReplaceOptions::Full {
                source_key: "bulk".to_string(),
                items,
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    tokio::time::timeout(Duration::from_secs(60), run_process(&config, true))
        .await
        .expect("process --until-idle did not finish")
        .unwrap();

    let mut conn = store.pool().acquire().await.unwrap();
    let stats = store.stats(&mut conn).await.unwrap();
    assert_eq!(stats.processed, 1100);
    assert_eq!(stats.due, 0);
}
