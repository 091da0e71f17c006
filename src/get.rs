//! Entity lookup commands.
//!
//! `catalog get` prints the stitched entity together with its refresh
//! state; `catalog ancestors` walks the discovery graph upwards;
//! `catalog refresh` schedules an entity and its ancestors for immediate
//! processing.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::ingest::open_store;
use crate::models::{parse_entity_ref, Entity, DEFAULT_NAMESPACE};
use crate::stitcher::get_final_entity;

/// Everything known about one entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityResponse {
    pub entity_id: String,
    pub entity_ref: String,
    pub location_key: Option<String>,
    pub next_update_at: String, // ISO8601
    pub last_discovery_at: String, // ISO8601
    pub errors: serde_json::Value,
    pub parents: Vec<String>,
    pub entity: serde_json::Value,
    pub stitched: bool,
}

/// Accepts `kind:namespace/name` or `kind:name`.
fn normalize_ref(input: &str) -> Result<String> {
    Ok(parse_entity_ref(input, None, DEFAULT_NAMESPACE)?.to_string())
}

fn format_ts_iso(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

/// Core get function returning structured data.
pub async fn get_entity(config: &Config, entity_ref: &str) -> Result<EntityResponse> {
    let entity_ref = normalize_ref(entity_ref)?;
    let store = open_store(config).await?;
    let mut conn = store.pool().acquire().await?;

    let Some(entry) = store.get_entity(&mut conn, &entity_ref).await? else {
        drop(conn);
        store.pool().close().await;
        bail!("entity not found: {}", entity_ref);
    };
    let parents = store.list_parents(&mut conn, &entity_ref).await?;
    let stitched = get_final_entity(store.pool(), &entity_ref).await?;
    drop(conn);
    store.pool().close().await;

    let errors = match entry.errors.as_deref() {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::json!([]),
    };
    let is_stitched = stitched.is_some();
    let entity = match stitched {
        Some(value) => value,
        None => {
            let entity: Entity = entry.processed_entity.unwrap_or(entry.unprocessed_entity);
            serde_json::to_value(entity)?
        }
    };

    Ok(EntityResponse {
        entity_id: entry.entity_id,
        entity_ref: entry.entity_ref,
        location_key: entry.location_key,
        next_update_at: format_ts_iso(entry.next_update_at),
        last_discovery_at: format_ts_iso(entry.last_discovery_at),
        errors,
        parents,
        entity,
        stitched: is_stitched,
    })
}

/// CLI entry point: prints the entity as JSON.
pub async fn run_get(config: &Config, entity_ref: &str) -> Result<()> {
    let response = get_entity(config, entity_ref).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

pub async fn run_ancestors(config: &Config, entity_ref: &str) -> Result<()> {
    let entity_ref = normalize_ref(entity_ref)?;
    let store = open_store(config).await?;
    let ancestors = {
        let mut conn = store.pool().acquire().await?;
        store.list_ancestors(&mut conn, &entity_ref).await?
    };
    store.pool().close().await;

    if ancestors.is_empty() {
        println!("{} has no ancestors", entity_ref);
    } else {
        for ancestor in ancestors {
            println!("{}", ancestor);
        }
    }
    Ok(())
}

pub async fn run_refresh(config: &Config, entity_ref: &str) -> Result<()> {
    let entity_ref = normalize_ref(entity_ref)?;
    let store = open_store(config).await?;
    let mut tx = store.pool().begin().await?;
    store.refresh(&mut tx, &entity_ref).await?;
    tx.commit().await?;
    store.pool().close().await;

    println!("scheduled {} and its ancestors for refresh", entity_ref);
    Ok(())
}
