//! SQLite-backed stitcher.
//!
//! Produces the externally visible form of an entity in `final_entities`:
//! the processed entity (or the raw one while it has never been processed),
//! its outgoing relations from every originating entity, and its processing
//! errors as `status.items`.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::hash::stable_hash;
use crate::models::{Entity, ProcessingError};
use crate::store::now_millis;
use crate::traits::Stitcher;

pub struct SqliteStitcher {
    pool: SqlitePool,
}

impl SqliteStitcher {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Stitcher for SqliteStitcher {
    async fn stitch(&self, entity_refs: &BTreeSet<String>) -> Result<()> {
        // Autocommit statements; a read-then-write transaction could fail
        // with SQLITE_BUSY while sibling tasks stitch concurrently.
        let mut conn = self.pool.acquire().await?;
        for entity_ref in entity_refs {
            stitch_one(&mut conn, entity_ref).await?;
        }
        Ok(())
    }
}

async fn stitch_one(conn: &mut SqliteConnection, entity_ref: &str) -> Result<()> {
    let row = sqlx::query(
        r#"
        SELECT entity_id, unprocessed_entity, processed_entity, errors
        FROM refresh_state WHERE entity_ref = ?
        "#,
    )
    .bind(entity_ref)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        sqlx::query("DELETE FROM final_entities WHERE entity_ref = ?")
            .bind(entity_ref)
            .execute(&mut *conn)
            .await?;
        debug!(entity_ref, "removed final entity without refresh state");
        return Ok(());
    };

    let entity_id: String = row.try_get("entity_id")?;
    let processed: Option<String> = row.try_get("processed_entity")?;
    let unprocessed: String = row.try_get("unprocessed_entity")?;
    let errors: String = row.try_get("errors")?;

    let entity: Entity = serde_json::from_str(processed.as_deref().unwrap_or(&unprocessed))?;

    let relations: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT DISTINCT type, target_entity_ref FROM relations
        WHERE source_entity_ref = ?
        ORDER BY type, target_entity_ref
        "#,
    )
    .bind(entity_ref)
    .fetch_all(&mut *conn)
    .await?;

    let final_entity = build_final_entity(entity, &entity_id, &relations, &errors)?;
    let hash = stable_hash(&final_entity)?;

    let previous: Option<String> =
        sqlx::query_scalar("SELECT hash FROM final_entities WHERE entity_id = ?")
            .bind(&entity_id)
            .fetch_optional(&mut *conn)
            .await?;
    if previous.as_deref() == Some(hash.as_str()) {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO final_entities (entity_id, entity_ref, final_entity, hash, stitched_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            entity_ref = excluded.entity_ref,
            final_entity = excluded.final_entity,
            hash = excluded.hash,
            stitched_at = excluded.stitched_at
        "#,
    )
    .bind(&entity_id)
    .bind(entity_ref)
    .bind(serde_json::to_string(&final_entity)?)
    .bind(&hash)
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;

    debug!(entity_ref, "stitched entity");
    Ok(())
}

fn build_final_entity(
    mut entity: Entity,
    entity_id: &str,
    relations: &[(String, String)],
    errors: &str,
) -> Result<Value> {
    entity.metadata.uid = Some(entity_id.to_string());

    let mut value = serde_json::to_value(&entity)?;
    let relations: Vec<Value> = relations
        .iter()
        .map(|(relation_type, target)| json!({ "type": relation_type, "targetRef": target }))
        .collect();
    value["relations"] = Value::Array(relations);

    let errors: Vec<ProcessingError> = if errors.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(errors)?
    };
    if !errors.is_empty() {
        let items: Vec<Value> = errors
            .iter()
            .map(|error| {
                json!({
                    "type": "catalog.io/ProcessingError",
                    "level": "error",
                    "message": format!("{}: {}", error.name, error.message),
                    "error": { "name": error.name, "message": error.message },
                })
            })
            .collect();
        value["status"] = json!({ "items": items });
    }

    Ok(value)
}

/// Read the stitched form of an entity, if it has one.
pub async fn get_final_entity(pool: &SqlitePool, entity_ref: &str) -> Result<Option<Value>> {
    let stored: Option<String> =
        sqlx::query_scalar("SELECT final_entity FROM final_entities WHERE entity_ref = ?")
            .bind(entity_ref)
            .fetch_optional(pool)
            .await?;
    Ok(stored.as_deref().map(serde_json::from_str).transpose()?)
}
