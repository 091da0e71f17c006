use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index used by the engine. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // One row per logical entity
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS refresh_state (
            entity_id TEXT PRIMARY KEY,
            entity_ref TEXT NOT NULL UNIQUE,
            unprocessed_entity TEXT NOT NULL,
            unprocessed_hash TEXT NOT NULL,
            processed_entity TEXT,
            result_hash TEXT,
            cache TEXT NOT NULL DEFAULT '{}',
            errors TEXT NOT NULL DEFAULT '',
            location_key TEXT,
            next_update_at INTEGER NOT NULL,
            last_discovery_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Discovery graph: exactly one of source_key / source_entity_ref is set
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS refresh_state_references (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_key TEXT,
            source_entity_ref TEXT REFERENCES refresh_state(entity_ref) ON DELETE CASCADE,
            target_entity_ref TEXT NOT NULL,
            CHECK ((source_key IS NULL) <> (source_entity_ref IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relations (
            originating_entity_id TEXT NOT NULL REFERENCES refresh_state(entity_id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            source_entity_ref TEXT NOT NULL,
            target_entity_ref TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS final_entities (
            entity_id TEXT PRIMARY KEY REFERENCES refresh_state(entity_id) ON DELETE CASCADE,
            entity_ref TEXT NOT NULL UNIQUE,
            final_entity TEXT NOT NULL,
            hash TEXT NOT NULL,
            stitched_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_refresh_state_next_update_at ON refresh_state(next_update_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_references_source_key
        ON refresh_state_references(source_key, target_entity_ref)
        WHERE source_key IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_references_source_entity_ref
        ON refresh_state_references(source_entity_ref, target_entity_ref)
        WHERE source_entity_ref IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_references_target ON refresh_state_references(target_entity_ref)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relations_originating ON relations(originating_entity_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_entity_ref)")
        .execute(pool)
        .await?;

    Ok(())
}
