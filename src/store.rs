//! Durable refresh state, discovery graph and relations.
//!
//! [`StateStore`] owns every SQL statement that touches `refresh_state`,
//! `refresh_state_references` and `relations`. All operations take a caller
//! supplied connection, normally a `sqlx::Transaction`, so that a multi-row
//! change (edge replacement plus garbage collection, conflict check plus
//! relation replacement) commits or rolls back as one unit.
//!
//! # Discovery graph
//!
//! ```text
//!  source_key ──▶ entity ──▶ deferred entity ──▶ ...
//!  (provider)     (edge from source_entity_ref)
//! ```
//!
//! An entity lives as long as it is reachable from some provider's source
//! key. Whenever edges are withdrawn, garbage collection deletes
//! everything that lost its last anchor, including sub-graphs that only
//! reference each other.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProcessingConfig;
use crate::error::{CatalogError, Result};
use crate::hash::stable_hash;
use crate::models::{
    CacheState, DeferredEntity, Entity, EntityRelationSpec, ProcessableEntity, RefreshStateEntry,
    RelationRow,
};

/// Lease bounds applied when a row is claimed for processing.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub refresh_interval_min_secs: u64,
    pub refresh_interval_max_secs: u64,
}

impl StoreOptions {
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            refresh_interval_min_secs: config.refresh_interval_min_secs,
            refresh_interval_max_secs: config.refresh_interval_max_secs,
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

/// How a provider replaces the set of entities it vouches for.
#[derive(Debug, Clone)]
pub enum ReplaceOptions {
    /// The complete current set from `source_key`.
    Full {
        source_key: String,
        items: Vec<DeferredEntity>,
    },
    /// Incremental changes; `removed` holds entity refs.
    Delta {
        source_key: String,
        added: Vec<DeferredEntity>,
        removed: Vec<String>,
    },
}

/// Payload of a successful processing run.
#[derive(Debug, Clone, Copy)]
pub struct UpdateProcessedEntityOptions<'a> {
    pub id: &'a str,
    pub processed_entity: &'a Entity,
    pub result_hash: &'a str,
    pub errors: &'a str,
    pub relations: &'a [EntityRelationSpec],
    pub deferred_entities: &'a [DeferredEntity],
    pub location_key: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateProcessedEntityResult {
    /// Relation rows that were replaced by this update.
    pub previous_relations: Vec<RelationRow>,
}

/// Row counts reported by `catalog stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entities: i64,
    pub processed: i64,
    pub with_errors: i64,
    pub due: i64,
    pub references: i64,
    pub relations: i64,
}

/// The origin of a discovery edge.
#[derive(Debug, Clone, Copy)]
enum EdgeSource<'a> {
    Key(&'a str),
    Entity(&'a str),
}

impl<'a> EdgeSource<'a> {
    fn column(&self) -> &'static str {
        match self {
            EdgeSource::Key(_) => "source_key",
            EdgeSource::Entity(_) => "source_entity_ref",
        }
    }

    fn value(&self) -> &'a str {
        match self {
            EdgeSource::Key(value) | EdgeSource::Entity(value) => value,
        }
    }

    fn source_key(&self) -> Option<&'a str> {
        match self {
            EdgeSource::Key(key) => Some(key),
            EdgeSource::Entity(_) => None,
        }
    }

    fn source_entity_ref(&self) -> Option<&'a str> {
        match self {
            EdgeSource::Key(_) => None,
            EdgeSource::Entity(entity_ref) => Some(entity_ref),
        }
    }
}

impl fmt::Display for EdgeSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeSource::Key(key) => write!(f, "source '{key}'"),
            EdgeSource::Entity(entity_ref) => write!(f, "entity '{entity_ref}'"),
        }
    }
}

#[derive(Debug)]
enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    Conflict { existing_location_key: String },
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_cache(raw: &str) -> CacheState {
    if raw.trim().is_empty() {
        return CacheState::default();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

/// SQLite-backed state store shared by the engine and the provider bridge.
pub struct StateStore {
    pool: SqlitePool,
    options: StoreOptions,
}

impl StateStore {
    pub fn new(pool: SqlitePool, options: StoreOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ─── Provider writes ────────────────────────────────────────────

    /// Replace the entities asserted by a provider.
    ///
    /// New entities are inserted and scheduled immediately; unchanged ones
    /// are left untouched. Entities claimed by a different location are
    /// rejected with a warning and keep their stored content. Edges the
    /// source no longer asserts are removed and orphans garbage-collected.
    pub async fn replace_unprocessed_entities(
        &self,
        conn: &mut SqliteConnection,
        options: ReplaceOptions,
    ) -> Result<()> {
        match options {
            ReplaceOptions::Full { source_key, items } => {
                let source = EdgeSource::Key(&source_key);
                let deleted = self.replace_edges_from(conn, source, &items).await?;
                debug!(
                    source_key = %source_key,
                    items = items.len(),
                    deleted,
                    "applied full replace"
                );
            }
            ReplaceOptions::Delta {
                source_key,
                added,
                removed,
            } => {
                let source = EdgeSource::Key(&source_key);
                self.assert_entities(conn, source, &added).await?;
                self.remove_edges(conn, source, &removed).await?;
                let deleted = self.collect_garbage(conn, removed.clone()).await?;
                debug!(
                    source_key = %source_key,
                    added = added.len(),
                    removed = removed.len(),
                    deleted,
                    "applied delta"
                );
            }
        }
        Ok(())
    }

    /// Upsert `items`, assert an edge from `source` to each of them, then
    /// drop every other edge from `source`. Returns the number of entities
    /// garbage-collected as a result.
    async fn replace_edges_from(
        &self,
        conn: &mut SqliteConnection,
        source: EdgeSource<'_>,
        items: &[DeferredEntity],
    ) -> Result<u64> {
        let asserted = self.assert_entities(conn, source, items).await?;

        let previous = self.list_targets(conn, source).await?;
        let stale: Vec<String> = previous
            .into_iter()
            .filter(|entity_ref| !asserted.contains(entity_ref))
            .collect();

        self.remove_edges(conn, source, &stale).await?;
        self.collect_garbage(conn, stale).await
    }

    /// Upsert each item and its edge from `source`. Returns the refs for
    /// which an edge now exists.
    async fn assert_entities(
        &self,
        conn: &mut SqliteConnection,
        source: EdgeSource<'_>,
        items: &[DeferredEntity],
    ) -> Result<HashSet<String>> {
        let mut asserted = HashSet::new();
        // Location key of each ref already asserted by this call.
        let mut claimed: HashMap<String, Option<String>> = HashMap::new();

        for item in items {
            if let Err(e) = item.entity.validate_envelope() {
                warn!(%source, error = %e, "skipping invalid entity");
                continue;
            }
            let entity_ref = item.entity.entity_ref();
            if source.source_entity_ref() == Some(entity_ref.as_str()) {
                warn!(entity_ref = %entity_ref, "entity emitted itself; ignoring");
                continue;
            }

            // Two locations in one batch never take over from each other;
            // the first one asserted keeps the entity.
            if let Some(Some(first_key)) = claimed.get(&entity_ref) {
                if let Some(incoming) = item.location_key.as_deref() {
                    if incoming != first_key.as_str() {
                        warn!(
                            entity_ref = %entity_ref,
                            %source,
                            existing_location_key = %first_key,
                            incoming_location_key = incoming,
                            "Detected conflicting entity ref; keeping the existing entity"
                        );
                        continue;
                    }
                }
            }

            match self
                .upsert_unprocessed_entity(conn, source, &entity_ref, item)
                .await?
            {
                UpsertOutcome::Conflict {
                    existing_location_key,
                } => {
                    warn!(
                        entity_ref = %entity_ref,
                        %source,
                        existing_location_key = %existing_location_key,
                        incoming_location_key = item.location_key.as_deref().unwrap_or(""),
                        "Detected conflicting entity ref; keeping the existing entity"
                    );
                    continue;
                }
                outcome => {
                    debug!(entity_ref = %entity_ref, %source, ?outcome, "upserted unprocessed entity");
                }
            }

            sqlx::query(
                "INSERT OR IGNORE INTO refresh_state_references (source_key, source_entity_ref, target_entity_ref) VALUES (?, ?, ?)",
            )
            .bind(source.source_key())
            .bind(source.source_entity_ref())
            .bind(&entity_ref)
            .execute(&mut *conn)
            .await?;

            let key = claimed.entry(entity_ref.clone()).or_insert(None);
            if key.is_none() {
                *key = item.location_key.clone();
            }
            asserted.insert(entity_ref);
        }

        Ok(asserted)
    }

    async fn upsert_unprocessed_entity(
        &self,
        conn: &mut SqliteConnection,
        source: EdgeSource<'_>,
        entity_ref: &str,
        item: &DeferredEntity,
    ) -> Result<UpsertOutcome> {
        let hash = stable_hash(&item.entity)?;
        let now = now_millis();

        let existing = sqlx::query(
            "SELECT entity_id, unprocessed_hash, location_key FROM refresh_state WHERE entity_ref = ?",
        )
        .bind(entity_ref)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = existing else {
            let result = sqlx::query(
                r#"
                INSERT INTO refresh_state (entity_id, entity_ref, unprocessed_entity, unprocessed_hash,
                                           errors, location_key, next_update_at, last_discovery_at)
                VALUES (?, ?, ?, ?, '', ?, ?, ?)
                ON CONFLICT(entity_ref) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(entity_ref)
            .bind(serde_json::to_string(&item.entity)?)
            .bind(&hash)
            .bind(item.location_key.as_deref())
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            return Ok(if result.rows_affected() == 1 {
                UpsertOutcome::Inserted
            } else {
                UpsertOutcome::Unchanged
            });
        };

        let entity_id: String = row.try_get("entity_id")?;
        let stored_hash: String = row.try_get("unprocessed_hash")?;
        let stored_key: Option<String> = row.try_get("location_key")?;

        if let (Some(existing), Some(incoming)) = (&stored_key, &item.location_key) {
            // A source that is the only one vouching for the entity may move it.
            if existing != incoming && !self.is_only_referenced_by(conn, source, entity_ref).await?
            {
                return Ok(UpsertOutcome::Conflict {
                    existing_location_key: existing.clone(),
                });
            }
        }

        let key_unchanged = item.location_key.is_none() || item.location_key == stored_key;
        if stored_hash == hash && key_unchanged {
            return Ok(UpsertOutcome::Unchanged);
        }

        sqlx::query(
            r#"
            UPDATE refresh_state
            SET unprocessed_entity = ?,
                unprocessed_hash = ?,
                location_key = COALESCE(?, location_key),
                last_discovery_at = ?,
                next_update_at = ?
            WHERE entity_id = ?
            "#,
        )
        .bind(serde_json::to_string(&item.entity)?)
        .bind(&hash)
        .bind(item.location_key.as_deref())
        .bind(now)
        .bind(now)
        .bind(&entity_id)
        .execute(&mut *conn)
        .await?;

        Ok(UpsertOutcome::Updated)
    }

    async fn is_only_referenced_by(
        &self,
        conn: &mut SqliteConnection,
        source: EdgeSource<'_>,
        entity_ref: &str,
    ) -> Result<bool> {
        let others: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM refresh_state_references
            WHERE target_entity_ref = ?
              AND NOT (source_key IS ? AND source_entity_ref IS ?)
            "#,
        )
        .bind(entity_ref)
        .bind(source.source_key())
        .bind(source.source_entity_ref())
        .fetch_one(&mut *conn)
        .await?;
        Ok(others == 0)
    }

    async fn list_targets(
        &self,
        conn: &mut SqliteConnection,
        source: EdgeSource<'_>,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT target_entity_ref FROM refresh_state_references WHERE {} = ? ORDER BY target_entity_ref",
            source.column()
        );
        let targets: Vec<String> = sqlx::query_scalar(&sql)
            .bind(source.value())
            .fetch_all(&mut *conn)
            .await?;
        Ok(targets)
    }

    async fn remove_edges(
        &self,
        conn: &mut SqliteConnection,
        source: EdgeSource<'_>,
        targets: &[String],
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM refresh_state_references WHERE {} = ? AND target_entity_ref = ?",
            source.column()
        );
        for target in targets {
            sqlx::query(&sql)
                .bind(source.value())
                .bind(target)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Delete every entity among `roots` and their descendants that is no
    /// longer reachable from a live anchor. Returns the number deleted.
    ///
    /// A candidate is anchored when it has an incoming edge from a source key
    /// or from an entity outside the candidate set; anchoring then propagates
    /// to descendants. Whatever stays unanchored is deleted, and its outgoing
    /// edges, relations and final entity cascade away with it.
    async fn collect_garbage(
        &self,
        conn: &mut SqliteConnection,
        roots: Vec<String>,
    ) -> Result<u64> {
        if roots.is_empty() {
            return Ok(0);
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut queue: VecDeque<String> = roots.into_iter().collect();
        while let Some(current) = queue.pop_front() {
            if children.contains_key(&current) {
                continue;
            }
            let targets = self
                .list_targets(conn, EdgeSource::Entity(&current))
                .await?;
            queue.extend(targets.iter().cloned());
            children.insert(current, targets);
        }

        let mut anchored: HashSet<String> = HashSet::new();
        for candidate in children.keys() {
            let rows = sqlx::query(
                "SELECT source_key, source_entity_ref FROM refresh_state_references WHERE target_entity_ref = ?",
            )
            .bind(candidate)
            .fetch_all(&mut *conn)
            .await?;

            for row in rows {
                let source_key: Option<String> = row.try_get("source_key")?;
                let parent: Option<String> = row.try_get("source_entity_ref")?;
                let external = source_key.is_some()
                    || parent.is_some_and(|parent| !children.contains_key(&parent));
                if external {
                    anchored.insert(candidate.clone());
                    queue.push_back(candidate.clone());
                    break;
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            if let Some(targets) = children.get(&current) {
                for target in targets {
                    if anchored.insert(target.clone()) {
                        queue.push_back(target.clone());
                    }
                }
            }
        }

        let mut deleted = 0;
        for candidate in children.keys().filter(|c| !anchored.contains(*c)) {
            let result = sqlx::query("DELETE FROM refresh_state WHERE entity_ref = ?")
                .bind(candidate)
                .execute(&mut *conn)
                .await?;
            if result.rows_affected() > 0 {
                debug!(entity_ref = %candidate, "deleted orphaned entity");
                deleted += result.rows_affected();
            }
        }

        Ok(deleted)
    }

    // ─── Processing ─────────────────────────────────────────────────

    /// Claim up to `limit` due rows and extend their lease.
    ///
    /// Claiming and lease extension happen in one `UPDATE ... RETURNING`
    /// statement, so concurrent engines never receive the same row for the
    /// same lease window. Each row gets its own random lease between the
    /// configured minimum and maximum.
    pub async fn get_processable_entities(
        &self,
        conn: &mut SqliteConnection,
        limit: usize,
    ) -> Result<Vec<ProcessableEntity>> {
        let now = now_millis();
        let min_ms = (self.options.refresh_interval_min_secs * 1000) as i64;
        let span_ms = (self
            .options
            .refresh_interval_max_secs
            .saturating_sub(self.options.refresh_interval_min_secs)
            * 1000) as i64
            + 1;

        let rows = sqlx::query(
            r#"
            UPDATE refresh_state
            SET next_update_at = ? + ? + abs(random() % ?)
            WHERE entity_id IN (
                SELECT entity_id FROM refresh_state
                WHERE next_update_at <= ?
                ORDER BY next_update_at ASC
                LIMIT ?
            )
            RETURNING entity_id, entity_ref, unprocessed_entity, result_hash, cache, errors,
                      location_key, next_update_at
            "#,
        )
        .bind(now)
        .bind(min_ms)
        .bind(span_ms)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            match processable_from_row(&row) {
                Ok(item) => items.push(item),
                Err(e) => {
                    let entity_ref: String = row.try_get("entity_ref").unwrap_or_default();
                    warn!(entity_ref = %entity_ref, error = %e, "skipping unreadable refresh state row");
                }
            }
        }
        Ok(items)
    }

    /// Persist a successful processing result.
    ///
    /// Fails with [`CatalogError::Conflict`] when the row is owned by a
    /// different location key, and with [`CatalogError::NotFound`] when the
    /// row has been deleted in the meantime.
    pub async fn update_processed_entity(
        &self,
        conn: &mut SqliteConnection,
        options: UpdateProcessedEntityOptions<'_>,
    ) -> Result<UpdateProcessedEntityResult> {
        let UpdateProcessedEntityOptions {
            id,
            processed_entity,
            result_hash,
            errors,
            relations,
            deferred_entities,
            location_key,
        } = options;

        let updated = sqlx::query(
            r#"
            UPDATE refresh_state
            SET processed_entity = ?, result_hash = ?, errors = ?, location_key = ?
            WHERE entity_id = ? AND (location_key IS NULL OR location_key IS ?)
            RETURNING entity_ref
            "#,
        )
        .bind(serde_json::to_string(processed_entity)?)
        .bind(result_hash)
        .bind(errors)
        .bind(location_key)
        .bind(id)
        .bind(location_key)
        .fetch_optional(&mut *conn)
        .await?;

        let entity_ref: String = match updated {
            Some(row) => row.try_get("entity_ref")?,
            None => {
                let stored: Option<Option<String>> =
                    sqlx::query_scalar("SELECT location_key FROM refresh_state WHERE entity_id = ?")
                        .bind(id)
                        .fetch_optional(&mut *conn)
                        .await?;
                return Err(match stored {
                    None => CatalogError::NotFound(format!("refresh state {id}")),
                    Some(owner) => CatalogError::Conflict(format!(
                        "Conflicting write of processing result for {id} with location key '{}', owned by '{}'",
                        location_key.unwrap_or(""),
                        owner.unwrap_or_default()
                    )),
                });
            }
        };

        let previous_relations = self.replace_relations(conn, id, relations).await?;
        self.replace_edges_from(conn, EdgeSource::Entity(&entity_ref), deferred_entities)
            .await?;

        Ok(UpdateProcessedEntityResult { previous_relations })
    }

    async fn replace_relations(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        relations: &[EntityRelationSpec],
    ) -> Result<Vec<RelationRow>> {
        let previous = self.list_relations(conn, id).await?;

        sqlx::query("DELETE FROM relations WHERE originating_entity_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        let unique: BTreeSet<&EntityRelationSpec> = relations.iter().collect();
        for relation in unique {
            sqlx::query(
                "INSERT INTO relations (originating_entity_id, type, source_entity_ref, target_entity_ref) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&relation.relation_type)
            .bind(&relation.source)
            .bind(&relation.target)
            .execute(&mut *conn)
            .await?;
        }

        Ok(previous)
    }

    /// Failure path: record errors and the result hash, keep the processed entity.
    pub async fn update_processed_entity_errors(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        errors: &str,
        result_hash: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE refresh_state SET errors = ?, result_hash = ? WHERE entity_id = ?")
            .bind(errors)
            .bind(result_hash)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Persist orchestrator cache state; `None` stores an empty object.
    pub async fn update_entity_cache(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        state: Option<&CacheState>,
    ) -> Result<()> {
        let cache = match state {
            Some(state) => serde_json::to_string(state)?,
            None => "{}".to_string(),
        };
        sqlx::query("UPDATE refresh_state SET cache = ? WHERE entity_id = ?")
            .bind(cache)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Schedule an entity and all of its ancestors for immediate processing.
    pub async fn refresh(&self, conn: &mut SqliteConnection, entity_ref: &str) -> Result<()> {
        let mut refs = vec![entity_ref.to_string()];
        refs.extend(self.list_ancestors(conn, entity_ref).await?);

        let now = now_millis();
        let mut found = false;
        for entity_ref in &refs {
            let result =
                sqlx::query("UPDATE refresh_state SET next_update_at = ? WHERE entity_ref = ?")
                    .bind(now)
                    .bind(entity_ref)
                    .execute(&mut *conn)
                    .await?;
            found |= result.rows_affected() > 0;
        }

        if !found {
            return Err(CatalogError::NotFound(entity_ref.to_string()));
        }
        Ok(())
    }

    // ─── Graph queries ──────────────────────────────────────────────

    /// Entities that directly emitted `entity_ref`, sorted.
    pub async fn list_parents(
        &self,
        conn: &mut SqliteConnection,
        entity_ref: &str,
    ) -> Result<Vec<String>> {
        let parents: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT source_entity_ref FROM refresh_state_references
            WHERE target_entity_ref = ? AND source_entity_ref IS NOT NULL
            ORDER BY source_entity_ref
            "#,
        )
        .bind(entity_ref)
        .fetch_all(&mut *conn)
        .await?;
        Ok(parents)
    }

    /// Transitive closure of [`list_parents`](Self::list_parents),
    /// breadth-first and nearest first. Each entity appears once even when
    /// the graph contains cycles.
    pub async fn list_ancestors(
        &self,
        conn: &mut SqliteConnection,
        entity_ref: &str,
    ) -> Result<Vec<String>> {
        let mut visited: HashSet<String> = HashSet::from([entity_ref.to_string()]);
        let mut queue = VecDeque::from([entity_ref.to_string()]);
        let mut ancestors = Vec::new();

        while let Some(current) = queue.pop_front() {
            for parent in self.list_parents(conn, &current).await? {
                if visited.insert(parent.clone()) {
                    ancestors.push(parent.clone());
                    queue.push_back(parent);
                }
            }
        }

        Ok(ancestors)
    }

    // ─── Reads ──────────────────────────────────────────────────────

    pub async fn get_entity(
        &self,
        conn: &mut SqliteConnection,
        entity_ref: &str,
    ) -> Result<Option<RefreshStateEntry>> {
        let row = sqlx::query(
            r#"
            SELECT entity_id, entity_ref, unprocessed_entity, unprocessed_hash, processed_entity,
                   result_hash, cache, errors, location_key, next_update_at, last_discovery_at
            FROM refresh_state WHERE entity_ref = ?
            "#,
        )
        .bind(entity_ref)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let unprocessed: String = row.try_get("unprocessed_entity")?;
        let processed: Option<String> = row.try_get("processed_entity")?;
        let cache: String = row.try_get("cache")?;
        let errors: String = row.try_get("errors")?;

        Ok(Some(RefreshStateEntry {
            entity_id: row.try_get("entity_id")?,
            entity_ref: row.try_get("entity_ref")?,
            unprocessed_entity: serde_json::from_str(&unprocessed)?,
            unprocessed_hash: row.try_get("unprocessed_hash")?,
            processed_entity: processed
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            result_hash: row.try_get("result_hash")?,
            cache: parse_cache(&cache),
            errors: non_empty(errors),
            location_key: row.try_get("location_key")?,
            next_update_at: row.try_get("next_update_at")?,
            last_discovery_at: row.try_get("last_discovery_at")?,
        }))
    }

    /// Relation rows produced by the last processing of entity `id`.
    pub async fn list_relations(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Vec<RelationRow>> {
        let rows = sqlx::query(
            r#"
            SELECT originating_entity_id, type, source_entity_ref, target_entity_ref
            FROM relations WHERE originating_entity_id = ?
            ORDER BY source_entity_ref, type, target_entity_ref
            "#,
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<RelationRow> {
                Ok(RelationRow {
                    originating_entity_id: row.try_get("originating_entity_id")?,
                    relation_type: row.try_get("type")?,
                    source_entity_ref: row.try_get("source_entity_ref")?,
                    target_entity_ref: row.try_get("target_entity_ref")?,
                })
            })
            .collect()
    }

    pub async fn stats(&self, conn: &mut SqliteConnection) -> Result<StoreStats> {
        let now = now_millis();
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS entities,
                COALESCE(SUM(processed_entity IS NOT NULL), 0) AS processed,
                COALESCE(SUM(errors NOT IN ('', '[]')), 0) AS with_errors,
                COALESCE(SUM(next_update_at <= ?), 0) AS due
            FROM refresh_state
            "#,
        )
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        let references: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM refresh_state_references")
            .fetch_one(&mut *conn)
            .await?;
        let relations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relations")
            .fetch_one(&mut *conn)
            .await?;

        Ok(StoreStats {
            entities: row.try_get("entities")?,
            processed: row.try_get("processed")?,
            with_errors: row.try_get("with_errors")?,
            due: row.try_get("due")?,
            references,
            relations,
        })
    }
}

fn processable_from_row(row: &SqliteRow) -> Result<ProcessableEntity> {
    let unprocessed: String = row.try_get("unprocessed_entity")?;
    let cache: String = row.try_get("cache")?;
    let errors: String = row.try_get("errors")?;

    Ok(ProcessableEntity {
        id: row.try_get("entity_id")?,
        entity_ref: row.try_get("entity_ref")?,
        unprocessed_entity: serde_json::from_str(&unprocessed)?,
        result_hash: row.try_get("result_hash")?,
        state: parse_cache(&cache),
        errors: non_empty(errors),
        location_key: row.try_get("location_key")?,
        next_update_at: row.try_get("next_update_at")?,
    })
}
