//! Core data models used throughout the catalog refresh engine.
//!
//! These types represent the entities that flow from providers through the
//! processing pipeline, the rows persisted in the refresh state tables, and
//! the request/response shapes exchanged with the orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CatalogError, Result};

/// Namespace assumed when an entity does not declare one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Annotation naming the location that currently manages an entity.
pub const ANNOTATION_LOCATION: &str = "catalog.io/managed-by-location";

/// Annotation naming the location an entity was originally discovered through.
pub const ANNOTATION_ORIGIN_LOCATION: &str = "catalog.io/managed-by-origin-location";

/// A described external resource tracked by the catalog.
///
/// Entities are tagged by `kind`; everything the engine does not interpret
/// is preserved verbatim in `spec` and `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub api_version: String,
    pub kind: String,
    pub metadata: EntityMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    /// Build a minimal entity with the given kind, namespace and name.
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: "catalog.io/v1alpha1".to_string(),
            kind: kind.to_string(),
            metadata: EntityMetadata {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
                uid: None,
                annotations: BTreeMap::new(),
                extra: Map::new(),
            },
            spec: None,
            extra: Map::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// The canonical `kind:namespace/name` key of this entity.
    pub fn entity_ref(&self) -> String {
        stringify_entity_ref(&self.kind, self.namespace(), &self.metadata.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    /// Reject entities that cannot be addressed by a ref.
    pub fn validate_envelope(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(CatalogError::InvalidEntity(format!(
                "entity '{}' has an empty kind",
                self.metadata.name
            )));
        }
        if self.metadata.name.trim().is_empty() {
            return Err(CatalogError::InvalidEntity(format!(
                "entity of kind '{}' has an empty metadata.name",
                self.kind
            )));
        }
        if self.kind.contains([':', '/']) || self.metadata.name.contains([':', '/']) {
            return Err(CatalogError::InvalidEntity(format!(
                "entity '{}' contains reserved characters in kind or name",
                self.entity_ref()
            )));
        }
        Ok(())
    }
}

/// Build the canonical lower-cased `kind:namespace/name` string.
pub fn stringify_entity_ref(kind: &str, namespace: &str, name: &str) -> String {
    format!(
        "{}:{}/{}",
        kind.to_lowercase(),
        namespace.to_lowercase(),
        name.to_lowercase()
    )
}

/// A parsed entity reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundEntityRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for CompoundEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&stringify_entity_ref(
            &self.kind,
            &self.namespace,
            &self.name,
        ))
    }
}

/// Parse `[kind:][namespace/]name`, filling in defaults for omitted parts.
pub fn parse_entity_ref(
    input: &str,
    default_kind: Option<&str>,
    default_namespace: &str,
) -> Result<CompoundEntityRef> {
    let input = input.trim();
    let (kind, rest) = match input.split_once(':') {
        Some((kind, rest)) => (Some(kind), rest),
        None => (None, input),
    };
    let (namespace, name) = match rest.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => (default_namespace, rest),
    };
    let kind = kind
        .or(default_kind)
        .ok_or_else(|| CatalogError::InvalidEntity(format!("entity ref '{input}' has no kind")))?;

    if kind.is_empty() || namespace.is_empty() || name.is_empty() || name.contains(['/', ':']) {
        return Err(CatalogError::InvalidEntity(format!(
            "malformed entity ref '{input}'"
        )));
    }

    Ok(CompoundEntityRef {
        kind: kind.to_lowercase(),
        namespace: namespace.to_lowercase(),
        name: name.to_lowercase(),
    })
}

/// An entity supplied by a provider or discovered while processing another
/// entity, together with the location that claims ownership of its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredEntity {
    pub entity: Entity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_key: Option<String>,
}

impl DeferredEntity {
    pub fn new(entity: Entity, location_key: Option<String>) -> Self {
        Self {
            entity,
            location_key,
        }
    }
}

/// A typed, directed edge between two processed entities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRelationSpec {
    pub source: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub target: String,
}

impl EntityRelationSpec {
    pub fn new(source: &str, relation_type: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            relation_type: relation_type.to_string(),
            target: target.to_string(),
        }
    }
}

/// A serialized processing error recorded against an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub name: String,
    pub message: String,
}

impl ProcessingError {
    pub fn new(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Capture an error chain as a single message.
    pub fn from_error(name: &str, error: &anyhow::Error) -> Self {
        Self::new(name, format!("{error:#}"))
    }
}

/// Opaque orchestrator bookkeeping carried between processing runs.
///
/// The only field the engine interprets is `ttl`: the number of further
/// failed runs the cached entries may survive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(flatten)]
    pub entries: Map<String, Value>,
}

impl CacheState {
    pub fn is_empty(&self) -> bool {
        self.ttl.is_none() && self.entries.is_empty()
    }
}

/// Input to a single orchestrator invocation.
#[derive(Debug, Clone)]
pub struct EntityProcessingRequest {
    pub entity: Entity,
    pub state: Map<String, Value>,
}

/// Output of a single orchestrator invocation.
#[derive(Debug, Clone)]
pub enum EntityProcessingResult {
    Ok {
        state: Map<String, Value>,
        completed_entity: Entity,
        deferred_entities: Vec<DeferredEntity>,
        relations: Vec<EntityRelationSpec>,
        errors: Vec<ProcessingError>,
    },
    Failed {
        errors: Vec<ProcessingError>,
    },
}

impl EntityProcessingResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, EntityProcessingResult::Ok { .. })
    }

    pub fn errors(&self) -> &[ProcessingError] {
        match self {
            EntityProcessingResult::Ok { errors, .. } => errors,
            EntityProcessingResult::Failed { errors } => errors,
        }
    }
}

/// A row claimed by [`StateStore::get_processable_entities`](crate::store::StateStore::get_processable_entities).
#[derive(Debug, Clone)]
pub struct ProcessableEntity {
    pub id: String,
    pub entity_ref: String,
    pub unprocessed_entity: Entity,
    pub result_hash: Option<String>,
    pub state: CacheState,
    pub errors: Option<String>,
    pub location_key: Option<String>,
    pub next_update_at: i64,
}

/// Full view of one `refresh_state` row.
#[derive(Debug, Clone)]
pub struct RefreshStateEntry {
    pub entity_id: String,
    pub entity_ref: String,
    pub unprocessed_entity: Entity,
    pub unprocessed_hash: String,
    pub processed_entity: Option<Entity>,
    pub result_hash: Option<String>,
    pub cache: CacheState,
    pub errors: Option<String>,
    pub location_key: Option<String>,
    pub next_update_at: i64,
    pub last_discovery_at: i64,
}

/// One persisted row of the `relations` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRow {
    pub originating_entity_id: String,
    pub source_entity_ref: String,
    pub relation_type: String,
    pub target_entity_ref: String,
}
