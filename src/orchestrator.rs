//! Built-in processing orchestrators.
//!
//! [`BuiltinOrchestrator`] understands the handful of well-known spec fields
//! needed to build a basic catalog graph:
//!
//! | Field | Effect |
//! |-------|--------|
//! | `spec.owner` | `ownedBy` / `ownerOf` relations (default kind `group`) |
//! | `spec.dependsOn` | `dependsOn` / `dependencyOf` relations (default kind `component`) |
//! | `spec.targets` (kind `Location`) | each JSON file becomes a deferred entity |
//!
//! [`KindRouter`] dispatches to a different orchestrator per entity kind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::connector_fs::{annotate_location, file_location, parse_entities};
use crate::models::{
    parse_entity_ref, DeferredEntity, Entity, EntityProcessingRequest, EntityProcessingResult,
    EntityRelationSpec, ProcessingError, ANNOTATION_LOCATION, ANNOTATION_ORIGIN_LOCATION,
};
use crate::traits::CatalogProcessingOrchestrator;

const INPUT_ERROR: &str = "InputError";
const NOT_FOUND_ERROR: &str = "NotFoundError";

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinOrchestrator;

impl BuiltinOrchestrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CatalogProcessingOrchestrator for BuiltinOrchestrator {
    async fn process(&self, request: EntityProcessingRequest) -> Result<EntityProcessingResult> {
        let entity = request.entity;
        if let Err(e) = entity.validate_envelope() {
            return Ok(EntityProcessingResult::Failed {
                errors: vec![ProcessingError::new(INPUT_ERROR, e.to_string())],
            });
        }

        let mut errors = Vec::new();
        let relations = collect_relations(&entity, &mut errors);
        let deferred_entities = if entity.kind.eq_ignore_ascii_case("location") {
            read_location_targets(&entity, &mut errors).await
        } else {
            Vec::new()
        };

        if !errors.is_empty() {
            return Ok(EntityProcessingResult::Failed { errors });
        }

        Ok(EntityProcessingResult::Ok {
            state: request.state,
            completed_entity: entity,
            deferred_entities,
            relations,
            errors,
        })
    }
}

fn spec_field<'a>(entity: &'a Entity, field: &str) -> Option<&'a Value> {
    entity.spec.as_ref().and_then(|spec| spec.get(field))
}

/// Strings of a field that may hold one string or an array of strings.
fn string_list(value: &Value) -> Option<Vec<&str>> {
    match value {
        Value::String(s) => Some(vec![s.as_str()]),
        Value::Array(items) => items.iter().map(Value::as_str).collect(),
        _ => None,
    }
}

fn collect_relations(
    entity: &Entity,
    errors: &mut Vec<ProcessingError>,
) -> Vec<EntityRelationSpec> {
    let self_ref = entity.entity_ref();
    let mut relations = Vec::new();

    let fields = [
        ("owner", "group", "ownedBy", "ownerOf"),
        ("dependsOn", "component", "dependsOn", "dependencyOf"),
    ];
    for (field, default_kind, forward, reverse) in fields {
        let Some(value) = spec_field(entity, field) else {
            continue;
        };
        let Some(targets) = string_list(value) else {
            errors.push(ProcessingError::new(
                INPUT_ERROR,
                format!("spec.{field} of '{self_ref}' must be a string or a list of strings"),
            ));
            continue;
        };

        for target in targets {
            match parse_entity_ref(target, Some(default_kind), entity.namespace()) {
                Ok(target_ref) => {
                    let target_ref = target_ref.to_string();
                    relations.push(EntityRelationSpec::new(&self_ref, forward, &target_ref));
                    relations.push(EntityRelationSpec::new(&target_ref, reverse, &self_ref));
                }
                Err(e) => errors.push(ProcessingError::new(
                    INPUT_ERROR,
                    format!("spec.{field} of '{self_ref}': {e}"),
                )),
            }
        }
    }

    relations
}

/// Directory that relative targets of a location resolve against.
fn base_dir(entity: &Entity) -> Option<PathBuf> {
    let location = entity.annotation(ANNOTATION_LOCATION)?;
    let path = Path::new(location.strip_prefix("file:")?);
    path.parent().map(Path::to_path_buf)
}

async fn read_location_targets(
    entity: &Entity,
    errors: &mut Vec<ProcessingError>,
) -> Vec<DeferredEntity> {
    let self_ref = entity.entity_ref();
    let Some(value) = spec_field(entity, "targets").or_else(|| spec_field(entity, "target")) else {
        return Vec::new();
    };
    let Some(targets) = string_list(value) else {
        errors.push(ProcessingError::new(
            INPUT_ERROR,
            format!("spec.targets of '{self_ref}' must be a string or a list of strings"),
        ));
        return Vec::new();
    };

    let origin = entity
        .annotation(ANNOTATION_ORIGIN_LOCATION)
        .or_else(|| entity.annotation(ANNOTATION_LOCATION));
    let base = base_dir(entity);

    let mut deferred = Vec::new();
    for target in targets {
        let path = Path::new(target);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else if let Some(base) = &base {
            base.join(path)
        } else {
            errors.push(ProcessingError::new(
                INPUT_ERROR,
                format!("relative target '{target}' of '{self_ref}' has no base location"),
            ));
            continue;
        };

        match read_target(&path, origin).await {
            Ok(entities) => deferred.extend(entities),
            Err(e) => errors.push(ProcessingError::from_error(NOT_FOUND_ERROR, &e)),
        }
    }

    deferred
}

async fn read_target(path: &Path, origin: Option<&str>) -> Result<Vec<DeferredEntity>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow!("Unable to read location target {}: {}", path.display(), e))?;
    let location = file_location(path);

    Ok(parse_entities(&content)?
        .into_iter()
        .map(|mut entity| {
            annotate_location(&mut entity, &location, origin);
            DeferredEntity::new(entity, Some(location.clone()))
        })
        .collect())
}

/// Selects an orchestrator by (case-insensitive) entity kind, falling back
/// to a default for every other kind.
pub struct KindRouter {
    strategies: HashMap<String, Arc<dyn CatalogProcessingOrchestrator>>,
    fallback: Arc<dyn CatalogProcessingOrchestrator>,
}

impl KindRouter {
    pub fn new(fallback: Arc<dyn CatalogProcessingOrchestrator>) -> Self {
        Self {
            strategies: HashMap::new(),
            fallback,
        }
    }

    pub fn with_kind(
        mut self,
        kind: &str,
        orchestrator: Arc<dyn CatalogProcessingOrchestrator>,
    ) -> Self {
        self.strategies.insert(kind.to_lowercase(), orchestrator);
        self
    }
}

#[async_trait]
impl CatalogProcessingOrchestrator for KindRouter {
    async fn process(&self, request: EntityProcessingRequest) -> Result<EntityProcessingResult> {
        let orchestrator = self
            .strategies
            .get(&request.entity.kind.to_lowercase())
            .unwrap_or(&self.fallback);
        orchestrator.process(request).await
    }
}
