use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::FileProviderConfig;
use crate::models::{DeferredEntity, Entity, ANNOTATION_LOCATION, ANNOTATION_ORIGIN_LOCATION};
use crate::traits::{EntityProvider, EntityProviderConnection, EntityProviderMutation};

/// Provides every entity found in JSON files below a directory.
///
/// Each file may hold a single entity object or an array of them. Entities
/// are keyed by the absolute file path (`file:<path>`), so two files that
/// declare the same entity name conflict instead of overwriting each other.
pub struct FileEntityProvider {
    config: FileProviderConfig,
    connection: RwLock<Option<Arc<dyn EntityProviderConnection>>>,
}

impl FileEntityProvider {
    pub fn new(config: FileProviderConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
        }
    }

    /// `None` when the provider only scans once, on connect.
    pub fn rescan_interval(&self) -> Option<Duration> {
        match self.config.rescan_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Scan the root and push the result as a full mutation.
    pub async fn rescan(&self) -> Result<usize> {
        let connection = match self.connection.read().await.as_ref() {
            Some(connection) => Arc::clone(connection),
            None => bail!("Provider '{}' is not connected", self.config.name),
        };

        let config = self.config.clone();
        let entities = tokio::task::spawn_blocking(move || scan_entity_files(&config)).await??;
        let count = entities.len();

        connection
            .apply_mutation(EntityProviderMutation::Full { entities })
            .await?;
        info!(provider = %self.config.name, count, "scanned entity files");
        Ok(count)
    }
}

#[async_trait]
impl EntityProvider for FileEntityProvider {
    fn provider_name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self, connection: Arc<dyn EntityProviderConnection>) -> Result<()> {
        *self.connection.write().await = Some(connection);
        self.rescan().await?;
        Ok(())
    }
}

pub fn scan_entity_files(fs_config: &FileProviderConfig) -> Result<Vec<DeferredEntity>> {
    let root = &fs_config.root;
    if !root.exists() {
        bail!("File provider root does not exist: {}", root.display());
    }

    let include_set = build_globset(&fs_config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(fs_config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut items = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(fs_config.follow_symlinks)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        // Apply exclude patterns
        if exclude_set.is_match(&rel_str) {
            continue;
        }

        // Apply include patterns
        if !include_set.is_match(&rel_str) {
            continue;
        }

        match read_entity_file(path) {
            Ok(entities) => items.extend(entities),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable entity file"),
        }
    }

    // Sort for deterministic ordering
    items.sort_by_key(|item| item.entity.entity_ref());

    Ok(items)
}

/// Read one file and tag its entities with the file's location.
pub fn read_entity_file(path: &Path) -> Result<Vec<DeferredEntity>> {
    let content = std::fs::read_to_string(path)?;
    let location = file_location(path);
    Ok(parse_entities(&content)?
        .into_iter()
        .map(|mut entity| {
            annotate_location(&mut entity, &location, None);
            DeferredEntity::new(entity, Some(location.clone()))
        })
        .collect())
}

/// Parse a JSON document holding one entity or an array of entities.
pub fn parse_entities(content: &str) -> Result<Vec<Entity>> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    let entities = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        _ => vec![serde_json::from_value(value)?],
    };
    Ok(entities)
}

/// `file:<absolute path>`; falls back to the path as given when it cannot
/// be canonicalized.
pub fn file_location(path: &Path) -> String {
    let absolute: PathBuf = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file:{}", absolute.display())
}

/// Set the managing location, and the origin location unless one is
/// already recorded.
pub fn annotate_location(entity: &mut Entity, location: &str, origin: Option<&str>) {
    let annotations = &mut entity.metadata.annotations;
    annotations.insert(ANNOTATION_LOCATION.to_string(), location.to_string());
    annotations
        .entry(ANNOTATION_ORIGIN_LOCATION.to_string())
        .or_insert_with(|| origin.unwrap_or(location).to_string());
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
