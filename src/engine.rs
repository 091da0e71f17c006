//! Processing engine.
//!
//! Wires the [task pipeline](crate::pipeline) to the [state
//! store](crate::store): due rows are claimed, run through the orchestrator,
//! persisted unless the result hash is unchanged, and finally stitched.
//!
//! ```text
//! claim ──▶ orchestrate ──▶ cache ttl ──▶ result hash ──┬─▶ unchanged: stop
//!                                                       ├─▶ failed: errors + stitch self
//!                                                       └─▶ ok: persist + stitch self & relation sources
//! ```
//!
//! Every failure inside one task is logged and reported as an event; it
//! never reaches sibling tasks or the pipeline.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::config::ProcessingConfig;
use crate::events::{EventBus, EventSubscription, ProcessingEvent, ProcessingOutcome};
use crate::hash::StableHasher;
use crate::models::{
    CacheState, EntityProcessingRequest, EntityProcessingResult, ProcessableEntity,
    ProcessingError, ANNOTATION_LOCATION,
};
use crate::pipeline::{start_task_pipeline, PipelineHandle, PipelineOptions, PipelineWorker};
use crate::store::{StateStore, UpdateProcessedEntityOptions};
use crate::traits::{CatalogProcessingOrchestrator, Stitcher};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub polling_interval: Duration,
    /// Failed runs a cache entry survives before it is pruned.
    pub cache_ttl: u32,
}

impl EngineOptions {
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            low_watermark: config.low_watermark,
            high_watermark: config.high_watermark,
            polling_interval: config.polling_interval(),
            cache_ttl: config.cache_ttl,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

/// The control loop that turns due refresh state rows into processed,
/// persisted and stitched entities.
pub struct DefaultProcessingEngine {
    worker: Arc<EngineWorker>,
    options: EngineOptions,
    pipeline: Mutex<Option<PipelineHandle>>,
}

impl DefaultProcessingEngine {
    pub fn new(
        store: Arc<StateStore>,
        orchestrator: Arc<dyn CatalogProcessingOrchestrator>,
        stitcher: Arc<dyn Stitcher>,
        options: EngineOptions,
    ) -> Self {
        let worker = Arc::new(EngineWorker {
            store,
            orchestrator,
            stitcher,
            events: EventBus::default(),
            cache_ttl: options.cache_ttl,
        });
        Self {
            worker,
            options,
            pipeline: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.worker.events.subscribe()
    }

    pub async fn start(&self) -> Result<()> {
        let mut pipeline = self.pipeline.lock().await;
        if pipeline.is_some() {
            bail!("Processing engine is already running");
        }

        let handle = start_task_pipeline(
            Arc::clone(&self.worker),
            PipelineOptions {
                low_watermark: self.options.low_watermark,
                high_watermark: self.options.high_watermark,
                polling_interval: self.options.polling_interval,
            },
        )?;
        *pipeline = Some(handle);
        Ok(())
    }

    /// Stop polling and wait for in-flight tasks to finish.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.pipeline.lock().await.take();
        if let Some(handle) = handle {
            handle.stop();
            handle.join().await?;
        }
        Ok(())
    }

    /// Claim and process a single batch of up to `limit` due entities
    /// outside the polling loop. Returns the outcome of every claimed entity.
    pub async fn process_batch(&self, limit: usize) -> Result<Vec<ProcessingOutcome>> {
        let items = self.worker.load_tasks(limit).await;

        let mut tasks = JoinSet::new();
        for item in items {
            let worker = Arc::clone(&self.worker);
            tasks.spawn(async move { worker.handle(item).await });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(finished) = tasks.join_next().await {
            match finished {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(error = %e, "processing task panicked");
                    outcomes.push(ProcessingOutcome::Error);
                }
            }
        }

        Ok(outcomes)
    }
}

struct EngineWorker {
    store: Arc<StateStore>,
    orchestrator: Arc<dyn CatalogProcessingOrchestrator>,
    stitcher: Arc<dyn Stitcher>,
    events: EventBus,
    cache_ttl: u32,
}

#[async_trait]
impl PipelineWorker for EngineWorker {
    type Task = ProcessableEntity;

    async fn load_tasks(&self, count: usize) -> Vec<ProcessableEntity> {
        match self.claim(count).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to load processing items");
                Vec::new()
            }
        }
    }

    async fn process_task(&self, item: ProcessableEntity) {
        self.handle(item).await;
    }
}

impl EngineWorker {
    /// Process one claimed entity and publish its outcome.
    async fn handle(&self, item: ProcessableEntity) -> ProcessingOutcome {
        let entity_id = item.id.clone();
        let entity_ref = item.entity_ref.clone();

        let outcome = match self.process_item(item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(entity_ref = %entity_ref, error = %format!("{e:#}"), "processing failed");
                ProcessingOutcome::Error
            }
        };
        debug!(entity_ref = %entity_ref, ?outcome, "processed entity");

        self.events.publish(ProcessingEvent {
            entity_id,
            entity_ref,
            outcome,
        });
        outcome
    }

    async fn claim(&self, count: usize) -> Result<Vec<ProcessableEntity>> {
        let mut tx = self.store.pool().begin().await?;
        let items = self.store.get_processable_entities(&mut tx, count).await?;
        tx.commit().await?;
        Ok(items)
    }

    async fn process_item(&self, item: ProcessableEntity) -> Result<ProcessingOutcome> {
        let ProcessableEntity {
            id,
            entity_ref,
            unprocessed_entity,
            result_hash: previous_result_hash,
            state,
            location_key,
            ..
        } = item;

        let request = EntityProcessingRequest {
            entity: unprocessed_entity.clone(),
            state: state.entries.clone(),
        };
        let result = match self.orchestrator.process(request).await {
            Ok(result) => result,
            Err(e) => EntityProcessingResult::Failed {
                errors: vec![ProcessingError::from_error("ProcessingError", &e)],
            },
        };

        self.update_cache(&id, &state, &result).await?;

        let location = unprocessed_entity.annotation(ANNOTATION_LOCATION).unwrap_or("");
        for processing_error in result.errors() {
            warn!(
                entity_ref = %entity_ref,
                location,
                error_name = %processing_error.name,
                "{}",
                processing_error.message
            );
        }

        let errors = serde_json::to_string(result.errors())?;
        let mut hasher = StableHasher::new();
        hasher.update_str(&errors);
        if let EntityProcessingResult::Ok {
            completed_entity,
            deferred_entities,
            relations,
            ..
        } = &result
        {
            // A parent changing identity must count as a change for this entity.
            let ancestors = {
                let mut conn = self.store.pool().acquire().await?;
                self.store.list_ancestors(&mut conn, &entity_ref).await?
            };
            hasher.update(completed_entity)?;
            hasher.update(deferred_entities)?;
            hasher.update(relations)?;
            hasher.update(&ancestors)?;
        }
        let result_hash = hasher.finish();

        if previous_result_hash.as_deref() == Some(result_hash.as_str()) {
            return Ok(ProcessingOutcome::Unchanged);
        }

        match result {
            EntityProcessingResult::Failed { .. } => {
                let mut tx = self.store.pool().begin().await?;
                self.store
                    .update_processed_entity_errors(&mut tx, &id, &errors, &result_hash)
                    .await?;
                tx.commit().await?;

                self.stitcher
                    .stitch(&BTreeSet::from([unprocessed_entity.entity_ref()]))
                    .await?;
                Ok(ProcessingOutcome::Failed)
            }
            EntityProcessingResult::Ok {
                mut completed_entity,
                deferred_entities,
                relations,
                ..
            } => {
                completed_entity.metadata.uid = Some(id.clone());

                let mut tx = self.store.pool().begin().await?;
                let updated = self
                    .store
                    .update_processed_entity(
                        &mut tx,
                        UpdateProcessedEntityOptions {
                            id: &id,
                            processed_entity: &completed_entity,
                            result_hash: &result_hash,
                            errors: &errors,
                            relations: &relations,
                            deferred_entities: &deferred_entities,
                            location_key: location_key.as_deref(),
                        },
                    )
                    .await;

                let previous = match updated {
                    Ok(previous) => previous,
                    Err(e) if e.is_conflict() => {
                        tx.rollback().await?;
                        warn!(entity_ref = %entity_ref, error = %e, "rejected processing result");
                        return Ok(ProcessingOutcome::Conflict);
                    }
                    Err(e) if e.is_not_found() => {
                        tx.rollback().await?;
                        debug!(entity_ref = %entity_ref, "entity was removed while processing");
                        return Ok(ProcessingOutcome::Unchanged);
                    }
                    Err(e) => return Err(e.into()),
                };
                tx.commit().await?;

                let mut to_stitch = BTreeSet::from([completed_entity.entity_ref()]);
                to_stitch.extend(relations.iter().map(|relation| relation.source.clone()));
                to_stitch.extend(
                    previous
                        .previous_relations
                        .into_iter()
                        .map(|relation| relation.source_entity_ref),
                );
                self.stitcher.stitch(&to_stitch).await?;

                Ok(ProcessingOutcome::Updated)
            }
        }
    }

    /// Persist orchestrator state independently of the processing result.
    ///
    /// Success with new state stores it with a fresh `ttl`. Failure
    /// decrements the `ttl`; a failure at `ttl == 0` prunes the cache.
    async fn update_cache(
        &self,
        id: &str,
        previous: &CacheState,
        result: &EntityProcessingResult,
    ) -> Result<()> {
        let next = match result {
            EntityProcessingResult::Ok { state, .. } => {
                if *state == previous.entries {
                    return Ok(());
                }
                CacheState {
                    ttl: Some(self.cache_ttl),
                    entries: state.clone(),
                }
            }
            EntityProcessingResult::Failed { .. } => {
                if previous.is_empty() {
                    return Ok(());
                }
                match previous.ttl {
                    Some(ttl) if ttl > 0 => CacheState {
                        ttl: Some(ttl - 1),
                        entries: previous.entries.clone(),
                    },
                    _ => CacheState::default(),
                }
            }
        };

        let mut tx = self.store.pool().begin().await?;
        self.store.update_entity_cache(&mut tx, id, Some(&next)).await?;
        tx.commit().await?;
        Ok(())
    }
}
