//! Ingestion commands: provider sync, batch processing and the long-running
//! refresh service.
//!
//! ```text
//! catalog sync     providers ──▶ refresh_state
//! catalog process  refresh_state ──▶ orchestrator ──▶ final_entities
//! catalog run      both, continuously, until Ctrl-C
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::connector_fs::FileEntityProvider;
use crate::db;
use crate::engine::{DefaultProcessingEngine, EngineOptions};
use crate::events::ProcessingOutcome;
use crate::migrate;
use crate::orchestrator::BuiltinOrchestrator;
use crate::providers::connect_entity_providers;
use crate::stitcher::SqliteStitcher;
use crate::store::{StateStore, StoreOptions};
use crate::traits::EntityProvider;

/// Connect to the database, apply the schema and wrap the pool in a store.
pub async fn open_store(config: &Config) -> Result<Arc<StateStore>> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    Ok(Arc::new(StateStore::new(
        pool,
        StoreOptions::from_config(&config.processing),
    )))
}

/// Build the engine with the built-in orchestrator and stitcher.
pub fn build_engine(config: &Config, store: Arc<StateStore>) -> DefaultProcessingEngine {
    let stitcher = Arc::new(SqliteStitcher::new(store.pool().clone()));
    DefaultProcessingEngine::new(
        store,
        Arc::new(BuiltinOrchestrator::new()),
        stitcher,
        EngineOptions::from_config(&config.processing),
    )
}

pub fn file_providers(config: &Config) -> Vec<Arc<FileEntityProvider>> {
    config
        .providers
        .file
        .iter()
        .cloned()
        .map(|provider| Arc::new(FileEntityProvider::new(provider)))
        .collect()
}

fn as_entity_providers(providers: &[Arc<FileEntityProvider>]) -> Vec<Arc<dyn EntityProvider>> {
    providers
        .iter()
        .map(|provider| Arc::clone(provider) as Arc<dyn EntityProvider>)
        .collect()
}

/// Run every configured provider once.
pub async fn run_sync(config: &Config) -> Result<()> {
    let providers = file_providers(config);
    if providers.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }

    let store = open_store(config).await?;
    connect_entity_providers(Arc::clone(&store), &as_entity_providers(&providers)).await?;

    for provider in &providers {
        println!("sync {}", provider.provider_name());
    }
    println!("ok");

    store.pool().close().await;
    Ok(())
}

/// Process due entities. With `until_idle`, keep claiming batches until
/// nothing is due; otherwise process a single batch.
pub async fn run_process(config: &Config, until_idle: bool) -> Result<()> {
    let store = open_store(config).await?;
    let engine = build_engine(config, Arc::clone(&store));
    let batch_size = config.processing.high_watermark;

    let mut processed = 0;
    let mut tally = OutcomeTally::default();
    loop {
        let outcomes = engine.process_batch(batch_size).await?;
        processed += outcomes.len();
        for outcome in &outcomes {
            tally.record(*outcome);
        }
        if outcomes.is_empty() || !until_idle {
            break;
        }
    }

    println!("process");
    println!("  entities:  {}", processed);
    println!("  updated:   {}", tally.updated);
    println!("  unchanged: {}", tally.unchanged);
    println!("  failed:    {}", tally.failed);
    println!("  conflicts: {}", tally.conflicts);
    println!("  errors:    {}", tally.errors);
    println!("ok");

    store.pool().close().await;
    Ok(())
}

/// Connect providers, start the engine and keep rescanning until Ctrl-C.
pub async fn run_service(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let providers = file_providers(config);
    connect_entity_providers(Arc::clone(&store), &as_entity_providers(&providers)).await?;

    let engine = build_engine(config, Arc::clone(&store));
    engine.start().await?;
    info!(providers = providers.len(), "catalog refresh service started");

    let mut rescans = JoinSet::new();
    for provider in providers {
        let Some(interval) = provider.rescan_interval() else {
            continue;
        };
        rescans.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; connect already scanned.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = provider.rescan().await {
                    warn!(
                        provider = provider.provider_name(),
                        error = %format!("{e:#}"),
                        "rescan failed"
                    );
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    rescans.shutdown().await;
    engine.stop().await?;
    store.pool().close().await;
    Ok(())
}

#[derive(Debug, Default)]
struct OutcomeTally {
    updated: usize,
    unchanged: usize,
    failed: usize,
    conflicts: usize,
    errors: usize,
}

impl OutcomeTally {
    fn record(&mut self, outcome: ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Updated => self.updated += 1,
            ProcessingOutcome::Unchanged => self.unchanged += 1,
            ProcessingOutcome::Failed => self.failed += 1,
            ProcessingOutcome::Conflict => self.conflicts += 1,
            ProcessingOutcome::Error => self.errors += 1,
        }
    }
}
