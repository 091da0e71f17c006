//! Extension traits for the collaborators around the engine.
//!
//! The engine treats entity processing, stitching and entity supply as black
//! boxes. Implement these traits to plug in custom behaviour; the crate ships
//! built-in implementations in [`orchestrator`](crate::orchestrator),
//! [`stitcher`](crate::stitcher) and [`connector_fs`](crate::connector_fs).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  apply_mutation  ┌─────────────┐
//! │  EntityProvider  │─────────────────▶│ StateStore  │
//! └──────────────────┘                  └──────┬──────┘
//!                                              │ claim
//!                                              ▼
//!          ┌──────────────┐  process   ┌──────────────┐  stitch  ┌──────────┐
//!          │ Orchestrator │◀───────────│    Engine    │─────────▶│ Stitcher │
//!          └──────────────┘            └──────────────┘          └──────────┘
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DeferredEntity, EntityProcessingRequest, EntityProcessingResult};

// ═══════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════

/// Turns a raw entity into a processed one.
///
/// Each call is one attempt. The engine never retries inside a cycle; an
/// entity is simply processed again once its lease expires. Returning `Err`
/// is equivalent to returning [`EntityProcessingResult::Failed`] with that
/// error.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use catalog_refresh::models::{EntityProcessingRequest, EntityProcessingResult};
/// use catalog_refresh::traits::CatalogProcessingOrchestrator;
///
/// pub struct PassThrough;
///
/// #[async_trait]
/// impl CatalogProcessingOrchestrator for PassThrough {
///     async fn process(&self, request: EntityProcessingRequest) -> Result<EntityProcessingResult> {
///         Ok(EntityProcessingResult::Ok {
///             state: request.state,
///             completed_entity: request.entity,
///             deferred_entities: vec![],
///             relations: vec![],
///             errors: vec![],
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait CatalogProcessingOrchestrator: Send + Sync {
    async fn process(&self, request: EntityProcessingRequest) -> Result<EntityProcessingResult>;
}

// ═══════════════════════════════════════════════════════════════════════
// Stitcher
// ═══════════════════════════════════════════════════════════════════════

/// Recomputes the externally visible form of a set of entities.
///
/// The engine awaits `stitch` before it considers a task complete.
#[async_trait]
pub trait Stitcher: Send + Sync {
    async fn stitch(&self, entity_refs: &BTreeSet<String>) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Entity providers
// ═══════════════════════════════════════════════════════════════════════

/// A change pushed by a provider.
#[derive(Debug, Clone)]
pub enum EntityProviderMutation {
    /// The complete set of entities the provider currently vouches for.
    Full { entities: Vec<DeferredEntity> },
    /// Incremental additions and removals (`removed` holds entity refs).
    Delta {
        added: Vec<DeferredEntity>,
        removed: Vec<String>,
    },
}

/// The channel a provider uses to push entities into the catalog.
#[async_trait]
pub trait EntityProviderConnection: Send + Sync {
    async fn apply_mutation(&self, mutation: EntityProviderMutation) -> Result<()>;

    /// Ask for an entity and its ancestors to be processed as soon as possible.
    async fn refresh(&self, entity_ref: &str) -> Result<()>;
}

/// An external source of entities.
///
/// # Lifecycle
///
/// 1. Providers are handed to
///    [`connect_entity_providers`](crate::providers::connect_entity_providers)
///    at startup.
/// 2. [`connect`](EntityProvider::connect) receives a connection scoped to
///    the provider's name and typically pushes a first full snapshot.
/// 3. The provider keeps the connection and pushes further mutations
///    whenever its source changes.
#[async_trait]
pub trait EntityProvider: Send + Sync {
    /// Unique name; used as the `source_key` of every edge this provider asserts.
    fn provider_name(&self) -> &str;

    async fn connect(&self, connection: Arc<dyn EntityProviderConnection>) -> Result<()>;
}
