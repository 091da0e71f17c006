//! Entity provider bridge.
//!
//! Forwards provider mutations to
//! [`StateStore::replace_unprocessed_entities`], one transaction per
//! mutation. The bridge keeps no state of its own; de-duplication and graph
//! maintenance live in the store.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::models::DeferredEntity;
use crate::store::{ReplaceOptions, StateStore};
use crate::traits::{EntityProvider, EntityProviderConnection, EntityProviderMutation};

/// A connection bound to one provider's `source_key`.
pub struct ProviderConnection {
    store: Arc<StateStore>,
    source_key: String,
}

impl ProviderConnection {
    pub fn new(store: Arc<StateStore>, source_key: &str) -> Self {
        Self {
            store,
            source_key: source_key.to_string(),
        }
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }
}

fn validate_entities(source_key: &str, entities: &[DeferredEntity]) -> Result<()> {
    for item in entities {
        item.entity
            .validate_envelope()
            .with_context(|| format!("Invalid entity from provider '{}'", source_key))?;
    }
    Ok(())
}

#[async_trait]
impl EntityProviderConnection for ProviderConnection {
    async fn apply_mutation(&self, mutation: EntityProviderMutation) -> Result<()> {
        let options = match mutation {
            EntityProviderMutation::Full { entities } => {
                validate_entities(&self.source_key, &entities)?;
                ReplaceOptions::Full {
                    source_key: self.source_key.clone(),
                    items: entities,
                }
            }
            EntityProviderMutation::Delta { added, removed } => {
                validate_entities(&self.source_key, &added)?;
                ReplaceOptions::Delta {
                    source_key: self.source_key.clone(),
                    added,
                    removed,
                }
            }
        };

        let summary = match &options {
            ReplaceOptions::Full { items, .. } => format!("full ({} entities)", items.len()),
            ReplaceOptions::Delta { added, removed, .. } => {
                format!("delta (+{} / -{})", added.len(), removed.len())
            }
        };

        let mut tx = self.store.pool().begin().await?;
        self.store
            .replace_unprocessed_entities(&mut tx, options)
            .await
            .with_context(|| format!("Failed to apply mutation from '{}'", self.source_key))?;
        tx.commit().await?;

        info!(source_key = %self.source_key, "applied {}", summary);
        Ok(())
    }

    async fn refresh(&self, entity_ref: &str) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        self.store.refresh(&mut tx, entity_ref).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Connect every provider to the store. Provider names must be unique.
pub async fn connect_entity_providers(
    store: Arc<StateStore>,
    providers: &[Arc<dyn EntityProvider>],
) -> Result<()> {
    let mut names = HashSet::new();
    for provider in providers {
        if !names.insert(provider.provider_name()) {
            bail!(
                "Duplicate entity provider name: '{}'",
                provider.provider_name()
            );
        }
    }

    for provider in providers {
        let connection = Arc::new(ProviderConnection::new(
            Arc::clone(&store),
            provider.provider_name(),
        ));
        provider
            .connect(connection)
            .await
            .with_context(|| format!("Failed to connect provider '{}'", provider.provider_name()))?;
    }

    Ok(())
}
