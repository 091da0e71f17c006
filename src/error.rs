//! Error taxonomy for state store operations.
//!
//! Callers branch on the variant: a [`CatalogError::Conflict`] is permanent
//! for the write that raised it, while database failures are transient and
//! the affected entity is retried once its lease expires.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// A write was attempted with a location key that does not own the entity.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The targeted row does not exist (for example, it was garbage-collected
    /// by a concurrent full replace).
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CatalogError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CatalogError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound(_))
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
