//! Stable content hashing.
//!
//! Values are converted to `serde_json::Value` before hashing so object keys
//! are emitted in sorted order; two structurally equal values always produce
//! the same digest regardless of field order in the source document.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let mut hasher = StableHasher::new();
    hasher.update(value)?;
    Ok(hasher.finish())
}

/// Incremental hasher over a sequence of canonical JSON values.
pub struct StableHasher {
    inner: Sha256,
}

impl StableHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update_str(&mut self, value: &str) {
        self.inner.update(value.as_bytes());
    }

    pub fn update<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let canonical = serde_json::to_value(value)?;
        self.inner.update(serde_json::to_vec(&canonical)?);
        Ok(())
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}
