//! Search backend abstraction for the index gate.
//!
//! The [`IndexBackend`] trait is the gate's only view of the managed search
//! collection. It exposes index creation and an existence check and
//! nothing destructive: the gate retains indices on delete, so there is no
//! delete operation to call by mistake.
//!
//! # Idempotency contract
//!
//! `create_index` must report an index that is already present as
//! `Ok(IndexCreation::AlreadyExists)`, never as an error. Each backend maps
//! its own wire signal (status code, exception type) onto that outcome; the
//! gate never inspects error text.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BackendError;

/// Result of a successful `create_index` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCreation {
    /// The index did not exist and was created by this call.
    Created,
    /// The index was already present; nothing was changed.
    AlreadyExists,
}

/// Abstract managed-search backend.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Short label used in logs (e.g. `"opensearch"`, `"memory"`).
    fn kind(&self) -> &str;

    /// Create `name` with the given settings/mappings body if absent.
    async fn create_index(&self, name: &str, body: &Value) -> Result<IndexCreation, BackendError>;

    /// Whether `name` currently exists.
    async fn index_exists(&self, name: &str) -> Result<bool, BackendError>;
}
