//! In-memory [`IndexBackend`] for tests and dry runs.
//!
//! Indices live in a `HashMap` behind `std::sync::RwLock`. Every call is
//! appended to a call log, and failures can be scripted ahead of time so
//! tests can drive the gate through its retryable and terminal paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BackendError;

use super::{IndexBackend, IndexCreation};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create(String),
    Exists(String),
}

/// In-memory search collection.
pub struct InMemoryIndexBackend {
    indices: RwLock<HashMap<String, Value>>,
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<VecDeque<BackendError>>,
    created: Mutex<usize>,
}

impl InMemoryIndexBackend {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            created: Mutex::new(0),
        }
    }

    /// Make the next `create_index` call fail with `err`. Queued failures
    /// are consumed in order, one per call.
    pub fn fail_next(&self, err: BackendError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Seed an index as if it had been created out of band.
    pub fn insert(&self, name: &str, body: Value) {
        self.indices.write().unwrap().insert(name.to_string(), body);
    }

    /// Number of indices this backend actually created.
    pub fn created_count(&self) -> usize {
        *self.created.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn index_body(&self, name: &str) -> Option<Value> {
        self.indices.read().unwrap().get(name).cloned()
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InMemoryIndexBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexBackend for InMemoryIndexBackend {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn create_index(&self, name: &str, body: &Value) -> Result<IndexCreation, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push(BackendCall::Create(name.to_string()));

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut indices = self.indices.write().unwrap();
        if indices.contains_key(name) {
            return Ok(IndexCreation::AlreadyExists);
        }
        indices.insert(name.to_string(), body.clone());
        *self.created.lock().unwrap() += 1;
        Ok(IndexCreation::Created)
    }

    async fn index_exists(&self, name: &str) -> Result<bool, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push(BackendCall::Exists(name.to_string()));
        Ok(self.indices.read().unwrap().contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_then_already_exists() {
        let backend = InMemoryIndexBackend::new();
        let body = json!({ "mappings": {} });
        assert_eq!(
            backend.create_index("a", &body).await.unwrap(),
            IndexCreation::Created
        );
        assert_eq!(
            backend.create_index("a", &body).await.unwrap(),
            IndexCreation::AlreadyExists
        );
        assert_eq!(backend.created_count(), 1);
        assert!(backend.index_exists("a").await.unwrap());
        assert!(!backend.index_exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_scripted_failures_consumed_in_order() {
        let backend = InMemoryIndexBackend::new();
        backend.fail_next(BackendError::Transient("throttled".into()));
        backend.fail_next(BackendError::Rejected("bad mapping".into()));
        let body = json!({});

        assert!(matches!(
            backend.create_index("a", &body).await,
            Err(BackendError::Transient(_))
        ));
        assert!(matches!(
            backend.create_index("a", &body).await,
            Err(BackendError::Rejected(_))
        ));
        assert_eq!(
            backend.create_index("a", &body).await.unwrap(),
            IndexCreation::Created
        );
        assert_eq!(backend.calls().len(), 3);
    }
}
