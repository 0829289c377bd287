//! The index bootstrap gate.
//!
//! Converts the imperative "create the vector index" step into a node the
//! declarative resource graph can depend on. The orchestration engine
//! invokes [`IndexGate::handle`] with a Create, Update or Delete event; the
//! gate dispatches to one handler per event kind and returns a response
//! carrying a stable physical id (the index name).
//!
//! # Lifecycle per (stack id, logical resource id)
//!
//! ```text
//! NotRequested ──▶ Requested ──▶ Created
//!                      │
//!                      ├──▶ Failed(retryable) ──(retry)──▶ Requested
//!                      └──▶ Failed(terminal)
//! ```
//!
//! The idempotency key is the stack id plus the logical resource id; the
//! engine reuses logical ids across stacks and across delete-then-recreate.
//! A Create for a key the [`GateLedger`] already holds as `Created`, with
//! the same properties, returns the recorded physical id without touching
//! the backend; a Create that reaches the backend after a lost response is
//! absorbed by the backend's `AlreadyExists` outcome. A terminal failure is
//! replayed, not retried, while the properties stay the same.
//!
//! Update returns the stored identity unchanged. Delete retains the index
//! and ends the key's lifetime: its ledger record is dropped, so a later
//! Create starts from `NotRequested`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{IndexBackend, IndexCreation};
use crate::error::GateError;
use crate::mapping::{HnswParams, IndexMapping, DEFAULT_METADATA_FIELD, DEFAULT_TEXT_FIELD};
use crate::models::{
    CustomActionRequest, CustomActionResponse, CustomActionResult, Disposition, GateOutcome,
    IndexProperties, RequestType,
};

/// Per-id lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    NotRequested,
    Requested,
    Created,
    Failed { retryable: bool },
}

impl GateState {
    /// Whether a Create may (re)issue the backend call from this state.
    pub fn may_request(&self) -> bool {
        matches!(
            self,
            GateState::NotRequested | GateState::Requested | GateState::Failed { retryable: true }
        )
    }
}

/// What the ledger knows about one logical resource id.
#[derive(Debug, Clone, Serialize)]
pub struct GateRecord {
    #[serde(flatten)]
    pub state: GateState,
    pub physical_resource_id: Option<String>,
    /// Backend calls issued for this id.
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    properties: Option<IndexProperties>,
}

impl Default for GateRecord {
    fn default() -> Self {
        Self {
            state: GateState::NotRequested,
            physical_resource_id: None,
            attempts: 0,
            last_error: None,
            properties: None,
        }
    }
}

/// Shared record of every (stack, logical id) pair the gate has seen.
///
/// Kept separate from [`IndexGate`] so a long-running front end can build a
/// gate per request (one backend per target endpoint) while sharing one
/// ledger.
#[derive(Default)]
pub struct GateLedger {
    records: Mutex<HashMap<(String, String), GateRecord>>,
}

fn key(stack_id: &str, logical_id: &str) -> (String, String) {
    (stack_id.to_string(), logical_id.to_string())
}

impl GateLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stack_id: &str, logical_id: &str) -> Option<GateRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&key(stack_id, logical_id))
            .cloned()
    }

    pub fn state(&self, stack_id: &str, logical_id: &str) -> GateState {
        self.get(stack_id, logical_id)
            .map(|r| r.state)
            .unwrap_or(GateState::NotRequested)
    }

    /// Every record for `logical_id`, paired with its stack id and sorted
    /// by stack id.
    pub fn find(&self, logical_id: &str) -> Vec<(String, GateRecord)> {
        let mut found: Vec<(String, GateRecord)> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|((_, id), _)| id == logical_id)
            .map(|((stack, _), record)| (stack.clone(), record.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Drop the record for a key. Returns whether one existed.
    pub fn remove(&self, stack_id: &str, logical_id: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .remove(&key(stack_id, logical_id))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<R>(
        &self,
        stack_id: &str,
        logical_id: &str,
        f: impl FnOnce(&mut GateRecord) -> R,
    ) -> R {
        let mut records = self.records.lock().unwrap();
        f(records.entry(key(stack_id, logical_id)).or_default())
    }
}

/// What a Create should do, decided under the ledger lock.
enum CreatePlan {
    Replay(CustomActionResult),
    Issue(IndexMapping),
}

/// The gate: one backend, one ledger.
pub struct IndexGate {
    backend: Arc<dyn IndexBackend>,
    ledger: Arc<GateLedger>,
    expected_dimensions: Option<i64>,
}

impl IndexGate {
    pub fn new(backend: Arc<dyn IndexBackend>) -> Self {
        Self::with_ledger(backend, Arc::new(GateLedger::new()))
    }

    pub fn with_ledger(backend: Arc<dyn IndexBackend>, ledger: Arc<GateLedger>) -> Self {
        Self {
            backend,
            ledger,
            expected_dimensions: None,
        }
    }

    /// Dimensionality the embedding model produces. Applied when the event
    /// itself carries no `ExpectedDimensions`.
    pub fn expect_dimensions(mut self, dims: Option<i64>) -> Self {
        self.expected_dimensions = dims;
        self
    }

    pub fn ledger(&self) -> &Arc<GateLedger> {
        &self.ledger
    }

    /// Dispatch one event and build the engine response.
    pub async fn handle(&self, request: &CustomActionRequest) -> CustomActionResponse {
        let result = self.dispatch(request).await;
        match &result {
            Ok(outcome) => info!(
                request_type = %request.request_type,
                logical_id = %request.logical_resource_id,
                physical_id = %outcome.physical_resource_id,
                disposition = ?outcome.disposition,
                "Gate invocation succeeded"
            ),
            Err(err) => warn!(
                request_type = %request.request_type,
                logical_id = %request.logical_resource_id,
                retryable = err.is_retryable(),
                error = %err,
                "Gate invocation failed"
            ),
        }
        CustomActionResponse::from_result(request, &result)
    }

    /// Dispatch one event and return the raw handler result.
    pub async fn dispatch(&self, request: &CustomActionRequest) -> CustomActionResult {
        if request.logical_resource_id.trim().is_empty() {
            return Err(GateError::terminal("LogicalResourceId must not be empty"));
        }
        match request.request_type {
            RequestType::Create => self.on_create(request).await,
            RequestType::Update => Ok(self.on_update(request)),
            RequestType::Delete => {
                if self
                    .ledger
                    .remove(&request.stack_id, &request.logical_resource_id)
                {
                    debug!(
                        stack_id = %request.stack_id,
                        logical_id = %request.logical_resource_id,
                        "Dropped ledger record"
                    );
                }
                Ok(on_delete(request))
            }
        }
    }

    async fn on_create(&self, request: &CustomActionRequest) -> CustomActionResult {
        let stack_id = request.stack_id.as_str();
        let logical_id = request.logical_resource_id.as_str();
        let props = &request.resource_properties;
        let expected = props.expected_dimensions.or(self.expected_dimensions);

        let plan = self.ledger.update(stack_id, logical_id, |record| {
            let same_properties = record.properties.as_ref() == Some(props);
            if !record.state.may_request() && same_properties {
                match (record.state, &record.physical_resource_id) {
                    (GateState::Created, Some(id)) => {
                        return CreatePlan::Replay(Ok(GateOutcome {
                            physical_resource_id: id.clone(),
                            index_name: id.clone(),
                            disposition: Disposition::Recorded,
                        }));
                    }
                    (GateState::Failed { .. }, _) => {
                        let reason = record.last_error.clone().unwrap_or_default();
                        return CreatePlan::Replay(Err(GateError::Terminal(reason)));
                    }
                    _ => {}
                }
            }

            let mapping = mapping_from_properties(props);
            match mapping.validate(expected) {
                Ok(()) => {
                    record.state = GateState::Requested;
                    record.attempts += 1;
                    record.properties = Some(props.clone());
                    CreatePlan::Issue(mapping)
                }
                Err(err) => {
                    record.state = GateState::Failed { retryable: false };
                    record.last_error = Some(err.0.clone());
                    record.properties = Some(props.clone());
                    CreatePlan::Replay(Err(err.into()))
                }
            }
        });

        let mapping = match plan {
            CreatePlan::Replay(result) => return result,
            CreatePlan::Issue(mapping) => mapping,
        };

        debug!(
            stack_id,
            logical_id,
            index = %mapping.index_name,
            backend = self.backend.kind(),
            "Issuing index creation"
        );
        let created = self
            .backend
            .create_index(&mapping.index_name, &mapping.to_index_body())
            .await;

        match created {
            Ok(creation) => {
                let physical_id = mapping.index_name.clone();
                self.ledger.update(stack_id, logical_id, |record| {
                    record.state = GateState::Created;
                    record.physical_resource_id = Some(physical_id.clone());
                    record.last_error = None;
                });
                Ok(GateOutcome {
                    physical_resource_id: physical_id.clone(),
                    index_name: physical_id,
                    disposition: match creation {
                        IndexCreation::Created => Disposition::Created,
                        IndexCreation::AlreadyExists => Disposition::AlreadyExisted,
                    },
                })
            }
            Err(err) => {
                let err = GateError::from(err);
                self.ledger.update(stack_id, logical_id, |record| {
                    record.state = GateState::Failed {
                        retryable: err.is_retryable(),
                    };
                    record.last_error = Some(err.reason().to_string());
                });
                Err(err)
            }
        }
    }

    fn on_update(&self, request: &CustomActionRequest) -> GateOutcome {
        let recorded = self
            .ledger
            .get(&request.stack_id, &request.logical_resource_id)
            .and_then(|r| r.physical_resource_id);
        update_identity(request, recorded)
    }
}

/// Build a mapping from event properties, applying field defaults.
pub fn mapping_from_properties(props: &IndexProperties) -> IndexMapping {
    let mut mapping = IndexMapping::new(
        props.index_name.trim(),
        props.field_name.trim(),
        props.dimensions,
    );
    mapping.text_field = props
        .text_field
        .clone()
        .unwrap_or_else(|| DEFAULT_TEXT_FIELD.to_string());
    mapping.metadata_field = props
        .metadata_field
        .clone()
        .unwrap_or_else(|| DEFAULT_METADATA_FIELD.to_string());
    if let Some(engine) = props.engine {
        mapping.engine = engine;
    }
    if let Some(space_type) = props.space_type {
        mapping.space_type = space_type;
    }
    // Out-of-range values become 0 and fail validation.
    let hnsw = |value: Option<i64>, default: u32| {
        value.map_or(default, |v| u32::try_from(v).unwrap_or(0))
    };
    mapping.hnsw = HnswParams {
        ef_construction: hnsw(props.ef_construction, mapping.hnsw.ef_construction),
        m: hnsw(props.m, mapping.hnsw.m),
        ef_search: hnsw(props.ef_search, mapping.hnsw.ef_search),
    };
    mapping
}

/// Update handler: never re-creates. The identity is, in order of
/// preference, the incoming physical id, the recorded one, or the index name.
pub fn update_identity(request: &CustomActionRequest, recorded: Option<String>) -> GateOutcome {
    let physical_id = request
        .physical_resource_id
        .clone()
        .filter(|id| !id.is_empty())
        .or(recorded)
        .unwrap_or_else(|| request.resource_properties.index_name.clone());
    GateOutcome {
        index_name: physical_id.clone(),
        physical_resource_id: physical_id,
        disposition: Disposition::Unchanged,
    }
}

/// Delete handler: retains the index and echoes the identity back.
pub fn on_delete(request: &CustomActionRequest) -> GateOutcome {
    let physical_id = request
        .physical_resource_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| request.logical_resource_id.clone());
    GateOutcome {
        index_name: physical_id.clone(),
        physical_resource_id: physical_id,
        disposition: Disposition::Retained,
    }
}
