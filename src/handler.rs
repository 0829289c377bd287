//! Front-end plumbing shared by `handle`, `bootstrap` and `serve`.
//!
//! - [`read_event`] parses a custom-resource event from a file or stdin.
//! - [`backend_for`] builds the search backend an event targets.
//! - [`RetryPolicy`] and [`invoke_with_retry`] drive the gate to a final
//!   outcome within an attempt and wall-clock budget.
//! - [`bootstrap_request`] synthesizes the Create event the engine would
//!   send, for running the gate directly from the CLI.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use agent_stack_core::backend::memory::InMemoryIndexBackend;
use agent_stack_core::backend::{IndexBackend, IndexCreation};
use agent_stack_core::error::{BackendError, GateError};
use agent_stack_core::gate::IndexGate;
use agent_stack_core::models::{
    CustomActionRequest, CustomActionResponse, CustomActionResult, Disposition, IndexProperties,
    RequestType,
};

use crate::config::{Config, ProviderConfig};
use crate::console::{print_msg, MsgColor};
use crate::input::read_input;
use crate::opensearch::OpenSearchBackend;
use crate::sigv4::AwsCredentials;
use crate::stack::{ids, GATE_RESOURCE_TYPE};

/// Builds the backend for one event's `ResourceProperties`.
pub type BackendFactory = Arc<dyn Fn(&IndexProperties) -> Arc<dyn IndexBackend> + Send + Sync>;

/// Read an event from `path`, or from stdin when `path` is `-`.
pub fn read_event(path: &Path) -> Result<CustomActionRequest> {
    parse_event(&read_input(path, "event")?)
}

pub fn parse_event(raw: &str) -> Result<CustomActionRequest> {
    serde_json::from_str(raw).context("Failed to parse custom resource event")
}

/// A backend that could not be constructed. Every call fails as transient,
/// so the engine retries once the endpoint or credentials are available.
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl IndexBackend for UnavailableBackend {
    fn kind(&self) -> &str {
        "unavailable"
    }

    async fn create_index(&self, _name: &str, _body: &Value) -> Result<IndexCreation, BackendError> {
        Err(BackendError::Transient(self.reason.clone()))
    }

    async fn index_exists(&self, _name: &str) -> Result<bool, BackendError> {
        Err(BackendError::Transient(self.reason.clone()))
    }
}

/// The OpenSearch backend for an event, using the event's `Endpoint` and
/// `Region` when present and the config otherwise.
pub fn backend_for(config: &Config, props: &IndexProperties) -> Arc<dyn IndexBackend> {
    let built = AwsCredentials::from_env().and_then(|creds| {
        OpenSearchBackend::from_config(
            config,
            Some(props.endpoint.as_str()),
            Some(props.region.as_str()),
            creds,
        )
    });
    match built {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            debug!(error = %e, "Search backend unavailable");
            Arc::new(UnavailableBackend::new(format!("search backend unavailable: {:#}", e)))
        }
    }
}

/// [`BackendFactory`] over [`backend_for`].
pub fn opensearch_factory(config: Arc<Config>) -> BackendFactory {
    Arc::new(move |props: &IndexProperties| backend_for(&config, props))
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Wall-clock ceiling across all attempts.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            deadline: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(provider: &ProviderConfig) -> Self {
        Self {
            max_retries: provider.max_retries,
            deadline: Duration::from_secs(provider.timeout_secs),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Final result of a retried invocation.
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: CustomActionResult,
    pub attempts: u32,
}

/// Dispatch `request` until it succeeds, fails terminally, or the policy's
/// attempt or time budget runs out. Retryable failures are retried;
/// terminal ones return at once.
pub async fn invoke_with_retry(
    gate: &IndexGate,
    request: &CustomActionRequest,
    policy: &RetryPolicy,
) -> RetryOutcome {
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let remaining = policy.deadline.saturating_sub(started.elapsed());
        let result = match tokio::time::timeout(remaining, gate.dispatch(request)).await {
            Ok(result) => result,
            Err(_) => Err(GateError::retryable(format!(
                "deadline of {}s exceeded",
                policy.deadline.as_secs()
            ))),
        };

        let err = match result {
            Ok(outcome) => {
                return RetryOutcome {
                    result: Ok(outcome),
                    attempts,
                }
            }
            Err(err) => err,
        };

        let delay = policy.backoff(attempts);
        let out_of_budget = attempts > policy.max_retries
            || started.elapsed() + delay >= policy.deadline;
        if !err.is_retryable() || out_of_budget {
            return RetryOutcome {
                result: Err(err),
                attempts,
            };
        }

        debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying gate invocation"
        );
        tokio::time::sleep(delay).await;
    }
}

/// The Create event for the stack's index gate, targeting `endpoint`.
pub fn bootstrap_request(config: &Config, endpoint: &str) -> CustomActionRequest {
    let mapping = config.index_mapping();
    CustomActionRequest {
        request_type: RequestType::Create,
        request_id: uuid::Uuid::new_v4().to_string(),
        stack_id: config.stack.name.clone(),
        logical_resource_id: ids::INDEX_GATE.to_string(),
        physical_resource_id: None,
        resource_type: GATE_RESOURCE_TYPE.to_string(),
        response_url: None,
        resource_properties: IndexProperties {
            service_token: None,
            endpoint: endpoint.to_string(),
            index_name: mapping.index_name,
            field_name: mapping.vector_field,
            dimensions: mapping.dimensions,
            region: config.stack.region.clone(),
            text_field: Some(mapping.text_field),
            metadata_field: Some(mapping.metadata_field),
            expected_dimensions: config.embedding.resolved_dims(),
            engine: Some(mapping.engine),
            space_type: Some(mapping.space_type),
            ef_construction: Some(mapping.hnsw.ef_construction.into()),
            m: Some(mapping.hnsw.m.into()),
            ef_search: Some(mapping.hnsw.ef_search.into()),
        },
        old_resource_properties: None,
    }
}

/// `agent-stack handle`: run one event through the gate and print the
/// engine response. A `FAILED` response is still a successful run.
pub async fn run_handle(config: &Config, path: &Path) -> Result<()> {
    let request = read_event(path)?;
    let backend = backend_for(config, &request.resource_properties);
    let gate = IndexGate::new(backend).expect_dimensions(config.embedding.resolved_dims());
    let response = gate.handle(&request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// `agent-stack bootstrap`: create the stack's index directly, retrying
/// within the provider budget. With `dry_run`, the gate runs against an
/// in-memory collection and the index body is printed instead.
pub async fn run_bootstrap(config: &Config, endpoint: Option<String>, dry_run: bool) -> Result<()> {
    let endpoint = endpoint
        .or_else(|| config.collection.endpoint.clone())
        .unwrap_or_default();

    let memory = Arc::new(InMemoryIndexBackend::new());
    let backend: Arc<dyn IndexBackend> = if dry_run {
        memory.clone()
    } else {
        if endpoint.trim().is_empty() {
            anyhow::bail!("no collection endpoint: pass --endpoint or set collection.endpoint");
        }
        let creds = AwsCredentials::from_env()?;
        Arc::new(OpenSearchBackend::from_config(config, Some(&endpoint), None, creds)?)
    };

    let request = bootstrap_request(config, &endpoint);
    let gate = IndexGate::new(backend).expect_dimensions(config.embedding.resolved_dims());
    let policy = RetryPolicy::from_config(&config.provider);
    info!(
        index = %request.resource_properties.index_name,
        endpoint = %endpoint,
        dry_run,
        "Bootstrapping vector index"
    );

    let out = invoke_with_retry(&gate, &request, &policy).await;
    let response = CustomActionResponse::from_result(&request, &out.result);
    let outcome = match out.result {
        Ok(outcome) => outcome,
        Err(err) => anyhow::bail!(
            "index bootstrap failed after {} attempt(s): {}",
            out.attempts,
            err
        ),
    };

    let verb = match outcome.disposition {
        Disposition::Created => "created",
        Disposition::AlreadyExisted => "already existed",
        _ => "recorded",
    };
    let mut msg = format!(
        "Index '{}' {} after {} attempt(s).",
        outcome.index_name, verb, out.attempts
    );
    if dry_run {
        if let Some(body) = memory.index_body(&outcome.index_name) {
            msg.push('\n');
            msg.push_str(&serde_json::to_string_pretty(&body)?);
        }
    }
    print_msg(&msg, Some(" Bootstrap "), MsgColor::Green, false);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
