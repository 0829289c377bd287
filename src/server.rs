//! HTTP provider for the index gate.
//!
//! Lets the orchestration engine (or anything that speaks its event
//! format) invoke the gate over HTTP. All requests share one
//! [`GateLedger`], so a repeated Create for the same logical id is answered
//! from the ledger.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/events` | Handle one custom-resource event |
//! | `GET`  | `/gate/{logical_id}` | Ledger state for a logical id (`?stack_id=` to pick a stack) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `POST /events` answers `200` with the engine response even when the
//! action failed; the `Status` field carries the outcome and the
//! `X-Gate-Retryable` header says whether a failure may be retried.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Failed to parse custom resource event" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use agent_stack_core::gate::{GateLedger, GateRecord, IndexGate};
use agent_stack_core::models::CustomActionRequest;

use crate::config::Config;
use crate::handler::{opensearch_factory, BackendFactory};

/// Header carrying the retry classification of a failed event.
pub const RETRYABLE_HEADER: &str = "x-gate-retryable";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    ledger: Arc<GateLedger>,
    backends: BackendFactory,
}

/// Starts the provider against the configured OpenSearch collection.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let factory = opensearch_factory(Arc::new(config.clone()));
    run_server_with_backend(config, factory).await
}

/// Starts the provider with a caller-supplied backend factory.
pub async fn run_server_with_backend(config: &Config, backends: BackendFactory) -> anyhow::Result<()> {
    let bind_addr = config.provider.bind.clone();
    let app = router(Arc::new(config.clone()), Arc::new(GateLedger::new()), backends);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %listener.local_addr()?, "Gate provider listening");
    println!("Gate provider listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the provider's routes.
pub fn router(config: Arc<Config>, ledger: Arc<GateLedger>, backends: BackendFactory) -> Router {
    let state = AppState {
        config,
        ledger,
        backends,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/events", post(handle_event))
        .route("/gate/{logical_id}", get(handle_gate_state))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    /// Logical ids the ledger currently tracks.
    tracked: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tracked: state.ledger.len(),
    })
}

// ============ POST /events ============

/// Handler for `POST /events`.
///
/// The body is parsed by hand rather than through the `Json` extractor so
/// a malformed event gets the standard error body.
async fn handle_event(State(state): State<AppState>, body: String) -> Result<Response, AppError> {
    let request: CustomActionRequest = serde_json::from_str(&body)
        .map_err(|e| bad_request(format!("invalid custom resource event: {}", e)))?;

    let backend = (state.backends)(&request.resource_properties);
    let gate = IndexGate::with_ledger(backend, state.ledger.clone())
        .expect_dimensions(state.config.embedding.resolved_dims());
    let response = gate.handle(&request).await;

    let retryable = if response.retryable { "true" } else { "false" };
    Ok((
        [(
            HeaderName::from_static(RETRYABLE_HEADER),
            HeaderValue::from_static(retryable),
        )],
        Json(response),
    )
        .into_response())
}

// ============ GET /gate/{logical_id} ============

#[derive(Deserialize)]
struct GateQuery {
    stack_id: Option<String>,
}

#[derive(Serialize)]
struct GateStateResponse {
    stack_id: String,
    logical_id: String,
    #[serde(flatten)]
    record: GateRecord,
}

/// Handler for `GET /gate/{logical_id}?stack_id=...`.
///
/// `stack_id` may be omitted while only one stack has used the logical id.
async fn handle_gate_state(
    State(state): State<AppState>,
    Path(logical_id): Path<String>,
    Query(query): Query<GateQuery>,
) -> Result<Json<GateStateResponse>, AppError> {
    let mut found = state.ledger.find(&logical_id);
    if let Some(stack_id) = &query.stack_id {
        found.retain(|(stack, _)| stack == stack_id);
    }
    if found.len() > 1 {
        return Err(bad_request(format!(
            "{} stacks track {}; pass stack_id",
            found.len(),
            logical_id
        )));
    }
    let (stack_id, record) = found
        .pop()
        .ok_or_else(|| not_found(format!("no gate invocation recorded for: {}", logical_id)))?;
    Ok(Json(GateStateResponse {
        stack_id,
        logical_id,
        record,
    }))
}
