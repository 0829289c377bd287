//! End-to-end tests for the HTTP gate provider and the OpenSearch backend.
//!
//! The provider runs on an ephemeral port backed by the in-memory
//! collection. The OpenSearch backend runs against a local axum server that
//! answers with scripted statuses.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_stack::config::Config;
use agent_stack::handler::BackendFactory;
use agent_stack::opensearch::OpenSearchBackend;
use agent_stack::server::{router, RETRYABLE_HEADER};
use agent_stack::sigv4::AwsCredentials;
use agent_stack_core::backend::memory::InMemoryIndexBackend;
use agent_stack_core::backend::{IndexBackend, IndexCreation};
use agent_stack_core::error::BackendError;
use agent_stack_core::gate::GateLedger;
use agent_stack_core::models::IndexProperties;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use axum::Router;
use serde_json::{json, Value};

// ─── Provider ───────────────────────────────────────────────────────

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_provider(backend: Arc<InMemoryIndexBackend>) -> String {
    let factory: BackendFactory = Arc::new(move |_props: &IndexProperties| {
        backend.clone() as Arc<dyn IndexBackend>
    });
    let app = router(
        Arc::new(Config::minimal()),
        Arc::new(GateLedger::new()),
        factory,
    );
    spawn(app).await
}

fn create_event(dimensions: Value) -> Value {
    json!({
        "RequestType": "Create",
        "RequestId": "req-1",
        "StackId": "stack",
        "LogicalResourceId": "IndexGate",
        "ResourceType": "Custom::VectorIndex",
        "ResourceProperties": {
            "Endpoint": "https://abc.us-east-1.aoss.amazonaws.com",
            "IndexName": "kb-index",
            "FieldName": "kb-vector",
            "Dimensions": dimensions,
            "Region": "us-east-1"
        }
    })
}

#[tokio::test]
async fn test_repeated_create_creates_one_index() {
    let backend = Arc::new(InMemoryIndexBackend::new());
    let base = spawn_provider(backend.clone()).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let resp = client
            .post(format!("{}/events", base))
            .json(&create_event(json!(1024)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[RETRYABLE_HEADER], "false");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["Status"], "SUCCESS");
        assert_eq!(body["PhysicalResourceId"], "kb-index");
        assert_eq!(body["Data"]["IndexName"], "kb-index");
    }

    assert_eq!(backend.created_count(), 1);
    assert_eq!(backend.calls().len(), 1);

    let state: Value = client
        .get(format!("{}/gate/IndexGate", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["stack_id"], "stack");
    assert_eq!(state["state"], "created");
    assert_eq!(state["physical_resource_id"], "kb-index");
    assert_eq!(state["attempts"], 1);
}

#[tokio::test]
async fn test_invalid_dimension_is_terminal() {
    let backend = Arc::new(InMemoryIndexBackend::new());
    let base = spawn_provider(backend.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/events", base))
        .json(&create_event(json!("-1")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()[RETRYABLE_HEADER], "false");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["Status"], "FAILED");
    assert!(body["Reason"]
        .as_str()
        .unwrap()
        .contains("invalid dimensionality"));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_transient_failure_sets_retryable_header() {
    let backend = Arc::new(InMemoryIndexBackend::new());
    backend.fail_next(BackendError::Transient("HTTP 429".into()));
    let base = spawn_provider(backend.clone()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/events", base))
        .json(&create_event(json!(1024)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()[RETRYABLE_HEADER], "true");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["Status"], "FAILED");

    // The engine retries; the second attempt goes through.
    let body: Value = client
        .post(format!("{}/events", base))
        .json(&create_event(json!(1024)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["Status"], "SUCCESS");
    assert_eq!(backend.created_count(), 1);
}

#[tokio::test]
async fn test_delete_never_touches_backend() {
    let backend = Arc::new(InMemoryIndexBackend::new());
    let base = spawn_provider(backend.clone()).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/events", base))
        .json(&json!({
            "RequestType": "Delete",
            "RequestId": "req-9",
            "StackId": "stack",
            "LogicalResourceId": "IndexGate",
            "PhysicalResourceId": "kb-index",
            "ResourceProperties": {}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["Status"], "SUCCESS");
    assert_eq!(body["PhysicalResourceId"], "kb-index");
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_delete_then_create_in_new_stack_reaches_new_collection() {
    let first = Arc::new(InMemoryIndexBackend::new());
    let second = Arc::new(InMemoryIndexBackend::new());
    let (a, b) = (first.clone(), second.clone());
    let factory: BackendFactory = Arc::new(move |props: &IndexProperties| {
        if props.endpoint.contains("second") {
            b.clone() as Arc<dyn IndexBackend>
        } else {
            a.clone() as Arc<dyn IndexBackend>
        }
    });
    let base = spawn(router(
        Arc::new(Config::minimal()),
        Arc::new(GateLedger::new()),
        factory,
    ))
    .await;
    let client = reqwest::Client::new();

    let post = |event: Value| {
        let client = client.clone();
        let url = format!("{}/events", base);
        async move {
            client
                .post(url)
                .json(&event)
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        }
    };

    assert_eq!(post(create_event(json!(1024))).await["Status"], "SUCCESS");
    let deleted = post(json!({
        "RequestType": "Delete",
        "RequestId": "req-2",
        "StackId": "stack",
        "LogicalResourceId": "IndexGate",
        "PhysicalResourceId": "kb-index",
        "ResourceProperties": {}
    }))
    .await;
    assert_eq!(deleted["Status"], "SUCCESS");

    let mut recreate = create_event(json!(1024));
    recreate["StackId"] = json!("stack-2");
    recreate["ResourceProperties"]["Endpoint"] = json!("https://second.us-east-1.aoss.amazonaws.com");
    assert_eq!(post(recreate).await["Status"], "SUCCESS");

    assert_eq!(first.created_count(), 1);
    assert_eq!(second.created_count(), 1);

    let state: Value = client
        .get(format!("{}/gate/IndexGate?stack_id=stack-2", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["state"], "created");
}

#[tokio::test]
async fn test_malformed_event_and_unknown_gate() {
    let base = spawn_provider(Arc::new(InMemoryIndexBackend::new())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/events", base))
        .body("{ nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .get(format!("{}/gate/Missing", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}

// ─── OpenSearch backend against a fake collection ───────────────────

#[derive(Clone, Default)]
struct FakeCollection {
    responses: Arc<Mutex<VecDeque<(u16, Value)>>>,
    seen: Arc<Mutex<Vec<(String, HeaderMap, Value)>>>,
}

async fn fake_put(
    State(fake): State<FakeCollection>,
    Path(index): Path<String>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    fake.seen.lock().unwrap().push((index, headers, body));
    let (status, reply) = fake
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((200, json!({ "acknowledged": true })));
    (StatusCode::from_u16(status).unwrap(), reply.to_string())
}

async fn spawn_fake(responses: Vec<(u16, Value)>) -> (String, FakeCollection) {
    let fake = FakeCollection::default();
    fake.responses.lock().unwrap().extend(responses);
    let app = Router::new()
        .route("/{index}", put(fake_put))
        .with_state(fake.clone());
    (spawn(app).await, fake)
}

fn backend(endpoint: &str) -> OpenSearchBackend {
    OpenSearchBackend::new(
        endpoint,
        "us-east-1",
        "aoss",
        AwsCredentials {
            access_key_id: "AKIDTEST".into(),
            secret_access_key: "secret".into(),
            session_token: Some("session".into()),
        },
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn test_opensearch_create_is_signed() {
    let (endpoint, fake) = spawn_fake(vec![]).await;
    let body = json!({ "settings": { "index.knn": "true" } });

    let outcome = backend(&endpoint).create_index("kb-index", &body).await.unwrap();
    assert_eq!(outcome, IndexCreation::Created);

    let seen = fake.seen.lock().unwrap();
    let (index, headers, received) = &seen[0];
    assert_eq!(index, "kb-index");
    assert_eq!(received, &body);
    let auth = headers["authorization"].to_str().unwrap();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDTEST/"));
    assert!(auth.contains("/us-east-1/aoss/aws4_request"));
    assert_eq!(headers["x-amz-security-token"], "session");
    assert!(headers.contains_key("x-amz-content-sha256"));
}

#[tokio::test]
async fn test_opensearch_classifies_responses() {
    let (endpoint, _fake) = spawn_fake(vec![
        (
            400,
            json!({ "error": { "type": "resource_already_exists_exception", "reason": "exists" }, "status": 400 }),
        ),
        (
            400,
            json!({ "error": { "type": "mapper_parsing_exception", "reason": "bad dimension" }, "status": 400 }),
        ),
        (403, json!({ "message": "Forbidden" })),
        (503, json!({})),
    ])
    .await;
    let b = backend(&endpoint);
    let body = json!({});

    assert_eq!(
        b.create_index("kb-index", &body).await,
        Ok(IndexCreation::AlreadyExists)
    );
    assert!(matches!(
        b.create_index("kb-index", &body).await,
        Err(BackendError::Rejected(_))
    ));
    assert!(matches!(
        b.create_index("kb-index", &body).await,
        Err(BackendError::Transient(_))
    ));
    assert!(matches!(
        b.create_index("kb-index", &body).await,
        Err(BackendError::Transient(_))
    ));
}

#[tokio::test]
async fn test_opensearch_unreachable_is_transient() {
    // Bind and drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = backend(&format!("http://{}", addr))
        .create_index("kb-index", &json!({}))
        .await;
    assert!(matches!(result, Err(BackendError::Transient(_))));
}
