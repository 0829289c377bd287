//! OpenSearch (serverless or managed) implementation of [`IndexBackend`].
//!
//! Talks to the collection's REST API directly with SigV4-signed requests:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | `create_index` | `PUT /{index}` with the settings/mappings body |
//! | `index_exists` | `HEAD /{index}` |
//!
//! # Outcome classification
//!
//! | Response | Outcome |
//! |----------|---------|
//! | 2xx | `Created` |
//! | 400, `error.type = resource_already_exists_exception` | `AlreadyExists` |
//! | other 400, other 4xx | `Rejected` (terminal) |
//! | 401, 403, 404, 408, 429, 5xx, network error | `Transient` (retryable) |
//!
//! 401/403 are transient because a freshly created data access policy takes
//! a while to propagate to the collection; 404 because a new collection
//! endpoint is not routable immediately.

use std::time::Duration;

use agent_stack_core::backend::{IndexBackend, IndexCreation};
use agent_stack_core::error::BackendError;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::sigv4::{sign, uri_encode, AwsCredentials, SigningRequest};

/// A signed REST client bound to one collection endpoint.
pub struct OpenSearchBackend {
    client: reqwest::Client,
    /// `scheme://host[:port]`, no trailing slash.
    base_url: String,
    host: String,
    region: String,
    service: String,
    creds: AwsCredentials,
}

impl OpenSearchBackend {
    /// Create a client for `endpoint`. A bare host is treated as `https://`.
    pub fn new(
        endpoint: &str,
        region: &str,
        service: &str,
        creds: AwsCredentials,
        request_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            bail!("collection endpoint must not be empty");
        }
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("https://{}", endpoint)
        };
        let host = base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        if host.is_empty() || host.contains('/') {
            bail!("collection endpoint must be a bare origin, got '{}'", endpoint);
        }
        if region.trim().is_empty() {
            bail!("region must not be empty");
        }

        let client = reqwest::Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            base_url,
            host,
            region: region.to_string(),
            service: service.to_string(),
            creds,
        })
    }

    /// Build a client from the config, overriding endpoint/region when an
    /// event supplies its own.
    pub fn from_config(
        config: &Config,
        endpoint: Option<&str>,
        region: Option<&str>,
        creds: AwsCredentials,
    ) -> Result<Self> {
        let endpoint = endpoint
            .filter(|e| !e.trim().is_empty())
            .or(config.collection.endpoint.as_deref())
            .ok_or_else(|| anyhow::anyhow!("no collection endpoint: set collection.endpoint"))?;
        let region = region
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(&config.stack.region);
        Self::new(
            endpoint,
            region,
            &config.collection.service,
            creds,
            Duration::from_secs(config.provider.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: reqwest::Method,
        index: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, BackendError> {
        let path = format!("/{}", uri_encode(index));
        let payload = body.as_deref().unwrap_or(b"");
        let headers = sign(
            &self.creds,
            &SigningRequest {
                method: method.as_str(),
                host: &self.host,
                path: &path,
                query: &[],
                payload,
                region: &self.region,
                service: &self.service,
            },
            Utc::now(),
        );

        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        if let Some(bytes) = body {
            req = req.header("content-type", "application/json").body(bytes);
        }

        req.send()
            .await
            .map_err(|e| BackendError::Transient(format!("request to {} failed: {}", self.host, e)))
    }
}

#[async_trait]
impl IndexBackend for OpenSearchBackend {
    fn kind(&self) -> &str {
        "opensearch"
    }

    async fn create_index(&self, name: &str, body: &Value) -> Result<IndexCreation, BackendError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| BackendError::Rejected(format!("unserializable index body: {}", e)))?;
        let resp = self.send(reqwest::Method::PUT, name, Some(bytes)).await?;
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        debug!(index = name, status, "PUT index");
        classify_create(status, &text)
    }

    async fn index_exists(&self, name: &str) -> Result<bool, BackendError> {
        let resp = self.send(reqwest::Method::HEAD, name, None).await?;
        match resp.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            status => Err(classify_failure(status, "")),
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Structured {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Plain(String),
}

/// The `error.type` / `error.reason` pair from an OpenSearch error body.
fn error_detail(body: &str) -> (Option<String>, String) {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ErrorBody::Structured { kind, reason },
        }) => {
            let reason = reason.unwrap_or_else(|| kind.clone());
            (Some(kind), reason)
        }
        Ok(ErrorEnvelope {
            error: ErrorBody::Plain(msg),
        }) => (None, msg),
        Err(_) => (None, body.chars().take(500).collect()),
    }
}

/// Map a `PUT /{index}` response onto the backend contract.
pub fn classify_create(status: u16, body: &str) -> Result<IndexCreation, BackendError> {
    if (200..300).contains(&status) {
        return Ok(IndexCreation::Created);
    }
    if status == 400 {
        if let (Some(kind), _) = error_detail(body) {
            if kind == "resource_already_exists_exception" {
                return Ok(IndexCreation::AlreadyExists);
            }
        }
    }
    Err(classify_failure(status, body))
}

fn classify_failure(status: u16, body: &str) -> BackendError {
    let (kind, reason) = error_detail(body);
    let detail = match kind {
        Some(k) if k != reason => format!("HTTP {} {}: {}", status, k, reason),
        _ if reason.is_empty() => format!("HTTP {}", status),
        _ => format!("HTTP {}: {}", status, reason),
    };
    match status {
        401 | 403 | 404 | 408 | 429 | 500..=599 => BackendError::Transient(detail),
        _ => BackendError::Rejected(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        }
    }

    #[test]
    fn test_classify_success() {
        assert_eq!(
            classify_create(200, r#"{"acknowledged":true}"#),
            Ok(IndexCreation::Created)
        );
    }

    #[test]
    fn test_classify_already_exists() {
        let body = r#"{"error":{"root_cause":[],"type":"resource_already_exists_exception","reason":"index [kb-index/abc] already exists","index":"kb-index"},"status":400}"#;
        assert_eq!(classify_create(400, body), Ok(IndexCreation::AlreadyExists));
    }

    #[test]
    fn test_classify_mapper_error_is_rejected() {
        let body = r#"{"error":{"type":"mapper_parsing_exception","reason":"Dimension value must be greater than 0"},"status":400}"#;
        match classify_create(400, body) {
            Err(BackendError::Rejected(msg)) => {
                assert!(msg.contains("mapper_parsing_exception"));
                assert!(msg.contains("Dimension value"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_already_exists_text_outside_error_type_is_not_trusted() {
        let body = r#"{"error":{"type":"illegal_argument_exception","reason":"resource_already_exists_exception"}}"#;
        assert!(matches!(
            classify_create(400, body),
            Err(BackendError::Rejected(_))
        ));
    }

    #[test]
    fn test_classify_transient_statuses() {
        for status in [401, 403, 404, 408, 429, 500, 503] {
            assert!(
                matches!(classify_create(status, ""), Err(BackendError::Transient(_))),
                "status {} should be transient",
                status
            );
        }
        assert!(matches!(
            classify_create(409, "conflict"),
            Err(BackendError::Rejected(_))
        ));
    }

    #[test]
    fn test_plain_error_body() {
        match classify_create(403, r#"{"error":"forbidden","status":403}"#) {
            Err(BackendError::Transient(msg)) => assert_eq!(msg, "HTTP 403: forbidden"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_normalization() {
        let b = OpenSearchBackend::new(
            "abc.us-east-1.aoss.amazonaws.com/",
            "us-east-1",
            "aoss",
            creds(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(b.base_url(), "https://abc.us-east-1.aoss.amazonaws.com");

        assert!(OpenSearchBackend::new("", "us-east-1", "aoss", creds(), Duration::from_secs(5)).is_err());
        assert!(OpenSearchBackend::new(
            "https://host/path",
            "us-east-1",
            "aoss",
            creds(),
            Duration::from_secs(5)
        )
        .is_err());
    }
}
