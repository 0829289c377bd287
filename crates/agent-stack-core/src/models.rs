//! Request and response types for the custom-resource invocation contract.
//!
//! The orchestration engine delivers a JSON event whose keys are
//! PascalCase (`RequestType`, `ResourceProperties`, …) and expects a
//! response of the same shape. Property values may arrive either as
//! strings (the engine stringifies everything) or as native numbers, so
//! numeric fields are parsed leniently.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::GateError;
use crate::mapping::{Engine, SpaceType};

/// Lifecycle event kind delivered by the orchestration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestType::Create => "Create",
            RequestType::Update => "Update",
            RequestType::Delete => "Delete",
        };
        f.write_str(s)
    }
}

/// Inbound custom-resource event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomActionRequest {
    pub request_type: RequestType,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub stack_id: String,
    /// Idempotency key for the gate.
    pub logical_resource_id: String,
    /// Present on Update and Delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default, rename = "ResponseURL", skip_serializing_if = "Option::is_none")]
    pub response_url: Option<String>,
    #[serde(default)]
    pub resource_properties: IndexProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_resource_properties: Option<IndexProperties>,
}

/// `ResourceProperties` of the index gate.
///
/// Every field defaults so that a sparse Delete event still parses;
/// validation happens in the Create handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_token: Option<String>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub index_name: String,
    #[serde(default)]
    pub field_name: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub dimensions: i64,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_field: Option<String>,
    /// Output dimensionality of the embedding model feeding this index.
    #[serde(
        default,
        deserialize_with = "lenient_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_dimensions: Option<i64>,
    /// Vector engine; the mapping default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<Engine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_type: Option<SpaceType>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub ef_construction: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub m: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub ef_search: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Lenient {
    fn into_i64<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Lenient::Int(v) => Ok(v),
            Lenient::Float(v) if v.fract() == 0.0 => Ok(v as i64),
            Lenient::Float(v) => Err(E::custom(format!("expected an integer, got {}", v))),
            Lenient::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| E::custom(format!("expected an integer, got '{}'", s))),
        }
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    Lenient::deserialize(de)?.into_i64()
}

fn lenient_opt_i64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
    match Option::<Lenient>::deserialize(de)? {
        Some(v) => v.into_i64().map(Some),
        None => Ok(None),
    }
}

/// Outcome status reported back to the orchestration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// How a successful invocation was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// This invocation created the index.
    Created,
    /// The backend already held the index.
    AlreadyExisted,
    /// The ledger already recorded the index as created; no backend call.
    Recorded,
    /// Update: identity returned unchanged.
    Unchanged,
    /// Delete: the index was left in place.
    Retained,
}

/// Successful result of a gate invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub physical_resource_id: String,
    pub index_name: String,
    pub disposition: Disposition,
}

/// The handler's result: either an outcome or a classified failure.
pub type CustomActionResult = Result<GateOutcome, GateError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
}

/// Outbound custom-resource response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomActionResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub physical_resource_id: String,
    #[serde(default)]
    pub stack_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub logical_resource_id: String,
    #[serde(default)]
    pub data: ResponseData,
    /// Not part of the engine contract; lets front ends decide on retries.
    #[serde(skip)]
    pub retryable: bool,
}

impl CustomActionResponse {
    /// Build the response for `request` from a handler result.
    ///
    /// On failure the physical id falls back to the incoming one, then to
    /// the logical id: the engine requires a non-empty value even for a
    /// failed Create.
    pub fn from_result(request: &CustomActionRequest, result: &CustomActionResult) -> Self {
        match result {
            Ok(outcome) => Self {
                status: ResponseStatus::Success,
                reason: None,
                physical_resource_id: outcome.physical_resource_id.clone(),
                stack_id: request.stack_id.clone(),
                request_id: request.request_id.clone(),
                logical_resource_id: request.logical_resource_id.clone(),
                data: ResponseData {
                    index_name: Some(outcome.index_name.clone()),
                },
                retryable: false,
            },
            Err(err) => Self {
                status: ResponseStatus::Failed,
                reason: Some(err.to_string()),
                physical_resource_id: request
                    .physical_resource_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| request.logical_resource_id.clone()),
                stack_id: request.stack_id.clone(),
                request_id: request.request_id.clone(),
                logical_resource_id: request.logical_resource_id.clone(),
                data: ResponseData::default(),
                retryable: err.is_retryable(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_engine_event_with_string_numbers() {
        let raw = r#"{
            "RequestType": "Create",
            "RequestId": "req-1",
            "StackId": "arn:aws:cloudformation:us-east-1:123:stack/demo/abc",
            "LogicalResourceId": "LambdaCreateIndexCustomResource",
            "ResourceType": "Custom::CreateIndex",
            "ResponseURL": "https://example.invalid/cb",
            "ResourceProperties": {
                "ServiceToken": "arn:aws:lambda:us-east-1:123:function:x",
                "Endpoint": "https://abc.us-east-1.aoss.amazonaws.com",
                "IndexName": "kb-index",
                "FieldName": "kb-vector",
                "Dimensions": "1024",
                "Region": "us-east-1"
            }
        }"#;
        let req: CustomActionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.request_type, RequestType::Create);
        assert_eq!(req.resource_properties.dimensions, 1024);
        assert_eq!(req.resource_properties.index_name, "kb-index");
        assert!(req.physical_resource_id.is_none());
        assert_eq!(req.response_url.as_deref(), Some("https://example.invalid/cb"));
    }

    #[test]
    fn test_parses_negative_native_number() {
        let raw = r#"{
            "RequestType": "Create",
            "LogicalResourceId": "Gate",
            "ResourceProperties": { "IndexName": "i", "FieldName": "f", "Dimensions": -1 }
        }"#;
        let req: CustomActionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.resource_properties.dimensions, -1);
    }

    #[test]
    fn test_rejects_non_numeric_dimensions() {
        let raw = r#"{
            "RequestType": "Create",
            "LogicalResourceId": "Gate",
            "ResourceProperties": { "Dimensions": "lots" }
        }"#;
        assert!(serde_json::from_str::<CustomActionRequest>(raw).is_err());
    }

    #[test]
    fn test_sparse_delete_event_parses() {
        let raw = r#"{
            "RequestType": "Delete",
            "LogicalResourceId": "Gate",
            "PhysicalResourceId": "kb-index"
        }"#;
        let req: CustomActionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.request_type, RequestType::Delete);
        assert_eq!(req.resource_properties, IndexProperties::default());
    }

    #[test]
    fn test_failed_response_falls_back_to_logical_id() {
        let req = CustomActionRequest {
            request_type: RequestType::Create,
            request_id: "r".into(),
            stack_id: "s".into(),
            logical_resource_id: "Gate".into(),
            physical_resource_id: None,
            resource_type: String::new(),
            response_url: None,
            resource_properties: IndexProperties::default(),
            old_resource_properties: None,
        };
        let resp = CustomActionResponse::from_result(&req, &Err(GateError::terminal("bad")));
        assert_eq!(resp.status, ResponseStatus::Failed);
        assert_eq!(resp.physical_resource_id, "Gate");
        assert!(!resp.retryable);

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["Status"], "FAILED");
        assert!(json.get("Retryable").is_none());
    }
}
