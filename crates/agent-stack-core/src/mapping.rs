//! Vector index mapping and its validation.
//!
//! An [`IndexMapping`] describes the one k-NN vector field plus the text
//! and metadata fields the knowledge base writes into. [`IndexMapping::validate`]
//! is the single place that decides whether a mapping is acceptable; every
//! failure it reports is terminal.
//!
//! The rendered body looks like:
//!
//! ```json
//! {
//!   "settings": { "index.knn": "true", "number_of_shards": 1,
//!                 "knn.algo_param.ef_search": 512, "number_of_replicas": 0 },
//!   "mappings": { "properties": {
//!     "<vector>": { "type": "knn_vector", "dimension": 1024,
//!                   "method": { "name": "hnsw", "engine": "faiss", "space_type": "l2",
//!                               "parameters": { "ef_construction": 512, "m": 16 } } },
//!     "AMAZON_BEDROCK_METADATA": { "type": "text", "index": "false" },
//!     "AMAZON_BEDROCK_TEXT_CHUNK": { "type": "text" } } }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ConfigurationError;

pub const DEFAULT_TEXT_FIELD: &str = "AMAZON_BEDROCK_TEXT_CHUNK";
pub const DEFAULT_METADATA_FIELD: &str = "AMAZON_BEDROCK_METADATA";

/// Upper bound on `knn_vector` dimension accepted by the search engine.
pub const MAX_DIMENSIONS: i64 = 16_000;

/// Embedding models with a known, fixed output dimensionality.
const KNOWN_MODELS: &[(&str, i64)] = &[
    ("cohere.embed-english-v3", 1024),
    ("cohere.embed-multilingual-v3", 1024),
    ("amazon.titan-embed-text-v1", 1536),
    ("amazon.titan-embed-text-v2:0", 1024),
];

/// Output dimensionality of a known embedding model, if any.
pub fn model_dimensions(model_id: &str) -> Option<i64> {
    KNOWN_MODELS
        .iter()
        .find(|(id, _)| *id == model_id)
        .map(|(_, dims)| *dims)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Faiss,
    Nmslib,
    Lucene,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Faiss => "faiss",
            Engine::Nmslib => "nmslib",
            Engine::Lucene => "lucene",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    L2,
    Innerproduct,
    Cosinesimil,
}

impl SpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::L2 => "l2",
            SpaceType::Innerproduct => "innerproduct",
            SpaceType::Cosinesimil => "cosinesimil",
        }
    }
}

/// HNSW method parameters for the vector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    pub ef_construction: u32,
    pub m: u32,
    pub ef_search: u32,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            ef_construction: 512,
            m: 16,
            ef_search: 512,
        }
    }
}

/// The field layout of a knowledge-base vector index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMapping {
    pub index_name: String,
    pub vector_field: String,
    pub dimensions: i64,
    pub text_field: String,
    pub metadata_field: String,
    pub engine: Engine,
    pub space_type: SpaceType,
    pub hnsw: HnswParams,
}

impl IndexMapping {
    /// A mapping with the default text/metadata fields and engine settings.
    pub fn new(index_name: impl Into<String>, vector_field: impl Into<String>, dimensions: i64) -> Self {
        Self {
            index_name: index_name.into(),
            vector_field: vector_field.into(),
            dimensions,
            text_field: DEFAULT_TEXT_FIELD.to_string(),
            metadata_field: DEFAULT_METADATA_FIELD.to_string(),
            engine: Engine::Faiss,
            space_type: SpaceType::L2,
            hnsw: HnswParams::default(),
        }
    }

    /// Check the mapping against the engine's constraints and, when given,
    /// the embedding model's output dimensionality.
    pub fn validate(&self, expected_dims: Option<i64>) -> Result<(), ConfigurationError> {
        validate_index_name(&self.index_name)?;
        for (label, field) in [
            ("vector field", &self.vector_field),
            ("text field", &self.text_field),
            ("metadata field", &self.metadata_field),
        ] {
            if field.trim().is_empty() {
                return Err(ConfigurationError(format!("{} name must not be empty", label)));
            }
        }
        if self.vector_field == self.text_field || self.vector_field == self.metadata_field {
            return Err(ConfigurationError(format!(
                "vector field '{}' collides with a text/metadata field",
                self.vector_field
            )));
        }

        if self.dimensions < 1 || self.dimensions > MAX_DIMENSIONS {
            return Err(ConfigurationError(format!(
                "invalid dimensionality {}: must be between 1 and {}",
                self.dimensions, MAX_DIMENSIONS
            )));
        }
        if let Some(expected) = expected_dims {
            if expected != self.dimensions {
                return Err(ConfigurationError(format!(
                    "invalid dimensionality {}: embedding model produces {}-dimensional vectors",
                    self.dimensions, expected
                )));
            }
        }

        // faiss rejects cosine similarity; lucene caps dimension at 1024.
        if self.engine == Engine::Faiss && self.space_type == SpaceType::Cosinesimil {
            return Err(ConfigurationError(
                "space type 'cosinesimil' is not supported by the faiss engine".to_string(),
            ));
        }
        if self.engine == Engine::Lucene && self.dimensions > 1024 {
            return Err(ConfigurationError(format!(
                "invalid dimensionality {}: the lucene engine supports at most 1024",
                self.dimensions
            )));
        }
        if self.hnsw.m < 2 || self.hnsw.ef_construction < 2 || self.hnsw.ef_search < 2 {
            return Err(ConfigurationError(
                "hnsw parameters m, ef_construction and ef_search must all be >= 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the index-creation request body.
    pub fn to_index_body(&self) -> Value {
        let mut properties = serde_json::Map::new();
        properties.insert(
            self.vector_field.clone(),
            json!({
                "type": "knn_vector",
                "dimension": self.dimensions,
                "method": {
                    "name": "hnsw",
                    "engine": self.engine.as_str(),
                    "space_type": self.space_type.as_str(),
                    "parameters": {
                        "ef_construction": self.hnsw.ef_construction,
                        "m": self.hnsw.m,
                    },
                },
            }),
        );
        properties.insert(
            self.metadata_field.clone(),
            json!({ "type": "text", "index": "false" }),
        );
        properties.insert(self.text_field.clone(), json!({ "type": "text" }));

        json!({
            "settings": {
                "index.knn": "true",
                "number_of_shards": 1,
                "knn.algo_param.ef_search": self.hnsw.ef_search,
                "number_of_replicas": 0,
            },
            "mappings": { "properties": Value::Object(properties) },
        })
    }
}

/// Index names must be lowercase, non-empty, and free of the characters the
/// engine reserves.
fn validate_index_name(name: &str) -> Result<(), ConfigurationError> {
    if name.is_empty() {
        return Err(ConfigurationError("index name must not be empty".to_string()));
    }
    if name.len() > 255 {
        return Err(ConfigurationError(format!(
            "index name '{}' exceeds 255 bytes",
            name
        )));
    }
    if name.starts_with(['_', '-', '+']) {
        return Err(ConfigurationError(format!(
            "index name '{}' must not start with '_', '-' or '+'",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(ConfigurationError(format!("index name '{}' is reserved", name)));
    }
    let bad = |c: char| {
        c.is_ascii_uppercase()
            || c.is_whitespace()
            || matches!(c, '\\' | '/' | '*' | '?' | '"' | '<' | '>' | '|' | ',' | '#' | ':')
    };
    if let Some(c) = name.chars().find(|c| bad(*c)) {
        return Err(ConfigurationError(format!(
            "index name '{}' contains invalid character {:?}",
            name, c
        )));
    }
    Ok(())
}
