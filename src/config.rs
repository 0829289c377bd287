//! TOML configuration parsing and validation.
//!
//! ```toml
//! [stack]
//! name = "BedrockAgentStack"
//! region = "us-east-1"
//!
//! [collection]
//! name = "bedrock-agent-test"
//! # endpoint = "https://abc123.us-east-1.aoss.amazonaws.com"
//!
//! [index]
//! name = "bedrock-knowledgebase-index"
//! vector_field = "bedrock-knowledgebase-default-vector"
//!
//! [embedding]
//! model = "cohere.embed-english-v3"
//! ```
//!
//! Every other section and key has a default matching the stack shipped in
//! this repository.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use agent_stack_core::mapping::{
    model_dimensions, Engine, HnswParams, IndexMapping, SpaceType, DEFAULT_METADATA_FIELD,
    DEFAULT_TEXT_FIELD,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub stack: StackConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub data_source: DataSourceConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StackConfig {
    pub name: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub account: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default = "default_collection_name")]
    pub name: String,
    /// Collection endpoint; only needed by `bootstrap` and `serve`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// SigV4 service name: `aoss` (serverless) or `es` (managed domains).
    #[serde(default = "default_service")]
    pub service: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: default_collection_name(),
            endpoint: None,
            service: default_service(),
        }
    }
}

fn default_collection_name() -> String {
    "bedrock-agent-test".to_string()
}
fn default_service() -> String {
    "aoss".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_name")]
    pub name: String,
    #[serde(default = "default_vector_field")]
    pub vector_field: String,
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(default = "default_metadata_field")]
    pub metadata_field: String,
    /// Defaults to the embedding model's dimensionality.
    #[serde(default)]
    pub dimensions: Option<i64>,
    #[serde(default = "default_engine")]
    pub engine: Engine,
    #[serde(default = "default_space_type")]
    pub space_type: SpaceType,
    #[serde(default = "default_ef")]
    pub ef_construction: u32,
    #[serde(default = "default_m")]
    pub m: u32,
    #[serde(default = "default_ef")]
    pub ef_search: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: default_index_name(),
            vector_field: default_vector_field(),
            text_field: default_text_field(),
            metadata_field: default_metadata_field(),
            dimensions: None,
            engine: default_engine(),
            space_type: default_space_type(),
            ef_construction: default_ef(),
            m: default_m(),
            ef_search: default_ef(),
        }
    }
}

fn default_index_name() -> String {
    "bedrock-knowledgebase-index".to_string()
}
fn default_vector_field() -> String {
    "bedrock-knowledgebase-default-vector".to_string()
}
fn default_text_field() -> String {
    DEFAULT_TEXT_FIELD.to_string()
}
fn default_metadata_field() -> String {
    DEFAULT_METADATA_FIELD.to_string()
}
fn default_engine() -> Engine {
    Engine::Faiss
}
fn default_space_type() -> SpaceType {
    SpaceType::L2
}
fn default_ef() -> u32 {
    512
}
fn default_m() -> u32 {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Required when `model` is not in the built-in table.
    #[serde(default)]
    pub dims: Option<i64>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dims: None,
        }
    }
}

fn default_embedding_model() -> String {
    "cohere.embed-english-v3".to_string()
}

impl EmbeddingConfig {
    /// Output dimensionality: the explicit `dims`, else the known-model table.
    pub fn resolved_dims(&self) -> Option<i64> {
        self.dims.or_else(|| model_dimensions(&self.model))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_foundation_model")]
    pub foundation_model: String,
    #[serde(default = "default_instruction")]
    pub instruction: String,
    #[serde(default = "default_idle_ttl")]
    pub idle_session_ttl_secs: u64,
    #[serde(default = "default_role_name")]
    pub role_name: String,
    #[serde(default = "default_kb_name")]
    pub knowledge_base_name: String,
    #[serde(default = "default_kb_description")]
    pub knowledge_base_description: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            foundation_model: default_foundation_model(),
            instruction: default_instruction(),
            idle_session_ttl_secs: default_idle_ttl(),
            role_name: default_role_name(),
            knowledge_base_name: default_kb_name(),
            knowledge_base_description: default_kb_description(),
        }
    }
}

fn default_agent_name() -> String {
    "TestBedrockAgent".to_string()
}
fn default_foundation_model() -> String {
    "anthropic.claude-3-sonnet-20240229-v1:0".to_string()
}
fn default_instruction() -> String {
    "You are a friendly chat bot. You have access to a knowledge base to answer questions AWS \
     related questions."
        .to_string()
}
fn default_idle_ttl() -> u64 {
    3600
}
fn default_role_name() -> String {
    "AmazonBedrockExecutionRoleForAgents_test".to_string()
}
fn default_kb_name() -> String {
    "BedrockKnowledgeBase".to_string()
}
fn default_kb_description() -> String {
    "Use this for returning descriptive answers and instructions directly from AWS EC2 \
     Documentation. Use to answer qualitative/guidance questions such as 'how do I', general \
     instructions and guidelines."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataSourceConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Local archive uploaded under `prefix`.
    #[serde(default = "default_asset")]
    pub asset: PathBuf,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            prefix: default_prefix(),
            asset: default_asset(),
        }
    }
}

fn default_bucket() -> String {
    "agent-datasource".to_string()
}
fn default_prefix() -> String {
    "knowledgebase_data_source".to_string()
}
fn default_asset() -> PathBuf {
    PathBuf::from("assets/knowledgebase_data_source/ec2.zip")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Hard ceiling on one gate action, including retries.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request HTTP timeout against the collection.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_timeout_secs() -> u64 {
    900
}
fn default_max_retries() -> u32 {
    8
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    /// The index mapping the stack declares, sized to the embedding model.
    pub fn index_mapping(&self) -> IndexMapping {
        let dims = self
            .index
            .dimensions
            .or_else(|| self.embedding.resolved_dims())
            .unwrap_or(0);
        let mut mapping = IndexMapping::new(&self.index.name, &self.index.vector_field, dims);
        mapping.text_field = self.index.text_field.clone();
        mapping.metadata_field = self.index.metadata_field.clone();
        mapping.engine = self.index.engine;
        mapping.space_type = self.index.space_type;
        mapping.hnsw = HnswParams {
            ef_construction: self.index.ef_construction,
            m: self.index.m,
            ef_search: self.index.ef_search,
        };
        mapping
    }

    /// A config with every default applied, for commands that can run
    /// without a file.
    pub fn minimal() -> Self {
        Self {
            stack: StackConfig {
                name: "BedrockAgentStack".to_string(),
                region: default_region(),
                account: None,
            },
            collection: CollectionConfig::default(),
            index: IndexConfig::default(),
            embedding: EmbeddingConfig::default(),
            agent: AgentConfig::default(),
            data_source: DataSourceConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.stack.name.trim().is_empty() {
        bail!("stack.name must not be empty");
    }

    // Embedding
    let model_dims = match config.embedding.resolved_dims() {
        Some(d) if d > 0 => d,
        Some(d) => bail!("embedding.dims must be > 0, got {}", d),
        None => bail!(
            "embedding.dims must be set: model '{}' has no known dimensionality",
            config.embedding.model
        ),
    };

    // Index mapping must agree with the embedding model
    config
        .index_mapping()
        .validate(Some(model_dims))
        .map_err(|e| anyhow::anyhow!("index: {}", e))?;

    match config.collection.service.as_str() {
        "aoss" | "es" => {}
        other => bail!(
            "Unknown collection.service: '{}'. Must be aoss or es.",
            other
        ),
    }

    // Provider
    if config.provider.timeout_secs == 0 {
        bail!("provider.timeout_secs must be > 0");
    }
    if config.provider.request_timeout_secs == 0 {
        bail!("provider.request_timeout_secs must be > 0");
    }
    if config.agent.idle_session_ttl_secs < 60 || config.agent.idle_session_ttl_secs > 3600 {
        bail!("agent.idle_session_ttl_secs must be in [60, 3600]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let cfg = parse("[stack]\nname = \"demo\"\n").unwrap();
        assert_eq!(cfg.index.name, "bedrock-knowledgebase-index");
        assert_eq!(cfg.embedding.resolved_dims(), Some(1024));
        assert_eq!(cfg.index_mapping().dimensions, 1024);
        assert_eq!(cfg.provider.timeout_secs, 900);
        assert_eq!(cfg.collection.service, "aoss");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let err = parse("[stack]\nname = \"demo\"\n[index]\ndimensions = 1536\n").unwrap_err();
        assert!(err.to_string().contains("dimensionality"), "{}", err);
    }

    #[test]
    fn test_unknown_model_requires_dims() {
        assert!(parse("[stack]\nname = \"d\"\n[embedding]\nmodel = \"custom\"\n").is_err());
        let cfg = parse("[stack]\nname = \"d\"\n[embedding]\nmodel = \"custom\"\ndims = 768\n").unwrap();
        assert_eq!(cfg.index_mapping().dimensions, 768);
    }

    #[test]
    fn test_engine_and_space_type_parse() {
        let cfg = parse(
            "[stack]\nname = \"d\"\n[index]\nengine = \"nmslib\"\nspace_type = \"cosinesimil\"\n",
        )
        .unwrap();
        assert_eq!(cfg.index.engine, Engine::Nmslib);
        assert_eq!(cfg.index.space_type, SpaceType::Cosinesimil);
    }

    #[test]
    fn test_unknown_service_rejected() {
        assert!(parse("[stack]\nname = \"d\"\n[collection]\nservice = \"s3\"\n").is_err());
    }

    #[test]
    fn test_minimal_is_valid() {
        assert!(validate(&Config::minimal()).is_ok());
    }
}
