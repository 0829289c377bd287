//! Hosted LLM provider descriptors.
//!
//! An [`LlmSpec`] is everything a chat client needs to talk to one model on
//! one provider: the model id, the sampling temperature, and the
//! environment-derived settings the provider requires. It does not open a
//! connection.
//!
//! | Provider | Accepted names | Environment |
//! |----------|----------------|-------------|
//! | OpenAI | `openai` | |
//! | Azure OpenAI | `azure-openai` | `OPENAI_API_VERSION` |
//! | Vertex AI | `vertexai` | |
//! | AWS Bedrock | `aws-bedrock`, `aws-redrock` | `AWS_PROFILE` |
//! | Anthropic | `anthropic` | |
//!
//! Bedrock and Anthropic default to temperature `0`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use agent_stack_core::text;

use crate::input::read_input;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure-openai")]
    AzureOpenAi,
    #[serde(rename = "vertexai")]
    VertexAi,
    AwsBedrock,
    Anthropic,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::AzureOpenAi => "azure-openai",
            LlmProvider::VertexAi => "vertexai",
            LlmProvider::AwsBedrock => "aws-bedrock",
            LlmProvider::Anthropic => "anthropic",
        }
    }

    /// Temperature applied when the caller sets none.
    fn default_temperature(&self) -> Option<f64> {
        match self {
            LlmProvider::AwsBedrock | LlmProvider::Anthropic => Some(0.0),
            _ => None,
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "azure-openai" => Ok(LlmProvider::AzureOpenAi),
            "vertexai" => Ok(LlmProvider::VertexAi),
            "aws-bedrock" | "aws-redrock" => Ok(LlmProvider::AwsBedrock),
            "anthropic" => Ok(LlmProvider::Anthropic),
            other => bail!(
                "Unknown LLM provider: '{}'. Must be openai, azure-openai, vertexai, aws-bedrock or anthropic.",
                other
            ),
        }
    }
}

/// Caller-supplied knobs.
#[derive(Debug, Clone, Default)]
pub struct LlmOptions {
    pub verbose: bool,
    pub temperature: Option<f64>,
    /// Passed through to the provider untouched.
    pub model_kwargs: Map<String, Value>,
}

/// A resolved provider descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmSpec {
    pub provider: LlmProvider,
    pub model: String,
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Azure only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Bedrock only: named AWS credentials profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_profile: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub model_kwargs: Map<String, Value>,
}

impl LlmSpec {
    /// Resolve a descriptor, reading provider settings from the process
    /// environment.
    pub fn resolve(provider: &str, model: &str, options: LlmOptions) -> Result<Self> {
        Self::resolve_with_env(provider, model, options, |key| std::env::var(key).ok())
    }

    /// Like [`resolve`](Self::resolve) with an explicit environment lookup.
    pub fn resolve_with_env(
        provider: &str,
        model: &str,
        options: LlmOptions,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let provider: LlmProvider = provider.parse()?;
        if model.trim().is_empty() {
            bail!("model must not be empty");
        }
        if let Some(t) = options.temperature {
            if !(0.0..=2.0).contains(&t) {
                bail!("temperature must be in [0, 2], got {}", t);
            }
        }

        let temperature = options.temperature.or(provider.default_temperature());
        let mut spec = LlmSpec {
            provider,
            model: model.trim().to_string(),
            verbose: options.verbose,
            temperature,
            api_version: None,
            credentials_profile: None,
            model_kwargs: Map::new(),
        };

        match provider {
            LlmProvider::OpenAi | LlmProvider::VertexAi => {}
            LlmProvider::AzureOpenAi => {
                spec.api_version = env("OPENAI_API_VERSION");
                spec.model_kwargs = options.model_kwargs;
            }
            LlmProvider::AwsBedrock => {
                spec.credentials_profile = env("AWS_PROFILE");
                // Bedrock takes sampling parameters through model kwargs.
                let mut kwargs = options.model_kwargs;
                if let Some(t) = temperature {
                    kwargs.insert("temperature".to_string(), Value::from(t));
                }
                spec.model_kwargs = kwargs;
            }
            LlmProvider::Anthropic => {}
        }

        Ok(spec)
    }
}

/// `agent-stack llm`: print the resolved descriptor.
pub fn run_llm(provider: &str, model: &str, temperature: Option<f64>, verbose: bool) -> Result<()> {
    let spec = LlmSpec::resolve(
        provider,
        model,
        LlmOptions {
            verbose,
            temperature,
            model_kwargs: Map::new(),
        },
    )?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}

/// Apply one extraction helper by name.
pub fn extract(part: &str, completion: &str) -> Result<String> {
    let out = match part {
        "code" => text::tag_code(completion),
        "answer" => text::tag_answer(completion),
        "data" => text::tag_data(completion),
        "markdown" => text::remove_markdown(completion),
        "thinking" => text::remove_thinking(completion),
        other => bail!(
            "Unknown extraction: '{}'. Must be code, answer, data, markdown or thinking.",
            other
        ),
    };
    Ok(out)
}

/// `agent-stack extract`: read a completion from `path` (or stdin for `-`)
/// and print the requested part.
pub fn run_extract(part: &str, path: &Path) -> Result<()> {
    let completion = read_input(path, "completion")?;
    println!("{}", extract(part, &completion)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_redrock_alias() {
        assert_eq!("aws-redrock".parse::<LlmProvider>().unwrap(), LlmProvider::AwsBedrock);
        assert_eq!("AWS-Bedrock".parse::<LlmProvider>().unwrap(), LlmProvider::AwsBedrock);
        assert!("cohere".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn test_bedrock_reads_profile_and_defaults_temperature() {
        let spec = LlmSpec::resolve_with_env(
            "aws-redrock",
            "anthropic.claude-3-sonnet-20240229-v1:0",
            LlmOptions::default(),
            env(&[("AWS_PROFILE", "dev")]),
        )
        .unwrap();
        assert_eq!(spec.credentials_profile.as_deref(), Some("dev"));
        assert_eq!(spec.temperature, Some(0.0));
        assert_eq!(spec.model_kwargs["temperature"], Value::from(0.0));
    }

    #[test]
    fn test_azure_reads_api_version() {
        let mut kwargs = Map::new();
        kwargs.insert("top_p".into(), Value::from(0.9));
        let spec = LlmSpec::resolve_with_env(
            "azure-openai",
            "gpt-4o-deployment",
            LlmOptions {
                model_kwargs: kwargs,
                ..Default::default()
            },
            env(&[("OPENAI_API_VERSION", "2024-02-01")]),
        )
        .unwrap();
        assert_eq!(spec.api_version.as_deref(), Some("2024-02-01"));
        assert_eq!(spec.temperature, None);
        assert_eq!(spec.model_kwargs["top_p"], Value::from(0.9));
    }

    #[test]
    fn test_anthropic_temperature_override() {
        let spec = LlmSpec::resolve_with_env(
            "anthropic",
            "claude-3-5-sonnet",
            LlmOptions {
                temperature: Some(0.7),
                ..Default::default()
            },
            env(&[]),
        )
        .unwrap();
        assert_eq!(spec.temperature, Some(0.7));
        assert!(spec.model_kwargs.is_empty());
    }

    #[test]
    fn test_rejects_empty_model_and_bad_temperature() {
        assert!(LlmSpec::resolve_with_env("openai", " ", LlmOptions::default(), env(&[])).is_err());
        let opts = LlmOptions {
            temperature: Some(3.5),
            ..Default::default()
        };
        assert!(LlmSpec::resolve_with_env("openai", "gpt-4o", opts, env(&[])).is_err());
    }

    #[test]
    fn test_extract_dispatch() {
        let completion = "<thinking>plan</thinking>\n<ANSWER>42</ANSWER>";
        assert_eq!(extract("answer", completion).unwrap(), "42");
        assert_eq!(extract("code", completion).unwrap(), "");
        assert_eq!(extract("thinking", completion).unwrap(), "<ANSWER>42</ANSWER>");
        assert!(extract("summary", completion).is_err());
    }

    #[test]
    fn test_serializes_provider_name() {
        let spec =
            LlmSpec::resolve_with_env("vertexai", "gemini-pro", LlmOptions::default(), env(&[]))
                .unwrap();
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["provider"], "vertexai");
        assert!(v.get("temperature").is_none());
    }
}
