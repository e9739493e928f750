//! Provider trait: the abstraction over the model API.
//!
//! A Provider knows how to send one Messages request and return the parsed
//! content blocks. Retrying transient failures is the provider's job; the
//! sampling loop treats any error it receives as final.
//!
//! Implementations: Anthropic direct API, AWS Bedrock, Google Vertex.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProviderError;
use crate::message::{ContentBlock, Message};

/// Which hosting platform serves the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiProvider {
    #[default]
    Anthropic,
    Bedrock,
    Vertex,
}

impl ApiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Bedrock => "bedrock",
            Self::Vertex => "vertex",
        }
    }
}

impl fmt::Display for ApiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "bedrock" => Ok(Self::Bedrock),
            "vertex" => Ok(Self::Vertex),
            other => Err(format!("unknown API provider '{other}'")),
        }
    }
}

/// A tool entry in the request `tools` array.
///
/// Provider-defined tools (computer, bash, editor) are sent as a bare
/// `{type, name, ...options}`; everything else carries a full schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolDefinition {
    Custom {
        name: String,
        description: String,
        input_schema: serde_json::Value,
    },
    Builtin {
        #[serde(rename = "type")]
        api_type: String,
        name: String,
        #[serde(flatten)]
        options: serde_json::Map<String, serde_json::Value>,
    },
}

impl ToolDefinition {
    pub fn custom(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self::Custom {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    pub fn builtin(api_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Builtin {
            api_type: api_type.into(),
            name: name.into(),
            options: serde_json::Map::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        if let Self::Builtin { options, .. } = &mut self {
            options.insert(key.to_string(), value);
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Custom { name, .. } | Self::Builtin { name, .. } => name,
        }
    }
}

/// Extended-thinking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub budget_tokens: u32,
}

impl ThinkingConfig {
    pub fn enabled(budget_tokens: u32) -> Self {
        Self {
            kind: "enabled".into(),
            budget_tokens,
        }
    }
}

/// One Messages API request.
///
/// `betas` travel as a header (or a body field on Bedrock) so they are not
/// part of the serialized body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,

    pub max_tokens: u32,

    /// System prompt blocks.
    pub system: Vec<ContentBlock>,

    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,

    #[serde(skip)]
    pub betas: Vec<String>,
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

/// A complete response from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    #[serde(default)]
    pub id: String,

    /// Which model actually responded.
    #[serde(default)]
    pub model: String,

    pub content: Vec<ContentBlock>,

    #[serde(default)]
    pub stop_reason: Option<String>,

    #[serde(default)]
    pub usage: Option<Usage>,

    /// HTTP status of the final attempt.
    #[serde(skip)]
    pub status: u16,

    /// The undecoded response body, kept for the raw-exchange callback.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

/// The core Provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic", "bedrock").
    fn name(&self) -> &str;

    /// Whether requests may carry cache breakpoints.
    fn supports_prompt_caching(&self) -> bool {
        false
    }

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_provider_parses_case_insensitively() {
        assert_eq!("Bedrock".parse::<ApiProvider>().unwrap(), ApiProvider::Bedrock);
        assert_eq!("vertex".parse::<ApiProvider>().unwrap(), ApiProvider::Vertex);
        assert!("openai".parse::<ApiProvider>().is_err());
        assert_eq!(ApiProvider::default().to_string(), "anthropic");
    }

    #[test]
    fn builtin_tool_definition_flattens_options() {
        let def = ToolDefinition::builtin("computer_20250124", "computer")
            .with_option("display_width_px", json!(1024))
            .with_option("display_height_px", json!(768));
        assert_eq!(
            serde_json::to_value(&def).unwrap(),
            json!({
                "type": "computer_20250124",
                "name": "computer",
                "display_width_px": 1024,
                "display_height_px": 768
            })
        );
    }

    #[test]
    fn custom_tool_definition_serialization() {
        let def = ToolDefinition::custom(
            "assert",
            "Validate JSON data",
            json!({"type": "object", "properties": {}}),
        );
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["name"], "assert");
        assert!(value.get("type").is_none());
        assert_eq!(def.name(), "assert");
    }

    #[test]
    fn request_body_omits_betas_and_empty_fields() {
        let req = ProviderRequest {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 4096,
            system: vec![ContentBlock::text("be brief")],
            messages: vec![Message::user("hi")],
            tools: vec![],
            thinking: None,
            betas: vec!["computer-use-2025-01-24".into()],
        };
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("betas").is_none());
        assert!(value.get("tools").is_none());
        assert!(value.get("thinking").is_none());
        assert_eq!(value["system"][0]["text"], "be brief");
    }

    #[test]
    fn thinking_config_shape() {
        let value = serde_json::to_value(ThinkingConfig::enabled(2048)).unwrap();
        assert_eq!(value, json!({"type": "enabled", "budget_tokens": 2048}));
    }
}
