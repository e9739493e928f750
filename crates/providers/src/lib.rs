//! Model providers for Tilt.
//!
//! All providers implement the `tilt_core::Provider` trait. [`build_provider`]
//! selects the hosting platform from configuration.

pub mod anthropic;
pub mod sigv4;

pub use anthropic::{AnthropicProvider, Platform};
pub use sigv4::AwsCredentials;

use std::sync::Arc;
use std::time::Duration;
use tilt_config::ModelConfig;
use tilt_core::ApiProvider;
use tilt_core::error::ProviderError;
use tilt_core::provider::Provider;

/// Build the provider named by `config.provider`.
///
/// `api_key` is only consulted for the direct Anthropic API; Bedrock reads
/// AWS credentials from the environment and Vertex uses gcloud.
pub fn build_provider(
    config: &ModelConfig,
    api_key: Option<&str>,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let platform = match config.provider {
        ApiProvider::Anthropic => {
            let api_key = api_key
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ProviderError::NotConfigured("Anthropic API key is not set".into()))?;
            Platform::Direct {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_key: api_key.to_string(),
            }
        }
        ApiProvider::Bedrock => Platform::Bedrock {
            region: config.aws_region.clone(),
            credentials: AwsCredentials::from_env()?,
        },
        ApiProvider::Vertex => Platform::Vertex {
            region: config.vertex_region.clone(),
            project_id: config.vertex_project_id.clone().ok_or_else(|| {
                ProviderError::NotConfigured("ANTHROPIC_VERTEX_PROJECT_ID is not set".into())
            })?,
        },
    };

    tracing::info!(provider = %config.provider, model = %config.model, "Model provider ready");

    Ok(Arc::new(
        AnthropicProvider::with_platform(platform)
            .with_max_retries(config.max_retries)
            .with_timeout(Duration::from_secs(config.request_timeout_secs)),
    ))
}
