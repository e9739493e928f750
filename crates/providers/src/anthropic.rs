//! Anthropic Messages API provider.
//!
//! One implementation serves all three hosting platforms. They share the
//! request body and response shape and differ in URL, auth and where the
//! beta flags travel:
//!
//! - Direct: `x-api-key` + `anthropic-version` headers, betas in `anthropic-beta`
//! - Bedrock: SigV4-signed, model in the path, betas in the body
//! - Vertex: OAuth bearer token, model in the path, betas in `anthropic-beta`
//!
//! Transient failures (rate limits, overload, 5xx, network) are retried
//! with exponential backoff up to `max_retries` times.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tilt_core::error::ProviderError;
use tilt_core::provider::*;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::sigv4::{self, AwsCredentials, SignableRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const BEDROCK_VERSION: &str = "bedrock-2023-05-31";
const VERTEX_VERSION: &str = "vertex-2023-10-16";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Access tokens from gcloud live an hour; refresh well before that.
const VERTEX_TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Where the model is hosted and how to authenticate there.
pub enum Platform {
    Direct {
        base_url: String,
        api_key: String,
    },
    Bedrock {
        region: String,
        credentials: AwsCredentials,
    },
    Vertex {
        region: String,
        project_id: String,
    },
}

/// A request ready to be sent, minus per-attempt auth.
struct PreparedRequest {
    url: String,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    platform: Platform,
    client: reqwest::Client,
    max_retries: u32,
    base_backoff: Duration,
    vertex_token: Mutex<Option<(String, Instant)>>,
}

impl AnthropicProvider {
    /// Create a provider for the direct Anthropic API.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_platform(Platform::Direct {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
        })
    }

    pub fn with_platform(platform: Platform) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .unwrap_or_default();

        Self {
            platform,
            client,
            max_retries: 4,
            base_backoff: Duration::from_millis(500),
            vertex_token: Mutex::new(None),
        }
    }

    /// Override the base URL of the direct API (tests, proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        if let Platform::Direct { base_url, .. } = &mut self.platform {
            *base_url = url.into().trim_end_matches('/').to_string();
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the first retry; doubles with each further attempt.
    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Build URL, body and static headers for `request`.
    fn prepare(&self, request: &ProviderRequest) -> Result<PreparedRequest, ProviderError> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| ProviderError::InvalidRequest(format!("Failed to encode request: {e}")))?;
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        let betas = request.betas.join(",");

        let url = match &self.platform {
            Platform::Direct { base_url, api_key } => {
                headers.push(("x-api-key".into(), api_key.clone()));
                headers.push(("anthropic-version".into(), ANTHROPIC_VERSION.into()));
                if !betas.is_empty() {
                    headers.push(("anthropic-beta".into(), betas));
                }
                format!("{base_url}/v1/messages")
            }
            Platform::Bedrock { region, .. } => {
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("model");
                    obj.insert("anthropic_version".into(), BEDROCK_VERSION.into());
                    if !request.betas.is_empty() {
                        obj.insert("anthropic_beta".into(), serde_json::json!(request.betas));
                    }
                }
                format!(
                    "https://bedrock-runtime.{region}.amazonaws.com/model/{}/invoke",
                    sigv4::uri_encode(&request.model)
                )
            }
            Platform::Vertex { region, project_id } => {
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("model");
                    obj.insert("anthropic_version".into(), VERTEX_VERSION.into());
                }
                if !betas.is_empty() {
                    headers.push(("anthropic-beta".into(), betas));
                }
                format!(
                    "https://{region}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{region}/publishers/anthropic/models/{}:rawPredict",
                    request.model
                )
            }
        };

        let body = serde_json::to_vec(&body)
            .map_err(|e| ProviderError::InvalidRequest(format!("Failed to encode request: {e}")))?;

        Ok(PreparedRequest { url, body, headers })
    }

    /// Headers that must be computed at send time.
    async fn auth_headers(&self, prepared: &PreparedRequest) -> Result<Vec<(String, String)>, ProviderError> {
        match &self.platform {
            Platform::Direct { .. } => Ok(Vec::new()),
            Platform::Bedrock { region, credentials } => {
                let url = reqwest::Url::parse(&prepared.url)
                    .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;
                let host = url.host_str().unwrap_or_default().to_string();
                let signed: Vec<(&str, &str)> = prepared
                    .headers
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                Ok(sigv4::sign(
                    credentials,
                    region,
                    "bedrock",
                    &SignableRequest {
                        method: "POST",
                        host: &host,
                        path: url.path(),
                        headers: &signed,
                        body: &prepared.body,
                    },
                    chrono::Utc::now(),
                ))
            }
            Platform::Vertex { .. } => {
                let token = self.vertex_access_token().await?;
                Ok(vec![("authorization".into(), format!("Bearer {token}"))])
            }
        }
    }

    /// `VERTEX_ACCESS_TOKEN` if set, otherwise a cached
    /// `gcloud auth print-access-token`.
    async fn vertex_access_token(&self) -> Result<String, ProviderError> {
        if let Ok(token) = std::env::var("VERTEX_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                return Ok(token.trim().to_string());
            }
        }

        let mut cached = self.vertex_token.lock().await;
        if let Some((token, fetched)) = cached.as_ref() {
            if fetched.elapsed() < VERTEX_TOKEN_TTL {
                return Ok(token.clone());
            }
        }

        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| ProviderError::NotConfigured(format!("Failed to run gcloud: {e}")))?;
        if !output.status.success() {
            return Err(ProviderError::AuthenticationFailed(format!(
                "gcloud auth print-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    async fn send_once(&self, prepared: &PreparedRequest) -> Result<ProviderResponse, ProviderError> {
        let auth = self.auth_headers(prepared).await?;
        let mut builder = self.client.post(&prepared.url).body(prepared.body.clone());
        for (k, v) in prepared.headers.iter().chain(auth.iter()) {
            builder = builder.header(k.as_str(), v.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        match status {
            200..=299 => {
                let raw: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| ProviderError::Deserialization(format!("Response is not JSON: {e}")))?;
                let mut parsed: ProviderResponse = serde_json::from_value(raw.clone())
                    .map_err(|e| ProviderError::Deserialization(e.to_string()))?;
                parsed.status = status;
                parsed.raw = raw;
                Ok(parsed)
            }
            429 => Err(ProviderError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            }),
            401 | 403 => Err(ProviderError::AuthenticationFailed(text)),
            _ => {
                warn!(status, body = %text, "Anthropic API error");
                Err(ProviderError::ApiError {
                    status_code: status,
                    message: text,
                })
            }
        }
    }

    fn backoff(&self, attempt: u32, error: &ProviderError) -> Duration {
        if let ProviderError::RateLimited { retry_after_secs } = error {
            return Duration::from_secs(*retry_after_secs).min(MAX_BACKOFF);
        }
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        match self.platform {
            Platform::Direct { .. } => "anthropic",
            Platform::Bedrock { .. } => "bedrock",
            Platform::Vertex { .. } => "vertex",
        }
    }

    fn supports_prompt_caching(&self) -> bool {
        matches!(self.platform, Platform::Direct { .. })
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let prepared = self.prepare(&request)?;
        debug!(
            provider = self.name(),
            model = %request.model,
            betas = ?request.betas,
            "Sending messages request"
        );

        let mut attempt = 0;
        loop {
            match self.send_once(&prepared).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt, &e);
                    warn!(
                        provider = self.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tilt_core::message::{ContentBlock, Message};

    fn sample_request() -> ProviderRequest {
        ProviderRequest {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 1024,
            system: vec![ContentBlock::text("system")],
            messages: vec![Message::user("hello")],
            tools: vec![],
            thinking: None,
            betas: vec!["computer-use-2025-01-24".into(), "prompt-caching-2024-07-31".into()],
        }
    }

    fn success_body() -> Value {
        json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "Taking a screenshot"},
                {"type": "tool_use", "id": "toolu_1", "name": "computer", "input": {"action": "screenshot"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        })
    }

    /// Serve `statuses` in order, then 200s.
    async fn mock_server(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<HeaderMap>>>) {
        #[derive(Clone)]
        struct MockState {
            calls: Arc<AtomicUsize>,
            statuses: Arc<Vec<u16>>,
            headers: Arc<std::sync::Mutex<Vec<HeaderMap>>>,
        }

        async fn handler(State(state): State<MockState>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
            state.headers.lock().unwrap().push(headers);
            let n = state.calls.fetch_add(1, Ordering::SeqCst);
            match state.statuses.get(n) {
                Some(code) => (
                    StatusCode::from_u16(*code).unwrap(),
                    Json(json!({"type": "error", "error": {"type": "overloaded_error"}})),
                ),
                None => (StatusCode::OK, Json(success_body())),
            }
        }

        let state = MockState {
            calls: Arc::new(AtomicUsize::new(0)),
            statuses: Arc::new(statuses),
            headers: Arc::new(std::sync::Mutex::new(Vec::new())),
        };
        let calls = state.calls.clone();
        let headers = state.headers.clone();
        let app = Router::new().route("/v1/messages", post(handler)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), calls, headers)
    }

    #[test]
    fn direct_request_carries_betas_header() {
        let provider = AnthropicProvider::new("sk-ant-test");
        let prepared = provider.prepare(&sample_request()).unwrap();
        assert_eq!(prepared.url, "https://api.anthropic.com/v1/messages");
        assert!(prepared.headers.contains(&(
            "anthropic-beta".into(),
            "computer-use-2025-01-24,prompt-caching-2024-07-31".into()
        )));
        let body: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert!(body.get("anthropic_version").is_none());
    }

    #[test]
    fn bedrock_moves_model_and_betas() {
        let provider = AnthropicProvider::with_platform(Platform::Bedrock {
            region: "us-west-2".into(),
            credentials: AwsCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
        });
        let mut request = sample_request();
        request.model = "anthropic.claude-3-5-sonnet-20241022-v2:0".into();
        let prepared = provider.prepare(&request).unwrap();
        assert_eq!(
            prepared.url,
            "https://bedrock-runtime.us-west-2.amazonaws.com/model/anthropic.claude-3-5-sonnet-20241022-v2%3A0/invoke"
        );
        let body: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert!(body.get("model").is_none());
        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(body["anthropic_beta"][0], "computer-use-2025-01-24");
        assert!(!provider.supports_prompt_caching());
        assert_eq!(provider.name(), "bedrock");
    }

    #[test]
    fn vertex_url_and_version() {
        let provider = AnthropicProvider::with_platform(Platform::Vertex {
            region: "us-east5".into(),
            project_id: "my-project".into(),
        });
        let prepared = provider.prepare(&sample_request()).unwrap();
        assert_eq!(
            prepared.url,
            "https://us-east5-aiplatform.googleapis.com/v1/projects/my-project/locations/us-east5/publishers/anthropic/models/claude-sonnet-4-20250514:rawPredict"
        );
        let body: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert_eq!(body["anthropic_version"], "vertex-2023-10-16");
        assert!(body.get("model").is_none());
    }

    #[test]
    fn backoff_grows_and_honors_retry_after() {
        let provider = AnthropicProvider::new("k").with_retry_backoff(Duration::from_millis(100));
        let net = ProviderError::Network("reset".into());
        assert_eq!(provider.backoff(0, &net), Duration::from_millis(100));
        assert_eq!(provider.backoff(2, &net), Duration::from_millis(400));
        assert_eq!(provider.backoff(20, &net), MAX_BACKOFF);
        let limited = ProviderError::RateLimited { retry_after_secs: 3 };
        assert_eq!(provider.backoff(0, &limited), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn parses_successful_response() {
        let (url, calls, headers) = mock_server(vec![]).await;
        let provider = AnthropicProvider::new("sk-ant-test").with_base_url(url);

        let response = provider.complete(sample_request()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.content[1].kind(), "tool_use");
        assert_eq!(response.raw["id"], "msg_01");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let seen = headers.lock().unwrap();
        assert_eq!(seen[0]["x-api-key"], "sk-ant-test");
        assert_eq!(seen[0]["anthropic-version"], ANTHROPIC_VERSION);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let (url, calls, _) = mock_server(vec![529, 500]).await;
        let provider = AnthropicProvider::new("sk-ant-test")
            .with_base_url(url)
            .with_retry_backoff(Duration::from_millis(1));

        let response = provider.complete(sample_request()).await.unwrap();
        assert_eq!(response.id, "msg_01");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (url, calls, _) = mock_server(vec![503, 503, 503]).await;
        let provider = AnthropicProvider::new("sk-ant-test")
            .with_base_url(url)
            .with_max_retries(2)
            .with_retry_backoff(Duration::from_millis(1));

        let err = provider.complete(sample_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::ApiError { status_code: 503, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let (url, calls, _) = mock_server(vec![401]).await;
        let provider = AnthropicProvider::new("sk-ant-bad")
            .with_base_url(url)
            .with_retry_backoff(Duration::from_millis(1));

        let err = provider.complete(sample_request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_request_surfaces_status() {
        let (url, _, _) = mock_server(vec![400]).await;
        let provider = AnthropicProvider::new("sk-ant-test").with_base_url(url);
        let err = provider.complete(sample_request()).await.unwrap_err();
        assert!(err.to_string().starts_with("Anthropic API error: 400"));
    }
}
