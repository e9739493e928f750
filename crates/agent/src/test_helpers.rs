//! Shared test helpers: scripted model providers.

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tilt_core::error::ProviderError;
use tilt_core::message::ContentBlock;
use tilt_core::provider::{Provider, ProviderRequest, ProviderResponse};

/// Replays canned responses and records every request.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    caching: bool,
    repeat_last: bool,
}

impl ScriptedProvider {
    pub fn build(
        responses: Vec<Result<ProviderResponse, ProviderError>>,
        caching: bool,
        repeat_last: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            caching,
            repeat_last,
        })
    }

    pub fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Arc<Self> {
        Self::build(responses, false, false)
    }

    pub fn caching(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Arc<Self> {
        Self::build(responses, true, false)
    }

    /// Answers every call with the same response.
    pub fn forever(response: ProviderResponse) -> Arc<Self> {
        Self::build(vec![Ok(response)], false, true)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_prompt_caching(&self) -> bool {
        self.caching
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let mut responses = self.responses.lock().unwrap();
        if self.repeat_last && responses.len() == 1 {
            return responses.front().cloned().unwrap();
        }
        responses
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::InvalidRequest("script exhausted".into())))
    }
}

/// Never answers.
pub struct HangingProvider;

#[async_trait]
impl Provider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        std::future::pending().await
    }
}

pub fn reply(content: Vec<ContentBlock>) -> ProviderResponse {
    ProviderResponse {
        id: "msg_1".into(),
        model: "claude-test".into(),
        content,
        stop_reason: Some("end_turn".into()),
        usage: None,
        status: 200,
        raw: json!({"id": "msg_1"}),
    }
}
