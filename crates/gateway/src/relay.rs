//! Streaming chat relay and one-shot tool execution.
//!
//! - `POST /chat/stream`   — run a sampling loop, streaming its events as SSE
//! - `POST /tools/execute` — invoke one tool outside any loop

use axum::{
    extract::State,
    response::Json,
    response::sse::{Event as SseEvent, Sse},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tilt_agent::{EventObserver, InterjectionPoller, LoopConfig, SamplingLoop, StreamEvent};
use tilt_core::message::Message;
use tilt_core::store::{CurrentTask, InterjectionStore, TaskStore};
use tilt_core::version::ToolVersion;
use tilt_telemetry::TimingCollector;
use tilt_tools::{ToolContext, build_collection};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{SharedState, admin};

/// Pause before `done` so clients can render the last tool results.
const DONE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system_prompt_suffix: Option<String>,
    #[serde(default = "default_recent_images")]
    pub only_n_most_recent_images: usize,
    #[serde(default)]
    pub tool_version: ToolVersion,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub token_efficient_tools_beta: bool,
    /// Scopes interjections to this session.
    #[serde(default)]
    pub test_id: Option<String>,
}

fn default_recent_images() -> usize {
    3
}

fn default_max_tokens() -> u32 {
    4096
}

/// `POST /chat/stream` — run the loop, relaying its callbacks as SSE events.
///
/// The stream carries exactly one terminal `done` or `error` event. Between
/// loop events a `keepalive` is sent whenever the configured idle interval
/// passes. Dropping the response (client disconnect) cancels the loop.
pub async fn chat_stream_handler(
    State(state): State<SharedState>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    info!(
        messages = request.messages.len(),
        test_id = ?request.test_id,
        tool_version = request.tool_version.as_str(),
        "Starting new stream request"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    tokio::spawn(run_relay(state.clone(), request, tx, cancel));

    let keepalive = Duration::from_millis(state.config.gateway.keepalive_interval_ms);
    let stream = UnboundedReceiverStream::new(rx)
        .timeout(keepalive)
        .map(move |item| {
            let _cancel_on_drop = &guard;
            let event = item.unwrap_or(StreamEvent::Keepalive);
            Ok(to_sse(&event))
        });

    Sse::new(stream)
}

fn to_sse(event: &StreamEvent) -> SseEvent {
    SseEvent::default().data(serde_json::to_string(event).unwrap_or_default())
}

async fn run_relay(
    state: SharedState,
    request: ChatRequest,
    tx: UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
) {
    let terminal = match relay(&state, request, &tx, cancel).await {
        Ok(messages) => {
            tokio::time::sleep(DONE_DELAY).await;
            StreamEvent::Done { messages }
        }
        Err(message) => {
            error!(error = %message, "Stream request failed");
            StreamEvent::Error { message }
        }
    };
    if tx.send(terminal).is_err() {
        info!("Client disconnected during stream");
    }
}

async fn relay(
    state: &SharedState,
    request: ChatRequest,
    tx: &UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
) -> Result<Vec<Message>, String> {
    let api_key = admin::resolve_api_key(state).await?;
    let provider = (state.providers)(&api_key).map_err(|e| e.to_string())?;
    info!(
        model = %state.config.model.model,
        provider = provider.name(),
        "Model client ready"
    );
    let _ = tx.send(StreamEvent::Status {
        message: "Starting...".into(),
    });

    let task_store: Arc<dyn TaskStore> = state.store.clone();
    let tool_context = ToolContext::new(&state.config, task_store, CurrentTask::new());
    let tools = build_collection(request.tool_version, &tool_context);

    let config = LoopConfig {
        system_prompt_suffix: request.system_prompt_suffix.unwrap_or_default(),
        only_n_most_recent_images: Some(request.only_n_most_recent_images),
        tool_version: request.tool_version,
        max_tokens: request.max_tokens,
        thinking_budget: request.thinking_budget,
        token_efficient_tools_beta: request.token_efficient_tools_beta,
        ..LoopConfig::from_app(&state.config)
    };
    let interjections: Arc<dyn InterjectionStore> = state.store.clone();
    let timing = Arc::new(TimingCollector::new());
    let sampling = SamplingLoop::new(provider, tools, config)
        .with_interjections(InterjectionPoller::new(interjections, request.test_id.clone()))
        .with_browser(state.config.browser.clone())
        .with_timing(timing.clone())
        .with_cancellation(cancel);

    let observer = EventObserver::new(tx.clone());
    let input_len = request.messages.len();
    let result = sampling.run(request.messages, &observer).await;

    let label = request.test_id.unwrap_or_else(|| "chat".into());
    state.timing.record(label, timing.report());

    match result {
        Ok(messages) => {
            if messages.len() <= input_len {
                warn!("No new messages generated by the model");
            } else {
                info!(new_messages = messages.len() - input_len, "Sampling loop completed");
            }
            Ok(messages)
        }
        Err(e) => Err(format!("Sampling loop error: {e}")),
    }
}

// --- Tool execution ---

#[derive(Debug, Deserialize)]
pub struct ToolExecuteRequest {
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_version: ToolVersion,
}

fn empty_object() -> Value {
    json!({})
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolExecuteResponse {
    pub result: Value,
    pub error: Option<String>,
}

/// `POST /tools/execute` — run one tool from the requested group.
pub async fn execute_tool_handler(
    State(state): State<SharedState>,
    Json(request): Json<ToolExecuteRequest>,
) -> Json<ToolExecuteResponse> {
    info!(tool = %request.tool_name, tool_version = request.tool_version.as_str(), "Direct tool execution");
    let task_store: Arc<dyn TaskStore> = state.store.clone();
    let tool_context = ToolContext::new(&state.config, task_store, CurrentTask::new());
    let tools = build_collection(request.tool_version, &tool_context);

    let response = match tools.run(&request.tool_name, request.tool_input).await {
        Ok(result) => ToolExecuteResponse {
            result: json!({"output": result.output, "error": result.error}),
            error: None,
        },
        Err(e) => ToolExecuteResponse {
            result: json!({}),
            error: Some(e.to_string()),
        },
    };
    Json(response)
}
