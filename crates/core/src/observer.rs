//! Callbacks the sampling loop emits while it runs.
//!
//! One method per event kind. The relay turns these into server-push events,
//! the task runner logs them, tests record them.

use serde::{Deserialize, Serialize};

use crate::message::ContentBlock;
use crate::tool::ToolResult;

/// The raw request/response pair of one model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiExchange {
    pub provider: String,
    pub model: String,
    /// The request body as sent.
    pub request: serde_json::Value,
    pub betas: Vec<String>,
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Receives loop events. All methods default to doing nothing.
pub trait LoopObserver: Send + Sync {
    /// An assistant content block (text, thinking, tool_use), or an
    /// interjected user message echoed as text.
    fn on_content(&self, _block: &ContentBlock) {}

    /// The result of the tool invocation `tool_use_id`.
    fn on_tool_result(&self, _result: &ToolResult, _tool_use_id: &str) {}

    /// A model call finished, successfully or not.
    fn on_api_exchange(&self, _exchange: &ApiExchange) {}
}

/// An observer that ignores everything.
pub struct NullObserver;

impl LoopObserver for NullObserver {}
