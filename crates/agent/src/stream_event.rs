//! Loop events as the streaming relay sends them.
//!
//! `StreamEvent` is the wire shape of one server-push event; [`EventObserver`]
//! adapts the loop's callbacks into a channel of them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tilt_core::message::{ContentBlock, Message};
use tilt_core::observer::LoopObserver;
use tilt_core::tool::ToolResult;
use tokio::sync::mpsc::UnboundedSender;

/// Events emitted to a streaming client:
/// - `status`      — relay lifecycle notice
/// - `message`     — assistant text
/// - `tool_use`    — the model invoked a tool
/// - `tool_result` — a tool finished
/// - `keepalive`   — nothing happened for a while
/// - `done`        — the final history
/// - `error`       — the loop failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        message: String,
    },

    Message {
        role: String,
        content: String,
    },

    ToolUse {
        tool_name: String,
        tool_input: serde_json::Value,
    },

    ToolResult {
        tool_id: String,
        tool_name: String,
        output: Option<String>,
        error: Option<String>,
        base64_image: Option<String>,
    },

    Keepalive,

    Done {
        messages: Vec<Message>,
    },

    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Message { .. } => "message",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Keepalive => "keepalive",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Forwards loop callbacks into a channel.
///
/// Tool names are remembered by invocation id so each `tool_result` event
/// can name its tool. Sends to a closed channel are dropped: the client has
/// gone away and the loop is being cancelled.
pub struct EventObserver {
    tx: UnboundedSender<StreamEvent>,
    tool_names: Mutex<HashMap<String, String>>,
}

impl EventObserver {
    pub fn new(tx: UnboundedSender<StreamEvent>) -> Self {
        Self {
            tx,
            tool_names: Mutex::new(HashMap::new()),
        }
    }

    fn send(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }
}

impl LoopObserver for EventObserver {
    fn on_content(&self, block: &ContentBlock) {
        match block {
            ContentBlock::Text { text, .. } => self.send(StreamEvent::Message {
                role: "assistant".into(),
                content: text.clone(),
            }),
            ContentBlock::ToolUse { id, name, input, .. } => {
                if let Ok(mut names) = self.tool_names.lock() {
                    names.insert(id.clone(), name.clone());
                }
                self.send(StreamEvent::ToolUse {
                    tool_name: name.clone(),
                    tool_input: input.clone(),
                });
            }
            _ => {}
        }
    }

    fn on_tool_result(&self, result: &ToolResult, tool_use_id: &str) {
        let tool_name = self
            .tool_names
            .lock()
            .ok()
            .and_then(|names| names.get(tool_use_id).cloned())
            .unwrap_or_else(|| "unknown".into());
        self.send(StreamEvent::ToolResult {
            tool_id: tool_use_id.to_string(),
            tool_name,
            output: result.output.clone(),
            error: result.error.clone(),
            base64_image: result.base64_image.clone(),
        });
    }
}
