//! Message and content-block domain types.
//!
//! These mirror the Messages API wire format closely so a history can be
//! sent to the model, streamed to a UI, and persisted on a task without any
//! intermediate representation.

use serde::{Deserialize, Serialize};

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human operator (and tool results fed back to the model)
    User,
    /// The model
    Assistant,
}

/// Prompt-caching marker attached to a content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".into(),
        }
    }
}

/// Source of an image block. Screenshots are always base64 PNG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn png_base64(data: impl Into<String>) -> Self {
        Self {
            kind: "base64".into(),
            media_type: "image/png".into(),
            data: data.into(),
        }
    }
}

/// One typed unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        thinking: String,
        /// Integrity signature; must be sent back untouched.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn image_png(data: impl Into<String>) -> Self {
        Self::Image {
            source: ImageSource::png_base64(data),
            cache_control: None,
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            cache_control: None,
        }
    }

    /// The wire `type` tag of this block.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Thinking { .. } => "thinking",
            Self::RedactedThinking { .. } => "redacted_thinking",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }

    pub fn cache_control(&self) -> Option<&CacheControl> {
        match self {
            Self::Text { cache_control, .. }
            | Self::Image { cache_control, .. }
            | Self::ToolUse { cache_control, .. }
            | Self::ToolResult { cache_control, .. } => cache_control.as_ref(),
            Self::Thinking { .. } | Self::RedactedThinking { .. } => None,
        }
    }

    /// Set or clear the cache marker. Thinking blocks cannot carry one and
    /// are left untouched.
    pub fn set_cache_control(&mut self, value: Option<CacheControl>) {
        match self {
            Self::Text { cache_control, .. }
            | Self::Image { cache_control, .. }
            | Self::ToolUse { cache_control, .. }
            | Self::ToolResult { cache_control, .. } => *cache_control = value,
            Self::Thinking { .. } | Self::RedactedThinking { .. } => {}
        }
    }
}

/// Content of a `tool_result` block: a bare string (used for errors) or a
/// list of text/image blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

/// Message content: plain text or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    /// Create a plain-text user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a plain-text assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    /// The block list, or an empty slice for plain-text content.
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }

    pub fn blocks_mut(&mut self) -> Option<&mut Vec<ContentBlock>> {
        match &mut self.content {
            MessageContent::Blocks(blocks) => Some(blocks),
            MessageContent::Text(_) => None,
        }
    }

    /// All `tool_use` ids in this turn, in order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All `tool_result` ids in this turn, in order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text of the turn, ignoring non-text blocks.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_message_serializes_as_string_content() {
        let msg = Message::user("say hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "say hi"}));
    }

    #[test]
    fn block_content_parses_all_kinds() {
        let value = json!({
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig=="},
                {"type": "text", "text": "Taking a screenshot"},
                {"type": "tool_use", "id": "toolu_1", "name": "computer", "input": {"action": "screenshot"}}
            ]
        });
        let msg: Message = serde_json::from_value(value).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.blocks().len(), 3);
        assert_eq!(msg.blocks()[0].kind(), "thinking");
        assert_eq!(msg.tool_use_ids(), vec!["toolu_1"]);
    }

    #[test]
    fn tool_result_accepts_string_or_blocks() {
        let err: ContentBlock = serde_json::from_value(json!({
            "type": "tool_result", "tool_use_id": "t1", "content": "boom", "is_error": true
        }))
        .unwrap();
        assert!(matches!(
            err,
            ContentBlock::ToolResult { content: ToolResultContent::Text(ref s), is_error: true, .. } if s == "boom"
        ));

        let ok: ContentBlock = serde_json::from_value(json!({
            "type": "tool_result", "tool_use_id": "t2",
            "content": [{"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAA"}}]
        }))
        .unwrap();
        match ok {
            ContentBlock::ToolResult { content: ToolResultContent::Blocks(blocks), is_error, .. } => {
                assert!(!is_error);
                assert!(blocks[0].is_image());
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn cache_control_is_omitted_when_unset() {
        let mut block = ContentBlock::text("hello");
        assert!(!serde_json::to_string(&block).unwrap().contains("cache_control"));

        block.set_cache_control(Some(CacheControl::ephemeral()));
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["cache_control"], json!({"type": "ephemeral"}));
    }

    #[test]
    fn thinking_blocks_ignore_cache_control() {
        let mut block = ContentBlock::Thinking {
            thinking: "plan".into(),
            signature: Some("abc".into()),
        };
        block.set_cache_control(Some(CacheControl::ephemeral()));
        assert!(block.cache_control().is_none());
    }

    #[test]
    fn text_joins_text_blocks() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::text("one"),
            ContentBlock::tool_use("t", "bash", json!({})),
            ContentBlock::text("two"),
        ]);
        assert_eq!(msg.text(), "one\ntwo");
    }
}
