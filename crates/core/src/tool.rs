//! Tool trait, tool results, and the dispatcher.
//!
//! Tools are what give the agent the ability to act on the machine:
//! run shell commands, edit files, drive the screen, inspect the browser.
//! A [`ToolCollection`] is the fixed set of tools active for one loop
//! invocation and doubles as the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::message::{ContentBlock, ToolResultContent};
use crate::provider::ToolDefinition;

/// The outcome of a single tool invocation.
///
/// When `error` is set it is authoritative: the rendered `tool_result`
/// block is marked as an error and `output`/`base64_image` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub base64_image: Option<String>,
    /// Out-of-band note prepended as `<system>...</system>` when rendered.
    #[serde(default)]
    pub system: Option<String>,
}

impl ToolResult {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, base64_png: impl Into<String>) -> Self {
        self.base64_image = Some(base64_png.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    fn prepend_system(&self, text: &str) -> String {
        match self.system.as_deref() {
            Some(system) if !system.is_empty() => format!("<system>{system}</system>\n{text}"),
            _ => text.to_string(),
        }
    }

    /// Render this result as the `tool_result` block answering `tool_use_id`.
    pub fn to_content_block(&self, tool_use_id: &str) -> ContentBlock {
        let (content, is_error) = match self.error.as_deref() {
            Some(error) if !error.is_empty() => {
                (ToolResultContent::Text(self.prepend_system(error)), true)
            }
            _ => {
                let mut blocks = Vec::new();
                if let Some(output) = self.output.as_deref().filter(|o| !o.is_empty()) {
                    blocks.push(ContentBlock::text(self.prepend_system(output)));
                }
                if let Some(image) = self.base64_image.as_deref().filter(|i| !i.is_empty()) {
                    blocks.push(ContentBlock::image_png(image));
                }
                (ToolResultContent::Blocks(blocks), false)
            }
        };
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content,
            is_error,
            cache_control: None,
        }
    }
}

/// The core Tool trait.
///
/// Each tool (computer, bash, editor, browser inspectors, task reporter...)
/// implements this trait and is grouped into a [`ToolCollection`] per
/// tool version.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name the model uses to call this tool.
    fn name(&self) -> &str;

    /// What gets sent in the request's `tools` array.
    fn to_definition(&self) -> ToolDefinition;

    /// JSON Schema used to validate arguments before invocation.
    ///
    /// For provider-defined tools this is never sent on the wire.
    fn input_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, input: Value) -> std::result::Result<ToolResult, ToolError>;

    /// Called once when the tool joins a collection. Tools that delegate into
    /// siblings keep the handle; everything else ignores it.
    fn attach_collection(&self, _collection: Weak<ToolCollection>) {}
}

/// Check `input` against the subset of JSON Schema our tools use:
/// object type, `required`, primitive `type` per property, and `enum`.
pub fn validate_arguments(schema: &Value, input: &Value) -> std::result::Result<(), ToolError> {
    let Some(object) = input.as_object() else {
        return Err(ToolError::InvalidArguments("arguments must be a JSON object".into()));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if object.get(key).is_none_or(Value::is_null) {
                return Err(ToolError::InvalidArguments(format!("missing required field '{key}'")));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in object {
        let Some(spec) = properties.get(key) else { continue };
        if value.is_null() {
            continue;
        }
        if let Some(expected) = spec.get("type").and_then(Value::as_str) {
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !ok {
                return Err(ToolError::InvalidArguments(format!(
                    "field '{key}' must be of type {expected}"
                )));
            }
        }
        if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(ToolError::InvalidArguments(format!(
                    "field '{key}' must be one of {}",
                    Value::Array(allowed.clone())
                )));
            }
        }
    }
    Ok(())
}

/// The ordered set of tools active for one loop invocation.
///
/// [`ToolCollection::run`] is the dispatcher: unknown names, invalid
/// arguments, tool errors and panics all come back as a [`ToolResult`] with
/// `error` set. Only [`ToolError::Fatal`] is returned as `Err`.
pub struct ToolCollection {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolCollection {
    /// Build the collection and hand every tool a weak handle to it.
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            for tool in &tools {
                tool.attach_collection(weak.clone());
            }
            Self { tools }
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool definitions, in registration order, for the request `tools` array.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolve `name` and invoke it with `input`.
    pub async fn run(&self, name: &str, input: Value) -> std::result::Result<ToolResult, ToolError> {
        let Some(tool) = self.get(name) else {
            return Ok(ToolResult::error(format!("Tool {name} is invalid")));
        };

        if let Err(e) = validate_arguments(&tool.input_schema(), &input) {
            debug!(tool = %name, error = %e, "Rejected tool arguments");
            return Ok(ToolResult::error(e.to_string()));
        }

        // Spawned so a panicking tool is reported instead of unwinding the loop.
        let handle = tokio::spawn(async move { tool.execute(input).await });
        match handle.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => Ok(ToolResult::error(e.to_string())),
            Err(join_err) => {
                warn!(tool = %name, error = %join_err, "Tool task aborted");
                Ok(ToolResult::error(format!("Tool {name} failed unexpectedly: {join_err}")))
            }
        }
    }
}
