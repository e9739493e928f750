//! Evaluate JavaScript in the first browser tab over DevTools.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tilt_core::error::ToolError;
use tilt_core::provider::ToolDefinition;
use tilt_core::tool::{Tool, ToolResult};
use tracing::debug;

use crate::cdp;

pub struct InspectJsTool {
    cdp_url: String,
    http: reqwest::Client,
    default_timeout: Duration,
}

impl InspectJsTool {
    pub fn new(cdp_url: impl Into<String>) -> Self {
        Self {
            cdp_url: cdp_url.into(),
            http: reqwest::Client::new(),
            default_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    async fn evaluate(&self, code: &str) -> Result<String, String> {
        let mut session = cdp::connect_first_page(&self.http, &self.cdp_url)
            .await
            .map_err(|e| e.to_string())?;
        let evaluated = session
            .call(
                "Runtime.evaluate",
                json!({"expression": code, "returnByValue": true, "awaitPromise": true}),
            )
            .await;
        session.close().await;
        render_evaluation(&evaluated.map_err(|e| format!("Execution failed: {e}"))?)
    }
}

/// Turn a `Runtime.evaluate` result into tool output or a JS error.
fn render_evaluation(evaluated: &Value) -> Result<String, String> {
    if let Some(details) = evaluated.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("Unknown error");
        return Err(format!("JavaScript Error: {message}"));
    }

    let result = &evaluated["result"];
    if let Some(value) = result.get("value") {
        return Ok(match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        });
    }
    if let Some(description) = result.get("description").and_then(Value::as_str) {
        return Ok(description.to_string());
    }
    Ok(result
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("undefined")
        .to_string())
}

#[async_trait]
impl Tool for InspectJsTool {
    fn name(&self) -> &str {
        "inspect_js"
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::custom(
            "inspect_js",
            "Execute JavaScript in the active Chromium tab and return the result. Useful for reading DOM state, window variables and data layers.",
            self.input_schema(),
        )
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "JavaScript code to execute in the browser context"
                },
                "timeout": {
                    "type": "number",
                    "description": "Timeout in seconds for the evaluation (default: 10)",
                    "default": 10
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult, ToolError> {
        let code = input["code"].as_str().unwrap_or_default();
        if code.trim().is_empty() {
            return Ok(ToolResult::error("JavaScript code cannot be empty"));
        }
        let timeout = input["timeout"]
            .as_f64()
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.default_timeout);

        debug!(timeout_ms = timeout.as_millis() as u64, "Evaluating JavaScript");
        match tokio::time::timeout(timeout, self.evaluate(code)).await {
            Ok(Ok(output)) => Ok(ToolResult::output(output)),
            Ok(Err(error)) => Ok(ToolResult::error(error)),
            Err(_) => Ok(ToolResult::error(format!(
                "Execution failed: evaluation timed out after {}s",
                timeout.as_secs_f64()
            ))),
        }
    }
}
