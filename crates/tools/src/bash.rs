//! Bash tool: run one command per invocation through `bash -c`.
//!
//! Every call gets a fresh process, so `restart` only has to acknowledge.
//! Commands that outlive the timeout are killed and reported as errors.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tilt_core::error::ToolError;
use tilt_core::provider::ToolDefinition;
use tilt_core::tool::{Tool, ToolResult};
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct BashTool {
    api_type: &'static str,
    timeout: Duration,
}

impl BashTool {
    pub fn new(api_type: &'static str) -> Self {
        Self {
            api_type,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, command: &str) -> Result<ToolResult, ToolError> {
        debug!(command = %command, "Executing bash command");

        let child = Command::new("bash")
            .args(["-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "bash".into(),
                reason: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: "bash".into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command, timeout_secs = self.timeout.as_secs(), "Command timed out");
                return Ok(ToolResult::error(format!(
                    "timed out: bash has not returned in {} seconds and must be restarted",
                    self.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if !output.status.success() {
            debug!(command = %command, exit_code = output.status.code(), "Command exited non-zero");
        }

        Ok(ToolResult {
            output: (!stdout.is_empty()).then_some(stdout),
            error: (!stderr.is_empty()).then_some(stderr),
            ..ToolResult::default()
        })
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::builtin(self.api_type, "bash")
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The bash command to run"},
                "restart": {"type": "boolean", "description": "Restart the tool"}
            }
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult, ToolError> {
        if input["restart"].as_bool() == Some(true) {
            return Ok(ToolResult::default().with_system("tool has been restarted."));
        }
        match input["command"].as_str() {
            Some(command) if !command.trim().is_empty() => self.run(command).await,
            _ => Err(ToolError::InvalidArguments("no command provided.".into())),
        }
    }
}
