//! Task reporter: lets the agent record progress, results, errors and
//! metadata on the task it is working on.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tilt_core::error::{StoreError, ToolError};
use tilt_core::provider::ToolDefinition;
use tilt_core::store::{CurrentTask, TaskStatus, TaskStore};
use tilt_core::tool::{Tool, ToolResult};
use tracing::{info, warn};

const DESCRIPTION: &str = r#"Report task progress, results, errors, or metadata back to the task store.

CRITICAL: When reporting captured data structures (especially JSON from network requests), preserve the COMPLETE raw JSON structure exactly as captured. Do NOT summarize, interpret, or create descriptions - pass the full JSON objects intact.

Use this tool to:
- Report progress updates during task execution
- Report final results when task is complete (preserve raw JSON data structures)
- Report errors if task fails
- Add metadata or additional information

Examples:
- Report progress: action="report_progress", data={"step": "completed navigation"}
- Report result with raw JSON: action="report_result", data={"success": true, "raw_analytics_json": {"complete": "json structure here"}}
- Report error: action="report_error", data={"error": "Failed to find element", "details": "..."}
- Add metadata: action="add_metadata", data={"browser": "chromium", "execution_time": 45}"#;

pub struct TaskReporterTool {
    store: Arc<dyn TaskStore>,
    current_task: CurrentTask,
}

impl TaskReporterTool {
    pub fn new(store: Arc<dyn TaskStore>, current_task: CurrentTask) -> Self {
        Self { store, current_task }
    }

    fn fatal(e: StoreError) -> ToolError {
        ToolError::Fatal {
            tool_name: "task_reporter".into(),
            reason: e.to_string(),
        }
    }

    /// The explicit id, else the current task, else a fresh one-off task
    /// that becomes the current task.
    async fn resolve_task(&self, explicit: Option<&str>, action: &str) -> Result<String, ToolError> {
        if let Some(id) = explicit.filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        if let Some(id) = self.current_task.get() {
            return Ok(id);
        }
        let id = self
            .store
            .create_one_off_task(&format!("One-off task execution - {action}"))
            .await
            .map_err(Self::fatal)?;
        info!(task_id = %id, "Created one-off task for reporter");
        self.current_task.set(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl Tool for TaskReporterTool {
    fn name(&self) -> &str {
        "task_reporter"
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::custom("task_reporter", DESCRIPTION, self.input_schema())
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["report_progress", "report_result", "report_error", "add_metadata"],
                    "description": "Type of report to make"
                },
                "data": {
                    "type": "object",
                    "description": "Data to report - structure depends on action type"
                },
                "task_id": {
                    "type": "string",
                    "description": "Optional task ID (uses current task if not provided)"
                }
            },
            "required": ["action", "data"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult, ToolError> {
        let action = input["action"].as_str().unwrap_or_default();
        let data = input.get("data").cloned().unwrap_or_else(|| json!({}));
        let explicit = input["task_id"].as_str().or_else(|| input["test_id"].as_str());

        let task_id = self.resolve_task(explicit, action).await?;
        if self.store.get_task(&task_id).await.map_err(Self::fatal)?.is_none() {
            return Ok(ToolResult::error(format!("Task {task_id} not found")));
        }

        let message = match action {
            "report_progress" => {
                self.store
                    .report_progress(&task_id, data)
                    .await
                    .map_err(Self::fatal)?;
                format!("Progress reported for task {task_id}")
            }
            "report_result" => {
                self.store
                    .complete_task(&task_id, TaskStatus::Passed, Some(data), None)
                    .await
                    .map_err(Self::fatal)?;
                info!(task_id = %task_id, "Task marked as passed by reporter");
                format!("Result reported and task {task_id} marked as passed")
            }
            "report_error" => {
                let error = data["error"].as_str().unwrap_or("Unknown error").to_string();
                self.store
                    .fail_task(&task_id, &error, Some(data), None)
                    .await
                    .map_err(Self::fatal)?;
                warn!(task_id = %task_id, error = %error, "Task error reported");
                format!("Error reported for task {task_id}")
            }
            "add_metadata" => {
                let Value::Object(metadata) = data else {
                    return Ok(ToolResult::error("add_metadata requires an object in `data`"));
                };
                self.store
                    .add_metadata(&task_id, metadata)
                    .await
                    .map_err(Self::fatal)?;
                format!("Metadata added to task {task_id}")
            }
            other => return Ok(ToolResult::error(format!("Unknown action: {other}"))),
        };
        Ok(ToolResult::output(message))
    }
}
