//! Persistent collaborators: the task queue, the interjection queue, and
//! settings.
//!
//! The sampling loop itself only touches interjections. Tasks are read and
//! written by the task runner and the reporter tool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::error::StoreError;

/// Settings key under which the Anthropic API key is stored.
pub const API_KEY_SETTING: &str = "anthropic_key";

/// Label length before an auto-generated label is cut.
const AUTO_LABEL_CHARS: usize = 50;

/// Whether `key` looks like an Anthropic API key.
pub fn validate_api_key(key: &str) -> bool {
    key.starts_with("sk-ant-") && key.len() >= 20
}

/// Lifecycle state of a task.
///
/// `pending → running → completed | passed | error`; `pending` is reachable
/// again through a manual reset from any state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Passed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Passed => "passed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Passed | Self::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "passed" => Ok(Self::Passed),
            "error" => Ok(Self::Error),
            other => Err(StoreError::Validation(format!("unknown task status '{other}'"))),
        }
    }
}

/// A tool the task asks the agent to use explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskToolUse {
    pub tool: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// A work item in the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub instructions: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_details: Option<Value>,
    #[serde(default)]
    pub tool_use: Option<TaskToolUse>,
    #[serde(default)]
    pub execution_report: Option<Value>,
    #[serde(default)]
    pub progress: Option<Value>,
    #[serde(default)]
    pub progress_history: Vec<ProgressEntry>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl Task {
    /// Render the task as the text of the first user turn.
    pub fn formatted_instructions(&self) -> String {
        let mut text = self.instructions.join("\n");
        let Some(tool_use) = &self.tool_use else {
            return text;
        };

        let first_arg = tool_use.arguments.first().map(|a| match a {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        match (tool_use.tool.as_str(), first_arg) {
            ("js_inspector" | "inspect_js", Some(code)) => {
                text.push_str("\n\nUse the inspect_js tool to execute this JavaScript code:\n");
                text.push_str(&format!("```javascript\n{code}\n```"));
            }
            (tool, _) => {
                text.push_str(&format!("\n\nUse the {tool} tool"));
                if !tool_use.arguments.is_empty() {
                    text.push_str(&format!(
                        " with arguments: {}",
                        Value::Array(tool_use.arguments.clone())
                    ));
                }
            }
        }
        text
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub tool_use: Option<TaskToolUse>,
}

impl NewTask {
    /// Trim instructions, drop blank lines, and fill in a label.
    pub fn normalized(self) -> Result<Self, StoreError> {
        let instructions: Vec<String> = self
            .instructions
            .iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        let Some(first) = instructions.first() else {
            return Err(StoreError::Validation("Task instructions cannot be empty".into()));
        };

        let label = match self.label.filter(|l| !l.is_empty()) {
            Some(label) => label,
            None => {
                let mut label: String = first.chars().take(AUTO_LABEL_CHARS).collect();
                if first.chars().count() > AUTO_LABEL_CHARS {
                    label.push_str("...");
                }
                label
            }
        };

        Ok(Self {
            instructions,
            label: Some(label),
            tool_use: self.tool_use,
        })
    }
}

fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Partial update of a task. A present-but-empty label removes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub instructions: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub label: Option<Option<String>>,
    #[serde(default)]
    pub tool_use: Option<TaskToolUse>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.instructions.is_none() && self.label.is_none() && self.tool_use.is_none()
    }

    /// The label to store: `Some(None)` means remove it.
    pub fn label_change(&self) -> Option<Option<&str>> {
        self.label
            .as_ref()
            .map(|l| l.as_deref().filter(|s| !s.is_empty()))
    }
}

/// A human message injected into a running loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interjection {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    pub timestamp: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

/// The task queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All tasks, oldest first.
    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// The oldest pending task with at least one instruction.
    async fn next_pending_task(&self) -> Result<Option<Task>, StoreError>;

    /// Insert a pending task; returns its id.
    async fn create_task(&self, task: NewTask) -> Result<String, StoreError>;

    /// Insert a running task for a reporter invoked outside the runner.
    async fn create_one_off_task(&self, description: &str) -> Result<String, StoreError>;

    async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<bool, StoreError>;

    /// Fails with `NotFound` or, for running tasks, `Conflict`.
    async fn delete_task(&self, id: &str) -> Result<(), StoreError>;

    /// Claim a `pending` task: `running`, stamping `started_at`. The status
    /// check and the write are one atomic step; `false` when the task is
    /// missing or no longer pending.
    async fn start_task(&self, id: &str) -> Result<bool, StoreError>;

    async fn complete_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError>;

    /// Like [`complete_task`](Self::complete_task), but only while the task is
    /// still `running`; `false` when something else finished it first.
    async fn complete_running_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError>;

    async fn fail_task(
        &self,
        id: &str,
        error: &str,
        details: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError>;

    /// Like [`fail_task`](Self::fail_task), guarded on `running`.
    async fn fail_running_task(
        &self,
        id: &str,
        error: &str,
        details: Option<Value>,
        execution_report: Option<Value>,
    ) -> Result<bool, StoreError>;

    /// Back to `pending`, clearing `started_at`, `completed_at`, and `error`.
    async fn reset_task(&self, id: &str) -> Result<bool, StoreError>;

    /// Set `progress` and append to `progress_history`.
    async fn report_progress(&self, id: &str, progress: Value) -> Result<bool, StoreError>;

    /// Merge keys into `metadata`.
    async fn add_metadata(
        &self,
        id: &str,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<bool, StoreError>;
}

/// The interjection queue.
#[async_trait]
pub trait InterjectionStore: Send + Sync {
    async fn push_interjection(
        &self,
        session_id: Option<&str>,
        message: &str,
        timestamp: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Atomically mark every unprocessed interjection (for `session_id`, or
    /// all of them) as processed and return them oldest first. A message is
    /// returned by at most one call.
    async fn claim_interjections(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<Interjection>, StoreError>;
}

/// Key/value settings (the stored API key lives here).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// All three stores behind one handle.
pub trait Store: TaskStore + InterjectionStore + SettingsStore {}

impl<T: TaskStore + InterjectionStore + SettingsStore> Store for T {}

/// The task the current loop invocation is working on, shared between the
/// runner that sets it and the reporter tool that reads it.
#[derive(Debug, Clone, Default)]
pub struct CurrentTask(Arc<RwLock<Option<String>>>);

impl CurrentTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: impl Into<String>) {
        if let Ok(mut slot) = self.0.write() {
            *slot = Some(id.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.0.write() {
            *slot = None;
        }
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().ok().and_then(|slot| slot.clone())
    }
}
