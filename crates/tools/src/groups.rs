//! Tool groups: which concrete tools each [`ToolVersion`] activates.

use std::sync::Arc;
use std::time::Duration;
use tilt_config::{AppConfig, BrowserConfig, ComputerConfig};
use tilt_core::store::{CurrentTask, TaskStore};
use tilt_core::tool::{Tool, ToolCollection};
use tilt_core::version::ToolVersion;

use crate::assert::AssertTool;
use crate::bash::BashTool;
use crate::computer::{ComputerTool, ComputerVersion};
use crate::edit::{EditTool, EditVersion};
use crate::inspect_js::InspectJsTool;
use crate::inspect_network::InspectNetworkTool;
use crate::sqlite_query::SqliteQueryTool;
use crate::task_reporter::TaskReporterTool;

/// Everything the tools of one loop invocation are built from.
#[derive(Clone)]
pub struct ToolContext {
    pub computer: ComputerConfig,
    pub browser: BrowserConfig,
    pub task_store: Arc<dyn TaskStore>,
    pub current_task: CurrentTask,
}

impl ToolContext {
    pub fn new(config: &AppConfig, task_store: Arc<dyn TaskStore>, current_task: CurrentTask) -> Self {
        Self {
            computer: config.computer.clone(),
            browser: config.browser.clone(),
            task_store,
            current_task,
        }
    }
}

fn provider_defined(version: ToolVersion) -> (ComputerVersion, EditVersion, &'static str) {
    match version {
        ToolVersion::ComputerUse20241022 => (ComputerVersion::V20241022, EditVersion::V20241022, "bash_20241022"),
        ToolVersion::ComputerUse20250124 => (ComputerVersion::V20250124, EditVersion::V20250124, "bash_20250124"),
        ToolVersion::ComputerUse20250429 => (ComputerVersion::V20250124, EditVersion::V20250429, "bash_20250124"),
    }
}

/// Build the ordered tool set for `version`. The computer tool receives
/// the finished collection so it can reach `inspect_network`.
pub fn build_collection(version: ToolVersion, ctx: &ToolContext) -> Arc<ToolCollection> {
    let (computer, edit, bash) = provider_defined(version);
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ComputerTool::new(computer, &ctx.computer)),
        Arc::new(EditTool::new(edit)),
        Arc::new(BashTool::new(bash)),
        Arc::new(
            InspectJsTool::new(ctx.browser.cdp_url.clone())
                .with_default_timeout(Duration::from_secs(ctx.browser.js_timeout_secs)),
        ),
        Arc::new(InspectNetworkTool::new(ctx.browser.cdp_url.clone())),
        Arc::new(TaskReporterTool::new(ctx.task_store.clone(), ctx.current_task.clone())),
        Arc::new(SqliteQueryTool),
        Arc::new(AssertTool),
    ];
    ToolCollection::new(tools)
}

/// Tool names for `version`, in registration order.
pub fn tool_names(version: ToolVersion) -> [&'static str; 8] {
    let (_, edit, _) = provider_defined(version);
    [
        "computer",
        edit.tool_name(),
        "bash",
        "inspect_js",
        "inspect_network",
        "task_reporter",
        "sqlite_query",
        "assert",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tilt_core::provider::ToolDefinition;

    mod fake_store {
        use async_trait::async_trait;
        use serde_json::Value;
        use tilt_core::error::StoreError;
        use tilt_core::store::{NewTask, Task, TaskStatus, TaskStore, TaskUpdate};

        pub struct EmptyStore;

        #[async_trait]
        impl TaskStore for EmptyStore {
            async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> { Ok(vec![]) }
            async fn get_task(&self, _id: &str) -> Result<Option<Task>, StoreError> { Ok(None) }
            async fn next_pending_task(&self) -> Result<Option<Task>, StoreError> { Ok(None) }
            async fn create_task(&self, _t: NewTask) -> Result<String, StoreError> { Ok("t".into()) }
            async fn create_one_off_task(&self, _d: &str) -> Result<String, StoreError> { Ok("t".into()) }
            async fn update_task(&self, _id: &str, _u: TaskUpdate) -> Result<bool, StoreError> { Ok(false) }
            async fn delete_task(&self, _id: &str) -> Result<(), StoreError> { Ok(()) }
            async fn start_task(&self, _id: &str) -> Result<bool, StoreError> { Ok(false) }
            async fn complete_task(&self, _id: &str, _s: TaskStatus, _r: Option<Value>, _e: Option<Value>) -> Result<bool, StoreError> { Ok(false) }
            async fn fail_task(&self, _id: &str, _e: &str, _d: Option<Value>, _x: Option<Value>) -> Result<bool, StoreError> { Ok(false) }
            async fn complete_running_task(&self, _id: &str, _s: TaskStatus, _r: Option<Value>, _e: Option<Value>) -> Result<bool, StoreError> { Ok(false) }
            async fn fail_running_task(&self, _id: &str, _e: &str, _d: Option<Value>, _x: Option<Value>) -> Result<bool, StoreError> { Ok(false) }
            async fn reset_task(&self, _id: &str) -> Result<bool, StoreError> { Ok(false) }
            async fn report_progress(&self, _id: &str, _p: Value) -> Result<bool, StoreError> { Ok(false) }
            async fn add_metadata(&self, _id: &str, _m: serde_json::Map<String, Value>) -> Result<bool, StoreError> { Ok(false) }
        }
    }

    fn context() -> ToolContext {
        ToolContext::new(&AppConfig::default(), Arc::new(fake_store::EmptyStore), CurrentTask::new())
    }

    fn builtin_type(def: &ToolDefinition) -> Option<&str> {
        match def {
            ToolDefinition::Builtin { api_type, .. } => Some(api_type),
            ToolDefinition::Custom { .. } => None,
        }
    }

    #[test]
    fn every_version_registers_eight_tools_in_order() {
        let ctx = context();
        for version in ToolVersion::ALL {
            let collection = build_collection(version, &ctx);
            assert_eq!(collection.names(), tool_names(version).to_vec());
        }
    }

    #[test]
    fn provider_defined_tool_types_per_version() {
        let ctx = context();
        let types = |version| {
            build_collection(version, &ctx)
                .definitions()
                .iter()
                .take(3)
                .map(|d| builtin_type(d).map(str::to_string))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            types(ToolVersion::ComputerUse20241022),
            vec![Some("computer_20241022".into()), Some("text_editor_20241022".into()), Some("bash_20241022".into())]
        );
        assert_eq!(
            types(ToolVersion::ComputerUse20250429),
            vec![Some("computer_20250124".into()), Some("text_editor_20250429".into()), Some("bash_20250124".into())]
        );
    }

    #[test]
    fn custom_tools_carry_schemas() {
        let collection = build_collection(ToolVersion::ComputerUse20250124, &context());
        let defs: Vec<Value> = collection
            .definitions()
            .into_iter()
            .skip(3)
            .map(|d| serde_json::to_value(d).unwrap())
            .collect();
        assert_eq!(defs.len(), 5);
        for def in defs {
            assert_eq!(def["input_schema"]["type"], json!("object"));
            assert!(def["description"].as_str().is_some_and(|d| !d.is_empty()));
        }
    }

    #[tokio::test]
    async fn dispatcher_validates_editor_commands() {
        let collection = build_collection(ToolVersion::ComputerUse20250429, &context());
        let result = collection
            .run("str_replace_based_edit_tool", json!({"command": "undo_edit", "path": "/tmp/x"}))
            .await
            .unwrap();
        assert!(result.error.unwrap().contains("must be one of"));
    }
}
