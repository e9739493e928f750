//! `tilt exec-tool` — Run one tool outside any loop.

use serde_json::{Value, json};
use std::sync::Arc;
use tilt_config::AppConfig;
use tilt_core::store::{CurrentTask, TaskStore};
use tilt_core::version::ToolVersion;
use tilt_tools::{ToolContext, build_collection};

pub async fn run(
    config: AppConfig,
    name: &str,
    input: &str,
    tool_version: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let version: ToolVersion = tool_version.parse()?;
    let input: Value = serde_json::from_str(input).map_err(|e| format!("Invalid --input JSON: {e}"))?;

    let store: Arc<dyn TaskStore> = tilt_store::open(&config.database.path).await?;
    let context = ToolContext::new(&config, store, CurrentTask::new());
    let tools = build_collection(version, &context);

    let printed = match tools.run(name, input).await {
        Ok(result) => json!({"output": result.output, "error": result.error}),
        Err(e) => json!({"output": null, "error": e.to_string()}),
    };
    println!("{}", serde_json::to_string_pretty(&printed)?);
    Ok(())
}
