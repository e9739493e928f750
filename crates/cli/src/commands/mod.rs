pub mod exec_tool;
pub mod serve;
pub mod task;
pub mod worker;

use std::path::Path;
use tilt_config::AppConfig;

/// The config at `path` when given, else the default location, with
/// environment overrides applied either way.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path).map_err(|e| format!("Failed to load config: {e}"))?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?,
    };
    Ok(config)
}
