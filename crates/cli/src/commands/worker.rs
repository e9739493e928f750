//! `tilt worker` — Work through the task queue.

use tilt_agent::TaskRunner;
use tilt_config::AppConfig;
use tilt_core::store::{API_KEY_SETTING, SettingsStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(config: AppConfig, once: bool, no_pause: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = tilt_store::open(&config.database.path).await?;

    let api_key = match store.get_setting(API_KEY_SETTING).await? {
        Some(key) => Some(key),
        None => config.api_key.clone(),
    };
    let provider = tilt_providers::build_provider(&config.model, api_key.as_deref())?;

    println!("Tilt Worker");
    println!("   Model:    {} via {}", config.model.model, config.model.provider);
    println!("   Database: {}", config.database.path);
    println!("   Tools:    {}", config.runner.tool_version);

    let runner = TaskRunner::new(&config, store, provider).with_pause_after_completion(!no_pause);

    if once {
        match runner.run_once().await? {
            Some(outcome) => {
                println!("Task {} finished: {}", outcome.task_id, outcome.status.as_str());
                if let Some(error) = outcome.error {
                    println!("   Error: {error}");
                }
            }
            None => println!("No pending tasks"),
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping");
                on_signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
    });

    runner.run_continuous(cancel).await;
    Ok(())
}
