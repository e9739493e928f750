//! Remote-debuggable browser readiness.

use serde_json::json;
use std::time::Duration;
use tilt_config::BrowserConfig;
use tilt_core::tool::ToolCollection;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe `{cdp_url}/json` until it answers, up to `attempts` times.
pub async fn wait_for_browser(config: &BrowserConfig) -> bool {
    let http = reqwest::Client::new();
    let url = format!("{}/json", config.cdp_url.trim_end_matches('/'));
    let interval = Duration::from_millis(config.readiness_interval_ms);

    for attempt in 1..=config.readiness_attempts {
        match http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => return true,
            Ok(resp) => debug!(attempt, status = %resp.status(), "Browser not ready"),
            Err(e) => debug!(attempt, error = %e, "Browser not reachable"),
        }
        if attempt < config.readiness_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    false
}

/// Start network capture before the first model call when the tool set has
/// `inspect_network` and a browser answers. Never fails: a tool that needs
/// the browser reports its own error later.
pub async fn prepare_network_monitoring(tools: &ToolCollection, config: &BrowserConfig) {
    if !tools.contains("inspect_network") {
        return;
    }
    info!(cdp_url = %config.cdp_url, "Checking for browser with remote debugging");
    if !wait_for_browser(config).await {
        info!("Browser not detected; network monitoring will start on first click");
        return;
    }

    info!("Browser detected, starting network monitoring");
    match tools
        .run("inspect_network", json!({"action": "monitor_start"}))
        .await
    {
        Ok(result) => match result.error {
            Some(error) => warn!(error = %error, "Failed to auto-start network monitoring"),
            None => info!("Network monitoring auto-started"),
        },
        Err(e) => warn!(error = %e, "Network monitoring auto-start raised"),
    }
}
