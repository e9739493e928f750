//! API-key settings and loop timing endpoints.

use axum::{extract::State, response::Json};
use serde::Deserialize;
use serde_json::{Value, json};
use tilt_core::error::StoreError;
use tilt_core::store::{API_KEY_SETTING, SettingsStore, validate_api_key};
use tracing::info;

use crate::{ApiError, SharedState};

/// The stored key, falling back to the configured one.
pub(crate) async fn configured_api_key(state: &SharedState) -> Result<Option<String>, StoreError> {
    match state.store.get_setting(API_KEY_SETTING).await? {
        Some(key) => Ok(Some(key)),
        None => Ok(state.config.api_key.clone()),
    }
}

/// A usable API key, or the message to show the client.
pub(crate) async fn resolve_api_key(state: &SharedState) -> Result<String, String> {
    let key = configured_api_key(state)
        .await
        .map_err(|e| format!("Failed to read API key: {e}"))?
        .ok_or_else(|| {
            format!(
                "No API key found - store your Anthropic API key with POST /api-key/set \
                 (setting '{API_KEY_SETTING}') or set ANTHROPIC_API_KEY"
            )
        })?;
    if !validate_api_key(&key) {
        return Err("Invalid API key format found in settings".into());
    }
    Ok(key)
}

/// `GET /api-key/status`
pub async fn api_key_status_handler(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let key = configured_api_key(&state).await?;
    let has_key = key.is_some();
    let is_valid = key.as_deref().is_some_and(validate_api_key);
    let message = if is_valid {
        "API key is properly configured"
    } else {
        "API key is not configured or invalid"
    };
    Ok(Json(json!({"has_key": has_key, "is_valid": is_valid, "message": message})))
}

#[derive(Debug, Deserialize)]
pub struct SetApiKeyRequest {
    #[serde(default)]
    pub api_key: Option<String>,
}

/// `POST /api-key/set`
pub async fn set_api_key_handler(
    State(state): State<SharedState>,
    Json(body): Json<SetApiKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    let Some(key) = body.api_key.filter(|k| !k.is_empty()) else {
        return Err(ApiError::bad_request("Missing api_key in request"));
    };
    if !validate_api_key(&key) {
        return Err(ApiError::bad_request(
            "Invalid API key format. API key should start with 'sk-ant-' and be at least 20 characters long.",
        ));
    }
    state.store.put_setting(API_KEY_SETTING, &key).await?;
    info!("API key stored");
    Ok(Json(json!({"success": true, "message": "API key stored successfully"})))
}

/// `GET /timing/statistics` — aggregated over every recorded step.
pub async fn timing_statistics_handler(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({"status": "success", "data": state.timing.statistics()}))
}

/// `GET /timing/history` — recorded runs and their steps.
pub async fn timing_history_handler(State(state): State<SharedState>) -> Json<Value> {
    let runs = state.timing.runs();
    let steps: Vec<_> = runs.iter().flat_map(|r| r.report.steps.iter()).collect();
    Json(json!({
        "status": "success",
        "data": {
            "steps": steps,
            "count": steps.len(),
            "runs": runs,
        },
    }))
}

/// `DELETE /timing/reset`
pub async fn timing_reset_handler(State(state): State<SharedState>) -> Json<Value> {
    state.timing.reset();
    Json(json!({"status": "success", "message": "Timing data reset successfully"}))
}
