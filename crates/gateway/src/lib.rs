//! HTTP API gateway for Tilt.
//!
//! Exposes the streaming chat relay, one-shot tool execution, the task
//! queue, user interjections, API-key settings and loop timings.
//!
//! Built on Axum; every route shares one [`GatewayState`].

pub mod admin;
pub mod relay;
pub mod tasks;

use axum::{
    Router,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tilt_config::AppConfig;
use tilt_core::error::{ProviderError, StoreError};
use tilt_core::provider::Provider;
use tilt_core::store::Store;
use tilt_telemetry::TimingHistory;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Builds a model client for an API key.
pub type ProviderFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub providers: ProviderFactory,
    /// Finished chat timings, newest last.
    pub timing: Arc<TimingHistory>,
}

impl GatewayState {
    pub fn new(config: AppConfig, store: Arc<dyn Store>) -> Self {
        let model = config.model.clone();
        let providers: ProviderFactory =
            Arc::new(move |key: &str| tilt_providers::build_provider(&model, Some(key)));
        Self::with_providers(config, store, providers)
    }

    pub fn with_providers(config: AppConfig, store: Arc<dyn Store>, providers: ProviderFactory) -> Self {
        let timing = Arc::new(TimingHistory::new(config.gateway.timing_history));
        Self {
            config,
            store,
            providers,
            timing,
        }
    }
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/chat/stream", post(relay::chat_stream_handler))
        .route("/tools/execute", post(relay::execute_tool_handler))
        .route("/tasks", get(tasks::list_tasks_handler).post(tasks::create_task_handler))
        .route("/next-task", get(tasks::next_task_handler))
        .route("/tasks/{id}", put(tasks::update_task_handler).delete(tasks::delete_task_handler))
        .route("/tasks/{id}/complete", post(tasks::complete_task_handler))
        .route("/tasks/{id}/error", post(tasks::error_task_handler))
        .route("/tasks/{id}/start", post(tasks::start_task_handler))
        .route("/tasks/{id}/stop", post(tasks::reset_task_handler))
        .route("/tasks/{id}/reset", post(tasks::reset_task_handler))
        .route("/agent/interrupt", post(tasks::interrupt_handler))
        .route("/agent/interrupts/{test_id}", get(tasks::claim_interrupts_handler))
        .route("/api-key/status", get(admin::api_key_status_handler))
        .route("/api-key/set", post(admin::set_api_key_handler))
        .route("/timing/statistics", get(admin::timing_statistics_handler))
        .route("/timing/history", get(admin::timing_history_handler))
        .route("/timing/reset", delete(admin::timing_reset_handler))
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let store = tilt_store::open(&config.database.path).await?;
    info!(database = %config.database.path, "Store opened");

    let app = build_router(Arc::new(GatewayState::new(config, store)));

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// --- Errors ---

/// A failed request, rendered as `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match e {
            StoreError::NotFound(m) | StoreError::Conflict(m) | StoreError::Validation(m) => m,
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "computer-use-api",
        version: env!("CARGO_PKG_VERSION"),
    })
}
