//! Error types for the Tilt domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Tilt operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Sampling loop errors ---
    #[error("Sampling loop error: {0}")]
    Loop(#[from] LoopError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Anthropic API error: {status_code} - {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Response validation failed: {0}")]
    Deserialization(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether the client layer should retry the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => {
                matches!(status_code, 408 | 409 | 429) || *status_code >= 500
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// The only kind the dispatcher lets escape; the loop aborts on it.
    #[error("Fatal tool error in {tool_name}: {reason}")]
    Fatal { tool_name: String, reason: String },
}

impl ToolError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    FatalTool(ToolError),

    #[error("iteration limit of {0} reached without a final response")]
    IterationLimit(usize),

    #[error("wall-clock budget of {0}s exceeded")]
    WallClockExceeded(u64),

    #[error("cancelled")]
    Cancelled,
}

impl LoopError {
    /// Short machine-readable kind, used by the relay and the task runner.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider",
            Self::FatalTool(_) => "fatal_tool",
            Self::IterationLimit(_) => "iteration_limit",
            Self::WallClockExceeded(_) => "wall_clock",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_status_and_message() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 400,
            message: "bad tools".into(),
        });
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("bad tools"));
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::ApiError { status_code: 529, message: "overloaded".into() }.is_transient());
        assert!(!ProviderError::ApiError { status_code: 400, message: "invalid".into() }.is_transient());
        assert!(!ProviderError::AuthenticationFailed("bad key".into()).is_transient());
    }

    #[test]
    fn only_fatal_tool_errors_are_fatal() {
        assert!(ToolError::Fatal { tool_name: "task_reporter".into(), reason: "store gone".into() }.is_fatal());
        assert!(!ToolError::InvalidArguments("missing command".into()).is_fatal());
    }

    #[test]
    fn loop_error_kinds() {
        assert_eq!(LoopError::Cancelled.kind(), "cancelled");
        assert_eq!(LoopError::IterationLimit(5).kind(), "iteration_limit");
        let err = LoopError::from(ProviderError::Timeout("60s".into()));
        assert_eq!(err.kind(), "provider");
    }
}
