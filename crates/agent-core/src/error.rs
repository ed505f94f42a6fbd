//! Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Session id is unknown, expired, or malformed
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session id is already taken (create with explicit id)
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Backing store I/O or decode fault
    #[error("Session store error: {0}")]
    SessionStore(String),

    /// Tool server could not be reached or the connection is not open
    #[error("Tool server '{server}' unavailable: {reason}")]
    ToolUnavailable { server: String, reason: String },

    /// A single tool invocation exceeded its deadline
    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    /// Tool not found in the open scope
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool arguments failed the schema pre-check
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool server answered with a typed error envelope
    #[error("Tool '{tool}' failed{}: {message}", code_suffix(.code))]
    ToolExecution {
        tool: String,
        code: Option<String>,
        message: String,
    },

    /// Model backend error
    #[error("Model backend error: {0}")]
    ModelBackend(String),

    /// Structured validation could not recover the schema
    #[error("Validation exhausted: {0}")]
    ValidationExhausted(String),

    /// Empty or otherwise unusable query text
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Overall query deadline exceeded
    #[error("Query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    /// Streaming caller went away before the query finished
    #[error("Query cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

/// Terminal failure codes of a query
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SessionNotFound,
    SessionInfraError,
    ToolUnavailable,
    ToolTimeout,
    ModelBackendError,
    ValidationExhausted,
    InvalidQuery,
    QueryTimeout,
    Cancelled,
    Internal,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionNotFound => "session_not_found",
            Self::SessionInfraError => "session_infra_error",
            Self::ToolUnavailable => "tool_unavailable",
            Self::ToolTimeout => "tool_timeout",
            Self::ModelBackendError => "model_backend_error",
            Self::ValidationExhausted => "validation_exhausted",
            Self::InvalidQuery => "invalid_query",
            Self::QueryTimeout => "query_timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AgentError {
    /// Map onto the query state machine's `Failed(reason)` code
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AgentError::SessionNotFound(_) | AgentError::SessionExists(_) => {
                FailureReason::SessionNotFound
            }
            AgentError::SessionStore(_) => FailureReason::SessionInfraError,
            AgentError::ToolUnavailable { .. }
            | AgentError::ToolNotFound(_)
            | AgentError::ToolValidation(_)
            | AgentError::ToolExecution { .. } => FailureReason::ToolUnavailable,
            AgentError::ToolTimeout { .. } => FailureReason::ToolTimeout,
            AgentError::ModelBackend(_) => FailureReason::ModelBackendError,
            AgentError::ValidationExhausted(_) => FailureReason::ValidationExhausted,
            AgentError::InvalidQuery(_) => FailureReason::InvalidQuery,
            AgentError::QueryTimeout { .. } => FailureReason::QueryTimeout,
            AgentError::Cancelled(_) => FailureReason::Cancelled,
            AgentError::Config(_)
            | AgentError::Io(_)
            | AgentError::Json(_)
            | AgentError::Other(_) => FailureReason::Internal,
        }
    }

    /// Whether the caller caused this (stale session id, bad input)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AgentError::SessionNotFound(_)
                | AgentError::SessionExists(_)
                | AgentError::InvalidQuery(_)
        )
    }

    /// Infrastructure fault in the session backing store
    pub fn is_store_fault(&self) -> bool {
        matches!(self, AgentError::SessionStore(_))
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::SessionNotFound(id) => {
                format!("Session '{}' was not found or has expired.", id)
            }
            AgentError::SessionExists(id) => format!("Session '{}' already exists.", id),
            AgentError::SessionStore(_) => {
                "Session storage is temporarily unavailable. Please try again.".into()
            }
            AgentError::ToolUnavailable { .. } => "Required tools are currently unavailable.".into(),
            AgentError::ToolTimeout { tool, .. } => format!("The tool '{}' took too long to respond.", tool),
            AgentError::ModelBackend(_) => "The AI service encountered an error.".into(),
            AgentError::InvalidQuery(msg) => format!("Invalid query: {}", msg),
            AgentError::QueryTimeout { .. } => {
                "The request took too long to process. Please try a simpler query.".into()
            }
            AgentError::Cancelled(_) => "The request was cancelled.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}
