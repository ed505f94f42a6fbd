//! Transport-level errors, converted to `AgentError` at the crate seam

use agent_core::AgentError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// JSON-RPC "method not found"
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Rpc { code, .. } if *code == crate::types::METHOD_NOT_FOUND)
    }

    /// Failure reaching or talking to the server at all
    pub fn into_unavailable(self, server: &str) -> AgentError {
        AgentError::ToolUnavailable {
            server: server.to_string(),
            reason: self.to_string(),
        }
    }

    /// Failure of one call; server-reported errors keep their code
    pub fn into_call_error(self, server: &str, tool: &str) -> AgentError {
        match self {
            Self::Rpc { code, message } => AgentError::ToolExecution {
                tool: tool.to_string(),
                code: Some(code.to_string()),
                message,
            },
            other => other.into_unavailable(server),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_maps_to_execution() {
        let err = McpError::Rpc { code: -32602, message: "bad city".into() };
        match err.into_call_error("weather", "forecast") {
            AgentError::ToolExecution { tool, code, message } => {
                assert_eq!(tool, "forecast");
                assert_eq!(code.as_deref(), Some("-32602"));
                assert_eq!(message, "bad city");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_status_error_maps_to_unavailable() {
        let err = McpError::Status { status: 502, body: "bad gateway".into() };
        assert!(matches!(
            err.into_call_error("weather", "forecast"),
            AgentError::ToolUnavailable { server, .. } if server == "weather"
        ));
    }

    #[test]
    fn test_method_not_found() {
        assert!(McpError::Rpc { code: -32601, message: String::new() }.is_method_not_found());
        assert!(!McpError::Protocol("x".into()).is_method_not_found());
    }
}
