//! JSON-RPC 2.0 and tool-server payloads

use agent_core::ToolCapability;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

pub const METHOD_NOT_FOUND: i64 = -32601;

/// Outbound request; `id: None` makes it a notification
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.to_string(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// `tools/list` result page
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolCapability>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// MCP-style `tools/call` result
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub structured_content: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Typed failure a tool server may return in place of a result
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorEnvelope {
    pub error_code: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorEnvelope {
    fn from_value(value: &Value) -> Option<Self> {
        value.get("error_code")?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// What a `tools/call` result amounts to
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Output(Value),
    Failed { code: Option<String>, message: String },
}

impl CallOutcome {
    /// Accepts the MCP content shape, a bare `{result}` object, or an
    /// `{error_code, message}` envelope
    pub fn from_result(result: Value) -> Self {
        if let Some(envelope) = ErrorEnvelope::from_value(&result) {
            return Self::Failed {
                code: Some(envelope.error_code),
                message: envelope.message,
            };
        }

        let is_mcp = result.get("content").is_some_and(Value::is_array)
            || result.get("isError").is_some()
            || result.get("structuredContent").is_some();
        if is_mcp {
            let call: CallToolResult = serde_json::from_value(result.clone()).unwrap_or_default();
            return Self::from_mcp(call);
        }

        match result {
            Value::Object(mut map) if map.len() == 1 && map.contains_key("result") => {
                Self::Output(map.remove("result").unwrap_or(Value::Null))
            }
            other => Self::Output(other),
        }
    }

    fn from_mcp(call: CallToolResult) -> Self {
        let text: Vec<&str> = call
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        let text = text.join("\n");

        let payload = match call.structured_content {
            Some(value) => value,
            None => serde_json::from_str::<Value>(&text)
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| Value::String(text.clone())),
        };

        if let Some(envelope) = ErrorEnvelope::from_value(&payload) {
            return Self::Failed {
                code: Some(envelope.error_code),
                message: envelope.message,
            };
        }
        if call.is_error {
            let message = if text.is_empty() { "tool reported an error".to_string() } else { text };
            return Self::Failed { code: None, message };
        }
        Self::Output(payload)
    }
}
