//! Tool System
//!
//! Types for remote tool capabilities and the calls the model makes
//! against them. Capabilities are discovered from tool servers and keyed by
//! a namespaced [`ToolKey`] resolved once at discovery time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AgentError, Result};

/// Separator between server id and tool name in a namespaced key
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool identifier (namespaced key, or a bare name when unambiguous)
    #[serde(alias = "tool")]
    pub name: String,

    /// Arguments as key-value pairs
    #[serde(default)]
    pub arguments: HashMap<String, serde_json::Value>,

    /// Optional call ID for tracking
    #[serde(default)]
    pub id: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: HashMap<String, serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            id: None,
        }
    }

    /// Fill in a call id when the model did not provide one
    pub fn ensure_id(&mut self) -> &str {
        self.id
            .get_or_insert_with(|| format!("call_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn arguments_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.arguments
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Result from tool execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    /// Tool that was called
    pub name: String,

    /// Call ID (if provided in request)
    pub id: Option<String>,

    /// Whether execution succeeded
    pub success: bool,

    /// Output (success message or error)
    pub output: String,

    /// Structured data (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Wall time of the invocation
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ToolResult {
    pub fn success(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            success: true,
            output: output.into(),
            data: None,
            elapsed_ms: 0,
        }
    }

    pub fn failure(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            success: false,
            output: error.into(),
            data: None,
            elapsed_ms: 0,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }
}

/// Namespaced capability key: owning server id plus tool name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolKey {
    pub server: String,
    pub tool: String,
}

impl ToolKey {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }

    /// Split `server__tool` at the first separator
    pub fn parse(key: &str) -> Option<Self> {
        let (server, tool) = key.split_once(NAMESPACE_SEPARATOR)?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self::new(server, tool))
    }
}

impl std::fmt::Display for ToolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.server, NAMESPACE_SEPARATOR, self.tool)
    }
}

/// A callable capability advertised by one tool server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCapability {
    /// Name as the server knows it (not namespaced)
    pub name: String,

    /// Human-readable description (shown to LLM)
    #[serde(default)]
    pub description: String,

    /// JSON Schema of the arguments object
    #[serde(default = "empty_object_schema", alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolCapability {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Structural check: required top-level arguments are present.
    ///
    /// Full JSON Schema validation stays with the tool server.
    pub fn check_arguments(&self, call: &ToolCall) -> Result<()> {
        let Some(required) = self.input_schema.get("required").and_then(|r| r.as_array()) else {
            return Ok(());
        };

        for field in required.iter().filter_map(|f| f.as_str()) {
            if !call.arguments.contains_key(field) {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter '{}' for tool '{}'",
                    field, call.name
                )));
            }
        }

        Ok(())
    }
}

/// Tool definition handed to the model backend (function-calling shape)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Namespaced key the model must call
    pub name: String,

    pub description: String,

    /// JSON Schema of the arguments object
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn from_capability(key: &ToolKey, capability: &ToolCapability) -> Self {
        Self {
            name: key.to_string(),
            description: capability.description.clone(),
            parameters: capability.input_schema.clone(),
        }
    }
}

/// Generate a system prompt section describing available tools, for
/// backends without native tool calling
pub fn generate_prompt_section(specs: &[ToolSpec]) -> String {
    let mut prompt = String::from("## Available Tools\n\n");
    prompt.push_str("You can use the following tools by responding with a JSON block:\n\n");
    prompt.push_str("```tool\n{\"tool\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}\n```\n\n");

    for spec in specs {
        prompt.push_str(&format!("### {}\n", spec.name));
        prompt.push_str(&format!("{}\n", spec.description));

        let required: Vec<&str> = spec
            .parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        if let Some(properties) = spec.parameters.get("properties").and_then(|p| p.as_object()) {
            if !properties.is_empty() {
                prompt.push_str("**Parameters:**\n");
            }
            for (name, schema) in properties {
                let param_type = schema.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                let description = schema.get("description").and_then(|d| d.as_str()).unwrap_or("");
                let marker = if required.contains(&name.as_str()) { " (required)" } else { "" };
                prompt.push_str(&format!(
                    "- `{}` ({}){}: {}\n",
                    name, param_type, marker, description
                ));
            }
        }
        prompt.push('\n');
    }

    prompt
}

/// Parse a tool call written into the response text
///
/// Looks for a fenced ```tool block first, then falls back to an inline
/// JSON object with a `"tool"` key.
pub fn parse_tool_call(content: &str) -> Option<ToolCall> {
    let tool_start = "```tool";
    let tool_end = "```";

    if let Some(start_idx) = content.find(tool_start) {
        let after_marker = &content[start_idx + tool_start.len()..];
        if let Some(end_idx) = after_marker.find(tool_end) {
            let json_str = after_marker[..end_idx].trim();
            if let Ok(call) = serde_json::from_str::<ToolCall>(json_str) {
                return Some(call);
            }
        }
    }

    parse_inline_tool_call(content)
}

fn parse_inline_tool_call(content: &str) -> Option<ToolCall> {
    if !content.contains(r#""tool""#) {
        return None;
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;

    if end <= start {
        return None;
    }

    serde_json::from_str::<ToolCall>(&content[start..=end]).ok()
}
