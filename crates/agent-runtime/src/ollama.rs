//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` over Ollama's `/api/chat` endpoint:
//! native tool calling, `format` for schema-constrained output, and
//! NDJSON streaming.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, CompletionStream, GenerationOptions, LlmProvider, ModelRequest, ProviderInfo,
        StopReason, StreamChunk, TokenUsage,
    },
    tool::{ToolCall, ToolSpec},
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Model used when a request does not name one
    pub model: String,

    /// Whole-request timeout in seconds
    pub timeout_secs: u64,

    pub connect_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            model: "llama3.2".into(),
            timeout_secs: 120,
            connect_timeout_secs: 5,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset or unparsable values keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("OLLAMA_HOST").unwrap_or(defaults.host),
            port: lookup("OLLAMA_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            model: lookup("OLLAMA_MODEL").unwrap_or(defaults.model),
            timeout_secs: lookup("OLLAMA_TIMEOUT_SECS")
                .and_then(|t| t.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            connect_timeout_secs: defaults.connect_timeout_secs,
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: reqwest::Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("Ollama HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Create with default localhost settings
    pub fn localhost() -> Result<Self> {
        Self::from_config(OllamaConfig::default())
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url(), path.trim_start_matches('/'))
    }

    fn model_for<'a>(&'a self, options: &'a GenerationOptions) -> &'a str {
        if options.model.is_empty() {
            &self.config.model
        } else {
            &options.model
        }
    }

    async fn post_chat(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::ModelBackend(format!("Ollama unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::ModelBackend(format!("Ollama returned {}: {}", status, body.trim())));
        }
        Ok(response)
    }

    async fn version(&self) -> Option<String> {
        let response = self.client.get(self.url("/api/version")).send().await.ok()?;
        let body: Value = response.json().await.ok()?;
        body["version"].as_str().map(str::to_string)
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: "Ollama".into(),
            version: self.version().await,
            model: self.config.model.clone(),
            supports_streaming: true,
            supports_tools: true,
            supports_structured_output: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.get(self.url("/api/tags")).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(&self, request: &ModelRequest) -> Result<Completion> {
        let model = self.model_for(&request.options);
        let body = ChatRequest::build(model, request, false);
        tracing::debug!(
            model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "Sending chat request to Ollama"
        );

        let response: ChatResponse = self
            .post_chat(&body)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::ModelBackend(format!("Ollama response: {}", e)))?;

        response.into_completion(model, body.format.is_some())
    }

    async fn complete_stream(&self, request: &ModelRequest) -> Result<CompletionStream> {
        let model = self.model_for(&request.options).to_string();
        let body = ChatRequest::build(&model, request, true);
        let response = self.post_chat(&body).await?;

        let chunks = ndjson_stream(response.bytes_stream()).map(|line| {
            let response = line?;
            response.into_chunk()
        });
        Ok(Box::pin(chunks))
    }

    fn estimate_tokens(&self, text: &str) -> u32 {
        // Llama tokenizer is roughly 4 chars per token
        (text.len() / 4) as u32
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
    options: WireOptions<'a>,
}

impl<'a> ChatRequest<'a> {
    /// `format` would suppress tool calls, so it is only set on requests
    /// without tools; the schema is always described in the system message
    fn build(model: &'a str, request: &'a ModelRequest, stream: bool) -> Self {
        let mut messages = convert_messages(&request.messages);
        if let Some(schema) = &request.output_schema {
            let instructions = schema.instructions();
            match messages.first_mut().filter(|m| m.role == "system") {
                Some(system) => {
                    system.content.push_str("\n\n");
                    system.content.push_str(&instructions);
                }
                None => messages.insert(0, WireMessage::text("system", instructions)),
            }
        }

        let format = request
            .output_schema
            .as_ref()
            .filter(|_| !request.wants_tools())
            .map(|s| &s.json_schema);

        Self {
            model,
            messages,
            stream,
            tools: request.tools.iter().map(WireTool::from).collect(),
            format,
            options: WireOptions {
                temperature: request.options.temperature,
                top_p: request.options.top_p,
                num_predict: request.options.max_tokens,
                stop: &request.options.stop_sequences,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

impl WireMessage {
    fn text(role: &'static str, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireToolFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireToolFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

impl<'a> From<&'a ToolSpec> for WireTool<'a> {
    fn from(spec: &'a ToolSpec) -> Self {
        Self {
            kind: "function",
            function: WireToolFunction {
                name: &spec.name,
                description: &spec.description,
                parameters: &spec.parameters,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireOptions<'a> {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: Option<WireReply>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

impl ChatResponse {
    fn usage(&self) -> Option<TokenUsage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        Some(TokenUsage::new(
            self.prompt_eval_count.unwrap_or(0),
            self.eval_count.unwrap_or(0),
        ))
    }

    fn stop_reason(&self, has_tool_calls: bool) -> Option<StopReason> {
        if has_tool_calls {
            return Some(StopReason::ToolUse);
        }
        match self.done_reason.as_deref() {
            Some("length") => Some(StopReason::Length),
            Some(_) => Some(StopReason::Stop),
            None => self.done.then_some(StopReason::Stop),
        }
    }

    fn into_completion(self, model: &str, constrained: bool) -> Result<Completion> {
        if let Some(error) = &self.error {
            return Err(AgentError::ModelBackend(format!("Ollama: {}", error)));
        }
        let usage = self.usage();
        let reply = self
            .message
            .ok_or_else(|| AgentError::ModelBackend("Ollama response missing message".into()))?;
        let tool_calls: Vec<ToolCall> = reply.tool_calls.into_iter().map(convert_tool_call).collect();
        let stop_reason = ChatResponse {
            done: self.done,
            done_reason: self.done_reason,
            ..Default::default()
        }
        .stop_reason(!tool_calls.is_empty());

        let structured = if constrained {
            serde_json::from_str::<Value>(&reply.content).ok().filter(Value::is_object)
        } else {
            None
        };

        Ok(Completion {
            content: reply.content,
            structured,
            tool_calls,
            model: if self.model.is_empty() { model.to_string() } else { self.model },
            usage,
            stop_reason,
        })
    }

    fn into_chunk(self) -> Result<StreamChunk> {
        if let Some(error) = &self.error {
            return Err(AgentError::ModelBackend(format!("Ollama: {}", error)));
        }
        let usage = if self.done { self.usage() } else { None };
        let reply = self.message.unwrap_or_default();
        let tool_calls: Vec<ToolCall> = reply.tool_calls.into_iter().map(convert_tool_call).collect();
        let stop_reason = if self.done {
            let has_calls = !tool_calls.is_empty();
            ChatResponse {
                done: true,
                done_reason: self.done_reason,
                ..Default::default()
            }
            .stop_reason(has_calls)
        } else {
            None
        };

        Ok(StreamChunk {
            delta: reply.content,
            done: self.done,
            usage,
            tool_calls,
            stop_reason,
        })
    }
}

/// Convert agent messages to Ollama format
fn convert_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut wire = WireMessage::text(role, m.content.clone());
            if let Some(meta) = &m.metadata {
                wire.tool_calls = meta
                    .tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        function: WireFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments_value(),
                        },
                    })
                    .collect();
                if m.role == Role::Tool {
                    wire.tool_name = meta.tool_name.clone();
                }
            }
            wire
        })
        .collect()
}

fn convert_tool_call(call: WireToolCall) -> ToolCall {
    let arguments = match call.function.arguments {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        value => serde_json::from_value::<HashMap<String, Value>>(value).unwrap_or_default(),
    };
    ToolCall::new(call.function.name, arguments)
}

/// Split a byte stream into newline-delimited JSON records
fn ndjson_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<ChatResponse>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    struct State<S> {
        bytes: Pin<Box<S>>,
        buffer: Vec<u8>,
        ready: VecDeque<Result<ChatResponse>>,
        finished: bool,
    }

    fn drain_lines(buffer: &mut Vec<u8>, ready: &mut VecDeque<Result<ChatResponse>>) {
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            push_line(&line, ready);
        }
    }

    fn push_line(line: &[u8], ready: &mut VecDeque<Result<ChatResponse>>) {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }
        ready.push_back(
            serde_json::from_slice(line)
                .map_err(|e| AgentError::ModelBackend(format!("Malformed Ollama stream line: {}", e))),
        );
    }

    let state = State {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    drain_lines(&mut state.buffer, &mut state.ready);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state
                        .ready
                        .push_back(Err(AgentError::ModelBackend(format!("Ollama stream: {}", e))));
                }
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    push_line(&rest, &mut state.ready);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::message::MessageMetadata;
    use agent_core::structured::OutputSchema;
    use agent_core::tool::ToolResult;
    use serde_json::json;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
        assert_eq!(config.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_config_from_lookup() {
        let config = OllamaConfig::from_lookup(lookup(&[
            ("OLLAMA_HOST", "http://gpu-box/"),
            ("OLLAMA_PORT", "not-a-port"),
            ("OLLAMA_MODEL", "qwen2.5"),
        ]));
        assert_eq!(config.base_url(), "http://gpu-box:11434");
        assert_eq!(config.model, "qwen2.5");
    }

    #[test]
    fn test_message_conversion() {
        let call = ToolCall::new("weather__forecast", HashMap::from([("city".into(), json!("Gulu"))]));
        let result = ToolResult::success("weather__forecast", "dry");
        let messages = vec![
            Message::system("You are helpful."),
            Message::user("Hello"),
            Message::assistant("").with_tool_calls(vec![call]),
            Message::tool_result(&result),
        ];

        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[2].tool_calls[0].function.arguments, json!({"city": "Gulu"}));
        assert_eq!(converted[3].role, "tool");
        assert_eq!(converted[3].tool_name.as_deref(), Some("weather__forecast"));
    }

    #[test]
    fn test_format_only_without_tools() {
        let spec = ToolSpec {
            name: "weather__forecast".into(),
            description: "Forecast".into(),
            parameters: json!({"type": "object"}),
        };
        let mut request = ModelRequest {
            messages: vec![Message::system("Be brief."), Message::user("Rain?")],
            tools: vec![spec],
            output_schema: Some(OutputSchema::default()),
            options: GenerationOptions::default(),
        };

        let body = serde_json::to_value(ChatRequest::build("llama3.2", &request, false)).unwrap();
        assert!(body.get("format").is_none());
        assert_eq!(body["tools"][0]["type"], "function");
        assert!(body["messages"][0]["content"].as_str().unwrap().contains("single JSON object"));

        request.tools.clear();
        let body = serde_json::to_value(ChatRequest::build("llama3.2", &request, true)).unwrap();
        assert_eq!(body["format"]["type"], "object");
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
        assert!(body["options"].get("stop").is_none());
    }

    #[test]
    fn test_response_with_tool_calls() {
        let response: ChatResponse = serde_json::from_value(json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": "",
                        "tool_calls": [{"function": {"name": "agri__soil", "arguments": {"region": "Rift"}}}]},
            "done": true, "done_reason": "stop",
            "prompt_eval_count": 120, "eval_count": 14
        }))
        .unwrap();

        let completion = response.into_completion("llama3.2", false).unwrap();
        assert_eq!(completion.tool_calls[0].name, "agri__soil");
        assert_eq!(completion.tool_calls[0].arguments["region"], "Rift");
        assert_eq!(completion.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(completion.usage.unwrap().total_tokens, 134);
    }

    #[test]
    fn test_constrained_response_is_parsed() {
        let response: ChatResponse = serde_json::from_value(json!({
            "message": {"content": "{\"summary\": \"dry\", \"locations\": [], \"classification\": \"weather\"}"},
            "done": true
        }))
        .unwrap();
        let completion = response.into_completion("llama3.2", true).unwrap();
        assert_eq!(completion.model, "llama3.2");
        assert_eq!(completion.structured.unwrap()["summary"], "dry");
    }

    #[test]
    fn test_error_body() {
        let response: ChatResponse = serde_json::from_value(json!({"error": "model not found"})).unwrap();
        assert!(matches!(
            response.into_completion("x", false),
            Err(AgentError::ModelBackend(msg)) if msg.contains("model not found")
        ));
    }

    #[tokio::test]
    async fn test_ndjson_split_across_chunks() {
        let parts: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"{\"message\":{\"content\":\"Hel".to_vec()),
            Ok(b"lo\"},\"done\":false}\n{\"message\":{\"content\":\" there\"},\"done\":false}\n".to_vec()),
            Ok(b"{\"message\":{\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"eval_count\":3}".to_vec()),
        ];
        let chunks: Vec<StreamChunk> = ndjson_stream(futures::stream::iter(parts))
            .map(|r| r.and_then(ChatResponse::into_chunk).unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].delta, "Hello");
        assert_eq!(chunks[1].delta, " there");
        assert!(chunks[2].done);
        assert_eq!(chunks[2].usage.unwrap().completion_tokens, 3);
        assert_eq!(chunks[2].stop_reason, Some(StopReason::Stop));
    }

    #[tokio::test]
    async fn test_ndjson_transport_error_ends_stream() {
        let parts: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"{\"message\":{\"content\":\"a\"},\"done\":false}\n".to_vec()),
            Err("connection reset".into()),
        ];
        let items: Vec<Result<ChatResponse>> = ndjson_stream(futures::stream::iter(parts)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(AgentError::ModelBackend(msg)) if msg.contains("connection reset")));
    }

    #[test]
    fn test_unused_metadata_is_ignored() {
        let mut msg = Message::user("hi");
        msg.metadata = Some(MessageMetadata {
            tokens: Some(3),
            ..Default::default()
        });
        let converted = convert_messages(&[msg]);
        assert!(converted[0].tool_calls.is_empty());
        assert!(converted[0].tool_name.is_none());
    }
}
