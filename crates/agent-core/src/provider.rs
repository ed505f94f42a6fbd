//! Model backend seam.
//!
//! The orchestrator drives a turn through [`LlmProvider`] only. A backend
//! receives the windowed history, the tool catalog for this query and an
//! optional output schema in one [`ModelRequest`], and answers with either
//! text or native tool calls.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;
use crate::structured::OutputSchema;
use crate::tool::{ToolCall, ToolSpec};

/// Sampling knobs forwarded to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// Empty means the backend's configured model.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_tokens: 2048,
            top_p: 0.9,
            stop_sequences: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    /// Empty when the query has no usable tool servers.
    pub tools: Vec<ToolSpec>,
    pub output_schema: Option<OutputSchema>,
    pub options: GenerationOptions,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>, options: GenerationOptions) -> Self {
        Self {
            messages,
            options,
            ..Self::default()
        }
    }

    pub fn wants_tools(&self) -> bool {
        !self.tools.is_empty()
    }
}

/// One full backend reply.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,

    /// Parsed JSON when the backend constrained its output to the schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,

    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    pub model: String,
    pub usage: Option<TokenUsage>,
    pub stop_reason: Option<StopReason>,
}

impl Completion {
    pub fn requests_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Folds one round's usage into a query total.
    pub fn accumulate(&mut self, other: &Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
}

/// Incremental piece of a streamed reply. The last chunk has `done` set and
/// carries usage plus any tool calls.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
    pub usage: Option<TokenUsage>,

    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default)]
    pub stop_reason: Option<StopReason>,
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// What a backend reports about itself on `/health`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub version: Option<String>,
    pub model: String,
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_structured_output: bool,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn info(&self) -> Result<ProviderInfo>;

    /// `Ok(false)` when reachable but not serving; errors are for misuse.
    async fn health_check(&self) -> Result<bool>;

    async fn complete(&self, request: &ModelRequest) -> Result<Completion>;

    /// Chunks end with one whose `done` flag is set.
    async fn complete_stream(&self, request: &ModelRequest) -> Result<CompletionStream>;

    /// When false the orchestrator describes tools in the system prompt and
    /// parses fenced calls out of the reply text.
    fn supports_native_tools(&self) -> bool {
        true
    }

    fn estimate_tokens(&self, text: &str) -> u32 {
        u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
    }
}
