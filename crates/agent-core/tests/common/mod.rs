//! Shared fakes for orchestrator tests: a scripted model backend, an
//! in-memory tool server connector and a store that fails on demand.

#![allow(dead_code)]

use agent_core::connection::{ToolConnector, ToolEndpoint, ToolTransport};
use agent_core::provider::{
    Completion, CompletionStream, LlmProvider, ModelRequest, ProviderInfo, StopReason, StreamChunk,
    TokenUsage,
};
use agent_core::session::{Session, SessionId, SessionSummary};
use agent_core::store::{MemorySessionStore, SessionMutator, SessionSeed, SessionStore};
use agent_core::tool::{ToolCall, ToolCapability};
use agent_core::{AgentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted backend reply
#[derive(Clone, Debug)]
pub enum Reply {
    Text(String),
    Calls(Vec<ToolCall>),
    Fail(String),
    Hang,
}

pub fn text(s: &str) -> Reply {
    Reply::Text(s.to_string())
}

pub fn call(name: &str, args: Value) -> ToolCall {
    let arguments: HashMap<String, Value> = serde_json::from_value(args).unwrap_or_default();
    ToolCall::new(name, arguments)
}

pub const STRUCTURED_ANSWER: &str = r#"{"summary": "Light rain in Nairobi", "classification": "weather",
"locations": [{"name": "Nairobi", "latitude": -1.29, "longitude": 36.82, "confidence": 0.9}],
"confidence": 0.8}"#;

/// Model backend that replays a script; an exhausted script answers "ok"
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ModelRequest>>,
    native_tools: bool,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            native_tools: true,
        })
    }

    pub fn prompt_only(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            native_tools: false,
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: &ModelRequest) -> Reply {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text("ok"))
    }

    fn completion(reply: Reply) -> Result<Completion> {
        let usage = Some(TokenUsage::new(50, 10));
        match reply {
            Reply::Text(content) => Ok(Completion {
                content,
                model: "scripted".into(),
                usage,
                stop_reason: Some(StopReason::Stop),
                ..Default::default()
            }),
            Reply::Calls(tool_calls) => Ok(Completion {
                tool_calls,
                model: "scripted".into(),
                usage,
                stop_reason: Some(StopReason::ToolUse),
                ..Default::default()
            }),
            Reply::Fail(msg) => Err(AgentError::ModelBackend(msg)),
            Reply::Hang => unreachable!("hang is handled by the caller"),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: "Scripted".into(),
            version: None,
            model: "scripted".into(),
            supports_streaming: true,
            supports_tools: self.native_tools,
            supports_structured_output: false,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(&self, request: &ModelRequest) -> Result<Completion> {
        match self.next(request) {
            Reply::Hang => futures::future::pending().await,
            reply => Self::completion(reply),
        }
    }

    async fn complete_stream(&self, request: &ModelRequest) -> Result<CompletionStream> {
        let completion = match self.next(request) {
            Reply::Hang => futures::future::pending().await,
            reply => Self::completion(reply)?,
        };

        let mut chunks: Vec<Result<StreamChunk>> = completion
            .content
            .split_inclusive(' ')
            .map(|piece| {
                Ok(StreamChunk {
                    delta: piece.to_string(),
                    ..Default::default()
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk {
            done: true,
            usage: completion.usage,
            tool_calls: completion.tool_calls,
            stop_reason: completion.stop_reason,
            ..Default::default()
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }
}

/// Behaviour of one fake tool
#[derive(Clone, Debug)]
pub enum ToolBehavior {
    Answer(Value),
    Slow(Duration),
    Error(String),
}

#[derive(Clone, Debug)]
pub struct FakeServer {
    pub down: bool,
    pub fail_close: bool,
    pub tools: Vec<(String, ToolBehavior)>,
}

impl FakeServer {
    pub fn up(tools: &[(&str, ToolBehavior)]) -> Self {
        Self {
            down: false,
            fail_close: false,
            tools: tools
                .iter()
                .map(|(name, b)| (name.to_string(), b.clone()))
                .collect(),
        }
    }

    pub fn down() -> Self {
        Self {
            down: true,
            fail_close: false,
            tools: Vec::new(),
        }
    }

    /// Disconnect reports an error after tearing down
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

/// Connection lifecycle counters shared by every transport a connector makes
#[derive(Debug, Default)]
pub struct Lifecycle {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub close_order: Mutex<Vec<String>>,
}

impl Lifecycle {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for background closes (drop path) to land
    pub async fn settle(&self) {
        for _ in 0..100 {
            if self.closed() >= self.opened() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub struct FakeConnector {
    servers: HashMap<String, FakeServer>,
    pub lifecycle: Arc<Lifecycle>,
}

impl FakeConnector {
    pub fn new(servers: Vec<(&str, FakeServer)>) -> Arc<Self> {
        Arc::new(Self {
            servers: servers
                .into_iter()
                .map(|(id, s)| (id.to_string(), s))
                .collect(),
            lifecycle: Arc::new(Lifecycle::default()),
        })
    }
}

impl ToolConnector for FakeConnector {
    fn transport(&self, endpoint: &ToolEndpoint) -> Box<dyn ToolTransport> {
        Box::new(FakeTransport {
            id: endpoint.id.clone(),
            server: self.servers.get(&endpoint.id).cloned().unwrap_or_else(FakeServer::down),
            lifecycle: Arc::clone(&self.lifecycle),
            connected: false,
        })
    }
}

struct FakeTransport {
    id: String,
    server: FakeServer,
    lifecycle: Arc<Lifecycle>,
    connected: bool,
}

#[async_trait]
impl ToolTransport for FakeTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.server.down {
            return Err(AgentError::ToolUnavailable {
                server: self.id.clone(),
                reason: "connection refused".into(),
            });
        }
        self.connected = true;
        self.lifecycle.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discover(&mut self) -> Result<Vec<ToolCapability>> {
        Ok(self
            .server
            .tools
            .iter()
            .map(|(name, _)| {
                ToolCapability::new(
                    name.clone(),
                    format!("{name} tool"),
                    json!({"type": "object", "properties": {"city": {"type": "string"}}}),
                )
            })
            .collect())
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value> {
        let behavior = self
            .server
            .tools
            .iter()
            .find(|(name, _)| name == tool)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| AgentError::ToolNotFound(tool.to_string()))?;
        match behavior {
            ToolBehavior::Answer(value) => Ok(json!({"result": value, "echo": arguments})),
            ToolBehavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(json!({"result": "late"}))
            }
            ToolBehavior::Error(message) => Err(AgentError::ToolExecution {
                tool: tool.to_string(),
                code: Some("UPSTREAM".into()),
                message,
            }),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.lifecycle.closed.fetch_add(1, Ordering::SeqCst);
            self.lifecycle.close_order.lock().unwrap().push(self.id.clone());
        }
        if self.server.fail_close {
            return Err(AgentError::ToolUnavailable {
                server: self.id.clone(),
                reason: "broken pipe on shutdown".into(),
            });
        }
        Ok(())
    }
}

/// Memory store that returns infrastructure faults while `failures` > 0
pub struct FlakyStore {
    inner: MemorySessionStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySessionStore::default(),
            failures: AtomicUsize::new(failures),
        })
    }

    fn trip(&self) -> Result<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(AgentError::SessionStore("disk unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn get(&self, id: &SessionId) -> Result<Session> {
        self.trip()?;
        self.inner.get(id).await
    }

    async fn create(&self, seed: SessionSeed) -> Result<Session> {
        self.trip()?;
        self.inner.create(seed).await
    }

    async fn create_with_id(&self, id: SessionId, seed: SessionSeed) -> Result<Session> {
        self.trip()?;
        self.inner.create_with_id(id, seed).await
    }

    async fn update(&self, id: &SessionId, mutator: SessionMutator) -> Result<Session> {
        self.trip()?;
        self.inner.update(id, mutator).await
    }

    async fn delete(&self, id: &SessionId) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.sweep(now).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        self.inner.list(limit).await
    }
}
