//! Query Orchestrator
//!
//! Drives one query through its states:
//!
//! ```text
//! Init → SessionResolved → ToolsOpened → ModelInvoked → Validated → SessionPersisted → Done
//!   └──────────────┴──────────────┴─────────────┴─────────────┴──────────→ Failed(reason)
//! ```
//!
//! The tool scope is closed and the trace finished on every exit path,
//! including timeout. If the caller drops the query future instead, the
//! scope guard and trace close themselves on drop.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::error::{AgentError, FailureReason, Result};
use crate::message::{Message, MessageMetadata};
use crate::provider::{Completion, GenerationOptions, LlmProvider, ModelRequest, TokenUsage};
use crate::registry::{ToolScope, ToolServerRegistry};
use crate::session::{Session, SessionId, SessionMetadata, SessionSummary};
use crate::store::{MemorySessionStore, SessionSeed, SessionStore};
use crate::structured::{OutputSchema, StructuredResult, ToolOutputRef};
use crate::telemetry::{QueryTrace, SpanStatus, TelemetryEmitter};
use crate::tool::{generate_prompt_section, parse_tool_call, ToolCall, ToolResult, ToolSpec};
use crate::validator::{StructuredResponseValidator, ValidationTier};
use crate::window::ConversationWindow;

const TOOL_BUDGET_SPENT: &str =
    "No more tool calls are available for this question. Answer now from the tool results above.";

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a weather and agriculture assistant.

Use the available tools to look up forecasts, soil and crop conditions for the
places the user asks about. Resolve place names to coordinates before calling
location-based tools. If a tool fails, say what you could not check.
Be concise and accurate."#;

/// Orchestrator configuration
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Instruction message stored at the start of new sessions
    pub system_prompt: String,

    /// Identifier of the prompt above, recorded on each session
    pub prompt_variant: String,

    /// History bound applied before every model call
    pub window: ConversationWindow,

    /// Tool-call rounds allowed per query; the model then answers once more without tools
    pub max_tool_rounds: usize,

    /// Deadline for the whole query, model latency included
    pub query_timeout: Duration,

    /// Validate the final answer into a [`StructuredResult`]
    pub structured_output: bool,

    /// Generation options
    pub generation: GenerationOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            prompt_variant: "default".into(),
            window: ConversationWindow::default(),
            max_tool_rounds: 4,
            query_timeout: Duration::from_secs(120),
            structured_output: true,
            generation: GenerationOptions::default(),
        }
    }
}

/// Inbound query
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub create_session: bool,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn create_session(mut self) -> Self {
        self.create_session = true;
        self
    }
}

/// Result of a successful query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub response: String,
    pub session_id: String,
    pub session_new: bool,
    pub conversation_turn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Incremental progress of a streaming query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Delta { text: String },
    ToolCall { tool: String, call_id: String },
    ToolResult { tool: String, call_id: String, ok: bool },
}

/// Query lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryState {
    Init,
    SessionResolved,
    ToolsOpened,
    ModelInvoked,
    Validated,
    SessionPersisted,
    Done,
    Failed(FailureReason),
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryState::Init => write!(f, "init"),
            QueryState::SessionResolved => write!(f, "session_resolved"),
            QueryState::ToolsOpened => write!(f, "tools_opened"),
            QueryState::ModelInvoked => write!(f, "model_invoked"),
            QueryState::Validated => write!(f, "validated"),
            QueryState::SessionPersisted => write!(f, "session_persisted"),
            QueryState::Done => write!(f, "done"),
            QueryState::Failed(reason) => write!(f, "failed({})", reason),
        }
    }
}

/// Per-query mutable context
struct QueryRun<'a> {
    trace: &'a mut QueryTrace,
    events: Option<&'a mpsc::Sender<QueryEvent>>,
    state: QueryState,
    warnings: Vec<String>,
    usage: TokenUsage,
    tool_outputs: Vec<ToolOutputRef>,
    /// Session this query created; removed again if the query fails
    created: Option<SessionId>,
}

impl QueryRun<'_> {
    fn advance(&mut self, next: QueryState) {
        tracing::debug!(from = %self.state, to = %next, "Query state");
        self.state = next;
    }

    async fn send(&self, event: QueryEvent) -> Result<()> {
        match self.events {
            Some(tx) => tx.send(event).await.map_err(|_| receiver_closed()),
            None => Ok(()),
        }
    }

    /// Race `fut` against the streaming receiver going away. Single-shot
    /// queries never cancel here.
    async fn or_cancelled<F: Future>(&self, fut: F) -> Result<F::Output> {
        let Some(tx) = self.events else {
            return Ok(fut.await);
        };
        tokio::select! {
            biased;
            () = tx.closed() => Err(receiver_closed()),
            out = fut => Ok(out),
        }
    }
}

fn receiver_closed() -> AgentError {
    AgentError::Cancelled("stream receiver closed".into())
}

/// Composes the session store, tool registry, model backend, validator and
/// telemetry into the per-query state machine
pub struct QueryOrchestrator {
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn SessionStore>,
    registry: Option<Arc<ToolServerRegistry>>,
    validator: StructuredResponseValidator,
    telemetry: TelemetryEmitter,
    schema: OutputSchema,
    config: OrchestratorConfig,
}

impl QueryOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn telemetry(&self) -> &TelemetryEmitter {
        &self.telemetry
    }

    /// Single-shot query
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.run(request, None).await
    }

    /// Streaming query: text deltas and tool activity go to `events` while
    /// the query runs. A closed receiver cancels the query.
    pub async fn query_streaming(
        &self,
        request: QueryRequest,
        events: mpsc::Sender<QueryEvent>,
    ) -> Result<QueryResponse> {
        self.run(request, Some(&events)).await
    }

    /// Summary of a live session
    pub async fn session(&self, id: &str) -> Result<SessionSummary> {
        Ok(self.store.get(&SessionId::from_string(id)).await?.summary())
    }

    async fn run(
        &self,
        request: QueryRequest,
        events: Option<&mpsc::Sender<QueryEvent>>,
    ) -> Result<QueryResponse> {
        let mut trace = self.telemetry.begin_query("query");
        let trace_id = trace.trace_id().to_string();
        let span = tracing::info_span!("query", trace_id = %trace_id);

        let mut scope: Option<ToolScope> = None;
        let timeout_ms = self.config.query_timeout.as_millis() as u64;

        let outcome = {
            let mut run = QueryRun {
                trace: &mut trace,
                events,
                state: QueryState::Init,
                warnings: Vec::new(),
                usage: TokenUsage::default(),
                tool_outputs: Vec::new(),
                created: None,
            };
            let drive = self.drive(&request, &mut run, &mut scope).instrument(span.clone());
            let outcome = match tokio::time::timeout(self.config.query_timeout, drive).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::QueryTimeout { timeout_ms }),
            };
            // Tokens spent count whether or not the query succeeded
            run.trace.record_usage(&run.usage);
            if outcome.is_err() {
                if let Some(id) = run.created.take() {
                    self.discard_session(&id).await;
                }
            }
            outcome
        };

        // Always close the scope, whichever state the query ended in
        if let Some(scope) = scope.take() {
            let mut close_span = trace.begin("tool_close");
            let report = scope.close().await;
            close_span.attr("closed", report.closed);
            let status = if report.is_clean() {
                SpanStatus::Ok
            } else {
                close_span.attr("failed", report.failed.clone());
                SpanStatus::Error(format!("disconnect failed: {}", report.failed.join(", ")))
            };
            trace.end(close_span, status);
        }

        let _entered = span.enter();
        match outcome {
            Ok(mut response) => {
                tracing::info!(
                    session_id = %response.session_id,
                    turn = response.conversation_turn,
                    warnings = response.warnings.len(),
                    "Query done"
                );
                trace.attr("session_id", response.session_id.clone());
                response.trace_ref = Some(trace.finish(SpanStatus::Ok));
                Ok(response)
            }
            Err(e) => {
                let reason = e.failure_reason();
                tracing::warn!(state = %QueryState::Failed(reason), error = %e, "Query failed");
                trace.attr("failure_reason", reason.as_str());
                trace.finish(SpanStatus::Error(reason.to_string()));
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        request: &QueryRequest,
        run: &mut QueryRun<'_>,
        scope_slot: &mut Option<ToolScope>,
    ) -> Result<QueryResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(AgentError::InvalidQuery("query is empty".into()));
        }

        // Init -> SessionResolved
        let mut lookup = run.trace.begin("session_lookup");
        let resolved = self.resolve_session(request).await;
        let (session, session_new) = match resolved {
            Ok(found) => {
                lookup.attr("session_new", found.1);
                run.trace.end(lookup, SpanStatus::Ok);
                found
            }
            Err(e) => {
                run.trace.end(lookup, SpanStatus::Error(e.failure_reason().to_string()));
                return Err(e);
            }
        };
        tracing::debug!(session_id = %session.id, session_new, "Session resolved");
        if session_new {
            run.created = Some(session.id.clone());
        }
        run.advance(QueryState::SessionResolved);

        // SessionResolved -> ToolsOpened
        let mut discovery = run.trace.begin("tool_discovery");
        let opened = match &self.registry {
            Some(registry) => registry.open_all().await,
            None => ToolScope::empty(),
        };
        discovery.attr("tools", opened.tool_count());
        discovery.attr("unavailable", opened.unavailable().len());
        run.warnings.extend(opened.warnings());
        let scope: &ToolScope = scope_slot.insert(opened);
        if let Err(e) = scope.ensure_usable() {
            run.trace.end(discovery, SpanStatus::Error(e.failure_reason().to_string()));
            return Err(e);
        }
        run.trace.end(discovery, SpanStatus::Ok);
        run.advance(QueryState::ToolsOpened);

        // ToolsOpened -> ModelInvoked
        let native_tools = self.provider.supports_native_tools();
        let specs = scope.specs();
        let base = self.build_messages(&session, &specs, native_tools);
        let mut turn = vec![Message::user(query)];
        let completion = self
            .tool_loop(scope, run, &base, &mut turn, specs, native_tools)
            .await?;
        run.advance(QueryState::ModelInvoked);

        // ModelInvoked -> Validated
        let (response_text, structured) = if self.config.structured_output {
            let mut validation = run.trace.begin("validation");
            let validated = match &completion.structured {
                Some(value) => self.validator.validate_value(value, &completion.content, &self.schema),
                None => self.validator.validate(&completion.content, &self.schema),
            };
            validation.attr("tier", format!("{:?}", validated.tier).to_lowercase());
            run.trace.end(validation, SpanStatus::Ok);

            let mut result = validated.result;
            if validated.tier != ValidationTier::Primary {
                run.warnings.extend(result.warnings.iter().cloned());
            }
            let text = if validated.tier == ValidationTier::Primary && looks_like_json(&completion) {
                result.summary.clone()
            } else {
                completion.content.clone()
            };
            result.tool_outputs = std::mem::take(&mut run.tool_outputs);
            for warning in &run.warnings {
                if !result.warnings.contains(warning) {
                    result.warnings.push(warning.clone());
                }
            }
            (text, Some(result))
        } else {
            (completion.content.clone(), None)
        };
        run.advance(QueryState::Validated);

        // Validated -> SessionPersisted
        let mut answer = Message::assistant(response_text.clone());
        answer.metadata = Some(MessageMetadata {
            model: Some(completion.model.clone()),
            tokens: completion.usage.map(|u| u.completion_tokens),
            ..Default::default()
        });
        turn.push(answer);

        let mut persist = run.trace.begin("session_persist");
        let model = completion.model.clone();
        let persisted = self
            .with_store_retry("update", || {
                let messages = turn.clone();
                let model = model.clone();
                self.store.update(
                    &session.id,
                    Box::new(move |s| {
                        s.metadata.model = Some(model);
                        s.record_turn(messages);
                    }),
                )
            })
            .await;
        let session = match persisted {
            Ok(session) => {
                persist.attr("turn", session.turn_count);
                run.trace.end(persist, SpanStatus::Ok);
                session
            }
            Err(e) => {
                run.trace.end(persist, SpanStatus::Error(e.failure_reason().to_string()));
                return Err(e);
            }
        };
        run.created = None;
        run.advance(QueryState::SessionPersisted);
        run.advance(QueryState::Done);
        Ok(QueryResponse {
            response: response_text,
            session_id: session.id.to_string(),
            session_new,
            conversation_turn: session.turn_count,
            structured,
            trace_ref: None,
            warnings: std::mem::take(&mut run.warnings),
            usage: Some(run.usage),
        })
    }

    /// Drop a session whose first turn never landed
    async fn discard_session(&self, id: &SessionId) {
        match self.store.delete(id).await {
            Ok(_) => tracing::debug!(session_id = %id, "Discarded empty session"),
            Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to discard empty session"),
        }
    }

    /// Look up, adopt, or create the session for this request
    ///
    /// - no id: create
    /// - id, `create_session`: adopt the id if unused, otherwise a fresh id
    /// - id only: must exist
    async fn resolve_session(&self, request: &QueryRequest) -> Result<(Session, bool)> {
        let seed = SessionSeed {
            system_prompt: Some(self.config.system_prompt.clone()),
            metadata: SessionMetadata {
                prompt_variant: Some(self.config.prompt_variant.clone()),
                model: Some(self.config.generation.model.clone()),
                ..Default::default()
            },
        };

        match (&request.session_id, request.create_session) {
            (Some(id), false) => {
                let id = SessionId::from_string(id);
                let session = self.with_store_retry("get", || self.store.get(&id)).await?;
                Ok((session, false))
            }
            (Some(id), true) => {
                let id = SessionId::from_string(id);
                let adopted = self
                    .with_store_retry("create", || self.store.create_with_id(id.clone(), seed.clone()))
                    .await;
                match adopted {
                    Ok(session) => Ok((session, true)),
                    Err(AgentError::SessionExists(_) | AgentError::SessionNotFound(_)) => {
                        tracing::debug!(requested = %id, "Requested session id unusable, generating one");
                        let session = self
                            .with_store_retry("create", || self.store.create(seed.clone()))
                            .await?;
                        Ok((session, true))
                    }
                    Err(e) => Err(e),
                }
            }
            (None, _) => {
                let session = self
                    .with_store_retry("create", || self.store.create(seed.clone()))
                    .await?;
                Ok((session, true))
            }
        }
    }

    /// Run a store operation, retrying once on an infrastructure fault
    async fn with_store_retry<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match f().await {
            Err(e) if e.is_store_fault() => {
                tracing::warn!(op, error = %e, "Session store fault, retrying once");
                f().await
            }
            other => other,
        }
    }

    /// Windowed history, with the tool catalogue folded into the system
    /// message for backends without native tool calling
    fn build_messages(&self, session: &Session, specs: &[ToolSpec], native_tools: bool) -> Vec<Message> {
        let mut messages = self.config.window.window(session);
        if !native_tools && !specs.is_empty() {
            let catalogue = generate_prompt_section(specs);
            match messages.first_mut().filter(|m| m.role == crate::message::Role::System) {
                Some(system) => {
                    system.content.push_str("\n\n");
                    system.content.push_str(&catalogue);
                }
                None => messages.insert(0, Message::system(catalogue)),
            }
        }
        messages
    }

    async fn tool_loop(
        &self,
        scope: &ToolScope,
        run: &mut QueryRun<'_>,
        base: &[Message],
        turn: &mut Vec<Message>,
        specs: Vec<ToolSpec>,
        native_tools: bool,
    ) -> Result<Completion> {
        let offer_tools = !specs.is_empty();
        let tools = if native_tools { specs } else { Vec::new() };
        let output_schema = self.config.structured_output.then(|| self.schema.clone());
        let mut rounds = 0;

        loop {
            let request = ModelRequest {
                messages: base.iter().chain(turn.iter()).cloned().collect(),
                tools: tools.clone(),
                output_schema: output_schema.clone(),
                options: self.config.generation.clone(),
            };
            let completion = self.invoke_model(&request, run).await?;

            let mut calls = completion.tool_calls.clone();
            if !completion.requests_tools() && offer_tools && !native_tools {
                calls.extend(parse_tool_call(&completion.content));
            }
            if calls.is_empty() || !offer_tools {
                return Ok(completion);
            }
            if rounds >= self.config.max_tool_rounds {
                run.warnings.push(format!(
                    "tool call limit of {} rounds reached; answered without further tools",
                    self.config.max_tool_rounds
                ));
                let mut messages = request.messages;
                messages.push(Message::system(TOOL_BUDGET_SPENT));
                let last = ModelRequest {
                    messages,
                    tools: Vec::new(),
                    output_schema,
                    options: self.config.generation.clone(),
                };
                return self.invoke_model(&last, run).await;
            }
            rounds += 1;

            for call in &mut calls {
                call.ensure_id();
            }
            turn.push(Message::assistant(completion.content.clone()).with_tool_calls(calls.clone()));
            for call in &calls {
                let result = self.execute_tool(scope, run, call).await?;
                turn.push(Message::tool_result(&result));
            }
        }
    }

    async fn invoke_model(&self, request: &ModelRequest, run: &mut QueryRun<'_>) -> Result<Completion> {
        let mut span = run.trace.begin("model_call");
        span.attr("messages", request.messages.len());
        span.attr("tools", request.tools.len());

        let outcome = if run.events.is_some() {
            self.stream_model(request, run).await
        } else {
            self.provider.complete(request).await
        };

        match outcome {
            Ok(completion) => {
                if let Some(usage) = &completion.usage {
                    span.attr("tokens_in", usage.prompt_tokens);
                    span.attr("tokens_out", usage.completion_tokens);
                    run.usage.accumulate(usage);
                }
                span.attr("tool_calls", completion.tool_calls.len());
                run.trace.end(span, SpanStatus::Ok);
                Ok(completion)
            }
            Err(e) => {
                run.trace.end(span, SpanStatus::Error(e.failure_reason().to_string()));
                Err(e)
            }
        }
    }

    /// Forward deltas, then assemble the completion from the terminal chunk
    async fn stream_model(&self, request: &ModelRequest, run: &mut QueryRun<'_>) -> Result<Completion> {
        let mut stream = run.or_cancelled(self.provider.complete_stream(request)).await??;
        let mut completion = Completion {
            model: request.options.model.clone(),
            ..Default::default()
        };

        while let Some(chunk) = run.or_cancelled(stream.next()).await? {
            let chunk = chunk?;
            if !chunk.delta.is_empty() {
                completion.content.push_str(&chunk.delta);
                run.send(QueryEvent::Delta { text: chunk.delta }).await?;
            }
            completion.tool_calls.extend(chunk.tool_calls);
            if chunk.done {
                completion.usage = chunk.usage;
                completion.stop_reason = chunk.stop_reason;
                return Ok(completion);
            }
        }

        Err(AgentError::ModelBackend("stream ended without a final chunk".into()))
    }

    /// Tool failures become failure results for the model; only a closed
    /// event stream aborts here, without waiting for the call to finish
    async fn execute_tool(&self, scope: &ToolScope, run: &mut QueryRun<'_>, call: &ToolCall) -> Result<ToolResult> {
        let call_id = call.id.clone().unwrap_or_default();
        let tool_name = scope
            .resolve(&call.name)
            .map_or_else(|_| call.name.clone(), |t| t.key.to_string());

        run.send(QueryEvent::ToolCall {
            tool: tool_name.clone(),
            call_id: call_id.clone(),
        })
        .await?;

        let mut span = run.trace.begin("tool_call");
        span.attr("tool", tool_name.clone());
        let started = std::time::Instant::now();
        let outcome = match run.or_cancelled(scope.invoke(call)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                run.trace.end(span, SpanStatus::Cancelled);
                return Err(e);
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        span.attr("elapsed_ms", elapsed_ms);

        let result = match outcome {
            Ok(value) => {
                run.trace.end(span, SpanStatus::Ok);
                let output = match &value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                ToolResult::success(&tool_name, output).with_data(value)
            }
            Err(e) => {
                tracing::warn!(tool = %tool_name, error = %e, "Tool call failed");
                run.trace.end(span, SpanStatus::Error(e.failure_reason().to_string()));
                match &e {
                    AgentError::ToolTimeout { .. } => run
                        .warnings
                        .push(format!("{}; continuing without its result", e)),
                    AgentError::ToolUnavailable { .. } => run.warnings.push(e.to_string()),
                    _ => {}
                }
                ToolResult::failure(&tool_name, format!("Error: {}", e))
            }
        }
        .with_id(call_id.clone())
        .with_elapsed(elapsed_ms);

        run.tool_outputs.push(ToolOutputRef {
            tool: tool_name.clone(),
            call_id: Some(call_id.clone()),
            ok: result.success,
        });
        run.send(QueryEvent::ToolResult {
            tool: tool_name,
            call_id,
            ok: result.success,
        })
        .await?;

        Ok(result)
    }
}

fn looks_like_json(completion: &Completion) -> bool {
    let text = completion.content.trim_start();
    completion.structured.is_some() || text.starts_with('{') || text.starts_with("```")
}

/// Builder for [`QueryOrchestrator`]
pub struct OrchestratorBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    store: Option<Arc<dyn SessionStore>>,
    registry: Option<Arc<ToolServerRegistry>>,
    telemetry: TelemetryEmitter,
    schema: OutputSchema,
    config: OrchestratorConfig,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            store: None,
            registry: None,
            telemetry: TelemetryEmitter::disabled(),
            schema: OutputSchema::default(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<ToolServerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn telemetry(mut self, telemetry: TelemetryEmitter) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn output_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub fn window(mut self, window: ConversationWindow) -> Self {
        self.config.window = window;
        self
    }

    pub fn max_tool_rounds(mut self, max: usize) -> Self {
        self.config.max_tool_rounds = max;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.query_timeout = timeout;
        self
    }

    pub fn structured_output(mut self, enabled: bool) -> Self {
        self.config.structured_output = enabled;
        self
    }

    pub fn build(self) -> Result<QueryOrchestrator> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::default()));

        Ok(QueryOrchestrator {
            provider,
            store,
            registry: self.registry,
            validator: StructuredResponseValidator::new()?,
            telemetry: self.telemetry,
            schema: self.schema,
            config: self.config,
        })
    }
}
