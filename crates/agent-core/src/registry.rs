//! Tool Server Registry
//!
//! Resolves the configured endpoints into per-query connections and
//! aggregates their capabilities under namespaced keys.
//!
//! [`ToolScope`] is the scope guard for one query: every connection it holds
//! is closed exactly once, in reverse order, either by [`ToolScope::close`]
//! or, if the query was cancelled or errored out first, on drop.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::{ToolConnector, ToolEndpoint, ToolServerConnection};
use crate::error::{AgentError, Result};
use crate::tool::{ToolCall, ToolCapability, ToolKey, ToolSpec};

/// Registry configuration
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Deadline for connect + discovery of one server
    pub open_timeout: Duration,

    /// Deadline for a single tool invocation
    pub call_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(15),
        }
    }
}

/// The configured set of tool servers
pub struct ToolServerRegistry {
    endpoints: Vec<ToolEndpoint>,
    connector: Arc<dyn ToolConnector>,
    config: RegistryConfig,
}

impl ToolServerRegistry {
    pub fn new(
        endpoints: Vec<ToolEndpoint>,
        connector: Arc<dyn ToolConnector>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            endpoints,
            connector,
            config,
        }
    }

    pub fn endpoints(&self) -> &[ToolEndpoint] {
        &self.endpoints
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Open every endpoint concurrently and aggregate what came up.
    ///
    /// Never fails: unreachable servers are recorded in the scope as
    /// unavailable and the remaining ones are used.
    pub async fn open_all(&self) -> ToolScope {
        let mut connections: Vec<ToolServerConnection> = self
            .endpoints
            .iter()
            .cloned()
            .map(|endpoint| ToolServerConnection::from_connector(endpoint, &self.connector))
            .collect();

        let open_timeout = self.config.open_timeout;
        let outcomes = join_all(
            connections
                .iter_mut()
                .map(|conn| tokio::time::timeout(open_timeout, conn.open())),
        )
        .await;

        let mut unavailable = Vec::new();
        for (conn, outcome) in connections.iter_mut().zip(outcomes) {
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => {
                    let reason = format!("open timed out after {}ms", open_timeout.as_millis());
                    conn.fail(reason.clone()).await;
                    reason
                }
            };
            tracing::warn!(server = %conn.endpoint().id, %reason, "Tool server unavailable");
            unavailable.push(UnavailableServer {
                id: conn.endpoint().id.clone(),
                required: conn.endpoint().required,
                reason,
            });
        }

        ToolScope::new(connections, unavailable, self.config.call_timeout)
    }
}

/// A server that could not be opened for this query
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnavailableServer {
    pub id: String,
    pub required: bool,
    pub reason: String,
}

/// A capability resolved to its owning connection
#[derive(Clone, Debug)]
pub struct ResolvedTool {
    pub key: ToolKey,
    pub capability: ToolCapability,
    connection: usize,
}

/// Open connections and their capabilities for the lifetime of one query
pub struct ToolScope {
    connections: Vec<ToolServerConnection>,
    tools: BTreeMap<String, ResolvedTool>,
    bare_names: HashMap<String, Vec<String>>,
    unavailable: Vec<UnavailableServer>,
    call_timeout: Duration,
    closed: bool,
}

impl ToolScope {
    fn new(
        connections: Vec<ToolServerConnection>,
        unavailable: Vec<UnavailableServer>,
        call_timeout: Duration,
    ) -> Self {
        let mut tools = BTreeMap::new();
        let mut bare_names: HashMap<String, Vec<String>> = HashMap::new();

        for (idx, conn) in connections.iter().enumerate() {
            for capability in conn.capabilities() {
                let key = ToolKey::new(&conn.endpoint().id, &capability.name);
                let namespaced = key.to_string();
                bare_names
                    .entry(capability.name.clone())
                    .or_default()
                    .push(namespaced.clone());
                tools.insert(
                    namespaced,
                    ResolvedTool {
                        key,
                        capability: capability.clone(),
                        connection: idx,
                    },
                );
            }
        }

        Self {
            connections,
            tools,
            bare_names,
            unavailable,
            call_timeout,
            closed: false,
        }
    }

    /// A scope with no servers
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), RegistryConfig::default().call_timeout)
    }

    pub fn tools(&self) -> impl Iterator<Item = &ResolvedTool> {
        self.tools.values()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn unavailable(&self) -> &[UnavailableServer] {
        &self.unavailable
    }

    pub fn open_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_open()).count()
    }

    /// Tool definitions for the model backend, sorted by key
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|t| ToolSpec::from_capability(&t.key, &t.capability))
            .collect()
    }

    /// Caller-facing notes about reduced capability
    pub fn warnings(&self) -> Vec<String> {
        self.unavailable
            .iter()
            .map(|s| {
                let kind = if s.required { "required tool server" } else { "tool server" };
                format!(
                    "{} '{}' unavailable ({}); answering with reduced capability",
                    kind, s.id, s.reason
                )
            })
            .collect()
    }

    /// Fatal only when every configured server is required and none came up
    pub fn ensure_usable(&self) -> Result<()> {
        let configured = self.connections.len();
        if configured > 0
            && self.unavailable.len() == configured
            && self.unavailable.iter().all(|s| s.required)
        {
            let names: Vec<&str> = self.unavailable.iter().map(|s| s.id.as_str()).collect();
            return Err(AgentError::ToolUnavailable {
                server: names.join(","),
                reason: "all required tool servers are unavailable".into(),
            });
        }
        Ok(())
    }

    /// Look up a namespaced key, or a bare name offered by exactly one server
    pub fn resolve(&self, name: &str) -> Result<&ResolvedTool> {
        if let Some(tool) = self.tools.get(name) {
            return Ok(tool);
        }
        match self.bare_names.get(name).map(Vec::as_slice) {
            Some([only]) => self
                .tools
                .get(only)
                .ok_or_else(|| AgentError::ToolNotFound(name.to_string())),
            Some(many) if many.len() > 1 => Err(AgentError::ToolNotFound(format!(
                "'{}' is ambiguous, use one of: {}",
                name,
                many.join(", ")
            ))),
            _ => Err(AgentError::ToolNotFound(name.to_string())),
        }
    }

    /// Invoke one call within the per-call deadline
    pub async fn invoke(&self, call: &ToolCall) -> Result<serde_json::Value> {
        let tool = self.resolve(&call.name)?;
        tool.capability.check_arguments(call)?;

        let conn = &self.connections[tool.connection];
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.call_timeout,
            conn.invoke(&tool.key.tool, call.arguments_value()),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                tracing::debug!(tool = %tool.key, elapsed_ms, ok = result.is_ok(), "Tool call finished");
                result
            }
            Err(_) => {
                tracing::warn!(tool = %tool.key, elapsed_ms, "Tool call timed out");
                Err(AgentError::ToolTimeout {
                    tool: tool.key.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Close every open connection in reverse order
    pub async fn close(mut self) -> CloseReport {
        self.closed = true;
        close_in_reverse(std::mem::take(&mut self.connections)).await
    }
}

/// Outcome of closing a scope
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Connections that were open and are now closed
    pub closed: usize,
    /// Server ids whose disconnect reported an error
    pub failed: Vec<String>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

async fn close_in_reverse(mut connections: Vec<ToolServerConnection>) -> CloseReport {
    let mut report = CloseReport::default();
    while let Some(mut conn) = connections.pop() {
        match conn.close().await {
            Ok(true) => report.closed += 1,
            Ok(false) => {}
            Err(e) => {
                let server = conn.endpoint().id.clone();
                tracing::warn!(server = %server, error = %e, "Tool server disconnect failed");
                report.closed += 1;
                report.failed.push(server);
            }
        }
    }
    report
}

impl Drop for ToolScope {
    fn drop(&mut self) {
        if self.closed || self.connections.iter().all(|c| !c.is_open()) {
            return;
        }
        let connections = std::mem::take(&mut self.connections);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(open = connections.len(), "Tool scope dropped, closing in background");
                handle.spawn(async move {
                    close_in_reverse(connections).await;
                });
            }
            Err(_) => tracing::warn!("Tool scope dropped outside a runtime, connections not closed"),
        }
    }
}
