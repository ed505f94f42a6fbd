//! HTTP transport for JSON-RPC tool servers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agent_core::{AgentError, Result, ToolCapability, ToolConnector, ToolEndpoint, ToolTransport};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::error::McpError;
use crate::types::{
    CallOutcome, JsonRpcRequest, JsonRpcResponse, ToolsListResult, PROTOCOL_VERSION, SESSION_HEADER,
};

/// Bound on `tools/list` pagination
const MAX_LIST_PAGES: usize = 16;

/// HTTP client settings shared by every tool server connection
#[derive(Clone, Debug)]
pub struct McpConfig {
    pub connect_timeout: Duration,

    /// Transport-level ceiling per request; the registry applies the
    /// tighter per-call deadline on top
    pub request_timeout: Duration,

    pub client_name: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            client_name: "mcp-agent".into(),
        }
    }
}

/// Creates [`HttpToolTransport`]s over one pooled HTTP client
#[derive(Clone, Debug)]
pub struct HttpConnector {
    client: reqwest::Client,
    config: McpConfig,
}

impl HttpConnector {
    pub fn new(config: McpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

impl ToolConnector for HttpConnector {
    fn transport(&self, endpoint: &ToolEndpoint) -> Box<dyn ToolTransport> {
        Box::new(HttpToolTransport::new(
            self.client.clone(),
            endpoint.clone(),
            self.config.client_name.clone(),
        ))
    }
}

/// One logical connection to a tool server
pub struct HttpToolTransport {
    client: reqwest::Client,
    endpoint: ToolEndpoint,
    client_name: String,
    session_id: Option<String>,
    next_id: AtomicU64,
}

impl HttpToolTransport {
    pub fn new(client: reqwest::Client, endpoint: ToolEndpoint, client_name: String) -> Self {
        Self {
            client,
            endpoint,
            client_name,
            session_id: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Session id issued by the server during `initialize`, if any
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn post(&self, body: &JsonRpcRequest) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(&self.endpoint.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        match &self.session_id {
            Some(id) => request.header(SESSION_HEADER, id),
            None => request,
        }
    }

    /// One request/response exchange; returns the result and any session header
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<(Value, Option<String>), McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        tracing::debug!(server = %self.endpoint.id, method, id, "JSON-RPC request");

        let response = self.post(&request).send().await?;
        let status = response.status();
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response.text().await?;

        if !status.is_success() {
            return Err(McpError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let reply = parse_reply(&body, is_sse)?;
        if let Some(error) = reply.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        let result = reply
            .result
            .ok_or_else(|| McpError::Protocol(format!("'{}' response has neither result nor error", method)))?;
        Ok((result, session))
    }

    async fn notify(&self, method: &str) {
        let outcome = self.post(&JsonRpcRequest::notification(method)).send().await;
        if let Err(e) = outcome {
            tracing::debug!(server = %self.endpoint.id, method, error = %e, "Notification not delivered");
        }
    }

    async fn list_tools(&self) -> std::result::Result<Vec<ToolCapability>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let (result, _) = self.call("tools/list", params).await?;
            let page: ToolsListResult = serde_json::from_value(result)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(server = %self.endpoint.id, pages = MAX_LIST_PAGES, "tools/list pagination truncated");
        Ok(tools)
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn connect(&mut self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": self.client_name, "version": env!("CARGO_PKG_VERSION") },
        });

        match self.call("initialize", Some(params)).await {
            Ok((_, session)) => {
                self.session_id = session;
                self.notify("notifications/initialized").await;
            }
            // Plain JSON-RPC tool servers skip the handshake
            Err(e) if e.is_method_not_found() => {
                tracing::debug!(server = %self.endpoint.id, "Server has no initialize method");
            }
            Err(e) => return Err(e.into_unavailable(&self.endpoint.id)),
        }

        tracing::debug!(
            server = %self.endpoint.id,
            session = self.session_id.as_deref().unwrap_or("-"),
            "Tool server handshake done"
        );
        Ok(())
    }

    async fn discover(&mut self) -> Result<Vec<ToolCapability>> {
        self.list_tools()
            .await
            .map_err(|e| e.into_unavailable(&self.endpoint.id))
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value> {
        let params = json!({ "name": tool, "arguments": arguments });
        let (result, _) = self
            .call("tools/call", Some(params))
            .await
            .map_err(|e| e.into_call_error(&self.endpoint.id, tool))?;

        match CallOutcome::from_result(result) {
            CallOutcome::Output(value) => Ok(value),
            CallOutcome::Failed { code, message } => Err(AgentError::ToolExecution {
                tool: tool.to_string(),
                code,
                message,
            }),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(session) = self.session_id.take() else {
            return Ok(());
        };
        let outcome = self
            .client
            .delete(&self.endpoint.url)
            .header(SESSION_HEADER, &session)
            .send()
            .await;
        if let Err(e) = outcome {
            tracing::debug!(server = %self.endpoint.id, error = %e, "Session teardown failed");
        }
        Ok(())
    }
}

/// Plain JSON body, or the last JSON `data:` line of an event stream
fn parse_reply(body: &str, is_sse: bool) -> std::result::Result<JsonRpcResponse, McpError> {
    if !is_sse {
        return Ok(serde_json::from_str(body)?);
    }
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
        .filter(|reply| reply.result.is_some() || reply.error.is_some())
        .last()
        .ok_or_else(|| McpError::Protocol("event stream carried no JSON-RPC response".into()))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
