//! Tool Server Connections
//!
//! One scoped RPC channel to one remote tool server. The wire protocol lives
//! behind [`ToolTransport`]; this module owns the connection state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AgentError, Result};
use crate::tool::ToolCapability;

/// A configured tool server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEndpoint {
    /// Server identifier, used as the capability namespace
    pub id: String,

    pub url: String,

    /// Whether the server's tools are required for queries to proceed
    #[serde(default)]
    pub required: bool,
}

impl ToolEndpoint {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Connection lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Failed(String),
}

/// Wire-level channel to a tool server
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Establish the channel (handshake)
    async fn connect(&mut self) -> Result<()>;

    /// List the server's capabilities
    async fn discover(&mut self) -> Result<Vec<ToolCapability>>;

    /// Call one capability by its server-local name
    async fn invoke(&self, tool: &str, arguments: serde_json::Value) -> Result<serde_json::Value>;

    /// Tear the channel down
    async fn disconnect(&mut self) -> Result<()>;
}

/// Builds a fresh transport per endpoint per query
pub trait ToolConnector: Send + Sync {
    fn transport(&self, endpoint: &ToolEndpoint) -> Box<dyn ToolTransport>;
}

/// Scoped connection to one tool server
pub struct ToolServerConnection {
    endpoint: ToolEndpoint,
    transport: Box<dyn ToolTransport>,
    state: ConnectionState,
    capabilities: Vec<ToolCapability>,
}

impl std::fmt::Debug for ToolServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServerConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities.len())
            .finish()
    }
}

impl ToolServerConnection {
    pub fn new(endpoint: ToolEndpoint, transport: Box<dyn ToolTransport>) -> Self {
        Self {
            endpoint,
            transport,
            state: ConnectionState::Closed,
            capabilities: Vec::new(),
        }
    }

    pub fn from_connector(endpoint: ToolEndpoint, connector: &Arc<dyn ToolConnector>) -> Self {
        let transport = connector.transport(&endpoint);
        Self::new(endpoint, transport)
    }

    pub fn endpoint(&self) -> &ToolEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Capabilities, empty unless the connection is open
    pub fn capabilities(&self) -> &[ToolCapability] {
        if self.is_open() { &self.capabilities } else { &[] }
    }

    /// Connect and discover. On failure the state is `Failed` and no
    /// capabilities are exposed.
    pub async fn open(&mut self) -> Result<()> {
        self.state = ConnectionState::Opening;
        match self.connect_and_discover().await {
            Ok(capabilities) => {
                tracing::debug!(
                    server = %self.endpoint.id,
                    tools = capabilities.len(),
                    "Tool server connected"
                );
                self.capabilities = capabilities;
                self.state = ConnectionState::Open;
                Ok(())
            }
            Err(e) => {
                self.fail(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn connect_and_discover(&mut self) -> Result<Vec<ToolCapability>> {
        self.transport.connect().await?;
        self.transport.discover().await
    }

    /// Mark as failed, tearing down anything a partial open may have set up
    pub(crate) async fn fail(&mut self, reason: String) {
        if let Err(e) = self.transport.disconnect().await {
            tracing::debug!(server = %self.endpoint.id, error = %e, "Disconnect after failed open");
        }
        self.capabilities.clear();
        self.state = ConnectionState::Failed(reason);
    }

    /// Invoke by server-local tool name; fails fast unless open
    pub async fn invoke(&self, tool: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
        match &self.state {
            ConnectionState::Open => self.transport.invoke(tool, arguments).await,
            ConnectionState::Failed(reason) => Err(AgentError::ToolUnavailable {
                server: self.endpoint.id.clone(),
                reason: reason.clone(),
            }),
            ConnectionState::Closed | ConnectionState::Opening => Err(AgentError::ToolUnavailable {
                server: self.endpoint.id.clone(),
                reason: "connection is not open".into(),
            }),
        }
    }

    /// Disconnect if open; `Ok(false)` when there was nothing to close.
    /// The connection is `Closed` afterwards even when the disconnect fails.
    pub async fn close(&mut self) -> Result<bool> {
        if !self.is_open() {
            return Ok(false);
        }
        let outcome = self.transport.disconnect().await;
        self.capabilities.clear();
        self.state = ConnectionState::Closed;
        outcome.map(|()| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        fail_connect: bool,
        fail_disconnect: bool,
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolTransport for FakeTransport {
        async fn connect(&mut self) -> Result<()> {
            if self.fail_connect {
                Err(AgentError::ToolUnavailable {
                    server: "fake".into(),
                    reason: "connection refused".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn discover(&mut self) -> Result<Vec<ToolCapability>> {
            Ok(vec![ToolCapability::new("echo", "Echo", json!({"type": "object"}))])
        }

        async fn invoke(&self, _tool: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
            Ok(arguments)
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.fail_disconnect {
                return Err(AgentError::ToolUnavailable {
                    server: "fake".into(),
                    reason: "reset by peer".into(),
                });
            }
            Ok(())
        }
    }

    fn connection(fail_connect: bool) -> (ToolServerConnection, Arc<AtomicUsize>) {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let transport = FakeTransport {
            fail_connect,
            fail_disconnect: false,
            disconnects: Arc::clone(&disconnects),
        };
        (
            ToolServerConnection::new(ToolEndpoint::new("fake", "http://fake"), Box::new(transport)),
            disconnects,
        )
    }

    #[tokio::test]
    async fn test_open_invoke_close() {
        let (mut conn, disconnects) = connection(false);
        assert_eq!(conn.state(), &ConnectionState::Closed);

        conn.open().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.capabilities().len(), 1);
        assert_eq!(conn.invoke("echo", json!({"a": 1})).await.unwrap(), json!({"a": 1}));

        assert!(conn.close().await.unwrap());
        assert!(!conn.close().await.unwrap());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(conn.capabilities().is_empty());
    }

    #[tokio::test]
    async fn test_failed_disconnect_still_closes() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let transport = FakeTransport {
            fail_connect: false,
            fail_disconnect: true,
            disconnects: Arc::clone(&disconnects),
        };
        let mut conn = ToolServerConnection::new(ToolEndpoint::new("fake", "http://fake"), Box::new(transport));
        conn.open().await.unwrap();

        assert!(conn.close().await.is_err());
        assert_eq!(conn.state(), &ConnectionState::Closed);
        assert!(!conn.close().await.unwrap());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invoke_fails_fast_when_not_open() {
        let (conn, _) = connection(false);
        let err = conn.invoke("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_failed_open() {
        let (mut conn, _) = connection(true);
        assert!(conn.open().await.is_err());
        assert!(matches!(conn.state(), ConnectionState::Failed(_)));
        assert!(conn.capabilities().is_empty());
        assert!(matches!(
            conn.invoke("echo", json!({})).await,
            Err(AgentError::ToolUnavailable { .. })
        ));
        // Nothing was opened, nothing to close
        assert!(!conn.close().await.unwrap());
    }
}
