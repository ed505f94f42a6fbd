//! # agent-mcp
//!
//! Tool server transport speaking JSON-RPC 2.0 over HTTP, MCP style:
//! `initialize` handshake, `tools/list` discovery and `tools/call`
//! invocation. Plugs into `agent-core` through [`ToolConnector`].
//!
//! ```rust,ignore
//! use agent_mcp::{HttpConnector, McpConfig};
//!
//! let connector = Arc::new(HttpConnector::new(McpConfig::default())?);
//! let registry = ToolServerRegistry::new(endpoints, connector, RegistryConfig::default());
//! ```
//!
//! [`ToolConnector`]: agent_core::ToolConnector

pub mod error;
pub mod transport;
pub mod types;

pub use error::McpError;
pub use transport::{HttpConnector, HttpToolTransport, McpConfig};
