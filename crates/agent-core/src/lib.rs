//! # agent-core
//!
//! Session-scoped multi-tool agent orchestration with a provider-agnostic
//! model backend and remote tool servers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        QueryOrchestrator                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │ SessionStore │  │ ToolServer   │  │ LlmProvider            │  │
//! │  │ + Window     │──│ Registry     │──│ (Strategy)             │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────────┘  │
//! │  ┌──────────────────────────┐  ┌──────────────────────────────┐  │
//! │  │ StructuredResponse       │  │ TelemetryEmitter             │  │
//! │  │ Validator                │  │ (sink on a background task)  │  │
//! │  └──────────────────────────┘  └──────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` and `ToolTransport` traits are the two seams: concrete
//! backends and tool-server wire protocols live in other crates and are
//! injected at construction time.

pub mod connection;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod session;
pub mod store;
pub mod structured;
pub mod telemetry;
pub mod tool;
pub mod validator;
pub mod window;

pub use connection::{ConnectionState, ToolConnector, ToolEndpoint, ToolServerConnection, ToolTransport};
pub use error::{AgentError, FailureReason, Result};
pub use message::{Conversation, Message, Role};
pub use orchestrator::{
    OrchestratorBuilder, OrchestratorConfig, QueryEvent, QueryOrchestrator, QueryRequest,
    QueryResponse, QueryState,
};
pub use provider::{Completion, CompletionStream, LlmProvider, ModelRequest, StreamChunk, TokenUsage};
pub use registry::{CloseReport, RegistryConfig, ToolScope, ToolServerRegistry};
pub use session::{Session, SessionId, SessionSummary};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, SessionStoreConfig};
pub use structured::{Classification, OutputSchema, StructuredResult};
pub use telemetry::{TelemetryEmitter, TelemetrySink};
pub use tool::{ToolCall, ToolCapability, ToolKey, ToolResult, ToolSpec};
pub use validator::{StructuredResponseValidator, ValidationTier};
pub use window::ConversationWindow;
