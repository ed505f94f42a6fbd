//! # agent-runtime
//!
//! Model backends for the mcp-agent orchestrator.
//!
//! ## Providers
//!
//! - **Ollama** (default): local inference through `/api/chat`, with native
//!   tool calling and schema-constrained output
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{OllamaConfig, OllamaProvider};
//!
//! let provider = OllamaProvider::from_config(OllamaConfig::from_env())?;
//! let orchestrator = QueryOrchestrator::builder()
//!     .provider(Arc::new(provider))
//!     .build()?;
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};

// Re-export core types for convenience
pub use agent_core::{AgentError, LlmProvider, Message, ModelRequest, Result, Role};
