//! Application State

use std::sync::Arc;

use agent_core::{LlmProvider, QueryOrchestrator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Per-query state machine over sessions, tools and the model backend
    pub orchestrator: Arc<QueryOrchestrator>,

    /// Same backend the orchestrator uses, kept for health checks
    pub provider: Arc<dyn LlmProvider>,

    /// Configured tool server ids
    pub tool_servers: Vec<String>,
}
