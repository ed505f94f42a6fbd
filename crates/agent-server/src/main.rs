//! mcp-agent HTTP Server
//!
//! Axum-based server exposing the query orchestrator over REST and
//! WebSocket endpoints.

mod config;
mod handlers;
mod state;

use std::sync::Arc;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::store::spawn_sweeper;
use agent_core::telemetry::TracingSink;
use agent_core::{
    ConversationWindow, FileSessionStore, LlmProvider, MemorySessionStore, QueryOrchestrator,
    RegistryConfig, SessionStore, SessionStoreConfig, TelemetryEmitter, ToolServerRegistry,
};
use agent_mcp::{HttpConnector, McpConfig};
use agent_runtime::OllamaProvider;

use crate::config::{ServerConfig, SessionBackend, TelemetryMode};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env()?;

    // Model backend
    let model = config.ollama.model.clone();
    let provider: Arc<dyn LlmProvider> = Arc::new(OllamaProvider::from_config(config.ollama.clone())?);
    match provider.health_check().await {
        Ok(true) => tracing::info!(model = %model, "Connected to Ollama"),
        Ok(false) | Err(_) => {
            tracing::warn!("Ollama not available - queries will fail until it is");
            tracing::warn!("  Make sure Ollama is running: ollama serve");
        }
    }

    // Session store
    let store_config = SessionStoreConfig::with_ttl(config.session_ttl);
    let store: Arc<dyn SessionStore> = match config.session_backend {
        SessionBackend::Memory => Arc::new(MemorySessionStore::new(store_config)),
        SessionBackend::File => Arc::new(FileSessionStore::open(&config.session_dir, store_config).await?),
    };
    let sweeper = spawn_sweeper(store.clone(), config.sweep_interval);
    tracing::info!(backend = ?config.session_backend, ttl_secs = config.session_ttl.as_secs(), "Session store ready");

    // Tool servers
    let connector = Arc::new(HttpConnector::new(McpConfig::default())?);
    let registry = ToolServerRegistry::new(
        config.tool_servers.clone(),
        connector,
        RegistryConfig {
            call_timeout: config.tool_timeout,
            ..Default::default()
        },
    );
    tracing::info!("Configured {} tool servers:", config.tool_servers.len());
    for endpoint in &config.tool_servers {
        tracing::info!("  • {} {}{}", endpoint.id, endpoint.url, if endpoint.required { " (required)" } else { "" });
    }

    let telemetry = match config.telemetry {
        TelemetryMode::Off => TelemetryEmitter::disabled(),
        TelemetryMode::Log => TelemetryEmitter::new(Arc::new(TracingSink)),
    };

    let orchestrator = QueryOrchestrator::builder()
        .provider(provider.clone())
        .store(store)
        .registry(Arc::new(registry))
        .telemetry(telemetry)
        .model(model)
        .window(ConversationWindow::new(config.window_max_pairs))
        .query_timeout(config.query_timeout)
        .structured_output(config.structured_output)
        .build()?;
    let orchestrator = Arc::new(orchestrator);

    let state = AppState {
        orchestrator: orchestrator.clone(),
        provider,
        tool_servers: config.tool_servers.iter().map(|e| e.id.clone()).collect(),
    };

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = handlers::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("mcp-agent server running on http://{}", config.bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health              - Health check");
    tracing::info!("  POST   /api/query           - Run a query");
    tracing::info!("  GET    /api/query/stream    - WebSocket streaming query");
    tracing::info!("  GET    /api/sessions        - Recent sessions");
    tracing::info!("  GET    /api/sessions/{{id}}   - Session summary");
    tracing::info!("  DELETE /api/sessions/{{id}}   - Forget a session");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    orchestrator.telemetry().flush().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
