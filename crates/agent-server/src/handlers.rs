//! HTTP/WebSocket Handlers

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use agent_core::{
    AgentError, FailureReason, QueryEvent, QueryRequest, QueryResponse, SessionId, SessionSummary,
};

use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub model_backend_connected: bool,
    pub tool_servers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Agent errors rendered as `{error, code}` with a matching status
#[derive(Debug)]
pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reason = self.0.failure_reason();
        let status = status_for(reason);
        if status.is_server_error() {
            tracing::error!(code = reason.as_str(), error = %self.0, "Request failed");
        } else {
            tracing::debug!(code = reason.as_str(), error = %self.0, "Request rejected");
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

impl From<&AgentError> for ErrorResponse {
    fn from(err: &AgentError) -> Self {
        Self {
            error: err.user_message(),
            code: err.failure_reason().as_str().into(),
        }
    }
}

pub fn status_for(reason: FailureReason) -> StatusCode {
    match reason {
        FailureReason::InvalidQuery => StatusCode::BAD_REQUEST,
        FailureReason::SessionNotFound => StatusCode::NOT_FOUND,
        FailureReason::ModelBackendError => StatusCode::BAD_GATEWAY,
        FailureReason::SessionInfraError | FailureReason::ToolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        FailureReason::QueryTimeout => StatusCode::GATEWAY_TIMEOUT,
        // Tool timeouts go back to the model and validation falls back, so
        // neither ends a query
        FailureReason::ToolTimeout
        | FailureReason::ValidationExhausted
        | FailureReason::Cancelled
        | FailureReason::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Terminal frame of a streaming query
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEnd {
    Done(QueryResponse),
    Error(ErrorResponse),
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/query", post(query_handler))
        .route("/api/query/stream", get(query_stream_handler))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let model_backend_connected = state.provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        model_backend_connected,
        tool_servers: state.tool_servers.clone(),
    })
}

/// Single-shot query
pub async fn query_handler(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| AgentError::InvalidQuery(e.body_text()))?;
    let response = state.orchestrator.query(request).await?;
    Ok(Json(response))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    Ok(Json(state.orchestrator.store().list(limit).await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.orchestrator.session(&id).await?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = SessionId::from_string(id);
    if state.orchestrator.store().delete(&id).await? {
        tracing::info!(session_id = %id, "Session deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AgentError::SessionNotFound(id.to_string()).into())
    }
}

/// WebSocket streaming query
pub async fn query_stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

async fn handle_stream(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        let request: QueryRequest = match serde_json::from_str(&msg) {
            Ok(r) => r,
            Err(e) => {
                let end = StreamEnd::Error(ErrorResponse::from(&AgentError::InvalidQuery(e.to_string())));
                if send_json(&mut sender, &end).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let (tx, mut events) = mpsc::channel::<QueryEvent>(64);
        let orchestrator = state.orchestrator.clone();
        let mut task = tokio::spawn(async move { orchestrator.query_streaming(request, tx).await });

        let outcome = loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if send_json(&mut sender, &event).await.is_err() {
                        task.abort();
                        return;
                    }
                }
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => {
                        tracing::info!("Client closed the stream; aborting query");
                        task.abort();
                        return;
                    }
                    // one query at a time per socket
                    Some(Ok(_)) => {}
                },
                joined = &mut task => break joined,
            }
        };

        while let Ok(event) = events.try_recv() {
            if send_json(&mut sender, &event).await.is_err() {
                return;
            }
        }

        let end = match outcome {
            Ok(Ok(response)) => StreamEnd::Done(response),
            Ok(Err(e)) => StreamEnd::Error(ErrorResponse::from(&e)),
            Err(e) => StreamEnd::Error(ErrorResponse::from(&AgentError::Other(format!("query task failed: {}", e)))),
        };
        if send_json(&mut sender, &end).await.is_err() {
            return;
        }
    }
}

async fn send_json<S, T>(sender: &mut S, value: &T) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
    T: Serialize,
{
    let text = serde_json::to_string(value).map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::provider::{Completion, CompletionStream, ModelRequest, ProviderInfo, StreamChunk};
    use agent_core::{LlmProvider, QueryOrchestrator, Result};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct FixedProvider;

    #[async_trait]
    impl LlmProvider for FixedProvider {
        async fn info(&self) -> Result<ProviderInfo> {
            Ok(ProviderInfo {
                name: "Fixed".into(),
                version: None,
                model: "fixed".into(),
                supports_streaming: true,
                supports_tools: true,
                supports_structured_output: false,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn complete(&self, _request: &ModelRequest) -> Result<Completion> {
            Ok(Completion {
                content: r#"{"summary": "Dry week ahead", "locations": [], "classification": "weather"}"#.into(),
                model: "fixed".into(),
                ..Default::default()
            })
        }

        async fn complete_stream(&self, request: &ModelRequest) -> Result<CompletionStream> {
            let completion = self.complete(request).await?;
            let chunks = vec![
                Ok(StreamChunk { delta: completion.content, ..Default::default() }),
                Ok(StreamChunk { done: true, ..Default::default() }),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn app() -> Router {
        let provider: Arc<dyn LlmProvider> = Arc::new(FixedProvider);
        let orchestrator = QueryOrchestrator::builder()
            .provider(provider.clone())
            .build()
            .unwrap();
        router(AppState {
            orchestrator: Arc::new(orchestrator),
            provider,
            tool_servers: vec!["weather".into()],
        })
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, body)
    }

    fn post_query(body: Value) -> Request<Body> {
        Request::post("/api/query")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(FailureReason::InvalidQuery), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(FailureReason::SessionNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(FailureReason::ModelBackendError), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(FailureReason::SessionInfraError), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(FailureReason::ToolUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(FailureReason::QueryTimeout), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_non_terminal_reasons_share_the_internal_status() {
        for reason in [FailureReason::ToolTimeout, FailureReason::ValidationExhausted, FailureReason::Cancelled] {
            assert_eq!(status_for(reason), status_for(FailureReason::Internal));
        }
    }

    #[test]
    fn test_stream_end_frames() {
        let err = StreamEnd::Error(ErrorResponse::from(&AgentError::QueryTimeout { timeout_ms: 10 }));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "query_timeout");
    }

    #[tokio::test]
    async fn test_query_then_follow_up() {
        let app = app();

        let (status, first) = call(&app, post_query(json!({"query": "Rain in Kampala?"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["session_new"], true);
        assert_eq!(first["conversation_turn"], 1);
        assert_eq!(first["response"], "Dry week ahead");
        assert_eq!(first["structured"]["classification"], "weather");

        let id = first["session_id"].as_str().unwrap().to_string();
        let (status, second) = call(&app, post_query(json!({"query": "And Jinja?", "session_id": id}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["session_new"], false);
        assert_eq!(second["conversation_turn"], 2);

        let (status, summary) = call(&app, Request::get(format!("/api/sessions/{id}")).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["turn_count"], 2);

        let (status, list) = call(&app, Request::get("/api/sessions?limit=5").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = app();
        let (status, body) = call(&app, post_query(json!({"query": "hi", "session_id": "gone"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "session_not_found");
    }

    #[tokio::test]
    async fn test_bad_requests_are_400() {
        let app = app();

        let (status, body) = call(&app, post_query(json!({"query": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_query");

        let malformed = Request::post("/api/query")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(&app, malformed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_query");
    }

    #[tokio::test]
    async fn test_delete_session() {
        let app = app();
        let (_, first) = call(&app, post_query(json!({"query": "hello"}))).await;
        let id = first["session_id"].as_str().unwrap().to_string();

        let delete = || Request::delete(format!("/api/sessions/{id}")).body(Body::empty()).unwrap();
        let (status, _) = call(&app, delete()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, delete()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "session_not_found");
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_backend_connected"], true);
        assert_eq!(body["tool_servers"][0], "weather");
    }
}
