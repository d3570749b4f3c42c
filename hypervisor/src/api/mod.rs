use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use shared_types::{ConversationId, RuntimeSelection};
use tracing::error;

use crate::orchestrator::{OrchestratorError, Turn};
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/conversations/{id}/messages", post(send_message))
        .route("/conversations/{id}/close", post(close_conversation))
        .route("/conversations/{id}/replies", get(take_replies))
        .route("/conversations/{id}/session", get(get_session))
        .route("/conversations/{id}/runtime", put(set_runtime))
        .route("/admin/workers", get(list_workers))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn error_status(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::Launch(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /conversations/:id/messages — launch a worker or queue a follow-up
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(turn): Json<Turn>,
) -> impl IntoResponse {
    if turn.prompt.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "prompt must not be empty").into_response();
    }
    let conversation_id = ConversationId::new(id);
    match state.orchestrator.send(&conversation_id, turn).await {
        Ok(dispatch) => (StatusCode::ACCEPTED, Json(dispatch)).into_response(),
        Err(e) => {
            error!(%conversation_id, "send message: {e}");
            (error_status(&e), e.to_string()).into_response()
        }
    }
}

/// POST /conversations/:id/close
pub async fn close_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let conversation_id = ConversationId::new(id);
    match state.orchestrator.close(&conversation_id).await {
        Ok(closed) => Json(serde_json::json!({ "closed": closed })).into_response(),
        Err(e) => {
            error!(%conversation_id, "close conversation: {e}");
            (error_status(&e), e.to_string()).into_response()
        }
    }
}

/// GET /conversations/:id/replies — drain buffered outcomes
pub async fn take_replies(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.outbox.take(&ConversationId::new(id)).await)
}

/// GET /conversations/:id/session
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&ConversationId::new(id)).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("get session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// PUT /conversations/:id/runtime — pin the runtime for future launches
pub async fn set_runtime(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(runtime): Json<RuntimeSelection>,
) -> impl IntoResponse {
    match state
        .registry
        .set_runtime(&ConversationId::new(id), &runtime)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("set runtime: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /admin/workers — live worker snapshots
pub async fn list_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot().await)
}
