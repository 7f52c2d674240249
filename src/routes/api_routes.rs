use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::AppError;
use crate::models::{ChatRequest, CreateBranchRequest, MergeRequest};
use crate::routes::AppState;

// ── Handlers ─────────────────────────────────────────────────────────────────

/// GET `/health`
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// POST `/api/chat` — send a message on the active branch, JSON in/out.
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    match state.chat.chat(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations`
pub async fn list_conversations_handler(State(state): State<AppState>) -> Response {
    match state.chat.get_conversations().await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE `/api/conversations/{id}`
pub async fn delete_conversation_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.chat.delete_conversation(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/messages` — the active branch, root first.
pub async fn list_messages_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.chat.get_messages(&id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/messages/{message_id}/regenerate`
pub async fn regenerate_handler(
    Path((id, message_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    match state.chat.regenerate(&id, &message_id).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/branches`
pub async fn list_branches_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.branches.list_branches(&id).await {
        Ok(branches) => Json(branches).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/branches`
pub async fn create_branch_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<CreateBranchRequest>,
) -> Response {
    match state
        .branches
        .create_branch(&id, &request.name, &request.from_message_id)
        .await
    {
        Ok(branch) => (StatusCode::CREATED, Json(branch)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/branches/{name}/switch`
pub async fn switch_branch_handler(
    Path((id, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    match state.branches.switch_branch(&id, &name).await {
        Ok(branch) => Json(branch).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE `/api/conversations/{id}/branches/{name}`
pub async fn delete_branch_handler(
    Path((id, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    match state.branches.delete_branch(&id, &name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/history` — the annotated message tree.
pub async fn history_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.branches.history(&id).await {
        Ok(root) => Json(root).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/merge`
pub async fn merge_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> Response {
    match state
        .branches
        .merge(&id, &request.source, &request.target, request.policy)
        .await
    {
        Ok(branch) => Json(branch).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helper ────────────────────────────────────────────────────────────────────

fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if err.is_invalid_operation() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else if err.is_agent_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Internal error surfaced to client: {err}");
    }

    // Merge conflicts carry the colliding pairs so the caller can resolve
    // them manually.
    let body = match err {
        AppError::MergeConflict { conflicts } => {
            json!({ "error": err.to_string(), "conflicts": conflicts })
        }
        _ => json!({ "error": err.to_string() }),
    };
    (status, Json(body)).into_response()
}
