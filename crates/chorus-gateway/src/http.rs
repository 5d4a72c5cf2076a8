//! HTTP/SSE surface over the Server Coordinator (spec §6, supplemented
//! feature 1): the minimum axum router needed to exercise Subscribe/
//! Publish/Broadcast end to end.

use crate::auth::ResolvedAuth;
use crate::coordinator::Coordinator;
use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chorus_core::{ApiError, ConversationId, ConversationSnapshot};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub auth: ResolvedAuth,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/conversations", post(create_conversation).get(list_conversations))
        .route("/conversations/stream", get(stream_conversation_list))
        .route("/conversations/:id/messages", post(post_message))
        .route("/conversations/:id/cancel", post(cancel_conversation))
        .route("/conversations/:id/archive", post(archive_conversation))
        .route("/conversations/:id/unarchive", post(unarchive_conversation))
        .route("/conversations/:id/slug", patch(rename_conversation))
        .route("/conversations/:id/stream", get(stream_conversation))
        .with_state(state)
}

fn err_response(status: StatusCode, err: &chorus_core::Error) -> Response {
    (status, Json(ApiError::from(err))).into_response()
}

fn status_for(err: &chorus_core::Error) -> StatusCode {
    use chorus_core::Error::*;
    match err {
        ConversationNotFound(_) => StatusCode::NOT_FOUND,
        AuthFailed { .. } => StatusCode::UNAUTHORIZED,
        ModelMismatch { .. } | TurnInProgress(_) | InvalidMessage(_) | SequenceConflict { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn check_auth(headers: &HeaderMap, auth: &ResolvedAuth) -> Result<(), Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    auth.verify_token(token)
        .map_err(|e| err_response(status_for(&e), &e))
}

fn parse_id(id: &str) -> Result<ConversationId, Response> {
    id.parse()
        .map_err(|_| err_response(StatusCode::BAD_REQUEST, &chorus_core::Error::InvalidMessage(format!("not a valid conversation id: {id}"))))
}

#[derive(Deserialize)]
struct CreateConversationBody {
    #[serde(default)]
    cwd: Option<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationBody>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let snapshot = state.coordinator.create_conversation(body.cwd);
    (StatusCode::CREATED, Json(snapshot)).into_response()
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    archived: bool,
}

async fn list_conversations(State(state): State<AppState>, headers: HeaderMap, Query(query): Query<ListQuery>) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let conversations: Vec<ConversationSnapshot> = state
        .coordinator
        .list(query.archived)
        .iter()
        .map(ConversationSnapshot::from)
        .collect();
    Json(conversations).into_response()
}

#[derive(Deserialize)]
struct PostMessageBody {
    message: String,
    model_id: String,
}

async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.coordinator.post_message(id, &body.model_id, &body.message).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => err_response(status_for(&e), &e),
    }
}

async fn cancel_conversation(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.coordinator.cancel(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(status_for(&e), &e),
    }
}

async fn archive_conversation(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.coordinator.archive(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(status_for(&e), &e),
    }
}

async fn unarchive_conversation(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.coordinator.unarchive(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(status_for(&e), &e),
    }
}

#[derive(Deserialize)]
struct RenameBody {
    slug: String,
}

async fn rename_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.coordinator.set_slug(id, &body.slug) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(status_for(&e), &e),
    }
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(default = "default_since")]
    since: i64,
}

fn default_since() -> i64 {
    -1
}

async fn stream_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let manager = match state.coordinator.get_or_create_manager(id).await {
        Ok(m) => m,
        Err(e) => return err_response(status_for(&e), &e),
    };

    let cancel = CancellationToken::new();
    let mut sub = manager.subscribe(cancel, query.since);
    let body = stream! {
        while let Some(snapshot) = sub.next().await {
            match serde_json::to_string(&snapshot) {
                Ok(json) => yield Ok::<Event, Infallible>(Event::default().data(json)),
                Err(e) => tracing::error!(error = %e, "failed to serialize stream snapshot"),
            }
        }
    };
    Sse::new(body).into_response()
}

async fn stream_conversation_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&headers, &state.auth) {
        return resp;
    }
    let cancel = CancellationToken::new();
    let mut sub = state.coordinator.subscribe_list(cancel);
    let body = stream! {
        while let Some(update) = sub.next().await {
            match serde_json::to_string(&update) {
                Ok(json) => yield Ok::<Event, Infallible>(Event::default().data(json)),
                Err(e) => tracing::error!(error = %e, "failed to serialize conversation list update"),
            }
        }
    };
    Sse::new(body).into_response()
}
