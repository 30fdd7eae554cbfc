//! API route handlers for the gateway.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use valet_core::{TaskScheduler, ValetError};

use super::server::AppState;

type ApiResult = std::result::Result<Json<Value>, (StatusCode, Json<Value>)>;

fn api_err(e: ValetError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        ValetError::NotFound { .. } => StatusCode::NOT_FOUND,
        ValetError::DuplicateId(_) => StatusCode::CONFLICT,
        ValetError::Config(_) => StatusCode::BAD_REQUEST,
        ValetError::HandlerUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ValetError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "ok": false, "error": e.to_string() })))
}

fn ok_json(value: Value) -> Json<Value> {
    Json(json!({ "ok": true, "data": value }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "live_sessions": state.sessions.session_count(),
    }))
}

#[derive(Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub text: String,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatRequest>,
) -> ApiResult {
    let reply = state
        .controller
        .handle_message(&body.user_id, body.conversation_id.as_deref(), &body.text)
        .await
        .map_err(api_err)?;
    Ok(ok_json(json!({
        "conversation_id": reply.conversation_id,
        "user_message_id": reply.user_message_id,
        "assistant_message_id": reply.assistant_message_id,
        "response": reply.response,
    })))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult {
    let conversations = state
        .messages
        .conversations_for_user(&user_id)
        .map_err(api_err)?;
    Ok(ok_json(json!(conversations)))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    #[serde(default)]
    pub all_versions: bool,
}

pub async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    // Surfaces NotFound for unknown conversations instead of an empty list
    state.messages.get_conversation(&id).map_err(api_err)?;
    let history = state
        .messages
        .history(&id, query.limit, query.all_versions)
        .map_err(api_err)?;
    Ok(ok_json(json!(history)))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.messages.delete_conversation(&id).map_err(api_err)?;
    Ok(ok_json(json!({ "deleted": id })))
}

pub async fn clear_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult {
    let removed = state.messages.clear_for_user(&user_id).map_err(api_err)?;
    Ok(ok_json(json!({ "removed": removed })))
}

#[derive(Deserialize)]
pub struct EditRequest {
    pub content: String,
}

pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<EditRequest>,
) -> ApiResult {
    let message = state.messages.edit(id, &body.content).map_err(api_err)?;
    Ok(ok_json(json!(message)))
}

#[derive(Deserialize)]
pub struct RegenerateRequest {
    pub content: String,
}

/// `{id}` here is the parent user message whose reply gets a new version.
pub async fn regenerate_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RegenerateRequest>,
) -> ApiResult {
    let message = state
        .messages
        .regenerate_version(id, &body.content)
        .map_err(api_err)?;
    Ok(ok_json(json!(message)))
}

#[derive(Deserialize)]
pub struct ActivateRequest {
    pub parent_id: i64,
}

pub async fn activate_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ActivateRequest>,
) -> ApiResult {
    state
        .messages
        .select_active_version(id, body.parent_id)
        .map_err(api_err)?;
    Ok(ok_json(json!({ "active_message_id": id })))
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    state.messages.delete(id).map_err(api_err)?;
    Ok(ok_json(json!({ "deleted": id })))
}

pub async fn rewind(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    let conversation_id = state.messages.rewind(id).map_err(api_err)?;
    Ok(ok_json(json!({ "conversation_id": conversation_id })))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult {
    let tasks = state.engine.list_for_user(&user_id).map_err(api_err)?;
    Ok(ok_json(json!(tasks)))
}

pub async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let cancelled = state.engine.cancel(&id).await.map_err(api_err)?;
    if !cancelled {
        return Err(api_err(ValetError::not_found("task", id)));
    }
    Ok(ok_json(json!({ "cancelled": id })))
}

#[derive(Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub include_read: bool,
    pub limit: Option<u32>,
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<NotificationQuery>,
) -> ApiResult {
    let notifications = state
        .pipeline
        .list_for_user(&user_id, query.include_read, query.limit.unwrap_or(50))
        .map_err(api_err)?;
    Ok(ok_json(json!(notifications)))
}

pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    let updated = state.pipeline.mark_read(id).map_err(api_err)?;
    Ok(ok_json(json!({ "id": id, "updated": updated })))
}

#[derive(Deserialize)]
pub struct SendNotificationRequest {
    pub user_id: String,
    pub message: String,
    pub send_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
}

pub async fn send_notification(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendNotificationRequest>,
) -> ApiResult {
    let id = match body.send_at {
        Some(send_at) => state
            .pipeline
            .schedule_for(&body.user_id, &body.message, send_at, "api", body.metadata)
            .await
            .map_err(api_err)?,
        None => state
            .pipeline
            .send_now(&body.user_id, &body.message, "api", body.metadata)
            .map_err(api_err)?,
    };
    Ok(ok_json(json!({ "notification_id": id })))
}
