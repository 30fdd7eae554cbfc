//! WebSocket endpoint: one socket per client session.
//!
//! Protocol:
//! → Client sends: {"type":"chat","user_id":"...","content":"...","conversation_id":"..."}
//! ← Server sends: {"type":"chat_reply","conversation_id":"...","response":"..."}
//! ← Server pushes: {"type":"notification","id":...,"message":"..."}
//! → {"type":"ping"} is answered with {"type":"pong"}.
//!
//! Queued notifications that came due while the user was offline are
//! flushed right after connect.

use std::sync::Arc;

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::server::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    pub user_id: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id, query.user_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, client_id: String, user_id: String) {
    let mut push_rx = state.sessions.connect(&client_id, &user_id);
    let (mut sink, mut stream) = socket.split();

    let welcome = json!({
        "type": "connected",
        "client_id": client_id,
        "version": env!("CARGO_PKG_VERSION"),
    });
    if sink.send(Message::Text(welcome.to_string().into())).await.is_err() {
        state.sessions.disconnect(&client_id);
        return;
    }

    if let Err(e) = state.pipeline.deliver_pending(&user_id) {
        tracing::warn!("⚠️ Could not flush pending notifications for {user_id}: {e}");
    }

    // Forward pipeline pushes to the socket until either side goes away.
    let forward = tokio::spawn(async move {
        while let Some(payload) = push_rx.recv().await {
            if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                break;
            }
        }
        sink
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => {
                send_via_sessions(&state, &client_id, json!({
                    "type": "error",
                    "error": "invalid JSON",
                }));
                continue;
            }
        };

        match request["type"].as_str() {
            Some("ping") => {
                send_via_sessions(&state, &client_id, json!({ "type": "pong" }));
            }
            Some("chat") => {
                let content = request["content"].as_str().unwrap_or_default();
                let conversation_id = request["conversation_id"].as_str();
                let reply = state
                    .controller
                    .handle_message(&user_id, conversation_id, content)
                    .await;
                let payload = match reply {
                    Ok(reply) => json!({
                        "type": "chat_reply",
                        "conversation_id": reply.conversation_id,
                        "user_message_id": reply.user_message_id,
                        "assistant_message_id": reply.assistant_message_id,
                        "response": reply.response,
                    }),
                    Err(e) => json!({ "type": "error", "error": e.to_string() }),
                };
                send_via_sessions(&state, &client_id, payload);
            }
            other => {
                send_via_sessions(&state, &client_id, json!({
                    "type": "error",
                    "error": format!("unknown message type: {}", other.unwrap_or("<none>")),
                }));
            }
        }
    }

    state.sessions.disconnect(&client_id);
    forward.abort();
    tracing::info!("WebSocket closed: {client_id}");
}

/// Replies go through the session channel so they interleave cleanly with
/// notification pushes on the single sink.
fn send_via_sessions(state: &AppState, client_id: &str, payload: serde_json::Value) {
    if !state.sessions.send_to_session(client_id, payload) {
        tracing::debug!("Reply to {client_id} dropped, session gone");
    }
}
