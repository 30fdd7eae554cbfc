//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use valet_bots::CentralController;
use valet_core::config::GatewayConfig;
use valet_core::{Result, ValetError};
use valet_notify::{NotificationPipeline, SessionManager};
use valet_scheduler::SchedulerEngine;
use valet_store::MessageStore;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<CentralController>,
    pub engine: Arc<SchedulerEngine>,
    pub pipeline: Arc<NotificationPipeline>,
    pub sessions: Arc<SessionManager>,
    pub messages: MessageStore,
    pub start_time: std::time::Instant,
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    Router::new()
        .route("/api/v1/health", get(super::routes::health))
        .route("/api/v1/chat", post(super::routes::chat))
        .route(
            "/api/v1/users/{user_id}/conversations",
            get(super::routes::list_conversations)
                .delete(super::routes::clear_conversations),
        )
        .route(
            "/api/v1/conversations/{id}",
            delete(super::routes::delete_conversation),
        )
        .route(
            "/api/v1/conversations/{id}/messages",
            get(super::routes::conversation_messages),
        )
        .route("/api/v1/messages/{id}", delete(super::routes::delete_message))
        .route("/api/v1/messages/{id}/edit", post(super::routes::edit_message))
        .route(
            "/api/v1/messages/{id}/regenerate",
            post(super::routes::regenerate_message),
        )
        .route(
            "/api/v1/messages/{id}/activate",
            post(super::routes::activate_version),
        )
        .route("/api/v1/messages/{id}/rewind", post(super::routes::rewind))
        .route("/api/v1/users/{user_id}/tasks", get(super::routes::list_tasks))
        .route("/api/v1/tasks/{id}", delete(super::routes::cancel_task))
        .route(
            "/api/v1/users/{user_id}/notifications",
            get(super::routes::list_notifications),
        )
        .route(
            "/api/v1/notifications/{id}/read",
            post(super::routes::mark_notification_read),
        )
        .route("/api/v1/notifications", post(super::routes::send_notification))
        .route("/ws/{client_id}", get(super::ws::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind and serve until ctrl-c.
pub async fn run(config: &GatewayConfig, state: AppState) -> Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ValetError::Config(format!("Failed to bind {addr}: {e}")))?;

    tracing::info!("🌐 Gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 Shutdown signal received");
        })
        .await
        .map_err(ValetError::storage)?;
    Ok(())
}
