//! HTTP surface of the memory engine
//!
//! Tool routes for assistants (`/tools/save`, `/tools/search`,
//! `/tools/forget`, `/tools/prime`, `/tools/extract`) plus the administrative surface: memories, identity,
//! journal, rules and maintenance triggers. Errors become
//! `{"error": {"kind", "message"}}` bodies.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::engine::MemoryEngine;
use crate::error::{ErrorBody, MemkeepError, Result};

/// Shared state of every handler
pub struct AppState {
    pub engine: Arc<MemoryEngine>,
}

impl MemkeepError {
    /// HTTP status for this error at the API boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MemkeepError::Validation(_) => StatusCode::BAD_REQUEST,
            MemkeepError::NotFound(_) => StatusCode::NOT_FOUND,
            MemkeepError::ReflectionInProgress => StatusCode::CONFLICT,
            MemkeepError::ClassificationDegraded(_)
            | MemkeepError::IndexingLag(_)
            | MemkeepError::Embedding(_)
            | MemkeepError::Classifier(_) => StatusCode::SERVICE_UNAVAILABLE,
            MemkeepError::Storage(_)
            | MemkeepError::Io(_)
            | MemkeepError::Config(_)
            | MemkeepError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MemkeepError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        let body = serde_json::json!({ "error": ErrorBody::from(&self) });
        (status, Json(body)).into_response()
    }
}

/// Create the router with all routes configured
pub fn create_router(engine: Arc<MemoryEngine>, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/tools/save", post(handlers::save_handler))
        .route("/tools/search", post(handlers::search_handler))
        .route("/tools/forget", post(handlers::forget_tool_handler))
        .route("/tools/prime", post(handlers::prime_handler))
        .route("/tools/extract", post(handlers::extract_handler))
        .route(
            "/memories",
            get(handlers::list_memories_handler).post(handlers::create_memory_handler),
        )
        .route(
            "/memories/{id}",
            get(handlers::get_memory_handler)
                .patch(handlers::update_memory_handler)
                .delete(handlers::delete_memory_handler),
        )
        .route(
            "/memories/{id}/pin",
            post(handlers::pin_handler).delete(handlers::unpin_handler),
        )
        .route(
            "/memories/{id}/sensitivity",
            put(handlers::set_sensitivity_handler),
        )
        .route("/memories/{id}/neighbors", get(handlers::neighbors_handler))
        .route("/search", post(handlers::search_handler))
        .route(
            "/identity",
            get(handlers::get_identity_handler).put(handlers::put_identity_handler),
        )
        .route("/stats", get(handlers::stats_handler))
        .route("/pii", get(handlers::pii_handler))
        .route("/reflect", post(handlers::reflect_handler))
        .route("/reconcile", post(handlers::reconcile_handler))
        .route("/classify", post(handlers::classify_handler))
        .route("/journal", get(handlers::journal_handler))
        .route("/journal/checkpoint", post(handlers::checkpoint_handler))
        .route(
            "/rules",
            get(handlers::list_rules_handler).post(handlers::create_rule_handler),
        )
        .route(
            "/rules/{id}",
            put(handlers::update_rule_handler).delete(handlers::delete_rule_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(config.timeout_secs.max(1))))
        .with_state(state)
}

/// Bind the listener and serve until Ctrl+C or SIGTERM.
pub async fn serve(engine: Arc<MemoryEngine>, config: &ServerConfig) -> Result<()> {
    let addr: SocketAddr = config.listen_addr.parse().map_err(|e| {
        MemkeepError::Config(format!("Invalid listen address '{}': {e}", config.listen_addr))
    })?;

    let background = engine.spawn_background_jobs();
    let app = create_router(engine, config);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| MemkeepError::Config(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("memkeep listening on {addr}");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(MemkeepError::Io);

    for handle in background {
        handle.abort();
    }
    result?;

    tracing::info!("memkeep shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
