//! HTTP server: the rehearsal WebSocket and a health probe.

mod websocket;

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::rehearsal::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { engine })
}

/// Serve until `cancel` fires.
pub async fn serve(listener: TcpListener, engine: Arc<Engine>, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Rehearsal server listening on ws://{addr}/ws");

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("Rehearsal server shut down");
    Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.engine.active_sessions(),
    }))
}
