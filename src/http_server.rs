//! HTTP server implementation using Axum.

use crate::connection;
use crate::lifecycle::ActiveSandbox;
use crate::state::AppState;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Serialize)]
struct UserInfo {
    #[serde(flatten)]
    sandbox: ActiveSandbox,
    online: bool,
    observers: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/users", get(list_users))
        // Health check
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the configured port until `shutdown` resolves.
pub async fn run_server(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    serve(listener, state, shutdown).await
}

/// Serves on an already bound listener; also starts the idle sweeper.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let sweeper = state.lifecycle.spawn_sweeper();
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    sweeper.abort();
    result
}

async fn health() -> &'static str {
    "OK"
}

async fn list_users(State(state): State<AppState>) -> Json<Vec<UserInfo>> {
    let users = state
        .lifecycle
        .list_active()
        .into_iter()
        .map(|sandbox| UserInfo {
            online: state.presence.is_online(&sandbox.username),
            observers: state.presence.observer_count(&sandbox.username),
            sandbox,
        })
        .collect();
    Json(users)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::serve_socket(state, socket))
}
