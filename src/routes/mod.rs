//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router carries the canvas websocket, a health check, and a
//! read-only stats endpoint. When `STATIC_DIR` is set, the client bundle is
//! served from it for every other path.

pub mod ws;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/ws", get(ws::handle_ws))
        .route("/api/stats", get(stats))
        .route("/healthz", get(healthz));

    let router = match &state.config.static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true)),
        None => router,
    };

    router
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.hub.stats().await {
        Some(stats) => Json(stats).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
