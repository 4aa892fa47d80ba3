use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::AppState;
use super::middleware;

pub fn build_router(state: AppState) -> Router {
    let heartbeat_routes = Router::new()
        .route(&state.heartbeat.path, post(super::heartbeat::handlers::heartbeat))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::heartbeat_guard,
        ));

    Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .merge(heartbeat_routes)
        .nest("/api", api_router())
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn api_router() -> Router<AppState> {
    Router::new().merge(super::flows::router())
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}
