pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/flows", get(handlers::list_flows).post(handlers::create_flow))
        .route(
            "/flows/{id}",
            get(handlers::get_flow)
                .put(handlers::update_flow)
                .delete(handlers::delete_flow),
        )
        .route("/flows/{id}/run", post(handlers::run_flow))
        .route("/flows/{id}/runs", get(handlers::get_runs))
        .route("/runs/{id}", get(handlers::get_run))
}
