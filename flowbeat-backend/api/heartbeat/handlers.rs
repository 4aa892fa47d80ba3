use axum::Json;
use axum::extract::State;
use chrono::Utc;
use hyper::StatusCode;
use serde_json::json;

use crate::api::{ApiError, AppState};
use crate::flows::dispatcher::CycleReport;

pub(crate) async fn heartbeat(State(state): State<AppState>) -> Result<Json<CycleReport>, ApiError> {
    state
        .dispatcher
        .run_cycle(Utc::now())
        .await
        .map(Json)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        })
}
