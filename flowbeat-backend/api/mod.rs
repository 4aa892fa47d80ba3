pub mod flows;
pub mod heartbeat;
pub mod middleware;
mod routes;

use axum::Json;
use axum::Router;
use hyper::StatusCode;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::HeartbeatConfig;
use crate::flows::coordinator::ExecutionCoordinator;
use crate::flows::dispatcher::HeartbeatDispatcher;
use crate::flows::error::StoreError;
use crate::flows::repository::FlowRepository;

#[derive(Clone)]
pub struct AppState {
    pub flow_repo: Arc<dyn FlowRepository>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub dispatcher: Arc<HeartbeatDispatcher>,
    pub heartbeat: Arc<HeartbeatConfig>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn store_error(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::FlowNotFound(_) | StoreError::RunNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => {
            tracing::error!(error = %err, "store operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}
