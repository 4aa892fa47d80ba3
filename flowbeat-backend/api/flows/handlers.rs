use axum::Json;
use axum::extract::{Path, Query, State};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::{ApiError, AppState, store_error};
use crate::flows::coordinator::ExecuteError;
use crate::flows::error::StoreError;
use crate::flows::history::FlowRun;
use crate::flows::{Flow, FlowUpdate, NewFlow};

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    name: Option<String>,
}

pub(crate) async fn list_flows(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let flows = match query.name {
        Some(name) => state
            .flow_repo
            .get_flow_by_name(&name)
            .await
            .map_err(store_error)?
            .into_iter()
            .collect(),
        None => state.flow_repo.list_flows().await.map_err(store_error)?,
    };
    Ok(Json(json!({ "flows": flows })))
}

pub(crate) async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Flow>, ApiError> {
    let flow = state
        .flow_repo
        .get_flow(&id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| store_error(StoreError::FlowNotFound(id)))?;
    Ok(Json(flow))
}

pub(crate) async fn create_flow(
    State(state): State<AppState>,
    Json(body): Json<NewFlow>,
) -> Result<(StatusCode, Json<Flow>), ApiError> {
    let flow = state.flow_repo.create_flow(body).await.map_err(store_error)?;
    tracing::info!(flow = %flow.name, flow_id = %flow.id, "Flow created");
    Ok((StatusCode::CREATED, Json(flow)))
}

pub(crate) async fn update_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FlowUpdate>,
) -> Result<Json<Flow>, ApiError> {
    let flow = state
        .flow_repo
        .update_flow(&id, body)
        .await
        .map_err(store_error)?;
    Ok(Json(flow))
}

pub(crate) async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.flow_repo.delete_flow(&id).await.map_err(store_error)? {
        tracing::info!(flow_id = %id, "Flow deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(store_error(StoreError::FlowNotFound(id)))
    }
}

#[derive(Deserialize)]
pub(crate) struct RunsQuery {
    limit: Option<usize>,
}

pub(crate) async fn get_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Value>, ApiError> {
    if state
        .flow_repo
        .get_flow(&id)
        .await
        .map_err(store_error)?
        .is_none()
    {
        return Err(store_error(StoreError::FlowNotFound(id)));
    }

    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    let runs = state
        .flow_repo
        .list_runs(&id, limit)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({ "runs": runs })))
}

pub(crate) async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlowRun>, ApiError> {
    let run = state
        .flow_repo
        .get_run(&id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| store_error(StoreError::RunNotFound(id)))?;
    Ok(Json(run))
}

/// Execute one flow now, outside the heartbeat. The run is recorded like any
/// other; a failed run answers 500 with the recorded error.
pub(crate) async fn run_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlowRun>, ApiError> {
    let flow = state
        .flow_repo
        .get_flow(&id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| store_error(StoreError::FlowNotFound(id)))?;

    tracing::info!(flow = %flow.name, flow_id = %flow.id, "Manual run requested");
    match state.coordinator.execute(&flow).await {
        Ok(run) => Ok(Json(run)),
        Err(ExecuteError::Failed(failure)) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": failure.message, "status": "failed" })),
        )),
        Err(ExecuteError::Store(e)) => Err(store_error(e)),
    }
}
