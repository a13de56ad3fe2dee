// Run inspection and lifecycle routes

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use mel_engine::coordinator::RunCoordinator;
use mel_engine::persistence::{RunFilter, RunState};
use mel_engine::WorkflowStore;

use crate::common::{coordinator_status, store_status, RunDto, StepDto};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub coordinator: Arc<RunCoordinator>,
}

/// Query parameters for listing runs
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListRunsParams {
    pub workflow_id: Option<Uuid>,
    pub state: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Create run routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflow-runs", get(list_runs))
        .route("/v1/workflow-runs/:run_id", get(get_run))
        .route("/v1/workflow-runs/:run_id/steps", get(list_steps))
        .route("/v1/workflow-runs/:run_id/pause", post(pause_run))
        .route("/v1/workflow-runs/:run_id/resume", post(resume_run))
        .route("/v1/workflow-runs/:run_id/cancel", post(cancel_run))
        .route("/v1/workflow-steps/:step_id/retry", post(retry_step))
        .with_state(state)
}

/// GET /v1/workflow-runs
#[utoipa::path(
    get,
    path = "/v1/workflow-runs",
    params(
        ("workflow_id" = Option<Uuid>, Query, description = "Filter by workflow"),
        ("state" = Option<String>, Query, description = "Filter by run state"),
        ("limit" = Option<i64>, Query, description = "Max results (default 50)"),
        ("offset" = Option<i64>, Query, description = "Pagination offset")
    ),
    responses(
        (status = 200, description = "List of runs", body = Vec<RunDto>),
        (status = 422, description = "Unknown state filter")
    ),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<Vec<RunDto>>, StatusCode> {
    let state_filter = match params.state.as_deref() {
        Some(value) => Some(
            value
                .parse::<RunState>()
                .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?,
        ),
        None => None,
    };

    let runs = state
        .store
        .list_runs(RunFilter {
            workflow_id: params.workflow_id,
            state: state_filter,
            limit: params.limit,
            offset: params.offset,
        })
        .await
        .map_err(store_status)?;

    Ok(Json(runs.into_iter().map(RunDto::from).collect()))
}

/// GET /v1/workflow-runs/:run_id
#[utoipa::path(
    get,
    path = "/v1/workflow-runs/{run_id}",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run found", body = RunDto),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDto>, StatusCode> {
    let run = state.store.get_run(run_id).await.map_err(store_status)?;
    Ok(Json(run.into()))
}

/// GET /v1/workflow-runs/:run_id/steps
#[utoipa::path(
    get,
    path = "/v1/workflow-runs/{run_id}/steps",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Ordered step history", body = Vec<StepDto>),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn list_steps(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Vec<StepDto>>, StatusCode> {
    // 404 for a run that never existed rather than an empty list.
    state.store.get_run(run_id).await.map_err(store_status)?;

    let steps = state.store.list_steps(run_id).await.map_err(store_status)?;
    let dtos = steps
        .into_iter()
        .map(StepDto::from_step)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(dtos))
}

/// POST /v1/workflow-runs/:run_id/pause
#[utoipa::path(
    post,
    path = "/v1/workflow-runs/{run_id}/pause",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run paused", body = RunDto),
        (status = 404, description = "Run not found"),
        (status = 409, description = "Run is not pausable")
    ),
    tag = "runs"
)]
pub async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDto>, StatusCode> {
    let run = state
        .coordinator
        .pause_run(run_id)
        .await
        .map_err(coordinator_status)?;
    Ok(Json(run.into()))
}

/// POST /v1/workflow-runs/:run_id/resume
#[utoipa::path(
    post,
    path = "/v1/workflow-runs/{run_id}/resume",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run resumed", body = RunDto),
        (status = 404, description = "Run not found"),
        (status = 409, description = "Run is not resumable")
    ),
    tag = "runs"
)]
pub async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDto>, StatusCode> {
    let run = state
        .coordinator
        .resume_run(run_id)
        .await
        .map_err(coordinator_status)?;
    Ok(Json(run.into()))
}

/// POST /v1/workflow-runs/:run_id/cancel
#[utoipa::path(
    post,
    path = "/v1/workflow-runs/{run_id}/cancel",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run cancelled", body = RunDto),
        (status = 404, description = "Run not found"),
        (status = 409, description = "Run already completed or failed")
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDto>, StatusCode> {
    let run = state
        .coordinator
        .cancel_run(run_id)
        .await
        .map_err(coordinator_status)?;
    Ok(Json(run.into()))
}

/// POST /v1/workflow-steps/:step_id/retry
#[utoipa::path(
    post,
    path = "/v1/workflow-steps/{step_id}/retry",
    params(("step_id" = Uuid, Path, description = "Step ID")),
    responses(
        (status = 202, description = "Retry enqueued"),
        (status = 404, description = "Step not found"),
        (status = 409, description = "Step is not failed or run is terminal")
    ),
    tag = "runs"
)]
pub async fn retry_step(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    state
        .coordinator
        .retry_step(step_id)
        .await
        .map_err(coordinator_status)?;
    Ok(StatusCode::ACCEPTED)
}
