// Worker registration, heartbeat, and claim/complete routes
//
// These endpoints are what external worker processes speak; the embedded
// worker pool uses the same store operations in process.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use mel_engine::executor::{StepExecutor, StepResult};
use mel_engine::node::Routing;
use mel_engine::persistence::WorkerInfo;
use mel_engine::{Envelope, NodeError, NodeOutput, WorkflowStore};

use crate::common::{store_status, to_json, WorkerDto};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub executor: Arc<StepExecutor>,
}

/// Request to register a worker
#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterWorkerRequest {
    /// Worker-chosen id; generated when omitted
    pub id: Option<String>,
    pub hostname: String,
}

/// Request to claim work
#[derive(Debug, Deserialize, ToSchema)]
pub struct ClaimWorkRequest {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

fn default_max_items() -> usize {
    10
}

/// A claimed queue item with its lease
#[derive(Debug, Serialize, ToSchema)]
pub struct ClaimedItemDto {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    #[schema(value_type = Object)]
    pub input: serde_json::Value,
    pub lease_expires_at: chrono::DateTime<Utc>,
}

/// Error reported by a remote worker
#[derive(Debug, Deserialize, ToSchema)]
pub struct CompleteWorkError {
    /// transient | permanent | validation | cancelled
    pub kind: String,
    pub message: String,
}

/// Request to complete a claimed item
#[derive(Debug, Deserialize, ToSchema)]
pub struct CompleteWorkRequest {
    /// Output envelope on success
    #[schema(value_type = Object)]
    pub output: Option<serde_json::Value>,
    /// Handles fired by a branching node; defaults to the `out` handle
    pub handles: Option<Vec<String>>,
    pub error: Option<CompleteWorkError>,
}

/// Outcome of a complete-work call
#[derive(Debug, Serialize, ToSchema)]
pub struct CompleteWorkResponse {
    /// completed | retrying | failed | stale
    pub result: String,
}

/// Create worker routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workers", get(list_workers).post(register_worker))
        .route(
            "/v1/workers/:worker_id",
            axum::routing::delete(unregister_worker),
        )
        .route("/v1/workers/:worker_id/heartbeat", put(heartbeat))
        .route("/v1/workers/:worker_id/claim-work", post(claim_work))
        .route(
            "/v1/workers/:worker_id/complete-work/:item_id",
            post(complete_work),
        )
        .with_state(state)
}

/// GET /v1/workers
#[utoipa::path(
    get,
    path = "/v1/workers",
    responses(
        (status = 200, description = "Registered workers", body = Vec<WorkerDto>)
    ),
    tag = "workers"
)]
pub async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerDto>>, StatusCode> {
    let workers = state.store.list_workers().await.map_err(store_status)?;
    Ok(Json(workers.into_iter().map(WorkerDto::from).collect()))
}

/// POST /v1/workers
#[utoipa::path(
    post,
    path = "/v1/workers",
    request_body = RegisterWorkerRequest,
    responses(
        (status = 201, description = "Worker registered", body = WorkerDto)
    ),
    tag = "workers"
)]
pub async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<(StatusCode, Json<WorkerDto>), StatusCode> {
    let now = Utc::now();
    let worker = WorkerInfo {
        id: req
            .id
            .unwrap_or_else(|| format!("worker-{}", Uuid::now_v7())),
        hostname: req.hostname,
        started_at: now,
        last_heartbeat_at: now,
    };

    state
        .store
        .register_worker(&worker)
        .await
        .map_err(store_status)?;

    tracing::info!(worker_id = %worker.id, hostname = %worker.hostname, "worker registered");
    Ok((StatusCode::CREATED, Json(worker.into())))
}

/// DELETE /v1/workers/:worker_id
#[utoipa::path(
    delete,
    path = "/v1/workers/{worker_id}",
    params(("worker_id" = String, Path, description = "Worker ID")),
    responses(
        (status = 204, description = "Worker unregistered, leases released"),
        (status = 404, description = "Unknown worker")
    ),
    tag = "workers"
)]
pub async fn unregister_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .store
        .unregister_worker(&worker_id)
        .await
        .map_err(store_status)?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /v1/workers/:worker_id/heartbeat
#[utoipa::path(
    put,
    path = "/v1/workers/{worker_id}/heartbeat",
    params(("worker_id" = String, Path, description = "Worker ID")),
    responses(
        (status = 200, description = "Heartbeat recorded"),
        (status = 404, description = "Unknown worker")
    ),
    tag = "workers"
)]
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .store
        .heartbeat_worker(&worker_id)
        .await
        .map_err(store_status)?;
    Ok(StatusCode::OK)
}

/// POST /v1/workers/:worker_id/claim-work
#[utoipa::path(
    post,
    path = "/v1/workers/{worker_id}/claim-work",
    params(("worker_id" = String, Path, description = "Worker ID")),
    request_body = ClaimWorkRequest,
    responses(
        (status = 200, description = "Claimed items with leases", body = Vec<ClaimedItemDto>)
    ),
    tag = "workers"
)]
pub async fn claim_work(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    Json(req): Json<ClaimWorkRequest>,
) -> Result<Json<Vec<ClaimedItemDto>>, StatusCode> {
    let lease = state.executor.platform().config().lease_duration;
    let claimed = state
        .store
        .claim(&worker_id, req.max_items, lease)
        .await
        .map_err(store_status)?;

    let dtos = claimed
        .into_iter()
        .map(|item| {
            Ok(ClaimedItemDto {
                id: item.id,
                run_id: item.run_id,
                step_id: item.step_id,
                node_id: item.node_id.clone(),
                attempt: item.attempt,
                input: to_json(&item.input)?,
                lease_expires_at: item.lease_expires_at,
            })
        })
        .collect::<Result<Vec<_>, StatusCode>>()?;

    Ok(Json(dtos))
}

/// POST /v1/workers/:worker_id/complete-work/:item_id
#[utoipa::path(
    post,
    path = "/v1/workers/{worker_id}/complete-work/{item_id}",
    params(
        ("worker_id" = String, Path, description = "Worker ID"),
        ("item_id" = Uuid, Path, description = "Claimed queue item ID")
    ),
    request_body = CompleteWorkRequest,
    responses(
        (status = 200, description = "Outcome recorded", body = CompleteWorkResponse),
        (status = 404, description = "Item not found"),
        (status = 409, description = "Stale claim"),
        (status = 422, description = "Malformed outcome")
    ),
    tag = "workers"
)]
pub async fn complete_work(
    State(state): State<AppState>,
    Path((worker_id, item_id)): Path<(String, Uuid)>,
    Json(req): Json<CompleteWorkRequest>,
) -> Result<Json<CompleteWorkResponse>, StatusCode> {
    let item = state
        .store
        .get_claimed_item(item_id)
        .await
        .map_err(store_status)?;
    let run = state
        .store
        .get_run(item.run_id)
        .await
        .map_err(store_status)?;

    let result = match req.error {
        Some(error) => {
            let node_error = match error.kind.as_str() {
                "transient" => NodeError::Transient(error.message),
                "permanent" => NodeError::Permanent(error.message),
                "validation" => NodeError::Validation(error.message),
                "cancelled" => NodeError::Cancelled,
                _ => return Err(StatusCode::UNPROCESSABLE_ENTITY),
            };

            let envelope = parse_envelope(req.output)?.unwrap_or_else(|| item.input.clone());
            state
                .executor
                .apply_failure(&worker_id, &item, &run, envelope, node_error)
                .await
                .map_err(|e| {
                    tracing::error!("complete-work failed: {}", e);
                    StatusCode::INTERNAL_SERVER_ERROR
                })?
        }
        None => {
            let envelope =
                parse_envelope(req.output)?.ok_or(StatusCode::UNPROCESSABLE_ENTITY)?;
            let version = state
                .store
                .get_version(run.version_id)
                .await
                .map_err(store_status)?;

            let routing = match req.handles {
                Some(handles) => Routing::Handles(handles),
                None => Routing::Default,
            };
            let output = NodeOutput {
                output: envelope,
                routing,
            };

            state
                .executor
                .apply_success(&worker_id, &item, &run, &version.graph, output)
                .await
                .map_err(|e| {
                    tracing::error!("complete-work failed: {}", e);
                    StatusCode::INTERNAL_SERVER_ERROR
                })?
        }
    };

    let result = match result {
        StepResult::Completed => "completed",
        StepResult::Retrying { .. } => "retrying",
        StepResult::Failed => "failed",
        StepResult::Stale => "stale",
        StepResult::Abandoned => "abandoned",
    };

    Ok(Json(CompleteWorkResponse {
        result: result.to_string(),
    }))
}

fn parse_envelope(value: Option<serde_json::Value>) -> Result<Option<Envelope>, StatusCode> {
    value
        .map(|v| {
            serde_json::from_value(v).map_err(|e| {
                tracing::warn!("malformed output envelope: {}", e);
                StatusCode::UNPROCESSABLE_ENTITY
            })
        })
        .transpose()
}
