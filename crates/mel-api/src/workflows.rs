// Workflow CRUD, version deploy, and run execution routes

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use mel_engine::coordinator::{RunCoordinator, StartRun};
use mel_engine::graph::Graph;
use mel_engine::persistence::FailurePolicy;
use mel_engine::{NodeRegistry, WorkflowStore};

use crate::common::{coordinator_status, store_status, RunDto, VersionDto, WorkflowDto};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub coordinator: Arc<RunCoordinator>,
    pub registry: Arc<NodeRegistry>,
}

/// Request to create a workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateWorkflowRequest {
    pub name: String,
}

/// Request to deploy the draft graph as a new immutable version
#[derive(Debug, Deserialize, ToSchema)]
pub struct DeployVersionRequest {
    /// Graph snapshot: { nodes: [...], edges: [...] }
    #[schema(value_type = Object)]
    pub graph: serde_json::Value,
    #[serde(default = "default_semver")]
    pub semver: String,
}

fn default_semver() -> String {
    "0.1.0".to_string()
}

/// Request to start a run
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExecuteWorkflowRequest {
    /// Input payload delivered to the entry node(s)
    #[serde(default)]
    #[schema(value_type = Object)]
    pub input: serde_json::Value,
    /// Start from this node instead of the entry points
    pub start_node_id: Option<String>,
    /// Execute a specific version; defaults to the latest
    pub version_id: Option<Uuid>,
    /// fail_run (default) or continue_siblings
    pub failure_policy: Option<String>,
    /// Per-run step ceiling override
    pub max_steps: Option<i64>,
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", get(list_workflows).post(create_workflow))
        .route("/v1/workflows/:workflow_id", get(get_workflow))
        .route("/v1/workflows/:workflow_id/versions", post(deploy_version))
        .route("/v1/workflows/:workflow_id/execute", post(execute_workflow))
        .route("/v1/node-types", get(list_node_types))
        .with_state(state)
}

/// GET /v1/workflows
#[utoipa::path(
    get,
    path = "/v1/workflows",
    responses(
        (status = 200, description = "List of workflows", body = Vec<WorkflowDto>),
        (status = 500, description = "Internal server error")
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkflowDto>>, StatusCode> {
    let workflows = state.store.list_workflows().await.map_err(store_status)?;
    let dtos = workflows
        .into_iter()
        .map(WorkflowDto::from_workflow)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(dtos))
}

/// POST /v1/workflows
#[utoipa::path(
    post,
    path = "/v1/workflows",
    request_body = CreateWorkflowRequest,
    responses(
        (status = 201, description = "Workflow created", body = WorkflowDto),
        (status = 500, description = "Internal server error")
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowDto>), StatusCode> {
    let workflow = state
        .coordinator
        .create_workflow(&req.name)
        .await
        .map_err(coordinator_status)?;

    tracing::info!(workflow_id = %workflow.id, name = %req.name, "created workflow");
    Ok((StatusCode::CREATED, Json(WorkflowDto::from_workflow(workflow)?)))
}

/// GET /v1/workflows/:workflow_id
#[utoipa::path(
    get,
    path = "/v1/workflows/{workflow_id}",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Workflow found", body = WorkflowDto),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<WorkflowDto>, StatusCode> {
    let workflow = state
        .store
        .get_workflow(workflow_id)
        .await
        .map_err(store_status)?;
    Ok(Json(WorkflowDto::from_workflow(workflow)?))
}

/// POST /v1/workflows/:workflow_id/versions
#[utoipa::path(
    post,
    path = "/v1/workflows/{workflow_id}/versions",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    request_body = DeployVersionRequest,
    responses(
        (status = 201, description = "Version deployed", body = VersionDto),
        (status = 404, description = "Workflow not found"),
        (status = 422, description = "Graph failed validation")
    ),
    tag = "workflows"
)]
pub async fn deploy_version(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<DeployVersionRequest>,
) -> Result<(StatusCode, Json<VersionDto>), StatusCode> {
    let graph: Graph = serde_json::from_value(req.graph).map_err(|e| {
        tracing::warn!(%workflow_id, "malformed graph: {}", e);
        StatusCode::UNPROCESSABLE_ENTITY
    })?;

    let version = state
        .coordinator
        .deploy_version(workflow_id, graph, &req.semver)
        .await
        .map_err(coordinator_status)?;

    Ok((StatusCode::CREATED, Json(version.into())))
}

/// POST /v1/workflows/:workflow_id/execute
#[utoipa::path(
    post,
    path = "/v1/workflows/{workflow_id}/execute",
    params(("workflow_id" = Uuid, Path, description = "Workflow ID")),
    request_body = ExecuteWorkflowRequest,
    responses(
        (status = 201, description = "Run started", body = RunDto),
        (status = 404, description = "Workflow or version not found"),
        (status = 422, description = "No entry point or bad start node")
    ),
    tag = "workflows"
)]
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<ExecuteWorkflowRequest>,
) -> Result<(StatusCode, Json<RunDto>), StatusCode> {
    let version_id = match req.version_id {
        Some(version_id) => version_id,
        None => state
            .store
            .latest_version(workflow_id)
            .await
            .map_err(store_status)?
            .ok_or(StatusCode::NOT_FOUND)?
            .id,
    };

    let failure_policy = match req.failure_policy.as_deref() {
        Some(policy) => policy
            .parse::<FailurePolicy>()
            .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?,
        None => FailurePolicy::default(),
    };

    let mut start = StartRun::new(version_id, req.input).with_failure_policy(failure_policy);
    if let Some(node_id) = req.start_node_id {
        start = start.with_start_node(node_id);
    }
    if let Some(max_steps) = req.max_steps {
        start = start.with_max_steps(max_steps);
    }

    let run = state
        .coordinator
        .start_run(start)
        .await
        .map_err(coordinator_status)?;

    tracing::info!(run_id = %run.id, %workflow_id, "run started");
    Ok((StatusCode::CREATED, Json(run.into())))
}

/// GET /v1/node-types
#[utoipa::path(
    get,
    path = "/v1/node-types",
    responses(
        (status = 200, description = "Catalog of registered node types")
    ),
    tag = "workflows"
)]
pub async fn list_node_types(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let definitions = state.registry.definitions();
    Ok(Json(serde_json::to_value(definitions).map_err(|e| {
        tracing::error!("serialization failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?))
}
