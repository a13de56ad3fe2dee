// Shared DTOs and error mapping for the HTTP surface

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use mel_engine::persistence::{WorkerInfo, WorkflowRun, WorkflowStep};
use mel_engine::{CoordinatorError, StoreError, Workflow, WorkflowVersion};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// Workflow summary
#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowDto {
    pub id: Uuid,
    pub name: String,
    /// Mutable draft graph
    #[schema(value_type = Object)]
    pub draft: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDto {
    pub fn from_workflow(workflow: Workflow) -> Result<Self, StatusCode> {
        Ok(Self {
            id: workflow.id,
            name: workflow.name,
            draft: to_json(&workflow.draft)?,
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
        })
    }
}

/// Frozen version snapshot metadata
#[derive(Debug, Serialize, ToSchema)]
pub struct VersionDto {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub semver: String,
    pub created_at: DateTime<Utc>,
}

impl From<WorkflowVersion> for VersionDto {
    fn from(version: WorkflowVersion) -> Self {
        Self {
            id: version.id,
            workflow_id: version.workflow_id,
            version: version.version,
            semver: version.semver,
            created_at: version.created_at,
        }
    }
}

/// Run details
#[derive(Debug, Serialize, ToSchema)]
pub struct RunDto {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    /// pending | running | paused | completed | failed | cancelled
    pub state: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<WorkflowRun> for RunDto {
    fn from(run: WorkflowRun) -> Self {
        Self {
            id: run.id,
            workflow_id: run.workflow_id,
            version_id: run.version_id,
            state: run.state.to_string(),
            error: run.error,
            created_at: run.created_at,
            started_at: run.started_at,
            ended_at: run.ended_at,
        }
    }
}

/// One step attempt, envelopes included
#[derive(Debug, Serialize, ToSchema)]
pub struct StepDto {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    /// pending | running | completed | failed | skipped
    pub state: String,
    #[schema(value_type = Object)]
    pub input: serde_json::Value,
    #[schema(value_type = Object)]
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepDto {
    pub fn from_step(step: WorkflowStep) -> Result<Self, StatusCode> {
        Ok(Self {
            id: step.id,
            run_id: step.run_id,
            node_id: step.node_id,
            attempt: step.attempt,
            state: step.state.to_string(),
            input: to_json(&step.input)?,
            output: step.output.as_ref().map(to_json).transpose()?,
            error: step.error,
            created_at: step.created_at,
            started_at: step.started_at,
            ended_at: step.ended_at,
        })
    }
}

/// Registered worker
#[derive(Debug, Serialize, ToSchema)]
pub struct WorkerDto {
    pub id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl From<WorkerInfo> for WorkerDto {
    fn from(worker: WorkerInfo) -> Self {
        Self {
            id: worker.id,
            hostname: worker.hostname,
            started_at: worker.started_at,
            last_heartbeat_at: worker.last_heartbeat_at,
        }
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, StatusCode> {
    serde_json::to_value(value).map_err(|e| {
        tracing::error!("serialization failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Map store errors onto HTTP statuses.
pub fn store_status(error: StoreError) -> StatusCode {
    match error {
        StoreError::WorkflowNotFound(_)
        | StoreError::VersionNotFound(_)
        | StoreError::RunNotFound(_)
        | StoreError::StepNotFound(_)
        | StoreError::ItemNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::UnknownWorker(_) => StatusCode::NOT_FOUND,
        StoreError::StaleClaim { .. } | StoreError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        StoreError::Database(_) | StoreError::Serialization(_) => {
            tracing::error!("store error: {}", error);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Map coordinator errors onto HTTP statuses.
pub fn coordinator_status(error: CoordinatorError) -> StatusCode {
    match error {
        CoordinatorError::Store(store_error) => store_status(store_error),
        CoordinatorError::Graph(_)
        | CoordinatorError::NoEntryPoint(_)
        | CoordinatorError::UnknownStartNode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CoordinatorError::InvalidVersion(_) => StatusCode::NOT_FOUND,
        CoordinatorError::StepNotRetryable { .. } | CoordinatorError::RunTerminal { .. } => {
            StatusCode::CONFLICT
        }
    }
}
