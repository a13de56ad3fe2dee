//! WorkflowStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::graph::{Graph, Workflow, WorkflowVersion};
use crate::reliability::RetryPolicy;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow version not found: {0}")]
    VersionNotFound(Uuid),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("queue item not found: {0}")]
    ItemNotFound(Uuid),

    /// Complete attempted without a live lease. The item was either
    /// reclaimed, finished by another worker, or the lease expired.
    #[error("stale claim on queue item {item} (held by {holder:?})")]
    StaleClaim { item: Uuid, holder: Option<String> },

    /// Attempted run state change the state machine forbids
    #[error("invalid run transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Run lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Terminal states admit no further transitions and no further steps.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// State machine edges. Same-state transitions are callers' no-ops and
    /// always allowed.
    pub fn can_transition(self, to: RunState) -> bool {
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Cancelled)
                | (Self::Paused, Self::Failed)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// Step lifecycle states; transitions are strictly forward. A retry never
/// reopens a step row, it creates a new one with attempt + 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step state: {other}")),
        }
    }
}

/// What happens to a run when one of its steps terminally fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the run as soon as any step terminally fails
    #[default]
    FailRun,
    /// Let sibling branches finish; the run settles failed afterwards
    ContinueSiblings,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailRun => write!(f, "fail_run"),
            Self::ContinueSiblings => write!(f, "continue_siblings"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_run" => Ok(Self::FailRun),
            "continue_siblings" => Ok(Self::ContinueSiblings),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

/// One execution instance of a frozen workflow version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    pub state: RunState,
    pub input: Envelope,
    pub failure_policy: FailurePolicy,
    /// Per-run loop guard
    pub max_steps: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One attempt of one node within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub state: StepState,
    pub input: Envelope,
    pub output: Option<Envelope>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a run
///
/// The caller supplies the run id so the input envelope's trace can carry it
/// from the start.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    pub input: Envelope,
    pub failure_policy: FailurePolicy,
    pub max_steps: i64,
}

/// A ready step to insert into the queue
#[derive(Debug, Clone)]
pub struct StepEnqueue {
    pub run_id: Uuid,
    pub node_id: String,
    pub input: Envelope,
    pub attempt: u32,
    pub ready_at: DateTime<Utc>,
}

impl StepEnqueue {
    /// First attempt, ready now.
    pub fn immediate(run_id: Uuid, node_id: impl Into<String>, input: Envelope) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            input,
            attempt: 1,
            ready_at: Utc::now(),
        }
    }

    /// Retry enqueue with a backoff delay.
    pub fn retry(
        run_id: Uuid,
        node_id: impl Into<String>,
        input: Envelope,
        attempt: u32,
        delay: Duration,
    ) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            input,
            attempt,
            ready_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
        }
    }
}

/// A queue item handed to a worker under a lease
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedItem {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
    pub input: Envelope,
    pub lease_expires_at: DateTime<Utc>,
}

/// Step outcome recorded by [`WorkflowStore::complete_item`]
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed {
        output: Envelope,
    },
    Failed {
        error: String,
        output: Option<Envelope>,
    },
}

/// Everything that must land atomically when a claimed item finishes:
/// the step outcome, the successor enqueues, and any run transition.
#[derive(Debug, Clone)]
pub struct CompletionPlan {
    pub outcome: StepOutcome,
    /// Successor steps; ignored when the run is already terminal
    pub successors: Vec<StepEnqueue>,
    /// Run state change (e.g. fail-run policy); validated against the
    /// state machine, silently skipped if the run moved on concurrently
    pub run_transition: Option<(RunState, Option<String>)>,
    /// Record a terminal step failure on the run without changing its state
    /// (continue-siblings policy); first error wins
    pub record_run_error: Option<String>,
}

impl CompletionPlan {
    pub fn completed(output: Envelope) -> Self {
        Self {
            outcome: StepOutcome::Completed { output },
            successors: Vec::new(),
            run_transition: None,
            record_run_error: None,
        }
    }

    pub fn failed(error: impl Into<String>, output: Option<Envelope>) -> Self {
        Self {
            outcome: StepOutcome::Failed {
                error: error.into(),
                output,
            },
            successors: Vec::new(),
            run_transition: None,
            record_run_error: None,
        }
    }

    pub fn with_successors(mut self, successors: Vec<StepEnqueue>) -> Self {
        self.successors = successors;
        self
    }

    pub fn with_run_transition(mut self, state: RunState, error: Option<String>) -> Self {
        self.run_transition = Some((state, error));
        self
    }

    pub fn with_run_error(mut self, error: impl Into<String>) -> Self {
        self.record_run_error = Some(error.into());
        self
    }
}

/// An orphaned item returned to the queue by the sweep
#[derive(Debug, Clone)]
pub struct ReclaimedItem {
    pub item_id: Uuid,
    /// Fresh step row created for the reissued attempt
    pub step_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub attempt: u32,
}

/// One recorded delivery into a wait-all node
#[derive(Debug, Clone)]
pub struct JoinDelivery {
    pub edge_id: String,
    pub envelope: Envelope,
    pub arrived_at: DateTime<Utc>,
}

/// Worker registration row. A worker is alive iff its last heartbeat is
/// within the configured timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Filter for listing runs
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub workflow_id: Option<Uuid>,
    pub state: Option<RunState>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            workflow_id: None,
            state: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// A running run with no queued work and no in-flight steps, ready for the
/// reaper to settle
#[derive(Debug, Clone)]
pub struct SettledRun {
    pub run_id: Uuid,
    /// Terminal failure recorded during the run, if any
    pub error: Option<String>,
}

/// Durable state behind the engine
///
/// Implementations must be thread-safe; every compound operation
/// (claim, complete + enqueue, reclaim) is atomic.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflows & versions
    // =========================================================================

    async fn create_workflow(&self, name: &str) -> Result<Workflow, StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    async fn update_draft(&self, id: Uuid, draft: Graph) -> Result<Workflow, StoreError>;

    /// Freeze a graph into an immutable version with the next version number.
    async fn deploy_version(
        &self,
        workflow_id: Uuid,
        graph: Graph,
        semver: &str,
    ) -> Result<WorkflowVersion, StoreError>;

    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, StoreError>;

    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, StoreError>;

    // =========================================================================
    // Runs
    // =========================================================================

    async fn create_run(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, StoreError>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Transition a run. Same-state calls are no-ops; transitions out of a
    /// terminal state return `InvalidTransition`. Entering a terminal state
    /// deletes the run's unclaimed queue items and marks their pending steps
    /// skipped (claimed items drain through complete or the orphan sweep).
    async fn update_run_state(
        &self,
        run_id: Uuid,
        state: RunState,
        error: Option<String>,
    ) -> Result<WorkflowRun, StoreError>;

    /// Number of step rows the run has produced, for the step budget.
    async fn count_steps(&self, run_id: Uuid) -> Result<i64, StoreError>;

    // =========================================================================
    // Steps
    // =========================================================================

    async fn get_step(&self, id: Uuid) -> Result<WorkflowStep, StoreError>;

    /// Step history of a run, ordered by creation.
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError>;

    async fn mark_step_running(&self, step_id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Step queue
    // =========================================================================

    /// Atomically insert a pending step row and its queue item.
    /// Returns the queue item id.
    async fn enqueue(&self, enqueue: StepEnqueue) -> Result<Uuid, StoreError>;

    /// Claim up to `max_items` ready items under a lease.
    ///
    /// Selection is FIFO `(ready_at, id)`; items of paused or cancelled runs
    /// are excluded; expired leases are claimable. `max_items == 0` returns
    /// empty without touching any row.
    async fn claim(
        &self,
        worker_id: &str,
        max_items: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedItem>, StoreError>;

    /// Finish a claimed item: record the step outcome, delete the item, and
    /// insert the successors, all in one transaction. Rejects with
    /// [`StoreError::StaleClaim`] unless the caller holds a live lease.
    async fn complete_item(
        &self,
        worker_id: &str,
        item_id: Uuid,
        plan: CompletionPlan,
    ) -> Result<(), StoreError>;

    /// Sweep items whose lease expired beyond `worker_timeout` or whose
    /// owning worker is dead. Each reclaimed item gets a fresh step row with
    /// attempt + 1 and a `ready_at` backoff; the orphaned step is marked
    /// failed. Items of terminal runs are dropped instead.
    async fn reclaim_orphans(
        &self,
        worker_timeout: Duration,
        backoff: &RetryPolicy,
    ) -> Result<Vec<ReclaimedItem>, StoreError>;

    /// Queue items outstanding for a run.
    async fn queue_depth(&self, run_id: Uuid) -> Result<i64, StoreError>;

    /// Look up a queue item by id (claimed or not). Remote workers completing
    /// over the API use this to rebuild the execution context.
    async fn get_claimed_item(&self, item_id: Uuid) -> Result<ClaimedItem, StoreError>;

    // =========================================================================
    // Wait-all joins
    // =========================================================================

    /// Record one edge delivery into a wait-all node. Returns all deliveries
    /// in arrival order once `required` distinct edges have delivered, at
    /// which point the join state is consumed.
    async fn deliver_join(
        &self,
        run_id: Uuid,
        target_node_id: &str,
        edge_id: &str,
        envelope: &Envelope,
        required: usize,
    ) -> Result<Option<Vec<JoinDelivery>>, StoreError>;

    // =========================================================================
    // Workers
    // =========================================================================

    /// Upsert a worker row; re-registration refreshes metadata.
    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError>;

    /// Refresh the liveness timestamp. `UnknownWorker` if never registered.
    async fn heartbeat_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Clean shutdown: release the worker's leases and remove the row.
    async fn unregister_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError>;

    // =========================================================================
    // Reaper support
    // =========================================================================

    /// Runs in `running` state with no queue items and no pending or running
    /// steps.
    async fn find_settled_runs(&self) -> Result<Vec<SettledRun>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_machine() {
        use RunState::*;

        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Paused.can_transition(Cancelled));

        assert!(!Pending.can_transition(Paused));
        assert!(!Completed.can_transition(Running));
        assert!(!Cancelled.can_transition(Running));
        assert!(!Failed.can_transition(Completed));

        // Same-state is a caller no-op
        assert!(Cancelled.can_transition(Cancelled));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Paused.is_terminal());

        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::Running.is_terminal());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            RunState::Pending,
            RunState::Running,
            RunState::Paused,
            RunState::Completed,
            RunState::Failed,
            RunState::Cancelled,
        ] {
            assert_eq!(state.to_string().parse::<RunState>().unwrap(), state);
        }
        for state in [
            StepState::Pending,
            StepState::Running,
            StepState::Completed,
            StepState::Failed,
            StepState::Skipped,
        ] {
            assert_eq!(state.to_string().parse::<StepState>().unwrap(), state);
        }
    }
}
