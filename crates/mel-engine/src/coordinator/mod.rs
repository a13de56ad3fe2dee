//! Run coordinator
//!
//! Owns the run state machine: starting, pausing, resuming and cancelling
//! runs, retrying failed steps, and the settle reaper that promotes drained
//! runs to their terminal state.

use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::envelope::Envelope;
use crate::graph::{Graph, GraphError, Workflow, WorkflowVersion};
use crate::node::NodeRegistry;
use crate::persistence::{
    FailurePolicy, NewRun, RunState, StepEnqueue, StepState, StoreError, WorkflowRun,
    WorkflowStore,
};

/// Errors from coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("graph validation failed: {0}")]
    Graph(#[from] GraphError),

    /// The referenced version snapshot does not exist
    #[error("invalid version: {0}")]
    InvalidVersion(Uuid),

    /// No start node given and the graph declares no entry points
    #[error("no entry point in version {0}")]
    NoEntryPoint(Uuid),

    /// Explicit start node is not part of the version's graph
    #[error("start node {node} not found in version {version}")]
    UnknownStartNode { version: Uuid, node: String },

    /// RetryStep only applies to failed steps
    #[error("step {step} is {state}, only failed steps can be retried")]
    StepNotRetryable { step: Uuid, state: StepState },

    /// Terminal runs produce no further steps
    #[error("run {run} is {state}")]
    RunTerminal { run: Uuid, state: RunState },
}

/// Parameters for starting a run
#[derive(Debug, Clone)]
pub struct StartRun {
    pub version_id: Uuid,
    pub input: serde_json::Value,
    /// Start from this node instead of the version's entry points
    pub start_node_id: Option<String>,
    pub failure_policy: FailurePolicy,
    /// Per-run step ceiling; falls back to the configured default
    pub max_steps: Option<i64>,
}

impl StartRun {
    pub fn new(version_id: Uuid, input: serde_json::Value) -> Self {
        Self {
            version_id,
            input,
            start_node_id: None,
            failure_policy: FailurePolicy::default(),
            max_steps: None,
        }
    }

    pub fn with_start_node(mut self, node_id: impl Into<String>) -> Self {
        self.start_node_id = Some(node_id.into());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_max_steps(mut self, max_steps: i64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// Coordinates run lifecycles over the store
pub struct RunCoordinator {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<NodeRegistry>,
    config: EngineConfig,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<NodeRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    // =========================================================================
    // Workflows & versions
    // =========================================================================

    pub async fn create_workflow(&self, name: &str) -> Result<Workflow, CoordinatorError> {
        Ok(self.store.create_workflow(name).await?)
    }

    /// Validate the graph and freeze it into an immutable version.
    #[instrument(skip(self, graph))]
    pub async fn deploy_version(
        &self,
        workflow_id: Uuid,
        graph: Graph,
        semver: &str,
    ) -> Result<WorkflowVersion, CoordinatorError> {
        graph.validate(&self.registry)?;
        let version = self.store.deploy_version(workflow_id, graph, semver).await?;
        info!(%workflow_id, version = version.version, semver, "deployed workflow version");
        Ok(version)
    }

    // =========================================================================
    // Run lifecycle
    // =========================================================================

    /// Start a run against a frozen version snapshot.
    ///
    /// Creates the run in `pending`, enqueues one step for the start node (or
    /// each entry-point node when none is given), then flips the run to
    /// `running`.
    #[instrument(skip(self, request), fields(version_id = %request.version_id))]
    pub async fn start_run(&self, request: StartRun) -> Result<WorkflowRun, CoordinatorError> {
        let version = match self.store.get_version(request.version_id).await {
            Ok(version) => version,
            Err(StoreError::VersionNotFound(id)) => {
                return Err(CoordinatorError::InvalidVersion(id))
            }
            Err(e) => return Err(e.into()),
        };

        let start_nodes: Vec<String> = match &request.start_node_id {
            Some(node_id) => {
                let node = version.graph.node(node_id).ok_or_else(|| {
                    CoordinatorError::UnknownStartNode {
                        version: version.id,
                        node: node_id.clone(),
                    }
                })?;
                vec![node.id.clone()]
            }
            None => {
                let entries = version.graph.entry_points(&self.registry);
                if entries.is_empty() {
                    return Err(CoordinatorError::NoEntryPoint(version.id));
                }
                entries.iter().map(|n| n.id.clone()).collect()
            }
        };

        let run_id = Uuid::now_v7();
        let input = Envelope::new(version.workflow_id, run_id, request.input);

        let run = self
            .store
            .create_run(NewRun {
                id: run_id,
                workflow_id: version.workflow_id,
                version_id: version.id,
                input: input.clone(),
                failure_policy: request.failure_policy,
                max_steps: request.max_steps.unwrap_or(self.config.run_max_steps),
            })
            .await?;

        for node_id in &start_nodes {
            self.store
                .enqueue(StepEnqueue::immediate(run_id, node_id, input.fork()))
                .await?;
        }

        let run = self
            .store
            .update_run_state(run.id, RunState::Running, None)
            .await?;

        info!(%run_id, workflow_id = %version.workflow_id, entry_nodes = ?start_nodes, "started run");
        Ok(run)
    }

    /// `running -> paused`. Workers stop receiving leases for the run's
    /// items; in-flight steps finish and their successors enqueue unclaimed.
    #[instrument(skip(self))]
    pub async fn pause_run(&self, run_id: Uuid) -> Result<WorkflowRun, CoordinatorError> {
        let run = self
            .store
            .update_run_state(run_id, RunState::Paused, None)
            .await?;
        info!(%run_id, "paused run");
        Ok(run)
    }

    /// `paused -> running`. Idempotent.
    #[instrument(skip(self))]
    pub async fn resume_run(&self, run_id: Uuid) -> Result<WorkflowRun, CoordinatorError> {
        let run = self
            .store
            .update_run_state(run_id, RunState::Running, None)
            .await?;
        info!(%run_id, "resumed run");
        Ok(run)
    }

    /// Cancel a run. Queue items are dropped and step history preserved;
    /// in-flight steps complete into the cancelled run without successors.
    /// Cancelling an already-cancelled run is a no-op success.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<WorkflowRun, CoordinatorError> {
        let run = self
            .store
            .update_run_state(run_id, RunState::Cancelled, None)
            .await?;
        info!(%run_id, "cancelled run");
        Ok(run)
    }

    /// Re-enqueue a failed step with attempt + 1 and its original input.
    #[instrument(skip(self))]
    pub async fn retry_step(&self, step_id: Uuid) -> Result<Uuid, CoordinatorError> {
        let step = self.store.get_step(step_id).await?;
        if step.state != StepState::Failed {
            return Err(CoordinatorError::StepNotRetryable {
                step: step_id,
                state: step.state,
            });
        }

        let run = self.store.get_run(step.run_id).await?;
        if run.state.is_terminal() {
            return Err(CoordinatorError::RunTerminal {
                run: run.id,
                state: run.state,
            });
        }

        let item_id = self
            .store
            .enqueue(StepEnqueue {
                run_id: step.run_id,
                node_id: step.node_id.clone(),
                input: step.input.fork(),
                attempt: step.attempt + 1,
                ready_at: chrono::Utc::now(),
            })
            .await?;

        info!(%step_id, %item_id, attempt = step.attempt + 1, "retrying failed step");
        Ok(item_id)
    }

    // =========================================================================
    // Settle reaper
    // =========================================================================

    /// Promote drained `running` runs to their terminal state: `failed` when
    /// a terminal step failure was recorded, `completed` otherwise. Called
    /// periodically by the worker pool's reaper loop.
    pub async fn settle_runs(&self) -> Result<usize, CoordinatorError> {
        let settled = self.store.find_settled_runs().await?;
        let count = settled.len();

        for run in settled {
            let target = if run.error.is_some() {
                RunState::Failed
            } else {
                RunState::Completed
            };
            match self
                .store
                .update_run_state(run.run_id, target, run.error)
                .await
            {
                Ok(_) => debug!(run_id = %run.run_id, state = %target, "settled run"),
                // Lost a race with another settler or a cancel; fine.
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(count)
    }
}
