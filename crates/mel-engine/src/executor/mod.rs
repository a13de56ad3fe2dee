//! Step executor
//!
//! Drives one claimed queue item: resolves the node in the run's frozen
//! snapshot, builds the input envelope with its chained trace, invokes the
//! node implementation, then completes the item with the successor enqueues
//! in one transaction.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::envelope::Envelope;
use crate::graph::{Edge, Graph, DEFAULT_OUTPUT_HANDLE};
use crate::node::{
    ExecutionContext, InputPolicy, NodeError, NodeOutput, NodeRegistry, Platform, RegistryError,
    Routing,
};
use crate::persistence::{
    ClaimedItem, CompletionPlan, FailurePolicy, JoinDelivery, RunState, StepEnqueue, StoreError,
    WorkflowRun, WorkflowStore,
};
use crate::reliability::RetryPolicy;

/// Fallback per-step timeout when the node type declares none
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from executor operations
///
/// `Registry`, `UnknownNode` and `StepBudgetExceeded` never escape
/// [`StepExecutor::execute_claimed`]: they are recorded on the step row (and,
/// for the budget, on the run) via their display form. A step or run fails,
/// the process never panics.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Node type missing from the registry at execution time
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Queue item points at a node the frozen snapshot does not contain
    #[error("node {node_id} not in version snapshot of run {run_id}")]
    UnknownNode { run_id: Uuid, node_id: String },

    /// Per-run step ceiling hit; the run fails
    #[error("step budget exceeded for run {run_id} (max {max_steps} steps)")]
    StepBudgetExceeded { run_id: Uuid, max_steps: i64 },
}

/// What happened to one claimed item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Step completed; successors enqueued
    Completed,
    /// Step failed transiently; a retry was enqueued
    Retrying { next_attempt: u32 },
    /// Step failed terminally
    Failed,
    /// Execution hit the step timeout; the lease is left to expire so the
    /// orphan sweep reissues the item
    Abandoned,
    /// Another worker took the item over; nothing was written
    Stale,
}

/// Executes claimed queue items against the node registry
pub struct StepExecutor {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<NodeRegistry>,
    platform: Arc<Platform>,
    config: EngineConfig,
    retry_policy: RetryPolicy,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<NodeRegistry>,
        config: EngineConfig,
    ) -> Self {
        let platform = Arc::new(Platform::new(store.clone(), config.clone()));
        Self {
            store,
            registry,
            platform,
            config,
            retry_policy: RetryPolicy::exponential(),
        }
    }

    /// Override the retry backoff (tests use a zero-delay policy).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Build the execution context for a claimed item. The worker pool keeps
    /// the context's cancellation handle so CancelRun reaches in-flight code.
    pub fn context_for(&self, item: &ClaimedItem) -> ExecutionContext {
        ExecutionContext::new(
            item.input.trace.agent_id,
            item.run_id,
            item.step_id,
            item.attempt,
            self.config.step_max_attempts,
            item.input.variables.clone(),
            self.platform.clone(),
        )
    }

    /// Execute one claimed item end to end.
    #[instrument(skip(self, item, ctx), fields(run_id = %item.run_id, node_id = %item.node_id, attempt = item.attempt))]
    pub async fn execute_claimed(
        &self,
        worker_id: &str,
        item: ClaimedItem,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, ExecutorError> {
        let run = self.store.get_run(item.run_id).await?;
        let version = self.store.get_version(run.version_id).await?;

        let Some(node) = version.graph.node(&item.node_id).cloned() else {
            // The snapshot is frozen, so this points at a corrupted enqueue.
            let error = ExecutorError::UnknownNode {
                run_id: run.id,
                node_id: item.node_id.clone(),
            };
            return self
                .fail_terminally(worker_id, &item, &run, item.input.clone(), &error)
                .await;
        };

        let node_type = match self.registry.resolve(&node.node_type) {
            Ok(node_type) => node_type,
            Err(registry_error) => {
                let error = ExecutorError::from(registry_error);
                return self
                    .fail_terminally(worker_id, &item, &run, item.input.clone(), &error)
                    .await;
            }
        };

        self.store.mark_step_running(item.step_id).await?;

        // The envelope handed to the node carries the chained trace for this
        // step; the stored step input keeps the producer's trace, which is
        // what makes `output.trace.parent == input.trace` hold.
        let mut envelope = item.input.clone();
        let mut trace = envelope
            .trace
            .next(&item.node_id)
            .with_step(item.step_id)
            .with_attempt(item.attempt);
        if let Some(index) = envelope.loop_index() {
            trace = trace.with_loop_index(index);
        }
        envelope.trace = trace;

        let timeout = node_type
            .definition()
            .step_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STEP_TIMEOUT);

        let execution = async {
            tokio::select! {
                result = node_type.execute(ctx, &node, envelope.clone()) => result,
                _ = ctx.cancelled() => Err(NodeError::Cancelled),
            }
        };

        match tokio::time::timeout(timeout, execution).await {
            Err(_) => {
                // Abandon: let the lease expire, the orphan sweep retries.
                warn!(
                    step_id = %item.step_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "step timed out, abandoning claim"
                );
                Ok(StepResult::Abandoned)
            }
            Ok(Ok(output)) => {
                self.apply_success(worker_id, &item, &run, &version.graph, output)
                    .await
            }
            Ok(Err(error)) => {
                self.apply_failure(worker_id, &item, &run, envelope, error)
                    .await
            }
        }
    }

    /// Record a successful execution: route successors per the node output,
    /// honor wait-all joins and the step budget, and complete atomically.
    pub async fn apply_success(
        &self,
        worker_id: &str,
        item: &ClaimedItem,
        run: &WorkflowRun,
        graph: &Graph,
        output: NodeOutput,
    ) -> Result<StepResult, ExecutorError> {
        let mut successors: Vec<StepEnqueue> = Vec::new();

        match &output.routing {
            Routing::Halt => {}
            Routing::Default => {
                for edge in graph.outbound_on(&item.node_id, DEFAULT_OUTPUT_HANDLE) {
                    self.route_edge(run, graph, edge, output.output.fork(), &mut successors)
                        .await?;
                }
            }
            Routing::Handles(handles) => {
                for handle in handles {
                    for edge in graph.outbound_on(&item.node_id, handle) {
                        self.route_edge(run, graph, edge, output.output.fork(), &mut successors)
                            .await?;
                    }
                }
            }
            Routing::FanOut(elements) => {
                for edge in graph.outbound_on(&item.node_id, DEFAULT_OUTPUT_HANDLE) {
                    for element in elements {
                        self.route_edge(run, graph, edge, element.fork(), &mut successors)
                            .await?;
                    }
                }
            }
        }

        // Per-run loop guard: refuse to cross the step ceiling.
        if !successors.is_empty() {
            let produced = self.store.count_steps(run.id).await?;
            if produced + successors.len() as i64 > run.max_steps {
                let error = ExecutorError::StepBudgetExceeded {
                    run_id: run.id,
                    max_steps: run.max_steps,
                };
                warn!(run_id = %run.id, max_steps = run.max_steps, "{error}");
                let plan = CompletionPlan::completed(output.output)
                    .with_run_transition(RunState::Failed, Some(error.to_string()));
                return self.complete(worker_id, item.id, plan, StepResult::Failed).await;
            }
        }

        let plan = CompletionPlan::completed(output.output).with_successors(successors);
        self.complete(worker_id, item.id, plan, StepResult::Completed)
            .await
    }

    /// Record a failed execution: retry transient errors below the attempt
    /// ceiling, otherwise apply the run's failure policy.
    pub async fn apply_failure(
        &self,
        worker_id: &str,
        item: &ClaimedItem,
        run: &WorkflowRun,
        mut envelope: Envelope,
        error: NodeError,
    ) -> Result<StepResult, ExecutorError> {
        envelope.add_error(&item.node_id, error.to_string(), None);
        let message = error.to_string();

        if matches!(error, NodeError::Cancelled) {
            let plan = CompletionPlan::failed("cancelled", Some(envelope));
            return self.complete(worker_id, item.id, plan, StepResult::Failed).await;
        }

        if error.is_retryable() && item.attempt < self.config.step_max_attempts {
            let next_attempt = item.attempt + 1;
            let delay = self.retry_policy.delay_for_attempt(next_attempt);
            debug!(
                step_id = %item.step_id,
                next_attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling retry"
            );

            let retry = StepEnqueue::retry(
                run.id,
                &item.node_id,
                item.input.fork(),
                next_attempt,
                delay,
            );
            let plan = CompletionPlan::failed(message, Some(envelope)).with_successors(vec![retry]);
            return self
                .complete(worker_id, item.id, plan, StepResult::Retrying { next_attempt })
                .await;
        }

        let plan = match run.failure_policy {
            FailurePolicy::FailRun => CompletionPlan::failed(message.clone(), Some(envelope))
                .with_run_transition(RunState::Failed, Some(message)),
            FailurePolicy::ContinueSiblings => {
                CompletionPlan::failed(message.clone(), Some(envelope)).with_run_error(message)
            }
        };
        self.complete(worker_id, item.id, plan, StepResult::Failed).await
    }

    /// Deliver one fired edge: either a plain enqueue, or a join delivery
    /// when the target declares wait-all.
    async fn route_edge(
        &self,
        run: &WorkflowRun,
        graph: &Graph,
        edge: &Edge,
        envelope: Envelope,
        successors: &mut Vec<StepEnqueue>,
    ) -> Result<(), ExecutorError> {
        let policy = graph
            .node(&edge.target_node_id)
            .and_then(|target| self.registry.get(&target.node_type))
            .map(|t| t.definition().input_policy)
            .unwrap_or_default();

        match policy {
            InputPolicy::Any => {
                successors.push(StepEnqueue::immediate(
                    run.id,
                    &edge.target_node_id,
                    envelope,
                ));
            }
            InputPolicy::WaitAll => {
                let required = graph.inbound(&edge.target_node_id).len();
                if let Some(deliveries) = self
                    .store
                    .deliver_join(run.id, &edge.target_node_id, &edge.id, &envelope, required)
                    .await?
                {
                    successors.push(StepEnqueue::immediate(
                        run.id,
                        &edge.target_node_id,
                        assemble_join_input(deliveries),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Record an execution-setup error (unknown node or type) as a terminal
    /// step failure under the run's failure policy.
    async fn fail_terminally(
        &self,
        worker_id: &str,
        item: &ClaimedItem,
        run: &WorkflowRun,
        mut envelope: Envelope,
        error: &ExecutorError,
    ) -> Result<StepResult, ExecutorError> {
        let message = error.to_string();
        envelope.add_error(&item.node_id, &message, None);
        let plan = match run.failure_policy {
            FailurePolicy::FailRun => CompletionPlan::failed(message.clone(), Some(envelope))
                .with_run_transition(RunState::Failed, Some(message)),
            FailurePolicy::ContinueSiblings => {
                CompletionPlan::failed(message.clone(), Some(envelope)).with_run_error(message)
            }
        };
        self.complete(worker_id, item.id, plan, StepResult::Failed).await
    }

    async fn complete(
        &self,
        worker_id: &str,
        item_id: Uuid,
        plan: CompletionPlan,
        on_success: StepResult,
    ) -> Result<StepResult, ExecutorError> {
        match self.store.complete_item(worker_id, item_id, plan).await {
            Ok(()) => Ok(on_success),
            Err(StoreError::StaleClaim { .. }) => {
                // The reclaimer or another worker won; their execution is the
                // one that counts.
                warn!(%item_id, worker_id, "stale claim on complete");
                Ok(StepResult::Stale)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Merge the join deliveries into the wait-all node's input envelope: data is
/// the array of delivered payloads in arrival order, the causal trace comes
/// from the last arrival, maps are unioned first-wins.
fn assemble_join_input(deliveries: Vec<JoinDelivery>) -> Envelope {
    let last = deliveries
        .last()
        .map(|d| d.envelope.clone())
        .unwrap_or_else(|| {
            // deliver_join never returns an empty set; keep a harmless value.
            Envelope::new(Uuid::nil(), Uuid::nil(), serde_json::Value::Null)
        });

    let mut merged = last.fork();
    merged.data = serde_json::Value::Array(
        deliveries.iter().map(|d| d.envelope.data.clone()).collect(),
    );
    merged.data_type = crate::envelope::DataType::Json;

    for delivery in &deliveries {
        for (key, value) in &delivery.envelope.meta {
            merged.meta.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (key, value) in &delivery.envelope.variables {
            merged
                .variables
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        for (name, blob) in &delivery.envelope.binary {
            merged
                .binary
                .entry(name.clone())
                .or_insert_with(|| blob.clone());
        }
    }

    merged.errors = deliveries
        .iter()
        .flat_map(|d| d.envelope.errors.iter().cloned())
        .collect();

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{RunCoordinator, StartRun};
    use crate::graph::{Node, Position};
    use crate::node::{NodeDefinition, NodeType};
    use crate::persistence::{InMemoryWorkflowStore, StepState};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Entry node emitting its configured payload.
    struct Emit;

    #[async_trait]
    impl NodeType for Emit {
        fn definition(&self) -> NodeDefinition {
            NodeDefinition::new("emit", "Emit", "Test").entry_point()
        }

        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            node: &Node,
            envelope: Envelope,
        ) -> Result<NodeOutput, NodeError> {
            let payload = node.param("payload").cloned().unwrap_or(json!(null));
            Ok(NodeOutput::single(envelope.with_data(payload)))
        }
    }

    /// Fails transiently until the given attempt succeeds.
    struct FlakyUntil {
        succeed_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NodeType for FlakyUntil {
        fn definition(&self) -> NodeDefinition {
            NodeDefinition::new("flaky", "Flaky", "Test")
        }

        async fn execute(
            &self,
            ctx: &ExecutionContext,
            _node: &Node,
            envelope: Envelope,
        ) -> Result<NodeOutput, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt < self.succeed_on {
                Err(NodeError::transient("upstream unavailable"))
            } else {
                Ok(NodeOutput::single(envelope))
            }
        }
    }

    /// Fails permanently every time.
    struct AlwaysFails;

    #[async_trait]
    impl NodeType for AlwaysFails {
        fn definition(&self) -> NodeDefinition {
            NodeDefinition::new("always_fails", "AlwaysFails", "Test")
        }

        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _node: &Node,
            _envelope: Envelope,
        ) -> Result<NodeOutput, NodeError> {
            Err(NodeError::permanent("auth rejected"))
        }
    }

    fn graph_node(id: &str, node_type: &str) -> Node {
        Node {
            id: id.into(),
            node_type: node_type.into(),
            data: BTreeMap::new(),
            position: Position::default(),
        }
    }

    fn edge(id: &str, from: &str, to: &str) -> crate::graph::Edge {
        crate::graph::Edge {
            id: id.into(),
            source_node_id: from.into(),
            source_handle: "out".into(),
            target_node_id: to.into(),
            target_handle: "in".into(),
        }
    }

    struct Harness {
        store: Arc<InMemoryWorkflowStore>,
        coordinator: RunCoordinator,
        executor: StepExecutor,
    }

    fn harness(registry: NodeRegistry) -> Harness {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let registry = Arc::new(registry);
        let dyn_store = store.clone() as Arc<dyn WorkflowStore>;
        let config = EngineConfig::default();
        Harness {
            store: store.clone(),
            coordinator: RunCoordinator::new(dyn_store.clone(), registry.clone(), config.clone()),
            executor: StepExecutor::new(dyn_store, registry, config)
                .with_retry_policy(RetryPolicy::fixed(Duration::ZERO)),
        }
    }

    impl Harness {
        /// Claim and execute until the queue drains, then settle.
        async fn drain(&self, worker_id: &str) {
            for _ in 0..100 {
                let claimed = self
                    .store
                    .claim(worker_id, 10, Duration::from_secs(60))
                    .await
                    .unwrap();
                if claimed.is_empty() {
                    break;
                }
                for item in claimed {
                    let ctx = self.executor.context_for(&item);
                    self.executor
                        .execute_claimed(worker_id, item, &ctx)
                        .await
                        .unwrap();
                }
            }
            self.coordinator.settle_runs().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_linear_run_completes_with_trace_chain() {
        let mut registry = NodeRegistry::new();
        registry.register(Emit);
        registry.register(crate::node::test_support::passthrough("noop"));
        let h = harness(registry);

        let workflow = h.coordinator.create_workflow("wf").await.unwrap();
        let mut start = graph_node("start", "emit");
        start.data.insert("payload".into(), json!({"n": 2}));
        let graph = Graph {
            nodes: vec![start, graph_node("end", "noop")],
            edges: vec![edge("e1", "start", "end")],
        };
        let version = h
            .coordinator
            .deploy_version(workflow.id, graph, "1.0.0")
            .await
            .unwrap();

        let run = h
            .coordinator
            .start_run(StartRun::new(version.id, json!({})))
            .await
            .unwrap();
        h.drain("w1").await;

        let run = h.store.get_run(run.id).await.unwrap();
        assert_eq!(run.state, RunState::Completed);

        let steps = h.store.list_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.state == StepState::Completed));

        // Trace invariants: output chains to the stored input.
        for step in &steps {
            let output = step.output.as_ref().unwrap();
            assert_eq!(output.trace.step, step.id);
            assert_eq!(output.trace.node_id, step.node_id);
            assert_eq!(output.trace.parent.as_deref(), Some(&step.input.trace));
        }

        let end_step = steps.iter().find(|s| s.node_id == "end").unwrap();
        assert_eq!(end_step.output.as_ref().unwrap().data, json!({"n": 2}));
        assert_eq!(
            end_step.output.as_ref().unwrap().trace.path(),
            vec!["start", "end"]
        );
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let mut registry = NodeRegistry::new();
        registry.register(Emit);
        registry.register(FlakyUntil {
            succeed_on: 2,
            calls: AtomicU32::new(0),
        });
        let h = harness(registry);

        let workflow = h.coordinator.create_workflow("wf").await.unwrap();
        let graph = Graph {
            nodes: vec![graph_node("start", "emit"), graph_node("f", "flaky")],
            edges: vec![edge("e1", "start", "f")],
        };
        let version = h
            .coordinator
            .deploy_version(workflow.id, graph, "1.0.0")
            .await
            .unwrap();
        let run = h
            .coordinator
            .start_run(StartRun::new(version.id, json!({})))
            .await
            .unwrap();
        h.drain("w1").await;

        let run = h.store.get_run(run.id).await.unwrap();
        assert_eq!(run.state, RunState::Completed);

        let steps = h.store.list_steps(run.id).await.unwrap();
        let flaky_steps: Vec<_> = steps.iter().filter(|s| s.node_id == "f").collect();
        assert_eq!(flaky_steps.len(), 2);
        assert_eq!(flaky_steps[0].attempt, 1);
        assert_eq!(flaky_steps[0].state, StepState::Failed);
        assert_eq!(flaky_steps[1].attempt, 2);
        assert_eq!(flaky_steps[1].state, StepState::Completed);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_run() {
        let mut registry = NodeRegistry::new();
        registry.register(Emit);
        registry.register(AlwaysFails);
        registry.register(crate::node::test_support::passthrough("noop"));
        let h = harness(registry);

        let workflow = h.coordinator.create_workflow("wf").await.unwrap();
        let graph = Graph {
            nodes: vec![
                graph_node("start", "emit"),
                graph_node("bad", "always_fails"),
                graph_node("after", "noop"),
            ],
            edges: vec![edge("e1", "start", "bad"), edge("e2", "bad", "after")],
        };
        let version = h
            .coordinator
            .deploy_version(workflow.id, graph, "1.0.0")
            .await
            .unwrap();
        let run = h
            .coordinator
            .start_run(StartRun::new(version.id, json!({})))
            .await
            .unwrap();
        h.drain("w1").await;

        let run = h.store.get_run(run.id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.as_deref().unwrap().contains("auth rejected"));

        // No successor of the failed node ever ran.
        let steps = h.store.list_steps(run.id).await.unwrap();
        assert!(!steps.iter().any(|s| s.node_id == "after"));

        // The failed step carries the error in its envelope.
        let failed = steps.iter().find(|s| s.node_id == "bad").unwrap();
        let errors = &failed.output.as_ref().unwrap().errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].node_id, "bad");
    }

    #[tokio::test]
    async fn test_unknown_node_type_fails_step_not_panics() {
        let mut registry = NodeRegistry::new();
        registry.register(Emit);
        let h = harness(registry);

        let workflow = h.coordinator.create_workflow("wf").await.unwrap();
        // Deploy bypassing validation (straight to the store) to simulate a
        // version deployed before the type was removed from the process.
        let graph = Graph {
            nodes: vec![graph_node("start", "emit"), graph_node("m", "missing")],
            edges: vec![edge("e1", "start", "m")],
        };
        let version = h
            .store
            .deploy_version(workflow.id, graph, "1.0.0")
            .await
            .unwrap();
        let run = h
            .coordinator
            .start_run(StartRun::new(version.id, json!({})))
            .await
            .unwrap();
        h.drain("w1").await;

        let run = h.store.get_run(run.id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);

        let steps = h.store.list_steps(run.id).await.unwrap();
        let missing = steps.iter().find(|s| s.node_id == "m").unwrap();
        assert_eq!(missing.state, StepState::Failed);
        assert!(missing.error.as_deref().unwrap().contains("unknown node type"));
    }

    #[tokio::test]
    async fn test_step_budget_fails_cyclic_run() {
        let mut registry = NodeRegistry::new();
        registry.register(Emit);
        let h = harness(registry);

        let workflow = h.coordinator.create_workflow("wf").await.unwrap();
        // Trivial cycle: a -> a.
        let graph = Graph {
            nodes: vec![graph_node("a", "emit")],
            edges: vec![edge("e1", "a", "a")],
        };
        let version = h
            .coordinator
            .deploy_version(workflow.id, graph, "1.0.0")
            .await
            .unwrap();

        let run = h
            .coordinator
            .start_run(StartRun::new(version.id, json!({})).with_max_steps(5))
            .await
            .unwrap();
        h.drain("w1").await;

        let run = h.store.get_run(run.id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.as_deref().unwrap().contains("step budget"));
        assert_eq!(h.store.count_steps(run.id).await.unwrap(), 5);
        assert_eq!(h.store.queue_depth(run.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_continue_siblings_policy_settles_failed() {
        let mut registry = NodeRegistry::new();
        registry.register(Emit);
        registry.register(AlwaysFails);
        registry.register(crate::node::test_support::passthrough("noop"));
        let h = harness(registry);

        let workflow = h.coordinator.create_workflow("wf").await.unwrap();
        // Two parallel branches; one fails terminally.
        let graph = Graph {
            nodes: vec![
                graph_node("start", "emit"),
                graph_node("bad", "always_fails"),
                graph_node("good", "noop"),
            ],
            edges: vec![edge("e1", "start", "bad"), edge("e2", "start", "good")],
        };
        let version = h
            .coordinator
            .deploy_version(workflow.id, graph, "1.0.0")
            .await
            .unwrap();
        let run = h
            .coordinator
            .start_run(
                StartRun::new(version.id, json!({}))
                    .with_failure_policy(FailurePolicy::ContinueSiblings),
            )
            .await
            .unwrap();
        h.drain("w1").await;

        let run = h.store.get_run(run.id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);

        // The sibling branch ran to completion despite the failure.
        let steps = h.store.list_steps(run.id).await.unwrap();
        let good = steps.iter().find(|s| s.node_id == "good").unwrap();
        assert_eq!(good.state, StepState::Completed);
    }
}
