//! In-memory implementation of WorkflowStore
//!
//! Primarily for tests and single-process embedding. All state lives behind
//! one lock so compound operations (complete + enqueue, reclaim) get the same
//! atomicity as the Postgres transactions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::envelope::Envelope;
use crate::graph::{Graph, Workflow, WorkflowVersion};
use crate::reliability::RetryPolicy;

#[derive(Debug, Clone)]
struct QueueItemState {
    id: Uuid,
    run_id: Uuid,
    step_id: Uuid,
    node_id: String,
    attempt: u32,
    ready_at: DateTime<Utc>,
    claimed_by: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
}

impl QueueItemState {
    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.claim_expires_at.map(|t| t <= now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    versions: HashMap<Uuid, WorkflowVersion>,
    runs: HashMap<Uuid, WorkflowRun>,
    steps: HashMap<Uuid, WorkflowStep>,
    items: HashMap<Uuid, QueueItemState>,
    joins: HashMap<(Uuid, String), Vec<JoinDelivery>>,
    workers: HashMap<String, WorkerInfo>,
}

impl Inner {
    fn enqueue_locked(&mut self, enqueue: &StepEnqueue) -> Uuid {
        let step_id = Uuid::now_v7();
        let item_id = Uuid::now_v7();

        self.steps.insert(
            step_id,
            WorkflowStep {
                id: step_id,
                run_id: enqueue.run_id,
                node_id: enqueue.node_id.clone(),
                attempt: enqueue.attempt,
                state: StepState::Pending,
                input: enqueue.input.clone(),
                output: None,
                error: None,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
            },
        );
        self.items.insert(
            item_id,
            QueueItemState {
                id: item_id,
                run_id: enqueue.run_id,
                step_id,
                node_id: enqueue.node_id.clone(),
                attempt: enqueue.attempt,
                ready_at: enqueue.ready_at,
                claimed_by: None,
                claim_expires_at: None,
            },
        );

        item_id
    }

    fn apply_run_transition_locked(&mut self, run_id: Uuid, to: RunState, error: Option<String>) {
        let now = Utc::now();
        if let Some(run) = self.runs.get_mut(&run_id) {
            run.state = to;
            if run.error.is_none() {
                run.error = error;
            }
            if to == RunState::Running && run.started_at.is_none() {
                run.started_at = Some(now);
            }
            if to.is_terminal() {
                run.ended_at = Some(now);
            }
        }

        if to.is_terminal() {
            // Drop unclaimed items and skip their pending steps; claimed
            // items drain through complete or the orphan sweep.
            let doomed: Vec<Uuid> = self
                .items
                .values()
                .filter(|i| i.run_id == run_id && (i.claimed_by.is_none() || i.lease_expired(now)))
                .map(|i| i.id)
                .collect();
            for item_id in doomed {
                if let Some(item) = self.items.remove(&item_id) {
                    if let Some(step) = self.steps.get_mut(&item.step_id) {
                        if step.state == StepState::Pending {
                            step.state = StepState::Skipped;
                            step.ended_at = Some(now);
                        }
                    }
                }
            }
            self.joins.retain(|(r, _), _| *r != run_id);
        }
    }
}

/// In-memory implementation of [`WorkflowStore`]
///
/// # Example
///
/// ```
/// use mel_engine::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    inner: RwLock<Inner>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total queue items across runs (for tests).
    pub fn total_queue_depth(&self) -> usize {
        self.inner.read().items.len()
    }

    /// Clear all state (for tests).
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = Inner::default();
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(&self, name: &str) -> Result<Workflow, StoreError> {
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::now_v7(),
            name: name.to_string(),
            draft: Graph::default(),
            created_at: now,
            updated_at: now,
        };
        self.inner
            .write()
            .workflows
            .insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        self.inner
            .read()
            .workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows: Vec<_> = self.inner.read().workflows.values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    async fn update_draft(&self, id: Uuid, draft: Graph) -> Result<Workflow, StoreError> {
        let mut inner = self.inner.write();
        let workflow = inner
            .workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow.draft = draft;
        workflow.updated_at = Utc::now();
        Ok(workflow.clone())
    }

    async fn deploy_version(
        &self,
        workflow_id: Uuid,
        graph: Graph,
        semver: &str,
    ) -> Result<WorkflowVersion, StoreError> {
        let mut inner = self.inner.write();
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }

        let next = inner
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1;

        let version = WorkflowVersion {
            id: Uuid::now_v7(),
            workflow_id,
            version: next,
            semver: semver.to_string(),
            graph,
            created_at: Utc::now(),
        };
        inner.versions.insert(version.id, version.clone());
        Ok(version)
    }

    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, StoreError> {
        self.inner
            .read()
            .versions
            .get(&id)
            .cloned()
            .ok_or(StoreError::VersionNotFound(id))
    }

    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self
            .inner
            .read()
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .max_by_key(|v| v.version)
            .cloned())
    }

    async fn create_run(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError> {
        let run = WorkflowRun {
            id: new_run.id,
            workflow_id: new_run.workflow_id,
            version_id: new_run.version_id,
            state: RunState::Pending,
            input: new_run.input,
            failure_policy: new_run.failure_policy,
            max_steps: new_run.max_steps,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        self.inner.write().runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, StoreError> {
        self.inner
            .read()
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        let inner = self.inner.read();
        let mut runs: Vec<_> = inner
            .runs
            .values()
            .filter(|r| {
                filter.workflow_id.map(|w| r.workflow_id == w).unwrap_or(true)
                    && filter.state.map(|s| r.state == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(runs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn update_run_state(
        &self,
        run_id: Uuid,
        state: RunState,
        error: Option<String>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut inner = self.inner.write();
        let current = inner
            .runs
            .get(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?
            .state;

        if !current.can_transition(state) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: state,
            });
        }

        if current != state {
            inner.apply_run_transition_locked(run_id, state, error);
        }

        inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn count_steps(&self, run_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .count() as i64)
    }

    async fn get_step(&self, id: Uuid) -> Result<WorkflowStep, StoreError> {
        self.inner
            .read()
            .steps
            .get(&id)
            .cloned()
            .ok_or(StoreError::StepNotFound(id))
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let mut steps: Vec<_> = self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(steps)
    }

    async fn mark_step_running(&self, step_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(step) = inner.steps.get_mut(&step_id) {
            if step.state == StepState::Pending {
                step.state = StepState::Running;
                step.started_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn enqueue(&self, enqueue: StepEnqueue) -> Result<Uuid, StoreError> {
        Ok(self.inner.write().enqueue_locked(&enqueue))
    }

    async fn claim(
        &self,
        worker_id: &str,
        max_items: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedItem>, StoreError> {
        if max_items == 0 {
            return Ok(vec![]);
        }

        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let mut inner = self.inner.write();

        let mut claimable: Vec<(DateTime<Utc>, Uuid)> = inner
            .items
            .values()
            .filter(|item| {
                let run_running = inner
                    .runs
                    .get(&item.run_id)
                    .map(|r| r.state == RunState::Running)
                    .unwrap_or(false);
                run_running
                    && item.ready_at <= now
                    && (item.claimed_by.is_none() || item.lease_expired(now))
            })
            .map(|item| (item.ready_at, item.id))
            .collect();
        claimable.sort();
        claimable.truncate(max_items);

        let mut claimed = Vec::with_capacity(claimable.len());
        for (_, item_id) in claimable {
            let step_input = match inner
                .items
                .get(&item_id)
                .and_then(|item| inner.steps.get(&item.step_id))
            {
                Some(step) => step.input.clone(),
                None => continue,
            };
            let Some(item) = inner.items.get_mut(&item_id) else {
                continue;
            };
            item.claimed_by = Some(worker_id.to_string());
            item.claim_expires_at = Some(expires);

            claimed.push(ClaimedItem {
                id: item.id,
                run_id: item.run_id,
                step_id: item.step_id,
                node_id: item.node_id.clone(),
                attempt: item.attempt,
                input: step_input,
                lease_expires_at: expires,
            });
        }

        Ok(claimed)
    }

    async fn complete_item(
        &self,
        worker_id: &str,
        item_id: Uuid,
        plan: CompletionPlan,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let (run_id, step_id) = {
            let item = inner.items.get(&item_id).ok_or(StoreError::StaleClaim {
                item: item_id,
                holder: None,
            })?;
            let lease_is_live =
                item.claimed_by.as_deref() == Some(worker_id) && !item.lease_expired(now);
            if !lease_is_live {
                return Err(StoreError::StaleClaim {
                    item: item_id,
                    holder: item.claimed_by.clone(),
                });
            }
            (item.run_id, item.step_id)
        };

        let run_state = inner
            .runs
            .get(&run_id)
            .map(|r| r.state)
            .ok_or(StoreError::RunNotFound(run_id))?;

        if let Some(step) = inner.steps.get_mut(&step_id) {
            match &plan.outcome {
                StepOutcome::Completed { output } => {
                    step.state = StepState::Completed;
                    step.output = Some(output.clone());
                    step.ended_at = Some(now);
                }
                StepOutcome::Failed { error, output } => {
                    step.state = StepState::Failed;
                    step.error = Some(error.clone());
                    step.output = output.clone();
                    step.ended_at = Some(now);
                }
            }
        }

        inner.items.remove(&item_id);

        if !run_state.is_terminal() {
            for successor in &plan.successors {
                inner.enqueue_locked(successor);
            }

            if let Some(error) = &plan.record_run_error {
                if let Some(run) = inner.runs.get_mut(&run_id) {
                    if run.error.is_none() {
                        run.error = Some(error.clone());
                    }
                }
            }

            if let Some((target, error)) = &plan.run_transition {
                if run_state.can_transition(*target) && run_state != *target {
                    inner.apply_run_transition_locked(run_id, *target, error.clone());
                }
            }
        }

        Ok(())
    }

    async fn reclaim_orphans(
        &self,
        worker_timeout: Duration,
        backoff: &RetryPolicy,
    ) -> Result<Vec<ReclaimedItem>, StoreError> {
        let now = Utc::now();
        let threshold = now - chrono::Duration::from_std(worker_timeout).unwrap_or_default();
        let mut inner = self.inner.write();

        let orphaned: Vec<Uuid> = inner
            .items
            .values()
            .filter(|item| {
                let Some(owner) = &item.claimed_by else {
                    return false;
                };
                let lease_long_gone = item
                    .claim_expires_at
                    .map(|t| t < threshold)
                    .unwrap_or(true);
                let owner_dead = inner
                    .workers
                    .get(owner)
                    .map(|w| w.last_heartbeat_at < threshold)
                    .unwrap_or(true);
                lease_long_gone || owner_dead
            })
            .map(|item| item.id)
            .collect();

        let mut reclaimed = Vec::new();
        for item_id in orphaned {
            let Some((run_id, old_step_id, node_id, attempt)) =
                inner.items.get(&item_id).map(|item| {
                    (
                        item.run_id,
                        item.step_id,
                        item.node_id.clone(),
                        item.attempt,
                    )
                })
            else {
                continue;
            };

            let run_terminal = inner
                .runs
                .get(&run_id)
                .map(|r| r.state.is_terminal())
                .unwrap_or(true);

            if run_terminal {
                inner.items.remove(&item_id);
                if let Some(step) = inner.steps.get_mut(&old_step_id) {
                    if !step.state.is_terminal() {
                        step.state = StepState::Failed;
                        step.error = Some("run ended before execution".to_string());
                        step.ended_at = Some(now);
                    }
                }
                continue;
            }

            let next_attempt = attempt + 1;
            let new_step_id = Uuid::now_v7();
            let Some(input) = inner.steps.get_mut(&old_step_id).map(|step| {
                if !step.state.is_terminal() {
                    step.state = StepState::Failed;
                    step.error = Some("worker lease expired".to_string());
                    step.ended_at = Some(now);
                }
                step.input.clone()
            }) else {
                continue;
            };

            inner.steps.insert(
                new_step_id,
                WorkflowStep {
                    id: new_step_id,
                    run_id,
                    node_id: node_id.clone(),
                    attempt: next_attempt,
                    state: StepState::Pending,
                    input,
                    output: None,
                    error: None,
                    created_at: now,
                    started_at: None,
                    ended_at: None,
                },
            );

            let ready_at = now
                + chrono::Duration::from_std(backoff.delay_for_attempt(next_attempt))
                    .unwrap_or_default();
            let Some(item) = inner.items.get_mut(&item_id) else {
                continue;
            };
            item.step_id = new_step_id;
            item.attempt = next_attempt;
            item.claimed_by = None;
            item.claim_expires_at = None;
            item.ready_at = ready_at;

            reclaimed.push(ReclaimedItem {
                item_id,
                step_id: new_step_id,
                run_id,
                node_id,
                attempt: next_attempt,
            });
        }

        Ok(reclaimed)
    }

    async fn get_claimed_item(&self, item_id: Uuid) -> Result<ClaimedItem, StoreError> {
        let inner = self.inner.read();
        let item = inner
            .items
            .get(&item_id)
            .ok_or(StoreError::ItemNotFound(item_id))?;
        let input = inner
            .steps
            .get(&item.step_id)
            .map(|s| s.input.clone())
            .ok_or(StoreError::StepNotFound(item.step_id))?;

        Ok(ClaimedItem {
            id: item.id,
            run_id: item.run_id,
            step_id: item.step_id,
            node_id: item.node_id.clone(),
            attempt: item.attempt,
            input,
            lease_expires_at: item.claim_expires_at.unwrap_or_else(Utc::now),
        })
    }

    async fn queue_depth(&self, run_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .read()
            .items
            .values()
            .filter(|i| i.run_id == run_id)
            .count() as i64)
    }

    async fn deliver_join(
        &self,
        run_id: Uuid,
        target_node_id: &str,
        edge_id: &str,
        envelope: &Envelope,
        required: usize,
    ) -> Result<Option<Vec<JoinDelivery>>, StoreError> {
        let mut inner = self.inner.write();
        let key = (run_id, target_node_id.to_string());
        let deliveries = inner.joins.entry(key.clone()).or_default();

        let delivery = JoinDelivery {
            edge_id: edge_id.to_string(),
            envelope: envelope.clone(),
            arrived_at: Utc::now(),
        };
        if let Some(existing) = deliveries.iter_mut().find(|d| d.edge_id == edge_id) {
            *existing = delivery;
        } else {
            deliveries.push(delivery);
        }

        if deliveries.len() >= required {
            Ok(inner.joins.remove(&key))
        } else {
            Ok(None)
        }
    }

    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError> {
        self.inner
            .write()
            .workers
            .insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::UnknownWorker(worker_id.to_string()))?;
        worker.last_heartbeat_at = Utc::now();
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for item in inner.items.values_mut() {
            if item.claimed_by.as_deref() == Some(worker_id) {
                item.claimed_by = None;
                item.claim_expires_at = None;
            }
        }
        inner
            .workers
            .remove(worker_id)
            .ok_or_else(|| StoreError::UnknownWorker(worker_id.to_string()))?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let mut workers: Vec<_> = self.inner.read().workers.values().cloned().collect();
        workers.sort_by_key(|w| w.started_at);
        Ok(workers)
    }

    async fn find_settled_runs(&self) -> Result<Vec<SettledRun>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .runs
            .values()
            .filter(|run| {
                run.state == RunState::Running
                    && !inner.items.values().any(|i| i.run_id == run.id)
                    && !inner.steps.values().any(|s| {
                        s.run_id == run.id
                            && matches!(s.state, StepState::Pending | StepState::Running)
                    })
            })
            .map(|run| SettledRun {
                run_id: run.id,
                error: run.error.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded_run(store: &InMemoryWorkflowStore) -> WorkflowRun {
        let workflow = store.create_workflow("test").await.unwrap();
        let version = store
            .deploy_version(workflow.id, Graph::default(), "1.0.0")
            .await
            .unwrap();
        let run_id = Uuid::now_v7();
        let input = Envelope::new(workflow.id, run_id, json!({"n": 1}));
        let run = store
            .create_run(NewRun {
                id: run_id,
                workflow_id: workflow.id,
                version_id: version.id,
                input,
                failure_policy: FailurePolicy::FailRun,
                max_steps: 100,
            })
            .await
            .unwrap();
        store
            .update_run_state(run.id, RunState::Running, None)
            .await
            .unwrap()
    }

    fn input_for(run: &WorkflowRun) -> Envelope {
        Envelope::new(run.workflow_id, run.id, json!({}))
    }

    #[tokio::test]
    async fn test_version_numbers_increase() {
        let store = InMemoryWorkflowStore::new();
        let workflow = store.create_workflow("wf").await.unwrap();

        let v1 = store
            .deploy_version(workflow.id, Graph::default(), "1.0.0")
            .await
            .unwrap();
        let v2 = store
            .deploy_version(workflow.id, Graph::default(), "1.1.0")
            .await
            .unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let latest = store.latest_version(workflow.id).await.unwrap().unwrap();
        assert_eq!(latest.id, v2.id);
    }

    #[tokio::test]
    async fn test_enqueue_creates_pending_step() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;

        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        let steps = store.list_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].state, StepState::Pending);
        assert_eq!(store.queue_depth(run.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_zero_items_is_a_noop() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        let claimed = store
            .claim("w1", 0, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_empty());

        // The item is untouched and claimable afterwards.
        let claimed = store
            .claim("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;

        store
            .enqueue(StepEnqueue::immediate(run.id, "first", input_for(&run)))
            .await
            .unwrap();
        store
            .enqueue(StepEnqueue::immediate(run.id, "second", input_for(&run)))
            .await
            .unwrap();

        let claimed = store
            .claim("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].node_id, "first");

        // The live lease keeps w2 off the first item.
        let claimed = store
            .claim("w2", 2, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].node_id, "second");
    }

    #[tokio::test]
    async fn test_claim_skips_paused_runs() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        store
            .update_run_state(run.id, RunState::Paused, None)
            .await
            .unwrap();
        let claimed = store
            .claim("w1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_empty());

        store
            .update_run_state(run.id, RunState::Running, None)
            .await
            .unwrap();
        let claimed = store
            .claim("w1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_respects_ready_at() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::retry(
                run.id,
                "a",
                input_for(&run),
                2,
                Duration::from_secs(3600),
            ))
            .await
            .unwrap();

        let claimed = store
            .claim("w1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_complete_with_wrong_worker_is_stale() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        let claimed = store
            .claim("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let item = &claimed[0];

        let result = store
            .complete_item(
                "w2",
                item.id,
                CompletionPlan::completed(item.input.clone()),
            )
            .await;
        assert!(matches!(result, Err(StoreError::StaleClaim { .. })));

        // The item was not mutated; w1 can still complete it.
        store
            .complete_item(
                "w1",
                item.id,
                CompletionPlan::completed(item.input.clone()),
            )
            .await
            .unwrap();

        let step = store.get_step(item.step_id).await.unwrap();
        assert_eq!(step.state, StepState::Completed);
        assert_eq!(store.queue_depth(run.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_complete_enqueues_successors_atomically() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        let claimed = store
            .claim("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let item = &claimed[0];

        let plan = CompletionPlan::completed(item.input.clone()).with_successors(vec![
            StepEnqueue::immediate(run.id, "b", input_for(&run)),
            StepEnqueue::immediate(run.id, "c", input_for(&run)),
        ]);
        store.complete_item("w1", item.id, plan).await.unwrap();

        assert_eq!(store.queue_depth(run.id).await.unwrap(), 2);
        assert_eq!(store.count_steps(run.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_terminal_run_suppresses_successors() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        let claimed = store
            .claim("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let item = claimed[0].clone();

        // Cancel while the step is in flight.
        store
            .update_run_state(run.id, RunState::Cancelled, None)
            .await
            .unwrap();

        let plan = CompletionPlan::completed(item.input.clone())
            .with_successors(vec![StepEnqueue::immediate(run.id, "b", input_for(&run))]);
        store.complete_item("w1", item.id, plan).await.unwrap();

        // The in-flight result is persisted, but nothing new was enqueued.
        let step = store.get_step(item.step_id).await.unwrap();
        assert_eq!(step.state, StepState::Completed);
        assert_eq!(store.queue_depth(run.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_skips_pending_steps() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        store
            .update_run_state(run.id, RunState::Cancelled, None)
            .await
            .unwrap();

        let steps = store.list_steps(run.id).await.unwrap();
        assert_eq!(steps[0].state, StepState::Skipped);
        assert_eq!(store.queue_depth(run.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;

        store
            .update_run_state(run.id, RunState::Completed, None)
            .await
            .unwrap();
        let result = store
            .update_run_state(run.id, RunState::Running, None)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));

        // Same-state transition on a terminal run is a no-op success.
        store
            .update_run_state(run.id, RunState::Completed, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reclaim_creates_fresh_attempt() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        // Claimed by a worker that never registered and whose lease is
        // already gone.
        let claimed = store.claim("w1", 1, Duration::ZERO).await.unwrap();
        let item = claimed[0].clone();

        let reclaimed = store
            .reclaim_orphans(Duration::ZERO, &RetryPolicy::fixed(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt, 2);
        assert_ne!(reclaimed[0].step_id, item.step_id);

        let old_step = store.get_step(item.step_id).await.unwrap();
        assert_eq!(old_step.state, StepState::Failed);

        let new_step = store.get_step(reclaimed[0].step_id).await.unwrap();
        assert_eq!(new_step.state, StepState::Pending);
        assert_eq!(new_step.attempt, 2);
        assert_eq!(new_step.input, old_step.input);
    }

    #[tokio::test]
    async fn test_reclaim_leaves_live_leases_alone() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();

        let worker = WorkerInfo {
            id: "w1".to_string(),
            hostname: "host-a".to_string(),
            started_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
        };
        store.register_worker(&worker).await.unwrap();
        store
            .claim("w1", 1, Duration::from_secs(300))
            .await
            .unwrap();

        let reclaimed = store
            .reclaim_orphans(Duration::from_secs(60), &RetryPolicy::exponential())
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_join_gathers_all_edges() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;
        let env = input_for(&run);

        let first = store
            .deliver_join(run.id, "merge-1", "e1", &env, 2)
            .await
            .unwrap();
        assert!(first.is_none());

        let second = store
            .deliver_join(run.id, "merge-1", "e2", &env, 2)
            .await
            .unwrap();
        let deliveries = second.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].edge_id, "e1");
        assert_eq!(deliveries[1].edge_id, "e2");

        // Join state was consumed.
        let again = store
            .deliver_join(run.id, "merge-1", "e1", &env, 2)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let store = InMemoryWorkflowStore::new();

        let result = store.heartbeat_worker("ghost").await;
        assert!(matches!(result, Err(StoreError::UnknownWorker(_))));

        let worker = WorkerInfo {
            id: "w1".to_string(),
            hostname: "host-a".to_string(),
            started_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
        };
        store.register_worker(&worker).await.unwrap();
        // Re-registration is idempotent.
        store.register_worker(&worker).await.unwrap();
        store.heartbeat_worker("w1").await.unwrap();

        assert_eq!(store.list_workers().await.unwrap().len(), 1);

        store.unregister_worker("w1").await.unwrap();
        assert!(store.list_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_settled_runs() {
        let store = InMemoryWorkflowStore::new();
        let run = seeded_run(&store).await;

        // Work outstanding: not settled.
        store
            .enqueue(StepEnqueue::immediate(run.id, "a", input_for(&run)))
            .await
            .unwrap();
        assert!(store.find_settled_runs().await.unwrap().is_empty());

        let claimed = store
            .claim("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        store
            .complete_item(
                "w1",
                claimed[0].id,
                CompletionPlan::completed(claimed[0].input.clone()),
            )
            .await
            .unwrap();

        let settled = store.find_settled_runs().await.unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].run_id, run.id);
        assert!(settled[0].error.is_none());
    }
}
