//! End-to-end engine scenarios over the built-in node types
//!
//! These drive the coordinator + executor against the in-memory store with a
//! manual claim/execute pump, plus one full worker-pool run for cancellation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use mel_engine::coordinator::{RunCoordinator, StartRun};
use mel_engine::executor::StepExecutor;
use mel_engine::graph::{Edge, Graph, Node, Position};
use mel_engine::persistence::{RunState, StepState};
use mel_engine::worker::{PollerConfig, WorkerPool, WorkerPoolConfig};
use mel_engine::{
    EngineConfig, InMemoryWorkflowStore, RetryPolicy, WorkflowStore,
};
use mel_nodes::builtin_registry;

fn node(id: &str, node_type: &str, params: Vec<(&str, serde_json::Value)>) -> Node {
    Node {
        id: id.to_string(),
        node_type: node_type.to_string(),
        data: params
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
        position: Position::default(),
    }
}

fn edge(id: &str, from: &str, handle: &str, to: &str) -> Edge {
    Edge {
        id: id.to_string(),
        source_node_id: from.to_string(),
        source_handle: handle.to_string(),
        target_node_id: to.to_string(),
        target_handle: "in".to_string(),
    }
}

struct Harness {
    store: Arc<InMemoryWorkflowStore>,
    coordinator: Arc<RunCoordinator>,
    executor: Arc<StepExecutor>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let registry = Arc::new(builtin_registry());
    let config = EngineConfig::default();
    let dyn_store = store.clone() as Arc<dyn WorkflowStore>;

    Harness {
        store: store.clone(),
        coordinator: Arc::new(RunCoordinator::new(
            dyn_store.clone(),
            registry.clone(),
            config.clone(),
        )),
        executor: Arc::new(
            StepExecutor::new(dyn_store, registry, config)
                .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(50))),
        ),
    }
}

impl Harness {
    async fn deploy(&self, graph: Graph) -> uuid::Uuid {
        let workflow = self.coordinator.create_workflow("scenario").await.unwrap();
        self.coordinator
            .deploy_version(workflow.id, graph, "1.0.0")
            .await
            .unwrap()
            .id
    }

    /// Claim and execute until the queue drains (waiting out retry
    /// backoffs), then settle runs.
    async fn drain(&self, worker_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let claimed = self
                .store
                .claim(worker_id, 10, Duration::from_secs(60))
                .await
                .unwrap();

            if claimed.is_empty() {
                if self.store.total_queue_depth() == 0 {
                    break;
                }
                assert!(Instant::now() < deadline, "drain timed out");
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
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

// S1: a linear Inject -> Transform run completes with the transformed data.
#[tokio::test]
async fn scenario_linear_run_completes() {
    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![
                node("inject-1", "inject", vec![("payload", json!({"n": 2}))]),
                node(
                    "transform-1",
                    "transform",
                    vec![("expression", json!("{{ input.n }}x2"))],
                ),
            ],
            edges: vec![edge("e1", "inject-1", "out", "transform-1")],
        })
        .await;

    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})))
        .await
        .unwrap();
    h.drain("w1").await;

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);

    let steps = h.store.list_steps(run.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.state == StepState::Completed));

    let last = steps.iter().find(|s| s.node_id == "transform-1").unwrap();
    assert_eq!(last.output.as_ref().unwrap().data, json!("2x2"));
}

// S2: only the taken branch of an If produces a step row.
#[tokio::test]
async fn scenario_branching_takes_one_path() {
    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![
                node("inject-1", "inject", vec![("payload", json!({"n": 5}))]),
                node(
                    "if-1",
                    "if",
                    vec![("condition", json!("input.n > 3"))],
                ),
                node("log-1", "log", vec![]),
                node("noop-1", "noop", vec![]),
            ],
            edges: vec![
                edge("e1", "inject-1", "out", "if-1"),
                edge("e2", "if-1", "true", "log-1"),
                edge("e3", "if-1", "false", "noop-1"),
            ],
        })
        .await;

    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})))
        .await
        .unwrap();
    h.drain("w1").await;

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);

    let steps = h.store.list_steps(run.id).await.unwrap();
    let log_step = steps.iter().find(|s| s.node_id == "log-1");
    assert!(log_step.is_some());
    assert_eq!(log_step.unwrap().state, StepState::Completed);

    // The false branch never materialized.
    assert!(!steps.iter().any(|s| s.node_id == "noop-1"));
}

// S3: a transiently failing HTTP call retries with backoff and succeeds.
#[tokio::test]
async fn scenario_retry_then_success() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![
                node("inject-1", "inject", vec![]),
                node("http-1", "http_request", vec![("url", json!(server.uri()))]),
            ],
            edges: vec![edge("e1", "inject-1", "out", "http-1")],
        })
        .await;

    let started = Instant::now();
    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})))
        .await
        .unwrap();
    h.drain("w1").await;

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);

    let steps = h.store.list_steps(run.id).await.unwrap();
    let attempts: Vec<_> = steps.iter().filter(|s| s.node_id == "http-1").collect();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attempt, 1);
    assert_eq!(attempts[0].state, StepState::Failed);
    assert_eq!(attempts[1].attempt, 2);
    assert_eq!(attempts[1].state, StepState::Completed);

    // The retry waited out the backoff.
    assert!(started.elapsed() >= Duration::from_millis(50));
}

// S4: a worker that stops heartbeating loses its lease; another worker
// finishes the step.
#[tokio::test]
async fn scenario_worker_crash_recovery() {
    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![node("inject-1", "inject", vec![("payload", json!({"v": 1}))])],
            edges: vec![],
        })
        .await;

    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})))
        .await
        .unwrap();

    // Worker 1 claims with a tiny lease and dies before completing.
    let claimed = h
        .store
        .claim("w-crashed", 1, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let reclaimed = h
        .store
        .reclaim_orphans(Duration::ZERO, &RetryPolicy::fixed(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);

    h.drain("w-survivor").await;

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);

    let steps = h.store.list_steps(run.id).await.unwrap();
    let completed: Vec<_> = steps
        .iter()
        .filter(|s| s.node_id == "inject-1" && s.state == StepState::Completed)
        .collect();
    let failed: Vec<_> = steps
        .iter()
        .filter(|s| s.node_id == "inject-1" && s.state == StepState::Failed)
        .collect();

    // Exactly one completed attempt; the abandoned one is the failed row.
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].attempt, 2);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap().contains("lease expired"));
}

// S5: cancelling during a long delay interrupts the sleep and suppresses
// successors. Runs on a real worker pool so heartbeat cancellation is
// exercised.
#[tokio::test(flavor = "multi_thread")]
async fn scenario_cancel_during_delay() {
    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![
                node("inject-1", "inject", vec![]),
                node("delay-1", "delay", vec![("duration", json!("60s"))]),
                node("after-1", "noop", vec![]),
            ],
            edges: vec![
                edge("e1", "inject-1", "out", "delay-1"),
                edge("e2", "delay-1", "out", "after-1"),
            ],
        })
        .await;

    let pool = WorkerPool::new(
        h.store.clone() as Arc<dyn WorkflowStore>,
        h.coordinator.clone(),
        h.executor.clone(),
        WorkerPoolConfig::default()
            .with_worker_id("pool-worker")
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_reaper_interval(Duration::from_millis(50))
            .with_poller(
                PollerConfig::default()
                    .with_min_interval(Duration::from_millis(10))
                    .with_max_interval(Duration::from_millis(50)),
            ),
    );
    pool.start().await.unwrap();

    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})))
        .await
        .unwrap();

    // Wait until the delay step is in flight.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let steps = h.store.list_steps(run.id).await.unwrap();
        if steps
            .iter()
            .any(|s| s.node_id == "delay-1" && s.state == StepState::Running)
        {
            break;
        }
        assert!(Instant::now() < deadline, "delay step never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    h.coordinator.cancel_run(run.id).await.unwrap();

    // The in-flight delay unwinds well before its 60s sleep.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let steps = h.store.list_steps(run.id).await.unwrap();
        let delay_done = steps
            .iter()
            .any(|s| s.node_id == "delay-1" && s.state.is_terminal());
        if delay_done {
            break;
        }
        assert!(Instant::now() < deadline, "cancellation never reached the delay");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Cancelled);

    let steps = h.store.list_steps(run.id).await.unwrap();
    assert!(!steps.iter().any(|s| s.node_id == "after-1"));
    assert_eq!(h.store.queue_depth(run.id).await.unwrap(), 0);

    pool.shutdown().await.unwrap();
}

// S6: a trivial cycle hits the step budget and fails the run.
#[tokio::test]
async fn scenario_step_budget_exceeded() {
    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![node("loop-1", "inject", vec![("payload", json!({"tick": 1}))])],
            edges: vec![edge("e1", "loop-1", "out", "loop-1")],
        })
        .await;

    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})).with_max_steps(10))
        .await
        .unwrap();
    h.drain("w1").await;

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.error.as_deref().unwrap().contains("step budget"));
    assert_eq!(h.store.count_steps(run.id).await.unwrap(), 10);
    assert_eq!(h.store.queue_depth(run.id).await.unwrap(), 0);
}

// Wait-all merge: both branches deliver before the merge executes once.
#[tokio::test]
async fn scenario_merge_waits_for_all_branches() {
    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![
                node("inject-1", "inject", vec![("payload", json!([1, 2]))]),
                node("left", "noop", vec![]),
                node("right", "noop", vec![]),
                node("merge-1", "merge", vec![("mode", json!("concat"))]),
            ],
            edges: vec![
                edge("e1", "inject-1", "out", "left"),
                edge("e2", "inject-1", "out", "right"),
                edge("e3", "left", "out", "merge-1"),
                edge("e4", "right", "out", "merge-1"),
            ],
        })
        .await;

    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})))
        .await
        .unwrap();
    h.drain("w1").await;

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);

    let steps = h.store.list_steps(run.id).await.unwrap();
    let merges: Vec<_> = steps.iter().filter(|s| s.node_id == "merge-1").collect();
    assert_eq!(merges.len(), 1);

    // Concat of the two branch payloads.
    assert_eq!(
        merges[0].output.as_ref().unwrap().data,
        json!([1, 2, 1, 2])
    );
}

// Fan-out: one successor per array element, loop index on each child trace.
#[tokio::test]
async fn scenario_for_each_fans_out() {
    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![
                node(
                    "inject-1",
                    "inject",
                    vec![("payload", json!({"items": ["a", "b", "c"]}))],
                ),
                node(
                    "each-1",
                    "for_each",
                    vec![("items", json!("input.items"))],
                ),
                node("log-1", "log", vec![]),
            ],
            edges: vec![
                edge("e1", "inject-1", "out", "each-1"),
                edge("e2", "each-1", "out", "log-1"),
            ],
        })
        .await;

    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})))
        .await
        .unwrap();
    h.drain("w1").await;

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);

    let steps = h.store.list_steps(run.id).await.unwrap();
    let logs: Vec<_> = steps.iter().filter(|s| s.node_id == "log-1").collect();
    assert_eq!(logs.len(), 3);

    let mut indexes: Vec<u64> = logs
        .iter()
        .map(|s| s.output.as_ref().unwrap().trace.loop_index.unwrap())
        .collect();
    indexes.sort();
    assert_eq!(indexes, vec![0, 1, 2]);

    let mut payloads: Vec<String> = logs
        .iter()
        .map(|s| s.output.as_ref().unwrap().data.as_str().unwrap().to_string())
        .collect();
    payloads.sort();
    assert_eq!(payloads, vec!["a", "b", "c"]);
}

// Pause holds queued work; resume releases it.
#[tokio::test]
async fn scenario_pause_and_resume() {
    let h = harness();
    let version = h
        .deploy(Graph {
            nodes: vec![
                node("inject-1", "inject", vec![]),
                node("log-1", "log", vec![]),
            ],
            edges: vec![edge("e1", "inject-1", "out", "log-1")],
        })
        .await;

    let run = h
        .coordinator
        .start_run(StartRun::new(version, json!({})))
        .await
        .unwrap();

    h.coordinator.pause_run(run.id).await.unwrap();

    // Nothing claimable while paused.
    let claimed = h
        .store
        .claim("w1", 10, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(claimed.is_empty());

    h.coordinator.resume_run(run.id).await.unwrap();
    h.drain("w1").await;

    let run = h.store.get_run(run.id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
}
