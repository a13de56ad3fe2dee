//! Integration tests for PostgresWorkflowStore
//!
//! Run with: TEST_DATABASE_URL=postgres://localhost/mel_test \
//!     cargo test -p mel-engine --test postgres_integration_test -- --test-threads=1
//!
//! Each test is a no-op unless TEST_DATABASE_URL points at a reachable
//! PostgreSQL database. Migrations are applied on first connect.

use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use mel_engine::envelope::Envelope;
use mel_engine::graph::Graph;
use mel_engine::persistence::{
    run_migrations, CompletionPlan, FailurePolicy, NewRun, PostgresWorkflowStore, RunState,
    StepEnqueue, StepState, StoreError, WorkflowRun, WorkflowStore,
};
use mel_engine::reliability::RetryPolicy;

async fn create_test_store() -> Option<PostgresWorkflowStore> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return None;
    };
    let pool = PgPool::connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");
    run_migrations(&pool).await.expect("migrations failed");
    Some(PostgresWorkflowStore::new(pool))
}

async fn seeded_run(store: &PostgresWorkflowStore) -> WorkflowRun {
    let workflow = store.create_workflow("integration").await.unwrap();
    let version = store
        .deploy_version(workflow.id, Graph::default(), "1.0.0")
        .await
        .unwrap();
    let run_id = Uuid::now_v7();
    let run = store
        .create_run(NewRun {
            id: run_id,
            workflow_id: workflow.id,
            version_id: version.id,
            input: Envelope::new(workflow.id, run_id, json!({"n": 1})),
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

#[tokio::test]
async fn test_run_round_trip() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let run = seeded_run(&store).await;
    let fetched = store.get_run(run.id).await.unwrap();

    assert_eq!(fetched.state, RunState::Running);
    assert_eq!(fetched.input.data, json!({"n": 1}));
    assert!(fetched.started_at.is_some());
}

#[tokio::test]
async fn test_claim_complete_cycle() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let run = seeded_run(&store).await;
    let input = Envelope::new(run.workflow_id, run.id, json!({}));
    store
        .enqueue(StepEnqueue::immediate(run.id, "a", input))
        .await
        .unwrap();

    let claimed = store
        .claim("it-worker", 10, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let item = &claimed[0];
    assert_eq!(item.node_id, "a");
    assert_eq!(item.attempt, 1);

    // A second worker cannot claim the leased item.
    let contended = store
        .claim("other-worker", 10, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(contended.is_empty());

    // A mismatched complete is rejected without mutating anything.
    let stale = store
        .complete_item(
            "other-worker",
            item.id,
            CompletionPlan::completed(item.input.clone()),
        )
        .await;
    assert!(matches!(stale, Err(StoreError::StaleClaim { .. })));

    store
        .complete_item(
            "it-worker",
            item.id,
            CompletionPlan::completed(item.input.clone())
                .with_successors(vec![StepEnqueue::immediate(
                    run.id,
                    "b",
                    item.input.fork(),
                )]),
        )
        .await
        .unwrap();

    let steps = store.list_steps(run.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].state, StepState::Completed);
    assert_eq!(steps[1].state, StepState::Pending);
    assert_eq!(store.queue_depth(run.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_reclaim_expired_lease() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let run = seeded_run(&store).await;
    let input = Envelope::new(run.workflow_id, run.id, json!({}));
    store
        .enqueue(StepEnqueue::immediate(run.id, "a", input))
        .await
        .unwrap();

    // Claim with an instantly-expiring lease from a never-registered worker.
    let claimed = store
        .claim("ghost-worker", 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let old_step_id = claimed[0].step_id;

    let reclaimed = store
        .reclaim_orphans(Duration::ZERO, &RetryPolicy::fixed(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempt, 2);

    let old_step = store.get_step(old_step_id).await.unwrap();
    assert_eq!(old_step.state, StepState::Failed);

    let fresh = store
        .claim("second-worker", 1, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].attempt, 2);
}

#[tokio::test]
async fn test_cancel_clears_queue() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let run = seeded_run(&store).await;
    let input = Envelope::new(run.workflow_id, run.id, json!({}));
    store
        .enqueue(StepEnqueue::immediate(run.id, "a", input))
        .await
        .unwrap();

    let cancelled = store
        .update_run_state(run.id, RunState::Cancelled, None)
        .await
        .unwrap();
    assert_eq!(cancelled.state, RunState::Cancelled);
    assert_eq!(store.queue_depth(run.id).await.unwrap(), 0);

    let steps = store.list_steps(run.id).await.unwrap();
    assert_eq!(steps[0].state, StepState::Skipped);

    // Terminal is terminal.
    let result = store
        .update_run_state(run.id, RunState::Running, None)
        .await;
    assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
}

#[tokio::test]
async fn test_join_deliveries() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let run = seeded_run(&store).await;
    let env = Envelope::new(run.workflow_id, run.id, json!({"branch": 1}));

    let first = store
        .deliver_join(run.id, "merge", "e1", &env, 2)
        .await
        .unwrap();
    assert!(first.is_none());

    let second = store
        .deliver_join(run.id, "merge", "e2", &env, 2)
        .await
        .unwrap();
    let deliveries = second.unwrap();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].edge_id, "e1");
}

#[tokio::test]
async fn test_settle_detection() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let run = seeded_run(&store).await;
    let input = Envelope::new(run.workflow_id, run.id, json!({}));
    store
        .enqueue(StepEnqueue::immediate(run.id, "a", input))
        .await
        .unwrap();

    let settled = store.find_settled_runs().await.unwrap();
    assert!(!settled.iter().any(|s| s.run_id == run.id));

    let claimed = store
        .claim("settle-worker", 1, Duration::from_secs(60))
        .await
        .unwrap();
    store
        .complete_item(
            "settle-worker",
            claimed[0].id,
            CompletionPlan::completed(claimed[0].input.clone()),
        )
        .await
        .unwrap();

    let settled = store.find_settled_runs().await.unwrap();
    assert!(settled.iter().any(|s| s.run_id == run.id));
}
