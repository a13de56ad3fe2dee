//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence with:
//! - Efficient queue claiming via SELECT ... FOR UPDATE SKIP LOCKED
//! - Atomic complete + successor enqueue in one transaction
//! - Orphan reclaim for expired leases and dead workers

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::envelope::Envelope;
use crate::graph::{Graph, Workflow, WorkflowVersion};
use crate::reliability::RetryPolicy;

/// PostgreSQL implementation of [`WorkflowStore`]
///
/// # Example
///
/// ```ignore
/// use mel_engine::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mel").await?;
/// mel_engine::persistence::run_migrations(&pool).await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Apply the versioned SQL migrations in lexicographic order. sqlx keeps the
/// idempotent bookkeeping table, so re-running is safe.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_run_state(s: &str) -> Result<RunState, StoreError> {
    s.parse().map_err(StoreError::Database)
}

fn parse_step_state(s: &str) -> Result<StepState, StoreError> {
    s.parse().map_err(StoreError::Database)
}

fn map_workflow(row: &PgRow) -> Result<Workflow, StoreError> {
    Ok(Workflow {
        id: row.get("id"),
        name: row.get("name"),
        draft: from_json(row.get("draft"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_version(row: &PgRow) -> Result<WorkflowVersion, StoreError> {
    Ok(WorkflowVersion {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        semver: row.get("semver"),
        graph: from_json(row.get("graph"))?,
        created_at: row.get("created_at"),
    })
}

fn map_run(row: &PgRow) -> Result<WorkflowRun, StoreError> {
    let state: String = row.get("state");
    let policy: String = row.get("failure_policy");
    Ok(WorkflowRun {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version_id: row.get("version_id"),
        state: parse_run_state(&state)?,
        input: from_json(row.get("input"))?,
        failure_policy: policy.parse().map_err(StoreError::Database)?,
        max_steps: row.get("max_steps"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

fn map_step(row: &PgRow) -> Result<WorkflowStep, StoreError> {
    let state: String = row.get("state");
    let output: Option<serde_json::Value> = row.get("output");
    Ok(WorkflowStep {
        id: row.get("id"),
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        attempt: row.get::<i32, _>("attempt") as u32,
        state: parse_step_state(&state)?,
        input: from_json(row.get("input"))?,
        output: output.map(from_json).transpose()?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

const RUN_COLUMNS: &str = "id, workflow_id, version_id, state, input, failure_policy, max_steps, \
                           error, created_at, started_at, ended_at";

const STEP_COLUMNS: &str =
    "id, run_id, node_id, attempt, state, input, output, error, created_at, started_at, ended_at";

/// Insert a pending step row plus its queue item inside a transaction.
async fn insert_enqueue(
    tx: &mut Transaction<'_, Postgres>,
    enqueue: &StepEnqueue,
) -> Result<Uuid, StoreError> {
    let step_id = Uuid::now_v7();
    let item_id = Uuid::now_v7();
    let input = to_json(&enqueue.input)?;

    sqlx::query(
        r#"
        INSERT INTO workflow_steps (id, run_id, node_id, attempt, state, input)
        VALUES ($1, $2, $3, $4, 'pending', $5)
        "#,
    )
    .bind(step_id)
    .bind(enqueue.run_id)
    .bind(&enqueue.node_id)
    .bind(enqueue.attempt as i32)
    .bind(&input)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        INSERT INTO queue_items (id, run_id, step_id, node_id, attempt, ready_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(item_id)
    .bind(enqueue.run_id)
    .bind(step_id)
    .bind(&enqueue.node_id)
    .bind(enqueue.attempt as i32)
    .bind(enqueue.ready_at)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(item_id)
}

/// Apply a validated run transition inside a transaction. Entering a terminal
/// state drops the run's unclaimed queue items, skips their pending steps and
/// clears outstanding join state.
async fn apply_run_transition(
    tx: &mut Transaction<'_, Postgres>,
    run_id: Uuid,
    to: RunState,
    error: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE workflow_runs
        SET state = $2,
            error = COALESCE($3, error),
            started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW())
                              ELSE started_at END,
            ended_at = CASE WHEN $4 THEN NOW() ELSE ended_at END
        WHERE id = $1
        "#,
    )
    .bind(run_id)
    .bind(to.to_string())
    .bind(error)
    .bind(to.is_terminal())
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    if to.is_terminal() {
        sqlx::query(
            r#"
            UPDATE workflow_steps s
            SET state = 'skipped', ended_at = NOW()
            FROM queue_items q
            WHERE q.run_id = $1
              AND q.step_id = s.id
              AND s.state = 'pending'
              AND (q.claimed_by IS NULL OR q.claim_expires_at <= NOW())
            "#,
        )
        .bind(run_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            DELETE FROM queue_items
            WHERE run_id = $1
              AND (claimed_by IS NULL OR claim_expires_at <= NOW())
            "#,
        )
        .bind(run_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM step_joins WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
    }

    Ok(())
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self))]
    async fn create_workflow(&self, name: &str) -> Result<Workflow, StoreError> {
        let id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            INSERT INTO workflows (id, name)
            VALUES ($1, $2)
            RETURNING id, name, draft, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            db_err(e)
        })?;

        debug!(workflow_id = %id, name, "created workflow");
        map_workflow(&row)
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, draft, created_at, updated_at FROM workflows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::WorkflowNotFound(id))?;

        map_workflow(&row)
    }

    #[instrument(skip(self))]
    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, draft, created_at, updated_at FROM workflows ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_workflow).collect()
    }

    #[instrument(skip(self, draft))]
    async fn update_draft(&self, id: Uuid, draft: Graph) -> Result<Workflow, StoreError> {
        let draft_json = to_json(&draft)?;
        let row = sqlx::query(
            r#"
            UPDATE workflows
            SET draft = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, draft, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&draft_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::WorkflowNotFound(id))?;

        map_workflow(&row)
    }

    #[instrument(skip(self, graph))]
    async fn deploy_version(
        &self,
        workflow_id: Uuid,
        graph: Graph,
        semver: &str,
    ) -> Result<WorkflowVersion, StoreError> {
        let id = Uuid::now_v7();
        let graph_json = to_json(&graph)?;

        // Next version number is computed under the workflow row lock so two
        // concurrent deploys cannot collide.
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let exists = sqlx::query("SELECT 1 AS one FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_versions (id, workflow_id, version, semver, graph)
            SELECT $1, $2,
                   COALESCE(MAX(version), 0) + 1,
                   $3, $4
            FROM workflow_versions
            WHERE workflow_id = $2
            RETURNING id, workflow_id, version, semver, graph, created_at
            "#,
        )
        .bind(id)
        .bind(workflow_id)
        .bind(semver)
        .bind(&graph_json)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to deploy version: {}", e);
            db_err(e)
        })?;

        tx.commit().await.map_err(db_err)?;

        let version = map_version(&row)?;
        debug!(%workflow_id, version = version.version, "deployed workflow version");
        Ok(version)
    }

    #[instrument(skip(self))]
    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, version, semver, graph, created_at
            FROM workflow_versions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::VersionNotFound(id))?;

        map_version(&row)
    }

    #[instrument(skip(self))]
    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, version, semver, graph, created_at
            FROM workflow_versions
            WHERE workflow_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_version).transpose()
    }

    #[instrument(skip(self, new_run))]
    async fn create_run(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError> {
        let id = new_run.id;
        let input = to_json(&new_run.input)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, version_id, state, input, failure_policy, max_steps)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            RETURNING {RUN_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(new_run.workflow_id)
        .bind(new_run.version_id)
        .bind(&input)
        .bind(new_run.failure_policy.to_string())
        .bind(new_run.max_steps)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create run: {}", e);
            db_err(e)
        })?;

        debug!(run_id = %id, workflow_id = %new_run.workflow_id, "created run");
        map_run(&row)
    }

    #[instrument(skip(self))]
    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::RunNotFound(id))?;

        map_run(&row)
    }

    #[instrument(skip(self))]
    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM workflow_runs
            WHERE ($1::uuid IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR state = $2)
            ORDER BY created_at DESC
            OFFSET $3
            LIMIT $4
            "#,
        ))
        .bind(filter.workflow_id)
        .bind(filter.state.map(|s| s.to_string()))
        .bind(filter.offset)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_run).collect()
    }

    #[instrument(skip(self))]
    async fn update_run_state(
        &self,
        run_id: Uuid,
        state: RunState,
        error: Option<String>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT state FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;

        let current = parse_run_state(&row.get::<String, _>("state"))?;
        if !current.can_transition(state) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: state,
            });
        }

        if current != state {
            apply_run_transition(&mut tx, run_id, state, error.as_deref()).await?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, from = %current, to = %state, "updated run state");
        self.get_run(run_id).await
    }

    #[instrument(skip(self))]
    async fn count_steps(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM workflow_steps WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.get("n"))
    }

    #[instrument(skip(self))]
    async fn get_step(&self, id: Uuid) -> Result<WorkflowStep, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::StepNotFound(id))?;

        map_step(&row)
    }

    #[instrument(skip(self))]
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM workflow_steps
            WHERE run_id = $1
            ORDER BY created_at, id
            "#,
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_step).collect()
    }

    #[instrument(skip(self))]
    async fn mark_step_running(&self, step_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET state = 'running', started_at = COALESCE(started_at, NOW())
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(step_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Already running (lease takeover) or already terminal; both are
            // fine for an at-least-once executor.
            debug!(%step_id, "mark_step_running: no pending step row");
        }
        Ok(())
    }

    #[instrument(skip(self, enqueue), fields(run_id = %enqueue.run_id, node_id = %enqueue.node_id))]
    async fn enqueue(&self, enqueue: StepEnqueue) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let item_id = insert_enqueue(&mut tx, &enqueue).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(%item_id, "enqueued step");
        Ok(item_id)
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        worker_id: &str,
        max_items: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedItem>, StoreError> {
        if max_items == 0 {
            return Ok(vec![]);
        }

        let expires = Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default();

        // FIFO over (ready_at, id) with SKIP LOCKED so contending workers
        // never block each other. Runs outside `running` are not claimable.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT qi.id
                FROM queue_items qi
                JOIN workflow_runs r ON r.id = qi.run_id
                WHERE r.state = 'running'
                  AND qi.ready_at <= NOW()
                  AND (qi.claimed_by IS NULL OR qi.claim_expires_at <= NOW())
                ORDER BY qi.ready_at, qi.id
                LIMIT $2
                FOR UPDATE OF qi SKIP LOCKED
            )
            UPDATE queue_items q
            SET claimed_by = $1, claim_expires_at = $3
            FROM claimable c, workflow_steps s
            WHERE q.id = c.id AND s.id = q.step_id
            RETURNING q.id, q.run_id, q.step_id, q.node_id, q.attempt,
                      q.claim_expires_at, s.input
            "#,
        )
        .bind(worker_id)
        .bind(max_items as i64)
        .bind(expires)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim queue items: {}", e);
            db_err(e)
        })?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            claimed.push(ClaimedItem {
                id: row.get("id"),
                run_id: row.get("run_id"),
                step_id: row.get("step_id"),
                node_id: row.get("node_id"),
                attempt: row.get::<i32, _>("attempt") as u32,
                input: from_json(row.get("input"))?,
                lease_expires_at: row.get("claim_expires_at"),
            });
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed queue items");
        }

        Ok(claimed)
    }

    #[instrument(skip(self, plan))]
    async fn complete_item(
        &self,
        worker_id: &str,
        item_id: Uuid,
        plan: CompletionPlan,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT run_id, step_id, claimed_by, claim_expires_at
            FROM queue_items
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            // Already completed or reclaimed by someone else.
            return Err(StoreError::StaleClaim {
                item: item_id,
                holder: None,
            });
        };

        let run_id: Uuid = row.get("run_id");
        let step_id: Uuid = row.get("step_id");
        let claimed_by: Option<String> = row.get("claimed_by");
        let expires: Option<DateTime<Utc>> = row.get("claim_expires_at");

        let lease_is_live = claimed_by.as_deref() == Some(worker_id)
            && expires.map(|t| t > Utc::now()).unwrap_or(false);
        if !lease_is_live {
            return Err(StoreError::StaleClaim {
                item: item_id,
                holder: claimed_by,
            });
        }

        let run_row = sqlx::query("SELECT state FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let run_state = parse_run_state(&run_row.get::<String, _>("state"))?;

        match &plan.outcome {
            StepOutcome::Completed { output } => {
                let output_json = to_json(output)?;
                sqlx::query(
                    r#"
                    UPDATE workflow_steps
                    SET state = 'completed', output = $2, ended_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(step_id)
                .bind(&output_json)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            StepOutcome::Failed { error, output } => {
                let output_json = output.as_ref().map(to_json).transpose()?;
                sqlx::query(
                    r#"
                    UPDATE workflow_steps
                    SET state = 'failed', error = $2, output = $3, ended_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(step_id)
                .bind(error)
                .bind(&output_json)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        sqlx::query("DELETE FROM queue_items WHERE id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // A terminal run accepts the in-flight result but produces nothing
        // further.
        if !run_state.is_terminal() {
            for successor in &plan.successors {
                insert_enqueue(&mut tx, successor).await?;
            }

            if let Some(error) = &plan.record_run_error {
                sqlx::query(
                    "UPDATE workflow_runs SET error = COALESCE(error, $2) WHERE id = $1",
                )
                .bind(run_id)
                .bind(error)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }

            if let Some((target, error)) = &plan.run_transition {
                if run_state.can_transition(*target) && run_state != *target {
                    apply_run_transition(&mut tx, run_id, *target, error.as_deref()).await?;
                }
            }
        }

        tx.commit().await.map_err(db_err)?;

        debug!(%item_id, %step_id, worker_id, "completed queue item");
        Ok(())
    }

    #[instrument(skip(self, backoff))]
    async fn reclaim_orphans(
        &self,
        worker_timeout: Duration,
        backoff: &RetryPolicy,
    ) -> Result<Vec<ReclaimedItem>, StoreError> {
        let threshold =
            Utc::now() - chrono::Duration::from_std(worker_timeout).unwrap_or_default();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            SELECT qi.id, qi.run_id, qi.step_id, qi.node_id, qi.attempt,
                   r.state AS run_state
            FROM queue_items qi
            JOIN workflow_runs r ON r.id = qi.run_id
            LEFT JOIN workers w ON w.id = qi.claimed_by
            WHERE qi.claimed_by IS NOT NULL
              AND (qi.claim_expires_at < $1
                   OR w.id IS NULL
                   OR w.last_heartbeat_at < $1)
            FOR UPDATE OF qi SKIP LOCKED
            "#,
        )
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let item_id: Uuid = row.get("id");
            let run_id: Uuid = row.get("run_id");
            let old_step_id: Uuid = row.get("step_id");
            let node_id: String = row.get("node_id");
            let attempt = row.get::<i32, _>("attempt") as u32;
            let run_state = parse_run_state(&row.get::<String, _>("run_state"))?;

            if run_state.is_terminal() {
                // The run ended while this item was stranded; drop it.
                sqlx::query(
                    r#"
                    UPDATE workflow_steps
                    SET state = 'failed', error = 'run ended before execution', ended_at = NOW()
                    WHERE id = $1 AND state IN ('pending', 'running')
                    "#,
                )
                .bind(old_step_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                sqlx::query("DELETE FROM queue_items WHERE id = $1")
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                continue;
            }

            let next_attempt = attempt + 1;
            let new_step_id = Uuid::now_v7();
            let ready_at = Utc::now()
                + chrono::Duration::from_std(backoff.delay_for_attempt(next_attempt))
                    .unwrap_or_default();

            sqlx::query(
                r#"
                UPDATE workflow_steps
                SET state = 'failed', error = 'worker lease expired', ended_at = NOW()
                WHERE id = $1 AND state IN ('pending', 'running')
                "#,
            )
            .bind(old_step_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            sqlx::query(
                r#"
                INSERT INTO workflow_steps (id, run_id, node_id, attempt, state, input)
                SELECT $1, run_id, node_id, $2, 'pending', input
                FROM workflow_steps
                WHERE id = $3
                "#,
            )
            .bind(new_step_id)
            .bind(next_attempt as i32)
            .bind(old_step_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            sqlx::query(
                r#"
                UPDATE queue_items
                SET step_id = $2, attempt = $3, claimed_by = NULL,
                    claim_expires_at = NULL, ready_at = $4
                WHERE id = $1
                "#,
            )
            .bind(item_id)
            .bind(new_step_id)
            .bind(next_attempt as i32)
            .bind(ready_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            reclaimed.push(ReclaimedItem {
                item_id,
                step_id: new_step_id,
                run_id,
                node_id,
                attempt: next_attempt,
            });
        }

        tx.commit().await.map_err(db_err)?;

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed orphaned queue items");
        }

        Ok(reclaimed)
    }

    #[instrument(skip(self))]
    async fn get_claimed_item(&self, item_id: Uuid) -> Result<ClaimedItem, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT q.id, q.run_id, q.step_id, q.node_id, q.attempt,
                   q.claim_expires_at, s.input
            FROM queue_items q
            JOIN workflow_steps s ON s.id = q.step_id
            WHERE q.id = $1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ItemNotFound(item_id))?;

        let expires: Option<DateTime<Utc>> = row.get("claim_expires_at");
        Ok(ClaimedItem {
            id: row.get("id"),
            run_id: row.get("run_id"),
            step_id: row.get("step_id"),
            node_id: row.get("node_id"),
            attempt: row.get::<i32, _>("attempt") as u32,
            input: from_json(row.get("input"))?,
            lease_expires_at: expires.unwrap_or_else(Utc::now),
        })
    }

    #[instrument(skip(self))]
    async fn queue_depth(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_items WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.get("n"))
    }

    #[instrument(skip(self, envelope))]
    async fn deliver_join(
        &self,
        run_id: Uuid,
        target_node_id: &str,
        edge_id: &str,
        envelope: &Envelope,
        required: usize,
    ) -> Result<Option<Vec<JoinDelivery>>, StoreError> {
        let envelope_json = to_json(envelope)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO step_joins (run_id, target_node_id, edge_id, envelope)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id, target_node_id, edge_id)
            DO UPDATE SET envelope = EXCLUDED.envelope, arrived_at = NOW()
            "#,
        )
        .bind(run_id)
        .bind(target_node_id)
        .bind(edge_id)
        .bind(&envelope_json)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            SELECT edge_id, envelope, arrived_at
            FROM step_joins
            WHERE run_id = $1 AND target_node_id = $2
            ORDER BY arrived_at, id
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .bind(target_node_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        if rows.len() < required {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        }

        sqlx::query("DELETE FROM step_joins WHERE run_id = $1 AND target_node_id = $2")
            .bind(run_id)
            .bind(target_node_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            deliveries.push(JoinDelivery {
                edge_id: row.get("edge_id"),
                envelope: from_json(row.get("envelope"))?,
                arrived_at: row.get("arrived_at"),
            });
        }

        debug!(%run_id, target_node_id, count = deliveries.len(), "join complete");
        Ok(Some(deliveries))
    }

    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, hostname, started_at, last_heartbeat_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.hostname)
        .bind(worker.started_at)
        .bind(worker.last_heartbeat_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to register worker: {}", e);
            db_err(e)
        })?;

        debug!(worker_id = %worker.id, "registered worker");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn heartbeat_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat_at = NOW() WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownWorker(worker_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE queue_items
            SET claimed_by = NULL, claim_expires_at = NULL
            WHERE claimed_by = $1
            "#,
        )
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let result = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownWorker(worker_id.to_string()));
        }

        debug!(worker_id, "unregistered worker");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, hostname, started_at, last_heartbeat_at FROM workers ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| WorkerInfo {
                id: row.get("id"),
                hostname: row.get("hostname"),
                started_at: row.get("started_at"),
                last_heartbeat_at: row.get("last_heartbeat_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn find_settled_runs(&self) -> Result<Vec<SettledRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.error
            FROM workflow_runs r
            WHERE r.state = 'running'
              AND NOT EXISTS (SELECT 1 FROM queue_items q WHERE q.run_id = r.id)
              AND NOT EXISTS (
                  SELECT 1 FROM workflow_steps s
                  WHERE s.run_id = r.id AND s.state IN ('pending', 'running')
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| SettledRun {
                run_id: row.get("id"),
                error: row.get("error"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    // Behavior is covered against the in-memory twin in `memory.rs`; the
    // Postgres backend is exercised by tests/postgres_integration_test.rs,
    // which requires TEST_DATABASE_URL.
}
