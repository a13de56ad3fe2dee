// MEL Agent API server
// Runs the REST surface plus an embedded worker pool, so a single process
// executes workflows out of the box. Additional worker processes can join
// through the /v1/workers endpoints at any time.

mod common;
mod runs;
mod workers;
mod workflows;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use mel_engine::coordinator::RunCoordinator;
use mel_engine::executor::StepExecutor;
use mel_engine::persistence::{run_migrations, PostgresWorkflowStore};
use mel_engine::worker::{WorkerPool, WorkerPoolConfig};
use mel_engine::{EngineConfig, WorkflowStore};
use mel_nodes::builtin_registry;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::list_workflows,
        workflows::create_workflow,
        workflows::get_workflow,
        workflows::deploy_version,
        workflows::execute_workflow,
        workflows::list_node_types,
        runs::list_runs,
        runs::get_run,
        runs::list_steps,
        runs::pause_run,
        runs::resume_run,
        runs::cancel_run,
        runs::retry_step,
        workers::list_workers,
        workers::register_worker,
        workers::unregister_worker,
        workers::heartbeat,
        workers::claim_work,
        workers::complete_work,
    ),
    components(
        schemas(
            common::WorkflowDto,
            common::VersionDto,
            common::RunDto,
            common::StepDto,
            common::WorkerDto,
            workflows::CreateWorkflowRequest,
            workflows::DeployVersionRequest,
            workflows::ExecuteWorkflowRequest,
            runs::ListRunsParams,
            workers::RegisterWorkerRequest,
            workers::ClaimWorkRequest,
            workers::ClaimedItemDto,
            workers::CompleteWorkRequest,
            workers::CompleteWorkError,
            workers::CompleteWorkResponse,
        )
    ),
    tags(
        (name = "workflows", description = "Workflow and version management"),
        (name = "runs", description = "Run lifecycle and step history"),
        (name = "workers", description = "Worker registration and the claim/complete protocol")
    ),
    info(
        title = "MEL Agent API",
        version = "0.1.0",
        description = "Durable workflow execution engine",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mel_api=debug,mel_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("mel-agent api starting...");

    let config = EngineConfig::from_env().context("Invalid engine configuration")?;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_open_conns)
        .min_connections(config.db_max_idle_conns.min(config.db_max_open_conns))
        .max_lifetime(config.db_conn_max_lifetime)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Migrations failed")?;
    tracing::info!("Connected to database, migrations applied");

    let store: Arc<dyn WorkflowStore> = Arc::new(PostgresWorkflowStore::new(pool));
    let registry = Arc::new(builtin_registry());
    tracing::info!(node_types = registry.len(), "Node registry built");

    let executor = Arc::new(StepExecutor::new(
        store.clone(),
        registry.clone(),
        config.clone(),
    ));
    registry
        .initialize_all(executor.platform())
        .await
        .map_err(|e| anyhow::anyhow!("node initialization failed: {e}"))?;

    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        registry.clone(),
        config.clone(),
    ));

    // Embedded workers: the API process participates in the pool unless
    // EMBEDDED_WORKERS=0.
    let embedded_workers: usize = std::env::var("EMBEDDED_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let mut pools = Vec::with_capacity(embedded_workers);
    for n in 0..embedded_workers {
        let pool_config = WorkerPoolConfig::from_engine(&config)
            .with_worker_id(format!("embedded-{n}-{}", uuid::Uuid::now_v7()));
        let worker_pool = Arc::new(WorkerPool::new(
            store.clone(),
            coordinator.clone(),
            executor.clone(),
            pool_config,
        ));
        worker_pool
            .start()
            .await
            .context("Failed to start embedded worker pool")?;
        tracing::info!(worker_id = worker_pool.worker_id(), "Embedded worker started");
        pools.push(worker_pool);
    }

    let workflows_state = workflows::AppState {
        store: store.clone(),
        coordinator: coordinator.clone(),
        registry: registry.clone(),
    };
    let runs_state = runs::AppState {
        store: store.clone(),
        coordinator: coordinator.clone(),
    };
    let workers_state = workers::AppState {
        store: store.clone(),
        executor: executor.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .merge(workflows::routes(workflows_state))
        .merge(runs::routes(runs_state))
        .merge(workers::routes(workers_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    for worker_pool in pools {
        if let Err(e) = worker_pool.shutdown().await {
            tracing::warn!("worker pool shutdown: {}", e);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
