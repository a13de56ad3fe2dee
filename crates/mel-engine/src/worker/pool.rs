//! Worker pool
//!
//! One pool per worker process: registers the worker, then runs four loops
//! against the store until shutdown:
//!
//! - **poll**: claim ready items and execute them on a bounded task set
//! - **heartbeat**: keep the worker alive and propagate run cancellation to
//!   in-flight executions
//! - **reclaim**: sweep orphaned leases back into the queue
//! - **reaper**: settle drained runs to their terminal state

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, StepPoller};
use crate::config::EngineConfig;
use crate::coordinator::RunCoordinator;
use crate::executor::StepExecutor;
use crate::node::CancellationHandle;
use crate::persistence::{StoreError, WorkerInfo, WorkflowStore};
use crate::reliability::RetryPolicy;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Unique worker id (a fresh UUID-based one if not provided)
    pub worker_id: String,

    /// Hostname reported to the worker registry
    pub hostname: String,

    /// Max items claimed per poll; also the in-flight execution bound
    pub claim_batch_size: usize,

    /// Queue item lease
    pub lease_duration: Duration,

    /// Worker heartbeat interval
    pub heartbeat_interval: Duration,

    /// Orphan sweep interval
    pub reclaim_interval: Duration,

    /// Settle reaper interval
    pub reaper_interval: Duration,

    /// Dead-worker threshold used by the orphan sweep
    pub worker_timeout: Duration,

    pub poller: PollerConfig,

    /// Graceful shutdown drain timeout
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            claim_batch_size: 10,
            lease_duration: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(2),
            worker_timeout: Duration::from_secs(60),
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Derive the pool configuration from the engine configuration.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            claim_batch_size: config.claim_batch_size,
            lease_duration: config.lease_duration,
            worker_timeout: config.worker_timeout,
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = size.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    /// Completing current steps, not claiming new ones
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// A stateless worker: claim, execute, complete, heartbeat
///
/// # Example
///
/// ```ignore
/// let config = WorkerPoolConfig::from_engine(&engine_config)
///     .with_worker_id("worker-a");
/// let pool = WorkerPool::new(store, coordinator, executor, config);
///
/// pool.start().await?;
/// // ...
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn WorkflowStore>,
    coordinator: Arc<RunCoordinator>,
    executor: Arc<StepExecutor>,
    config: WorkerPoolConfig,
    reclaim_backoff: RetryPolicy,
    in_flight: Arc<DashMap<Uuid, (Uuid, CancellationHandle)>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: std::sync::RwLock<WorkerPoolStatus>,
    active: Arc<Semaphore>,
    loop_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        coordinator: Arc<RunCoordinator>,
        executor: Arc<StepExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            coordinator,
            executor,
            active: Arc::new(Semaphore::new(config.claim_batch_size)),
            config,
            reclaim_backoff: RetryPolicy::exponential(),
            in_flight: Arc::new(DashMap::new()),
            shutdown_tx,
            shutdown_rx,
            status: std::sync::RwLock::new(WorkerPoolStatus::Stopped),
            loop_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }

    /// Steps currently executing on this worker.
    pub fn current_load(&self) -> usize {
        self.config.claim_batch_size - self.active.available_permits()
    }

    /// Register the worker and start the background loops.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
        }
        *self.status.write().unwrap() = WorkerPoolStatus::Starting;

        info!(
            worker_id = %self.config.worker_id,
            hostname = %self.config.hostname,
            claim_batch_size = self.config.claim_batch_size,
            "starting worker pool"
        );

        let now = Utc::now();
        self.store
            .register_worker(&WorkerInfo {
                id: self.config.worker_id.clone(),
                hostname: self.config.hostname.clone(),
                started_at: now,
                last_heartbeat_at: now,
            })
            .await?;

        *self.status.write().unwrap() = WorkerPoolStatus::Running;

        let mut handles = self.loop_handles.lock().unwrap();
        handles.push(self.spawn_poll_loop());
        handles.push(self.spawn_heartbeat_loop());
        handles.push(self.spawn_reclaim_loop());
        handles.push(self.spawn_reaper_loop());

        Ok(())
    }

    /// Drain in-flight steps and unregister.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write().unwrap() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active.available_permits();
            if available == self.config.claim_batch_size {
                debug!("all in-flight steps completed");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.config.claim_batch_size - available,
                    "shutdown drain timed out"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.store
            .unregister_worker(&self.config.worker_id)
            .await?;
        *self.status.write().unwrap() = WorkerPoolStatus::Stopped;

        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let in_flight = Arc::clone(&self.in_flight);
        let active = Arc::clone(&self.active);
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut poller = StepPoller::new(
                store,
                config.worker_id.clone(),
                config.lease_duration,
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let available = active.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available.min(config.claim_batch_size)).await {
                    Ok(items) => {
                        for item in items {
                            let permit = match active.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    debug!("no execution permits available");
                                    break;
                                }
                            };

                            let ctx = executor.context_for(&item);
                            in_flight
                                .insert(item.step_id, (item.run_id, ctx.cancellation_handle()));

                            let executor = Arc::clone(&executor);
                            let in_flight = Arc::clone(&in_flight);
                            let worker_id = config.worker_id.clone();

                            tokio::spawn(async move {
                                let step_id = item.step_id;
                                if let Err(e) =
                                    executor.execute_claimed(&worker_id, item, &ctx).await
                                {
                                    error!(%step_id, "step execution error: {}", e);
                                }
                                in_flight.remove(&step_id);
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        })
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat_worker(&worker_id).await {
                            error!("heartbeat failed: {}", e);
                        }

                        // Propagate run cancellation to in-flight executions.
                        let runs: HashSet<Uuid> =
                            in_flight.iter().map(|entry| entry.value().0).collect();
                        for run_id in runs {
                            match store.get_run(run_id).await {
                                Ok(run) if run.state.is_terminal() => {
                                    for entry in in_flight.iter() {
                                        if entry.value().0 == run_id {
                                            entry.value().1.cancel();
                                        }
                                    }
                                    debug!(%run_id, "cancelled in-flight steps of terminal run");
                                }
                                Ok(_) => {}
                                Err(e) => warn!(%run_id, "run state check failed: {}", e),
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("heartbeat loop exited");
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.reclaim_interval;
        let worker_timeout = self.config.worker_timeout;
        let backoff = self.reclaim_backoff.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_orphans(worker_timeout, &backoff).await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "reclaimed orphaned queue items");
                            }
                            Ok(_) => {}
                            Err(e) => error!("orphan reclaim failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("reclaim loop exited");
        })
    }

    fn spawn_reaper_loop(&self) -> JoinHandle<()> {
        let coordinator = Arc::clone(&self.coordinator);
        let interval = self.config.reaper_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match coordinator.settle_runs().await {
                            Ok(settled) if settled > 0 => {
                                debug!(count = settled, "settled runs");
                            }
                            Ok(_) => {}
                            Err(e) => error!("settle reaper failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reaper loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("reaper loop exited");
        })
    }
}
