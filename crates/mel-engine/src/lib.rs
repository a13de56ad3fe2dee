//! # MEL Workflow Execution Engine
//!
//! A PostgreSQL-backed engine for running directed workflow graphs ("agents")
//! across a pool of stateless workers with at-least-once delivery.
//!
//! ## Features
//!
//! - **Frozen version snapshots**: a run executes against an immutable graph
//! - **Lease-based step queue**: `SELECT ... FOR UPDATE SKIP LOCKED` claiming
//! - **Automatic retries**: exponential backoff with full jitter
//! - **Orphan recovery**: expired leases and dead workers are swept back in
//! - **Causal traces**: every envelope carries the chain that produced it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RunCoordinator                          │
//! │  (start / pause / resume / cancel runs, settle reaper)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (PostgreSQL: workflows, versions, runs, steps, queue)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (claims queue items, runs StepExecutor, heartbeats)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use mel_engine::prelude::*;
//!
//! let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
//! let registry = Arc::new(my_registry());
//! let platform = Arc::new(Platform::new(store.clone(), EngineConfig::default()));
//! let coordinator = RunCoordinator::new(store.clone(), registry.clone());
//!
//! let workflow_id = coordinator.create_workflow("demo").await?;
//! let version = coordinator.deploy_version(workflow_id, graph, "1.0.0").await?;
//! let run_id = coordinator.start_run(version.id, json!({"n": 2}), None).await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod executor;
pub mod graph;
pub mod node;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::coordinator::{CoordinatorError, RunCoordinator};
    pub use crate::envelope::{DataType, Envelope, ExecutionError, Trace};
    pub use crate::executor::{ExecutorError, StepExecutor, StepResult};
    pub use crate::graph::{Edge, Graph, GraphError, Node, Workflow, WorkflowVersion};
    pub use crate::node::{
        ExecutionContext, InputPolicy, MergeMode, NodeDefinition, NodeError, NodeOutput,
        NodeRegistry, NodeType, ParameterDef, ParameterKind, Platform, RegistryError, Routing,
    };
    pub use crate::persistence::{
        ClaimedItem, InMemoryWorkflowStore, PostgresWorkflowStore, RunFilter, RunState,
        StepEnqueue, StepState, StoreError, WorkflowStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use coordinator::{CoordinatorError, RunCoordinator};
pub use envelope::{DataType, Envelope, ExecutionError, Trace};
pub use executor::{ExecutorError, StepExecutor, StepResult};
pub use graph::{Edge, Graph, GraphError, Node, Workflow, WorkflowVersion};
pub use node::{
    ExecutionContext, InputPolicy, MergeMode, NodeDefinition, NodeError, NodeOutput, NodeRegistry,
    NodeType, Platform, RegistryError, Routing,
};
pub use persistence::{
    ClaimedItem, InMemoryWorkflowStore, PostgresWorkflowStore, RunState, StepState, StoreError,
    WorkflowStore,
};
pub use reliability::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
