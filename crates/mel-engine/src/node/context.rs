//! Step execution context

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use super::Platform;
use crate::persistence::WorkflowStore;

/// Context provided to node code during step execution
///
/// Carries run identity, the run-scoped variables of the input envelope, the
/// platform handle, and a cancellation flag the worker pool flips when the
/// run leaves the `running` state.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ExecutionContext, node: &Node, env: Envelope)
///     -> Result<NodeOutput, NodeError>
/// {
///     tokio::select! {
///         result = do_work(&env) => result,
///         _ = ctx.cancelled() => Err(NodeError::Cancelled),
///     }
/// }
/// ```
pub struct ExecutionContext {
    /// Workflow id; "agent" and "workflow" are synonyms
    pub agent_id: Uuid,

    /// Run being executed
    pub run_id: Uuid,

    /// Step row for this execution
    pub step_id: Uuid,

    /// Current attempt (1-based)
    pub attempt: u32,

    /// Retry ceiling for this step
    pub max_attempts: u32,

    /// Run variables visible to the node
    pub variables: BTreeMap<String, serde_json::Value>,

    platform: Arc<Platform>,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn new(
        agent_id: Uuid,
        run_id: Uuid,
        step_id: Uuid,
        attempt: u32,
        max_attempts: u32,
        variables: BTreeMap<String, serde_json::Value>,
        platform: Arc<Platform>,
    ) -> Self {
        Self {
            agent_id,
            run_id,
            step_id,
            attempt,
            max_attempts,
            variables,
            platform,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Shortcut to the store handle.
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        self.platform.store()
    }

    /// Handle the worker pool uses to propagate run cancellation.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves when cancellation is requested; for `select!` patterns.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// Whether this is the final retry attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("agent_id", &self.agent_id)
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Handle to cancel an in-flight step execution
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}
