//! Causal trace chain
//!
//! A trace records (agent, run, node, step, attempt) for one execution and
//! links to the trace of the step that fed it. Walking the parent chain
//! reconstructs the causal path back to the run's entry input.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One link in the causal chain of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Workflow id ("agent" and "workflow" are synonyms)
    pub agent_id: Uuid,

    /// Run this trace belongs to
    pub run_id: Uuid,

    /// Node that produced the envelope; empty for the run's root trace
    pub node_id: String,

    /// Step row that produced the envelope; nil until the step executes
    pub step: Uuid,

    /// Execution attempt (1-based)
    pub attempt: u32,

    /// Element index when the envelope came out of a fan-out node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<u64>,

    /// Trace of the step that fed this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Trace>>,
}

impl Trace {
    /// Root trace for a run's entry input.
    pub fn root(agent_id: Uuid, run_id: Uuid) -> Self {
        Self {
            agent_id,
            run_id,
            node_id: String::new(),
            step: Uuid::nil(),
            attempt: 0,
            loop_index: None,
            parent: None,
        }
    }

    /// Child trace chained to this one.
    ///
    /// Step and attempt are filled in by the executor once the step row is
    /// known; see [`Trace::with_step`] and [`Trace::with_attempt`].
    pub fn next(&self, node_id: impl Into<String>) -> Self {
        Self {
            agent_id: self.agent_id,
            run_id: self.run_id,
            node_id: node_id.into(),
            step: Uuid::nil(),
            attempt: 1,
            loop_index: None,
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn with_step(mut self, step: Uuid) -> Self {
        self.step = step;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_loop_index(mut self, index: u64) -> Self {
        self.loop_index = Some(index);
        self
    }

    /// Node ids along the causal path, root first. The empty root link is
    /// omitted.
    pub fn path(&self) -> Vec<&str> {
        let mut nodes = Vec::new();
        let mut current = Some(self);
        while let Some(trace) = current {
            if !trace.node_id.is_empty() {
                nodes.push(trace.node_id.as_str());
            }
            current = trace.parent.as_deref();
        }
        nodes.reverse();
        nodes
    }

    /// Number of links in the chain, the root included.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut current = self.parent.as_deref();
        while let Some(trace) = current {
            depth += 1;
            current = trace.parent.as_deref();
        }
        depth
    }
}
