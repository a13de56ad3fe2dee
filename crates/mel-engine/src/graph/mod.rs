//! Graph model and versioning
//!
//! A workflow's draft is a mutable working copy of its graph. Deploying the
//! draft freezes it into an immutable [`WorkflowVersion`] with a monotonically
//! increasing version number; runs always execute against a frozen snapshot.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::NodeRegistry;

/// Default output handle fired by non-branching nodes
pub const DEFAULT_OUTPUT_HANDLE: &str = "out";

/// Default input handle
pub const DEFAULT_INPUT_HANDLE: &str = "in";

/// Errors from deploy-time graph validation
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("duplicate edge id: {0}")]
    DuplicateEdge(String),

    #[error("edge {edge} references unknown source node {node}")]
    UnknownEdgeSource { edge: String, node: String },

    #[error("edge {edge} references unknown target node {node}")]
    UnknownEdgeTarget { edge: String, node: String },

    #[error("node {node} has unknown type: {node_type}")]
    UnknownNodeType { node: String, node_type: String },

    #[error("edge {edge} fires undeclared handle {handle} on node {node}")]
    UndeclaredHandle {
        edge: String,
        node: String,
        handle: String,
    },
}

/// Canvas position, kept for the builder UI
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node in a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique within a version
    pub id: String,

    /// Node type tag, resolved in the registry
    #[serde(rename = "type")]
    pub node_type: String,

    /// Parameter name -> value, per the node type's schema
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub position: Position,
}

/// A directed connection between two node handles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_node_id: String,
    #[serde(default = "default_source_handle")]
    pub source_handle: String,
    pub target_node_id: String,
    #[serde(default = "default_target_handle")]
    pub target_handle: String,
}

fn default_source_handle() -> String {
    DEFAULT_OUTPUT_HANDLE.to_string()
}

fn default_target_handle() -> String {
    DEFAULT_INPUT_HANDLE.to_string()
}

/// A directed workflow graph
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outbound edges of a node, all handles.
    pub fn outbound(&self, node_id: &str) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.source_node_id == node_id)
            .collect()
    }

    /// Outbound edges firing a specific handle.
    pub fn outbound_on(&self, node_id: &str, handle: &str) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.source_node_id == node_id && e.source_handle == handle)
            .collect()
    }

    /// Inbound edges of a node.
    pub fn inbound(&self, node_id: &str) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.target_node_id == node_id)
            .collect()
    }

    /// Nodes whose type is flagged as an entry point.
    pub fn entry_points(&self, registry: &NodeRegistry) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| {
                registry
                    .get(&n.node_type)
                    .map(|t| t.definition().entry_point)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Deploy-time validation.
    ///
    /// Checks that node and edge ids are unique, edge endpoints exist, every
    /// node type resolves in the registry, and every fired source handle is
    /// declared by the node's type. Cycles are allowed; the executor guards
    /// against runaway loops with the per-run step ceiling.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<(), GraphError> {
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            if !registry.contains(&node.node_type) {
                return Err(GraphError::UnknownNodeType {
                    node: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(GraphError::DuplicateEdge(edge.id.clone()));
            }
            let source = self.node(&edge.source_node_id).ok_or_else(|| {
                GraphError::UnknownEdgeSource {
                    edge: edge.id.clone(),
                    node: edge.source_node_id.clone(),
                }
            })?;
            if self.node(&edge.target_node_id).is_none() {
                return Err(GraphError::UnknownEdgeTarget {
                    edge: edge.id.clone(),
                    node: edge.target_node_id.clone(),
                });
            }

            // Node type is known at this point; check the fired handle against
            // the type's declared outputs. Branching types that declare no
            // fixed handles (e.g. switch cases) accept any name.
            if let Some(node_type) = registry.get(&source.node_type) {
                let def = node_type.definition();
                let declared = def.output_handles;
                let allowed = if !declared.is_empty() {
                    declared.iter().any(|h| h == &edge.source_handle)
                } else if def.branching {
                    true
                } else {
                    edge.source_handle == DEFAULT_OUTPUT_HANDLE
                };
                if !allowed {
                    return Err(GraphError::UndeclaredHandle {
                        edge: edge.id.clone(),
                        node: source.id.clone(),
                        handle: edge.source_handle.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// A workflow: identity, name, and the mutable draft graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub draft: Graph,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable, deployed snapshot of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Monotonically increasing per workflow
    pub version: i32,
    pub semver: String,
    pub graph: Graph,
    pub created_at: DateTime<Utc>,
}
