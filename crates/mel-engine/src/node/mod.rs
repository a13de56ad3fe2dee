//! Node types and the process-wide registry
//!
//! A node type declares its metadata and parameter schema via
//! [`NodeDefinition`] and implements [`NodeType::execute`], taking an input
//! [`Envelope`] and returning a [`NodeOutput`] that tells the executor where
//! successors fire.

mod context;
mod registry;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::envelope::Envelope;
use crate::graph::Node;
use crate::persistence::WorkflowStore;

pub use context::{CancellationHandle, ExecutionContext};
pub use registry::{NodeRegistry, RegistryError};

#[cfg(test)]
pub use registry::test_support;

/// Error returned by node code
///
/// The classification drives the executor's retry decision: only `Transient`
/// errors are retried, up to the configured attempt ceiling.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// Bad parameter or input shape. Not retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O failure, upstream timeout. Retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Node-declared fatal (e.g. auth rejected). Not retried.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Execution interrupted by run cancellation.
    #[error("execution cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Whether the executor may retry the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Parameter value kinds accepted by node schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Number,
    Integer,
    Boolean,
    Enum,
    Object,
    Json,
    Credential,
    NodeReference,
    /// Options come from the type's dynamic-options provider
    Dynamic,
}

/// One selectable option for enum/dynamic parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterOption {
    pub value: String,
    pub label: String,
}

impl ParameterOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Schema entry for one node parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub label: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<ParameterOption>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterDef {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            kind,
            required: false,
            default: None,
            group: None,
            visibility_condition: None,
            options: None,
            validators: Vec::new(),
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_options(mut self, options: Vec<ParameterOption>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// How a node's inbound envelopes are assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Any inbound delivery enqueues the node (first-wins for the input)
    #[default]
    Any,
    /// The node is enqueued only once every inbound edge has delivered;
    /// the input data becomes the array of deliveries in arrival order
    WaitAll,
}

/// Value-level combination applied by merge-style nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Flatten array inputs into one array
    #[default]
    Concat,
    /// Merge object inputs key-wise, first delivery wins on conflicts
    Union,
    /// Keep only the first delivery
    First,
}

impl FromStr for MergeMode {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concat" => Ok(Self::Concat),
            "union" => Ok(Self::Union),
            "first" => Ok(Self::First),
            other => Err(NodeError::validation(format!("unknown merge mode: {other}"))),
        }
    }
}

/// Metadata a node type declares about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// String key used for registry lookup and graph node tags
    pub node_type: String,
    pub label: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Runs may start from this node
    #[serde(default)]
    pub entry_point: bool,

    /// Output selects among named handles instead of firing all successors
    #[serde(default)]
    pub branching: bool,

    /// Declared output handles; empty means just the default `out`
    #[serde(default)]
    pub output_handles: Vec<String>,

    #[serde(default)]
    pub input_policy: InputPolicy,

    #[serde(default)]
    pub parameters: Vec<ParameterDef>,

    /// Per-type step timeout override, milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,
}

impl NodeDefinition {
    pub fn new(
        node_type: impl Into<String>,
        label: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            label: label.into(),
            category: category.into(),
            icon: None,
            entry_point: false,
            branching: false,
            output_handles: Vec::new(),
            input_policy: InputPolicy::Any,
            parameters: Vec::new(),
            step_timeout_ms: None,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn entry_point(mut self) -> Self {
        self.entry_point = true;
        self
    }

    /// Declare this type branching with the given output handles.
    pub fn branching(mut self, handles: Vec<&str>) -> Self {
        self.branching = true;
        self.output_handles = handles.into_iter().map(String::from).collect();
        self
    }

    pub fn wait_all(mut self) -> Self {
        self.input_policy = InputPolicy::WaitAll;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterDef>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_step_timeout_ms(mut self, ms: u64) -> Self {
        self.step_timeout_ms = Some(ms);
        self
    }
}

/// Where the successors of a completed step fire
#[derive(Debug, Clone)]
pub enum Routing {
    /// Fire all edges on the default `out` handle
    Default,
    /// Fire edges on the listed handles (branching nodes)
    Handles(Vec<String>),
    /// One successor per element on the `out` handle (fan-out nodes)
    FanOut(Vec<Envelope>),
    /// Fire nothing; the branch ends here
    Halt,
}

/// Result of a successful node execution
#[derive(Debug, Clone)]
pub struct NodeOutput {
    /// Envelope persisted on the step row
    pub output: Envelope,
    /// Successor routing
    pub routing: Routing,
}

impl NodeOutput {
    /// Output on the default handle.
    pub fn single(output: Envelope) -> Self {
        Self {
            output,
            routing: Routing::Default,
        }
    }

    /// Branching output on the named handles.
    pub fn routed(output: Envelope, handles: Vec<String>) -> Self {
        Self {
            output,
            routing: Routing::Handles(handles),
        }
    }

    /// One successor per element envelope.
    pub fn fan_out(output: Envelope, elements: Vec<Envelope>) -> Self {
        Self {
            output,
            routing: Routing::FanOut(elements),
        }
    }

    /// Terminal output; no successors fire.
    pub fn halt(output: Envelope) -> Self {
        Self {
            output,
            routing: Routing::Halt,
        }
    }
}

/// Handle to the engine's shared services, passed to nodes via the context
pub struct Platform {
    store: Arc<dyn WorkflowStore>,
    config: EngineConfig,
}

impl Platform {
    pub fn new(store: Arc<dyn WorkflowStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A node-type implementation
///
/// Implementations are registered once at process start and looked up by
/// string key. Unknown types at execution time fail the step, never panic.
#[async_trait]
pub trait NodeType: Send + Sync + 'static {
    /// Static metadata and parameter schema.
    fn definition(&self) -> NodeDefinition;

    /// Called once at process start.
    async fn initialize(&self, _platform: &Platform) -> Result<(), NodeError> {
        Ok(())
    }

    /// Execute one step.
    ///
    /// The envelope's trace is already chained to this node; implementations
    /// must not touch it. Long-running nodes should poll
    /// [`ExecutionContext::is_cancelled`] at I/O boundaries.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        node: &Node,
        envelope: Envelope,
    ) -> Result<NodeOutput, NodeError>;

    /// Options for a `Dynamic` parameter, given the values of the parameters
    /// it depends on. Consulted by the builder UI.
    async fn dynamic_options(
        &self,
        _ctx: &ExecutionContext,
        _parameter: &str,
        _deps: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Vec<ParameterOption>, NodeError> {
        Ok(Vec::new())
    }
}

// Typed parameter access with explicit coercion errors. Lives here rather
// than in the graph module because the error vocabulary belongs to node
// execution.
impl Node {
    /// Raw parameter value.
    pub fn param(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }

    /// Required string parameter.
    pub fn string_param(&self, name: &str) -> Result<String, NodeError> {
        match self.data.get(name) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(NodeError::validation(format!(
                "parameter {name} must be a string, got {other}"
            ))),
            None => Err(NodeError::validation(format!(
                "missing required parameter: {name}"
            ))),
        }
    }

    /// String parameter with a default when absent.
    pub fn string_param_or(&self, name: &str, default: &str) -> Result<String, NodeError> {
        match self.data.get(name) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(NodeError::validation(format!(
                "parameter {name} must be a string, got {other}"
            ))),
            None => Ok(default.to_string()),
        }
    }

    /// Integer parameter with a default when absent.
    pub fn i64_param_or(&self, name: &str, default: i64) -> Result<i64, NodeError> {
        match self.data.get(name) {
            Some(value) => value.as_i64().ok_or_else(|| {
                NodeError::validation(format!("parameter {name} must be an integer, got {value}"))
            }),
            None => Ok(default),
        }
    }

    /// Boolean parameter with a default when absent.
    pub fn bool_param_or(&self, name: &str, default: bool) -> Result<bool, NodeError> {
        match self.data.get(name) {
            Some(serde_json::Value::Bool(b)) => Ok(*b),
            Some(other) => Err(NodeError::validation(format!(
                "parameter {name} must be a boolean, got {other}"
            ))),
            None => Ok(default),
        }
    }
}
